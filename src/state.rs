use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::wire::RawChange;

pub type MatchId = i64;
pub type TeamId = i64;

pub const FALLBACK_TEAM_NAME: &str = "Unknown";
pub const PLACEHOLDER_LOGO: &str = "/placeholder-team.png";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MatchStatus {
    Scheduled,
    Live,
    HalfTime,
    Finished,
    Postponed,
    Cancelled,
    Unknown(String),
}

impl MatchStatus {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "NS" | "SCHEDULED" | "NOT_STARTED" | "TBD" => MatchStatus::Scheduled,
            "LIVE" | "INPLAY" | "IN_PLAY" | "1H" | "2H" => MatchStatus::Live,
            "HT" | "HALFTIME" | "HALF_TIME" => MatchStatus::HalfTime,
            "FT" | "FINISHED" | "ENDED" | "AET" | "PEN" => MatchStatus::Finished,
            "POSTPONED" | "PST" => MatchStatus::Postponed,
            "CANCELLED" | "CANCELED" | "CANC" => MatchStatus::Cancelled,
            _ => MatchStatus::Unknown(trimmed.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            MatchStatus::Scheduled => "NS",
            MatchStatus::Live => "LIVE",
            MatchStatus::HalfTime => "HT",
            MatchStatus::Finished => "FT",
            MatchStatus::Postponed => "POSTPONED",
            MatchStatus::Cancelled => "CANCELLED",
            MatchStatus::Unknown(raw) => raw.as_str(),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            MatchStatus::Scheduled => "Not Started",
            MatchStatus::Live => "Live",
            MatchStatus::HalfTime => "Half Time",
            MatchStatus::Finished => "Full Time",
            MatchStatus::Postponed => "Postponed",
            MatchStatus::Cancelled => "Cancelled",
            MatchStatus::Unknown(raw) => raw.as_str(),
        }
    }

    /// Live or at half time; the only states where `minute` means anything.
    pub fn is_in_play(&self) -> bool {
        matches!(self, MatchStatus::Live | MatchStatus::HalfTime)
    }
}

impl From<String> for MatchStatus {
    fn from(raw: String) -> Self {
        MatchStatus::parse(&raw)
    }
}

impl From<MatchStatus> for String {
    fn from(status: MatchStatus) -> Self {
        status.code().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TeamInfo {
    pub name: Option<String>,
    pub logo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: MatchId,
    pub home_team_id: Option<TeamId>,
    pub away_team_id: Option<TeamId>,
    pub home_team_name: Option<String>,
    pub away_team_name: Option<String>,
    pub home_logo: Option<String>,
    pub away_logo: Option<String>,
    pub home_score: u16,
    pub away_score: u16,
    pub start_time: DateTime<Utc>,
    pub status: MatchStatus,
    pub minute: Option<u16>,
    pub league_id: Option<i64>,
    pub league_name: Option<String>,
    pub league_logo: Option<String>,
    pub round_name: Option<String>,
    pub state_name: Option<String>,
    pub season_id: Option<i64>,
    pub season_name: Option<String>,
    pub venue_name: Option<String>,
    pub venue_city: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MatchRecord {
    pub fn home_name(&self) -> &str {
        self.home_team_name.as_deref().unwrap_or(FALLBACK_TEAM_NAME)
    }

    pub fn away_name(&self) -> &str {
        self.away_team_name.as_deref().unwrap_or(FALLBACK_TEAM_NAME)
    }

    pub fn home_logo_or_placeholder(&self) -> &str {
        self.home_logo.as_deref().unwrap_or(PLACEHOLDER_LOGO)
    }

    pub fn away_logo_or_placeholder(&self) -> &str {
        self.away_logo.as_deref().unwrap_or(PLACEHOLDER_LOGO)
    }

    /// Team ids on this record whose display fields are still incomplete.
    pub fn unresolved_team_ids(&self) -> Vec<TeamId> {
        let mut out = Vec::with_capacity(2);
        if let Some(id) = self.home_team_id
            && (self.home_team_name.is_none() || self.home_logo.is_none())
        {
            out.push(id);
        }
        if let Some(id) = self.away_team_id
            && (self.away_team_name.is_none() || self.away_logo.is_none())
            && !out.contains(&id)
        {
            out.push(id);
        }
        out
    }
}

/// Partial record carried by a change event. `None` means "not present in the
/// event" and leaves the stored value untouched on merge.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchPatch {
    pub id: MatchId,
    pub home_team_id: Option<TeamId>,
    pub away_team_id: Option<TeamId>,
    pub home_team_name: Option<String>,
    pub away_team_name: Option<String>,
    pub home_logo: Option<String>,
    pub away_logo: Option<String>,
    pub home_score: Option<u16>,
    pub away_score: Option<u16>,
    pub start_time: Option<DateTime<Utc>>,
    pub status: Option<MatchStatus>,
    pub minute: Option<u16>,
    pub league_id: Option<i64>,
    pub league_name: Option<String>,
    pub league_logo: Option<String>,
    pub round_name: Option<String>,
    pub state_name: Option<String>,
    pub season_id: Option<i64>,
    pub season_name: Option<String>,
    pub venue_name: Option<String>,
    pub venue_city: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MatchPatch {
    pub fn new(id: MatchId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

/// A match row as decoded from the wire, plus any team objects that were
/// joined onto it by the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRow {
    pub patch: MatchPatch,
    pub teams: Vec<(TeamId, TeamInfo)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert(ParsedRow),
    Update(ParsedRow),
    Delete(MatchId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedPhase {
    Disconnected,
    Connecting,
    Subscribed,
}

/// Messages serialized through a feed's single mutation path.
#[derive(Debug)]
pub enum Delta {
    Change(RawChange),
    TeamsResolved(HashMap<TeamId, TeamInfo>),
    Phase {
        phase: FeedPhase,
        error: Option<TransportError>,
    },
    Resync,
    Log(String),
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_and_aliases() {
        assert_eq!(MatchStatus::parse("ns"), MatchStatus::Scheduled);
        assert_eq!(MatchStatus::parse("Not Started"), MatchStatus::Scheduled);
        assert_eq!(MatchStatus::parse(" half-time "), MatchStatus::HalfTime);
        assert_eq!(MatchStatus::parse("AET"), MatchStatus::Finished);
        assert_eq!(
            MatchStatus::parse("Suspended"),
            MatchStatus::Unknown("Suspended".to_string())
        );
        assert_eq!(MatchStatus::HalfTime.label(), "Half Time");
        assert_eq!(String::from(MatchStatus::Finished), "FT");
        assert!(MatchStatus::HalfTime.is_in_play());
        assert!(!MatchStatus::Finished.is_in_play());
    }

    #[test]
    fn shared_team_id_is_reported_once() {
        let record = MatchRecord {
            id: 1,
            home_team_id: Some(4),
            away_team_id: Some(4),
            home_team_name: None,
            away_team_name: None,
            home_logo: None,
            away_logo: None,
            home_score: 0,
            away_score: 0,
            start_time: Utc::now(),
            status: MatchStatus::Scheduled,
            minute: None,
            league_id: None,
            league_name: None,
            league_logo: None,
            round_name: None,
            state_name: None,
            season_id: None,
            season_name: None,
            venue_name: None,
            venue_city: None,
            updated_at: None,
            finished_at: None,
        };
        assert_eq!(record.unresolved_team_ids(), vec![4]);
        assert_eq!(record.home_logo_or_placeholder(), PLACEHOLDER_LOGO);
    }
}
