use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::SyncError;
use crate::state::{ChangeEvent, MatchId, MatchPatch, MatchStatus, ParsedRow, TeamId, TeamInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Realtime envelope as pushed by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub table: String,
    #[serde(default, rename = "new")]
    pub new_record: Value,
    #[serde(default, rename = "old")]
    pub old_record: Value,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
}

impl RawChange {
    pub fn insert(table: &str, row: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            table: table.to_string(),
            new_record: row,
            old_record: Value::Null,
            commit_timestamp: None,
        }
    }

    pub fn update(table: &str, row: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            table: table.to_string(),
            new_record: row,
            old_record: Value::Null,
            commit_timestamp: None,
        }
    }

    pub fn delete(table: &str, id: MatchId) -> Self {
        Self {
            kind: ChangeKind::Delete,
            table: table.to_string(),
            new_record: Value::Null,
            old_record: json!({ "id": id }),
            commit_timestamp: None,
        }
    }

    pub fn into_event(self) -> Result<ChangeEvent, SyncError> {
        match self.kind {
            ChangeKind::Delete => {
                let id = parse_id(&self.old_record).or_else(|_| parse_id(&self.new_record))?;
                Ok(ChangeEvent::Delete(id))
            }
            ChangeKind::Insert | ChangeKind::Update => {
                let mut row = parse_match_row(&self.new_record)?;
                if row.patch.updated_at.is_none() {
                    row.patch.updated_at = self.commit_timestamp.as_deref().and_then(parse_timestamp);
                }
                if self.kind == ChangeKind::Insert {
                    Ok(ChangeEvent::Insert(row))
                } else {
                    Ok(ChangeEvent::Update(row))
                }
            }
        }
    }
}

/// Bulk load bodies are a JSON array of rows; `null` or empty reads as no rows.
pub fn parse_rows_json(raw: &str) -> Result<Vec<Value>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).context("invalid rows json")
}

pub fn parse_id(value: &Value) -> Result<MatchId, SyncError> {
    value
        .get("id")
        .and_then(value_as_i64)
        .ok_or_else(|| SyncError::MalformedEvent("payload has no usable id".to_string()))
}

pub fn parse_match_row(value: &Value) -> Result<ParsedRow, SyncError> {
    if !value.is_object() {
        return Err(SyncError::MalformedEvent("payload is not an object".to_string()));
    }
    let id = parse_id(value)?;
    let mut patch = MatchPatch::new(id);
    let mut teams = Vec::new();

    patch.home_team_id = pick_i64(value, "home_team_id");
    patch.away_team_id = pick_i64(value, "away_team_id");
    let home = parse_team_ref(value.get("home_team"));
    let away = parse_team_ref(value.get("away_team"));
    if patch.home_team_id.is_none() {
        patch.home_team_id = home.id;
    }
    if patch.away_team_id.is_none() {
        patch.away_team_id = away.id;
    }
    patch.home_team_name = home.info.name.clone();
    patch.away_team_name = away.info.name.clone();
    patch.home_logo = pick_string(value, "home_logo").or_else(|| home.info.logo.clone());
    patch.away_logo = pick_string(value, "away_logo").or_else(|| away.info.logo.clone());
    if home.joined
        && let Some(team_id) = patch.home_team_id
    {
        teams.push((team_id, home.info));
    }
    if away.joined
        && let Some(team_id) = patch.away_team_id
    {
        teams.push((team_id, away.info));
    }

    patch.home_score = pick_u16(value, "home_score");
    patch.away_score = pick_u16(value, "away_score");
    patch.start_time = pick_time(value, &["start_time", "starting_at"])?;
    patch.status = pick_string(value, "status").map(|raw| MatchStatus::parse(&raw));
    patch.minute = pick_u16(value, "minute");
    patch.league_id = pick_i64(value, "league_id");
    patch.league_name = pick_string(value, "league_name");
    patch.league_logo = pick_string(value, "league_logo");
    patch.round_name = pick_string(value, "round_name");
    patch.state_name = pick_string(value, "state_name");
    patch.season_id = pick_i64(value, "season_id");
    patch.season_name = pick_string(value, "season_name");
    patch.venue_name = pick_string(value, "venue_name");
    patch.venue_city = pick_string(value, "venue_city");
    patch.updated_at = pick_time(value, &["updated_at"])?;
    patch.finished_at = pick_time(value, &["finished_at"])?;

    Ok(ParsedRow { patch, teams })
}

#[derive(Debug, Deserialize)]
struct TeamRow {
    id: TeamId,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    logo: Option<String>,
}

/// Team directory bodies; entries without a usable id are skipped.
pub fn parse_team_rows_json(raw: &str) -> Result<Vec<(TeamId, TeamInfo)>> {
    let rows = parse_rows_json(raw).context("invalid teams json")?;
    Ok(rows
        .into_iter()
        .filter_map(|row| serde_json::from_value::<TeamRow>(row).ok())
        .map(TeamRow::into_entry)
        .collect())
}

impl TeamRow {
    fn into_entry(self) -> (TeamId, TeamInfo) {
        (
            self.id,
            TeamInfo {
                name: self.name.filter(|s| !s.trim().is_empty()),
                logo: self.logo.filter(|s| !s.trim().is_empty()),
            },
        )
    }
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    // Postgres text output, e.g. "2025-08-16 14:00:00+00".
    if let Ok(dt) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

struct TeamRef {
    id: Option<TeamId>,
    info: TeamInfo,
    joined: bool,
}

// `home_team` is either a bare display name or a joined `{id, name, logo}` object.
fn parse_team_ref(value: Option<&Value>) -> TeamRef {
    match value {
        Some(Value::String(name)) => TeamRef {
            id: None,
            info: TeamInfo {
                name: non_empty(name),
                logo: None,
            },
            joined: false,
        },
        Some(obj @ Value::Object(_)) => TeamRef {
            id: pick_i64(obj, "id"),
            info: TeamInfo {
                name: pick_string(obj, "name"),
                logo: pick_string(obj, "logo"),
            },
            joined: true,
        },
        _ => TeamRef {
            id: None,
            info: TeamInfo::default(),
            joined: false,
        },
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

fn pick_i64(value: &Value, key: &str) -> Option<i64> {
    value.get(key).and_then(value_as_i64)
}

fn pick_u16(value: &Value, key: &str) -> Option<u16> {
    pick_i64(value, key).and_then(|n| u16::try_from(n).ok())
}

fn pick_string(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::String(s)) => non_empty(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn pick_time(value: &Value, keys: &[&str]) -> Result<Option<DateTime<Utc>>, SyncError> {
    for key in keys {
        match value.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::String(raw)) => {
                return parse_timestamp(raw).map(Some).ok_or_else(|| {
                    SyncError::MalformedEvent(format!("unparseable {key}: {raw}"))
                });
            }
            Some(other) => {
                return Err(SyncError::MalformedEvent(format!(
                    "unexpected {key} value: {other}"
                )));
            }
        }
    }
    Ok(None)
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_accept_rfc3339_postgres_and_naive_forms() {
        let expected = Utc.with_ymd_and_hms(2025, 8, 16, 14, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2025-08-16T14:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2025-08-16T16:00:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-08-16 14:00:00+00"), Some(expected));
        assert_eq!(parse_timestamp("2025-08-16 14:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-08-16T14:00:00.000"), Some(expected));
        assert_eq!(parse_timestamp("tomorrow-ish"), None);
    }

    #[test]
    fn id_may_be_a_numeric_string() {
        assert_eq!(parse_id(&json!({"id": "42"})).unwrap(), 42);
        assert!(parse_id(&json!({"id": "abc"})).is_err());
        assert!(parse_id(&json!({"home_team_id": 1})).is_err());
    }

    #[test]
    fn null_fields_read_as_absent() {
        let row = parse_match_row(&json!({
            "id": 7,
            "home_logo": null,
            "status": null,
            "start_time": null,
        }))
        .unwrap();
        assert_eq!(row.patch.home_logo, None);
        assert_eq!(row.patch.status, None);
        assert_eq!(row.patch.start_time, None);
    }

    #[test]
    fn bad_start_time_is_malformed() {
        let err = parse_match_row(&json!({"id": 1, "start_time": "soon"})).unwrap_err();
        assert!(matches!(err, SyncError::MalformedEvent(_)));
    }
}
