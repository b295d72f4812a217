use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::Utc;

use crate::error::SyncError;
use crate::state::{MatchId, MatchPatch, MatchRecord, MatchStatus, TeamId, TeamInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated { changed: bool },
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        match self {
            UpsertOutcome::Inserted => true,
            UpsertOutcome::Updated { changed } => changed,
        }
    }
}

/// Canonical id -> record map for one feed. Iteration is in ascending id order.
#[derive(Debug, Default, Clone)]
pub struct EntityStore {
    records: BTreeMap<MatchId, MatchRecord>,
    revision: u64,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new record or merges the patch into the existing one. A new
    /// record needs a `start_time`; without one the patch is rejected and the
    /// store is left untouched.
    pub fn upsert(&mut self, patch: MatchPatch) -> Result<UpsertOutcome, SyncError> {
        if let Some(existing) = self.records.get_mut(&patch.id) {
            let before = existing.clone();
            merge_into(existing, patch);
            let changed = *existing != before;
            if changed {
                self.revision += 1;
            }
            return Ok(UpsertOutcome::Updated { changed });
        }

        let record = record_from_patch(patch)?;
        self.records.insert(record.id, record);
        self.revision += 1;
        Ok(UpsertOutcome::Inserted)
    }

    pub fn remove(&mut self, id: MatchId) -> Option<MatchRecord> {
        let removed = self.records.remove(&id);
        if removed.is_some() {
            self.revision += 1;
        }
        removed
    }

    pub fn get(&self, id: MatchId) -> Option<&MatchRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: MatchId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn all(&self) -> impl Iterator<Item = &MatchRecord> {
        self.records.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = MatchId> + '_ {
        self.records.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Writes resolved display fields onto every record referencing `team_id`.
    /// Identity and team ids are never touched. Returns how many records changed.
    pub fn apply_team(&mut self, team_id: TeamId, info: &TeamInfo) -> usize {
        let mut changed = 0;
        for record in self.records.values_mut() {
            let before_home = (record.home_team_name.clone(), record.home_logo.clone());
            let before_away = (record.away_team_name.clone(), record.away_logo.clone());
            if record.home_team_id == Some(team_id) {
                set_if_some(&mut record.home_team_name, info.name.clone());
                set_if_some(&mut record.home_logo, info.logo.clone());
            }
            if record.away_team_id == Some(team_id) {
                set_if_some(&mut record.away_team_name, info.name.clone());
                set_if_some(&mut record.away_logo, info.logo.clone());
            }
            if before_home != (record.home_team_name.clone(), record.home_logo.clone())
                || before_away != (record.away_team_name.clone(), record.away_logo.clone())
            {
                changed += 1;
            }
        }
        if changed > 0 {
            self.revision += 1;
        }
        changed
    }

    /// Union of team ids referenced by records that still lack a name or logo.
    pub fn unresolved_team_ids(&self) -> BTreeSet<TeamId> {
        self.records
            .values()
            .flat_map(|record| record.unresolved_team_ids())
            .collect()
    }

    /// Drops every record whose id is not in `keep`. Returns the removed ids.
    pub fn retain_ids(&mut self, keep: &HashSet<MatchId>) -> Vec<MatchId> {
        let removed: Vec<MatchId> = self
            .records
            .keys()
            .filter(|id| !keep.contains(id))
            .copied()
            .collect();
        for id in &removed {
            self.records.remove(id);
        }
        if !removed.is_empty() {
            self.revision += 1;
        }
        removed
    }
}

fn record_from_patch(patch: MatchPatch) -> Result<MatchRecord, SyncError> {
    let Some(start_time) = patch.start_time else {
        return Err(SyncError::MalformedEvent(format!(
            "match {} has no start_time",
            patch.id
        )));
    };
    let finished_at = patch.finished_at;
    let mut record = MatchRecord {
        id: patch.id,
        home_team_id: patch.home_team_id,
        away_team_id: patch.away_team_id,
        home_team_name: patch.home_team_name,
        away_team_name: patch.away_team_name,
        home_logo: patch.home_logo,
        away_logo: patch.away_logo,
        home_score: patch.home_score.unwrap_or(0),
        away_score: patch.away_score.unwrap_or(0),
        start_time,
        status: patch.status.unwrap_or(MatchStatus::Scheduled),
        minute: patch.minute,
        league_id: patch.league_id,
        league_name: patch.league_name,
        league_logo: patch.league_logo,
        round_name: patch.round_name,
        state_name: patch.state_name,
        season_id: patch.season_id,
        season_name: patch.season_name,
        venue_name: patch.venue_name,
        venue_city: patch.venue_city,
        updated_at: patch.updated_at,
        finished_at: None,
    };
    normalize(&mut record, finished_at);
    Ok(record)
}

fn merge_into(record: &mut MatchRecord, patch: MatchPatch) {
    // A changed team reference invalidates that side's display fields.
    if let Some(team_id) = patch.home_team_id
        && record.home_team_id != Some(team_id)
    {
        record.home_team_id = Some(team_id);
        record.home_team_name = None;
        record.home_logo = None;
    }
    if let Some(team_id) = patch.away_team_id
        && record.away_team_id != Some(team_id)
    {
        record.away_team_id = Some(team_id);
        record.away_team_name = None;
        record.away_logo = None;
    }
    set_if_some(&mut record.home_team_name, patch.home_team_name);
    set_if_some(&mut record.away_team_name, patch.away_team_name);
    set_if_some(&mut record.home_logo, patch.home_logo);
    set_if_some(&mut record.away_logo, patch.away_logo);
    if let Some(score) = patch.home_score {
        record.home_score = score;
    }
    if let Some(score) = patch.away_score {
        record.away_score = score;
    }
    if let Some(start_time) = patch.start_time {
        record.start_time = start_time;
    }
    if let Some(status) = patch.status {
        record.status = status;
    }
    set_if_some(&mut record.minute, patch.minute);
    set_if_some(&mut record.league_id, patch.league_id);
    set_if_some(&mut record.league_name, patch.league_name);
    set_if_some(&mut record.league_logo, patch.league_logo);
    set_if_some(&mut record.round_name, patch.round_name);
    set_if_some(&mut record.state_name, patch.state_name);
    set_if_some(&mut record.season_id, patch.season_id);
    set_if_some(&mut record.season_name, patch.season_name);
    set_if_some(&mut record.venue_name, patch.venue_name);
    set_if_some(&mut record.venue_city, patch.venue_city);
    set_if_some(&mut record.updated_at, patch.updated_at);
    normalize(record, patch.finished_at);
}

// `minute` only exists while in play; `finished_at` only while finished, and is
// stamped on the transition into Finished when the event did not carry one.
fn normalize(record: &mut MatchRecord, finished_at: Option<chrono::DateTime<Utc>>) {
    if !record.status.is_in_play() {
        record.minute = None;
    }
    if record.status == MatchStatus::Finished {
        if finished_at.is_some() {
            record.finished_at = finished_at;
        } else if record.finished_at.is_none() {
            record.finished_at = Some(record.updated_at.unwrap_or_else(Utc::now));
        }
    } else {
        record.finished_at = None;
    }
}

fn set_if_some<T>(slot: &mut Option<T>, value: Option<T>) {
    if let Some(value) = value {
        *slot = Some(value);
    }
}
