use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use chrono::NaiveDate;

use log::{debug, info, warn};
use serde_json::Value;

use crate::enrich::EnrichmentResolver;
use crate::error::SyncError;
use crate::feed::{FeedShared, FeedSource, LoadState};
use crate::state::{ChangeEvent, Delta, MatchId, ParsedRow, TeamId, TeamInfo};
use crate::store::UpsertOutcome;
use crate::transport::ChangeFeedTransport;
use crate::view::Reference;
use crate::wire::{RawChange, parse_match_row};

const MAX_BATCH: usize = 512;
const DAY_CHECK: Duration = Duration::from_secs(30);

/// Owns the write side of one feed. Every mutation (change events, bulk
/// loads, enrichment results, health transitions) arrives as a `Delta` and is
/// applied here, one at a time.
pub struct ChangeIngestor {
    shared: Arc<FeedShared>,
    source: FeedSource,
    transport: Arc<dyn ChangeFeedTransport>,
    resolver: EnrichmentResolver,
    teams: HashMap<TeamId, TeamInfo>,
    views_day: Option<NaiveDate>,
}

impl ChangeIngestor {
    pub fn new(
        shared: Arc<FeedShared>,
        source: FeedSource,
        transport: Arc<dyn ChangeFeedTransport>,
        resolver: EnrichmentResolver,
    ) -> Self {
        Self {
            shared,
            source,
            transport,
            resolver,
            teams: HashMap::new(),
            views_day: None,
        }
    }

    pub fn shared(&self) -> &Arc<FeedShared> {
        &self.shared
    }

    pub fn resolver(&self) -> &EnrichmentResolver {
        &self.resolver
    }

    /// Drains the channel in bursts; each burst is applied in order and
    /// published once. Returns on `Delta::Shutdown` or when every sender is gone.
    /// A quiet channel still gets its day-relative views rolled over at midnight.
    pub fn run(mut self, rx: Receiver<Delta>) {
        info!("{} ingest loop started", self.source.kind);
        loop {
            let first = match rx.recv_timeout(DAY_CHECK) {
                Ok(delta) => delta,
                Err(RecvTimeoutError::Timeout) => {
                    let reference = self.shared.reference();
                    self.roll_views(&reference);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let mut batch = vec![first];
            batch.extend(rx.try_iter().take(MAX_BATCH));
            let shutdown = batch.iter().position(|d| matches!(d, Delta::Shutdown));
            if let Some(pos) = shutdown {
                batch.truncate(pos);
            }
            self.apply_batch(batch);
            if shutdown.is_some() {
                break;
            }
        }
        info!("{} ingest loop stopped", self.source.kind);
    }

    /// Applies every delta and publishes at most once. Returns whether
    /// anything visible changed.
    pub fn apply_batch(&mut self, deltas: impl IntoIterator<Item = Delta>) -> bool {
        let mut changed = false;
        for delta in deltas {
            changed |= self.apply_delta(delta);
        }
        if changed {
            let reference = self.shared.reference();
            self.shared.publish_at(&reference);
            self.views_day = Some(reference.today());
        }
        changed
    }

    /// Recomputes views when the local day of `reference` differs from the one
    /// they were last computed for. Returns whether anything was published.
    pub fn roll_views(&mut self, reference: &Reference) -> bool {
        let today = reference.today();
        match self.views_day {
            Some(day) if day != today => {
                debug!("{} day rolled over to {today}, refreshing views", self.source.kind);
                self.shared.publish_at(reference);
                self.views_day = Some(today);
                true
            }
            _ => false,
        }
    }

    pub fn apply_delta(&mut self, delta: Delta) -> bool {
        match delta {
            Delta::Change(raw) => self.apply_change(raw),
            Delta::TeamsResolved(teams) => self.apply_teams(teams),
            Delta::Phase { phase, error } => {
                debug!("{} phase -> {phase:?}", self.source.kind);
                self.shared
                    .health_mut()
                    .enter_phase(phase, error.map(|err| err.to_string()));
                true
            }
            Delta::Resync => self.reload(),
            Delta::Log(msg) => {
                self.shared.health_mut().push_log(msg);
                false
            }
            Delta::Shutdown => false,
        }
    }

    fn apply_change(&mut self, raw: RawChange) -> bool {
        let event = match raw.into_event() {
            Ok(event) => event,
            Err(err) => {
                self.drop_event(err);
                return false;
            }
        };

        let (row, is_insert) = match event {
            ChangeEvent::Insert(row) => (row, true),
            ChangeEvent::Update(row) => (row, false),
            ChangeEvent::Delete(id) => {
                let removed = self.shared.store_mut().remove(id).is_some();
                if !removed {
                    debug!("{} delete for unknown match {id}", self.source.kind);
                }
                return removed;
            }
        };

        let id = row.patch.id;
        let teams_before = self.team_ids_of(id);
        match self.upsert_row(row) {
            Ok(outcome) => {
                if !is_insert && outcome == UpsertOutcome::Inserted {
                    debug!("{} update for unseen match {id}, treated as insert", self.source.kind);
                }
                // Plain updates reuse the team cache but never trigger a lookup.
                let request_missing = is_insert
                    || outcome == UpsertOutcome::Inserted
                    || self.team_ids_of(id) != teams_before;
                let enriched = self.enrich_record(id, request_missing);
                outcome.changed() || enriched
            }
            Err(err) => {
                self.drop_event(err);
                false
            }
        }
    }

    fn team_ids_of(&self, id: MatchId) -> Option<(Option<TeamId>, Option<TeamId>)> {
        self.shared
            .store()
            .get(id)
            .map(|record| (record.home_team_id, record.away_team_id))
    }

    fn upsert_row(&mut self, row: ParsedRow) -> Result<UpsertOutcome, SyncError> {
        let ParsedRow { mut patch, teams } = row;
        for (team_id, info) in teams {
            if info.name.is_some() || info.logo.is_some() {
                self.teams.insert(team_id, info);
            }
        }
        let mut store = self.shared.store_mut();
        if patch.season_name.is_none() && !store.contains(patch.id) {
            patch.season_name = self.source.default_season_name.clone();
        }
        store.upsert(patch)
    }

    /// Fills display fields for one record from the team cache and, when
    /// asked, requests lookups for ids the cache has never seen.
    fn enrich_record(&mut self, id: MatchId, request_missing: bool) -> bool {
        let mut store = self.shared.store_mut();
        let Some(record) = store.get(id) else {
            return false;
        };
        let mut changed = false;
        let mut missing = BTreeSet::new();
        for team_id in record.unresolved_team_ids() {
            match self.teams.get(&team_id) {
                Some(info) => changed |= store.apply_team(team_id, info) > 0,
                None => {
                    missing.insert(team_id);
                }
            }
        }
        drop(store);
        if request_missing && !missing.is_empty() {
            self.resolver.request(missing);
        }
        changed
    }

    fn apply_teams(&mut self, teams: HashMap<TeamId, TeamInfo>) -> bool {
        let mut store = self.shared.store_mut();
        let mut changed = 0;
        for (team_id, info) in teams {
            // Records deleted while the lookup was in flight are simply absent.
            changed += store.apply_team(team_id, &info);
            self.teams.insert(team_id, info);
        }
        changed > 0
    }

    /// Bulk load: the result is authoritative, so records missing from it are
    /// dropped. Team ids still lacking display data are resolved in one batch.
    pub fn reload(&mut self) -> bool {
        let rows = match self.transport.load_all(&self.source) {
            Ok(rows) => rows,
            Err(err) => {
                let err = SyncError::BulkLoad(err.to_string());
                warn!("{} {err}", self.source.kind);
                let mut health = self.shared.health_mut();
                health.push_log(format!("[WARN] {err}"));
                health.last_error = Some(err.to_string());
                health.load = LoadState::Failed(err.to_string());
                return true;
            }
        };
        let total = rows.len();
        let seen = self.apply_snapshot(rows);

        let removed = self.shared.store_mut().retain_ids(&seen);
        let unresolved: BTreeSet<TeamId> = {
            let mut store = self.shared.store_mut();
            let mut unresolved = BTreeSet::new();
            for team_id in store.unresolved_team_ids() {
                match self.teams.get(&team_id) {
                    Some(info) => {
                        store.apply_team(team_id, info);
                    }
                    None => {
                        unresolved.insert(team_id);
                    }
                }
            }
            unresolved
        };
        if !unresolved.is_empty() {
            self.resolver.request(unresolved);
        }

        info!(
            "{} loaded {} rows ({} kept, {} removed)",
            self.source.kind,
            total,
            seen.len(),
            removed.len()
        );
        let mut health = self.shared.health_mut();
        health.load = LoadState::Loaded;
        health.stale = false;
        health.push_log(format!("[INFO] Loaded {} matches", seen.len()));
        true
    }

    fn apply_snapshot(&mut self, rows: Vec<Value>) -> HashSet<MatchId> {
        let mut seen = HashSet::with_capacity(rows.len());
        for value in rows {
            let row = match parse_match_row(&value) {
                Ok(row) => row,
                Err(err) => {
                    self.drop_event(err);
                    continue;
                }
            };
            let id = row.patch.id;
            match self.upsert_row(row) {
                Ok(_) => {
                    seen.insert(id);
                }
                Err(err) => self.drop_event(err),
            }
        }
        seen
    }

    fn drop_event(&self, err: SyncError) {
        warn!("{} dropped event: {err}", self.source.kind);
        let mut health = self.shared.health_mut();
        health.dropped_events += 1;
        health.push_log(format!("[WARN] Dropped event: {err}"));
    }
}
