use std::collections::{BTreeSet, HashMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::debug;
use serde_json::Value;

use crate::config::SyncConfig;
use crate::error::{SyncError, TransportError};
use crate::feed::FeedSource;
use crate::http_client::{fetch_body, fetch_rows};
use crate::state::{MatchId, TeamId, TeamInfo};
use crate::transport::{ChangeFeedTransport, Subscription, TeamLookup};
use crate::wire::{RawChange, parse_id, parse_team_rows_json};

/// Talks to a PostgREST endpoint. Bulk loads and team lookups are plain
/// queries; the change feed is produced by polling the table and diffing
/// consecutive snapshots.
#[derive(Debug, Clone)]
pub struct RestClient {
    base_url: String,
    api_key: String,
    teams_table: String,
    poll_interval: Duration,
}

impl RestClient {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let base_url = config
            .supabase_url
            .clone()
            .context("SUPABASE_URL is not set")?;
        let api_key = config
            .supabase_key
            .clone()
            .context("SUPABASE_ANON_KEY is not set")?;
        Ok(Self {
            base_url,
            api_key,
            teams_table: config.teams_table.clone(),
            poll_interval: config.poll_interval,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn fetch_snapshot(&self, source: &FeedSource) -> Result<Vec<Value>> {
        fetch_rows(
            &self.table_url(&source.table),
            &self.api_key,
            &[
                ("select", source.select.clone()),
                ("order", "start_time.asc".to_string()),
            ],
        )
        .with_context(|| format!("load {}", source.table))
    }
}

impl ChangeFeedTransport for RestClient {
    fn subscribe(&self, source: &FeedSource) -> Result<Box<dyn Subscription>, TransportError> {
        let rows = self.fetch_snapshot(source)?;
        let (previous, _) = diff_rows(&HashMap::new(), &source.table, rows);
        Ok(Box::new(PollingSubscription {
            client: self.clone(),
            source: source.clone(),
            previous,
            pending: VecDeque::new(),
            last_poll: Instant::now(),
        }))
    }

    fn load_all(&self, source: &FeedSource) -> Result<Vec<Value>, TransportError> {
        Ok(self.fetch_snapshot(source)?)
    }
}

impl TeamLookup for RestClient {
    fn lookup(&self, ids: &[TeamId]) -> Result<HashMap<TeamId, TeamInfo>, SyncError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let list = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let teams = fetch_body(
            &self.table_url(&self.teams_table),
            &self.api_key,
            &[
                ("select", "id,name,logo".to_string()),
                ("id", format!("in.({list})")),
            ],
        )
        .and_then(|body| parse_team_rows_json(&body))
        .map_err(|err| SyncError::Enrichment(format!("{err:#}")))?;
        Ok(teams.into_iter().collect())
    }
}

struct PollingSubscription {
    client: RestClient,
    source: FeedSource,
    previous: HashMap<MatchId, Value>,
    pending: VecDeque<RawChange>,
    last_poll: Instant,
}

impl Subscription for PollingSubscription {
    fn next_change(&mut self, wait: Duration) -> Result<Option<RawChange>, TransportError> {
        if let Some(change) = self.pending.pop_front() {
            return Ok(Some(change));
        }
        let due = self.last_poll + self.client.poll_interval;
        let now = Instant::now();
        if now < due {
            thread::sleep(wait.min(due - now));
            return Ok(None);
        }
        self.last_poll = Instant::now();
        let rows = self.client.fetch_snapshot(&self.source)?;
        let (current, changes) = diff_rows(&self.previous, &self.source.table, rows);
        if !changes.is_empty() {
            debug!("{} poll produced {} changes", self.source.table, changes.len());
        }
        self.previous = current;
        self.pending.extend(changes);
        Ok(self.pending.pop_front())
    }
}

/// Compares a fresh snapshot with the previous one and returns the new
/// snapshot keyed by id plus the change events between them. Inserts and
/// updates come in snapshot order, deletes last in id order. Rows without a
/// usable id are skipped.
pub fn diff_rows(
    previous: &HashMap<MatchId, Value>,
    table: &str,
    rows: Vec<Value>,
) -> (HashMap<MatchId, Value>, Vec<RawChange>) {
    let mut current = HashMap::with_capacity(rows.len());
    let mut changes = Vec::new();
    for row in rows {
        let Ok(id) = parse_id(&row) else {
            debug!("{table}: skipping row without id");
            continue;
        };
        match previous.get(&id) {
            None => changes.push(RawChange::insert(table, row.clone())),
            Some(old) if *old != row => changes.push(RawChange::update(table, row.clone())),
            Some(_) => {}
        }
        current.insert(id, row);
    }
    let removed: BTreeSet<MatchId> = previous
        .keys()
        .filter(|id| !current.contains_key(id))
        .copied()
        .collect();
    changes.extend(removed.into_iter().map(|id| RawChange::delete(table, id)));
    (current, changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ChangeKind;
    use serde_json::json;

    #[test]
    fn diff_reports_inserts_updates_and_deletes() {
        let (first, changes) = diff_rows(
            &HashMap::new(),
            "livescores",
            vec![
                json!({"id": 1, "status": "NS"}),
                json!({"id": 2, "status": "NS"}),
                json!({"id": 3, "status": "NS"}),
            ],
        );
        assert_eq!(changes.len(), 3);
        assert!(changes.iter().all(|c| c.kind == ChangeKind::Insert));

        let (second, changes) = diff_rows(
            &first,
            "livescores",
            vec![
                json!({"id": 1, "status": "NS"}),
                json!({"id": 2, "status": "LIVE", "minute": 3}),
                json!({"id": 4, "status": "NS"}),
                json!({"status": "NS"}),
            ],
        );
        let kinds: Vec<ChangeKind> = changes.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Update, ChangeKind::Insert, ChangeKind::Delete]
        );
        assert_eq!(changes[2].old_record, json!({"id": 3}));
        assert_eq!(second.len(), 3);
    }

    #[test]
    fn missing_credentials_are_reported() {
        let err = RestClient::from_config(&SyncConfig::default()).unwrap_err();
        assert!(err.to_string().contains("SUPABASE_URL"));
    }
}
