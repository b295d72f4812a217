use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde_json::{Value, json};

use crate::error::{SyncError, TransportError};
use crate::feed::FeedSource;
use crate::state::{MatchId, TeamId, TeamInfo};
use crate::transport::{ChangeFeedTransport, Subscription, TeamLookup};
use crate::wire::{ChangeKind, RawChange, parse_id};

/// In-process stand-in for the remote store. Rows live per table; `push`
/// applies a change to the table and fans it out to every open subscription
/// on that table.
#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<Mutex<FakeInner>>,
    open: Arc<AtomicUsize>,
}

#[derive(Default)]
struct FakeInner {
    tables: HashMap<String, BTreeMap<MatchId, Value>>,
    subscribers: Vec<(String, Sender<RawChange>)>,
    unavailable: bool,
    fail_subscribes: usize,
    fail_loads: usize,
    total_subscribes: usize,
    loads: usize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(table: &str, rows: Vec<Value>) -> Self {
        let transport = Self::new();
        transport.set_rows(table, rows);
        transport
    }

    /// Replaces the table contents without emitting change events.
    pub fn set_rows(&self, table: &str, rows: Vec<Value>) {
        let mut inner = self.lock();
        let entries = inner.tables.entry(table.to_string()).or_default();
        entries.clear();
        for row in rows {
            if let Ok(id) = parse_id(&row) {
                entries.insert(id, row);
            }
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: MatchId) -> Option<Value> {
        self.lock().tables.get(table)?.get(&id).cloned()
    }

    /// Applies `change` to its table and broadcasts it. Malformed payloads are
    /// broadcast untouched so consumers see exactly what was pushed.
    pub fn push(&self, change: RawChange) {
        let mut inner = self.lock();
        let table = inner.tables.entry(change.table.clone()).or_default();
        match change.kind {
            ChangeKind::Insert => {
                if let Ok(id) = parse_id(&change.new_record) {
                    table.insert(id, change.new_record.clone());
                }
            }
            ChangeKind::Update => {
                if let Ok(id) = parse_id(&change.new_record) {
                    let row = table.entry(id).or_insert_with(|| json!({}));
                    merge_object(row, &change.new_record);
                }
            }
            ChangeKind::Delete => {
                if let Ok(id) = parse_id(&change.old_record) {
                    table.remove(&id);
                }
            }
        }
        let target = change.table.clone();
        inner.subscribers.retain(|(table, tx)| {
            *table != target || tx.send(change.clone()).is_ok()
        });
    }

    /// Severs every open subscription; each reports a transport error on its
    /// next read.
    pub fn drop_connections(&self) {
        self.lock().subscribers.clear();
    }

    /// While unavailable, subscribe and load fail and open subscriptions are
    /// severed.
    pub fn set_unavailable(&self, unavailable: bool) {
        let mut inner = self.lock();
        inner.unavailable = unavailable;
        if unavailable {
            inner.subscribers.clear();
        }
    }

    pub fn fail_next_subscribes(&self, count: usize) {
        self.lock().fail_subscribes = count;
    }

    pub fn fail_next_loads(&self, count: usize) {
        self.lock().fail_loads = count;
    }

    /// Subscriptions currently held by a consumer.
    pub fn open_subscriptions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn total_subscribes(&self) -> usize {
        self.lock().total_subscribes
    }

    pub fn load_count(&self) -> usize {
        self.lock().loads
    }

    fn lock(&self) -> MutexGuard<'_, FakeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChangeFeedTransport for FakeTransport {
    fn subscribe(&self, source: &FeedSource) -> Result<Box<dyn Subscription>, TransportError> {
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(TransportError::new("upstream unavailable"));
        }
        if inner.fail_subscribes > 0 {
            inner.fail_subscribes -= 1;
            return Err(TransportError::new("subscribe rejected"));
        }
        let (tx, rx) = mpsc::channel();
        inner.subscribers.push((source.table.clone(), tx));
        inner.total_subscribes += 1;
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSubscription {
            rx,
            open: self.open.clone(),
        }))
    }

    fn load_all(&self, source: &FeedSource) -> Result<Vec<Value>, TransportError> {
        let mut inner = self.lock();
        inner.loads += 1;
        if inner.unavailable {
            return Err(TransportError::new("upstream unavailable"));
        }
        if inner.fail_loads > 0 {
            inner.fail_loads -= 1;
            return Err(TransportError::new("bulk query failed"));
        }
        let mut rows: Vec<Value> = inner
            .tables
            .get(&source.table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|row| {
            row.get("start_time")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        Ok(rows)
    }
}

struct FakeSubscription {
    rx: Receiver<RawChange>,
    open: Arc<AtomicUsize>,
}

impl Subscription for FakeSubscription {
    fn next_change(&mut self, wait: Duration) -> Result<Option<RawChange>, TransportError> {
        match self.rx.recv_timeout(wait) {
            Ok(change) => Ok(Some(change)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::new("connection closed")),
        }
    }
}

impl Drop for FakeSubscription {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Team directory backed by a map. Records every batch it is asked for.
#[derive(Default)]
pub struct FakeLookup {
    teams: Mutex<HashMap<TeamId, TeamInfo>>,
    batches: Mutex<Vec<Vec<TeamId>>>,
    failing: AtomicBool,
}

impl FakeLookup {
    pub fn new(teams: impl IntoIterator<Item = (TeamId, TeamInfo)>) -> Self {
        Self {
            teams: Mutex::new(teams.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn insert(&self, id: TeamId, info: TeamInfo) {
        lock(&self.teams).insert(id, info);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        lock(&self.batches).len()
    }

    pub fn batches(&self) -> Vec<Vec<TeamId>> {
        lock(&self.batches).clone()
    }
}

impl TeamLookup for FakeLookup {
    fn lookup(&self, ids: &[TeamId]) -> Result<HashMap<TeamId, TeamInfo>, SyncError> {
        lock(&self.batches).push(ids.to_vec());
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Enrichment("team directory unavailable".to_string()));
        }
        let teams = lock(&self.teams);
        Ok(ids
            .iter()
            .filter_map(|id| teams.get(id).map(|info| (*id, info.clone())))
            .collect())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn merge_object(target: &mut Value, patch: &Value) {
    if let (Some(target), Some(patch)) = (target.as_object_mut(), patch.as_object()) {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
}

pub fn demo_teams() -> Vec<(TeamId, TeamInfo)> {
    [
        (1, "Arsenal", "arsenal"),
        (2, "Chelsea", "chelsea"),
        (3, "Liverpool", "liverpool"),
        (4, "Everton", "everton"),
        (5, "Brighton", "brighton"),
        (6, "Fulham", "fulham"),
        (7, "Brentford", "brentford"),
        (8, "Wolves", "wolves"),
        (9, "Newcastle", "newcastle"),
        (10, "Aston Villa", "aston-villa"),
    ]
    .into_iter()
    .map(|(id, name, slug)| {
        (
            id,
            TeamInfo {
                name: Some(name.to_string()),
                logo: Some(format!("/logos/{slug}.png")),
            },
        )
    })
    .collect()
}

/// A small matchday around `now`: a couple of finished and live matches and
/// the rest scheduled over the next two days. Team names are left out so
/// they go through the lookup path.
pub fn demo_rows(now: DateTime<Utc>) -> Vec<Value> {
    let at = |minutes: i64| (now + ChronoDuration::minutes(minutes)).to_rfc3339();
    vec![
        json!({"id": 101, "home_team_id": 1, "away_team_id": 2, "start_time": at(-150),
               "status": "FT", "home_score": 2, "away_score": 1, "finished_at": at(-45),
               "league_name": "Premier League", "round_name": "Matchday 3"}),
        json!({"id": 102, "home_team_id": 3, "away_team_id": 4, "start_time": at(-30),
               "status": "LIVE", "minute": 30, "home_score": 0, "away_score": 0,
               "league_name": "Premier League", "round_name": "Matchday 3"}),
        json!({"id": 103, "home_team_id": 5, "away_team_id": 6, "start_time": at(-50),
               "status": "HT", "minute": 45, "home_score": 1, "away_score": 1,
               "league_name": "Premier League", "round_name": "Matchday 3"}),
        json!({"id": 104, "home_team_id": 7, "away_team_id": 8, "start_time": at(5),
               "status": "NS", "league_name": "Premier League", "round_name": "Matchday 3"}),
        json!({"id": 105, "home_team_id": 9, "away_team_id": 10, "start_time": at(120),
               "status": "NS", "league_name": "Premier League", "round_name": "Matchday 3"}),
        json!({"id": 106, "home_team_id": 2, "away_team_id": 3, "start_time": at(24 * 60),
               "status": "NS", "league_name": "Premier League", "round_name": "Matchday 4"}),
        json!({"id": 107, "home_team_id": 4, "away_team_id": 1, "start_time": at(26 * 60),
               "status": "NS", "league_name": "Premier League", "round_name": "Matchday 4"}),
    ]
}

/// Advances one random unfinished match by a small step and pushes the
/// result as an update. Returns the pushed change, if any.
pub fn demo_step(transport: &FakeTransport, table: &str, rng: &mut impl Rng) -> Option<RawChange> {
    let open: Vec<Value> = transport
        .rows(table)
        .into_iter()
        .filter(|row| row.get("status").and_then(Value::as_str) != Some("FT"))
        .collect();
    if open.is_empty() {
        return None;
    }
    let mut row = open[rng.gen_range(0..open.len())].clone();
    let now = Utc::now();
    let status = row.get("status").and_then(Value::as_str).unwrap_or("NS").to_string();
    let minute = row.get("minute").and_then(Value::as_u64).unwrap_or(0);

    match status.as_str() {
        "NS" => {
            if !rng.gen_bool(0.3) {
                return None;
            }
            row["status"] = json!("LIVE");
            row["minute"] = json!(1);
            row["home_score"] = json!(0);
            row["away_score"] = json!(0);
        }
        "HT" => {
            row["status"] = json!("LIVE");
            row["minute"] = json!(46);
        }
        _ => {
            let next = minute + rng.gen_range(1..4);
            if rng.gen_bool(0.15) {
                let side = if rng.gen_bool(0.5) { "home_score" } else { "away_score" };
                let goals = row.get(side).and_then(Value::as_u64).unwrap_or(0);
                row[side] = json!(goals + 1);
            }
            if minute < 45 && next >= 45 {
                row["status"] = json!("HT");
                row["minute"] = json!(45);
            } else if next >= 90 {
                row["status"] = json!("FT");
                row["minute"] = Value::Null;
                row["finished_at"] = json!(now.to_rfc3339());
            } else {
                row["minute"] = json!(next);
            }
        }
    }
    row["updated_at"] = json!(now.to_rfc3339());
    let change = RawChange::update(table, row);
    transport.push(change.clone());
    Some(change)
}

/// Runs `demo_step` every `interval`, forever or for `ticks` steps.
pub fn spawn_demo_driver(
    transport: FakeTransport,
    table: String,
    interval: Duration,
    ticks: Option<u64>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut rng = rand::thread_rng();
        let mut done = 0;
        while ticks.is_none_or(|limit| done < limit) {
            thread::sleep(interval);
            demo_step(&transport, &table, &mut rng);
            done += 1;
        }
    })
}
