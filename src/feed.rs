use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::FixedOffset;

use crate::state::FeedPhase;
use crate::store::EntityStore;
use crate::view::{Reference, ViewEngine, ViewSpec};

const MAX_LOGS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    Fixtures,
    Livescores,
}

impl FeedKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fixtures" | "schedule" => Some(FeedKind::Fixtures),
            "livescores" | "live" => Some(FeedKind::Livescores),
            _ => None,
        }
    }

    /// Views every consumer of this feed gets without registering them.
    pub fn default_views(self, finished_limit: usize) -> Vec<(&'static str, ViewSpec)> {
        match self {
            FeedKind::Fixtures => vec![
                ("today", ViewSpec::today()),
                ("tomorrow", ViewSpec::tomorrow()),
                ("upcoming", ViewSpec::upcoming()),
            ],
            FeedKind::Livescores => vec![
                ("scheduled", ViewSpec::scheduled()),
                ("live", ViewSpec::live()),
                ("finished", ViewSpec::finished(finished_limit)),
            ],
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedKind::Fixtures => write!(f, "fixtures"),
            FeedKind::Livescores => write!(f, "livescores"),
        }
    }
}

/// Where a feed's rows live upstream and how to read them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSource {
    pub kind: FeedKind,
    pub table: String,
    pub select: String,
    pub default_season_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Pending,
    Loaded,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct FeedHealth {
    pub phase: FeedPhase,
    /// Set while the upstream is unreachable and the store shows the last
    /// known snapshot.
    pub stale: bool,
    pub load: LoadState,
    pub reconnects: u64,
    pub dropped_events: u64,
    pub last_error: Option<String>,
    pub logs: VecDeque<String>,
    connected_once: bool,
}

impl Default for FeedHealth {
    fn default() -> Self {
        Self {
            phase: FeedPhase::Disconnected,
            stale: false,
            load: LoadState::Pending,
            reconnects: 0,
            dropped_events: 0,
            last_error: None,
            logs: VecDeque::new(),
            connected_once: false,
        }
    }
}

impl FeedHealth {
    pub fn is_degraded(&self) -> bool {
        self.stale || matches!(self.load, LoadState::Failed(_))
    }

    pub fn push_log(&mut self, msg: impl Into<String>) {
        self.logs.push_back(msg.into());
        while self.logs.len() > MAX_LOGS {
            self.logs.pop_front();
        }
    }

    pub(crate) fn enter_phase(&mut self, phase: FeedPhase, error: Option<String>) {
        if phase == FeedPhase::Connecting && self.connected_once {
            self.reconnects += 1;
        }
        if phase == FeedPhase::Subscribed {
            self.connected_once = true;
        }
        if let Some(err) = error {
            self.stale = true;
            self.push_log(format!("[WARN] Subscription error: {err}"));
            self.last_error = Some(err);
        }
        self.phase = phase;
    }
}

/// Coalescing change signal. Each subscriber holds a one-slot queue; when the
/// slot is already full the newer revision is dropped, since the reader will
/// see the current state anyway.
#[derive(Debug, Default)]
pub struct Notifier {
    subscribers: Mutex<Vec<SyncSender<u64>>>,
}

impl Notifier {
    pub fn subscribe(&self) -> Receiver<u64> {
        let (tx, rx) = sync_channel(1);
        lock(&self.subscribers).push(tx);
        rx
    }

    pub fn notify(&self, revision: u64) {
        lock(&self.subscribers).retain(|tx| match tx.try_send(revision) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

/// State owned by one feed and shared between its ingest loop and consumers.
/// Only the ingest loop writes the store.
#[derive(Debug)]
pub struct FeedShared {
    pub kind: FeedKind,
    store: RwLock<EntityStore>,
    views: ViewEngine,
    health: Mutex<FeedHealth>,
    notifier: Notifier,
    revision: AtomicU64,
    utc_offset: FixedOffset,
}

impl FeedShared {
    pub fn new(kind: FeedKind, utc_offset: FixedOffset) -> Self {
        Self {
            kind,
            store: RwLock::new(EntityStore::new()),
            views: ViewEngine::new(),
            health: Mutex::new(FeedHealth::default()),
            notifier: Notifier::default(),
            revision: AtomicU64::new(0),
            utc_offset,
        }
    }

    pub fn with_default_views(kind: FeedKind, utc_offset: FixedOffset, finished_limit: usize) -> Self {
        let shared = Self::new(kind, utc_offset);
        for (name, spec) in kind.default_views(finished_limit) {
            shared.views.register(name, spec);
        }
        shared
    }

    pub fn store(&self) -> RwLockReadGuard<'_, EntityStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn store_mut(&self) -> RwLockWriteGuard<'_, EntityStore> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn views(&self) -> &ViewEngine {
        &self.views
    }

    pub fn health(&self) -> FeedHealth {
        lock(&self.health).clone()
    }

    pub(crate) fn health_mut(&self) -> MutexGuard<'_, FeedHealth> {
        lock(&self.health)
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn reference(&self) -> Reference {
        Reference::now(self.utc_offset)
    }

    /// Recomputes registered views from the current store and signals
    /// consumers once.
    pub fn publish(&self) -> u64 {
        self.publish_at(&self.reference())
    }

    pub fn publish_at(&self, reference: &Reference) -> u64 {
        {
            let store = self.store();
            self.views.refresh(&store, reference);
        }
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        self.notifier.notify(revision);
        revision
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
