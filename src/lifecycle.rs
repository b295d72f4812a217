use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};
use rand::Rng;

use crate::config::SyncConfig;
use crate::enrich::EnrichmentResolver;
use crate::feed::{FeedHealth, FeedKind, FeedShared, FeedSource};
use crate::ingest::ChangeIngestor;
use crate::state::{Delta, FeedPhase, MatchId, MatchRecord};
use crate::transport::{ChangeFeedTransport, TeamLookup};
use crate::view::{ViewSpec, project};

const SUBSCRIPTION_WAIT: Duration = Duration::from_millis(100);
const STOP_CHECK: Duration = Duration::from_millis(25);

/// Owns the upstream subscriptions for every feed. A feed's subscription is
/// opened when its first consumer attaches and released when the last one
/// detaches; the feed's store outlives both so a re-attach starts from the
/// last known snapshot.
#[derive(Clone)]
pub struct SyncHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: SyncConfig,
    transport: Arc<dyn ChangeFeedTransport>,
    lookup: Arc<dyn TeamLookup>,
    feeds: Mutex<HashMap<FeedKind, FeedSlot>>,
}

struct FeedSlot {
    shared: Arc<FeedShared>,
    consumers: usize,
    worker: Option<FeedWorker>,
}

impl SyncHub {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn ChangeFeedTransport>,
        lookup: Arc<dyn TeamLookup>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                transport,
                lookup,
                feeds: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn attach(&self, kind: FeedKind) -> FeedConsumer {
        let inner = &self.inner;
        let mut feeds = inner.feeds();
        let slot = feeds.entry(kind).or_insert_with(|| FeedSlot {
            shared: Arc::new(FeedShared::with_default_views(
                kind,
                inner.config.utc_offset,
                inner.config.finished_limit,
            )),
            consumers: 0,
            worker: None,
        });
        slot.consumers += 1;
        let shared = slot.shared.clone();
        let changes = shared.notifier().subscribe();
        if slot.worker.is_none() {
            info!("{kind}: first consumer attached, opening subscription");
            slot.worker = Some(FeedWorker::spawn(inner, shared.clone()));
        }
        FeedConsumer {
            hub: self.inner.clone(),
            kind,
            shared,
            changes,
            attached: true,
        }
    }

    pub fn consumer_count(&self, kind: FeedKind) -> usize {
        self.inner
            .feeds()
            .get(&kind)
            .map(|slot| slot.consumers)
            .unwrap_or(0)
    }

    pub fn is_running(&self, kind: FeedKind) -> bool {
        self.inner
            .feeds()
            .get(&kind)
            .is_some_and(|slot| slot.worker.is_some())
    }

    /// Stops every running feed regardless of attached consumers. Consumers
    /// keep read access to the last snapshot.
    pub fn shutdown(&self) {
        let mut feeds = self.inner.feeds();
        for (kind, slot) in feeds.iter_mut() {
            if let Some(worker) = slot.worker.take() {
                info!("{kind}: shutting down");
                worker.stop(&slot.shared);
            }
        }
    }
}

impl HubInner {
    fn feeds(&self) -> MutexGuard<'_, HashMap<FeedKind, FeedSlot>> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn detach(&self, kind: FeedKind) {
        // The worker is stopped under the lock so a concurrent attach cannot
        // race a half-stopped worker for the same feed.
        let mut feeds = self.feeds();
        let Some(slot) = feeds.get_mut(&kind) else {
            return;
        };
        slot.consumers = slot.consumers.saturating_sub(1);
        if slot.consumers == 0
            && let Some(worker) = slot.worker.take()
        {
            info!("{kind}: last consumer detached, releasing subscription");
            worker.stop(&slot.shared);
        }
    }

    fn send(&self, kind: FeedKind, delta: Delta) -> bool {
        self.feeds()
            .get(&kind)
            .and_then(|slot| slot.worker.as_ref())
            .is_some_and(|worker| worker.tx.send(delta).is_ok())
    }
}

/// A consumer's handle on one feed. Dropping it detaches.
pub struct FeedConsumer {
    hub: Arc<HubInner>,
    kind: FeedKind,
    shared: Arc<FeedShared>,
    changes: Receiver<u64>,
    attached: bool,
}

impl FeedConsumer {
    pub fn kind(&self) -> FeedKind {
        self.kind
    }

    /// Ad-hoc projection against the current store, evaluated "now".
    pub fn project(&self, spec: &ViewSpec) -> Vec<MatchRecord> {
        let reference = self.shared.reference();
        let store = self.shared.store();
        project(store.all(), spec, &reference)
    }

    /// Last computed rows of a registered view.
    pub fn view(&self, name: &str) -> Option<Arc<Vec<MatchRecord>>> {
        self.shared.views().get(name)
    }

    pub fn view_names(&self) -> Vec<String> {
        self.shared.views().names()
    }

    pub fn register_view(&self, name: &str, spec: ViewSpec) {
        let reference = self.shared.reference();
        let store = self.shared.store();
        self.shared
            .views()
            .register_and_compute(name, spec, &store, &reference);
    }

    pub fn get(&self, id: MatchId) -> Option<MatchRecord> {
        self.shared.store().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.store().is_empty()
    }

    pub fn health(&self) -> FeedHealth {
        self.shared.health()
    }

    pub fn revision(&self) -> u64 {
        self.shared.revision()
    }

    /// Blocks until the feed publishes a change or `timeout` passes. Bursts of
    /// changes collapse into a single wake-up.
    pub fn wait_for_change(&self, timeout: Duration) -> Option<u64> {
        match self.changes.recv_timeout(timeout) {
            Ok(revision) => Some(revision),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_change(&self) -> Option<u64> {
        self.changes.try_recv().ok()
    }

    /// Asks the feed to run its bulk load again. Returns false when the feed
    /// is not running.
    pub fn retry_load(&self) -> bool {
        self.hub.send(self.kind, Delta::Resync)
    }

    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.attached {
            self.attached = false;
            self.hub.detach(self.kind);
        }
    }
}

impl Drop for FeedConsumer {
    fn drop(&mut self) {
        self.release();
    }
}

struct FeedWorker {
    stop: Arc<AtomicBool>,
    tx: Sender<Delta>,
    ingest: JoinHandle<()>,
    subscription: JoinHandle<()>,
}

impl FeedWorker {
    fn spawn(hub: &HubInner, shared: Arc<FeedShared>) -> Self {
        let config = &hub.config;
        let source = config.source(shared.kind);
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));

        let resolver =
            EnrichmentResolver::new(hub.lookup.clone(), config.enrich_parallelism, tx.clone());
        let ingestor =
            ChangeIngestor::new(shared, source.clone(), hub.transport.clone(), resolver);
        // The bulk load does not wait for the change feed to come up.
        let _ = tx.send(Delta::Resync);
        let ingest = thread::spawn(move || ingestor.run(rx));

        let backoff = Backoff::new(config.backoff_min, config.backoff_max);
        let transport = hub.transport.clone();
        let sub_tx = tx.clone();
        let sub_stop = stop.clone();
        let subscription = thread::spawn(move || {
            run_subscription(source, transport, sub_tx, sub_stop, backoff)
        });

        Self {
            stop,
            tx,
            ingest,
            subscription,
        }
    }

    /// Releases the subscription and stops the ingest loop. Consumes the
    /// worker, so it runs at most once per subscription.
    fn stop(self, shared: &FeedShared) {
        self.stop.store(true, Ordering::SeqCst);
        if self.subscription.join().is_err() {
            warn!("{} subscription thread panicked", shared.kind);
        }
        let _ = self.tx.send(Delta::Phase {
            phase: FeedPhase::Disconnected,
            error: None,
        });
        let _ = self.tx.send(Delta::Shutdown);
        if self.ingest.join().is_err() {
            warn!("{} ingest thread panicked", shared.kind);
        }
    }
}

fn run_subscription(
    source: FeedSource,
    transport: Arc<dyn ChangeFeedTransport>,
    tx: Sender<Delta>,
    stop: Arc<AtomicBool>,
    mut backoff: Backoff,
) {
    let send_phase = |phase: FeedPhase, error| {
        let _ = tx.send(Delta::Phase { phase, error });
    };

    while !stop.load(Ordering::SeqCst) {
        send_phase(FeedPhase::Connecting, None);
        match transport.subscribe(&source) {
            Ok(mut subscription) => {
                backoff.reset();
                send_phase(FeedPhase::Subscribed, None);
                // Resync after every subscribe so nothing between the last
                // load and this subscribe is missed.
                let _ = tx.send(Delta::Resync);

                let failure = loop {
                    if stop.load(Ordering::SeqCst) {
                        break None;
                    }
                    match subscription.next_change(SUBSCRIPTION_WAIT) {
                        Ok(Some(change)) => {
                            if tx.send(Delta::Change(change)).is_err() {
                                break None;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => break Some(err),
                    }
                };
                drop(subscription);

                match failure {
                    Some(err) => {
                        warn!("{} subscription dropped: {err}", source.kind);
                        send_phase(FeedPhase::Disconnected, Some(err));
                    }
                    None => break,
                }
            }
            Err(err) => {
                warn!("{} subscribe failed: {err}", source.kind);
                send_phase(FeedPhase::Disconnected, Some(err));
            }
        }
        sleep_unless_stopped(backoff.next_delay(), &stop);
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(STOP_CHECK.min(deadline - now));
    }
}

/// Exponential reconnect delay with +/-20% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        base.mul_f64(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400));
        let delays: Vec<Duration> = (0..5).map(|_| backoff.next_delay()).collect();
        assert!(delays[0] >= Duration::from_millis(80) && delays[0] <= Duration::from_millis(120));
        assert!(delays[1] >= Duration::from_millis(160) && delays[1] <= Duration::from_millis(240));
        for delay in &delays[2..] {
            assert!(*delay <= Duration::from_millis(480));
            assert!(*delay >= Duration::from_millis(320));
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(120));
    }
}
