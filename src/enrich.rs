use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, warn};

use crate::error::SyncError;
use crate::state::{Delta, TeamId, TeamInfo};
use crate::transport::TeamLookup;

/// Resolves team display data off the ingest thread. Results come back into
/// the feed's ingest channel as `Delta::TeamsResolved`, so they are applied
/// through the same single mutation path as change events.
pub struct EnrichmentResolver {
    lookup: Arc<dyn TeamLookup>,
    pool: Option<Arc<rayon::ThreadPool>>,
    inflight: Arc<Mutex<HashSet<TeamId>>>,
    tx: Sender<Delta>,
}

impl EnrichmentResolver {
    pub fn new(lookup: Arc<dyn TeamLookup>, parallelism: usize, tx: Sender<Delta>) -> Self {
        Self {
            lookup,
            pool: build_lookup_pool(parallelism).map(Arc::new),
            inflight: Arc::new(Mutex::new(HashSet::new())),
            tx,
        }
    }

    /// Blocking best-effort lookup. Entries for ids that were not asked for
    /// are dropped.
    pub fn resolve(&self, ids: &BTreeSet<TeamId>) -> Result<HashMap<TeamId, TeamInfo>, SyncError> {
        resolve_with(self.lookup.as_ref(), ids)
    }

    /// Fire-and-forget lookup of `ids` in a single batched call. Ids that are
    /// already being looked up are skipped. Returns how many ids were sent.
    pub fn request(&self, ids: impl IntoIterator<Item = TeamId>) -> usize {
        let batch: BTreeSet<TeamId> = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            ids.into_iter().filter(|id| inflight.insert(*id)).collect()
        };
        if batch.is_empty() {
            return 0;
        }
        let count = batch.len();

        let lookup = self.lookup.clone();
        let inflight = self.inflight.clone();
        let tx = self.tx.clone();
        let job = move || {
            match resolve_with(lookup.as_ref(), &batch) {
                Ok(teams) => {
                    debug!("resolved {}/{} teams", teams.len(), batch.len());
                    if !teams.is_empty() {
                        let _ = tx.send(Delta::TeamsResolved(teams));
                    }
                }
                Err(err) => {
                    warn!("team lookup failed for {} ids: {err}", batch.len());
                    let _ = tx.send(Delta::Log(format!("[WARN] {err}")));
                }
            }
            let mut inflight = inflight.lock().unwrap_or_else(PoisonError::into_inner);
            for id in &batch {
                inflight.remove(id);
            }
        };

        if let Some(pool) = self.pool.as_ref() {
            pool.spawn(job);
        } else {
            std::thread::spawn(job);
        }
        count
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn resolve_with(
    lookup: &dyn TeamLookup,
    ids: &BTreeSet<TeamId>,
) -> Result<HashMap<TeamId, TeamInfo>, SyncError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let wanted: Vec<TeamId> = ids.iter().copied().collect();
    let mut teams = lookup.lookup(&wanted)?;
    teams.retain(|id, _| ids.contains(id));
    Ok(teams)
}

fn build_lookup_pool(threads: usize) -> Option<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.clamp(1, 16))
        .thread_name(|idx| format!("team-lookup-{idx}"))
        .build()
        .ok()
}
