use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::error::{SyncError, TransportError};
use crate::feed::FeedSource;
use crate::state::{TeamId, TeamInfo};
use crate::wire::RawChange;

/// Upstream side of a feed: a change subscription plus the bulk query used
/// for the initial load and for resync after a reconnect.
pub trait ChangeFeedTransport: Send + Sync {
    fn subscribe(&self, source: &FeedSource) -> Result<Box<dyn Subscription>, TransportError>;

    /// All current rows for the feed, ordered by `start_time` ascending.
    fn load_all(&self, source: &FeedSource) -> Result<Vec<Value>, TransportError>;
}

/// An open upstream subscription. Dropping it releases the upstream side.
pub trait Subscription: Send {
    /// Waits up to `wait` for the next change. `Ok(None)` means nothing arrived
    /// in time; `Err` means the subscription is dead and must be reopened.
    fn next_change(&mut self, wait: Duration) -> Result<Option<RawChange>, TransportError>;
}

/// Batched team lookup. Ids with no match are simply absent from the result.
pub trait TeamLookup: Send + Sync {
    fn lookup(&self, ids: &[TeamId]) -> Result<HashMap<TeamId, TeamInfo>, SyncError>;
}
