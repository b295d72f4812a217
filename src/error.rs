use thiserror::Error;

/// The upstream subscription could not be opened, or it dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(err: anyhow::Error) -> Self {
        Self(format!("{err:#}"))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Team lookup failed: {0}")]
    Enrichment(String),
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
    #[error("Bulk load failed: {0}")]
    BulkLoad(String),
}
