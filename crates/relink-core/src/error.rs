use thiserror::Error;

/// Failure surfaced by an external API collaborator.
///
/// The collaborator owns rate-limit pacing and retry/backoff, so by the time
/// a `Transient` error reaches the engine the retry budget is already spent.
/// The engine treats both variants as "abandon this document for the run".
#[derive(Debug, Error)]
pub enum ApiError {
    /// Timeouts, rate limiting, 5xx. Retryable by the collaborator.
    #[error("transient API failure: {0}")]
    Transient(String),
    /// Not-found, permission denied. Retrying will not help.
    #[error("permanent API failure: {0}")]
    Permanent(String),
}

impl ApiError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ApiError::Permanent(_))
    }
}

/// Failure building or persisting the canonical registry.
///
/// An incomplete first enumeration pass is the only fatal condition in the
/// whole system: with no registry there is nothing to resolve against.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("initial directory listing failed before any entries were collected")]
    InitialListing(#[source] ApiError),
    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry serialization: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure loading or persisting the durable queue files.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue io: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue serialization: {0}")]
    Json(#[from] serde_json::Error),
}
