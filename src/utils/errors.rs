use thiserror::Error;

/// Marker error for cooperative cancellation. Long waits return this when
/// their cancellation token fires; it is never a network-class error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Returned by the throttler when a retried call ran out of attempts.
/// The connection gate classifies this as a network-class failure.
#[derive(Debug, Clone, Copy, Error)]
#[error("retry limit exhausted after {attempts} attempts")]
pub struct RetryExhausted {
    pub attempts: u32,
}

/// Marker wrapped around transport errors that mean the session itself is
/// unusable (socket closed, engine shut down, dead pool connection).
#[derive(Debug, Clone, Error)]
#[error("network connection lost: {0}")]
pub struct NetworkLost(pub String);

#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("file system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("schedule error: {0}")]
    Schedule(String),

    #[error("filter config error: {0}")]
    Filter(String),
}
