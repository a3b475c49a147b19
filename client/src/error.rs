//! Error types for the settings sync runtime.

use std::time::Duration;

/// A failed exchange with the remote authority.
///
/// Never fatal: the instance goes offline and retries on the next trigger.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("exchange timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote authority returned status {0}")]
    Status(u16),

    #[error("remote authority unavailable: {0}")]
    Unavailable(String),
}

/// A failed read or write of durable local storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Encoding(#[from] tally_engine::Error),
}

/// Errors returned to callers of a settings handle.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The change was rejected and never entered the pending set
    #[error(transparent)]
    Validation(#[from] tally_engine::Error),

    #[error("settings instance has shut down")]
    Closed,
}

/// Result type alias for handle operations.
pub type Result<T> = std::result::Result<T, SyncError>;
