//! Error types for the sync bridge.
//!
//! The taxonomy mirrors the failure domains of the engine: local store
//! failures, remote transport failures (classified for log clarity only),
//! malformed remote responses, and the duplicate-record skip condition.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type SyncResult<T> = Result<T, SyncError>;

/// A classified transport failure.
///
/// Classification exists purely so the log reads well; callers treat every
/// variant identically (log it and skip the current cycle).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("host unreachable")]
    HostUnreachable,

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Map a `reqwest` failure onto the transport taxonomy.
    pub fn classify(url: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::HostUnreachable
        } else {
            TransportError::Other(format!("network error communicating with {url}: {err}"))
        }
    }
}

/// Top-level error for every sync operation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Query or command failure in the local store.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A remote response or acknowledgment with an unexpected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Dedup hit: the record already exists locally. A skip condition,
    /// not a true failure.
    #[error("record '{0}' already exists")]
    Duplicate(String),
}

impl SyncError {
    /// True when the error is the duplicate-record skip condition.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, SyncError::Duplicate(_))
    }
}
