//! Error types for stream-harvest
//!
//! The taxonomy mirrors how failures are handled by the collection engine:
//! - [`FetchError`] is what a fetch capability reports (throttled or transport failure)
//! - [`StorageError`] is what the storage collaborator reports
//! - [`CollectionError`] is what a caller of `Collector::collect` ever sees; recoverable
//!   conditions are absorbed by the engine and never surface here
//! - [`Error`] is the crate-wide error for everything else (database, config, I/O)

use crate::types::TargetId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for stream-harvest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for stream-harvest
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "collection.page_size")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Fetch capability failure that escaped the engine's recovery
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Storage collaborator failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// No usable route and direct connections are not allowed
    #[error("route pool exhausted: {0}")]
    PoolExhausted(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error (route lists fetched over HTTP)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Requested record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Failure reported by a fetch capability (batch or media)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The remote service is rate-limiting us
    ///
    /// `retry_after` is the remote-mandated wait; when present it is authoritative.
    #[error("throttled (retry after {retry_after:?})")]
    Throttled {
        /// Remote-specified wait before the next request, if any
        retry_after: Option<Duration>,
    },

    /// Connection or protocol failure
    #[error("transport error ({}): {message}", transport_kind(.retryable))]
    Transport {
        /// Whether another attempt (possibly over another route) may succeed
        retryable: bool,
        /// Description of the failure
        message: String,
    },
}

impl FetchError {
    /// Shorthand for a throttle signal
    pub fn throttled(retry_after: Option<Duration>) -> Self {
        FetchError::Throttled { retry_after }
    }

    /// Shorthand for a retryable transport failure
    pub fn retryable(message: impl Into<String>) -> Self {
        FetchError::Transport {
            retryable: true,
            message: message.into(),
        }
    }

    /// Shorthand for a fatal transport failure (e.g. target no longer accessible)
    pub fn fatal(message: impl Into<String>) -> Self {
        FetchError::Transport {
            retryable: false,
            message: message.into(),
        }
    }
}

fn transport_kind(retryable: &bool) -> &'static str {
    if *retryable { "retryable" } else { "fatal" }
}

/// Failure reported by the storage collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StorageError {
    /// Description of the failure
    pub message: String,
}

impl StorageError {
    /// Create a storage error from any message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<Error> for StorageError {
    fn from(e: Error) -> Self {
        StorageError::new(e.to_string())
    }
}

/// Failure surfaced to the caller of a collection
///
/// Every variant carries the target and the last checkpoint that was durably
/// committed before the failure, so the caller knows where the next run resumes.
#[derive(Debug, Error)]
pub enum CollectionError {
    /// The fetch capability reported a non-retryable failure
    #[error("collection of {target} aborted: {reason} (last checkpoint {last_checkpoint:?})")]
    Fatal {
        /// Target whose collection was aborted
        target: TargetId,
        /// Last committed item id, if any
        last_checkpoint: Option<i64>,
        /// Failure description
        reason: String,
    },

    /// Retryable transport failures exceeded the configured budget
    #[error("collection of {target} gave up after {attempts} transport failures: {reason}")]
    RetriesExhausted {
        /// Target whose collection was aborted
        target: TargetId,
        /// Last committed item id, if any
        last_checkpoint: Option<i64>,
        /// Number of failed attempts on the current page
        attempts: u32,
        /// Last failure description
        reason: String,
    },

    /// Persisting a page failed; the checkpoint was not advanced
    #[error("storage failure for {target}: {source} (last checkpoint {last_checkpoint:?})")]
    Storage {
        /// Target whose page could not be stored
        target: TargetId,
        /// Last committed item id, if any
        last_checkpoint: Option<i64>,
        /// Underlying storage failure
        #[source]
        source: StorageError,
    },

    /// Checkpoint store or continuity ledger could not be written
    #[error("state persistence failure for {target}: {source}")]
    State {
        /// Target whose state could not be written
        target: TargetId,
        /// Last committed item id, if any
        last_checkpoint: Option<i64>,
        /// Underlying database failure
        #[source]
        source: Error,
    },

    /// No usable route and the policy forbids direct connections
    #[error("no usable route for {target} and direct connections are disabled")]
    PoolExhausted {
        /// Target that could not be collected
        target: TargetId,
        /// Last committed item id, if any
        last_checkpoint: Option<i64>,
    },
}

impl CollectionError {
    /// Target the failure belongs to
    pub fn target(&self) -> &TargetId {
        match self {
            CollectionError::Fatal { target, .. }
            | CollectionError::RetriesExhausted { target, .. }
            | CollectionError::Storage { target, .. }
            | CollectionError::State { target, .. }
            | CollectionError::PoolExhausted { target, .. } => target,
        }
    }

    /// Last committed checkpoint at the time of failure
    pub fn last_checkpoint(&self) -> Option<i64> {
        match self {
            CollectionError::Fatal {
                last_checkpoint, ..
            }
            | CollectionError::RetriesExhausted {
                last_checkpoint, ..
            }
            | CollectionError::Storage {
                last_checkpoint, ..
            }
            | CollectionError::State {
                last_checkpoint, ..
            }
            | CollectionError::PoolExhausted {
                last_checkpoint, ..
            } => *last_checkpoint,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display_mentions_kind() {
        assert_eq!(
            FetchError::retryable("connection reset").to_string(),
            "transport error (retryable): connection reset"
        );
        assert_eq!(
            FetchError::fatal("channel is private").to_string(),
            "transport error (fatal): channel is private"
        );
    }

    #[test]
    fn test_collection_error_accessors() {
        let err = CollectionError::Fatal {
            target: TargetId::from("news"),
            last_checkpoint: Some(42),
            reason: "gone".into(),
        };
        assert_eq!(err.target().as_str(), "news");
        assert_eq!(err.last_checkpoint(), Some(42));

        let err = CollectionError::PoolExhausted {
            target: TargetId::from("news"),
            last_checkpoint: None,
        };
        assert_eq!(err.last_checkpoint(), None);
        assert!(err.to_string().contains("direct connections are disabled"));
    }

    #[test]
    fn test_storage_error_from_crate_error() {
        let err: StorageError = Error::Other("disk full".into()).into();
        assert_eq!(err.message, "disk full");
    }
}
