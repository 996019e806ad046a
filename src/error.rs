//! Crate-level error type
//!
//! Component errors (storage, fetch, buffer) convert into `ReplError` so the
//! manager and the binary only deal with one type.

use crate::ingestion::FetchError;
use crate::oplog::{BufferError, OpTime};
use crate::storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the replication layer
#[derive(Debug, Error)]
pub enum ReplError {
    /// Storage preconditions for replication are not met
    #[error("storage is not initialized: {0}")]
    StorageNotInitialized(String),

    /// A lifecycle call was made in a state that does not allow it
    #[error("illegal lifecycle transition: {0}")]
    IllegalState(String),

    /// A batch could not be applied
    #[error("failed to apply batch starting at {start}: {source}")]
    ApplyFailed {
        start: OpTime,
        #[source]
        source: StorageError,
    },

    /// Initial sync gave up
    #[error("initial sync failed after {attempts} attempt(s): {reason}")]
    InitialSyncFailed { attempts: u32, reason: String },

    /// The owning subsystem is shutting down
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// Committed reads are not supported by the storage engine
    #[error("committed reads are not supported by the storage engine")]
    SnapshotsNotSupported,

    /// No committed snapshot is currently available
    #[error("no committed snapshot available")]
    SnapshotUnavailable,

    /// Invalid settings
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReplError {
    /// Whether the error stops the affected subsystem for good
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplError::StorageNotInitialized(_)
                | ReplError::ApplyFailed { .. }
                | ReplError::InitialSyncFailed { .. }
        )
    }
}

/// Result alias for replication operations
pub type ReplResult<T> = Result<T, ReplError>;
