//! Storage contract used by the replication layer
//!
//! The replication core only needs a narrow slice of the storage engine:
//! applying single entries, admitting writes for durability tracking, and
//! managing named point-in-time snapshots. `MemoryStorage` is the in-process
//! engine used by the binary and the tests.

mod journal;
mod memory;

pub use journal::{read_journal, Journal, JournalRecord, JournalWriter, SyncPolicy};
pub use memory::{MemoryStorage, MemoryStorageConfig};

use crate::oplog::{CodecError, OpTime, OplogEntry};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Correlation handle issued when a write is admitted; echoed back once durable.
/// Strictly increasing for the lifetime of a storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct JournalToken(pub u64);

/// Identifier of a point-in-time snapshot; assigned in increasing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SnapshotName(pub u64);

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot-{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("document {id} not found in {namespace}")]
    MissingDocument { namespace: String, id: String },

    #[error("entry at {0} has no _id")]
    MissingId(OpTime),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("storage engine does not support snapshots")]
    SnapshotsUnsupported,

    #[error("{0} does not exist")]
    SnapshotNotFound(SnapshotName),

    #[error("storage engine is not initialized")]
    NotInitialized,

    #[error("journal i/o error: {0}")]
    Journal(#[from] std::io::Error),

    #[error("journal record error: {0}")]
    Codec(#[from] CodecError),
}

impl StorageError {
    /// A write referenced a document that does not exist locally
    pub fn is_missing_document(&self) -> bool {
        matches!(self, StorageError::MissingDocument { .. })
    }
}

/// Receives durability confirmations from the storage engine
pub trait DurabilityListener: Send + Sync {
    /// Every write admitted with a token `<= token` is now durable
    fn on_durable(&self, token: JournalToken);
}

/// Operations the replication layer consumes from storage
pub trait StorageEngine: Send + Sync {
    /// Whether the engine is open and able to accept replicated writes
    fn is_initialized(&self) -> bool;

    /// Apply one entry; called concurrently from writer threads
    fn apply_one(&self, entry: &OplogEntry) -> Result<(), StorageError>;

    /// Admit the writes applied through `op_time` for durability tracking
    fn admit_write(&self, op_time: OpTime) -> JournalToken;

    /// Register the single durability listener
    fn set_durability_listener(&self, listener: Arc<dyn DurabilityListener>);

    fn supports_snapshots(&self) -> bool;

    /// Freeze the current state under `name`
    fn create_snapshot(&self, name: SnapshotName) -> Result<(), StorageError>;

    fn drop_snapshot(&self, name: SnapshotName);

    fn drop_all_snapshots(&self);

    /// Read the latest state of a document
    fn find(&self, namespace: &str, id: &Value) -> Option<Value>;

    /// Read a document as of a snapshot
    fn find_at(&self, snapshot: SnapshotName, namespace: &str, id: &Value) -> Result<Option<Value>, StorageError>;

    /// Last batch end recorded by the applier (survives restarts)
    fn applied_through(&self) -> Option<OpTime>;

    fn set_applied_through(&self, op_time: OpTime) -> Result<(), StorageError>;

    /// Discard all replicated data (initial sync restart)
    fn reset(&self) -> Result<(), StorageError>;
}
