//! FerrumRepl - replication data plane for a document database node
//!
//! Oplog entries flow from a sync source into a buffer, are applied in
//! parallel by a fixed pool of writers and are exposed to committed-level
//! readers once durable:
//! - `ingestion` fetches from the sync source and reports progress back
//! - `applier` routes entries by conflict key and applies batches
//! - `coordinator` tracks applied / durable positions and committed snapshots
//! - `manager` owns the threads and the mode transitions

pub mod applier;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ingestion;
pub mod manager;
pub mod oplog;
pub mod persistence;
pub mod storage;
pub mod web;

#[cfg(test)]
mod test_support;

/// Re-export commonly used types
pub use config::ReplSettings;
pub use coordinator::{CommittedSnapshot, SnapshotCoordinator, Watermarks};
pub use error::{ReplError, ReplResult};
pub use ingestion::{HostAndPort, InMemorySyncSource, SyncSource};
pub use manager::{LifecycleState, ReplicationManager, ReplicationMode, ReplicationStatus};
pub use oplog::{OpTime, OplogBuffer, OplogEntry};
pub use storage::{MemoryStorage, MemoryStorageConfig, StorageEngine};
