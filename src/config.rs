//! Replication settings
//!
//! Loaded from an optional JSON file; every field has a default so a partial
//! file (or none at all) is valid.

use crate::error::{ReplError, ReplResult};
use crate::oplog::{BatchLimits, BufferLimits};
use crate::storage::SyncPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings passed to `ReplicationManager::start_threads`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplSettings {
    /// Size of the parallel apply pool
    pub writer_threads: usize,

    /// Maximum entries per apply batch
    pub batch_max_entries: usize,
    /// Maximum bytes per apply batch
    pub batch_max_bytes: usize,

    pub steady_state_buffer_max_entries: usize,
    pub steady_state_buffer_max_bytes: usize,

    /// Entries kept in memory by the initial-sync buffer before spilling
    pub initial_sync_buffer_memory_entries: usize,
    /// Spill file for the initial-sync buffer (unbounded memory if unset)
    pub initial_sync_spill_path: Option<PathBuf>,

    pub fetch_batch_max_entries: usize,
    pub fetch_timeout_ms: u64,
    pub fetch_poll_interval_ms: u64,
    pub fetch_backoff_initial_ms: u64,
    pub fetch_backoff_max_ms: u64,
    /// Consecutive fetch failures before the sync source is reselected
    pub fetch_failures_before_reselect: u32,

    pub snapshot_interval_ms: u64,
    pub feedback_interval_ms: u64,

    pub initial_sync_max_attempts: u32,
    /// Deferred retry rounds for entries referencing missing documents
    pub initial_sync_missing_doc_retries: u32,

    pub journal_path: Option<PathBuf>,
    pub journal_sync_policy: SyncPolicy,
    pub journal_commit_interval_ms: u64,

    pub admin_addr: String,
    pub data_dir: PathBuf,
}

impl Default for ReplSettings {
    fn default() -> Self {
        ReplSettings {
            writer_threads: num_cpus::get().clamp(1, 16),
            batch_max_entries: 5000,
            batch_max_bytes: 64 * 1024 * 1024,
            steady_state_buffer_max_entries: 10_000,
            steady_state_buffer_max_bytes: 256 * 1024 * 1024,
            initial_sync_buffer_memory_entries: 10_000,
            initial_sync_spill_path: None,
            fetch_batch_max_entries: 1000,
            fetch_timeout_ms: 5000,
            fetch_poll_interval_ms: 50,
            fetch_backoff_initial_ms: 50,
            fetch_backoff_max_ms: 5000,
            fetch_failures_before_reselect: 3,
            snapshot_interval_ms: 100,
            feedback_interval_ms: 500,
            initial_sync_max_attempts: 10,
            initial_sync_missing_doc_retries: 3,
            journal_path: None,
            journal_sync_policy: SyncPolicy::Interval,
            journal_commit_interval_ms: 100,
            admin_addr: "127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("ferrumrepl-data"),
        }
    }
}

impl ReplSettings {
    /// Load settings from a JSON file and validate them
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ReplResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: ReplSettings = serde_json::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> ReplResult<()> {
        if self.writer_threads == 0 {
            return Err(ReplError::Config("writer_threads must be > 0".into()));
        }
        if self.batch_max_entries == 0 || self.batch_max_bytes == 0 {
            return Err(ReplError::Config("batch limits must be > 0".into()));
        }
        if self.steady_state_buffer_max_entries == 0 || self.steady_state_buffer_max_bytes == 0 {
            return Err(ReplError::Config("steady-state buffer capacity must be > 0".into()));
        }
        if self.initial_sync_buffer_memory_entries == 0 {
            return Err(ReplError::Config(
                "initial_sync_buffer_memory_entries must be > 0".into(),
            ));
        }
        if self.fetch_batch_max_entries == 0 {
            return Err(ReplError::Config("fetch_batch_max_entries must be > 0".into()));
        }
        if self.initial_sync_max_attempts == 0 {
            return Err(ReplError::Config("initial_sync_max_attempts must be > 0".into()));
        }
        Ok(())
    }

    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_entries: self.batch_max_entries,
            max_bytes: self.batch_max_bytes,
        }
    }

    pub fn steady_state_buffer_limits(&self) -> BufferLimits {
        BufferLimits {
            max_entries: self.steady_state_buffer_max_entries,
            max_bytes: self.steady_state_buffer_max_bytes,
        }
    }

    pub fn initial_sync_buffer_limits(&self) -> BufferLimits {
        BufferLimits {
            max_entries: self.initial_sync_buffer_memory_entries,
            max_bytes: usize::MAX,
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn fetch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_poll_interval_ms)
    }

    pub fn fetch_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_initial_ms)
    }

    pub fn fetch_backoff_max(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_max_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn feedback_interval(&self) -> Duration {
        Duration::from_millis(self.feedback_interval_ms)
    }

    pub fn journal_commit_interval(&self) -> Duration {
        Duration::from_millis(self.journal_commit_interval_ms)
    }
}
