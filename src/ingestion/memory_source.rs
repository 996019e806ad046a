//! In-process sync source
//!
//! Holds an oplog and the document state it produces, and answers the
//! `SyncSource` calls from them. Failures and latency can be injected.

use super::source::{FetchError, FetchOutcome, HostAndPort, ProgressUpdate, SyncSource};
use crate::oplog::{OpTime, OplogEntry};
use crate::storage::{MemoryStorage, StorageEngine, StorageError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct SourceState {
    log: Vec<OplogEntry>,
    hosts: Vec<HostAndPort>,
    next_host: usize,
    injected_failures: VecDeque<FetchError>,
    fetch_delay: Option<Duration>,
    fetch_calls: usize,
    reports: Vec<(HostAndPort, ProgressUpdate)>,
}

/// Sync source backed by memory
pub struct InMemorySyncSource {
    state: Mutex<SourceState>,
    documents: MemoryStorage,
}

impl InMemorySyncSource {
    pub fn new(hosts: Vec<HostAndPort>) -> Self {
        InMemorySyncSource {
            state: Mutex::new(SourceState {
                hosts,
                ..SourceState::default()
            }),
            documents: MemoryStorage::without_snapshots(),
        }
    }

    /// Convenience constructor from `host:port` strings; invalid entries are ignored
    pub fn with_hosts(hosts: &[&str]) -> Self {
        Self::new(hosts.iter().filter_map(|h| h.parse().ok()).collect())
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an entry to the log and apply it to the source's documents.
    /// Entries must be appended in increasing OpTime order.
    pub fn append(&self, entry: OplogEntry) -> Result<(), StorageError> {
        let mut state = self.lock();
        if let Some(last) = state.log.last() {
            if entry.op_time <= last.op_time {
                return Err(StorageError::InvalidPayload(format!(
                    "entry {} does not follow {}",
                    entry.op_time, last.op_time
                )));
            }
        }
        self.documents.apply_one(&entry)?;
        state.log.push(entry);
        Ok(())
    }

    /// Add a log entry without touching document state
    pub fn append_raw(&self, entry: OplogEntry) {
        self.lock().log.push(entry);
    }

    pub fn len(&self) -> usize {
        self.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The next `count` fetches fail with `error`
    pub fn fail_next_fetches(&self, count: usize, error: FetchError) {
        let mut state = self.lock();
        for _ in 0..count {
            state.injected_failures.push_back(error.clone());
        }
    }

    /// Every fetch waits this long before answering
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.lock().fetch_delay = delay;
    }

    pub fn fetch_calls(&self) -> usize {
        self.lock().fetch_calls
    }

    /// Progress updates received so far, oldest first
    pub fn progress_reports(&self) -> Vec<(HostAndPort, ProgressUpdate)> {
        self.lock().reports.clone()
    }
}

#[async_trait]
impl SyncSource for InMemorySyncSource {
    async fn choose_sync_source(&self, _last_fetched: OpTime) -> Option<HostAndPort> {
        let mut state = self.lock();
        if state.hosts.is_empty() {
            return None;
        }
        let idx = state.next_host % state.hosts.len();
        state.next_host += 1;
        Some(state.hosts[idx].clone())
    }

    async fn fetch_next(
        &self,
        source: &HostAndPort,
        after: OpTime,
        max_entries: usize,
    ) -> Result<FetchOutcome, FetchError> {
        let delay = {
            let mut state = self.lock();
            state.fetch_calls += 1;
            state.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(error) = state.injected_failures.pop_front() {
            return Err(error);
        }
        if !state.hosts.contains(source) {
            return Err(FetchError::SourceUnusable(format!("{} is not a member", source)));
        }

        let start = state.log.partition_point(|e| e.op_time <= after);
        let entries: Vec<OplogEntry> = state.log[start..].iter().take(max_entries).cloned().collect();
        drop(state);

        if entries.is_empty() {
            return Ok(FetchOutcome::Exhausted);
        }
        debug!("Serving {} entries after {} from {}", entries.len(), after, source);
        Ok(FetchOutcome::Batch(entries))
    }

    async fn last_op_time(&self, _source: &HostAndPort) -> Result<OpTime, FetchError> {
        Ok(self.lock().log.last().map(|e| e.op_time).unwrap_or_else(OpTime::null))
    }

    async fn fetch_missing_document(
        &self,
        _source: &HostAndPort,
        namespace: &str,
        id: &Value,
    ) -> Result<Option<Value>, FetchError> {
        Ok(self.documents.find(namespace, id))
    }

    async fn report_progress(&self, source: &HostAndPort, update: &ProgressUpdate) -> Result<(), FetchError> {
        self.lock().reports.push((source.clone(), update.clone()));
        Ok(())
    }
}
