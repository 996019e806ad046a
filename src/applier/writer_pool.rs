//! Fixed-size writer pool
//!
//! Each writer runs in its own thread and applies the entries it receives
//! strictly in order. The pool is created once and reused across batches.

use super::router::ConflictRouter;
use crate::error::{ReplError, ReplResult};
use crate::manager::{spawn_task, TaskHandle, ThreadNamer};
use crate::oplog::{ConflictKey, OpTime, OplogEntry};
use crate::storage::{StorageEngine, StorageError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Apply semantics requested for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Any error fails the writer's group
    SteadyState,
    /// Missing documents defer the rest of that key instead of failing
    InitialSync,
}

/// Entries for one writer, in apply order
struct WriterTask {
    entries: Vec<OplogEntry>,
    mode: ApplyMode,
    response_tx: oneshot::Sender<WriterReport>,
}

/// Outcome of one writer's share of a batch
#[derive(Debug, Default)]
pub struct WriterReport {
    pub writer_id: usize,
    pub applied: usize,
    /// Initial sync only: entries held back behind a missing document, in order
    pub deferred: Vec<OplogEntry>,
    pub failure: Option<(OpTime, StorageError)>,
}

/// Pool of writer threads
pub struct WriterPool {
    router: ConflictRouter,
    senders: Vec<mpsc::UnboundedSender<WriterTask>>,
    handles: Mutex<Vec<TaskHandle>>,
    storage: Arc<dyn StorageEngine>,
}

impl WriterPool {
    /// Start `size` writer threads
    pub fn new(size: usize, storage: Arc<dyn StorageEngine>, namer: &ThreadNamer) -> ReplResult<Self> {
        if size == 0 {
            return Err(ReplError::Config("writer pool needs at least one writer".into()));
        }
        info!("Initializing writer pool with {} writers", size);

        let mut senders = Vec::with_capacity(size);
        let mut handles = Vec::with_capacity(size);

        for writer_id in 0..size {
            let (task_tx, task_rx) = mpsc::unbounded_channel();
            let writer_storage = storage.clone();
            let handle = spawn_task(
                namer.next_name("repl-writer"),
                CancellationToken::new(),
                move |cancel| Self::run_writer_loop(writer_id, writer_storage, task_rx, cancel),
            )?;
            senders.push(task_tx);
            handles.push(handle);
        }

        Ok(WriterPool {
            router: ConflictRouter::new(size),
            senders,
            handles: Mutex::new(handles),
            storage,
        })
    }

    pub fn size(&self) -> usize {
        self.senders.len()
    }

    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    /// Partition `entries` by conflict key and apply them on the writers.
    /// Resolves once every writer with work has reported.
    pub async fn apply(&self, entries: Vec<OplogEntry>, mode: ApplyMode) -> ReplResult<Vec<WriterReport>> {
        let groups = self.router.partition(entries);
        let mut pending = Vec::new();

        for (writer_id, group) in groups.into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            let (response_tx, response_rx) = oneshot::channel();
            let task = WriterTask {
                entries: group,
                mode,
                response_tx,
            };
            if self.senders[writer_id].send(task).is_err() {
                error!("Writer {} channel closed", writer_id);
                return Err(ReplError::ShutdownInProgress);
            }
            pending.push((writer_id, response_rx));
        }

        let mut reports = Vec::with_capacity(pending.len());
        for (writer_id, response_rx) in pending {
            match response_rx.await {
                Ok(report) => reports.push(report),
                Err(_) => {
                    error!("Writer {} did not respond", writer_id);
                    return Err(ReplError::ShutdownInProgress);
                }
            }
        }
        Ok(reports)
    }

    /// Stop and join every writer
    pub fn shutdown(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for handle in handles.iter_mut() {
            handle.stop();
        }
        handles.clear();
    }

    /// The loop that runs in each writer's thread
    async fn run_writer_loop(
        writer_id: usize,
        storage: Arc<dyn StorageEngine>,
        mut task_rx: mpsc::UnboundedReceiver<WriterTask>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                Some(task) = task_rx.recv() => {
                    debug!("Writer {} received {} entries", writer_id, task.entries.len());
                    // An abandoned group sends no report; the caller sees the pool shutting down
                    if let Some(report) = Self::apply_group(writer_id, storage.as_ref(), task.entries, task.mode, &cancel) {
                        let _ = task.response_tx.send(report);
                    }
                }
                _ = cancel.cancelled() => break,
                else => break,
            }
        }
        debug!("Writer {} shutting down", writer_id);
    }

    /// Apply entries in order, stopping at the first hard failure or on shutdown
    fn apply_group(
        writer_id: usize,
        storage: &dyn StorageEngine,
        entries: Vec<OplogEntry>,
        mode: ApplyMode,
        cancel: &CancellationToken,
    ) -> Option<WriterReport> {
        let mut report = WriterReport {
            writer_id,
            ..WriterReport::default()
        };
        let mut blocked: HashSet<ConflictKey> = HashSet::new();

        for entry in entries {
            if cancel.is_cancelled() {
                debug!("Writer {} abandoning group at {}", writer_id, entry.op_time);
                return None;
            }
            let key = entry.conflict_key();
            if let Some(k) = &key {
                if blocked.contains(k) {
                    report.deferred.push(entry);
                    continue;
                }
            }

            match storage.apply_one(&entry) {
                Ok(()) => report.applied += 1,
                Err(e) if mode == ApplyMode::InitialSync && e.is_missing_document() && key.is_some() => {
                    debug!("Writer {} deferring {} ({})", writer_id, entry.op_time, e);
                    if let Some(k) = key {
                        blocked.insert(k);
                    }
                    report.deferred.push(entry);
                }
                Err(e) => {
                    error!("Writer {} failed to apply {}: {}", writer_id, entry.op_time, e);
                    report.failure = Some((entry.op_time, e));
                    break;
                }
            }
        }
        Some(report)
    }
}

impl Drop for WriterPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
