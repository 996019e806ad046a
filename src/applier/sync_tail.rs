//! Applier driver
//!
//! Pops batches from the active buffer, applies them through the writer pool
//! and advances the watermarks.

use super::multi_apply::{multi_initial_sync_apply, multi_sync_apply};
use super::writer_pool::WriterPool;
use crate::coordinator::SnapshotCoordinator;
use crate::error::ReplResult;
use crate::ingestion::MissingDocumentSource;
use crate::oplog::{BatchLimits, BufferError, OpTime, OplogBuffer, OplogEntry};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Observable state of the applier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApplierStatus {
    Idle,
    Running,
    /// Halted by an apply error; needs operator intervention
    Failed { reason: String },
    Stopped,
}

/// Apply semantics for the driver
#[derive(Clone)]
pub enum TailMode {
    SteadyState,
    InitialSync {
        missing: Option<MissingDocumentSource>,
        max_retries: u32,
    },
}

/// Why `SyncTail::run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailExit {
    Cancelled,
    ReachedStopPoint(OpTime),
}

pub struct SyncTail {
    buffer: Arc<OplogBuffer>,
    pool: Arc<WriterPool>,
    coordinator: Arc<SnapshotCoordinator>,
    limits: BatchLimits,
    mode: TailMode,
}

impl SyncTail {
    pub fn new(
        buffer: Arc<OplogBuffer>,
        pool: Arc<WriterPool>,
        coordinator: Arc<SnapshotCoordinator>,
        limits: BatchLimits,
        mode: TailMode,
    ) -> Self {
        SyncTail {
            buffer,
            pool,
            coordinator,
            limits,
            mode,
        }
    }

    /// Apply one batch and advance last-applied to its end
    pub async fn apply_batch(&self, batch: Vec<OplogEntry>) -> ReplResult<OpTime> {
        let gate = self.coordinator.apply_gate().await;
        let end = match &self.mode {
            TailMode::SteadyState => multi_sync_apply(&self.pool, batch).await?,
            TailMode::InitialSync { missing, max_retries } => {
                multi_initial_sync_apply(&self.pool, batch, missing.as_ref(), *max_retries).await?
            }
        };
        self.pool.storage().set_applied_through(end)?;
        self.coordinator.record_applied(end);
        drop(gate);

        let token = self.coordinator.admit(end);
        debug!("Batch through {} admitted as token {}", end, token.0);
        Ok(end)
    }

    /// Drain the buffer until cancelled or, when `stop_at` is set, until
    /// everything through `stop_at` has been applied.
    pub async fn run(&self, stop_at: Option<OpTime>, cancel: &CancellationToken) -> ReplResult<TailExit> {
        info!("Applier running (stop at {:?})", stop_at.map(|op| op.to_string()));
        loop {
            if let Some(stop) = stop_at {
                let applied = self.coordinator.last_applied();
                if applied >= stop {
                    info!("Applier reached stop point {}", stop);
                    return Ok(TailExit::ReachedStopPoint(applied));
                }
            }

            let batch = match self.buffer.pop_batch(&self.limits, cancel).await {
                Ok(batch) => batch,
                Err(BufferError::Cancelled) => return Ok(TailExit::Cancelled),
                Err(e) => return Err(e.into()),
            };
            if batch.is_empty() {
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(TailExit::Cancelled),
                applied = self.apply_batch(batch) => { applied?; }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplError;
    use crate::manager::ThreadNamer;
    use crate::oplog::BufferLimits;
    use crate::storage::{MemoryStorage, StorageEngine};
    use crate::test_support::TracingStorage;
    use serde_json::json;
    use std::time::Duration;

    fn t(i: u32) -> OpTime {
        OpTime::new(i, 0, 1)
    }

    fn limits() -> BatchLimits {
        BatchLimits {
            max_entries: 4,
            max_bytes: usize::MAX,
        }
    }

    fn steady_buffer() -> Arc<OplogBuffer> {
        Arc::new(OplogBuffer::steady_state(BufferLimits {
            max_entries: 100,
            max_bytes: usize::MAX,
        }))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_applies_until_stop_point() {
        let storage = Arc::new(MemoryStorage::new());
        let pool = Arc::new(WriterPool::new(2, storage.clone(), &ThreadNamer::new()).unwrap());
        let coordinator = Arc::new(SnapshotCoordinator::new(storage.clone()));
        let buffer = steady_buffer();
        for i in 1..=10 {
            buffer
                .push_even_if_full(OplogEntry::insert(t(i), "app.c", json!({"_id": i})))
                .unwrap();
        }

        let tail = SyncTail::new(buffer.clone(), pool, coordinator.clone(), limits(), TailMode::SteadyState);
        let exit = tail.run(Some(t(6)), &CancellationToken::new()).await.unwrap();

        // Batches of four: the stop point is checked between batches
        assert_eq!(exit, TailExit::ReachedStopPoint(t(8)));
        assert_eq!(coordinator.last_applied(), t(8));
        assert_eq!(storage.applied_through(), Some(t(8)));
        assert_eq!(storage.document_count("app.c"), 8);
        assert_eq!(buffer.count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_halts_driver() {
        let storage = Arc::new(MemoryStorage::new());
        let pool = Arc::new(WriterPool::new(2, storage.clone(), &ThreadNamer::new()).unwrap());
        let coordinator = Arc::new(SnapshotCoordinator::new(storage.clone()));
        let buffer = steady_buffer();
        buffer
            .push_even_if_full(OplogEntry::update(t(1), "app.c", json!(9), json!({"v": 1})))
            .unwrap();

        let tail = SyncTail::new(buffer, pool, coordinator.clone(), limits(), TailMode::SteadyState);
        let err = tail.run(None, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ReplError::ApplyFailed { start, .. } if start == t(1)));
        assert!(coordinator.last_applied().is_null());
        assert_eq!(storage.applied_through(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_mid_apply_on_slow_storage() {
        let storage = TracingStorage::new();
        storage.set_apply_delay(Some(Duration::from_millis(200)));
        let pool = Arc::new(WriterPool::new(1, storage.clone(), &ThreadNamer::new()).unwrap());
        let coordinator = Arc::new(SnapshotCoordinator::new(storage.clone()));
        let buffer = steady_buffer();
        for i in 1..=4 {
            buffer
                .push_even_if_full(OplogEntry::insert(t(i), "app.c", json!({"_id": i})))
                .unwrap();
        }

        let tail = SyncTail::new(buffer, pool.clone(), coordinator.clone(), limits(), TailMode::SteadyState);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        assert_eq!(tail.run(None, &cancel).await.unwrap(), TailExit::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(150));
        // Nothing is recorded for the interrupted batch
        assert!(coordinator.last_applied().is_null());

        let joined = std::time::Instant::now();
        tokio::task::spawn_blocking(move || pool.shutdown()).await.unwrap();
        assert!(joined.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admission_feeds_coordinator() {
        let storage = Arc::new(MemoryStorage::new());
        let pool = Arc::new(WriterPool::new(2, storage.clone(), &ThreadNamer::new()).unwrap());
        let coordinator = Arc::new(SnapshotCoordinator::new(storage.clone()));
        storage.set_durability_listener(coordinator.clone());
        let tail = SyncTail::new(steady_buffer(), pool, coordinator.clone(), limits(), TailMode::SteadyState);

        let end = tail
            .apply_batch(vec![OplogEntry::insert(t(3), "app.c", json!({"_id": 3}))])
            .await
            .unwrap();
        assert_eq!(end, t(3));
        assert!(coordinator.last_durable().is_null());

        storage.commit_journal().unwrap();
        assert_eq!(coordinator.last_durable(), t(3));
    }
}
