//! Durability and snapshot coordination
//!
//! The coordinator sits between the applier and readers. The applier records
//! each batch end and admits it to the storage journal; the storage engine
//! reports durable tokens back. A background loop freezes storage into named
//! snapshots and publishes the newest one whose contents are all durable as
//! the committed snapshot.

mod watermarks;

pub use watermarks::{TokenCorrelation, Watermarks};

use crate::error::{ReplError, ReplResult};
use crate::oplog::OpTime;
use crate::storage::{DurabilityListener, JournalToken, SnapshotName, StorageEngine, StorageError};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{MutexGuard as AsyncMutexGuard, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Snapshots created but not yet durable; creation pauses at this many
const MAX_UNCOMMITTED_SNAPSHOTS: usize = 8;

/// The snapshot committed-level reads are served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommittedSnapshot {
    pub name: SnapshotName,
    /// Everything applied through this OpTime is visible in the snapshot
    pub op_time: OpTime,
}

struct SnapshotState {
    next_name: u64,
    /// Bumped by drop-all; a snapshot created under an older generation is discarded
    generation: u64,
    uncommitted: VecDeque<(SnapshotName, OpTime)>,
    last_snapshot_op_time: Option<OpTime>,
}

/// Bridges storage durability to the committed snapshot pointer
pub struct SnapshotCoordinator {
    storage: Arc<dyn StorageEngine>,
    watermarks: Mutex<Watermarks>,
    correlation: Mutex<TokenCorrelation>,
    snapshots: Mutex<SnapshotState>,
    committed: RwLock<Option<CommittedSnapshot>>,
    /// Cleared while the data set is being rebuilt
    snapshots_allowed: AtomicBool,
    /// Held while a batch is applied and while a snapshot is taken
    apply_gate: tokio::sync::Mutex<()>,
    force: Notify,
    durable: Notify,
    progress: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SnapshotCoordinator {
    pub fn new(storage: Arc<dyn StorageEngine>) -> Self {
        SnapshotCoordinator {
            storage,
            watermarks: Mutex::new(Watermarks::default()),
            correlation: Mutex::new(TokenCorrelation::default()),
            snapshots: Mutex::new(SnapshotState {
                next_name: 1,
                generation: 0,
                uncommitted: VecDeque::new(),
                last_snapshot_op_time: None,
            }),
            committed: RwLock::new(None),
            snapshots_allowed: AtomicBool::new(true),
            apply_gate: tokio::sync::Mutex::new(()),
            force: Notify::new(),
            durable: Notify::new(),
            progress: Notify::new(),
        }
    }

    pub fn watermarks(&self) -> Watermarks {
        *lock(&self.watermarks)
    }

    pub fn last_applied(&self) -> OpTime {
        lock(&self.watermarks).last_applied
    }

    pub fn last_durable(&self) -> OpTime {
        lock(&self.watermarks).last_durable
    }

    /// Exclusive access to storage contents between batches
    pub async fn apply_gate(&self) -> AsyncMutexGuard<'_, ()> {
        self.apply_gate.lock().await
    }

    /// A batch ending at `op_time` has been applied
    pub fn record_applied(&self, op_time: OpTime) {
        if lock(&self.watermarks).advance_applied(op_time) {
            self.progress.notify_waiters();
        }
    }

    /// Data found in storage at startup; it was replayed from the journal so
    /// it is already durable.
    pub fn record_recovered(&self, op_time: OpTime) {
        {
            let mut watermarks = lock(&self.watermarks);
            watermarks.advance_applied(op_time);
            watermarks.advance_durable(op_time);
        }
        self.progress.notify_waiters();
        self.durable.notify_one();
    }

    /// Admit the writes applied through `op_time` to the journal
    pub fn admit(&self, op_time: OpTime) -> JournalToken {
        // The engine may confirm durability from inside `admit_write`
        let token = self.storage.admit_write(op_time);
        let already_durable = lock(&self.correlation).admitted(token, op_time);
        if let Some(op_time) = already_durable {
            self.advance_durable(op_time);
        }
        token
    }

    fn advance_durable(&self, op_time: OpTime) {
        if lock(&self.watermarks).advance_durable(op_time) {
            debug!("Durable through {}", op_time);
            self.durable.notify_one();
            self.progress.notify_waiters();
        }
    }

    /// Resolves on the next watermark change
    pub async fn progress_changed(&self) {
        self.progress.notified().await
    }

    pub fn committed_snapshot(&self) -> Option<CommittedSnapshot> {
        *self.committed.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot to serve a committed-level read from
    pub fn committed_read_view(&self) -> ReplResult<CommittedSnapshot> {
        if !self.snapshots_enabled() {
            return Err(ReplError::SnapshotsNotSupported);
        }
        self.committed_snapshot().ok_or(ReplError::SnapshotUnavailable)
    }

    /// Committed-level point read
    pub fn find_committed(&self, namespace: &str, id: &Value) -> ReplResult<Option<Value>> {
        // The pointer may move on and release the snapshot between the two steps
        for _ in 0..3 {
            let view = self.committed_read_view()?;
            match self.storage.find_at(view.name, namespace, id) {
                Err(StorageError::SnapshotNotFound(_)) => continue,
                other => return Ok(other?),
            }
        }
        Err(ReplError::SnapshotUnavailable)
    }

    pub fn snapshots_enabled(&self) -> bool {
        self.storage.supports_snapshots()
    }

    /// Ask the snapshot loop to run a pass now
    pub fn force_snapshot_creation(&self) {
        debug!("Forced snapshot requested");
        self.force.notify_one();
    }

    /// Invalidate every snapshot; committed reads are refused until a new
    /// snapshot is published.
    pub fn drop_all_snapshots(&self) {
        let mut snapshots = lock(&self.snapshots);
        snapshots.generation += 1;
        snapshots.uncommitted.clear();
        snapshots.last_snapshot_op_time = None;
        *self.committed.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.storage.drop_all_snapshots();
        info!("Dropped all snapshots");
    }

    /// Stop taking and publishing snapshots and drop the existing ones
    pub fn block_snapshots(&self) {
        self.snapshots_allowed.store(false, Ordering::SeqCst);
        self.drop_all_snapshots();
    }

    /// Resume the snapshot loop once the data set is consistent
    pub fn allow_snapshots(&self) {
        if !self.snapshots_allowed.swap(true, Ordering::SeqCst) {
            info!("Snapshots allowed again");
            self.force.notify_one();
        }
    }

    pub fn snapshots_allowed(&self) -> bool {
        self.snapshots_allowed.load(Ordering::SeqCst)
    }

    /// Forget all replication progress before an initial sync attempt.
    /// Snapshots stay blocked until `allow_snapshots`.
    pub fn reset_for_initial_sync(&self) {
        self.block_snapshots();
        lock(&self.correlation).clear();
        *lock(&self.watermarks) = Watermarks::default();
        self.progress.notify_waiters();
    }

    /// One pass of the snapshot loop: publish what became durable, then take
    /// a new snapshot if anything was applied since the last one.
    ///
    /// Returns whether a new snapshot was created.
    pub async fn run_snapshot_pass(&self) -> ReplResult<bool> {
        if !self.snapshots_enabled() || !self.snapshots_allowed() {
            return Ok(false);
        }
        self.publish_committed();

        let (name, generation) = {
            let mut snapshots = lock(&self.snapshots);
            if snapshots.uncommitted.len() >= MAX_UNCOMMITTED_SNAPSHOTS {
                return Ok(false);
            }
            if let Some(last) = snapshots.last_snapshot_op_time {
                if self.last_applied() <= last {
                    return Ok(false);
                }
            } else if self.last_applied().is_null() {
                return Ok(false);
            }
            let name = SnapshotName(snapshots.next_name);
            snapshots.next_name += 1;
            (name, snapshots.generation)
        };

        let stamp = {
            let _gate = self.apply_gate().await;
            let stamp = self.last_applied();
            self.storage.create_snapshot(name)?;
            stamp
        };

        {
            let mut snapshots = lock(&self.snapshots);
            if snapshots.generation != generation || !self.snapshots_allowed() {
                debug!("Discarding {} created across a drop-all or block", name);
                self.storage.drop_snapshot(name);
                return Ok(false);
            }
            snapshots.uncommitted.push_back((name, stamp));
            snapshots.last_snapshot_op_time = Some(stamp);
        }
        debug!("Created {} at {}", name, stamp);

        self.publish_committed();
        Ok(true)
    }

    /// Advance the committed pointer to the newest snapshot that is entirely durable
    fn publish_committed(&self) {
        let durable = self.last_durable();
        let mut snapshots = lock(&self.snapshots);
        if !self.snapshots_allowed() {
            return;
        }

        let newest = snapshots
            .uncommitted
            .iter()
            .rposition(|(_, stamp)| *stamp <= durable);
        let idx = match newest {
            Some(idx) => idx,
            None => return,
        };

        let mut released: Vec<SnapshotName> = Vec::new();
        let mut published = None;
        for (name, stamp) in snapshots.uncommitted.drain(..=idx) {
            if let Some((old, _)) = published.replace((name, stamp)) {
                released.push(old);
            }
        }
        let (name, op_time) = match published {
            Some(p) => p,
            None => return,
        };

        {
            let mut committed = self.committed.write().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = committed.replace(CommittedSnapshot { name, op_time }) {
                released.push(previous.name);
            }
        }
        drop(snapshots);

        for old in released {
            self.storage.drop_snapshot(old);
        }
        info!("Committed snapshot is now {} at {}", name, op_time);
    }

    /// Snapshot loop; wakes on the interval, on a force request and on durability progress
    pub async fn run(self: Arc<Self>, cancel: CancellationToken, interval: Duration) {
        info!("Snapshot loop started (interval {:?})", interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.force.notified() => {}
                _ = self.durable.notified() => {}
            }
            if let Err(e) = self.run_snapshot_pass().await {
                warn!("Snapshot pass failed, retrying on next tick: {}", e);
            }
        }
        info!("Snapshot loop stopped");
    }
}

impl DurabilityListener for SnapshotCoordinator {
    fn on_durable(&self, token: JournalToken) {
        let newest = lock(&self.correlation).durable(token);
        if let Some(op_time) = newest {
            self.advance_durable(op_time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::OplogEntry;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn t(i: u32) -> OpTime {
        OpTime::new(i, 0, 1)
    }

    fn setup() -> (Arc<MemoryStorage>, Arc<SnapshotCoordinator>) {
        let storage = Arc::new(MemoryStorage::new());
        let coordinator = Arc::new(SnapshotCoordinator::new(storage.clone()));
        storage.set_durability_listener(coordinator.clone());
        (storage, coordinator)
    }

    fn apply(storage: &MemoryStorage, coordinator: &SnapshotCoordinator, i: u32) -> JournalToken {
        storage
            .apply_one(&OplogEntry::insert(t(i), "app.c", json!({"_id": i})))
            .unwrap();
        coordinator.record_applied(t(i));
        coordinator.admit(t(i))
    }

    #[tokio::test]
    async fn test_snapshot_stamped_with_durable_optime() {
        let (storage, coordinator) = setup();
        apply(&storage, &coordinator, 1);
        let token = apply(&storage, &coordinator, 2);

        // Durability for the second token arrives before the snapshot loop runs
        assert_eq!(storage.commit_journal().unwrap(), Some(token));
        assert_eq!(coordinator.last_durable(), t(2));

        assert!(coordinator.run_snapshot_pass().await.unwrap());
        let committed = coordinator.committed_snapshot().unwrap();
        assert_eq!(committed.op_time, t(2));
        assert_eq!(coordinator.find_committed("app.c", &json!(2)).unwrap(), Some(json!({"_id": 2})));
    }

    #[tokio::test]
    async fn test_pointer_waits_for_durability() {
        let (storage, coordinator) = setup();
        apply(&storage, &coordinator, 1);

        assert!(coordinator.run_snapshot_pass().await.unwrap());
        assert!(matches!(coordinator.committed_read_view(), Err(ReplError::SnapshotUnavailable)));

        storage.commit_journal().unwrap();
        coordinator.run_snapshot_pass().await.unwrap();
        assert_eq!(coordinator.committed_snapshot().unwrap().op_time, t(1));
    }

    #[tokio::test]
    async fn test_pointer_monotonic_and_never_ahead_of_durable() {
        let (storage, coordinator) = setup();
        let mut last: Option<CommittedSnapshot> = None;

        for i in 1..=40u32 {
            apply(&storage, &coordinator, i);
            if i % 3 == 0 {
                storage.commit_journal().unwrap();
            }
            coordinator.run_snapshot_pass().await.unwrap();

            if let Some(current) = coordinator.committed_snapshot() {
                assert!(current.op_time <= coordinator.last_durable());
                if let Some(previous) = last {
                    assert!(current.name >= previous.name);
                    assert!(current.op_time >= previous.op_time);
                }
                last = Some(current);
            }
        }
        assert!(last.is_some());
        // Released snapshots do not pile up
        assert!(storage.snapshot_count() <= MAX_UNCOMMITTED_SNAPSHOTS + 1);
    }

    #[tokio::test]
    async fn test_drop_all_then_read_is_unavailable() {
        let (storage, coordinator) = setup();
        apply(&storage, &coordinator, 1);
        storage.commit_journal().unwrap();
        coordinator.run_snapshot_pass().await.unwrap();
        assert!(coordinator.committed_read_view().is_ok());

        coordinator.drop_all_snapshots();
        assert!(matches!(coordinator.committed_read_view(), Err(ReplError::SnapshotUnavailable)));
        assert!(matches!(
            coordinator.find_committed("app.c", &json!(1)),
            Err(ReplError::SnapshotUnavailable)
        ));
        assert_eq!(storage.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshots_not_supported() {
        let storage = Arc::new(MemoryStorage::without_snapshots());
        let coordinator = SnapshotCoordinator::new(storage);
        assert!(!coordinator.snapshots_enabled());
        assert!(!coordinator.run_snapshot_pass().await.unwrap());
        assert!(matches!(coordinator.committed_read_view(), Err(ReplError::SnapshotsNotSupported)));
    }

    #[tokio::test]
    async fn test_always_policy_admission_is_durable_at_once() {
        use crate::storage::{MemoryStorageConfig, SyncPolicy};
        let storage = Arc::new(
            MemoryStorage::open(MemoryStorageConfig {
                sync_policy: SyncPolicy::Always,
                ..MemoryStorageConfig::default()
            })
            .unwrap(),
        );
        let coordinator = Arc::new(SnapshotCoordinator::new(storage.clone()));
        storage.set_durability_listener(coordinator.clone());

        apply(&storage, &coordinator, 7);
        assert_eq!(coordinator.last_durable(), t(7));
    }

    #[tokio::test]
    async fn test_forced_pass_from_loop() {
        let (storage, coordinator) = setup();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(coordinator.clone().run(cancel.clone(), Duration::from_secs(3600)));

        apply(&storage, &coordinator, 1);
        storage.commit_journal().unwrap();
        coordinator.force_snapshot_creation();

        let mut published = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if coordinator.committed_snapshot().is_some() {
                published = true;
                break;
            }
        }
        cancel.cancel();
        task.await.unwrap();
        assert!(published);
    }

    #[tokio::test]
    async fn test_reset_for_initial_sync() {
        let (storage, coordinator) = setup();
        apply(&storage, &coordinator, 1);
        storage.commit_journal().unwrap();
        coordinator.run_snapshot_pass().await.unwrap();

        coordinator.reset_for_initial_sync();
        assert_eq!(coordinator.watermarks(), Watermarks::default());
        assert!(coordinator.committed_snapshot().is_none());
        // Tokens keep increasing across the reset
        let token = apply(&storage, &coordinator, 2);
        assert_eq!(token, JournalToken(2));
    }

    #[tokio::test]
    async fn test_blocked_coordinator_publishes_nothing() {
        let (storage, coordinator) = setup();
        coordinator.block_snapshots();
        assert!(!coordinator.snapshots_allowed());

        apply(&storage, &coordinator, 1);
        storage.commit_journal().unwrap();
        assert_eq!(coordinator.last_durable(), t(1));
        assert!(!coordinator.run_snapshot_pass().await.unwrap());
        assert!(coordinator.committed_snapshot().is_none());
        assert_eq!(storage.snapshot_count(), 0);
        assert!(matches!(
            coordinator.find_committed("app.c", &json!(1)),
            Err(ReplError::SnapshotUnavailable)
        ));

        coordinator.allow_snapshots();
        assert!(coordinator.run_snapshot_pass().await.unwrap());
        assert_eq!(coordinator.committed_snapshot().unwrap().op_time, t(1));
    }

    #[tokio::test]
    async fn test_reset_keeps_snapshots_blocked() {
        let (storage, coordinator) = setup();
        coordinator.reset_for_initial_sync();
        apply(&storage, &coordinator, 1);
        storage.commit_journal().unwrap();
        assert!(!coordinator.run_snapshot_pass().await.unwrap());
        assert!(coordinator.committed_snapshot().is_none());
    }
}
