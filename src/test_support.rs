//! Test doubles shared by unit tests

use crate::oplog::{OpTime, OplogEntry};
use crate::storage::{DurabilityListener, JournalToken, MemoryStorage, SnapshotName, StorageEngine, StorageError};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Storage wrapper recording the order in which entries were applied
pub struct TracingStorage {
    pub inner: MemoryStorage,
    trace: Mutex<Vec<OpTime>>,
    apply_delay: Mutex<Option<Duration>>,
}

impl TracingStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(TracingStorage {
            inner: MemoryStorage::new(),
            trace: Mutex::new(Vec::new()),
            apply_delay: Mutex::new(None),
        })
    }

    /// Sleep inside every apply, simulating slow storage I/O
    pub fn set_apply_delay(&self, delay: Option<Duration>) {
        *self.apply_delay.lock().unwrap() = delay;
    }

    pub fn trace(&self) -> Vec<OpTime> {
        self.trace.lock().unwrap().clone()
    }

    pub fn clear_trace(&self) {
        self.trace.lock().unwrap().clear();
    }
}

impl StorageEngine for TracingStorage {
    fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }

    fn apply_one(&self, entry: &OplogEntry) -> Result<(), StorageError> {
        let delay = *self.apply_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.inner.apply_one(entry)?;
        self.trace.lock().unwrap().push(entry.op_time);
        Ok(())
    }

    fn admit_write(&self, op_time: OpTime) -> JournalToken {
        self.inner.admit_write(op_time)
    }

    fn set_durability_listener(&self, listener: Arc<dyn DurabilityListener>) {
        self.inner.set_durability_listener(listener)
    }

    fn supports_snapshots(&self) -> bool {
        self.inner.supports_snapshots()
    }

    fn create_snapshot(&self, name: SnapshotName) -> Result<(), StorageError> {
        self.inner.create_snapshot(name)
    }

    fn drop_snapshot(&self, name: SnapshotName) {
        self.inner.drop_snapshot(name)
    }

    fn drop_all_snapshots(&self) {
        self.inner.drop_all_snapshots()
    }

    fn find(&self, namespace: &str, id: &Value) -> Option<Value> {
        self.inner.find(namespace, id)
    }

    fn find_at(&self, snapshot: SnapshotName, namespace: &str, id: &Value) -> Result<Option<Value>, StorageError> {
        self.inner.find_at(snapshot, namespace, id)
    }

    fn applied_through(&self) -> Option<OpTime> {
        self.inner.applied_through()
    }

    fn set_applied_through(&self, op_time: OpTime) -> Result<(), StorageError> {
        self.inner.set_applied_through(op_time)
    }

    fn reset(&self) -> Result<(), StorageError> {
        self.inner.reset()
    }
}
