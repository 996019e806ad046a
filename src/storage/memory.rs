//! In-memory document storage engine
//!
//! Collections of JSON documents keyed by `_id`, with frozen snapshots and an
//! optional journal file that is replayed on open.

use super::journal::{read_journal, Journal, JournalCommitter, JournalRecord, SyncPolicy};
use super::{DurabilityListener, JournalToken, SnapshotName, StorageEngine, StorageError};
use crate::oplog::{canonical_id, OpTime, OperationKind, OplogEntry};
use serde_json::{Map, Value};
use siphasher::sip::SipHasher13;
use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasherDefault;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Documents of one collection, keyed by canonical `_id`
type Collection = HashMap<String, Value, BuildHasherDefault<SipHasher13>>;

/// Namespace -> collection
type Collections = HashMap<String, Collection>;

/// Options for `MemoryStorage::open`
#[derive(Debug, Clone)]
pub struct MemoryStorageConfig {
    pub journal_path: Option<PathBuf>,
    pub sync_policy: SyncPolicy,
    pub commit_interval: Duration,
    pub snapshots_enabled: bool,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        MemoryStorageConfig {
            journal_path: None,
            sync_policy: SyncPolicy::Manual,
            commit_interval: Duration::from_millis(100),
            snapshots_enabled: true,
        }
    }
}

/// In-memory storage engine
pub struct MemoryStorage {
    data: RwLock<Collections>,
    snapshots: Mutex<BTreeMap<SnapshotName, Arc<Collections>>>,
    applied_through: Mutex<Option<OpTime>>,
    journal: Arc<Journal>,
    committer: Mutex<Option<JournalCommitter>>,
    snapshots_enabled: bool,
    open: AtomicBool,
}

impl MemoryStorage {
    /// Journal-less engine with manual durability and snapshot support
    pub fn new() -> Self {
        Self::with_journal(Journal::in_memory(SyncPolicy::Manual), true)
    }

    /// Engine that never supports point-in-time snapshots
    pub fn without_snapshots() -> Self {
        Self::with_journal(Journal::in_memory(SyncPolicy::Manual), false)
    }

    fn with_journal(journal: Journal, snapshots_enabled: bool) -> Self {
        MemoryStorage {
            data: RwLock::new(Collections::new()),
            snapshots: Mutex::new(BTreeMap::new()),
            applied_through: Mutex::new(None),
            journal: Arc::new(journal),
            committer: Mutex::new(None),
            snapshots_enabled,
            open: AtomicBool::new(true),
        }
    }

    /// Open an engine, replaying the journal file if one exists
    pub fn open(config: MemoryStorageConfig) -> Result<Self, StorageError> {
        let storage = match &config.journal_path {
            Some(path) => {
                let records = if path.exists() {
                    info!("Replaying journal from {:?}", path);
                    read_journal(path)?
                } else {
                    Vec::new()
                };
                let storage = Self::with_journal(Journal::open(path, config.sync_policy)?, config.snapshots_enabled);
                storage.replay(records);
                storage
            }
            None => Self::with_journal(Journal::in_memory(config.sync_policy), config.snapshots_enabled),
        };

        if config.sync_policy == SyncPolicy::Interval {
            let committer = JournalCommitter::start(storage.journal.clone(), config.commit_interval)?;
            *storage.committer.lock().unwrap_or_else(|e| e.into_inner()) = Some(committer);
        }

        Ok(storage)
    }

    fn read(&self) -> RwLockReadGuard<'_, Collections> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Collections> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot_map(&self) -> MutexGuard<'_, BTreeMap<SnapshotName, Arc<Collections>>> {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn applied(&self) -> MutexGuard<'_, Option<OpTime>> {
        self.applied_through.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rebuild state from journal records
    fn replay(&self, records: Vec<JournalRecord>) {
        let mut replayed = 0;
        for record in records {
            match record {
                JournalRecord::Apply(entry) => match self.apply_in_memory(&entry) {
                    Ok(()) => replayed += 1,
                    Err(e) => warn!("Failed to replay journal entry at {}: {}. Skipping.", entry.op_time, e),
                },
                JournalRecord::AppliedThrough(op_time) => *self.applied() = Some(op_time),
                JournalRecord::Reset => {
                    self.write().clear();
                    *self.applied() = None;
                }
            }
        }
        info!("Replayed {} journal entries, applied through {:?}", replayed, *self.applied());
    }

    fn apply_in_memory(&self, entry: &OplogEntry) -> Result<(), StorageError> {
        match entry.kind {
            OperationKind::Insert => {
                let id = entry.document_id().ok_or(StorageError::MissingId(entry.op_time))?;
                let key = canonical_id(id);
                self.write()
                    .entry(entry.namespace.clone())
                    .or_default()
                    .insert(key, entry.payload.clone());
                Ok(())
            }
            OperationKind::Update => {
                let id = entry.document_id().ok_or(StorageError::MissingId(entry.op_time))?;
                let key = canonical_id(id);
                let mut data = self.write();
                let doc = data
                    .get_mut(&entry.namespace)
                    .and_then(|c| c.get_mut(&key))
                    .ok_or_else(|| StorageError::MissingDocument {
                        namespace: entry.namespace.clone(),
                        id: key.clone(),
                    })?;
                apply_update(doc, &entry.payload)
            }
            OperationKind::Delete => {
                let id = entry.document_id().ok_or(StorageError::MissingId(entry.op_time))?;
                if let Some(collection) = self.write().get_mut(&entry.namespace) {
                    collection.remove(&canonical_id(id));
                }
                Ok(())
            }
            OperationKind::Command => self.apply_command(entry),
            OperationKind::Noop => Ok(()),
        }
    }

    fn apply_command(&self, entry: &OplogEntry) -> Result<(), StorageError> {
        let db = entry.database().to_string();
        let command = entry
            .payload
            .as_object()
            .ok_or_else(|| StorageError::InvalidPayload(format!("command at {} is not an object", entry.op_time)))?;

        if let Some(coll) = command.get("create").and_then(Value::as_str) {
            self.write().entry(format!("{}.{}", db, coll)).or_default();
            debug!("Created collection {}.{}", db, coll);
            Ok(())
        } else if let Some(coll) = command.get("drop").and_then(Value::as_str) {
            self.write().remove(&format!("{}.{}", db, coll));
            debug!("Dropped collection {}.{}", db, coll);
            Ok(())
        } else if command.contains_key("dropDatabase") {
            let prefix = format!("{}.", db);
            self.write().retain(|ns, _| !ns.starts_with(&prefix));
            debug!("Dropped database {}", db);
            Ok(())
        } else {
            Err(StorageError::UnsupportedCommand(entry.payload.to_string()))
        }
    }

    /// Commit the journal now (the only way to reach durability under `Manual`)
    pub fn commit_journal(&self) -> Result<Option<JournalToken>, StorageError> {
        Ok(self.journal.commit()?)
    }

    pub fn durable_token(&self) -> JournalToken {
        self.journal.durable_token()
    }

    /// Number of documents in a collection
    pub fn document_count(&self, namespace: &str) -> usize {
        self.read().get(namespace).map(|c| c.len()).unwrap_or(0)
    }

    /// Whether a collection exists
    pub fn has_collection(&self, namespace: &str) -> bool {
        self.read().contains_key(namespace)
    }

    /// Number of snapshots currently held
    pub fn snapshot_count(&self) -> usize {
        self.snapshot_map().len()
    }

    /// Stop the journal committer and refuse further replication
    pub fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut committer) = self.committer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            committer.stop();
        }
        if let Err(e) = self.journal.commit() {
            warn!("Final journal commit failed: {}", e);
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// `$set` / `$unset` merge, or full replacement keeping `_id`
fn apply_update(doc: &mut Value, update: &Value) -> Result<(), StorageError> {
    let update = update
        .as_object()
        .ok_or_else(|| StorageError::InvalidPayload("update is not an object".to_string()))?;
    let is_modifier = update.keys().any(|k| k.starts_with('$'));

    if !is_modifier {
        *doc = Value::Object(update.clone());
        return Ok(());
    }

    let target = match doc {
        Value::Object(map) => map,
        _ => return Err(StorageError::InvalidPayload("stored document is not an object".to_string())),
    };

    for (op, args) in update {
        match op.as_str() {
            "_id" => {}
            "$set" => {
                let fields = as_fields(args)?;
                for (field, value) in fields {
                    target.insert(field.clone(), value.clone());
                }
            }
            "$unset" => {
                let fields = as_fields(args)?;
                for field in fields.keys() {
                    target.remove(field);
                }
            }
            other => return Err(StorageError::InvalidPayload(format!("unsupported update operator {}", other))),
        }
    }
    Ok(())
}

fn as_fields(args: &Value) -> Result<&Map<String, Value>, StorageError> {
    args.as_object()
        .ok_or_else(|| StorageError::InvalidPayload("update operator expects an object".to_string()))
}

impl StorageEngine for MemoryStorage {
    fn is_initialized(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn apply_one(&self, entry: &OplogEntry) -> Result<(), StorageError> {
        if !self.is_initialized() {
            return Err(StorageError::NotInitialized);
        }
        self.apply_in_memory(entry)?;
        self.journal.record(&JournalRecord::Apply(entry.clone()))?;
        Ok(())
    }

    fn admit_write(&self, _op_time: OpTime) -> JournalToken {
        self.journal.admit()
    }

    fn set_durability_listener(&self, listener: Arc<dyn DurabilityListener>) {
        self.journal.set_listener(listener);
    }

    fn supports_snapshots(&self) -> bool {
        self.snapshots_enabled
    }

    fn create_snapshot(&self, name: SnapshotName) -> Result<(), StorageError> {
        if !self.snapshots_enabled {
            return Err(StorageError::SnapshotsUnsupported);
        }
        let frozen = Arc::new(self.read().clone());
        self.snapshot_map().insert(name, frozen);
        Ok(())
    }

    fn drop_snapshot(&self, name: SnapshotName) {
        self.snapshot_map().remove(&name);
    }

    fn drop_all_snapshots(&self) {
        self.snapshot_map().clear();
    }

    fn find(&self, namespace: &str, id: &Value) -> Option<Value> {
        self.read()
            .get(namespace)
            .and_then(|c| c.get(&canonical_id(id)))
            .cloned()
    }

    fn find_at(&self, snapshot: SnapshotName, namespace: &str, id: &Value) -> Result<Option<Value>, StorageError> {
        let frozen = self
            .snapshot_map()
            .get(&snapshot)
            .cloned()
            .ok_or(StorageError::SnapshotNotFound(snapshot))?;
        Ok(frozen.get(namespace).and_then(|c| c.get(&canonical_id(id))).cloned())
    }

    fn applied_through(&self) -> Option<OpTime> {
        *self.applied()
    }

    fn set_applied_through(&self, op_time: OpTime) -> Result<(), StorageError> {
        *self.applied() = Some(op_time);
        self.journal.record(&JournalRecord::AppliedThrough(op_time))?;
        Ok(())
    }

    fn reset(&self) -> Result<(), StorageError> {
        self.write().clear();
        self.snapshot_map().clear();
        *self.applied() = None;
        self.journal.record(&JournalRecord::Reset)?;
        info!("Storage reset");
        Ok(())
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        if let Some(mut committer) = self.committer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            committer.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn t(i: u32) -> OpTime {
        OpTime::new(i, 0, 1)
    }

    #[test]
    fn test_insert_update_delete() {
        let storage = MemoryStorage::new();
        storage
            .apply_one(&OplogEntry::insert(t(1), "app.users", json!({"_id": "d", "v": 1, "w": 0})))
            .unwrap();
        storage
            .apply_one(&OplogEntry::update(t(2), "app.users", json!("d"), json!({"v": 2})))
            .unwrap();
        assert_eq!(storage.find("app.users", &json!("d")).unwrap(), json!({"_id": "d", "v": 2, "w": 0}));

        storage
            .apply_one(&OplogEntry::delete(t(3), "app.users", json!("d")))
            .unwrap();
        assert!(storage.find("app.users", &json!("d")).is_none());
        // Deleting again is a no-op
        storage
            .apply_one(&OplogEntry::delete(t(4), "app.users", json!("d")))
            .unwrap();
    }

    #[test]
    fn test_update_of_missing_document_fails() {
        let storage = MemoryStorage::new();
        let err = storage
            .apply_one(&OplogEntry::update(t(1), "app.users", json!("x"), json!({"v": 1})))
            .unwrap_err();
        assert!(err.is_missing_document());
    }

    #[test]
    fn test_insert_is_upsert() {
        let storage = MemoryStorage::new();
        let insert = OplogEntry::insert(t(1), "app.c", json!({"_id": 1, "v": "a"}));
        storage.apply_one(&insert).unwrap();
        storage.apply_one(&insert).unwrap();
        assert_eq!(storage.document_count("app.c"), 1);
    }

    #[test]
    fn test_numeric_and_string_ids_are_separate_documents() {
        let storage = MemoryStorage::new();
        storage
            .apply_one(&OplogEntry::insert(t(1), "app.c", json!({"_id": 1, "v": "num"})))
            .unwrap();
        storage
            .apply_one(&OplogEntry::insert(t(2), "app.c", json!({"_id": "1", "v": "str"})))
            .unwrap();
        assert_eq!(storage.document_count("app.c"), 2);
        assert_eq!(storage.find("app.c", &json!(1)).unwrap()["v"], json!("num"));
        assert_eq!(storage.find("app.c", &json!("1")).unwrap()["v"], json!("str"));
    }

    #[test]
    fn test_unset_and_replacement() {
        let storage = MemoryStorage::new();
        storage
            .apply_one(&OplogEntry::insert(t(1), "app.c", json!({"_id": 1, "a": 1, "b": 2})))
            .unwrap();
        storage
            .apply_one(&OplogEntry::new(t(2), "app.c", OperationKind::Update, json!({"_id": 1, "$unset": {"a": ""}})))
            .unwrap();
        assert_eq!(storage.find("app.c", &json!(1)).unwrap(), json!({"_id": 1, "b": 2}));

        storage
            .apply_one(&OplogEntry::new(t(3), "app.c", OperationKind::Update, json!({"_id": 1, "c": 3})))
            .unwrap();
        assert_eq!(storage.find("app.c", &json!(1)).unwrap(), json!({"_id": 1, "c": 3}));
    }

    #[test]
    fn test_commands() {
        let storage = MemoryStorage::new();
        storage
            .apply_one(&OplogEntry::command(t(1), "app", json!({"create": "users"})))
            .unwrap();
        assert!(storage.has_collection("app.users"));

        storage
            .apply_one(&OplogEntry::command(t(2), "app", json!({"drop": "users"})))
            .unwrap();
        assert!(!storage.has_collection("app.users"));

        let err = storage
            .apply_one(&OplogEntry::command(t(3), "app", json!({"compact": "users"})))
            .unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedCommand(_)));
    }

    #[test]
    fn test_snapshot_is_frozen() {
        let storage = MemoryStorage::new();
        storage
            .apply_one(&OplogEntry::insert(t(1), "app.c", json!({"_id": 1, "v": 1})))
            .unwrap();
        storage.create_snapshot(SnapshotName(1)).unwrap();
        storage
            .apply_one(&OplogEntry::update(t(2), "app.c", json!(1), json!({"v": 2})))
            .unwrap();

        let old = storage.find_at(SnapshotName(1), "app.c", &json!(1)).unwrap().unwrap();
        assert_eq!(old["v"], json!(1));
        assert_eq!(storage.find("app.c", &json!(1)).unwrap()["v"], json!(2));

        storage.drop_all_snapshots();
        assert!(matches!(
            storage.find_at(SnapshotName(1), "app.c", &json!(1)),
            Err(StorageError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_snapshots_unsupported() {
        let storage = MemoryStorage::without_snapshots();
        assert!(!storage.supports_snapshots());
        assert!(matches!(
            storage.create_snapshot(SnapshotName(1)),
            Err(StorageError::SnapshotsUnsupported)
        ));
    }

    #[test]
    fn test_reopen_replays_journal() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryStorageConfig {
            journal_path: Some(dir.path().join("journal.log")),
            ..MemoryStorageConfig::default()
        };

        {
            let storage = MemoryStorage::open(config.clone()).unwrap();
            storage
                .apply_one(&OplogEntry::insert(t(1), "app.c", json!({"_id": 1, "v": 1})))
                .unwrap();
            storage
                .apply_one(&OplogEntry::update(t(2), "app.c", json!(1), json!({"v": 5})))
                .unwrap();
            storage.set_applied_through(t(2)).unwrap();
            storage.admit_write(t(2));
            storage.commit_journal().unwrap();
        }

        let storage = MemoryStorage::open(config).unwrap();
        assert_eq!(storage.applied_through(), Some(t(2)));
        assert_eq!(storage.find("app.c", &json!(1)).unwrap()["v"], json!(5));
    }

    #[test]
    fn test_reset_clears_everything() {
        let storage = MemoryStorage::new();
        storage
            .apply_one(&OplogEntry::insert(t(1), "app.c", json!({"_id": 1})))
            .unwrap();
        storage.set_applied_through(t(1)).unwrap();
        storage.create_snapshot(SnapshotName(1)).unwrap();

        storage.reset().unwrap();
        assert_eq!(storage.document_count("app.c"), 0);
        assert_eq!(storage.applied_through(), None);
        assert_eq!(storage.snapshot_count(), 0);
    }

    #[test]
    fn test_shutdown_refuses_writes() {
        let storage = MemoryStorage::new();
        storage.shutdown();
        assert!(!storage.is_initialized());
        assert!(matches!(
            storage.apply_one(&OplogEntry::noop(t(1))),
            Err(StorageError::NotInitialized)
        ));
    }
}
