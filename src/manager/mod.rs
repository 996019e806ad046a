//! Replication lifecycle management
//!
//! `ReplicationManager` owns every background thread of the replication
//! data plane: the writer pool, the oplog producer, the applier driver, the
//! snapshot loop and the progress feedback loop. Threads are started once,
//! bound to a mode (initial sync, then steady state) and joined in a fixed
//! order on shutdown.

mod initial_sync;
mod threads;

pub use threads::{spawn_task, TaskHandle, ThreadNamer};

use crate::applier::{ApplierStatus, SyncTail, TailMode, WriterPool};
use crate::config::ReplSettings;
use crate::coordinator::{CommittedSnapshot, SnapshotCoordinator, Watermarks};
use crate::error::{ReplError, ReplResult};
use crate::ingestion::{BackgroundSync, FetcherOptions, HostAndPort, SyncSource, SyncSourceFeedback, SyncSourceTracker};
use crate::oplog::{OpTime, OplogBuffer};
use crate::persistence::{LastVote, LocalDocumentStore};
use crate::storage::StorageEngine;
use initial_sync::InitialSyncer;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of the manager as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotStarted,
    Running,
    ShuttingDown,
    Stopped,
}

/// Which buffer and apply semantics are active; only moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    Uninitialized,
    InitialSync,
    SteadyState,
}

/// Called once when initial sync finishes, with the OpTime the data set is
/// consistent at or the reason it gave up
pub type InitialSyncCallback = Box<dyn FnOnce(ReplResult<OpTime>) + Send + 'static>;

/// Snapshot of replication state for operators
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationStatus {
    pub node_id: Option<String>,
    pub lifecycle: LifecycleState,
    pub mode: ReplicationMode,
    pub applier: ApplierStatus,
    pub watermarks: Watermarks,
    pub last_fetched: OpTime,
    pub committed_snapshot: Option<CommittedSnapshot>,
    pub snapshots_enabled: bool,
    pub sync_source: Option<String>,
    pub buffered_entries: usize,
    pub buffered_bytes: usize,
}

/// State shared with the applier thread
struct Progress {
    initial_sync_complete: AtomicBool,
    applier: Mutex<ApplierStatus>,
}

impl Progress {
    fn set_status(&self, status: ApplierStatus) {
        *self.applier.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn status(&self) -> ApplierStatus {
        self.applier.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

struct Inner {
    state: LifecycleState,
    mode: ReplicationMode,
    settings: Option<ReplSettings>,
    node_id: Option<String>,
    pool: Option<Arc<WriterPool>>,
    bgsync: Option<Arc<BackgroundSync>>,
    buffer: Option<Arc<OplogBuffer>>,
    producer: Option<TaskHandle>,
    initial_sync: Option<TaskHandle>,
    applier: Option<TaskHandle>,
    snapshot: Option<TaskHandle>,
    feedback: Option<TaskHandle>,
    steady_state_started: bool,
}

/// Owner of the replication threads
pub struct ReplicationManager {
    storage: Arc<dyn StorageEngine>,
    source: Arc<dyn SyncSource>,
    documents: Arc<dyn LocalDocumentStore>,
    coordinator: Arc<SnapshotCoordinator>,
    tracker: Arc<SyncSourceTracker>,
    namer: ThreadNamer,
    progress: Arc<Progress>,
    inner: Mutex<Inner>,
}

impl ReplicationManager {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        source: Arc<dyn SyncSource>,
        documents: Arc<dyn LocalDocumentStore>,
    ) -> Self {
        ReplicationManager {
            coordinator: Arc::new(SnapshotCoordinator::new(storage.clone())),
            storage,
            source,
            documents,
            tracker: Arc::new(SyncSourceTracker::new()),
            namer: ThreadNamer::new(),
            progress: Arc::new(Progress {
                initial_sync_complete: AtomicBool::new(false),
                applier: Mutex::new(ApplierStatus::Idle),
            }),
            inner: Mutex::new(Inner {
                state: LifecycleState::NotStarted,
                mode: ReplicationMode::Uninitialized,
                settings: None,
                node_id: None,
                pool: None,
                bgsync: None,
                buffer: None,
                producer: None,
                initial_sync: None,
                applier: None,
                snapshot: None,
                feedback: None,
                steady_state_started: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the writer pool, the producer, the snapshot loop and the
    /// feedback loop. Only the first call starts anything; later calls
    /// return once the threads are up.
    ///
    /// Fails with `StorageNotInitialized` when storage cannot accept
    /// replicated writes; callers treat that as fatal.
    pub fn start_threads(&self, settings: ReplSettings) -> ReplResult<()> {
        settings.validate()?;
        let mut inner = self.lock();

        match inner.state {
            LifecycleState::Running => {
                debug!("Replication threads already started");
                return Ok(());
            }
            LifecycleState::ShuttingDown | LifecycleState::Stopped => {
                return Err(ReplError::IllegalState(
                    "replication threads cannot be restarted after shutdown".into(),
                ));
            }
            LifecycleState::NotStarted => {}
        }

        if !self.storage.is_initialized() {
            error!("Refusing to start replication: storage is not initialized");
            return Err(ReplError::StorageNotInitialized(
                "storage engine is not open for replicated writes".into(),
            ));
        }

        let node_id = self.ensure_me()?;
        self.storage.set_durability_listener(self.coordinator.clone());
        if let Some(applied) = self.storage.applied_through() {
            info!("Local data set is consistent through {}", applied);
            self.coordinator.record_recovered(applied);
        }

        let pool = Arc::new(WriterPool::new(settings.writer_threads, self.storage.clone(), &self.namer)?);
        let bgsync = Arc::new(BackgroundSync::new(
            self.source.clone(),
            self.tracker.clone(),
            FetcherOptions::from_settings(&settings),
        ));

        let snapshot = {
            let coordinator = self.coordinator.clone();
            let interval = settings.snapshot_interval();
            spawn_task(self.namer.next_name("repl-snapshot"), CancellationToken::new(), move |cancel| {
                coordinator.run(cancel, interval)
            })?
        };
        let producer = {
            let bgsync = bgsync.clone();
            spawn_task(self.namer.next_name("repl-producer"), CancellationToken::new(), move |cancel| {
                bgsync.run(cancel)
            })?
        };
        let feedback = {
            let feedback = SyncSourceFeedback::new(
                self.source.clone(),
                self.tracker.clone(),
                self.coordinator.clone(),
                node_id.clone(),
                settings.feedback_interval(),
            );
            spawn_task(self.namer.next_name("repl-feedback"), CancellationToken::new(), move |cancel| {
                feedback.run(cancel)
            })?
        };

        inner.node_id = Some(node_id);
        inner.pool = Some(pool);
        inner.bgsync = Some(bgsync);
        inner.snapshot = Some(snapshot);
        inner.producer = Some(producer);
        inner.feedback = Some(feedback);
        inner.settings = Some(settings);
        inner.state = LifecycleState::Running;
        info!("Replication threads started");
        Ok(())
    }

    /// Enter initial sync: create the initial-sync buffer, bind the producer
    /// to it and start the applier. `on_finished` runs exactly once, on the
    /// initial sync thread, and may start steady-state replication itself.
    /// No committed snapshot is published until initial sync has succeeded
    /// and `on_finished` has returned.
    pub fn start_initial_sync(&self, on_finished: InitialSyncCallback) -> ReplResult<()> {
        let mut inner = self.lock();
        Self::require_running(&inner)?;
        if inner.mode != ReplicationMode::Uninitialized {
            return Err(ReplError::IllegalState(format!(
                "cannot start initial sync in mode {:?}",
                inner.mode
            )));
        }
        let (settings, pool, bgsync) = Self::started_parts(&inner)?;

        // Committed reads must not be served while the data set is rebuilt
        self.coordinator.block_snapshots();

        let buffer = Arc::new(OplogBuffer::initial_sync(
            settings.initial_sync_buffer_limits(),
            settings.initial_sync_spill_path.clone(),
        ));
        let syncer = InitialSyncer {
            storage: self.storage.clone(),
            source: self.source.clone(),
            tracker: self.tracker.clone(),
            coordinator: self.coordinator.clone(),
            bgsync,
            pool,
            buffer: buffer.clone(),
            settings,
        };
        let progress = self.progress.clone();
        let coordinator = self.coordinator.clone();

        let initial_sync = spawn_task(self.namer.next_name("repl-initial-sync"), CancellationToken::new(), move |cancel| async move {
            progress.set_status(ApplierStatus::Running);
            let result = syncer.run(&cancel).await;
            let consistent = result.is_ok();
            match &result {
                Ok(_) => {
                    progress.initial_sync_complete.store(true, Ordering::SeqCst);
                    progress.set_status(ApplierStatus::Idle);
                }
                Err(ReplError::ShutdownInProgress) => progress.set_status(ApplierStatus::Stopped),
                Err(e) => {
                    error!("Initial sync failed: {}", e);
                    progress.set_status(ApplierStatus::Failed { reason: e.to_string() });
                }
            }
            on_finished(result);
            if consistent {
                coordinator.allow_snapshots();
            }
        })?;

        inner.mode = ReplicationMode::InitialSync;
        inner.buffer = Some(buffer);
        inner.initial_sync = Some(initial_sync);
        info!("Entered initial sync");
        Ok(())
    }

    /// Enter steady-state replication. Legal once initial sync has completed,
    /// or right after a restart on an already synced data set; only once.
    pub fn start_steady_state_replication(&self) -> ReplResult<()> {
        let mut inner = self.lock();
        Self::require_running(&inner)?;
        if inner.steady_state_started {
            return Err(ReplError::IllegalState("steady-state replication already started".into()));
        }
        match inner.mode {
            ReplicationMode::InitialSync if !self.progress.initial_sync_complete.load(Ordering::SeqCst) => {
                return Err(ReplError::IllegalState("initial sync has not completed".into()));
            }
            ReplicationMode::Uninitialized if self.storage.applied_through().is_none() => {
                return Err(ReplError::IllegalState(
                    "local data set is not synced; run initial sync first".into(),
                ));
            }
            _ => {}
        }
        let (settings, pool, bgsync) = Self::started_parts(&inner)?;

        // The initial sync thread may still be running `on_finished`, possibly
        // this very call; it is joined on shutdown
        let buffer = Arc::new(OplogBuffer::steady_state(settings.steady_state_buffer_limits()));
        let tail = SyncTail::new(
            buffer.clone(),
            pool,
            self.coordinator.clone(),
            settings.batch_limits(),
            TailMode::SteadyState,
        );
        let coordinator = self.coordinator.clone();
        let progress = self.progress.clone();
        let steady_buffer = buffer.clone();

        let applier = spawn_task(self.namer.next_name("repl-applier"), CancellationToken::new(), move |cancel| async move {
            bgsync.pause().await;
            bgsync.resume(steady_buffer, coordinator.last_applied(), None);
            progress.set_status(ApplierStatus::Running);

            match tail.run(None, &cancel).await {
                Ok(_) => progress.set_status(ApplierStatus::Stopped),
                Err(e) => {
                    error!("Steady-state apply halted, operator intervention required: {}", e);
                    progress.set_status(ApplierStatus::Failed { reason: e.to_string() });
                }
            }
        })?;

        inner.mode = ReplicationMode::SteadyState;
        inner.steady_state_started = true;
        inner.buffer = Some(buffer);
        inner.applier = Some(applier);
        info!("Entered steady-state replication");
        Ok(())
    }

    /// Stop every thread: producer, initial sync, applier, snapshot loop,
    /// feedback loop, then the writer pool. Safe to call at any time and more than once.
    pub fn shutdown(&self) {
        let (mut ordered, pool) = {
            let mut inner = self.lock();
            match inner.state {
                LifecycleState::NotStarted => {
                    inner.state = LifecycleState::Stopped;
                    info!("Replication shut down before start");
                    return;
                }
                LifecycleState::ShuttingDown | LifecycleState::Stopped => return,
                LifecycleState::Running => {}
            }
            inner.state = LifecycleState::ShuttingDown;
            info!("Shutting down replication");

            let ordered: Vec<TaskHandle> = [
                inner.producer.take(),
                inner.initial_sync.take(),
                inner.applier.take(),
                inner.snapshot.take(),
                inner.feedback.take(),
            ]
            .into_iter()
            .flatten()
            .collect();
            (ordered, inner.pool.take())
        };

        // Signal everything first so no thread waits on a peer that already exited
        for handle in &ordered {
            handle.cancel();
        }
        for handle in ordered.iter_mut() {
            handle.stop();
        }
        if let Some(pool) = pool {
            pool.shutdown();
        }

        if !matches!(self.progress.status(), ApplierStatus::Failed { .. }) {
            self.progress.set_status(ApplierStatus::Stopped);
        }
        self.lock().state = LifecycleState::Stopped;
        info!("Replication stopped");
    }

    fn require_running(inner: &Inner) -> ReplResult<()> {
        match inner.state {
            LifecycleState::Running => Ok(()),
            LifecycleState::NotStarted => Err(ReplError::IllegalState("replication threads not started".into())),
            LifecycleState::ShuttingDown | LifecycleState::Stopped => Err(ReplError::ShutdownInProgress),
        }
    }

    fn started_parts(inner: &Inner) -> ReplResult<(ReplSettings, Arc<WriterPool>, Arc<BackgroundSync>)> {
        match (&inner.settings, &inner.pool, &inner.bgsync) {
            (Some(settings), Some(pool), Some(bgsync)) => Ok((settings.clone(), pool.clone(), bgsync.clone())),
            _ => Err(ReplError::IllegalState("replication threads not started".into())),
        }
    }

    /// Stable identity of this node, created on first use
    pub fn ensure_me(&self) -> ReplResult<String> {
        if let Some(node_id) = self.documents.load_node_id()? {
            return Ok(node_id);
        }
        let node_id = uuid::Uuid::new_v4().to_string();
        self.documents.store_node_id(&node_id)?;
        info!("Generated node id {}", node_id);
        Ok(node_id)
    }

    pub fn load_local_config_document(&self) -> ReplResult<Option<Value>> {
        self.documents.load_config()
    }

    pub fn store_local_config_document(&self, config: &Value) -> ReplResult<()> {
        self.documents.store_config(config)
    }

    pub fn load_local_last_vote_document(&self) -> ReplResult<Option<LastVote>> {
        self.documents.load_last_vote()
    }

    pub fn store_local_last_vote_document(&self, vote: &LastVote) -> ReplResult<()> {
        self.documents.store_last_vote(vote)
    }

    /// Abandon the current sync source and choose another
    pub fn signal_choose_new_sync_source(&self) {
        self.tracker.choose_new();
    }

    /// Abort the in-flight fetch
    pub fn signal_cancel_fetcher(&self) {
        self.tracker.cancel_fetcher();
    }

    pub fn force_snapshot_creation(&self) {
        self.coordinator.force_snapshot_creation();
    }

    pub fn drop_all_snapshots(&self) {
        self.coordinator.drop_all_snapshots();
    }

    pub fn snapshots_enabled(&self) -> bool {
        self.coordinator.snapshots_enabled()
    }

    pub fn committed_snapshot(&self) -> Option<CommittedSnapshot> {
        self.coordinator.committed_snapshot()
    }

    /// Committed-level point read
    pub fn find_committed(&self, namespace: &str, id: &Value) -> ReplResult<Option<Value>> {
        self.coordinator.find_committed(namespace, id)
    }

    pub fn next_thread_name(&self, prefix: &str) -> String {
        self.namer.next_name(prefix)
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lock().state
    }

    pub fn mode(&self) -> ReplicationMode {
        self.lock().mode
    }

    pub fn applier_status(&self) -> ApplierStatus {
        self.progress.status()
    }

    pub fn watermarks(&self) -> Watermarks {
        self.coordinator.watermarks()
    }

    pub fn current_sync_source(&self) -> Option<HostAndPort> {
        self.tracker.current()
    }

    pub fn coordinator(&self) -> &Arc<SnapshotCoordinator> {
        &self.coordinator
    }

    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    pub fn status(&self) -> ReplicationStatus {
        let inner = self.lock();
        let (buffered_entries, buffered_bytes) = inner
            .buffer
            .as_ref()
            .map(|b| (b.count(), b.size_bytes()))
            .unwrap_or((0, 0));

        ReplicationStatus {
            node_id: inner.node_id.clone(),
            lifecycle: inner.state,
            mode: inner.mode,
            applier: self.progress.status(),
            watermarks: self.coordinator.watermarks(),
            last_fetched: inner.bgsync.as_ref().map(|b| b.last_fetched()).unwrap_or_else(OpTime::null),
            committed_snapshot: self.coordinator.committed_snapshot(),
            snapshots_enabled: self.coordinator.snapshots_enabled(),
            sync_source: self.tracker.current().map(|h| h.to_string()),
            buffered_entries,
            buffered_bytes,
        }
    }
}

impl Drop for ReplicationManager {
    fn drop(&mut self) {
        if self.lifecycle_state() == LifecycleState::Running {
            warn!("Replication manager dropped while running; shutting down");
            self.shutdown();
        }
    }
}
