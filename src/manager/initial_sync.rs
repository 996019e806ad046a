//! Initial sync driver
//!
//! Each attempt wipes local data, binds the producer to the initial-sync
//! buffer and applies the source's log from the beginning through the
//! source's last OpTime at attempt start.

use crate::applier::{SyncTail, TailExit, TailMode, WriterPool};
use crate::config::ReplSettings;
use crate::coordinator::SnapshotCoordinator;
use crate::error::{ReplError, ReplResult};
use crate::ingestion::{BackgroundSync, FetchError, HostAndPort, MissingDocumentSource, SyncSource, SyncSourceTracker};
use crate::oplog::{OpTime, OplogBuffer};
use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) struct InitialSyncer {
    pub storage: Arc<dyn StorageEngine>,
    pub source: Arc<dyn SyncSource>,
    pub tracker: Arc<SyncSourceTracker>,
    pub coordinator: Arc<SnapshotCoordinator>,
    pub bgsync: Arc<BackgroundSync>,
    pub pool: Arc<WriterPool>,
    pub buffer: Arc<OplogBuffer>,
    pub settings: ReplSettings,
}

impl InitialSyncer {
    /// Run attempts until one succeeds, the attempt budget is spent or
    /// shutdown is requested. Returns the OpTime the data set is consistent at.
    pub async fn run(&self, cancel: &CancellationToken) -> ReplResult<OpTime> {
        let max_attempts = self.settings.initial_sync_max_attempts;
        let mut reason = String::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(ReplError::ShutdownInProgress);
            }
            info!("Initial sync attempt {}/{}", attempt, max_attempts);

            match self.attempt(cancel).await {
                Ok(op_time) => {
                    info!("Initial sync done at {} after {} attempt(s)", op_time, attempt);
                    return Ok(op_time);
                }
                Err(ReplError::ShutdownInProgress) => return Err(ReplError::ShutdownInProgress),
                Err(e) => {
                    warn!("Initial sync attempt {} failed: {}", attempt, e);
                    reason = e.to_string();
                }
            }

            if attempt < max_attempts {
                let delay = self.retry_delay(attempt);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ReplError::ShutdownInProgress),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(ReplError::InitialSyncFailed {
            attempts: max_attempts,
            reason,
        })
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(10);
        (self.settings.fetch_backoff_initial() * factor).min(self.settings.fetch_backoff_max())
    }

    async fn attempt(&self, cancel: &CancellationToken) -> ReplResult<OpTime> {
        self.bgsync.pause().await;
        self.buffer.clear()?;
        self.storage.reset()?;
        self.coordinator.reset_for_initial_sync();

        let host = self.select_source(cancel).await?;
        let fetch = tokio::time::timeout(self.settings.fetch_timeout(), self.source.last_op_time(&host));
        let min_valid = tokio::select! {
            _ = cancel.cancelled() => return Err(ReplError::ShutdownInProgress),
            result = fetch => match result {
                Ok(op_time) => op_time?,
                Err(_) => return Err(FetchError::Retryable(format!("last OpTime from {} timed out", host)).into()),
            },
        };
        info!("Initial sync from {} through {}", host, min_valid);

        self.bgsync.resume(self.buffer.clone(), OpTime::null(), Some(min_valid));

        let tail = SyncTail::new(
            self.buffer.clone(),
            self.pool.clone(),
            self.coordinator.clone(),
            self.settings.batch_limits(),
            TailMode::InitialSync {
                missing: Some(MissingDocumentSource::new(self.source.clone(), self.tracker.clone())),
                max_retries: self.settings.initial_sync_missing_doc_retries,
            },
        );

        match tail.run(Some(min_valid), cancel).await? {
            TailExit::ReachedStopPoint(op_time) => Ok(op_time),
            TailExit::Cancelled => Err(ReplError::ShutdownInProgress),
        }
    }

    async fn select_source(&self, cancel: &CancellationToken) -> ReplResult<HostAndPort> {
        let mut backoff = self.settings.fetch_backoff_initial();
        loop {
            if let Some(host) = self.tracker.current() {
                return Ok(host);
            }
            let chosen = tokio::select! {
                _ = cancel.cancelled() => return Err(ReplError::ShutdownInProgress),
                chosen = self.source.choose_sync_source(OpTime::null()) => chosen,
            };
            match chosen {
                Some(host) => {
                    info!("Initial sync source is {}", host);
                    self.tracker.set_current(Some(host.clone()));
                    return Ok(host);
                }
                None => {
                    warn!("No sync source available for initial sync, retrying in {:?}", backoff);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ReplError::ShutdownInProgress),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.settings.fetch_backoff_max());
                }
            }
        }
    }
}
