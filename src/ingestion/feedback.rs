//! Upstream progress reporting

use super::source::{ProgressUpdate, SyncSource, SyncSourceTracker};
use crate::coordinator::SnapshotCoordinator;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reports `{node_id, last_applied, last_durable}` to the current sync source
/// whenever it changes, and at least once per interval.
pub struct SyncSourceFeedback {
    source: Arc<dyn SyncSource>,
    tracker: Arc<SyncSourceTracker>,
    coordinator: Arc<SnapshotCoordinator>,
    node_id: String,
    interval: Duration,
}

impl SyncSourceFeedback {
    pub fn new(
        source: Arc<dyn SyncSource>,
        tracker: Arc<SyncSourceTracker>,
        coordinator: Arc<SnapshotCoordinator>,
        node_id: String,
        interval: Duration,
    ) -> Self {
        SyncSourceFeedback {
            source,
            tracker,
            coordinator,
            node_id,
            interval,
        }
    }

    /// Current local progress. The durable position only ever comes from
    /// confirmed durability.
    pub fn current_update(&self) -> ProgressUpdate {
        let watermarks = self.coordinator.watermarks();
        ProgressUpdate {
            node_id: self.node_id.clone(),
            last_applied: watermarks.last_applied,
            last_durable: watermarks.last_durable,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Sync source feedback started for node {}", self.node_id);
        let mut last_sent: Option<ProgressUpdate> = None;
        let mut last_sent_at = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.coordinator.progress_changed() => {}
            }

            let host = match self.tracker.current() {
                Some(host) => host,
                None => continue,
            };
            let update = self.current_update();
            let due = last_sent_at.elapsed() >= self.interval;
            if !due && last_sent.as_ref() == Some(&update) {
                continue;
            }

            let report = self.source.report_progress(&host, &update);
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = tokio::time::timeout(self.interval, report) => result,
            };
            match result {
                Ok(Ok(())) => {
                    debug!("Reported progress to {}: applied {}, durable {}", host, update.last_applied, update.last_durable);
                    last_sent = Some(update);
                    last_sent_at = Instant::now();
                }
                Ok(Err(e)) => warn!("Failed to report progress to {}: {}", host, e),
                Err(_) => warn!("Progress report to {} timed out", host),
            }
        }
        info!("Sync source feedback stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::{HostAndPort, InMemorySyncSource};
    use crate::oplog::{OpTime, OplogEntry};
    use crate::storage::{MemoryStorage, StorageEngine};
    use serde_json::json;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reports_never_ahead_of_durability() {
        let storage = Arc::new(MemoryStorage::new());
        let coordinator = Arc::new(SnapshotCoordinator::new(storage.clone()));
        storage.set_durability_listener(coordinator.clone());

        let source = Arc::new(InMemorySyncSource::with_hosts(&["up:1"]));
        let tracker = Arc::new(SyncSourceTracker::new());
        tracker.set_current(Some(HostAndPort::new("up", 1)));

        let feedback = SyncSourceFeedback::new(
            source.clone(),
            tracker,
            coordinator.clone(),
            "node-a".to_string(),
            Duration::from_millis(10),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(feedback.run(cancel.clone()));

        let op = OpTime::new(5, 0, 1);
        storage.apply_one(&OplogEntry::insert(op, "app.c", json!({"_id": 1}))).unwrap();
        coordinator.record_applied(op);
        coordinator.admit(op);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reports = source.progress_reports();
        assert!(!reports.is_empty());
        let (host, last) = reports.last().unwrap();
        assert_eq!(host, &HostAndPort::new("up", 1));
        assert_eq!(last.node_id, "node-a");
        assert_eq!(last.last_applied, op);
        assert!(last.last_durable.is_null());

        storage.commit_journal().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.progress_reports().last().unwrap().1.last_durable, op);

        cancel.cancel();
        task.await.unwrap();
    }
}
