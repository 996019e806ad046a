//! Sync source contract

use crate::oplog::{OpTime, OplogEntry};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Address of a replica set member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        HostAndPort {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAndPort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in {:?}", s))?;
        if host.is_empty() {
            return Err(format!("missing host in {:?}", s));
        }
        let port = port.parse().map_err(|_| format!("invalid port in {:?}", s))?;
        Ok(HostAndPort::new(host, port))
    }
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Network trouble or timeout; retry with backoff
    #[error("retryable fetch error: {0}")]
    Retryable(String),

    /// The source cannot serve us (rolled back, too stale, out of order)
    #[error("sync source unusable: {0}")]
    SourceUnusable(String),
}

/// Result of one fetch round
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Entries after the requested position, in order
    Batch(Vec<OplogEntry>),
    /// Nothing newer is available yet
    Exhausted,
}

/// Progress pushed upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub node_id: String,
    pub last_applied: OpTime,
    pub last_durable: OpTime,
}

/// Remote end of the replication stream
#[async_trait]
pub trait SyncSource: Send + Sync {
    /// Pick a member to sync from, or `None` if nobody is eligible
    async fn choose_sync_source(&self, last_fetched: OpTime) -> Option<HostAndPort>;

    /// Up to `max_entries` entries strictly after `after`
    async fn fetch_next(
        &self,
        source: &HostAndPort,
        after: OpTime,
        max_entries: usize,
    ) -> Result<FetchOutcome, FetchError>;

    /// Newest OpTime in the source's log
    async fn last_op_time(&self, source: &HostAndPort) -> Result<OpTime, FetchError>;

    /// Current version of one document, `None` if it no longer exists
    async fn fetch_missing_document(
        &self,
        source: &HostAndPort,
        namespace: &str,
        id: &Value,
    ) -> Result<Option<Value>, FetchError>;

    async fn report_progress(&self, source: &HostAndPort, update: &ProgressUpdate) -> Result<(), FetchError>;
}

/// Currently selected sync source and the fetch cycle bound to it.
///
/// Cancelling the cycle aborts whatever the producer is waiting on; the
/// producer then starts a new cycle with a fresh token.
pub struct SyncSourceTracker {
    current: RwLock<Option<HostAndPort>>,
    cycle: Mutex<CancellationToken>,
}

impl SyncSourceTracker {
    pub fn new() -> Self {
        SyncSourceTracker {
            current: RwLock::new(None),
            cycle: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn current(&self) -> Option<HostAndPort> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_current(&self, source: Option<HostAndPort>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = source;
    }

    /// Token of the running fetch cycle
    pub fn cycle_token(&self) -> CancellationToken {
        self.cycle.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn restart_cycle(&self) {
        let mut cycle = self.cycle.lock().unwrap_or_else(|e| e.into_inner());
        cycle.cancel();
        *cycle = CancellationToken::new();
    }

    /// Drop the current source and abort the fetch cycle
    pub fn choose_new(&self) {
        if let Some(old) = self.current.write().unwrap_or_else(|e| e.into_inner()).take() {
            info!("Abandoning sync source {}", old);
        }
        self.restart_cycle();
    }

    /// Abort the in-flight fetch but keep the source
    pub fn cancel_fetcher(&self) {
        info!("Cancelling oplog fetcher");
        self.restart_cycle();
    }
}

impl Default for SyncSourceTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Document lookups against the current sync source, used by initial-sync apply
#[derive(Clone)]
pub struct MissingDocumentSource {
    source: Arc<dyn SyncSource>,
    tracker: Arc<SyncSourceTracker>,
}

impl MissingDocumentSource {
    pub fn new(source: Arc<dyn SyncSource>, tracker: Arc<SyncSourceTracker>) -> Self {
        MissingDocumentSource { source, tracker }
    }

    pub async fn fetch(&self, namespace: &str, id: &Value) -> Result<Option<Value>, FetchError> {
        let host = self
            .tracker
            .current()
            .ok_or_else(|| FetchError::Retryable("no sync source selected".into()))?;
        self.source.fetch_missing_document(&host, namespace, id).await
    }
}
