//! Storage journal
//!
//! Applied entries, applied-through markers and resets are appended to a
//! checksummed log. A commit makes everything admitted so far durable and
//! notifies the durability listener with the highest admitted token.

use super::{DurabilityListener, JournalToken};
use crate::oplog::{self, CodecError, OpTime, OplogEntry};
use bytes::{Buf, BufMut, BytesMut};
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// When admitted writes become durable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Commit on every admission (safest, slowest)
    Always,
    /// Background commit every `journal_commit_interval` (balanced)
    #[default]
    Interval,
    /// Only on explicit `commit` calls
    Manual,
}

/// One journal record
#[derive(Debug, Clone, PartialEq)]
pub enum JournalRecord {
    Apply(OplogEntry),
    AppliedThrough(OpTime),
    Reset,
}

const TAG_APPLY: u8 = 1;
const TAG_APPLIED_THROUGH: u8 = 2;
const TAG_RESET: u8 = 3;

impl JournalRecord {
    /// Serialize to a checksummed frame
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = BytesMut::new();
        match self {
            JournalRecord::Apply(entry) => {
                body.put_u8(TAG_APPLY);
                body.put_slice(&entry.to_bytes());
            }
            JournalRecord::AppliedThrough(op_time) => {
                body.put_u8(TAG_APPLIED_THROUGH);
                body.put_u32_le(op_time.timestamp.secs);
                body.put_u32_le(op_time.timestamp.inc);
                body.put_i64_le(op_time.term);
            }
            JournalRecord::Reset => body.put_u8(TAG_RESET),
        }
        oplog::encode_frame(&body)
    }

    fn decode_body(mut body: &[u8]) -> Result<Self, CodecError> {
        if !body.has_remaining() {
            return Err(CodecError::Truncated);
        }
        match body.get_u8() {
            TAG_APPLY => {
                let (entry, _) = OplogEntry::from_bytes(body)?;
                Ok(JournalRecord::Apply(entry))
            }
            TAG_APPLIED_THROUGH => {
                if body.remaining() < 16 {
                    return Err(CodecError::Truncated);
                }
                let secs = body.get_u32_le();
                let inc = body.get_u32_le();
                let term = body.get_i64_le();
                Ok(JournalRecord::AppliedThrough(OpTime::new(secs, inc, term)))
            }
            TAG_RESET => Ok(JournalRecord::Reset),
            other => Err(CodecError::InvalidTag(other)),
        }
    }
}

/// Read every intact record of a journal file.
///
/// Stops at the first damaged record: a torn tail from a crash mid-write is
/// expected, and anything after it cannot be trusted.
pub fn read_journal<P: AsRef<Path>>(path: P) -> io::Result<Vec<JournalRecord>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    loop {
        match oplog::read_frame(&mut reader) {
            Ok(Some(body)) => match JournalRecord::decode_body(&body) {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!("Failed to decode journal record {}: {}", records.len(), e);
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Journal ends with a damaged record after {} records: {}", records.len(), e);
                break;
            }
        }
    }

    info!("Journal loaded: {} records", records.len());
    Ok(records)
}

/// Append-only journal file
pub struct JournalWriter {
    file: Mutex<BufWriter<File>>,
}

impl JournalWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JournalWriter {
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BufWriter<File>> {
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self, record: &JournalRecord) -> io::Result<()> {
        self.lock().write_all(&record.to_bytes())
    }

    /// Flush and fsync
    pub fn sync(&self) -> io::Result<()> {
        let mut file = self.lock();
        file.flush()?;
        file.get_ref().sync_data()
    }
}

#[derive(Default)]
struct TokenState {
    next: u64,
    admitted: u64,
    durable: u64,
}

/// Token issuance and durability notification
pub struct Journal {
    writer: Option<JournalWriter>,
    policy: SyncPolicy,
    tokens: Mutex<TokenState>,
    commit_lock: Mutex<()>,
    listener: RwLock<Option<Arc<dyn DurabilityListener>>>,
}

impl Journal {
    /// Journal without a backing file; commits only advance tokens
    pub fn in_memory(policy: SyncPolicy) -> Self {
        Self::with_writer(None, policy)
    }

    pub fn open<P: AsRef<Path>>(path: P, policy: SyncPolicy) -> io::Result<Self> {
        Ok(Self::with_writer(Some(JournalWriter::new(path)?), policy))
    }

    fn with_writer(writer: Option<JournalWriter>, policy: SyncPolicy) -> Self {
        Journal {
            writer,
            policy,
            tokens: Mutex::new(TokenState::default()),
            commit_lock: Mutex::new(()),
            listener: RwLock::new(None),
        }
    }

    fn tokens(&self) -> MutexGuard<'_, TokenState> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub fn set_listener(&self, listener: Arc<dyn DurabilityListener>) {
        *self.listener.write().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    /// Append a record (no-op without a backing file)
    pub fn record(&self, record: &JournalRecord) -> io::Result<()> {
        match &self.writer {
            Some(writer) => writer.write(record),
            None => Ok(()),
        }
    }

    /// Issue the next token
    pub fn admit(&self) -> JournalToken {
        let token = {
            let mut tokens = self.tokens();
            tokens.next += 1;
            tokens.admitted = tokens.next;
            JournalToken(tokens.next)
        };

        if self.policy == SyncPolicy::Always {
            if let Err(e) = self.commit() {
                error!("Journal commit after admission failed: {}", e);
            }
        }
        token
    }

    /// Make every admitted write durable; returns the token now durable, if it advanced
    pub fn commit(&self) -> io::Result<Option<JournalToken>> {
        let _serial = self.commit_lock.lock().unwrap_or_else(|e| e.into_inner());

        let target = {
            let tokens = self.tokens();
            if tokens.admitted <= tokens.durable {
                return Ok(None);
            }
            tokens.admitted
        };

        if let Some(writer) = &self.writer {
            writer.sync()?;
        }
        self.tokens().durable = target;

        let token = JournalToken(target);
        debug!("Journal durable through token {}", target);
        let listener = self.listener.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(listener) = listener {
            listener.on_durable(token);
        }
        Ok(Some(token))
    }

    pub fn durable_token(&self) -> JournalToken {
        JournalToken(self.tokens().durable)
    }
}

/// Background thread committing the journal on an interval
pub struct JournalCommitter {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl JournalCommitter {
    pub fn start(journal: Arc<Journal>, interval: Duration) -> io::Result<Self> {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = std::thread::Builder::new()
            .name("journal-committer".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create journal committer runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(async move {
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(interval) => {}
                        }
                        if let Err(e) = journal.commit() {
                            error!("Periodic journal commit failed: {}", e);
                        }
                    }
                    // Final commit so nothing admitted is left pending
                    let _ = journal.commit();
                });
                debug!("Journal committer stopped");
            })?;

        Ok(JournalCommitter {
            cancel,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for JournalCommitter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Recorder(AtomicU64);

    impl DurabilityListener for Recorder {
        fn on_durable(&self, token: JournalToken) {
            self.0.store(token.0, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_manual_commit_reports_highest_token() {
        let journal = Journal::in_memory(SyncPolicy::Manual);
        let recorder = Arc::new(Recorder(AtomicU64::new(0)));
        journal.set_listener(recorder.clone());

        assert_eq!(journal.admit(), JournalToken(1));
        assert_eq!(journal.admit(), JournalToken(2));
        assert_eq!(recorder.0.load(Ordering::SeqCst), 0);

        assert_eq!(journal.commit().unwrap(), Some(JournalToken(2)));
        assert_eq!(recorder.0.load(Ordering::SeqCst), 2);
        // Nothing new admitted
        assert_eq!(journal.commit().unwrap(), None);
    }

    #[test]
    fn test_always_policy_commits_on_admit() {
        let journal = Journal::in_memory(SyncPolicy::Always);
        let recorder = Arc::new(Recorder(AtomicU64::new(0)));
        journal.set_listener(recorder.clone());

        journal.admit();
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
        assert_eq!(journal.durable_token(), JournalToken(1));
    }

    #[test]
    fn test_interval_committer() {
        let journal = Arc::new(Journal::in_memory(SyncPolicy::Interval));
        let mut committer = JournalCommitter::start(journal.clone(), Duration::from_millis(10)).unwrap();
        journal.admit();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(journal.durable_token(), JournalToken(1));
        committer.stop();
    }

    #[test]
    fn test_journal_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        let journal = Journal::open(&path, SyncPolicy::Manual).unwrap();

        let entry = OplogEntry::insert(OpTime::new(1, 1, 1), "app.c", json!({"_id": 1}));
        journal.record(&JournalRecord::Apply(entry.clone())).unwrap();
        journal.record(&JournalRecord::AppliedThrough(OpTime::new(1, 1, 1))).unwrap();
        journal.record(&JournalRecord::Reset).unwrap();
        journal.admit();
        journal.commit().unwrap();

        let records = read_journal(&path).unwrap();
        assert_eq!(
            records,
            vec![
                JournalRecord::Apply(entry),
                JournalRecord::AppliedThrough(OpTime::new(1, 1, 1)),
                JournalRecord::Reset,
            ]
        );
    }
}
