//! Bounded hand-off queue between the producer and the applier driver
//!
//! One producer pushes, one driver pops. The steady-state variant blocks the
//! producer while full; the initial-sync variant never blocks and spills to disk
//! (or grows in memory) instead.

use super::spill::SpillFile;
use super::{OpTime, OplogEntry};
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Which mode owns the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    InitialSync,
    SteadyState,
}

/// Capacity of the in-memory part of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
}

/// Size limits of one apply batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_entries: usize,
    pub max_bytes: usize,
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer operation cancelled")]
    Cancelled,

    #[error("spill file error: {0}")]
    Spill(#[from] io::Error),
}

struct BufferState {
    queue: VecDeque<OplogEntry>,
    bytes: usize,
    spill: Option<SpillFile>,
    last_pushed: Option<OpTime>,
}

impl BufferState {
    fn spilled(&self) -> usize {
        self.spill.as_ref().map(|s| s.pending()).unwrap_or(0)
    }

    fn count(&self) -> usize {
        self.queue.len() + self.spilled()
    }

    fn has_room(&self, limits: &BufferLimits, size: usize) -> bool {
        // An oversized entry still fits into an empty buffer
        self.queue.is_empty()
            || (self.queue.len() < limits.max_entries && self.bytes + size <= limits.max_bytes)
    }

    fn enqueue(&mut self, entry: OplogEntry) {
        self.bytes += entry.size_bytes();
        self.last_pushed = Some(entry.op_time);
        self.queue.push_back(entry);
    }

    fn pop_front(&mut self, limits: &BufferLimits) -> io::Result<Option<OplogEntry>> {
        let entry = match self.queue.pop_front() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        self.bytes -= entry.size_bytes();
        self.refill(limits)?;
        Ok(Some(entry))
    }

    /// Move spilled entries back into memory while there is room
    fn refill(&mut self, limits: &BufferLimits) -> io::Result<()> {
        while self.spilled() > 0 {
            if self.queue.len() >= limits.max_entries {
                break;
            }
            let spill = match self.spill.as_mut() {
                Some(spill) => spill,
                None => break,
            };
            match spill.read_next()? {
                Some(entry) => {
                    self.bytes += entry.size_bytes();
                    self.queue.push_back(entry);
                }
                None => break,
            }
        }
        Ok(())
    }
}

/// Ordered oplog buffer
pub struct OplogBuffer {
    kind: BufferKind,
    limits: BufferLimits,
    spill_path: Option<PathBuf>,
    state: Mutex<BufferState>,
    not_empty: Notify,
    not_full: Notify,
}

impl OplogBuffer {
    /// Memory-bounded buffer that blocks the producer when full
    pub fn steady_state(limits: BufferLimits) -> Self {
        Self::new(BufferKind::SteadyState, limits, None)
    }

    /// Non-blocking buffer; overflow goes to `spill_path`, or to memory if unset
    pub fn initial_sync(limits: BufferLimits, spill_path: Option<PathBuf>) -> Self {
        Self::new(BufferKind::InitialSync, limits, spill_path)
    }

    fn new(kind: BufferKind, limits: BufferLimits, spill_path: Option<PathBuf>) -> Self {
        OplogBuffer {
            kind,
            limits,
            spill_path,
            state: Mutex::new(BufferState {
                queue: VecDeque::new(),
                bytes: 0,
                spill: None,
                last_pushed: None,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn limits(&self) -> BufferLimits {
        self.limits
    }

    /// Push one entry, waiting for room if the buffer is bounded and full
    pub async fn push(&self, entry: OplogEntry, cancel: &CancellationToken) -> Result<(), BufferError> {
        if self.kind == BufferKind::InitialSync {
            return self.push_even_if_full(entry);
        }

        let size = entry.size_bytes();
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.has_room(&self.limits, size) {
                    state.enqueue(entry);
                    drop(state);
                    self.not_empty.notify_waiters();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(BufferError::Cancelled),
            }
        }
    }

    /// Push without waiting; initial-sync buffers spill instead of growing memory
    pub fn push_even_if_full(&self, entry: OplogEntry) -> Result<(), BufferError> {
        let mut state = self.lock();

        let must_spill = self.kind == BufferKind::InitialSync
            && self.spill_path.is_some()
            && (state.spilled() > 0 || !state.has_room(&self.limits, entry.size_bytes()));

        if must_spill {
            if state.spill.is_none() {
                if let Some(path) = &self.spill_path {
                    state.spill = Some(SpillFile::create(path)?);
                }
            }
            if let Some(spill) = state.spill.as_mut() {
                spill.append(&entry)?;
            }
            state.last_pushed = Some(entry.op_time);
        } else {
            state.enqueue(entry);
        }

        drop(state);
        self.not_empty.notify_waiters();
        Ok(())
    }

    /// Pop the oldest entry without waiting
    pub fn try_pop(&self) -> Result<Option<OplogEntry>, BufferError> {
        let entry = self.lock().pop_front(&self.limits)?;
        if entry.is_some() {
            self.not_full.notify_waiters();
        }
        Ok(entry)
    }

    /// Pop the oldest entry, waiting while the buffer is empty
    pub async fn pop(&self, cancel: &CancellationToken) -> Result<OplogEntry, BufferError> {
        let limits = BatchLimits {
            max_entries: 1,
            max_bytes: usize::MAX,
        };
        let mut batch = self.pop_batch(&limits, cancel).await?;
        batch.pop().ok_or(BufferError::Cancelled)
    }

    /// Wait for at least one entry, then take a contiguous batch within `limits`
    pub async fn pop_batch(
        &self,
        limits: &BatchLimits,
        cancel: &CancellationToken,
    ) -> Result<Vec<OplogEntry>, BufferError> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.count() > 0 {
                    let batch = self.take_batch(&mut state, limits)?;
                    drop(state);
                    self.not_full.notify_waiters();
                    return Ok(batch);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(BufferError::Cancelled),
            }
        }
    }

    fn take_batch(&self, state: &mut BufferState, limits: &BatchLimits) -> io::Result<Vec<OplogEntry>> {
        let mut batch = Vec::new();
        let mut bytes = 0;

        while batch.len() < limits.max_entries {
            let size = match state.queue.front() {
                Some(front) => front.size_bytes(),
                None => break,
            };
            if !batch.is_empty() && bytes + size > limits.max_bytes {
                break;
            }
            match state.pop_front(&self.limits)? {
                Some(entry) => {
                    bytes += size;
                    batch.push(entry);
                }
                None => break,
            }
        }

        debug!("Took batch of {} entries ({} bytes) from {:?} buffer", batch.len(), bytes, self.kind);
        Ok(batch)
    }

    /// Wait up to `timeout` for the buffer to become non-empty
    pub async fn wait_for_data(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.not_empty.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if !self.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Clone of the oldest entry
    pub fn peek(&self) -> Option<OplogEntry> {
        self.lock().queue.front().cloned()
    }

    /// OpTime of the most recently pushed entry
    pub fn last_pushed(&self) -> Option<OpTime> {
        self.lock().last_pushed
    }

    /// Entries held, including spilled ones
    pub fn count(&self) -> usize {
        self.lock().count()
    }

    /// Bytes held in memory
    pub fn size_bytes(&self) -> usize {
        self.lock().bytes
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Discard every entry
    pub fn clear(&self) -> Result<(), BufferError> {
        {
            let mut state = self.lock();
            state.queue.clear();
            state.bytes = 0;
            state.last_pushed = None;
            if let Some(spill) = state.spill.as_mut() {
                spill.reset()?;
            }
        }
        self.not_full.notify_waiters();
        Ok(())
    }
}
