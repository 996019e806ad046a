//! Oplog producer
//!
//! Pulls entries from the sync source into whichever buffer it is currently
//! bound to. The manager rebinds it with `pause` / `resume` when the mode
//! changes or an initial sync attempt restarts.

use super::source::{FetchError, FetchOutcome, SyncSource, SyncSourceTracker};
use crate::config::ReplSettings;
use crate::oplog::{BufferError, OpTime, OplogBuffer, OplogEntry};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Producer tuning
#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub batch_max_entries: usize,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub failures_before_reselect: u32,
}

impl FetcherOptions {
    pub fn from_settings(settings: &ReplSettings) -> Self {
        FetcherOptions {
            batch_max_entries: settings.fetch_batch_max_entries,
            timeout: settings.fetch_timeout(),
            poll_interval: settings.fetch_poll_interval(),
            backoff_initial: settings.fetch_backoff_initial(),
            backoff_max: settings.fetch_backoff_max(),
            failures_before_reselect: settings.fetch_failures_before_reselect.max(1),
        }
    }
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self::from_settings(&ReplSettings::default())
    }
}

struct Binding {
    /// Bumped on every pause / resume
    generation: u64,
    buffer: Option<Arc<OplogBuffer>>,
    last_fetched: OpTime,
    stop_after: Option<OpTime>,
}

/// Why the producer stopped waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Shutdown,
    Rebound,
    SourceChanged,
}

/// Run `fut` unless shutdown, a rebind or a source change comes first
async fn interruptible<F: Future>(
    fut: F,
    control: &mut watch::Receiver<u64>,
    cancel: &CancellationToken,
    cycle: &CancellationToken,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Shutdown),
        changed = control.changed() => Err(if changed.is_ok() { Interrupt::Rebound } else { Interrupt::Shutdown }),
        _ = cycle.cancelled() => Err(Interrupt::SourceChanged),
        out = fut => Ok(out),
    }
}

/// A fetched batch must continue strictly after `after`, in order
fn validate_order(after: OpTime, entries: &[OplogEntry]) -> Result<(), FetchError> {
    let mut previous = after;
    for (i, entry) in entries.iter().enumerate() {
        let in_order = if i == 0 {
            entry.op_time > previous
        } else {
            entry.op_time >= previous
        };
        if !in_order {
            return Err(FetchError::SourceUnusable(format!(
                "entry {} arrived after {}",
                entry.op_time, previous
            )));
        }
        previous = entry.op_time;
    }
    Ok(())
}

/// Producer side of the ingestion pipeline
pub struct BackgroundSync {
    source: Arc<dyn SyncSource>,
    tracker: Arc<SyncSourceTracker>,
    options: FetcherOptions,
    binding: Mutex<Binding>,
    control: watch::Sender<u64>,
    /// Generation the producer last parked at; `u64::MAX` once it has exited
    idle: watch::Sender<u64>,
}

impl BackgroundSync {
    pub fn new(source: Arc<dyn SyncSource>, tracker: Arc<SyncSourceTracker>, options: FetcherOptions) -> Self {
        let (control, _) = watch::channel(0);
        let (idle, _) = watch::channel(0);
        BackgroundSync {
            source,
            tracker,
            options,
            binding: Mutex::new(Binding {
                generation: 0,
                buffer: None,
                last_fetched: OpTime::null(),
                stop_after: None,
            }),
            control,
            idle,
        }
    }

    fn binding(&self) -> MutexGuard<'_, Binding> {
        self.binding.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn tracker(&self) -> &Arc<SyncSourceTracker> {
        &self.tracker
    }

    /// Newest OpTime pushed into the bound buffer
    pub fn last_fetched(&self) -> OpTime {
        self.binding().last_fetched
    }

    pub fn is_active(&self) -> bool {
        self.binding().buffer.is_some()
    }

    /// Unbind the buffer and wait until the producer no longer touches it
    pub async fn pause(&self) {
        let generation = {
            let mut binding = self.binding();
            binding.generation += 1;
            binding.buffer = None;
            binding.generation
        };
        self.control.send_replace(generation);

        let mut idle = self.idle.subscribe();
        let _ = idle.wait_for(|parked| *parked >= generation).await;
        debug!("Producer paused at generation {}", generation);
    }

    /// Bind `buffer` and fetch from `start_after`, stopping once `stop_after`
    /// has been pushed
    pub fn resume(&self, buffer: Arc<OplogBuffer>, start_after: OpTime, stop_after: Option<OpTime>) {
        let generation = {
            let mut binding = self.binding();
            binding.generation += 1;
            binding.buffer = Some(buffer);
            binding.last_fetched = start_after;
            binding.stop_after = stop_after;
            binding.generation
        };
        info!(
            "Producer resuming after {} (stop after {:?})",
            start_after,
            stop_after.map(|op| op.to_string())
        );
        self.control.send_replace(generation);
    }

    fn position(&self) -> (OpTime, Option<OpTime>) {
        let binding = self.binding();
        (binding.last_fetched, binding.stop_after)
    }

    /// Record a pushed entry, unless the producer was rebound meanwhile
    fn advance(&self, generation: u64, op_time: OpTime) {
        let mut binding = self.binding();
        if binding.generation == generation && op_time > binding.last_fetched {
            binding.last_fetched = op_time;
        }
    }

    /// Producer thread body
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Oplog producer started");
        let mut control = self.control.subscribe();

        loop {
            control.borrow_and_update();
            let (generation, buffer) = {
                let binding = self.binding();
                (binding.generation, binding.buffer.clone())
            };

            let buffer = match buffer {
                Some(buffer) => buffer,
                None => {
                    self.idle.send_replace(generation);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = control.changed() => if changed.is_err() { break },
                    }
                    continue;
                }
            };

            match self.run_bound(generation, &buffer, &mut control, &cancel).await {
                Interrupt::Shutdown => break,
                Interrupt::Rebound | Interrupt::SourceChanged => continue,
            }
        }

        self.idle.send_replace(u64::MAX);
        info!("Oplog producer stopped");
    }

    /// Fetch into `buffer` until rebound or shut down
    async fn run_bound(
        &self,
        generation: u64,
        buffer: &OplogBuffer,
        control: &mut watch::Receiver<u64>,
        cancel: &CancellationToken,
    ) -> Interrupt {
        let mut failures = 0u32;
        let mut backoff = self.options.backoff_initial;

        loop {
            let cycle = self.tracker.cycle_token();
            let (last_fetched, stop_after) = self.position();

            if let Some(stop) = stop_after {
                if last_fetched >= stop {
                    debug!("Producer reached stop point {}", stop);
                    match interruptible(std::future::pending::<()>(), control, cancel, &cycle).await {
                        Err(Interrupt::SourceChanged) | Ok(()) => continue,
                        Err(other) => return other,
                    }
                }
            }

            let host = match self.tracker.current() {
                Some(host) => host,
                None => match interruptible(self.source.choose_sync_source(last_fetched), control, cancel, &cycle).await {
                    Ok(Some(host)) => {
                        info!("Syncing from {}", host);
                        self.tracker.set_current(Some(host.clone()));
                        host
                    }
                    Ok(None) => {
                        warn!("No sync source available, retrying in {:?}", backoff);
                        match interruptible(tokio::time::sleep(backoff), control, cancel, &cycle).await {
                            Ok(()) | Err(Interrupt::SourceChanged) => {}
                            Err(other) => return other,
                        }
                        backoff = (backoff * 2).min(self.options.backoff_max);
                        continue;
                    }
                    Err(Interrupt::SourceChanged) => continue,
                    Err(other) => return other,
                },
            };

            let fetch = tokio::time::timeout(
                self.options.timeout,
                self.source.fetch_next(&host, last_fetched, self.options.batch_max_entries),
            );
            let outcome = match interruptible(fetch, control, cancel, &cycle).await {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => Err(FetchError::Retryable(format!("fetch from {} timed out", host))),
                Err(Interrupt::SourceChanged) => {
                    info!("Fetch cycle against {} aborted", host);
                    continue;
                }
                Err(other) => return other,
            };

            match outcome.and_then(|o| match o {
                FetchOutcome::Batch(entries) => validate_order(last_fetched, &entries).map(|_| FetchOutcome::Batch(entries)),
                exhausted => Ok(exhausted),
            }) {
                Ok(FetchOutcome::Batch(entries)) => {
                    failures = 0;
                    debug!("Fetched {} entries from {}", entries.len(), host);

                    let mut stalled = false;
                    for entry in entries {
                        if matches!(stop_after, Some(stop) if entry.op_time > stop) {
                            break;
                        }
                        let op_time = entry.op_time;
                        match interruptible(buffer.push(entry, cancel), control, cancel, &cycle).await {
                            Ok(Ok(())) => self.advance(generation, op_time),
                            Ok(Err(BufferError::Cancelled)) => return Interrupt::Shutdown,
                            Ok(Err(e)) => {
                                error!("Failed to buffer {}, retrying in {:?}: {}", op_time, backoff, e);
                                stalled = true;
                                break;
                            }
                            // The rest of the batch is fetched again from the last pushed entry
                            Err(Interrupt::SourceChanged) => break,
                            Err(other) => return other,
                        }
                    }

                    if stalled {
                        match interruptible(tokio::time::sleep(backoff), control, cancel, &cycle).await {
                            Ok(()) | Err(Interrupt::SourceChanged) => {}
                            Err(other) => return other,
                        }
                        backoff = (backoff * 2).min(self.options.backoff_max);
                    } else {
                        backoff = self.options.backoff_initial;
                    }
                }
                Ok(FetchOutcome::Exhausted) => {
                    match interruptible(tokio::time::sleep(self.options.poll_interval), control, cancel, &cycle).await {
                        Ok(()) | Err(Interrupt::SourceChanged) => {}
                        Err(other) => return other,
                    }
                }
                Err(FetchError::SourceUnusable(reason)) => {
                    warn!("Sync source {} unusable: {}", host, reason);
                    self.tracker.choose_new();
                    failures = 0;
                }
                Err(FetchError::Retryable(reason)) => {
                    failures += 1;
                    warn!("Fetch from {} failed ({} in a row): {}", host, failures, reason);
                    if failures >= self.options.failures_before_reselect {
                        warn!("Too many failures against {}, choosing a new sync source", host);
                        self.tracker.choose_new();
                        failures = 0;
                        backoff = self.options.backoff_initial;
                        continue;
                    }
                    match interruptible(tokio::time::sleep(backoff), control, cancel, &cycle).await {
                        Ok(()) | Err(Interrupt::SourceChanged) => {}
                        Err(other) => return other,
                    }
                    backoff = (backoff * 2).min(self.options.backoff_max);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::{HostAndPort, InMemorySyncSource};
    use crate::oplog::BufferLimits;
    use serde_json::json;

    fn t(i: u32) -> OpTime {
        OpTime::new(i, 0, 1)
    }

    fn options() -> FetcherOptions {
        FetcherOptions {
            batch_max_entries: 3,
            timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            failures_before_reselect: 2,
        }
    }

    fn source_with(n: u32, hosts: &[&str]) -> Arc<InMemorySyncSource> {
        let source = Arc::new(InMemorySyncSource::with_hosts(hosts));
        for i in 1..=n {
            source.append(OplogEntry::insert(t(i), "app.c", json!({"_id": i}))).unwrap();
        }
        source
    }

    fn buffer(max_entries: usize) -> Arc<OplogBuffer> {
        Arc::new(OplogBuffer::steady_state(BufferLimits {
            max_entries,
            max_bytes: usize::MAX,
        }))
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fetches_everything_in_order() {
        let source = source_with(10, &["a:1"]);
        let bgsync = Arc::new(BackgroundSync::new(source, Arc::new(SyncSourceTracker::new()), options()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bgsync.clone().run(cancel.clone()));

        let buf = buffer(100);
        bgsync.resume(buf.clone(), OpTime::null(), None);
        assert!(wait_until(|| buf.count() == 10).await);
        assert_eq!(bgsync.last_fetched(), t(10));

        let mut seen = Vec::new();
        while let Some(e) = buf.try_pop().unwrap() {
            seen.push(e.op_time);
        }
        assert_eq!(seen, (1..=10).map(t).collect::<Vec<_>>());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_buffer_blocks_and_shutdown_unblocks() {
        let source = source_with(10, &["a:1"]);
        let bgsync = Arc::new(BackgroundSync::new(source, Arc::new(SyncSourceTracker::new()), options()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bgsync.clone().run(cancel.clone()));

        let buf = buffer(2);
        bgsync.resume(buf.clone(), OpTime::null(), None);
        assert!(wait_until(|| buf.count() == 2).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(buf.count(), 2);
        assert_eq!(bgsync.last_fetched(), t(2));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_point_and_rebind() {
        let source = source_with(10, &["a:1"]);
        let bgsync = Arc::new(BackgroundSync::new(source, Arc::new(SyncSourceTracker::new()), options()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bgsync.clone().run(cancel.clone()));

        let first = buffer(100);
        bgsync.resume(first.clone(), OpTime::null(), Some(t(4)));
        assert!(wait_until(|| bgsync.last_fetched() == t(4)).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(first.count(), 4);

        bgsync.pause().await;
        assert!(!bgsync.is_active());

        let second = buffer(100);
        bgsync.resume(second.clone(), t(4), None);
        assert!(wait_until(|| second.count() == 6).await);
        assert_eq!(first.count(), 4);
        assert_eq!(second.peek().unwrap().op_time, t(5));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retries_then_reselects_source() {
        let source = source_with(3, &["a:1", "b:2"]);
        source.fail_next_fetches(2, FetchError::Retryable("connection reset".into()));
        let tracker = Arc::new(SyncSourceTracker::new());
        let bgsync = Arc::new(BackgroundSync::new(source.clone(), tracker.clone(), options()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bgsync.clone().run(cancel.clone()));

        let buf = buffer(100);
        bgsync.resume(buf.clone(), OpTime::null(), None);
        assert!(wait_until(|| buf.count() == 3).await);
        // Two failures against the first host trigger a switch to the second
        assert_eq!(tracker.current(), Some(HostAndPort::new("b", 2)));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_choose_new_source_aborts_hung_fetch() {
        let source = source_with(3, &["a:1", "b:2"]);
        source.set_fetch_delay(Some(Duration::from_secs(60)));
        let tracker = Arc::new(SyncSourceTracker::new());
        let mut opts = options();
        opts.timeout = Duration::from_secs(120);
        let bgsync = Arc::new(BackgroundSync::new(source.clone(), tracker.clone(), opts));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bgsync.clone().run(cancel.clone()));

        let buf = buffer(100);
        bgsync.resume(buf.clone(), OpTime::null(), None);
        assert!(wait_until(|| source.fetch_calls() == 1).await);

        source.set_fetch_delay(None);
        tracker.choose_new();
        assert!(wait_until(|| buf.count() == 3).await);
        assert_eq!(tracker.current(), Some(HostAndPort::new("b", 2)));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_buffer_failure_backs_off_before_refetching() {
        let dir = tempfile::tempdir().unwrap();
        let source = source_with(10, &["a:1"]);
        let mut opts = options();
        opts.backoff_initial = Duration::from_millis(20);
        opts.backoff_max = Duration::from_millis(50);
        let bgsync = Arc::new(BackgroundSync::new(source.clone(), Arc::new(SyncSourceTracker::new()), opts));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bgsync.clone().run(cancel.clone()));

        // The second entry has to spill, and the spill directory does not exist
        let buf = Arc::new(OplogBuffer::initial_sync(
            BufferLimits {
                max_entries: 1,
                max_bytes: usize::MAX,
            },
            Some(dir.path().join("missing").join("spill.bin")),
        ));
        bgsync.resume(buf.clone(), OpTime::null(), None);
        assert!(wait_until(|| buf.count() == 1).await);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(buf.count(), 1);
        assert_eq!(bgsync.last_fetched(), t(1));
        let calls = source.fetch_calls();
        assert!(calls < 20, "refetched {} times without backing off", calls);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[test]
    fn test_out_of_order_batch_rejected() {
        let entries = vec![OplogEntry::noop(t(3)), OplogEntry::noop(t(2))];
        assert!(validate_order(t(1), &entries).is_err());
        assert!(validate_order(t(3), &[OplogEntry::noop(t(3))]).is_err());
        assert!(validate_order(t(1), &[OplogEntry::noop(t(2)), OplogEntry::noop(t(4))]).is_ok());
    }
}
