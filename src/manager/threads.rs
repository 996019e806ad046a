//! Long-lived replication threads
//!
//! Each background component runs on its own OS thread with a dedicated
//! current-thread runtime, paired with a cancellation token. The manager owns
//! the handles and joins them in an explicit order.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Hands out unique thread names; diagnostic only
#[derive(Debug, Default)]
pub struct ThreadNamer {
    next_id: AtomicU64,
}

impl ThreadNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `prefix-N` with N unique for the process lifetime of this namer
    pub fn next_name(&self, prefix: &str) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", prefix, id)
    }
}

/// A running background thread and the token that stops it
pub struct TaskHandle {
    name: String,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(|j| j.is_finished()).unwrap_or(true)
    }

    /// Cancel and wait for the thread to exit
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if join.thread().id() == std::thread::current().id() {
                // Stopped from its own thread; it exits once this call returns
                debug!("Thread {} detached from itself", self.name);
                return;
            }
            if join.join().is_err() {
                error!("Thread {} panicked", self.name);
            } else {
                debug!("Thread {} joined", self.name);
            }
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn `body` on a named OS thread running its own current-thread runtime
pub fn spawn_task<F, Fut>(name: String, cancel: CancellationToken, body: F) -> io::Result<TaskHandle>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()>,
{
    let token = cancel.clone();
    let thread_name = name.clone();

    let join = std::thread::Builder::new().name(name.clone()).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                error!("Failed to create runtime for {}: {}", thread_name, e);
                return;
            }
        };
        runtime.block_on(body(token));
        info!("Thread {} exiting", thread_name);
    })?;

    info!("Thread {} started", name);
    Ok(TaskHandle {
        name,
        cancel,
        join: Some(join),
    })
}
