//! Thread groups
//!
//! A [`ThreadGroup`] is a dedicated multi-thread tokio runtime that runs I/O
//! work for the connections of one builder. The builder owns the group;
//! bootstraps only hold an [`Executor`], which can spawn onto the group but
//! never keeps it alive.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::{lock, Result};

/// Time allowed for the runtime's own threads to stop once tracked work is done
pub const QUIET_PERIOD: Duration = Duration::from_secs(2);

/// Runtime wrapper that never blocks when dropped.
///
/// Dropping a tokio runtime from inside async code panics, and builders are
/// routinely dropped there.
struct OwnedRuntime(Option<Runtime>);

impl OwnedRuntime {
    fn take(&mut self) -> Option<Runtime> {
        self.0.take()
    }
}

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

/// Pool of I/O threads owned by a transport builder
pub struct ThreadGroup {
    name: String,
    threads: usize,
    runtime: Mutex<OwnedRuntime>,
    handle: Handle,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    terminated: Arc<AtomicBool>,
}

impl ThreadGroup {
    /// Start a group with `threads` worker threads
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name(name)
            .enable_all()
            .build()
            .with_context(|| format!("Failed to start thread group {}", name))?;

        info!("Started thread group {} with {} threads", name, threads.max(1));

        Ok(Self {
            name: name.to_string(),
            threads: threads.max(1),
            handle: runtime.handle().clone(),
            runtime: Mutex::new(OwnedRuntime(Some(runtime))),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            terminated: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Default size of a worker group: the available parallelism
    pub fn default_threads() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub(crate) fn executor(&self) -> Executor {
        Executor::Group(GroupExecutor {
            name: self.name.clone(),
            handle: self.handle.clone(),
            tracker: self.tracker.clone(),
            shutdown: self.shutdown.clone(),
        })
    }

    /// Whether a shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Whether the runtime has fully stopped
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn terminated_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminated)
    }

    /// Reject new work, close live connections, give tracked tasks `grace`
    /// to finish, then stop the runtime.
    ///
    /// Returns immediately; the waiting happens on a reaper thread.
    pub fn shutdown_gracefully(&self, grace: Duration) {
        let Some(runtime) = lock(&self.runtime).take() else {
            return;
        };
        info!("Shutting down thread group {} gracefully", self.name);
        self.shutdown.cancel();
        self.tracker.close();

        let mut runtime = OwnedRuntime(Some(runtime));
        let tracker = self.tracker.clone();
        let terminated = Arc::clone(&self.terminated);
        let name = self.name.clone();

        let reaper = std::thread::Builder::new()
            .name(format!("{}-reaper", self.name))
            .spawn(move || {
                let Some(runtime) = runtime.take() else {
                    return;
                };
                let drained = runtime.block_on(async {
                    tokio::time::timeout(grace, tracker.wait()).await.is_ok()
                });
                if !drained {
                    warn!(
                        "Thread group {} still had {} tasks after {:?}, stopping anyway",
                        name,
                        tracker.len(),
                        grace
                    );
                }
                runtime.shutdown_timeout(QUIET_PERIOD);
                terminated.store(true, Ordering::Release);
                info!("Thread group {} terminated", name);
            });

        if let Err(e) = reaper {
            // the closure and its runtime were dropped without blocking
            error!("Failed to spawn reaper for thread group {}: {}", self.name, e);
            self.terminated.store(true, Ordering::Release);
        }
    }

    /// Stop at once, discarding work that has not started.
    ///
    /// Advisory for work already running: tasks are dropped at their next
    /// suspension point.
    pub fn shutdown_now(&self) {
        let Some(runtime) = lock(&self.runtime).take() else {
            return;
        };
        info!("Shutting down thread group {} now", self.name);
        self.shutdown.cancel();
        self.tracker.close();
        runtime.shutdown_background();
        self.terminated.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .field("shutting_down", &self.is_shutting_down())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Non-owning spawner for a thread group
#[derive(Clone)]
pub(crate) struct GroupExecutor {
    name: String,
    handle: Handle,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Where a bootstrap runs its I/O tasks
#[derive(Clone)]
pub(crate) enum Executor {
    /// The runtime of whoever calls bind/connect
    Inline,
    Group(GroupExecutor),
}

impl Executor {
    pub(crate) fn spawn<F>(&self, task: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self {
            Executor::Inline => {
                let handle = Handle::try_current()
                    .context("Inline transport needs a running tokio runtime")?;
                Ok(handle.spawn(task))
            }
            Executor::Group(group) => {
                if group.shutdown.is_cancelled() {
                    bail!("Thread group {} has been shut down", group.name);
                }
                debug!("Spawning task on thread group {}", group.name);
                Ok(group.tracker.spawn_on(task, &group.handle))
            }
        }
    }

    /// Token cancelled when the owning group starts shutting down
    pub(crate) fn shutdown_signal(&self) -> CancellationToken {
        match self {
            Executor::Inline => CancellationToken::new(),
            Executor::Group(group) => group.shutdown.clone(),
        }
    }

    pub(crate) fn describe(&self) -> &str {
        match self {
            Executor::Inline => "inline",
            Executor::Group(group) => &group.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_and_graceful_shutdown() {
        let group = ThreadGroup::new("test-group", 1).unwrap();
        let executor = group.executor();

        let (tx, rx) = std::sync::mpsc::channel();
        executor
            .spawn(async move {
                tx.send(42).unwrap();
            })
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);

        group.shutdown_gracefully(Duration::from_secs(1));
        assert!(group.is_shutting_down());
        assert!(executor.spawn(async {}).is_err());

        for _ in 0..100 {
            if group.is_terminated() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(group.is_terminated());

        // second request is a no-op
        group.shutdown_gracefully(Duration::from_secs(1));
        group.shutdown_now();
    }

    #[test]
    fn test_shutdown_now_terminates_immediately() {
        let group = ThreadGroup::new("test-now", 2).unwrap();
        group.shutdown_now();
        assert!(group.is_terminated());
        assert!(group.executor().spawn(async {}).is_err());
    }

    #[tokio::test]
    async fn test_drop_inside_async_context_does_not_panic() {
        let group = ThreadGroup::new("test-drop", 1).unwrap();
        drop(group);
    }

    #[test]
    fn test_inline_executor_requires_runtime() {
        assert!(Executor::Inline.spawn(async {}).is_err());
    }
}
