//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM, SIGINT or Ctrl+C and then runs the registered shutdown
//! hooks, typically `shutdown_gracefully` on each transport builder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::signal;
use tracing::{debug, info, warn};

use crate::{lock, Result};

type ShutdownHook = Box<dyn FnOnce() + Send>;

/// Shutdown coordinator that turns a process signal into builder shutdowns
pub struct ShutdownCoordinator {
    hooks: Mutex<Vec<(String, ShutdownHook)>>,
    triggered: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
            triggered: AtomicBool::new(false),
        }
    }

    /// Run `hook` when shutdown is triggered. Hooks run in registration
    /// order. A hook registered after the trigger runs immediately.
    pub fn on_shutdown<F>(&self, name: &str, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut hooks = lock(&self.hooks);
            if !self.is_triggered() {
                hooks.push((name.to_string(), Box::new(hook)));
                return;
            }
        }
        debug!("Shutdown already triggered, running hook {} now", name);
        hook();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Start listening for shutdown signals (SIGTERM, SIGINT)
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Run every hook. Only the first call has an effect.
    pub fn trigger(&self) {
        let hooks = {
            let mut hooks = lock(&self.hooks);
            if self.triggered.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *hooks)
        };

        for (name, hook) in hooks {
            info!("Shutting down {}", name);
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook)).is_err() {
                warn!("Shutdown hook {} panicked", name);
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
