//! linewire
//!
//! Line-oriented TCP transport built on tokio. Transport builders own the
//! thread groups that run connection I/O and hand out bootstraps for
//! listening and connecting. The task registry schedules timers against a
//! connection and guarantees that each one is cancelled exactly once,
//! whether by connection close, by the caller or by the timer itself.

pub mod config;
pub mod connection;
pub mod demo;
pub mod shutdown;
pub mod task;
pub mod transport;

pub use config::{Config, TransportConfig};
pub use connection::{Connection, ConnectionAddressView, ConnectionHandler, Pipeline, PipelineInitializer};
pub use shutdown::ShutdownCoordinator;
pub use task::{ScheduledTask, ScheduledTaskHandle, TaskRegistry, TaskState};
pub use transport::{AcceptorBuilder, ConnectorBuilder, TransportBuilder};

/// Common error type for the transport
pub type Result<T> = anyhow::Result<T>;

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
