//! Task Module
//!
//! Connection-scoped timers with exactly-once cancellation.

pub mod registry;
pub mod slot;
pub mod timer;

pub use registry::{
    ScheduledTask, ScheduledTaskHandle, TaskRegistry, TaskState, AUTO_DISCONNECT_TASK,
};
pub use slot::CancellationSlot;
pub use timer::{TaskContext, TimerHandle};
