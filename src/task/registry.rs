//! Task Registry
//!
//! Schedules one-shot and repeating tasks against a connection and makes
//! sure each task is cancelled exactly once, whichever of connection close,
//! caller cancellation or the timer itself gets there first.
//!
//! Every registration owns a [`CancellationSlot`] and is stored on the
//! connection as an attribute. The path that consumes the slot decides the
//! task's final state; the others see an empty slot and do nothing. The
//! winner removes the attribute and the close listener, so nothing outlives
//! the task.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::slot::CancellationSlot;
use super::timer::{run_timer, TaskContext, TimerHandle};
use crate::connection::{AttributeKey, CloseListenerId, Connection};
use crate::Result;

type TaskAction = Box<dyn FnMut(&TaskContext) + Send + 'static>;

/// Name given to auto-disconnect tasks
pub const AUTO_DISCONNECT_TASK: &str = "auto-disconnect";

/// Lifecycle of one scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Waiting for the first firing
    Scheduled = 0,
    /// One-shot task that has fired
    Fired = 1,
    /// Periodic task that has fired at least once
    RepeatedlyFiring = 2,
    /// Timer stopped itself or its action panicked
    Stopped = 3,
    CancelledByClose = 4,
    CancelledByCaller = 5,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Scheduled,
            1 => TaskState::Fired,
            2 => TaskState::RepeatedlyFiring,
            3 => TaskState::Stopped,
            4 => TaskState::CancelledByClose,
            _ => TaskState::CancelledByCaller,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Scheduled | TaskState::RepeatedlyFiring)
    }
}

/// A named action to run against a connection
pub struct ScheduledTask {
    name: String,
    action: TaskAction,
}

impl ScheduledTask {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnMut(&TaskContext) + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(action),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct TaskShared {
    name: String,
    key: AttributeKey,
    slot: CancellationSlot,
    timer: TimerHandle,
    state: AtomicU8,
    fire_count: AtomicU64,
    connection: Weak<Connection>,
    close_listener: OnceLock<CloseListenerId>,
}

impl TaskShared {
    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Only the slot winner calls this
    fn finish(self: &Arc<Self>, state: TaskState, connection: Option<&Connection>) {
        self.state.store(state as u8, Ordering::Release);
        self.timer.stop();
        if let Some(connection) = connection {
            connection.remove_attribute_if(&self.key, self);
            if let Some(id) = self.close_listener.get() {
                connection.remove_close_listener(*id);
            }
        }
        debug!(task = %self.name, ?state, "Task finished");
    }

    fn finish_detached(self: &Arc<Self>, state: TaskState) {
        let connection = self.connection.upgrade();
        self.finish(state, connection.as_deref());
    }

    /// Cancel on behalf of the caller. True if the slot was still present.
    fn cancel(self: &Arc<Self>, connection: Option<&Connection>) -> bool {
        if !self.slot.take() {
            return false;
        }
        match connection {
            Some(connection) => self.finish(TaskState::CancelledByCaller, Some(connection)),
            None => self.finish_detached(TaskState::CancelledByCaller),
        }
        true
    }

    /// Run the action once, catching panics. Returns false if it panicked.
    fn fire(&self, action: &mut TaskAction, context: &TaskContext) -> bool {
        self.fire_count.fetch_add(1, Ordering::AcqRel);
        match catch_unwind(AssertUnwindSafe(|| action(context))) {
            Ok(()) => true,
            Err(_) => {
                error!(task = %self.name, fire = context.fire(), "Task action panicked, stopping its timer");
                false
            }
        }
    }
}

/// Caller's view of a scheduled task
#[derive(Clone)]
pub struct ScheduledTaskHandle {
    shared: Arc<TaskShared>,
}

impl ScheduledTaskHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    /// Number of times the action has run
    pub fn fire_count(&self) -> u64 {
        self.shared.fire_count.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.state(),
            TaskState::CancelledByClose | TaskState::CancelledByCaller
        )
    }

    /// Cancel the task. Returns true if this call won the cancellation;
    /// false if the task was already closed, cancelled or finished.
    pub fn cancel(&self) -> bool {
        self.shared.cancel(None)
    }
}

impl fmt::Debug for ScheduledTaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTaskHandle")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("fire_count", &self.fire_count())
            .finish()
    }
}

/// Schedules tasks on a tokio runtime, one timer task per registration
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    handle: Handle,
}

impl TaskRegistry {
    /// Registry whose timers run on `handle`
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Registry bound to the runtime of the caller
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current().context("Task registry needs a running tokio runtime")?;
        Ok(Self::new(handle))
    }

    /// Run `task` once after `delay`
    pub fn schedule_once(
        &self,
        connection: &Arc<Connection>,
        task: ScheduledTask,
        delay: Duration,
    ) -> Result<ScheduledTaskHandle> {
        self.schedule_repeating(connection, task, delay, Duration::ZERO)
    }

    /// Run `task` after `delay`, then every `period` after each firing ends.
    /// A zero `period` makes it one-shot.
    ///
    /// The task is cancelled when the connection closes. Scheduling against
    /// a closed connection returns a handle that is already cancelled.
    pub fn schedule_repeating(
        &self,
        connection: &Arc<Connection>,
        task: ScheduledTask,
        delay: Duration,
        period: Duration,
    ) -> Result<ScheduledTaskHandle> {
        self.schedule(
            connection,
            task,
            delay,
            period,
            AttributeKey::Task(Uuid::new_v4()),
        )
    }

    #[instrument(skip_all, fields(connection_id = connection.id(), task = %task.name, key = ?key))]
    fn schedule(
        &self,
        connection: &Arc<Connection>,
        task: ScheduledTask,
        delay: Duration,
        period: Duration,
        key: AttributeKey,
    ) -> Result<ScheduledTaskHandle> {
        if task.name.trim().is_empty() {
            bail!("Scheduled task name must not be empty");
        }

        let ScheduledTask { name, mut action } = task;
        let shared = Arc::new(TaskShared {
            timer: TimerHandle::new(&name),
            name,
            key,
            slot: CancellationSlot::new(),
            state: AtomicU8::new(TaskState::Scheduled as u8),
            fire_count: AtomicU64::new(0),
            connection: Arc::downgrade(connection),
            close_listener: OnceLock::new(),
        });
        let handle = ScheduledTaskHandle {
            shared: Arc::clone(&shared),
        };

        if !connection.is_active() {
            debug!("Connection already closed, not scheduling");
            shared.slot.take();
            shared.finish(TaskState::CancelledByClose, None);
            return Ok(handle);
        }

        let on_close = Arc::clone(&shared);
        let listener = connection.on_close(move |connection| {
            if on_close.slot.take() {
                on_close.finish(TaskState::CancelledByClose, Some(connection));
            }
        });
        if let Some(id) = listener {
            let _ = shared.close_listener.set(id);
        }

        connection.set_attribute(shared.key.clone(), shared.clone() as Arc<dyn std::any::Any + Send + Sync>);
        if !shared.slot.is_present() {
            // closed while registering; the close listener ran before the attribute existed
            connection.remove_attribute_if(&shared.key, &shared);
            return Ok(handle);
        }

        let timer = shared.timer.clone();
        let one_shot = period.is_zero();
        let driver = Arc::clone(&shared);
        self.handle.spawn(async move {
            run_timer(timer, delay, period, |context| {
                if one_shot {
                    // the slot decides between this firing and a concurrent cancel
                    if !driver.slot.take() {
                        return false;
                    }
                    driver.finish_detached(TaskState::Fired);
                    driver.fire(&mut action, context);
                    return false;
                }

                // a close or cancel may have won without the timer seeing it yet
                if !driver.slot.is_present() {
                    return false;
                }
                let _ = driver.state.compare_exchange(
                    TaskState::Scheduled as u8,
                    TaskState::RepeatedlyFiring as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                driver.fire(&mut action, context)
            })
            .await;

            // stopped by its own action, a panic or the end of a one-shot
            if driver.slot.take() {
                driver.finish_detached(TaskState::Stopped);
            }
        });

        debug!(?delay, ?period, "Scheduled task");
        Ok(handle)
    }

    /// Close `connection` after `seconds` unless cancelled first with
    /// [`cancel_auto_disconnect`](Self::cancel_auto_disconnect) or through
    /// the returned handle.
    ///
    /// Returns `None` without scheduling if the connection is already closed.
    /// A newer registration replaces the older one as the target of
    /// [`cancel_auto_disconnect`](Self::cancel_auto_disconnect).
    pub fn schedule_auto_disconnect(
        &self,
        connection: &Arc<Connection>,
        seconds: u64,
    ) -> Result<Option<ScheduledTaskHandle>> {
        if !connection.is_active() {
            debug!(connection_id = connection.id(), "Not scheduling auto-disconnect on closed connection");
            return Ok(None);
        }

        // the one-shot timer consumes the slot before this runs
        let target = Arc::downgrade(connection);
        let task = ScheduledTask::new(AUTO_DISCONNECT_TASK, move |_| {
            if let Some(connection) = target.upgrade() {
                info!("Auto-disconnecting {} after {}s", connection, seconds);
                connection.close();
            }
        });

        self.schedule(
            connection,
            task,
            Duration::from_secs(seconds),
            Duration::ZERO,
            AttributeKey::AutoDisconnect,
        )
        .map(Some)
    }

    /// Cancel the most recent auto-disconnect on `connection`. Returns true
    /// if this call won against the timer; the task then ends as
    /// [`TaskState::CancelledByCaller`].
    pub fn cancel_auto_disconnect(connection: &Connection) -> bool {
        connection
            .take_attribute::<TaskShared>(&AttributeKey::AutoDisconnect)
            .is_some_and(|shared| shared.cancel(Some(connection)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn counting_task(name: &str, counter: &Arc<AtomicUsize>) -> ScheduledTask {
        let counter = Arc::clone(counter);
        ScheduledTask::new(name, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_empty_name_is_rejected() {
        let registry = TaskRegistry::current().unwrap();
        let (connection, _rx) = Connection::embedded();

        let result = registry.schedule_once(
            &connection,
            ScheduledTask::new("", |_| {}),
            Duration::ZERO,
        );

        assert!(result.is_err());
        assert_eq!(connection.attribute_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_and_clears_slot() {
        let registry = TaskRegistry::current().unwrap();
        let (connection, _rx) = Connection::embedded();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = registry
            .schedule_once(&connection, counting_task("once", &counter), Duration::from_millis(100))
            .unwrap();
        assert_eq!(handle.state(), TaskState::Scheduled);
        assert_eq!(connection.attribute_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), TaskState::Fired);
        assert_eq!(connection.attribute_count(), 0);
        assert!(!handle.cancel());

        // close after firing is a no-op for the task
        connection.close();
        assert_eq!(handle.state(), TaskState::Fired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_stops_on_close() {
        let registry = TaskRegistry::current().unwrap();
        let (connection, _rx) = Connection::embedded();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = registry
            .schedule_repeating(
                &connection,
                counting_task("tick", &counter),
                Duration::from_secs(1),
                Duration::from_secs(1),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(handle.state(), TaskState::RepeatedlyFiring);

        connection.close();
        assert_eq!(handle.state(), TaskState::CancelledByClose);
        assert!(handle.is_cancelled());
        assert_eq!(connection.attribute_count(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_can_stop_itself() {
        let registry = TaskRegistry::current().unwrap();
        let (connection, _rx) = Connection::embedded();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        let handle = registry
            .schedule_repeating(
                &connection,
                ScheduledTask::new("three", move |ctx| {
                    log.lock().unwrap().push(ctx.fire());
                    if ctx.fire() == 3 {
                        ctx.stop();
                    }
                }),
                Duration::ZERO,
                Duration::from_millis(10),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(handle.state(), TaskState::Stopped);
        assert_eq!(handle.fire_count(), 3);
        assert_eq!(connection.attribute_count(), 0);
        assert!(connection.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_action_stops_timer() {
        let registry = TaskRegistry::current().unwrap();
        let (connection, _rx) = Connection::embedded();

        let handle = registry
            .schedule_repeating(
                &connection,
                ScheduledTask::new("boom", |_| panic!("task failure")),
                Duration::ZERO,
                Duration::from_millis(10),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        settle().await;

        assert_eq!(handle.fire_count(), 1);
        assert_eq!(handle.state(), TaskState::Stopped);
        assert!(connection.is_active());
    }

    #[tokio::test]
    async fn test_cancel_before_firing() {
        let registry = TaskRegistry::current().unwrap();
        let (connection, _rx) = Connection::embedded();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = registry
            .schedule_once(&connection, counting_task("later", &counter), Duration::from_secs(60))
            .unwrap();

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(handle.state(), TaskState::CancelledByCaller);
        assert_eq!(connection.attribute_count(), 0);

        connection.close();
        assert_eq!(handle.state(), TaskState::CancelledByCaller);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_inactive_connection_is_noop() {
        let registry = TaskRegistry::current().unwrap();
        let (connection, _rx) = Connection::embedded();
        connection.close();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = registry
            .schedule_once(&connection, counting_task("late", &counter), Duration::ZERO)
            .unwrap();
        assert_eq!(handle.state(), TaskState::CancelledByClose);
        assert!(!handle.cancel());

        let auto = registry.schedule_auto_disconnect(&connection, 0).unwrap();
        assert!(auto.is_none());
        assert!(!TaskRegistry::cancel_auto_disconnect(&connection));

        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(connection.attribute_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_disconnect_closes_connection() {
        let registry = TaskRegistry::current().unwrap();
        let (connection, _rx) = Connection::embedded();

        let handle = registry
            .schedule_auto_disconnect(&connection, 2)
            .unwrap()
            .unwrap();
        assert_eq!(handle.name(), AUTO_DISCONNECT_TASK);
        assert!(connection.has_attribute(&AttributeKey::AutoDisconnect));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        settle().await;

        assert!(!connection.is_active());
        assert!(!connection.has_attribute(&AttributeKey::AutoDisconnect));
        assert!(!TaskRegistry::cancel_auto_disconnect(&connection));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_auto_disconnect_leaves_connection_open() {
        let registry = TaskRegistry::current().unwrap();
        let (connection, _rx) = Connection::embedded();

        let handle = registry
            .schedule_auto_disconnect(&connection, 1)
            .unwrap()
            .unwrap();
        assert!(TaskRegistry::cancel_auto_disconnect(&connection));
        assert!(!TaskRegistry::cancel_auto_disconnect(&connection));

        assert_eq!(handle.state(), TaskState::CancelledByCaller);
        assert!(handle.is_cancelled());
        assert!(!handle.cancel());
        assert!(handle.shared.timer.is_stopped());
        assert_eq!(connection.attribute_count(), 0);
        assert_eq!(connection.close_listener_count(), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert!(connection.is_active());
        assert_eq!(handle.state(), TaskState::CancelledByCaller);
        assert_eq!(handle.fire_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_skips_firing_after_slot_is_taken() {
        let registry = TaskRegistry::current().unwrap();
        let (connection, _rx) = Connection::embedded();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = registry
            .schedule_repeating(
                &connection,
                counting_task("tick", &counter),
                Duration::from_millis(10),
                Duration::from_millis(10),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        settle().await;
        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 1);

        // a winner that has taken the slot but not yet stopped the timer
        assert!(handle.shared.slot.take());

        tokio::time::sleep(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), fired);
        assert_eq!(handle.fire_count(), fired as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_tasks_release_their_close_listeners() {
        let registry = TaskRegistry::current().unwrap();
        let (connection, _rx) = Connection::embedded();
        let counter = Arc::new(AtomicUsize::new(0));

        let once = registry
            .schedule_once(&connection, counting_task("once", &counter), Duration::from_millis(10))
            .unwrap();
        let cancelled = registry
            .schedule_repeating(
                &connection,
                counting_task("tick", &counter),
                Duration::from_secs(1),
                Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(connection.close_listener_count(), 2);

        assert!(cancelled.cancel());
        assert_eq!(connection.close_listener_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        settle().await;
        assert_eq!(once.state(), TaskState::Fired);
        assert_eq!(connection.close_listener_count(), 0);
        assert_eq!(connection.attribute_count(), 0);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Scheduled.is_terminal());
        assert!(!TaskState::RepeatedlyFiring.is_terminal());
        assert!(TaskState::Fired.is_terminal());
        assert!(TaskState::Stopped.is_terminal());
        assert!(TaskState::CancelledByClose.is_terminal());
        assert!(TaskState::CancelledByCaller.is_terminal());
    }
}
