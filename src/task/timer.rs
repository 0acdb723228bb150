//! Timer driving one scheduled task.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Stop switch of a running timer. Stopping is advisory: a firing already
/// in progress completes.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
    name: Arc<str>,
}

impl TimerHandle {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            token: CancellationToken::new(),
            name: Arc::from(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// What a task action sees when it fires
#[derive(Debug)]
pub struct TaskContext {
    timer: TimerHandle,
    fire: u64,
}

impl TaskContext {
    /// Firing number, starting at 1
    pub fn fire(&self) -> u64 {
        self.fire
    }

    pub fn timer(&self) -> &TimerHandle {
        &self.timer
    }

    /// Stop this task's timer after the current firing
    pub fn stop(&self) {
        self.timer.stop();
    }
}

/// Wait `delay`, then call `tick` and repeat every `period` (fixed delay)
/// until the timer is stopped or `tick` returns false. A zero `period`
/// fires once.
pub(crate) async fn run_timer<F>(timer: TimerHandle, delay: Duration, period: Duration, mut tick: F)
where
    F: FnMut(&TaskContext) -> bool,
{
    tokio::select! {
        _ = timer.stopped() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    let mut fire = 1;
    loop {
        if timer.is_stopped() {
            return;
        }
        let context = TaskContext {
            timer: timer.clone(),
            fire,
        };
        if !tick(&context) || period.is_zero() {
            return;
        }

        tokio::select! {
            _ = timer.stopped() => return,
            _ = tokio::time::sleep(period) => {}
        }
        fire += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_fixed_delay_until_stopped() {
        let timer = TimerHandle::new("ticker");
        let mut fires = Vec::new();

        run_timer(
            timer.clone(),
            Duration::from_secs(1),
            Duration::from_secs(2),
            |ctx| {
                fires.push(ctx.fire());
                if ctx.fire() == 3 {
                    ctx.stop();
                }
                true
            },
        )
        .await;

        assert_eq!(fires, vec![1, 2, 3]);
        assert!(timer.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_fires_once() {
        let timer = TimerHandle::new("once");
        let mut count = 0;
        run_timer(timer, Duration::ZERO, Duration::ZERO, |_| {
            count += 1;
            true
        })
        .await;
        assert_eq!(count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_before_delay_never_fires() {
        let timer = TimerHandle::new("stopped");
        timer.stop();
        let mut count = 0;
        run_timer(timer, Duration::from_secs(5), Duration::from_secs(1), |_| {
            count += 1;
            true
        })
        .await;
        assert_eq!(count, 0);
    }
}
