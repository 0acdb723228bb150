//! Idle-state detection for a single connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use super::pipeline::{IdleConfig, IdleState};

/// Last read/write activity, shared by the reader and writer tasks
#[derive(Debug)]
pub(crate) struct ActivityTracker {
    origin: Instant,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
}

impl ActivityTracker {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_read_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
        }
    }

    fn elapsed_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_millis() as u64
    }

    pub(crate) fn mark_read(&self) {
        self.last_read_ms
            .store(self.elapsed_ms(Instant::now()), Ordering::Relaxed);
    }

    pub(crate) fn mark_write(&self) {
        self.last_write_ms
            .store(self.elapsed_ms(Instant::now()), Ordering::Relaxed);
    }
}

/// Computes when the next idle event is due and which events have expired.
///
/// An event repeats every threshold for as long as the connection stays idle.
pub(crate) struct IdleMonitor {
    config: IdleConfig,
    // per state: time of the last event, in ms since origin
    fired_ms: [u64; 3],
}

const STATES: [IdleState; 3] = [IdleState::ReaderIdle, IdleState::WriterIdle, IdleState::AllIdle];

impl IdleMonitor {
    pub(crate) fn new(config: IdleConfig) -> Self {
        Self {
            config,
            fired_ms: [0; 3],
        }
    }

    fn threshold(&self, state: IdleState) -> Option<Duration> {
        match state {
            IdleState::ReaderIdle => self.config.reader_idle,
            IdleState::WriterIdle => self.config.writer_idle,
            IdleState::AllIdle => self.config.all_idle,
        }
    }

    fn last_activity_ms(activity: &ActivityTracker, state: IdleState) -> u64 {
        let read = activity.last_read_ms.load(Ordering::Relaxed);
        let write = activity.last_write_ms.load(Ordering::Relaxed);
        match state {
            IdleState::ReaderIdle => read,
            IdleState::WriterIdle => write,
            IdleState::AllIdle => read.max(write),
        }
    }

    fn deadline_ms(&self, activity: &ActivityTracker, index: usize) -> Option<u64> {
        let state = STATES[index];
        let threshold = self.threshold(state)?;
        let base = Self::last_activity_ms(activity, state).max(self.fired_ms[index]);
        Some(base + threshold.as_millis() as u64)
    }

    /// Earliest instant at which an idle event could fire
    pub(crate) fn next_deadline(&self, activity: &ActivityTracker) -> Option<Instant> {
        (0..STATES.len())
            .filter_map(|index| self.deadline_ms(activity, index))
            .min()
            .map(|ms| activity.origin + Duration::from_millis(ms))
    }

    /// Collect the events due at `now` and re-arm them
    pub(crate) fn poll_expired(&mut self, activity: &ActivityTracker, now: Instant) -> Vec<IdleState> {
        let now_ms = activity.elapsed_ms(now);
        let mut expired = Vec::new();
        for (index, state) in STATES.iter().enumerate() {
            if let Some(deadline) = self.deadline_ms(activity, index) {
                if deadline <= now_ms {
                    self.fired_ms[index] = now_ms;
                    expired.push(*state);
                }
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_writer_idle_fires_and_rearms() {
        let activity = ActivityTracker::new();
        let mut monitor = IdleMonitor::new(IdleConfig {
            writer_idle: Some(Duration::from_secs(30)),
            ..IdleConfig::default()
        });

        let first = monitor.next_deadline(&activity).unwrap();
        assert_eq!(first, activity.origin + Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(
            monitor.poll_expired(&activity, Instant::now()),
            vec![IdleState::WriterIdle]
        );
        // nothing more until another full threshold has passed
        assert!(monitor.poll_expired(&activity, Instant::now()).is_empty());
        assert_eq!(
            monitor.next_deadline(&activity).unwrap(),
            activity.origin + Duration::from_secs(60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_postpones_idle() {
        let activity = ActivityTracker::new();
        let mut monitor = IdleMonitor::new(IdleConfig {
            reader_idle: Some(Duration::from_secs(10)),
            all_idle: Some(Duration::from_secs(20)),
            ..IdleConfig::default()
        });

        tokio::time::advance(Duration::from_secs(8)).await;
        activity.mark_read();
        tokio::time::advance(Duration::from_secs(8)).await;

        assert!(monitor.poll_expired(&activity, Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            monitor.poll_expired(&activity, Instant::now()),
            vec![IdleState::ReaderIdle]
        );
    }

    #[test]
    fn test_disabled_monitor_has_no_deadline() {
        let activity = ActivityTracker::new();
        let monitor = IdleMonitor::new(IdleConfig::default());
        assert!(monitor.next_deadline(&activity).is_none());
    }
}
