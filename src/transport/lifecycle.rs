//! Builder lifecycle: `Unbuilt -> Built -> Terminated`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use super::group::ThreadGroup;
use crate::{lock, Result};

/// Observable lifecycle state of a transport builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unbuilt,
    Built,
    Terminated,
}

/// How owned thread groups are stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Graceful,
    Immediate,
}

enum State<B> {
    Unbuilt,
    Built {
        bootstrap: Arc<B>,
        groups: Vec<ThreadGroup>,
    },
    Terminated {
        bootstrap: Arc<B>,
        /// Termination flags of the released groups
        stopping: Vec<Arc<AtomicBool>>,
    },
}

/// How often [`Lifecycle::await_termination`] looks at the groups
const TERMINATION_POLL: Duration = Duration::from_millis(50);

/// Build-once cell for a bootstrap plus the thread groups behind it
pub(crate) struct Lifecycle<B> {
    label: &'static str,
    grace: Duration,
    state: Mutex<State<B>>,
}

impl<B> Lifecycle<B> {
    pub(crate) fn new(label: &'static str, grace: Duration) -> Self {
        Self {
            label,
            grace,
            state: Mutex::new(State::Unbuilt),
        }
    }

    pub(crate) fn set_grace(&mut self, grace: Duration) {
        self.grace = grace;
    }

    /// Return the bootstrap, constructing it with `construct` on first use.
    ///
    /// The lock is held during construction, so concurrent callers wait and
    /// then share the single result. A failed construction leaves the
    /// lifecycle unbuilt.
    pub(crate) fn get_or_build<F>(&self, construct: F) -> Result<Arc<B>>
    where
        F: FnOnce() -> Result<(B, Vec<ThreadGroup>)>,
    {
        let mut state = lock(&self.state);
        match &*state {
            State::Built { bootstrap, .. } | State::Terminated { bootstrap, .. } => {
                return Ok(Arc::clone(bootstrap));
            }
            State::Unbuilt => {}
        }

        let (bootstrap, groups) = construct()?;
        let bootstrap = Arc::new(bootstrap);
        info!(
            "Built {} with {} thread group(s)",
            self.label,
            groups.len()
        );
        *state = State::Built {
            bootstrap: Arc::clone(&bootstrap),
            groups,
        };
        Ok(bootstrap)
    }

    /// Stop and release every owned group. No-op unless built.
    pub(crate) fn shutdown(&self, mode: ShutdownMode) {
        let groups = {
            let mut state = lock(&self.state);
            match std::mem::replace(&mut *state, State::Unbuilt) {
                State::Built { bootstrap, groups } => {
                    *state = State::Terminated {
                        bootstrap,
                        stopping: groups.iter().map(ThreadGroup::terminated_flag).collect(),
                    };
                    groups
                }
                other => {
                    *state = other;
                    debug!("{} has no thread groups to shut down", self.label);
                    return;
                }
            }
        };

        info!(
            "Shutting down {} ({:?}, {} thread group(s))",
            self.label,
            mode,
            groups.len()
        );
        for group in &groups {
            match mode {
                ShutdownMode::Graceful => group.shutdown_gracefully(self.grace),
                ShutdownMode::Immediate => group.shutdown_now(),
            }
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        match &*lock(&self.state) {
            State::Unbuilt => LifecycleState::Unbuilt,
            State::Built { .. } => LifecycleState::Built,
            State::Terminated { .. } => LifecycleState::Terminated,
        }
    }

    /// True when no live group is owned: disabled, never built, released,
    /// or any group already terminated.
    pub(crate) fn is_disabled_or_terminated(&self) -> bool {
        match &*lock(&self.state) {
            State::Built { groups, .. } => {
                groups.is_empty() || groups.iter().any(ThreadGroup::is_terminated)
            }
            State::Unbuilt | State::Terminated { .. } => true,
        }
    }

    /// True once every released group has fully stopped. False while
    /// built with live groups.
    pub(crate) fn is_terminated(&self) -> bool {
        match &*lock(&self.state) {
            State::Unbuilt => true,
            State::Built { groups, .. } => groups.iter().all(ThreadGroup::is_terminated),
            State::Terminated { stopping, .. } => {
                stopping.iter().all(|flag| flag.load(Ordering::Acquire))
            }
        }
    }

    /// Wait up to `timeout` for [`is_terminated`](Self::is_terminated).
    /// Returns whether termination was observed.
    pub(crate) async fn await_termination(&self, timeout: Duration) -> bool {
        let wait = async {
            while !self.is_terminated() {
                tokio::time::sleep(TERMINATION_POLL).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    pub(crate) fn group_names(&self) -> Vec<String> {
        match &*lock(&self.state) {
            State::Built { groups, .. } => groups.iter().map(|g| g.name().to_string()).collect(),
            State::Unbuilt | State::Terminated { .. } => Vec::new(),
        }
    }
}
