//! Transport Module
//!
//! Builders that own thread groups and hand out the bootstraps used to
//! listen for and open line-framed TCP connections.

pub mod acceptor;
pub mod connector;
pub mod group;
pub mod lifecycle;
pub(crate) mod socket;

use std::sync::Arc;
use std::time::Duration;

use crate::config::TransportConfig;
use crate::Result;

pub use acceptor::{Acceptor, AcceptorBuilder, ListenerHandle};
pub use connector::{Connector, ConnectorBuilder};
pub use group::{ThreadGroup, QUIET_PERIOD};
pub use lifecycle::{LifecycleState, ShutdownMode};

/// Grace period for in-flight work during graceful shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Common surface of the acceptor and connector builders
pub trait TransportBuilder {
    type Bootstrap;

    /// Construct the bootstrap on first call and return the same one after
    fn build(&self) -> Result<Arc<Self::Bootstrap>>;

    /// Orderly stop of every owned thread group. Never blocks.
    fn shutdown_gracefully(&self);

    /// Immediate stop discarding queued work
    fn shutdown_now(&self);

    fn is_disabled_or_terminated(&self) -> bool;

    fn config(&self) -> &TransportConfig;
}
