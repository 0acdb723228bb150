//! Connecting side: [`ConnectorBuilder`] and the [`Connector`] bootstrap.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tokio::net::lookup_host;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use super::group::{Executor, ThreadGroup};
use super::lifecycle::{Lifecycle, LifecycleState, ShutdownMode};
use super::{socket, TransportBuilder, DEFAULT_SHUTDOWN_GRACE};
use crate::config::TransportConfig;
use crate::connection::{io, Connection};
use crate::Result;

/// Builds and owns the worker group behind a [`Connector`]
pub struct ConnectorBuilder {
    config: TransportConfig,
    lifecycle: Lifecycle<Connector>,
}

impl ConnectorBuilder {
    /// Builder with the default configuration
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        Self {
            config,
            lifecycle: Lifecycle::new("connector", DEFAULT_SHUTDOWN_GRACE),
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.lifecycle.set_grace(grace);
        self
    }

    /// Mutable access to the configuration. Changes only apply if the
    /// bootstrap has not been built yet.
    pub fn config_mut(&mut self) -> &mut TransportConfig {
        &mut self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn thread_group_names(&self) -> Vec<String> {
        self.lifecycle.group_names()
    }

    /// Wait up to `timeout` for every owned thread group to stop after a
    /// shutdown. Returns false if a group is still running.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        self.lifecycle.await_termination(timeout).await
    }

    fn construct(config: &TransportConfig) -> Result<(Connector, Vec<ThreadGroup>)> {
        let snapshot = config.clone();
        if !snapshot.use_worker_thread_group {
            debug!("Connector runs inline on the caller's runtime");
            return Ok((
                Connector {
                    config: snapshot,
                    worker: Executor::Inline,
                },
                Vec::new(),
            ));
        }

        let group = ThreadGroup::new("linewire-connect", ThreadGroup::default_threads())?;
        let connector = Connector {
            config: snapshot,
            worker: group.executor(),
        };
        Ok((connector, vec![group]))
    }
}

impl Default for ConnectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportBuilder for ConnectorBuilder {
    type Bootstrap = Connector;

    fn build(&self) -> Result<Arc<Connector>> {
        self.lifecycle
            .get_or_build(|| Self::construct(&self.config))
    }

    fn shutdown_gracefully(&self) {
        self.lifecycle.shutdown(ShutdownMode::Graceful);
    }

    fn shutdown_now(&self) {
        self.lifecycle.shutdown(ShutdownMode::Immediate);
    }

    fn is_disabled_or_terminated(&self) -> bool {
        self.lifecycle.is_disabled_or_terminated()
    }

    fn config(&self) -> &TransportConfig {
        &self.config
    }
}

/// Configured factory of outbound connections
pub struct Connector {
    config: TransportConfig,
    worker: Executor,
}

impl Connector {
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Resolve `host` and connect to the first address that answers
    #[instrument(skip(self))]
    pub async fn connect(&self, host: &str, port: u16) -> Result<Arc<Connection>> {
        self.config
            .validate()
            .context("Invalid transport configuration")?;

        let candidates: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .with_context(|| format!("Failed to resolve {}:{}", host, port))?
            .collect();
        if candidates.is_empty() {
            bail!("No addresses found for {}:{}", host, port);
        }

        let mut last_error = None;
        for addr in candidates {
            match self.connect_addr(addr).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    debug!("Connect attempt to {} failed: {:#}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow!("No reachable address"))
            .context(format!("Failed to connect to {}:{}", host, port)))
    }

    /// Connect to a resolved address within the connect timeout
    pub async fn connect_addr(&self, addr: SocketAddr) -> Result<Arc<Connection>> {
        self.config
            .validate()
            .context("Invalid transport configuration")?;

        let (tx, rx) = oneshot::channel();
        let config = self.config.clone();
        let worker = self.worker.clone();

        self.worker.spawn(async move {
            let result = open(addr, &config, &worker).await;
            if tx.send(result).is_err() {
                warn!("Caller gave up on connection to {}", addr);
            }
        })?;

        let connection = rx
            .await
            .context("Worker group stopped while connecting")??;
        info!("Connected to {}", addr);
        Ok(connection)
    }
}

async fn open(
    addr: SocketAddr,
    config: &TransportConfig,
    worker: &Executor,
) -> Result<Arc<Connection>> {
    let socket = socket::connect_socket(addr, config)?;
    let stream = tokio::time::timeout(config.connect_timeout, socket.connect(addr))
        .await
        .map_err(|_| anyhow!("Connection to {} timed out after {:?}", addr, config.connect_timeout))?
        .with_context(|| format!("Failed to connect to {}", addr))?;

    io::establish(stream, &config.pipeline_initializer, worker)
}
