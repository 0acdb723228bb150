//! Listening side: [`AcceptorBuilder`] and the [`Acceptor`] bootstrap.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::group::{Executor, ThreadGroup};
use super::lifecycle::{Lifecycle, LifecycleState, ShutdownMode};
use super::{socket, TransportBuilder, DEFAULT_SHUTDOWN_GRACE};
use crate::config::TransportConfig;
use crate::connection::io;
use crate::Result;

/// Threads in the accept group
const ACCEPT_THREADS: usize = 1;

/// Builds and owns the thread groups behind an [`Acceptor`]
pub struct AcceptorBuilder {
    config: TransportConfig,
    lifecycle: Lifecycle<Acceptor>,
}

impl AcceptorBuilder {
    /// Builder with the default configuration
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        Self {
            config,
            lifecycle: Lifecycle::new("acceptor", DEFAULT_SHUTDOWN_GRACE),
        }
    }

    /// Time graceful shutdown waits for in-flight work
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

    /// Names of the thread groups currently owned
    pub fn thread_group_names(&self) -> Vec<String> {
        self.lifecycle.group_names()
    }

    /// Wait up to `timeout` for every owned thread group to stop after a
    /// shutdown. Returns false if a group is still running.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        self.lifecycle.await_termination(timeout).await
    }

    fn construct(config: &TransportConfig) -> Result<(Acceptor, Vec<ThreadGroup>)> {
        let snapshot = config.clone();
        if !snapshot.use_worker_thread_group {
            debug!("Acceptor runs inline on the caller's runtime");
            return Ok((
                Acceptor {
                    config: snapshot,
                    accept: Executor::Inline,
                    worker: Executor::Inline,
                },
                Vec::new(),
            ));
        }

        let accept_group = ThreadGroup::new("linewire-accept", ACCEPT_THREADS)?;
        let worker_group = ThreadGroup::new("linewire-worker", ThreadGroup::default_threads())?;
        let acceptor = Acceptor {
            config: snapshot,
            accept: accept_group.executor(),
            worker: worker_group.executor(),
        };
        Ok((acceptor, vec![accept_group, worker_group]))
    }
}

impl Default for AcceptorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportBuilder for AcceptorBuilder {
    type Bootstrap = Acceptor;

    fn build(&self) -> Result<Arc<Acceptor>> {
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

/// Configured factory of listeners. Options are a snapshot taken at build
/// time.
pub struct Acceptor {
    config: TransportConfig,
    accept: Executor,
    worker: Executor,
}

impl Acceptor {
    /// Options this acceptor applies
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Listen on every interface at `port`
    pub async fn bind_port(&self, port: u16) -> Result<ListenerHandle> {
        self.bind(SocketAddr::from(([0, 0, 0, 0], port))).await
    }

    /// Bind a listener and start accepting on the accept group
    pub async fn bind(&self, addr: SocketAddr) -> Result<ListenerHandle> {
        self.config
            .validate()
            .context("Invalid transport configuration")?;

        let listener = socket::bind_listener(addr, &self.config)?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;

        let closed = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        self.accept.spawn(accept_loop(
            listener,
            self.config.clone(),
            self.worker.clone(),
            self.accept.shutdown_signal(),
            closed.clone(),
            ready_tx,
        ))?;

        ready_rx
            .await
            .context("Accept group stopped before the listener was ready")??;

        info!("Listening on {}", local_addr);
        Ok(ListenerHandle { local_addr, closed })
    }
}

/// A bound listener
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    closed: CancellationToken,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Established connections are not affected.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until the listener stops, by request or group shutdown
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

async fn accept_loop(
    listener: std::net::TcpListener,
    config: TransportConfig,
    worker: Executor,
    shutdown: CancellationToken,
    closed: CancellationToken,
    ready: oneshot::Sender<Result<()>>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => {
            let _ = ready.send(Ok(()));
            listener
        }
        Err(e) => {
            let _ = ready.send(Err(anyhow::Error::new(e).context("Failed to register listener")));
            closed.cancel();
            return;
        }
    };

    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                debug!("Listener closed by request");
                break;
            }
            _ = shutdown.cancelled() => {
                debug!("Accept group shutting down, closing listener");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    if let Err(e) = hand_off(stream, &config, &worker) {
                        warn!("Dropping connection from {}: {:#}", addr, e);
                    }
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }

    closed.cancel();
}

/// Configure the child socket and move it onto the worker group
fn hand_off(stream: TcpStream, config: &TransportConfig, worker: &Executor) -> Result<()> {
    socket::configure_accepted(&stream, config)?;
    // re-registered with the worker group's reactor on the other side
    let stream = stream
        .into_std()
        .context("Failed to detach accepted stream")?;
    let initializer = Arc::clone(&config.pipeline_initializer);
    let worker_for_task = worker.clone();

    worker.spawn(async move {
        let result = TcpStream::from_std(stream)
            .context("Failed to register accepted stream")
            .and_then(|stream| io::establish(stream, &initializer, &worker_for_task));
        if let Err(e) = result {
            warn!("Failed to set up accepted connection: {:#}", e);
        }
    })?;
    Ok(())
}
