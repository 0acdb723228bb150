//! Configuration Types

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

use crate::connection::pipeline::{LineInitializer, PipelineInitializer};

/// Fallbacks used when the socket probe cannot open a socket.
const FALLBACK_RECEIVE_BUFFER_SIZE: usize = 1024;
const FALLBACK_SEND_BUFFER_SIZE: usize = 1024;
const FALLBACK_TCP_NO_DELAY: bool = false;

static SOCKET_DEFAULTS: OnceLock<SocketDefaults> = OnceLock::new();

/// Operating system socket defaults, probed once per process from an
/// unconnected TCP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketDefaults {
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    pub tcp_no_delay: bool,
}

impl SocketDefaults {
    /// Get the process-wide defaults, probing the OS on first use
    pub fn get() -> SocketDefaults {
        *SOCKET_DEFAULTS.get_or_init(Self::probe)
    }

    fn probe() -> SocketDefaults {
        let fallback = SocketDefaults {
            receive_buffer_size: FALLBACK_RECEIVE_BUFFER_SIZE,
            send_buffer_size: FALLBACK_SEND_BUFFER_SIZE,
            tcp_no_delay: FALLBACK_TCP_NO_DELAY,
        };

        let socket = match Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) {
            Ok(socket) => socket,
            Err(e) => {
                debug!("Socket probe failed, using fallback defaults: {}", e);
                return fallback;
            }
        };

        let defaults = SocketDefaults {
            receive_buffer_size: socket
                .recv_buffer_size()
                .unwrap_or(fallback.receive_buffer_size),
            send_buffer_size: socket
                .send_buffer_size()
                .unwrap_or(fallback.send_buffer_size),
            tcp_no_delay: socket.nodelay().unwrap_or(fallback.tcp_no_delay),
        };
        debug!("Probed socket defaults: {:?}", defaults);
        defaults
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

/// Socket and thread options consumed by the transport builders.
///
/// Builders take the configuration by value, so changes made after a
/// bootstrap has been built never reach it.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Run I/O on dedicated thread groups instead of the caller's runtime
    pub use_worker_thread_group: bool,
    /// Connector only
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub reuse_address: bool,
    pub keep_alive: bool,
    /// `None` leaves SO_LINGER disabled. Zero lets the port be reused right
    /// after the connection drops.
    #[serde(with = "humantime_serde")]
    pub linger: Option<Duration>,
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    /// Disable Nagle's algorithm
    pub tcp_no_delay: bool,
    #[serde(skip, default = "default_pipeline_initializer")]
    pub pipeline_initializer: Arc<dyn PipelineInitializer>,
}

/// Settings for the bundled sample server
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub writer_idle: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Settings for the bundled sample client
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
}

fn default_pipeline_initializer() -> Arc<dyn PipelineInitializer> {
    Arc::new(LineInitializer::default())
}

impl TransportConfig {
    /// Replace the per-connection setup hook
    pub fn with_pipeline_initializer<I>(mut self, initializer: I) -> Self
    where
        I: PipelineInitializer + 'static,
    {
        self.pipeline_initializer = Arc::new(initializer);
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        let probed = SocketDefaults::get();
        Self {
            use_worker_thread_group: true,
            connect_timeout: Duration::from_millis(1000),
            reuse_address: true,
            keep_alive: true,
            linger: Some(Duration::ZERO),
            receive_buffer_size: probed.receive_buffer_size,
            send_buffer_size: probed.send_buffer_size,
            tcp_no_delay: probed.tcp_no_delay,
            pipeline_initializer: default_pipeline_initializer(),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("use_worker_thread_group", &self.use_worker_thread_group)
            .field("connect_timeout", &self.connect_timeout)
            .field("reuse_address", &self.reuse_address)
            .field("keep_alive", &self.keep_alive)
            .field("linger", &self.linger)
            .field("receive_buffer_size", &self.receive_buffer_size)
            .field("send_buffer_size", &self.send_buffer_size)
            .field("tcp_no_delay", &self.tcp_no_delay)
            .finish_non_exhaustive()
    }
}

/// One `name: value` line per option.
impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let linger = match self.linger {
            Some(linger) => humantime::format_duration(linger).to_string(),
            None => "disabled".to_string(),
        };
        writeln!(f, "use_worker_thread_group: {}", self.use_worker_thread_group)?;
        writeln!(
            f,
            "connect_timeout: {}",
            humantime::format_duration(self.connect_timeout)
        )?;
        writeln!(f, "reuse_address: {}", self.reuse_address)?;
        writeln!(f, "keep_alive: {}", self.keep_alive)?;
        writeln!(f, "linger: {}", linger)?;
        writeln!(f, "receive_buffer_size: {}", self.receive_buffer_size)?;
        writeln!(f, "send_buffer_size: {}", self.send_buffer_size)?;
        write!(f, "tcp_no_delay: {}", self.tcp_no_delay)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            heartbeat_interval: Duration::from_secs(1),
            writer_idle: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}
