//! Per-connection pipeline setup
//!
//! Every new connection runs the configured [`PipelineInitializer`] once,
//! before anything is read from the socket. The initializer decides the frame
//! limit, whether idle-state events are generated and which
//! [`ConnectionHandler`] receives the decoded lines.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::Connection;

/// Maximum length of one line, delimiter excluded
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8192;

/// Kind of inactivity reported to [`ConnectionHandler::on_idle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdleState {
    ReaderIdle,
    WriterIdle,
    AllIdle,
}

/// Idle thresholds. `None` disables that kind of event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdleConfig {
    pub reader_idle: Option<Duration>,
    pub writer_idle: Option<Duration>,
    pub all_idle: Option<Duration>,
}

impl IdleConfig {
    pub fn is_enabled(&self) -> bool {
        self.reader_idle.is_some() || self.writer_idle.is_some() || self.all_idle.is_some()
    }
}

/// Application callbacks for one connection.
///
/// Callbacks run on the connection's I/O task and must not block. Writes go
/// through [`Connection::write_line`], which only queues.
pub trait ConnectionHandler: Send + Sync {
    /// The connection is set up and about to start reading
    fn on_active(&self, _connection: &Arc<Connection>) {}

    /// One decoded line, delimiter stripped
    fn on_line(&self, _connection: &Arc<Connection>, _line: String) {}

    fn on_idle(&self, _connection: &Arc<Connection>, _state: IdleState) {}

    /// An oversized frame or an I/O error. The connection stays open after
    /// an oversized frame and is closed after an I/O error.
    fn on_error(&self, connection: &Arc<Connection>, error: &anyhow::Error) {
        warn!("Connection {} failed: {}", connection, error);
    }

    /// The connection has been closed
    fn on_inactive(&self, _connection: &Arc<Connection>) {}
}

/// Handler installed when the initializer does not provide one
#[derive(Debug, Default)]
pub struct DiscardHandler;

impl ConnectionHandler for DiscardHandler {
    fn on_line(&self, connection: &Arc<Connection>, line: String) {
        debug!("Discarding line from {}: {}", connection, line);
    }
}

/// Stages assembled for one connection
pub struct Pipeline {
    max_frame_length: usize,
    idle: IdleConfig,
    handler: Option<Arc<dyn ConnectionHandler>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            idle: IdleConfig::default(),
            handler: None,
        }
    }

    /// Limit for a single decoded line
    pub fn max_frame_length(&mut self, max_frame_length: usize) -> &mut Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Generate idle-state events for the given thresholds
    pub fn idle_state(
        &mut self,
        reader_idle: Option<Duration>,
        writer_idle: Option<Duration>,
        all_idle: Option<Duration>,
    ) -> &mut Self {
        self.idle = IdleConfig {
            reader_idle,
            writer_idle,
            all_idle,
        };
        self
    }

    pub fn handler<H>(&mut self, handler: H) -> &mut Self
    where
        H: ConnectionHandler + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn shared_handler(&mut self, handler: Arc<dyn ConnectionHandler>) -> &mut Self {
        self.handler = Some(handler);
        self
    }

    pub fn frame_limit(&self) -> usize {
        self.max_frame_length
    }

    pub fn idle(&self) -> IdleConfig {
        self.idle
    }

    pub(crate) fn take_handler(&mut self) -> Arc<dyn ConnectionHandler> {
        self.handler
            .take()
            .unwrap_or_else(|| Arc::new(DiscardHandler))
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection setup hook, run synchronously while the connection is
/// being established.
pub trait PipelineInitializer: Send + Sync {
    fn initialize(&self, connection: &Arc<Connection>, pipeline: &mut Pipeline);
}

impl<F> PipelineInitializer for F
where
    F: Fn(&Arc<Connection>, &mut Pipeline) + Send + Sync,
{
    fn initialize(&self, connection: &Arc<Connection>, pipeline: &mut Pipeline) {
        self(connection, pipeline)
    }
}

/// Default initializer: plain line framing and no handler
#[derive(Debug, Clone)]
pub struct LineInitializer {
    max_frame_length: usize,
}

impl LineInitializer {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for LineInitializer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl PipelineInitializer for LineInitializer {
    fn initialize(&self, _connection: &Arc<Connection>, pipeline: &mut Pipeline) {
        pipeline.max_frame_length(self.max_frame_length);
    }
}
