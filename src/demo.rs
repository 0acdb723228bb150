//! Sample time server and printing client.
//!
//! The server pushes the current epoch milliseconds, one line per heartbeat,
//! to every connected client. The client greets the server and logs what it
//! receives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionHandler, IdleState, Pipeline, PipelineInitializer};
use crate::task::{ScheduledTask, TaskRegistry};

/// Line the sample client sends once connected
pub const GREETING: &str = "Hello world!";

/// Name of the repeating task that writes timestamps
pub const TIMESTAMP_TASK: &str = "timestamp";

/// Milliseconds since the Unix epoch
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Writes a timestamp unless it would repeat the last one sent
struct TimestampWriter {
    last_sent: AtomicU64,
}

impl TimestampWriter {
    fn new() -> Self {
        Self {
            last_sent: AtomicU64::new(0),
        }
    }

    /// Returns true if a line was queued
    fn write(&self, connection: &Connection) -> bool {
        let now = epoch_millis();
        if self.last_sent.fetch_max(now, Ordering::AcqRel) >= now {
            debug!("Skipping duplicate timestamp {} for {}", now, connection);
            return false;
        }
        match connection.write_line(now.to_string()) {
            Ok(()) => true,
            Err(e) => {
                debug!("Timestamp not sent: {}", e);
                false
            }
        }
    }
}

/// Pipeline for the sample time server
#[derive(Debug, Clone)]
pub struct TimeServerInitializer {
    heartbeat: Duration,
    writer_idle: Duration,
    limit: Option<u64>,
}

impl TimeServerInitializer {
    pub fn new(heartbeat: Duration, writer_idle: Duration) -> Self {
        Self {
            heartbeat,
            writer_idle,
            limit: None,
        }
    }

    /// Stop the heartbeat after `limit` timestamps on each connection
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl Default for TimeServerInitializer {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl PipelineInitializer for TimeServerInitializer {
    fn initialize(&self, _connection: &Arc<Connection>, pipeline: &mut Pipeline) {
        pipeline
            .idle_state(None, Some(self.writer_idle), None)
            .handler(TimeServerHandler {
                heartbeat: self.heartbeat,
                limit: self.limit,
                writer: Arc::new(TimestampWriter::new()),
            });
    }
}

struct TimeServerHandler {
    heartbeat: Duration,
    limit: Option<u64>,
    writer: Arc<TimestampWriter>,
}

impl ConnectionHandler for TimeServerHandler {
    fn on_active(&self, connection: &Arc<Connection>) {
        info!("Client connected: {}", connection);

        let registry = match TaskRegistry::current() {
            Ok(registry) => registry,
            Err(e) => {
                warn!("Cannot schedule timestamps for {}: {:#}", connection, e);
                return;
            }
        };

        let writer = Arc::clone(&self.writer);
        let target = Arc::downgrade(connection);
        let limit = self.limit;
        let mut sent = 0;
        let task = ScheduledTask::new(TIMESTAMP_TASK, move |ctx| {
            let Some(connection) = target.upgrade() else {
                ctx.stop();
                return;
            };
            if writer.write(&connection) {
                sent += 1;
            }
            if limit.is_some_and(|limit| sent >= limit) {
                debug!("Sent {} timestamps to {}, stopping", sent, connection);
                ctx.stop();
            }
        });

        if let Err(e) = registry.schedule_repeating(connection, task, self.heartbeat, self.heartbeat) {
            warn!("Failed to schedule timestamps for {}: {:#}", connection, e);
        }
    }

    fn on_line(&self, connection: &Arc<Connection>, line: String) {
        info!("{} says: {}", connection, line);
    }

    fn on_idle(&self, connection: &Arc<Connection>, state: IdleState) {
        if state == IdleState::WriterIdle {
            self.writer.write(connection);
        }
    }

    fn on_inactive(&self, connection: &Arc<Connection>) {
        info!("Client disconnected: {}", connection);
    }
}

/// Pipeline for the sample client
#[derive(Debug, Clone, Default)]
pub struct PrintingClientInitializer {
    sink: Option<mpsc::UnboundedSender<String>>,
}

impl PrintingClientInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also forward every received line to `sink`
    pub fn with_sink(sink: mpsc::UnboundedSender<String>) -> Self {
        Self { sink: Some(sink) }
    }
}

impl PipelineInitializer for PrintingClientInitializer {
    fn initialize(&self, _connection: &Arc<Connection>, pipeline: &mut Pipeline) {
        pipeline.handler(PrintingClientHandler {
            sink: self.sink.clone(),
        });
    }
}

struct PrintingClientHandler {
    sink: Option<mpsc::UnboundedSender<String>>,
}

impl ConnectionHandler for PrintingClientHandler {
    fn on_active(&self, connection: &Arc<Connection>) {
        if let Err(e) = connection.write_line(GREETING) {
            warn!("Greeting not sent to {}: {:#}", connection, e);
        }
    }

    fn on_line(&self, connection: &Arc<Connection>, line: String) {
        info!("Received from {}: {}", connection, line);
        if let Some(sink) = &self.sink {
            let _ = sink.send(line);
        }
    }

    fn on_inactive(&self, connection: &Arc<Connection>) {
        info!("Disconnected from {}", connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_timestamps_are_skipped() {
        let (connection, mut rx) = Connection::embedded();
        let writer = TimestampWriter::new();
        writer.last_sent.store(u64::MAX, Ordering::SeqCst);

        assert!(!writer.write(&connection));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_timestamp_written_as_line() {
        let (connection, mut rx) = Connection::embedded();
        let writer = TimestampWriter::new();

        assert!(writer.write(&connection));
        let line = rx.try_recv().unwrap();
        assert!(line.parse::<u64>().unwrap() > 0);
    }

    #[test]
    fn test_server_pipeline_enables_writer_idle() {
        let (connection, _rx) = Connection::embedded();
        let mut pipeline = Pipeline::new();
        TimeServerInitializer::default().initialize(&connection, &mut pipeline);

        let idle = pipeline.idle();
        assert_eq!(idle.writer_idle, Some(Duration::from_secs(30)));
        assert_eq!(idle.reader_idle, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_stops_after_limit() {
        let (connection, mut rx) = Connection::embedded();
        let mut pipeline = Pipeline::new();
        TimeServerInitializer::new(Duration::from_millis(10), Duration::from_secs(30))
            .with_limit(2)
            .initialize(&connection, &mut pipeline);
        let handler = pipeline.take_handler();

        handler.on_active(&connection);
        for _ in 0..10 {
            // wall clock needs to move for timestamps to differ
            std::thread::sleep(Duration::from_millis(2));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn test_client_greets_and_forwards() {
        let (connection, mut rx) = Connection::embedded();
        let (sink, mut received) = mpsc::unbounded_channel();
        let mut pipeline = Pipeline::new();
        PrintingClientInitializer::with_sink(sink).initialize(&connection, &mut pipeline);
        let handler = pipeline.take_handler();

        handler.on_active(&connection);
        assert_eq!(rx.try_recv().unwrap(), GREETING);

        handler.on_line(&connection, "42".to_string());
        assert_eq!(received.try_recv().unwrap(), "42");
    }
}
