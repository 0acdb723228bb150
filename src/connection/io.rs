//! Reader and writer tasks for a socket-backed connection.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::codec::{Frame, LineCodec};
use super::idle::{ActivityTracker, IdleMonitor};
use super::pipeline::{ConnectionHandler, IdleConfig, Pipeline, PipelineInitializer};
use super::Connection;
use crate::transport::group::Executor;
use crate::Result;

/// Closes the connection if the reader task is dropped before finishing,
/// e.g. when its runtime is shut down.
struct CloseOnDrop(Arc<Connection>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Wrap an established stream, run the pipeline initializer and start the
/// reader and writer tasks on `executor`.
pub(crate) fn establish(
    stream: TcpStream,
    initializer: &Arc<dyn PipelineInitializer>,
    executor: &Executor,
) -> Result<Arc<Connection>> {
    let (connection, outbound) = Connection::new(stream.local_addr().ok(), stream.peer_addr().ok());

    let mut pipeline = Pipeline::new();
    initializer.initialize(&connection, &mut pipeline);
    let handler = pipeline.take_handler();

    let (read_half, write_half) = stream.into_split();
    let reader = FramedRead::new(read_half, LineCodec::new(pipeline.frame_limit()));
    let writer = FramedWrite::new(write_half, LineCodec::new(pipeline.frame_limit()));
    let activity = Arc::new(ActivityTracker::new());

    let spawned = executor
        .spawn(write_loop(
            Arc::clone(&connection),
            outbound,
            writer,
            Arc::clone(&activity),
        ))
        .and_then(|_| {
            executor.spawn(read_loop(
                Arc::clone(&connection),
                handler,
                reader,
                activity,
                pipeline.idle(),
                executor.shutdown_signal(),
            ))
        });

    if let Err(e) = spawned {
        connection.close();
        return Err(e);
    }

    debug!("Established connection {} on {}", connection, executor.describe());
    Ok(connection)
}

async fn idle_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn is_reset(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
    )
}

#[instrument(skip_all, fields(connection_id = connection.id()))]
async fn read_loop(
    connection: Arc<Connection>,
    handler: Arc<dyn ConnectionHandler>,
    mut reader: FramedRead<OwnedReadHalf, LineCodec>,
    activity: Arc<ActivityTracker>,
    idle: IdleConfig,
    shutdown: CancellationToken,
) {
    let _guard = CloseOnDrop(Arc::clone(&connection));
    let closed = connection.close_token();
    let mut monitor = IdleMonitor::new(idle);

    handler.on_active(&connection);

    loop {
        let deadline = monitor.next_deadline(&activity);
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = shutdown.cancelled() => {
                debug!("Thread group shutting down, closing {}", connection);
                break;
            }
            frame = reader.next() => match frame {
                Some(Ok(Frame::Line(line))) => {
                    activity.mark_read();
                    handler.on_line(&connection, line);
                }
                Some(Ok(Frame::Oversized { limit })) => {
                    // the codec drops the rest of the line and keeps decoding
                    activity.mark_read();
                    let error = anyhow::anyhow!(
                        "Frame from {} exceeded {} bytes, discarded",
                        connection,
                        limit
                    );
                    handler.on_error(&connection, &error);
                }
                Some(Err(e)) if is_reset(&e) => {
                    debug!("Connection {} reset by peer", connection);
                    break;
                }
                Some(Err(e)) => {
                    handler.on_error(&connection, &anyhow::Error::new(e));
                    break;
                }
                None => {
                    debug!("Connection {} closed by peer", connection);
                    break;
                }
            },
            _ = idle_deadline(deadline) => {
                for state in monitor.poll_expired(&activity, Instant::now()) {
                    handler.on_idle(&connection, state);
                }
            }
        }
    }

    connection.close();
    handler.on_inactive(&connection);
}

#[instrument(skip_all, fields(connection_id = connection.id()))]
async fn write_loop(
    connection: Arc<Connection>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut writer: FramedWrite<OwnedWriteHalf, LineCodec>,
    activity: Arc<ActivityTracker>,
) {
    let closed = connection.close_token();

    loop {
        tokio::select! {
            biased;
            line = outbound.recv() => match line {
                Some(line) => {
                    if let Err(e) = writer.send(line).await {
                        warn!("Write to {} failed: {}", connection, e);
                        connection.close();
                        break;
                    }
                    activity.mark_write();
                }
                None => break,
            },
            _ = closed.cancelled() => {
                // flush what was queued before the close
                while let Ok(line) = outbound.try_recv() {
                    if writer.send(line).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let mut write_half = writer.into_inner();
    if let Err(e) = write_half.shutdown().await {
        debug!("Shutdown of {} write half failed: {}", connection, e);
    }
}
