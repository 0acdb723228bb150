//! Connection Handle
//!
//! A [`Connection`] is the single object shared between a connection's I/O
//! tasks, the timers scheduled against it and application code. Everything
//! the timers need from it is here: liveness, the close event, outbound
//! writes, the attributes used for cancellation and removable close
//! listeners.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::{lock, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Key of an attribute stored on a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttributeKey {
    /// One scheduled task, unique per registration
    Task(Uuid),
    /// The most recent auto-disconnect registration
    AutoDisconnect,
}

/// Value stored under an [`AttributeKey`]
pub(crate) type Attribute = Arc<dyn Any + Send + Sync>;

type CloseListener = Box<dyn FnOnce(&Connection) + Send>;

/// Registration of a close listener, used to remove it before the close
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CloseListenerId(u64);

/// An established line-oriented connection
pub struct Connection {
    id: u64,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    active: AtomicBool,
    closed: CancellationToken,
    outbound: mpsc::UnboundedSender<String>,
    attributes: Mutex<HashMap<AttributeKey, Attribute>>,
    close_listeners: Mutex<BTreeMap<CloseListenerId, CloseListener>>,
    next_listener: AtomicU64,
}

impl Connection {
    pub(crate) fn new(
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            local_addr,
            peer_addr,
            active: AtomicBool::new(true),
            closed: CancellationToken::new(),
            outbound,
            attributes: Mutex::new(HashMap::new()),
            close_listeners: Mutex::new(BTreeMap::new()),
            next_listener: AtomicU64::new(0),
        });
        (connection, outbound_rx)
    }

    /// Create an active connection that is not backed by a socket.
    ///
    /// Lines written to it are delivered to the returned receiver. Useful for
    /// driving handlers and scheduled tasks without a network.
    pub fn embedded() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        Self::new(None, None)
    }

    /// Process-unique connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Whether the connection is still open
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Queue one line for sending. The delimiter is appended by the codec.
    pub fn write_line(&self, line: impl Into<String>) -> Result<()> {
        if !self.is_active() {
            bail!("connection {} is closed", self.id);
        }
        if self.outbound.send(line.into()).is_err() {
            bail!("connection {} writer has stopped", self.id);
        }
        Ok(())
    }

    /// Close the connection and fire the close listeners.
    ///
    /// Only the first call has an effect. Lines queued before the call are
    /// still flushed by the writer.
    pub fn close(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(connection_id = self.id, "Closing connection");
        self.closed.cancel();

        let listeners = std::mem::take(&mut *lock(&self.close_listeners));
        for listener in listeners.into_values() {
            listener(self);
        }
    }

    /// Wait until the connection has been closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Run `listener` once the connection closes. Listeners run in
    /// registration order.
    ///
    /// If the connection is already closed the listener runs immediately on
    /// the calling thread and `None` is returned.
    pub fn on_close<F>(&self, listener: F) -> Option<CloseListenerId>
    where
        F: FnOnce(&Connection) + Send + 'static,
    {
        {
            let mut listeners = lock(&self.close_listeners);
            // checked under the lock so close() either sees this listener or
            // we see the closed flag
            if self.is_active() {
                let id = CloseListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
                listeners.insert(id, Box::new(listener));
                return Some(id);
            }
        }
        listener(self);
        None
    }

    /// Drop a listener that has not run yet. Returns false once the
    /// connection has closed, because listeners are consumed by the close.
    pub fn remove_close_listener(&self, id: CloseListenerId) -> bool {
        lock(&self.close_listeners).remove(&id).is_some()
    }

    /// Number of close listeners waiting for the close
    pub fn close_listener_count(&self) -> usize {
        lock(&self.close_listeners).len()
    }

    /// Store an attribute, returning the one it replaced
    pub(crate) fn set_attribute(&self, key: AttributeKey, value: Attribute) -> Option<Attribute> {
        lock(&self.attributes).insert(key, value)
    }

    /// Remove the attribute under `key` if it holds a `T`
    pub(crate) fn take_attribute<T>(&self, key: &AttributeKey) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let mut attributes = lock(&self.attributes);
        if !attributes.get(key).is_some_and(|value| value.is::<T>()) {
            return None;
        }
        attributes.remove(key)?.downcast::<T>().ok()
    }

    /// Remove the attribute only while it is still `value` itself
    pub(crate) fn remove_attribute_if<T: Any>(&self, key: &AttributeKey, value: &Arc<T>) {
        let mut attributes = lock(&self.attributes);
        let target = Arc::as_ptr(value) as *const ();
        if attributes
            .get(key)
            .is_some_and(|current| Arc::as_ptr(current) as *const () == target)
        {
            attributes.remove(key);
        }
    }

    /// Whether an attribute is stored under `key`
    pub fn has_attribute(&self, key: &AttributeKey) -> bool {
        lock(&self.attributes).contains_key(key)
    }

    /// Number of attributes still stored on the connection
    pub fn attribute_count(&self) -> usize {
        lock(&self.attributes).len()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.local_addr, self.peer_addr) {
            (Some(local), Some(peer)) => write!(f, "[id: {}, L:{} - R:{}]", self.id, local, peer),
            _ => write!(f, "[id: {}, embedded]", self.id),
        }
    }
}
