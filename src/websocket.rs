//! WebSocket frames and the registry of upgraded connections.
//!
//! Frames are never written to a socket from the caller's thread. Each
//! connection owns a bounded channel whose receiving end is drained by the
//! transport on that connection's own send path, which keeps writes to one
//! connection serialized.

use crate::error::{ServerError, ServerResult};
use crate::session::ConnectionId;
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(Opcode::Text, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn binary(data: &[u8]) -> Self {
        Self::new(Opcode::Binary, Bytes::copy_from_slice(data))
    }

    pub fn close() -> Self {
        Self::new(Opcode::Close, Bytes::new())
    }

    /// Payload as text, for text frames holding valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        match self.opcode {
            Opcode::Text => std::str::from_utf8(&self.payload).ok(),
            _ => None,
        }
    }
}

/// Receiving end the transport drains onto the wire
pub type FrameReceiver = Receiver<Frame>;

/// Handle to an upgraded connection. Cheap to clone and safe to use from any
/// thread; sends are queued onto the connection's own send path.
#[derive(Clone)]
pub struct WebSocketConnection {
    id: ConnectionId,
    sender: Sender<Frame>,
    open: Arc<AtomicBool>,
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl WebSocketConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queue a frame for this connection
    pub fn queue_message(&self, frame: Frame) -> ServerResult<()> {
        if !self.is_open() {
            return Err(ServerError::NotFound(format!("WebSocket connection {}", self.id)));
        }
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ServerError::Protocol(format!(
                "Send queue of connection {} is full",
                self.id
            ))),
            Err(TrySendError::Disconnected(_)) => {
                self.open.store(false, Ordering::Release);
                Err(ServerError::NotFound(format!("WebSocket connection {}", self.id)))
            }
        }
    }

    /// Queue a text frame
    pub fn queue_text(&self, text: &str) -> ServerResult<()> {
        self.queue_message(Frame::text(text))
    }

    /// Answer from inside a handler; shares the queued send path
    pub fn reply(&self, frame: Frame) -> ServerResult<()> {
        self.queue_message(frame)
    }
}

struct Tracked {
    connection: WebSocketConnection,
    endpoint: usize,
}

/// Every connection that completed an upgrade
pub struct WebSocketRegistry {
    connections: Mutex<HashMap<ConnectionId, Tracked>>,
    queue_capacity: usize,
}

impl WebSocketRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Track `id` as upgraded on the endpoint at index `endpoint`
    pub fn register(&self, id: ConnectionId, endpoint: usize) -> (WebSocketConnection, FrameReceiver) {
        let (sender, receiver) = channel::bounded(self.queue_capacity);
        let connection = WebSocketConnection {
            id,
            sender,
            open: Arc::new(AtomicBool::new(true)),
        };

        let previous = self.connections.lock().insert(
            id,
            Tracked {
                connection: connection.clone(),
                endpoint,
            },
        );
        if let Some(previous) = previous {
            previous.connection.open.store(false, Ordering::Release);
        }

        log::debug!("WebSocket connection {} registered", id);
        (connection, receiver)
    }

    /// Forget a closed connection. Later sends to it fail with `NotFound`.
    pub fn remove(&self, id: ConnectionId) -> bool {
        match self.connections.lock().remove(&id) {
            Some(tracked) => {
                tracked.connection.open.store(false, Ordering::Release);
                log::debug!("WebSocket connection {} removed", id);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<WebSocketConnection> {
        self.connections.lock().get(&id).map(|t| t.connection.clone())
    }

    pub(crate) fn endpoint_of(&self, id: ConnectionId) -> Option<(usize, WebSocketConnection)> {
        self.connections
            .lock()
            .get(&id)
            .map(|t| (t.endpoint, t.connection.clone()))
    }

    /// Queue a frame for connection `id`
    pub fn queue_message(&self, id: ConnectionId, frame: Frame) -> ServerResult<()> {
        let connection = self
            .get(id)
            .ok_or_else(|| ServerError::NotFound(format!("WebSocket connection {}", id)))?;
        connection.queue_message(frame)
    }

    /// Queue `frame` on every tracked connection. A failure on one connection
    /// is logged and skipped. Returns how many connections accepted it.
    pub fn send_all(&self, frame: &Frame) -> usize {
        let targets: Vec<WebSocketConnection> = self
            .connections
            .lock()
            .values()
            .map(|t| t.connection.clone())
            .collect();

        let mut delivered = 0;
        for connection in targets {
            match connection.queue_message(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    metrics::increment_counter!("ws_broadcast_failures_total");
                    log::warn!("Broadcast to connection {} failed: {}", connection.id(), e);
                }
            }
        }
        delivered
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}
