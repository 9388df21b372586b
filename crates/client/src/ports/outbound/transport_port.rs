//! Socket transport port
//!
//! Models a websocket the way a browser exposes one: opening returns a handle
//! immediately and the handshake result, inbound frames and the final close
//! arrive later as [`SocketEvent`]s. The manager never awaits the handshake.

use std::fmt;
use std::sync::Arc;

use super::HeaderPair;

/// Close code the client uses for every close it initiates itself.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Lifecycle events emitted by a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Handshake completed
    Open,
    /// Text frame received
    Message(String),
    /// Socket is gone; always the last event of a socket
    Close { code: u16, reason: String },
    /// Transport failure; a `Close` is expected to follow
    Error(String),
}

impl SocketEvent {
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close {
            code,
            reason: reason.into(),
        }
    }
}

/// Everything needed to start a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRequest {
    pub url: String,
    pub headers: Vec<HeaderPair>,
}

/// Callback through which a transport reports [`SocketEvent`]s for one socket.
#[derive(Clone)]
pub struct SocketEventSink {
    inner: Arc<dyn Fn(SocketEvent) + Send + Sync>,
}

impl SocketEventSink {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(SocketEvent) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(callback),
        }
    }

    pub fn emit(&self, event: SocketEvent) {
        (self.inner)(event);
    }
}

impl fmt::Debug for SocketEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketEventSink").finish_non_exhaustive()
    }
}

/// Transport-level failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid socket URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid handshake header {name}: {message}")]
    InvalidHeader { name: String, message: String },
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Handshake timed out after {0}ms")]
    Timeout(u64),
    #[error("Socket is closed")]
    Closed,
}

/// Owned handle to one socket.
pub trait SocketHandle: Send {
    /// Queue a text frame for sending.
    fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Start a close handshake. Does not wait for it to finish.
    fn close(&self, code: u16, reason: &str);
}

/// Factory for sockets.
pub trait ChatTransport: Send + Sync {
    /// Begin connecting. Events for the new socket go to `events`.
    fn open(&self, request: SocketRequest, events: SocketEventSink) -> Box<dyn SocketHandle>;
}
