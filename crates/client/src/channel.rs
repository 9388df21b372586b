//! Per-channel connection state.
//!
//! Both chat channels share this one state type; the manager keeps them in a
//! map keyed by [`ChannelId`] and applies the same transitions to either.

use std::fmt;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::ports::outbound::SocketHandle;

/// The two independent chat streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelId {
    Game,
    Gang,
}

impl ChannelId {
    pub const ALL: [ChannelId; 2] = [ChannelId::Game, ChannelId::Gang];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelId::Game => "game",
            ChannelId::Gang => "gang",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of a channel as seen from outside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No target path, or closed deliberately
    Disconnected,
    /// Attempting to establish connection
    Connecting,
    /// Handshake completed
    Connected,
    /// Connection lost, a reconnect is scheduled
    Reconnecting,
    /// Reconnect budget exhausted; needs a new `connect()`
    Failed,
}

/// Identity of one socket, used to drop events from superseded sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SocketId(pub u64);

/// The socket currently owned by a channel.
pub(crate) struct SocketSlot {
    pub id: SocketId,
    /// Path this socket was opened for
    pub path: String,
    /// `None` while credentials are still loading
    pub handle: Option<Box<dyn SocketHandle>>,
    pub open: bool,
}

/// A pending reconnect.
pub(crate) struct ReconnectTimer {
    pub id: u64,
    pub path: String,
    pub delay: Duration,
    pub task: JoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct ChannelState {
    pub path: Option<String>,
    pub socket: Option<SocketSlot>,
    pub is_connecting: bool,
    pub reconnect_attempts: u32,
    pub reconnect_timer: Option<ReconnectTimer>,
    /// Set when the backoff budget ran out; cleared by the next attempt
    pub exhausted: bool,
    /// Number of the latest history fetch; older results are dropped
    pub history_fetch: u64,
}

impl ChannelState {
    pub fn state(&self) -> ConnectionState {
        match (&self.socket, &self.reconnect_timer) {
            (Some(slot), _) if slot.open => ConnectionState::Connected,
            (Some(_), _) => ConnectionState::Connecting,
            (None, Some(_)) => ConnectionState::Reconnecting,
            (None, None) if self.exhausted => ConnectionState::Failed,
            (None, None) => ConnectionState::Disconnected,
        }
    }

    /// True when the stored target still equals `path`.
    pub fn targets(&self, path: &str) -> bool {
        self.path.as_deref() == Some(path)
    }

    pub fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.task.abort();
        }
    }

    /// Close the owned socket, if any, without waiting for it.
    pub fn close_socket(&mut self, code: u16, reason: &str) {
        if let Some(slot) = self.socket.take() {
            if let Some(handle) = slot.handle {
                handle.close(code, reason);
            }
        }
    }

    pub fn snapshot(&self, channel: ChannelId) -> ChannelSnapshot {
        ChannelSnapshot {
            channel,
            path: self.path.clone(),
            state: self.state(),
            is_connecting: self.is_connecting,
            reconnect_attempts: self.reconnect_attempts,
            pending_reconnect: self.reconnect_timer.as_ref().map(|t| t.delay),
            has_socket: self.socket.is_some(),
        }
    }
}

/// Read-only view of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub channel: ChannelId,
    pub path: Option<String>,
    pub state: ConnectionState,
    pub is_connecting: bool,
    pub reconnect_attempts: u32,
    /// Delay of the pending reconnect, if one is scheduled
    pub pending_reconnect: Option<Duration>,
    /// A socket is open or connecting
    pub has_socket: bool,
}
