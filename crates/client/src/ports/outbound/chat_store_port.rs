//! Application store port
//!
//! One-way notifications from the manager to whatever state container the
//! application uses. The only thing the manager reads back is the path of the
//! chat currently on screen.

use serde_json::Value;

use crate::channel::{ChannelId, ConnectionState};

/// Notification dispatched to the application store.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatAction {
    /// History request for the channel started or finished
    SetLoading { channel: ChannelId, loading: bool },
    /// Full replacement of the channel's message list
    ReplaceMessages {
        channel: ChannelId,
        messages: Vec<Value>,
    },
    /// Whether the latest message on the channel has been seen
    SetMessagesRead { channel: ChannelId, read: bool },
    /// Derived connection state of the channel changed
    ConnectionChanged {
        channel: ChannelId,
        state: ConnectionState,
    },
}

impl ChatAction {
    pub fn channel(&self) -> ChannelId {
        match self {
            Self::SetLoading { channel, .. }
            | Self::ReplaceMessages { channel, .. }
            | Self::SetMessagesRead { channel, .. }
            | Self::ConnectionChanged { channel, .. } => *channel,
        }
    }
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait ChatStore: Send + Sync {
    fn dispatch(&self, action: ChatAction);

    /// Path of the chat currently displayed, if any.
    fn displayed_path(&self) -> Option<String>;
}
