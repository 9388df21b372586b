//! Outbound ports - Interfaces for external services
//!
//! These ports define the contracts that infrastructure adapters must implement,
//! allowing the connection manager to reach the socket transport, the history
//! API, the application store and persisted storage without depending on
//! concrete implementations.

pub mod chat_api_port;
pub mod chat_store_port;
pub mod storage_port;
pub mod transport_port;

pub use chat_api_port::{ApiError, ChatApiPort};
pub use chat_store_port::{ChatAction, ChatStore};
pub use storage_port::{storage_keys, HeaderPair, KeyValueStore, StorageError};
pub use transport_port::{
    ChatTransport, SocketEvent, SocketEventSink, SocketHandle, SocketRequest, TransportError,
    ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};

#[cfg(any(test, feature = "testing"))]
pub use chat_store_port::MockChatStore;
#[cfg(any(test, feature = "testing"))]
pub use storage_port::MockKeyValueStore;
