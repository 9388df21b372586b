//! Gangchat client
//!
//! Keeps the two chat channels of a player (the `game` channel and the `gang`
//! channel) synchronized with the backend.
//!
//! # Overview
//!
//! - **Connection manager** - [`ChatConnectionManager`] owns one websocket per
//!   channel, reconnects with exponential backoff after involuntary closes and
//!   ignores callbacks from sockets that have been superseded.
//!
//! - **History refresh** - every connect and every inbound notification pulls
//!   the full recent history over HTTP and replaces the channel's message list
//!   in the application store.
//!
//! - **Ports** - transport, HTTP, application store and persisted credentials
//!   are traits in [`ports::outbound`], so the manager can be driven by fakes in
//!   tests.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gangchat_client::{
//!     ChannelId, ChatConfig, ChatConnectionManager, ChatDependencies,
//!     infrastructure::{
//!         http_client::HttpChatApi,
//!         storage::{CredentialStore, MemoryKeyValueStore},
//!         websocket::WsTransport,
//!     },
//!     ports::outbound::{ChatAction, ChatStore},
//! };
//!
//! struct PrintStore;
//!
//! impl ChatStore for PrintStore {
//!     fn dispatch(&self, action: ChatAction) {
//!         println!("{action:?}");
//!     }
//!
//!     fn displayed_path(&self) -> Option<String> {
//!         None
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ChatConfig::from_env()?;
//! let credentials = CredentialStore::new(Arc::new(MemoryKeyValueStore::default()));
//! let deps = ChatDependencies {
//!     transport: Arc::new(WsTransport::new(config.connect_timeout)),
//!     api: Arc::new(HttpChatApi::new(&config.api_base_url, credentials.clone())?),
//!     store: Arc::new(PrintStore),
//!     credentials,
//! };
//!
//! let manager = ChatConnectionManager::spawn(config, deps);
//! manager.connect(ChannelId::Game, Some("games/42"));
//! manager.send_message("games/42", &serde_json::json!({ "text": "gg" })).await;
//! manager.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod channel;
pub mod config;
pub mod infrastructure;
pub mod manager;
pub mod ports;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backoff::ReconnectPolicy;
pub use channel::{ChannelId, ChannelSnapshot, ConnectionState};
pub use config::{ChatConfig, ConfigError};
pub use manager::{ChatConnectionManager, ChatDependencies};
