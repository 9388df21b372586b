//! Websocket transport for the chat channels.
//!
//! - `transport`: tokio-tungstenite based [`ChatTransport`](crate::ports::outbound::ChatTransport)

mod transport;

pub use transport::WsTransport;
