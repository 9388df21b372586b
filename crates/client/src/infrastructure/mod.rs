pub mod http_client;
pub mod storage;
pub mod urls;
pub mod websocket;
