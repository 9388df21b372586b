//! Chat API Port - HTTP boundary for message history
//!
//! Messages are opaque JSON values; the manager hands them to the store as-is.

use serde_json::Value;

/// Errors from the chat HTTP API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    RequestFailed(String),
    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait::async_trait]
pub trait ChatApiPort: Send + Sync {
    /// Fetch the `limit` most recent messages of a chat path.
    async fn fetch_messages(&self, chat_path: &str, limit: u32) -> Result<Vec<Value>, ApiError>;
}
