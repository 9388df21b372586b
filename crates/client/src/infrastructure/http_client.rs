//! reqwest-backed history client.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::infrastructure::storage::CredentialStore;
use crate::infrastructure::urls::history_url;
use crate::ports::outbound::{ApiError, ChatApiPort};

/// Timeout for a single history request.
pub const HISTORY_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    messages: Vec<Value>,
}

/// Client for the chat HTTP API.
#[derive(Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: String,
    credentials: CredentialStore,
}

impl HttpChatApi {
    pub fn new(base_url: &str, credentials: CredentialStore) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(HISTORY_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::RequestFailed(e.to_string()))?;

        Ok(Self::with_client(client, base_url, credentials))
    }

    /// Create client around an existing reqwest client (for testing).
    pub fn with_client(client: Client, base_url: &str, credentials: CredentialStore) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            credentials,
        }
    }
}

#[async_trait::async_trait]
impl ChatApiPort for HttpChatApi {
    async fn fetch_messages(&self, chat_path: &str, limit: u32) -> Result<Vec<Value>, ApiError> {
        let url = history_url(&self.base_url, chat_path, limit)
            .map_err(|e| ApiError::RequestFailed(e.to_string()))?;

        let mut request = self.client.get(url);
        for header in self.credentials.headers_or_empty().await {
            request = request.header(header.key, header.value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;

        Ok(body.messages)
    }
}
