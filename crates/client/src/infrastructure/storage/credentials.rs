//! Persisted auth headers.
//!
//! Headers are stored as a JSON list of `{key, value}` pairs under
//! [`storage_keys::AUTH_HEADERS`] and read fresh for every handshake and
//! history request, so a changed token is picked up by the next reconnect.

use std::sync::Arc;

use crate::ports::outbound::{storage_keys, HeaderPair, KeyValueStore, StorageError};

#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Load the current header set. Missing key means no headers.
    pub async fn load_headers(&self) -> Result<Vec<HeaderPair>, StorageError> {
        let Some(raw) = self.store.load(storage_keys::AUTH_HEADERS).await? else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&raw).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Like [`load_headers`](Self::load_headers), but a failure is logged and
    /// treated as "no headers".
    pub async fn headers_or_empty(&self) -> Vec<HeaderPair> {
        match self.load_headers().await {
            Ok(headers) => headers,
            Err(e) => {
                tracing::warn!("Failed to load auth headers: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn save_headers(&self, headers: &[HeaderPair]) -> Result<(), StorageError> {
        let raw =
            serde_json::to_string(headers).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.store.save(storage_keys::AUTH_HEADERS, &raw).await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.store.remove(storage_keys::AUTH_HEADERS).await
    }
}
