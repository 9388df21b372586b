//! File-backed key-value store
//!
//! Stores key-value pairs in a JSON file at:
//! - Linux: ~/.config/gangchat/storage.json
//! - macOS: ~/Library/Application Support/io.gangchat.client/storage.json
//! - Windows: C:\Users\<User>\AppData\Roaming\gangchat\client\storage.json

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use directories::ProjectDirs;
use tokio::sync::RwLock;

use crate::ports::outbound::{KeyValueStore, StorageError};

#[derive(Clone)]
pub struct FileKeyValueStore {
    /// Path to the storage file
    storage_path: PathBuf,
    /// In-memory cache of stored values
    cache: Arc<RwLock<HashMap<String, String>>>,
}

impl FileKeyValueStore {
    /// Open the store at the platform config location.
    pub async fn open_default() -> Self {
        let storage_path = if let Some(dirs) = ProjectDirs::from("io", "gangchat", "client") {
            dirs.config_dir().join("storage.json")
        } else {
            // Fallback to current directory if project dirs unavailable
            PathBuf::from("gangchat_storage.json")
        };
        Self::open(storage_path).await
    }

    /// Open the store at `storage_path`, loading existing data if present.
    ///
    /// An unreadable or corrupt file starts an empty store.
    pub async fn open(storage_path: impl Into<PathBuf>) -> Self {
        let storage_path = storage_path.into();

        let cache = match tokio::fs::read_to_string(&storage_path).await {
            Ok(data) => match serde_json::from_str::<HashMap<String, String>>(&data) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!("Failed to parse storage file: {}", e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!("Failed to read storage file: {}", e);
                HashMap::new()
            }
        };

        tracing::debug!("File storage initialized at: {:?}", storage_path);

        Self {
            storage_path,
            cache: Arc::new(RwLock::new(cache)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.storage_path
    }

    async fn persist(&self, snapshot: &HashMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.storage_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let data = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        tokio::fs::write(&self.storage_path, data).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.cache.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let snapshot = {
            let mut guard = self.cache.write().await;
            guard.insert(key.to_string(), value.to_string());
            guard.clone()
        };
        self.persist(&snapshot).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let snapshot = {
            let mut guard = self.cache.write().await;
            if guard.remove(key).is_none() {
                return Ok(());
            }
            guard.clone()
        };
        self.persist(&snapshot).await
    }
}
