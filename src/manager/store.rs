//! Durable index of sandbox records.
//!
//! The manager only needs single-key operations plus an atomic
//! create-if-absent, which is what makes "already exists" race free.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{instrument, trace};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::system::paths::ensure_private_dir;

/// Key/value store holding serialized sandbox records.
#[async_trait]
pub trait SandboxStore: Send + Sync {
    /// Get a value by key
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Set a key-value pair, replacing any previous value
    async fn set(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Delete a key; deleting a missing key succeeds
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Store a value only if the key is absent. Returns false, leaving the
    /// existing value untouched, when the key is already present.
    async fn insert_new(&self, key: &str, value: &[u8]) -> StoreResult<bool>;

    /// List all keys
    async fn list_keys(&self) -> StoreResult<Vec<String>>;
}

/// In-memory store for tests and single-process use.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SandboxStore for MemoryStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    #[instrument(skip(self, value), fields(value_len = value.len()))]
    async fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.data.write().await.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.data.write().await.remove(key);
        Ok(())
    }

    #[instrument(skip(self, value), fields(value_len = value.len()))]
    async fn insert_new(&self, key: &str, value: &[u8]) -> StoreResult<bool> {
        let mut data = self.data.write().await;
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(key.to_string(), value.to_vec());
        Ok(true)
    }

    async fn list_keys(&self) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = self.data.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// One JSON file per key under a directory.
///
/// Writes go to a temp file that is renamed into place. `insert_new`
/// hard-links the temp file to the target, which fails atomically if the
/// target already exists.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        ensure_private_dir(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        if key.is_empty() || key.starts_with('.') || key.contains('/') {
            return Err(StoreError::Io {
                context: format!("invalid index key: {key:?}"),
                source: std::io::Error::from(ErrorKind::InvalidInput),
            });
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    async fn write_temp(&self, value: &[u8]) -> StoreResult<PathBuf> {
        let temp_path = self.dir.join(format!(".{}.tmp", Uuid::new_v4().simple()));
        let io_err = |e| StoreError::Io {
            context: format!("failed to write temp index file: {}", temp_path.display()),
            source: e,
        };

        let mut file = tokio::fs::File::create(&temp_path).await.map_err(io_err)?;
        file.write_all(value).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        Ok(temp_path)
    }
}

#[async_trait]
impl SandboxStore for FileStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io {
                context: format!("failed to read index file: {}", path.display()),
                source: e,
            }),
        }
    }

    #[instrument(skip(self, value), fields(value_len = value.len()))]
    async fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let path = self.path_for(key)?;
        let temp_path = self.write_temp(value).await?;

        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StoreError::Io {
                context: format!(
                    "failed to rename temp file {} to {}",
                    temp_path.display(),
                    path.display()
                ),
                source: e,
            })
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io {
                context: format!("failed to remove index file: {}", path.display()),
                source: e,
            }),
        }
    }

    #[instrument(skip(self, value), fields(value_len = value.len()))]
    async fn insert_new(&self, key: &str, value: &[u8]) -> StoreResult<bool> {
        let path = self.path_for(key)?;
        let temp_path = self.write_temp(value).await?;

        let linked = tokio::fs::hard_link(&temp_path, &path).await;
        let _ = tokio::fs::remove_file(&temp_path).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                trace!(key, "index key already present");
                Ok(false)
            }
            Err(e) => Err(StoreError::Io {
                context: format!("failed to create index file: {}", path.display()),
                source: e,
            }),
        }
    }

    async fn list_keys(&self) -> StoreResult<Vec<String>> {
        let io_err = |e| StoreError::Io {
            context: format!("failed to list index directory: {}", self.dir.display()),
            source: e,
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(".json") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}
