//! Durable key-value storage
//!
//! Everything that must outlive a host-process restart goes through a
//! [`DurableStore`]: the transcript log snapshot, the session-active flag and
//! circuit breaker state. Values are opaque strings (JSON by convention).
//!
//! Two implementations ship with the crate:
//! - [`FileStore`]: one file per key under a directory, written atomically
//! - [`MemoryStore`]: process-local map, for tests and ephemeral hosts

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::ResilienceConfig;

/// Errors raised by a durable store
#[derive(Debug)]
pub enum StoreError {
    /// Underlying filesystem/IO failure
    Io(String),
    /// Stored value could not be (de)serialized
    Serialization(String),
    /// Key contains characters the store cannot represent
    InvalidKey(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Durable store IO error: {}", e),
            StoreError::Serialization(e) => write!(f, "Durable store serialization error: {}", e),
            StoreError::InvalidKey(k) => write!(f, "Invalid durable store key: {:?}", k),
        }
    }
}

impl std::error::Error for StoreError {}

/// Async key-value store whose contents survive a process restart
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Read a value; `Ok(None)` if the key is absent
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key; removing an absent key is not an error
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Read a JSON value from the store
pub async fn get_json<T: serde::de::DeserializeOwned>(
    store: &dyn DurableStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Serialization(format!("{}: {}", key, e))),
        None => Ok(None),
    }
}

/// Write a value to the store as JSON
pub async fn set_json<T: serde::Serialize>(
    store: &dyn DurableStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let raw =
        serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.set(key, &raw).await
}

/// Default directory for the file store: `<data_dir>/resilient-stt/state/`
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("resilient-stt")
        .join("state")
}

/// File-backed store: each key is a `<key>.json` file inside `dir`
///
/// Writes go to a temp file in the same directory and are renamed over the
/// destination, so a crash mid-write never leaves a truncated value behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `dir` (created lazily on first write)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at the configured state dir, or [`default_state_dir`]
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(config.state_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
        if !valid || key.starts_with('.') {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        // ':' is not portable in file names
        let file_name = format!("{}.json", key.replace(':', "__"));
        Ok(self.dir.join(file_name))
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(format!("read {:?}: {}", path, e))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Io(format!("create {:?}: {}", self.dir, e)))?;

        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, value)
            .await
            .map_err(|e| StoreError::Io(format!("write temp {:?}: {}", tmp_path, e)))?;

        // On Windows rename fails if the destination exists
        if cfg!(windows) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Io(format!("remove {:?}: {}", path, e))),
            }
        }

        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| StoreError::Io(format!("rename {:?} to {:?}: {}", tmp_path, path, e)))
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(format!("remove {:?}: {}", path, e))),
        }
    }
}

/// In-memory store
///
/// Survives "restarts" only as long as the same instance is shared, which is
/// exactly what tests need to simulate process death.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently present (sorted, for assertions)
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = match self.entries.lock() {
            Ok(entries) => entries.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        keys.sort();
        keys
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<String, String>) -> R) -> R {
        match self.entries.lock() {
            Ok(mut entries) => f(&mut entries),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.with_entries(|entries| entries.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), value.to_string());
        });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.with_entries(|entries| {
            entries.remove(key);
        });
        Ok(())
    }
}
