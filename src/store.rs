use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::ClientError;

/// Key-value persistence surviving page reloads.
///
/// The layer itself never assumes more than get/set/remove by key; every
/// structured value is serialized JSON under a fixed key from [`keys`].
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ClientError>;
    async fn set(&self, key: &str, value: String) -> Result<(), ClientError>;
    async fn remove(&self, key: &str) -> Result<(), ClientError>;
}

/// Fixed key layout. One writer role per namespace: `auth:*` belongs to the
/// token coordinator, `queue:*` to the offline queue, `mode:*` and `cache:*`
/// to the router, `demo:*` to the simulated backend.
pub mod keys {
    pub const ACCESS_TOKEN: &str = "auth:access-token";
    pub const REFRESH_TOKEN: &str = "auth:refresh-token";
    pub const TOKEN_EXPIRES_AT: &str = "auth:expires-at";
    pub const OFFLINE_QUEUE: &str = "queue:pending";
    pub const DEAD_LETTER: &str = "queue:dead-letter";
    pub const MODE: &str = "mode:current";

    #[must_use]
    pub fn cache(resource_key: &str) -> String {
        format!("cache:{resource_key}")
    }

    #[must_use]
    pub fn demo(endpoint: &str) -> String {
        format!("demo:{endpoint}")
    }
}

pub async fn read_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, ClientError> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| ClientError::Persistence(format!("corrupt value at '{key}': {e}"))),
        None => Ok(None),
    }
}

pub async fn write_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), ClientError> {
    let raw = serde_json::to_string(value)
        .map_err(|e| ClientError::Persistence(format!("serialize '{key}': {e}")))?;
    store.set(key, raw).await
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), ClientError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), ClientError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// File-backed store: one JSON document, rewritten atomically on every
/// mutation (write to a temp file, fsync, rename over the original).
///
/// Mutations re-read the persisted document before applying, so the file is
/// never clobbered from a stale in-memory copy.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<HashMap<String, String>, ClientError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| ClientError::Persistence(format!("read store file: {e}")))?;
        if raw.is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&raw)
            .map_err(|e| ClientError::Persistence(format!("corrupt store file: {e}")))
    }

    fn persist(&self, entries: &HashMap<String, String>) -> Result<(), ClientError> {
        let raw = serde_json::to_string(entries)
            .map_err(|e| ClientError::Persistence(format!("serialize store file: {e}")))?;

        let tmp_path = self.path.with_extension("tmp");
        write_atomic(&self.path, &tmp_path, raw.as_bytes())
            .map_err(|e| ClientError::Persistence(format!("write store file: {e}")))
    }
}

fn write_atomic(path: &Path, tmp_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    std::fs::rename(tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        Ok(self.load()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), ClientError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value);
        self.persist(&entries)
    }

    async fn remove(&self, key: &str) -> Result<(), ClientError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load()?;
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }
}
