use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::Storage;
use crate::error::StorageError;

/// Whole-map JSON file store, rewritten on every mutation.
///
/// The file is read lazily on first access so constructing the store never
/// fails; a missing file is an empty store.
pub struct JsonFileStorage {
    path: PathBuf,
    cache: Mutex<Option<BTreeMap<String, Value>>>,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_entries<R>(
        &self,
        mutate: bool,
        f: impl FnOnce(&mut BTreeMap<String, Value>) -> R,
    ) -> Result<R, StorageError> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(load_store(&self.path)?);
        }
        let entries = cache.get_or_insert_with(BTreeMap::new);
        let result = f(entries);
        if mutate {
            persist_store(&self.path, entries)?;
        }
        Ok(result)
    }
}

#[async_trait]
impl Storage for JsonFileStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.with_entries(false, |entries| entries.get(key).cloned())
            .await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.with_entries(true, |entries| {
            entries.insert(key.to_string(), value);
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.with_entries(true, |entries| {
            entries.remove(key);
        })
        .await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.with_entries(true, BTreeMap::clear).await
    }
}

fn load_store(path: &Path) -> Result<BTreeMap<String, Value>, StorageError> {
    let data = match std::fs::read(path) {
        Ok(v) => v,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(StorageError::Read(err.to_string())),
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(BTreeMap::new());
    }
    serde_json::from_slice(&data).map_err(|e| StorageError::Read(format!("invalid JSON: {e}")))
}

fn persist_store(path: &Path, entries: &BTreeMap<String, Value>) -> Result<(), StorageError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| StorageError::Write(format!("failed creating store dir: {e}")))?;
    }
    let serialized = serde_json::to_vec_pretty(entries)
        .map_err(|e| StorageError::Write(format!("failed serializing store json: {e}")))?;
    std::fs::write(path, serialized).map_err(|e| StorageError::Write(e.to_string()))
}
