//! In-memory key-value store.

use super::{BoxFuture, KeyValueStore, StorageError, StorageResult};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    /// Values larger than this are declined.
    max_value_size: Option<usize>,
}

impl MemoryStore {
    /// Create a new empty store without a size limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that declines values larger than `max` bytes.
    pub fn with_max_value_size(max: usize) -> Self {
        Self {
            entries: RwLock::default(),
            max_value_size: Some(max),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Other(format!("Lock error: {}", e))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Option<Vec<u8>>>> {
        let key = key.to_string();
        Box::pin(async move {
            let entries = self.entries.read().map_err(lock_error)?;
            Ok(entries.get(&key).cloned())
        })
    }

    fn set(&self, key: &str, value: &[u8]) -> BoxFuture<'_, StorageResult<bool>> {
        let key = key.to_string();
        let value = value.to_vec();
        Box::pin(async move {
            if self.max_value_size.is_some_and(|max| value.len() > max) {
                log::debug!("Declining {} bytes for '{}'", value.len(), key);
                return Ok(false);
            }
            let mut entries = self.entries.write().map_err(lock_error)?;
            entries.insert(key, value);
            Ok(true)
        })
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, StorageResult<()>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut entries = self.entries.write().map_err(lock_error)?;
            entries.remove(&key);
            Ok(())
        })
    }

    fn list_keys(&self, prefix: &str) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let entries = self.entries.read().map_err(lock_error)?;
            Ok(entries
                .keys()
                .filter(|key| key.starts_with(&prefix))
                .cloned()
                .collect())
        })
    }
}
