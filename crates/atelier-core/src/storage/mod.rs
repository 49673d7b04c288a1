//! Durable key-value storage and the autosave service built on it.

mod autosave;
mod file;
mod memory;
mod recovery;

pub use autosave::{
    AutoSaveConfig, AutoSaveError, AutoSaveManager, AutoSaveResult, DEFAULT_AUTOSAVE_INTERVAL_SECS,
    DEFAULT_MAX_BACKUPS, DirtyFlag, SaveGuard, SaveOutcome, SaveTrigger, SkipReason,
};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use recovery::{
    PROJECT_PREFIX, PayloadLocation, RECOVERY_INDEX_KEY, RECOVERY_PAYLOAD_PREFIX, RecoveryPoint,
    SESSION_ACTIVE_KEY, manifest_key, payload_key, project_key,
};

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Storage error: {0}")]
    Other(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed future returned by storage backends.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// A durable byte store addressed by string keys.
///
/// Keys are opaque to the store; callers use `/` to build namespaces such as
/// `recovery/payload/<id>`.
pub trait KeyValueStore: Send + Sync {
    /// Read a value. `None` if the key is absent.
    fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Option<Vec<u8>>>>;

    /// Write a value.
    ///
    /// Returns `Ok(false)` when the store declines the value for size; that
    /// is a capacity signal, not an error.
    fn set(&self, key: &str, value: &[u8]) -> BoxFuture<'_, StorageResult<bool>>;

    /// Delete a key. Deleting an absent key succeeds.
    fn remove(&self, key: &str) -> BoxFuture<'_, StorageResult<()>>;

    /// Keys starting with `prefix`, sorted.
    fn list_keys(&self, prefix: &str) -> BoxFuture<'_, StorageResult<Vec<String>>>;
}
