//! File-backed key-value store.

use super::{BoxFuture, KeyValueStore, StorageError, StorageResult};
use std::fs;
use std::path::{Path, PathBuf};

/// Extension of value files.
const VALUE_EXT: &str = "kv";

/// Stores each key as one file in a directory.
///
/// Keys are percent-encoded into file names, so any key round-trips through
/// [`KeyValueStore::list_keys`]. Writes go to a temporary file that is then
/// renamed over the target.
pub struct FileStore {
    /// Base directory for stored values.
    base_path: PathBuf,
    max_value_size: Option<usize>,
}

impl FileStore {
    /// Create a store in `base_path`, creating the directory if needed.
    pub fn new(base_path: impl Into<PathBuf>) -> StorageResult<Self> {
        let base_path = base_path.into();
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                StorageError::Io(format!("Failed to create storage directory: {}", e))
            })?;
        }
        Ok(Self {
            base_path,
            max_value_size: None,
        })
    }

    /// Decline values larger than `max` bytes.
    pub fn with_max_value_size(mut self, max: usize) -> Self {
        self.max_value_size = Some(max);
        self
    }

    /// Get the base path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.{}", encode_key(key), VALUE_EXT))
    }
}

/// Percent-encode everything but ASCII alphanumerics, `-` and `_`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Option<Vec<u8>>>> {
        let path = self.value_path(key);
        Box::pin(async move {
            if !path.exists() {
                return Ok(None);
            }
            fs::read(&path)
                .map(Some)
                .map_err(|e| StorageError::Io(format!("Failed to read {}: {}", path.display(), e)))
        })
    }

    fn set(&self, key: &str, value: &[u8]) -> BoxFuture<'_, StorageResult<bool>> {
        let path = self.value_path(key);
        let key = key.to_string();
        let value = value.to_vec();
        Box::pin(async move {
            if self.max_value_size.is_some_and(|max| value.len() > max) {
                log::debug!("Declining {} bytes for '{}'", value.len(), key);
                return Ok(false);
            }
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, &value).map_err(|e| {
                StorageError::Io(format!("Failed to write {}: {}", tmp.display(), e))
            })?;
            fs::rename(&tmp, &path).map_err(|e| {
                let _ = fs::remove_file(&tmp);
                StorageError::Io(format!("Failed to replace {}: {}", path.display(), e))
            })?;
            Ok(true)
        })
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.value_path(key);
        Box::pin(async move {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| {
                    StorageError::Io(format!("Failed to delete {}: {}", path.display(), e))
                })?;
            }
            Ok(())
        })
    }

    fn list_keys(&self, prefix: &str) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        let base = self.base_path.clone();
        let prefix = prefix.to_string();
        Box::pin(async move {
            if !base.exists() {
                return Ok(vec![]);
            }

            let entries = fs::read_dir(&base)
                .map_err(|e| StorageError::Io(format!("Failed to read directory: {}", e)))?;

            let mut keys = Vec::new();
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_none_or(|ext| ext != VALUE_EXT) {
                    continue;
                }
                let Some(key) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(decode_key)
                else {
                    log::warn!("Ignoring unrecognized file {}", path.display());
                    continue;
                };
                if key.starts_with(&prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
    }
}
