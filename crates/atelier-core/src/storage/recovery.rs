//! Recovery points and the storage keys of the autosave ring.

use super::{KeyValueStore, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Key of the ordered recovery index (oldest first).
pub const RECOVERY_INDEX_KEY: &str = "recovery/index";

/// Prefix of recovery payload keys.
pub const RECOVERY_PAYLOAD_PREFIX: &str = "recovery/payload/";

/// Key of the crash-detection flag. `true` while a session is running.
pub const SESSION_ACTIVE_KEY: &str = "session/active";

/// Prefix of primary project copies.
pub const PROJECT_PREFIX: &str = "projects/";

const MANIFEST_SUFFIX: &str = ".manifest";

/// Which store holds a recovery payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadLocation {
    #[default]
    Primary,
    /// The payload was too large for the primary store.
    Overflow,
}

/// A saved snapshot that can be restored after a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryPoint {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub document_name: String,
    pub document_id: Uuid,
    pub layer_count: usize,
    /// Encoded payload size in bytes.
    pub size: u64,
    /// Written by the timer rather than a manual save.
    pub autosave: bool,
    #[serde(default)]
    pub location: PayloadLocation,
}

impl RecoveryPoint {
    pub fn payload_key(&self) -> String {
        payload_key(self.id)
    }
}

pub fn payload_key(id: Uuid) -> String {
    format!("{RECOVERY_PAYLOAD_PREFIX}{id}")
}

pub fn project_key(id: Uuid) -> String {
    format!("{PROJECT_PREFIX}{id}")
}

pub fn manifest_key(id: Uuid) -> String {
    format!("{PROJECT_PREFIX}{id}{MANIFEST_SUFFIX}")
}

/// Whether a key under [`PROJECT_PREFIX`] names a manifest.
pub(crate) fn is_manifest_key(key: &str) -> bool {
    key.starts_with(PROJECT_PREFIX) && key.ends_with(MANIFEST_SUFFIX)
}

/// Read the recovery index. A missing index is an empty one.
pub(crate) async fn read_index(store: &dyn KeyValueStore) -> StorageResult<Vec<RecoveryPoint>> {
    match store.get(RECOVERY_INDEX_KEY).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::Serialization(format!("recovery index: {}", e))),
        None => Ok(Vec::new()),
    }
}

/// Write the recovery index.
pub(crate) async fn write_index(
    store: &dyn KeyValueStore,
    points: &[RecoveryPoint],
) -> StorageResult<()> {
    let bytes = serde_json::to_vec(points)
        .map_err(|e| StorageError::Serialization(format!("recovery index: {}", e)))?;
    if !store.set(RECOVERY_INDEX_KEY, &bytes).await? {
        return Err(StorageError::Other(format!(
            "store declined the recovery index ({} bytes)",
            bytes.len()
        )));
    }
    Ok(())
}
