//! Content-addressed store for binary asset payloads.
//!
//! The store owns every bitmap, mask and thumbnail payload of the active
//! document together with the registry describing them. Identical payloads
//! are folded into one asset when deduplication is enabled (the default).
//! Small payloads are kept inline in the registry; larger ones go to the file
//! tier under a generated relative path and are written out separately.

mod asset;

pub use asset::{
    Asset, AssetId, AssetKind, AssetMetadata, AssetStorage, ImageFormat, StorageTier,
};
pub(crate) use asset::base64_bytes;

use crate::document::LayerId;
use crate::hash::ContentHash;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path};
use thiserror::Error;
use uuid::Uuid;

/// Default inline-storage threshold in bytes (100 KiB).
pub const DEFAULT_INLINE_THRESHOLD: usize = 100 * 1024;

/// Asset store errors.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("Asset not found: {0}")]
    NotFound(AssetId),
    #[error("Checksum mismatch for asset {asset}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        asset: AssetId,
        expected: ContentHash,
        actual: ContentHash,
    },
    #[error("Asset {asset} is hosted at {url} and cannot be read locally")]
    RemotePayload { asset: AssetId, url: String },
    #[error("Payload for asset {asset} missing at {path}")]
    MissingPayload { asset: AssetId, path: String },
    #[error("Asset {asset} has an unsafe payload path: {path}")]
    UnsafePath { asset: AssetId, path: String },
}

/// Result type for asset operations.
pub type AssetResult<T> = Result<T, AssetError>;

/// Asset store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AssetStoreConfig {
    /// Payloads up to this many bytes are stored inline.
    pub inline_threshold: usize,
    /// Reuse an existing asset when a payload with the same hash is put.
    pub dedup: bool,
}

impl Default for AssetStoreConfig {
    fn default() -> Self {
        Self {
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            dedup: true,
        }
    }
}

/// Owner of asset payloads and the asset registry.
#[derive(Debug, Default)]
pub struct AssetStore {
    config: AssetStoreConfig,
    assets: HashMap<AssetId, Asset>,
    /// File-tier payloads keyed by relative path.
    files: HashMap<String, Vec<u8>>,
    by_hash: HashMap<ContentHash, AssetId>,
}

impl AssetStore {
    /// Create an empty store with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store with the given configuration.
    pub fn with_config(config: AssetStoreConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &AssetStoreConfig {
        &self.config
    }

    /// Store a payload and return its asset id.
    ///
    /// With dedup enabled, a payload whose hash is already registered returns
    /// the existing id and nothing new is stored.
    pub fn put(
        &mut self,
        payload: &[u8],
        name: &str,
        kind: AssetKind,
        mime_type: &str,
        metadata: Option<AssetMetadata>,
    ) -> AssetId {
        let checksum = ContentHash::compute(payload);
        if self.config.dedup {
            if let Some(&existing) = self.by_hash.get(&checksum) {
                if self.assets.contains_key(&existing) {
                    log::trace!("Reusing asset {} for {} ({})", existing, name, checksum.short());
                    return existing;
                }
            }
        }

        let id = Uuid::new_v4();
        let storage = if payload.len() <= self.config.inline_threshold {
            AssetStorage::Inline {
                data: payload.to_vec(),
            }
        } else {
            let path = file_path(kind, id, mime_type);
            self.files.insert(path.clone(), payload.to_vec());
            AssetStorage::File { path }
        };

        log::debug!(
            "Stored asset {} '{}' ({} bytes, {:?})",
            id,
            name,
            payload.len(),
            storage.tier()
        );

        self.by_hash.insert(checksum.clone(), id);
        self.assets.insert(
            id,
            Asset {
                id,
                name: name.to_string(),
                kind,
                mime_type: mime_type.to_string(),
                size: payload.len() as u64,
                storage,
                checksum,
                used_by_layers: Default::default(),
                metadata,
                created_at: Utc::now(),
                last_accessed: None,
            },
        );
        id
    }

    /// Register an asset whose bytes are hosted at a URL.
    pub fn put_external_url(
        &mut self,
        url: &str,
        name: &str,
        kind: AssetKind,
        mime_type: &str,
        checksum: ContentHash,
        size: u64,
    ) -> AssetId {
        let id = Uuid::new_v4();
        self.assets.insert(
            id,
            Asset {
                id,
                name: name.to_string(),
                kind,
                mime_type: mime_type.to_string(),
                size,
                storage: AssetStorage::Url {
                    url: url.to_string(),
                },
                checksum,
                used_by_layers: Default::default(),
                metadata: None,
                created_at: Utc::now(),
                last_accessed: None,
            },
        );
        id
    }

    /// Read a payload regardless of its tier and record the access.
    pub fn get(&mut self, id: AssetId) -> AssetResult<Vec<u8>> {
        let data = self.payload(id)?.to_vec();
        if let Some(asset) = self.assets.get_mut(&id) {
            asset.last_accessed = Some(Utc::now());
        }
        Ok(data)
    }

    /// Borrow a payload without touching access metadata.
    pub fn payload(&self, id: AssetId) -> AssetResult<&[u8]> {
        let asset = self.assets.get(&id).ok_or(AssetError::NotFound(id))?;
        match &asset.storage {
            AssetStorage::Inline { data } => Ok(data),
            AssetStorage::File { path } => {
                self.files
                    .get(path)
                    .map(Vec::as_slice)
                    .ok_or_else(|| AssetError::MissingPayload {
                        asset: id,
                        path: path.clone(),
                    })
            }
            AssetStorage::Url { url } => Err(AssetError::RemotePayload {
                asset: id,
                url: url.clone(),
            }),
        }
    }

    /// Registry record of an asset.
    pub fn asset(&self, id: AssetId) -> AssetResult<&Asset> {
        self.assets.get(&id).ok_or(AssetError::NotFound(id))
    }

    pub fn contains(&self, id: AssetId) -> bool {
        self.assets.contains_key(&id)
    }

    /// Record that `layer` uses the asset. Idempotent.
    pub fn link(&mut self, id: AssetId, layer: LayerId) -> AssetResult<()> {
        let asset = self.assets.get_mut(&id).ok_or(AssetError::NotFound(id))?;
        asset.used_by_layers.insert(layer);
        Ok(())
    }

    /// Record that `layer` no longer uses the asset. Idempotent.
    pub fn unlink(&mut self, id: AssetId, layer: LayerId) -> AssetResult<()> {
        let asset = self.assets.get_mut(&id).ok_or(AssetError::NotFound(id))?;
        asset.used_by_layers.remove(&layer);
        Ok(())
    }

    /// Drop every layer link, ahead of a save that relinks what it still uses.
    pub fn clear_links(&mut self) {
        for asset in self.assets.values_mut() {
            asset.used_by_layers.clear();
        }
    }

    /// Remove an asset and its payload.
    ///
    /// Returns false while any layer still uses it, or if it does not exist.
    pub fn remove(&mut self, id: AssetId) -> bool {
        match self.assets.get(&id) {
            None => false,
            Some(asset) if asset.is_referenced() => {
                log::debug!(
                    "Refusing to remove asset {} still used by {} layer(s)",
                    id,
                    asset.used_by_layers.len()
                );
                false
            }
            Some(_) => {
                if let Some(asset) = self.assets.remove(&id) {
                    if let AssetStorage::File { path } = &asset.storage {
                        self.files.remove(path);
                    }
                    if self.by_hash.get(&asset.checksum) == Some(&id) {
                        self.by_hash.remove(&asset.checksum);
                    }
                }
                true
            }
        }
    }

    /// Remove every unreferenced asset not in `keep`. Returns how many went.
    pub fn retain(&mut self, keep: &HashSet<AssetId>) -> usize {
        let candidates: Vec<AssetId> = self
            .assets
            .keys()
            .filter(|id| !keep.contains(id))
            .copied()
            .collect();
        let removed = candidates.into_iter().filter(|&id| self.remove(id)).count();
        if removed > 0 {
            log::debug!("Pruned {} unused asset(s)", removed);
        }
        removed
    }

    /// Check a payload against an asset's declared checksum.
    pub fn verify(&self, id: AssetId, payload: &[u8]) -> AssetResult<()> {
        let asset = self.asset(id)?;
        let actual = ContentHash::compute(payload);
        if actual != asset.checksum {
            return Err(AssetError::ChecksumMismatch {
                asset: id,
                expected: asset.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// File-tier payloads keyed by relative path, for multi-file archives.
    pub fn export_all(&self) -> BTreeMap<String, Vec<u8>> {
        self.assets
            .values()
            .filter_map(|asset| match &asset.storage {
                AssetStorage::File { path } => self
                    .files
                    .get(path)
                    .map(|data| (path.clone(), data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Snapshot of the registry, ordered by id.
    pub fn registry(&self) -> BTreeMap<AssetId, Asset> {
        self.assets
            .iter()
            .map(|(id, asset)| (*id, asset.clone()))
            .collect()
    }

    /// Rebuild a store from a saved registry and its file-tier payloads.
    ///
    /// Every locally available payload is verified against its checksum.
    pub fn from_registry(
        config: AssetStoreConfig,
        registry: BTreeMap<AssetId, Asset>,
        mut files: BTreeMap<String, Vec<u8>>,
    ) -> AssetResult<Self> {
        let mut store = Self::with_config(config);
        for (id, asset) in registry {
            match &asset.storage {
                AssetStorage::Inline { data } => check(id, &asset.checksum, data)?,
                AssetStorage::File { path } => {
                    if !is_safe_relative_path(path) {
                        return Err(AssetError::UnsafePath {
                            asset: id,
                            path: path.clone(),
                        });
                    }
                    let data = files.remove(path).ok_or_else(|| AssetError::MissingPayload {
                        asset: id,
                        path: path.clone(),
                    })?;
                    check(id, &asset.checksum, &data)?;
                    store.files.insert(path.clone(), data);
                }
                AssetStorage::Url { .. } => {
                    store.assets.insert(id, asset);
                    continue;
                }
            }
            store.by_hash.insert(asset.checksum.clone(), id);
            store.assets.insert(id, asset);
        }
        if !files.is_empty() {
            log::warn!("Ignoring {} attachment(s) with no registry entry", files.len());
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Sum of all payload sizes in bytes.
    pub fn total_size(&self) -> u64 {
        self.assets.values().map(|asset| asset.size).sum()
    }

    /// Flip a byte of a stored payload without updating its checksum.
    #[cfg(test)]
    pub(crate) fn corrupt(&mut self, id: AssetId) {
        let Some(asset) = self.assets.get_mut(&id) else {
            return;
        };
        let data = match &mut asset.storage {
            AssetStorage::Inline { data } => Some(data),
            AssetStorage::File { path } => self.files.get_mut(path.as_str()),
            AssetStorage::Url { .. } => None,
        };
        if let Some(byte) = data.and_then(|data| data.first_mut()) {
            *byte ^= 0xFF;
        }
    }
}

fn check(id: AssetId, expected: &ContentHash, data: &[u8]) -> AssetResult<()> {
    let actual = ContentHash::compute(data);
    if &actual != expected {
        return Err(AssetError::ChecksumMismatch {
            asset: id,
            expected: expected.clone(),
            actual,
        });
    }
    Ok(())
}

/// Whether `path` stays inside the directory it is joined onto: relative,
/// non-empty, with no `..`, root or drive components.
pub fn is_safe_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.contains(['\\', ':'])
        && Path::new(path)
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// Relative path of a file-tier payload.
fn file_path(kind: AssetKind, id: AssetId, mime_type: &str) -> String {
    let ext = ImageFormat::from_mime_type(mime_type)
        .map(|format| format.extension())
        .unwrap_or("bin");
    format!("assets/{}/{}.{}", kind.dir_name(), id, ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_bytes(store: &mut AssetStore, len: usize, fill: u8) -> AssetId {
        store.put(&vec![fill; len], "canvas", AssetKind::Bitmap, "image/png", None)
    }

    #[test]
    fn test_inline_threshold_boundary() {
        let mut store = AssetStore::new();
        let at = put_bytes(&mut store, DEFAULT_INLINE_THRESHOLD, 1);
        let over = put_bytes(&mut store, DEFAULT_INLINE_THRESHOLD + 1, 2);

        assert_eq!(store.asset(at).unwrap().tier(), StorageTier::Inline);
        assert_eq!(store.asset(over).unwrap().tier(), StorageTier::File);
    }

    #[test]
    fn test_kib_examples() {
        let mut store = AssetStore::new();
        let small = put_bytes(&mut store, 99 * 1024, 1);
        let large = put_bytes(&mut store, 101 * 1024, 2);

        assert_eq!(store.asset(small).unwrap().tier(), StorageTier::Inline);
        let asset = store.asset(large).unwrap();
        assert_eq!(asset.tier(), StorageTier::File);
        assert_eq!(asset.size, 101 * 1024);
        match &asset.storage {
            AssetStorage::File { path } => {
                assert!(path.starts_with("assets/bitmaps/"));
                assert!(path.ends_with(".png"));
            }
            other => panic!("unexpected storage {other:?}"),
        }
    }

    #[test]
    fn test_get_is_tier_transparent() {
        let mut store = AssetStore::new();
        let small = put_bytes(&mut store, 10, 7);
        let large = put_bytes(&mut store, DEFAULT_INLINE_THRESHOLD * 2, 9);

        assert_eq!(store.get(small).unwrap(), vec![7; 10]);
        assert_eq!(store.get(large).unwrap(), vec![9; DEFAULT_INLINE_THRESHOLD * 2]);
        assert!(store.asset(large).unwrap().last_accessed.is_some());
    }

    #[test]
    fn test_dedup_reuses_identical_payloads() {
        let mut store = AssetStore::new();
        let a = put_bytes(&mut store, 64, 3);
        let b = put_bytes(&mut store, 64, 3);

        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_dedup_can_be_disabled() {
        let mut store = AssetStore::with_config(AssetStoreConfig {
            dedup: false,
            ..Default::default()
        });
        let a = put_bytes(&mut store, 64, 3);
        let b = put_bytes(&mut store, 64, 3);

        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove_requires_unlink() {
        let mut store = AssetStore::new();
        let id = put_bytes(&mut store, 16, 1);
        let layer_a = Uuid::new_v4();
        let layer_b = Uuid::new_v4();

        store.link(id, layer_a).unwrap();
        store.link(id, layer_b).unwrap();
        store.link(id, layer_b).unwrap();
        assert_eq!(store.asset(id).unwrap().used_by_layers.len(), 2);

        assert!(!store.remove(id));
        store.unlink(id, layer_a).unwrap();
        assert!(!store.remove(id));
        store.unlink(id, layer_b).unwrap();
        store.unlink(id, layer_b).unwrap();

        assert!(store.remove(id));
        assert!(matches!(store.get(id), Err(AssetError::NotFound(_))));
    }

    #[test]
    fn test_unknown_ids() {
        let mut store = AssetStore::new();
        let ghost = Uuid::new_v4();

        assert!(matches!(store.get(ghost), Err(AssetError::NotFound(_))));
        assert!(matches!(store.link(ghost, Uuid::new_v4()), Err(AssetError::NotFound(_))));
        assert!(!store.remove(ghost));
    }

    #[test]
    fn test_export_all_lists_file_tier_only() {
        let mut store = AssetStore::new();
        put_bytes(&mut store, 10, 1);
        let large = put_bytes(&mut store, DEFAULT_INLINE_THRESHOLD + 10, 2);

        let files = store.export_all();
        assert_eq!(files.len(), 1);
        let (path, data) = files.iter().next().unwrap();
        assert!(path.contains(&large.to_string()));
        assert_eq!(data.len(), DEFAULT_INLINE_THRESHOLD + 10);
    }

    #[test]
    fn test_from_registry_verifies_checksums() {
        let mut store = AssetStore::new();
        let id = put_bytes(&mut store, DEFAULT_INLINE_THRESHOLD + 1, 4);
        let mut files = store.export_all();
        files.values_mut().for_each(|data| data[0] ^= 0xFF);

        let result = AssetStore::from_registry(AssetStoreConfig::default(), store.registry(), files);
        assert!(matches!(result, Err(AssetError::ChecksumMismatch { asset, .. }) if asset == id));
    }

    #[test]
    fn test_from_registry_requires_file_payloads() {
        let mut store = AssetStore::new();
        put_bytes(&mut store, DEFAULT_INLINE_THRESHOLD + 1, 4);

        let result =
            AssetStore::from_registry(AssetStoreConfig::default(), store.registry(), BTreeMap::new());
        assert!(matches!(result, Err(AssetError::MissingPayload { .. })));
    }

    #[test]
    fn test_from_registry_rejects_escaping_paths() {
        let mut store = AssetStore::new();
        let id = put_bytes(&mut store, DEFAULT_INLINE_THRESHOLD + 1, 4);
        let data = store.get(id).unwrap();
        let escape = "../../../tmp/evil.bin".to_string();

        let mut registry = store.registry();
        registry.get_mut(&id).unwrap().storage = AssetStorage::File {
            path: escape.clone(),
        };
        let files: BTreeMap<_, _> = [(escape, data)].into_iter().collect();

        assert!(matches!(
            AssetStore::from_registry(AssetStoreConfig::default(), registry, files),
            Err(AssetError::UnsafePath { asset, .. }) if asset == id
        ));
    }

    #[test]
    fn test_safe_relative_paths() {
        assert!(is_safe_relative_path("assets/bitmap/a.png"));
        assert!(is_safe_relative_path("project.atlr"));
        for path in ["", "/etc/passwd", "../x", "assets/../../x", "./x", "C:\\x", "c:x", "a\\..\\b"] {
            assert!(!is_safe_relative_path(path), "{path}");
        }
    }

    #[test]
    fn test_url_assets_are_not_dedup_targets() {
        let mut store = AssetStore::new();
        let remote = store.put_external_url(
            "https://cdn.example.com/tile.png",
            "tile",
            AssetKind::Image,
            "image/png",
            ContentHash::compute(b"tile"),
            4,
        );
        let mut loaded =
            AssetStore::from_registry(AssetStoreConfig::default(), store.registry(), BTreeMap::new())
                .unwrap();

        let local = loaded.put(b"tile", "tile", AssetKind::Image, "image/png", None);
        assert_ne!(local, remote);
        assert_eq!(loaded.get(local).unwrap(), b"tile".to_vec());
    }

    #[test]
    fn test_verify_declared_checksum() {
        let mut store = AssetStore::new();
        let id = put_bytes(&mut store, 32, 5);

        assert!(store.verify(id, &[5; 32]).is_ok());
        assert!(matches!(
            store.verify(id, &[6; 32]),
            Err(AssetError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_url_tier_is_not_readable_locally() {
        let mut store = AssetStore::new();
        let id = store.put_external_url(
            "https://cdn.example.com/tile.png",
            "tile",
            AssetKind::Image,
            "image/png",
            ContentHash::compute(b"tile"),
            4,
        );

        assert_eq!(store.asset(id).unwrap().tier(), StorageTier::Url);
        assert!(matches!(store.get(id), Err(AssetError::RemotePayload { .. })));
    }

    #[test]
    fn test_retain_prunes_unreferenced() {
        let mut store = AssetStore::new();
        let kept = put_bytes(&mut store, 8, 1);
        let linked = put_bytes(&mut store, 8, 2);
        let dropped = put_bytes(&mut store, 8, 3);
        store.link(linked, Uuid::new_v4()).unwrap();

        let keep: HashSet<_> = [kept].into_iter().collect();
        assert_eq!(store.retain(&keep), 1);
        assert!(store.contains(kept));
        assert!(store.contains(linked));
        assert!(!store.contains(dropped));
    }
}
