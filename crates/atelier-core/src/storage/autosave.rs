//! Crash-safe autosave.
//!
//! The host loop calls [`AutoSaveManager::tick`]; once the interval has
//! elapsed and the document is dirty, the manager saves it through the
//! project manager and appends a recovery point to a ring kept in storage.
//! A session flag in storage tells the next start whether the previous
//! session ended cleanly.

use super::recovery::{
    PROJECT_PREFIX, PayloadLocation, RecoveryPoint, SESSION_ACTIVE_KEY, is_manifest_key,
    manifest_key, payload_key, project_key, read_index, write_index,
};
use super::{KeyValueStore, StorageError};
use crate::document::{Document, DocumentChange, DocumentObserver};
use crate::project::{Manifest, ProjectError, ProjectFileManager};
use crate::serializer::SkippedLayer;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Default auto-save interval in seconds.
pub const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 30;

/// Default number of recovery points kept.
pub const DEFAULT_MAX_BACKUPS: usize = 5;

/// Autosave errors.
#[derive(Debug, Error)]
pub enum AutoSaveError {
    #[error("A save is in progress")]
    Busy,
    #[error("No store accepted {size} bytes for '{key}'")]
    CapacityExceeded { key: String, size: usize },
    #[error("No stored payload for '{0}'")]
    MissingPayload(String),
    #[error("Autosave state lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for autosave operations.
pub type AutoSaveResult<T> = Result<T, AutoSaveError>;

/// Autosave settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoSaveConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Recovery points kept before the oldest are pruned.
    pub max_backups: usize,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_AUTOSAVE_INTERVAL_SECS,
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }
}

/// What started a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTrigger {
    /// The timer.
    Auto,
    /// The user. Also writes the primary project copy.
    Manual,
}

/// Why a save did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    /// The interval has not elapsed yet.
    NotDue,
    /// Another save holds the saving flag.
    InProgress,
    /// Nothing changed since the last save.
    Clean,
    /// Less than half the interval since the last save.
    TooSoon,
}

/// Result of a save attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved {
        point: RecoveryPoint,
        skipped_layers: Vec<SkippedLayer>,
    },
    Skipped(SkipReason),
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved { .. })
    }
}

/// Change counter shared between a document and the autosave manager.
///
/// Register it on a document with [`Document::subscribe`]; every edit bumps
/// the generation.
#[derive(Debug, Clone, Default)]
pub struct DirtyFlag(Arc<AtomicU64>);

impl DirtyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    pub fn generation(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

impl DocumentObserver for DirtyFlag {
    fn document_changed(&self, _change: &DocumentChange) {
        self.mark();
    }
}

/// Holds the saving flag; clears it when dropped.
#[derive(Debug)]
pub struct SaveGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SaveGuard<'a> {
    /// Take the flag, or `None` if it is already held.
    pub fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for SaveGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug)]
struct SaveState {
    last_save: Option<Instant>,
    /// Dirty generation captured by the last successful save.
    clean_generation: u64,
}

/// Manages automatic document persistence and crash recovery.
pub struct AutoSaveManager<S: KeyValueStore> {
    /// Primary storage backend.
    storage: Arc<S>,
    /// Receives payloads the primary store declines for size.
    overflow: Option<Arc<dyn KeyValueStore>>,
    project: Mutex<ProjectFileManager>,
    config: AutoSaveConfig,
    interval: Duration,
    started: Instant,
    saving: AtomicBool,
    dirty: DirtyFlag,
    state: Mutex<SaveState>,
}

impl<S: KeyValueStore> AutoSaveManager<S> {
    /// Create a manager over `storage` saving through `project`.
    pub fn new(storage: Arc<S>, project: ProjectFileManager, config: AutoSaveConfig) -> Self {
        Self {
            storage,
            overflow: None,
            project: Mutex::new(project),
            interval: Duration::from_secs(config.interval_secs),
            config,
            started: Instant::now(),
            saving: AtomicBool::new(false),
            dirty: DirtyFlag::new(),
            state: Mutex::new(SaveState {
                last_save: None,
                clean_generation: 0,
            }),
        }
    }

    /// Route payloads the primary store declines to `overflow`.
    pub fn with_overflow(mut self, overflow: Arc<dyn KeyValueStore>) -> Self {
        self.overflow = Some(overflow);
        self
    }

    /// Set the auto-save interval.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Get the auto-save interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn config(&self) -> &AutoSaveConfig {
        &self.config
    }

    /// Handle to subscribe on the edited document.
    pub fn dirty_flag(&self) -> DirtyFlag {
        self.dirty.clone()
    }

    /// Mark the document as having unsaved changes.
    pub fn mark_dirty(&self) {
        self.dirty.mark();
    }

    /// Check if the document has unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.state()
            .map(|state| state.clean_generation != self.dirty.generation())
            .unwrap_or(true)
    }

    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::Acquire)
    }

    /// Time of the last successful save in this session.
    pub fn last_save(&self) -> Option<Instant> {
        self.state().ok().and_then(|state| state.last_save)
    }

    /// Get a reference to the storage backend.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    fn state(&self) -> AutoSaveResult<MutexGuard<'_, SaveState>> {
        self.state.lock().map_err(|_| AutoSaveError::Poisoned)
    }

    fn project(&self) -> AutoSaveResult<MutexGuard<'_, ProjectFileManager>> {
        self.project.lock().map_err(|_| AutoSaveError::Poisoned)
    }

    /// Timer entry point. Saves once the interval has elapsed.
    pub async fn tick(&self, document: &Document) -> AutoSaveResult<SaveOutcome> {
        if !self.config.enabled {
            return Ok(SaveOutcome::Skipped(SkipReason::Disabled));
        }
        let since = self.state()?.last_save.unwrap_or(self.started);
        if since.elapsed() < self.interval {
            return Ok(SaveOutcome::Skipped(SkipReason::NotDue));
        }
        self.trigger(document, SaveTrigger::Auto).await
    }

    /// Save now, subject to the in-progress, clean and too-soon guards.
    pub async fn trigger(
        &self,
        document: &Document,
        trigger: SaveTrigger,
    ) -> AutoSaveResult<SaveOutcome> {
        let Some(_guard) = SaveGuard::try_acquire(&self.saving) else {
            log::debug!("Save requested while another save runs; ignoring");
            return Ok(SaveOutcome::Skipped(SkipReason::InProgress));
        };

        let generation = self.dirty.generation();
        {
            let state = self.state()?;
            if generation == state.clean_generation {
                return Ok(SaveOutcome::Skipped(SkipReason::Clean));
            }
            if let Some(last) = state.last_save {
                if last.elapsed() < self.interval / 2 {
                    return Ok(SaveOutcome::Skipped(SkipReason::TooSoon));
                }
            }
        }

        let (report, bytes, manifest) = {
            let mut project = self.project()?;
            let (report, bytes) = project.save_encoded(document)?;
            let manifest = project.manifest(&report.document);
            (report, bytes, manifest)
        };

        let point_id = Uuid::new_v4();
        let key = payload_key(point_id);
        let location = self.write_payload(&key, &bytes).await?;
        let point = RecoveryPoint {
            id: point_id,
            timestamp: Utc::now(),
            document_name: document.name().to_string(),
            document_id: document.id,
            layer_count: report.document.layer_count(),
            size: bytes.len() as u64,
            autosave: trigger == SaveTrigger::Auto,
            location,
        };

        let evicted = match self.commit_point(&point, trigger, &bytes, &manifest).await {
            Ok(evicted) => evicted,
            Err(err) => {
                // Nothing indexes the payload yet.
                if let Some(store) = self.store_for(location) {
                    if let Err(cleanup) = store.remove(&key).await {
                        log::warn!("Could not discard payload '{}': {}", key, cleanup);
                    }
                }
                return Err(err);
            }
        };
        self.discard_points(evicted).await;

        {
            let mut state = self.state()?;
            state.last_save = Some(Instant::now());
            state.clean_generation = generation;
        }
        if self.dirty.generation() != generation {
            log::debug!("Document changed during save; staying dirty");
        }

        log::info!(
            "{} '{}' ({} bytes, {:?})",
            match trigger {
                SaveTrigger::Auto => "Autosaved",
                SaveTrigger::Manual => "Saved",
            },
            point.document_name,
            point.size,
            location
        );
        Ok(SaveOutcome::Saved {
            point,
            skipped_layers: report.skipped,
        })
    }

    /// Write the manual-save copies, then index the point.
    ///
    /// Returns the points evicted from the ring.
    async fn commit_point(
        &self,
        point: &RecoveryPoint,
        trigger: SaveTrigger,
        bytes: &[u8],
        manifest: &Manifest,
    ) -> AutoSaveResult<Vec<RecoveryPoint>> {
        if trigger == SaveTrigger::Manual {
            self.write_payload(&project_key(point.document_id), bytes).await?;
            let manifest = serde_json::to_vec(manifest)
                .map_err(|e| StorageError::Serialization(format!("manifest: {}", e)))?;
            self.write_payload(&manifest_key(point.document_id), &manifest).await?;
        }
        self.append_point(point.clone()).await
    }

    /// Write to primary storage, falling back to the overflow store.
    async fn write_payload(&self, key: &str, bytes: &[u8]) -> AutoSaveResult<PayloadLocation> {
        if self.storage.set(key, bytes).await? {
            return Ok(PayloadLocation::Primary);
        }
        if let Some(overflow) = &self.overflow {
            if overflow.set(key, bytes).await? {
                // Reads try the primary store first; a stale copy there would win.
                self.storage.remove(key).await?;
                log::info!("Stored {} bytes for '{}' in overflow storage", bytes.len(), key);
                return Ok(PayloadLocation::Overflow);
            }
        }
        log::warn!("No store accepted {} bytes for '{}'", bytes.len(), key);
        Err(AutoSaveError::CapacityExceeded {
            key: key.to_string(),
            size: bytes.len(),
        })
    }

    fn store_for(&self, location: PayloadLocation) -> Option<&dyn KeyValueStore> {
        match location {
            PayloadLocation::Primary => Some(self.storage.as_ref() as &dyn KeyValueStore),
            PayloadLocation::Overflow => self.overflow.as_deref(),
        }
    }

    /// Append a point to the index, trimming the ring to `max_backups`.
    ///
    /// Returns the evicted points; their payloads are still in storage.
    async fn append_point(&self, point: RecoveryPoint) -> AutoSaveResult<Vec<RecoveryPoint>> {
        let mut points = read_index(self.storage.as_ref()).await?;
        points.push(point);

        let excess = points.len().saturating_sub(self.config.max_backups.max(1));
        let evicted: Vec<RecoveryPoint> = points.drain(..excess).collect();
        write_index(self.storage.as_ref(), &points).await?;
        Ok(evicted)
    }

    /// Remove the payloads of evicted points.
    async fn discard_points(&self, evicted: Vec<RecoveryPoint>) {
        for old in evicted {
            if let Some(store) = self.store_for(old.location) {
                if let Err(err) = store.remove(&old.payload_key()).await {
                    log::warn!("Could not remove payload of recovery point {}: {}", old.id, err);
                    continue;
                }
            }
            log::debug!("Pruned recovery point {} from {}", old.id, old.timestamp);
        }
    }

    /// Recovery points, oldest first.
    pub async fn recovery_points(&self) -> AutoSaveResult<Vec<RecoveryPoint>> {
        Ok(read_index(self.storage.as_ref()).await?)
    }

    async fn read_point_payload(&self, point: &RecoveryPoint) -> AutoSaveResult<Option<Vec<u8>>> {
        match self.store_for(point.location) {
            Some(store) => Ok(store.get(&point.payload_key()).await?),
            None => Ok(None),
        }
    }

    /// Detect an unclean previous exit.
    ///
    /// Returns the latest recovery point if the previous session never
    /// called [`mark_clean_exit`](Self::mark_clean_exit) and its payload is
    /// intact. Marks the current session as running either way.
    pub async fn check_for_crash_recovery(&self) -> AutoSaveResult<Option<RecoveryPoint>> {
        let was_active = self
            .storage
            .get(SESSION_ACTIVE_KEY)
            .await?
            .is_some_and(|flag| flag == b"true");

        let mut candidate = None;
        if was_active {
            if let Some(latest) = read_index(self.storage.as_ref()).await?.pop() {
                match self.read_point_payload(&latest).await? {
                    Some(payload) if !payload.is_empty() => {
                        log::warn!(
                            "Previous session ended unexpectedly; recovery point {} from {} is available",
                            latest.id,
                            latest.timestamp
                        );
                        candidate = Some(latest);
                    }
                    _ => log::warn!("Latest recovery point {} has no payload", latest.id),
                }
            }
        }

        self.storage.set(SESSION_ACTIVE_KEY, b"true").await?;
        Ok(candidate)
    }

    /// Record that the session is ending normally.
    pub async fn mark_clean_exit(&self) -> AutoSaveResult<()> {
        self.storage.set(SESSION_ACTIVE_KEY, b"false").await?;
        Ok(())
    }

    /// Load the document saved in a recovery point.
    pub async fn restore(&self, point: &RecoveryPoint) -> AutoSaveResult<Document> {
        let _guard = SaveGuard::try_acquire(&self.saving).ok_or(AutoSaveError::Busy)?;
        let payload = self
            .read_point_payload(point)
            .await?
            .ok_or_else(|| AutoSaveError::MissingPayload(point.payload_key()))?;
        let document = self.load_bytes(&payload)?;
        log::info!("Restored '{}' from recovery point {}", document.name(), point.id);
        Ok(document)
    }

    /// Load the primary copy of a manually saved project.
    pub async fn load_project(&self, id: Uuid) -> AutoSaveResult<Document> {
        let _guard = SaveGuard::try_acquire(&self.saving).ok_or(AutoSaveError::Busy)?;
        let key = project_key(id);
        let mut payload = self.storage.get(&key).await?;
        if payload.is_none() {
            if let Some(overflow) = &self.overflow {
                payload = overflow.get(&key).await?;
            }
        }
        let payload = payload.ok_or(AutoSaveError::MissingPayload(key))?;
        self.load_bytes(&payload)
    }

    /// Manifests of manually saved projects, from both stores.
    pub async fn list_projects(&self) -> AutoSaveResult<Vec<Manifest>> {
        let stores = [
            self.store_for(PayloadLocation::Primary),
            self.store_for(PayloadLocation::Overflow),
        ];
        let mut seen = HashSet::new();
        let mut manifests = Vec::new();
        for store in stores.into_iter().flatten() {
            for key in store.list_keys(PROJECT_PREFIX).await? {
                if !is_manifest_key(&key) || !seen.insert(key.clone()) {
                    continue;
                }
                let Some(bytes) = store.get(&key).await? else {
                    continue;
                };
                match serde_json::from_slice::<Manifest>(&bytes) {
                    Ok(manifest) => manifests.push(manifest),
                    Err(e) => log::warn!("Skipping unreadable manifest '{}': {}", key, e),
                }
            }
        }
        manifests.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
        Ok(manifests)
    }

    /// Decode and load a payload; the loaded state counts as saved.
    fn load_bytes(&self, payload: &[u8]) -> AutoSaveResult<Document> {
        let document = self.project()?.load_bytes(payload)?;
        let mut state = self.state()?;
        state.clean_generation = self.dirty.generation();
        state.last_save = Some(Instant::now());
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Layer, LayerContent};
    use crate::raster::{RawRasterizer, Surface};
    use crate::storage::{BoxFuture, MemoryStore, RECOVERY_PAYLOAD_PREFIX, StorageResult};
    use pollster::block_on;

    fn manager_with(storage: Arc<MemoryStore>, config: AutoSaveConfig) -> AutoSaveManager<MemoryStore> {
        let project = ProjectFileManager::new(Arc::new(RawRasterizer));
        AutoSaveManager::new(storage, project, config)
    }

    fn manager() -> AutoSaveManager<MemoryStore> {
        manager_with(Arc::new(MemoryStore::new()), AutoSaveConfig::default())
    }

    fn eager(config: AutoSaveConfig) -> AutoSaveManager<MemoryStore> {
        let mut manager = manager_with(Arc::new(MemoryStore::new()), config);
        manager.set_interval(Duration::ZERO);
        manager
    }

    /// A document wired to the manager's dirty flag.
    fn document<S: KeyValueStore>(manager: &AutoSaveManager<S>) -> Document {
        let mut doc = Document::with_canvas("Poster", 32, 32);
        doc.subscribe(Arc::new(manager.dirty_flag()));
        doc.add_layer(Layer::new(
            "Ink",
            LayerContent::paint(Surface::filled(8, 8, [30, 30, 30, 255])),
        ));
        doc
    }

    fn edit(doc: &mut Document) {
        let n = doc.layer_count() as u8;
        doc.add_layer(Layer::new(
            format!("Layer {n}"),
            LayerContent::paint(Surface::filled(4, 4, [n, n, n, 255])),
        ));
    }

    #[test]
    fn test_clean_document_is_not_saved() {
        let manager = manager();
        let doc = Document::new();

        assert_eq!(
            block_on(manager.trigger(&doc, SaveTrigger::Auto)).unwrap(),
            SaveOutcome::Skipped(SkipReason::Clean)
        );
    }

    #[test]
    fn test_save_writes_recovery_point() {
        let manager = manager();
        let doc = document(&manager);
        assert!(manager.is_dirty());

        let outcome = block_on(manager.trigger(&doc, SaveTrigger::Auto)).unwrap();
        let SaveOutcome::Saved { point, skipped_layers } = outcome else {
            panic!("expected a save, got {outcome:?}");
        };

        assert!(skipped_layers.is_empty());
        assert!(point.autosave);
        assert_eq!(point.layer_count, 1);
        assert_eq!(point.location, PayloadLocation::Primary);
        assert!(!manager.is_dirty());
        assert!(!manager.is_saving());

        let points = block_on(manager.recovery_points()).unwrap();
        assert_eq!(points, vec![point.clone()]);
        let payload = block_on(manager.storage().get(&point.payload_key())).unwrap().unwrap();
        assert_eq!(payload.len() as u64, point.size);
    }

    #[test]
    fn test_second_immediate_save_is_too_soon() {
        let manager = manager();
        let mut doc = document(&manager);

        assert!(block_on(manager.trigger(&doc, SaveTrigger::Auto)).unwrap().is_saved());
        edit(&mut doc);

        assert_eq!(
            block_on(manager.trigger(&doc, SaveTrigger::Manual)).unwrap(),
            SaveOutcome::Skipped(SkipReason::TooSoon)
        );
        assert!(manager.is_dirty());
    }

    #[test]
    fn test_trigger_during_save_is_a_no_op() {
        let manager = manager();
        let doc = document(&manager);

        let guard = SaveGuard::try_acquire(&manager.saving).unwrap();
        assert!(manager.is_saving());
        assert_eq!(
            block_on(manager.trigger(&doc, SaveTrigger::Auto)).unwrap(),
            SaveOutcome::Skipped(SkipReason::InProgress)
        );
        assert!(manager.is_dirty());
        assert!(block_on(manager.recovery_points()).unwrap().is_empty());

        drop(guard);
        assert!(block_on(manager.trigger(&doc, SaveTrigger::Auto)).unwrap().is_saved());
    }

    #[test]
    fn test_tick_waits_for_interval() {
        let manager = manager();
        let doc = document(&manager);
        assert_eq!(
            block_on(manager.tick(&doc)).unwrap(),
            SaveOutcome::Skipped(SkipReason::NotDue)
        );

        let eager = eager(AutoSaveConfig::default());
        let doc = document(&eager);
        assert!(block_on(eager.tick(&doc)).unwrap().is_saved());
    }

    #[test]
    fn test_disabled_tick() {
        let manager = eager(AutoSaveConfig {
            enabled: false,
            ..Default::default()
        });
        let doc = document(&manager);
        assert_eq!(
            block_on(manager.tick(&doc)).unwrap(),
            SaveOutcome::Skipped(SkipReason::Disabled)
        );
    }

    #[test]
    fn test_ring_is_pruned_oldest_first() {
        let manager = eager(AutoSaveConfig {
            max_backups: 2,
            ..Default::default()
        });
        let mut doc = document(&manager);

        let mut saved = Vec::new();
        for _ in 0..4 {
            edit(&mut doc);
            match block_on(manager.trigger(&doc, SaveTrigger::Auto)).unwrap() {
                SaveOutcome::Saved { point, .. } => saved.push(point),
                other => panic!("unexpected {other:?}"),
            }
        }

        let points = block_on(manager.recovery_points()).unwrap();
        assert_eq!(points, saved[2..].to_vec());
        let payloads = block_on(manager.storage().list_keys(RECOVERY_PAYLOAD_PREFIX)).unwrap();
        assert_eq!(payloads.len(), 2);
        assert!(block_on(manager.storage().get(&saved[0].payload_key())).unwrap().is_none());
    }

    /// Pixels that do not compress.
    fn noise(width: u32, height: u32) -> Surface {
        let mut state = 0x2545_f491u32;
        let pixels = (0..width * height * 4)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        Surface::from_pixels(width, height, pixels).unwrap()
    }

    #[test]
    fn test_oversized_payload_goes_to_overflow() {
        let primary = Arc::new(MemoryStore::with_max_value_size(2048));
        let overflow = Arc::new(MemoryStore::new());
        let manager = manager_with(primary.clone(), AutoSaveConfig::default())
            .with_overflow(overflow.clone());
        let mut doc = document(&manager);
        doc.add_layer(Layer::new("Grain", LayerContent::paint(noise(32, 32))));

        let SaveOutcome::Saved { point, .. } =
            block_on(manager.trigger(&doc, SaveTrigger::Auto)).unwrap()
        else {
            panic!("expected a save");
        };
        assert_eq!(point.location, PayloadLocation::Overflow);
        assert!(block_on(overflow.get(&point.payload_key())).unwrap().is_some());
        assert!(block_on(primary.get(&point.payload_key())).unwrap().is_none());

        let restored = block_on(manager.restore(&point)).unwrap();
        assert!(restored.layer_equivalent(&doc));
    }

    #[test]
    fn test_capacity_exceeded_without_overflow() {
        let primary = Arc::new(MemoryStore::with_max_value_size(64));
        let manager = manager_with(primary, AutoSaveConfig::default());
        let doc = document(&manager);

        assert!(matches!(
            block_on(manager.trigger(&doc, SaveTrigger::Auto)),
            Err(AutoSaveError::CapacityExceeded { .. })
        ));
        assert!(manager.is_dirty());
        assert!(!manager.is_saving());
    }

    #[test]
    fn test_crash_recovery_cycle() {
        let storage = Arc::new(MemoryStore::new());

        let first = manager_with(storage.clone(), AutoSaveConfig::default());
        assert_eq!(block_on(first.check_for_crash_recovery()).unwrap(), None);
        let doc = document(&first);
        let SaveOutcome::Saved { point, .. } =
            block_on(first.trigger(&doc, SaveTrigger::Auto)).unwrap()
        else {
            panic!("expected a save");
        };
        // no clean exit: simulated crash

        let second = manager_with(storage.clone(), AutoSaveConfig::default());
        let found = block_on(second.check_for_crash_recovery()).unwrap();
        assert_eq!(found.as_ref(), Some(&point));

        let restored = block_on(second.restore(&point)).unwrap();
        assert!(restored.layer_equivalent(&doc));
        assert_eq!(restored.name(), "Poster");

        block_on(second.mark_clean_exit()).unwrap();
        let third = manager_with(storage, AutoSaveConfig::default());
        assert_eq!(block_on(third.check_for_crash_recovery()).unwrap(), None);
    }

    #[test]
    fn test_active_flag_without_points_offers_nothing() {
        let storage = Arc::new(MemoryStore::new());
        block_on(storage.set(SESSION_ACTIVE_KEY, b"true")).unwrap();

        let manager = manager_with(storage.clone(), AutoSaveConfig::default());
        assert_eq!(block_on(manager.check_for_crash_recovery()).unwrap(), None);
        assert_eq!(
            block_on(storage.get(SESSION_ACTIVE_KEY)).unwrap(),
            Some(b"true".to_vec())
        );

        block_on(manager.mark_clean_exit()).unwrap();
        assert_eq!(
            block_on(storage.get(SESSION_ACTIVE_KEY)).unwrap(),
            Some(b"false".to_vec())
        );
    }

    #[test]
    fn test_crash_with_missing_payload_offers_nothing() {
        let storage = Arc::new(MemoryStore::new());
        let first = manager_with(storage.clone(), AutoSaveConfig::default());
        block_on(first.check_for_crash_recovery()).unwrap();
        let doc = document(&first);
        let SaveOutcome::Saved { point, .. } =
            block_on(first.trigger(&doc, SaveTrigger::Auto)).unwrap()
        else {
            panic!("expected a save");
        };
        block_on(storage.set(&point.payload_key(), b"")).unwrap();

        let second = manager_with(storage, AutoSaveConfig::default());
        assert_eq!(block_on(second.check_for_crash_recovery()).unwrap(), None);
    }

    #[test]
    fn test_restore_while_saving_is_busy() {
        let manager = manager();
        let doc = document(&manager);
        let SaveOutcome::Saved { point, .. } =
            block_on(manager.trigger(&doc, SaveTrigger::Auto)).unwrap()
        else {
            panic!("expected a save");
        };

        let _guard = SaveGuard::try_acquire(&manager.saving).unwrap();
        assert!(matches!(
            block_on(manager.restore(&point)),
            Err(AutoSaveError::Busy)
        ));
    }

    #[test]
    fn test_manual_save_writes_project_and_manifest() {
        let manager = manager();
        let doc = document(&manager);

        let SaveOutcome::Saved { point, .. } =
            block_on(manager.trigger(&doc, SaveTrigger::Manual)).unwrap()
        else {
            panic!("expected a save");
        };
        assert!(!point.autosave);

        let projects = block_on(manager.list_projects()).unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id, doc.id);
        assert_eq!(projects[0].name, "Poster");
        assert_eq!(projects[0].layer_count, 1);

        let loaded = block_on(manager.load_project(doc.id)).unwrap();
        assert!(loaded.layer_equivalent(&doc));
        assert!(matches!(
            block_on(manager.load_project(Uuid::new_v4())),
            Err(AutoSaveError::MissingPayload(_))
        ));
    }

    #[test]
    fn test_autosave_does_not_write_project_copy() {
        let manager = manager();
        let doc = document(&manager);
        block_on(manager.trigger(&doc, SaveTrigger::Auto)).unwrap();

        assert!(block_on(manager.list_projects()).unwrap().is_empty());
    }

    /// Store that reports an edit while a payload is being written.
    struct EditingStore {
        inner: MemoryStore,
        flag: DirtyFlag,
    }

    impl KeyValueStore for EditingStore {
        fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Option<Vec<u8>>>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &[u8]) -> BoxFuture<'_, StorageResult<bool>> {
            if key.starts_with(RECOVERY_PAYLOAD_PREFIX) {
                self.flag.mark();
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> BoxFuture<'_, StorageResult<()>> {
            self.inner.remove(key)
        }

        fn list_keys(&self, prefix: &str) -> BoxFuture<'_, StorageResult<Vec<String>>> {
            self.inner.list_keys(prefix)
        }
    }

    /// Store that declines every key matching `refuse`.
    struct RefusingStore {
        inner: MemoryStore,
        refuse: fn(&str) -> bool,
    }

    impl KeyValueStore for RefusingStore {
        fn get(&self, key: &str) -> BoxFuture<'_, StorageResult<Option<Vec<u8>>>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &[u8]) -> BoxFuture<'_, StorageResult<bool>> {
            if (self.refuse)(key) {
                return Box::pin(async { Ok(false) });
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> BoxFuture<'_, StorageResult<()>> {
            self.inner.remove(key)
        }

        fn list_keys(&self, prefix: &str) -> BoxFuture<'_, StorageResult<Vec<String>>> {
            self.inner.list_keys(prefix)
        }
    }

    fn refusing_manifests() -> Arc<RefusingStore> {
        Arc::new(RefusingStore {
            inner: MemoryStore::new(),
            refuse: is_manifest_key,
        })
    }

    #[test]
    fn test_failed_manual_save_leaves_no_payload() {
        let storage = refusing_manifests();
        let project = ProjectFileManager::new(Arc::new(RawRasterizer));
        let manager = AutoSaveManager::new(storage.clone(), project, AutoSaveConfig::default());
        let doc = document(&manager);

        assert!(matches!(
            block_on(manager.trigger(&doc, SaveTrigger::Manual)),
            Err(AutoSaveError::CapacityExceeded { key, .. }) if key == manifest_key(doc.id)
        ));
        assert!(block_on(storage.list_keys(RECOVERY_PAYLOAD_PREFIX)).unwrap().is_empty());
        assert!(block_on(manager.recovery_points()).unwrap().is_empty());
        assert!(manager.is_dirty());
        assert!(!manager.is_saving());
    }

    #[test]
    fn test_declined_manifest_goes_to_overflow() {
        let storage = refusing_manifests();
        let overflow = Arc::new(MemoryStore::new());
        let project = ProjectFileManager::new(Arc::new(RawRasterizer));
        let manager = AutoSaveManager::new(storage, project, AutoSaveConfig::default())
            .with_overflow(overflow.clone());
        let doc = document(&manager);

        assert!(block_on(manager.trigger(&doc, SaveTrigger::Manual)).unwrap().is_saved());
        assert!(block_on(overflow.get(&manifest_key(doc.id))).unwrap().is_some());

        let projects = block_on(manager.list_projects()).unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id, doc.id);
    }

    #[test]
    fn test_change_during_save_keeps_dirty() {
        let flag = DirtyFlag::new();
        let storage = Arc::new(EditingStore {
            inner: MemoryStore::new(),
            flag: flag.clone(),
        });
        let project = ProjectFileManager::new(Arc::new(RawRasterizer));
        let mut manager = AutoSaveManager::new(storage, project, AutoSaveConfig::default());
        manager.dirty = flag;
        let doc = document(&manager);

        assert!(block_on(manager.trigger(&doc, SaveTrigger::Auto)).unwrap().is_saved());
        assert!(manager.is_dirty());
    }
}
