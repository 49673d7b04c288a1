//! Durable document schema.
//!
//! These types are what a saved project contains: plain data with every
//! bitmap replaced by an [`AssetId`] reference into the asset registry that
//! travels with it. JSON field names are camelCase.

pub mod migrate;

use crate::assets::{Asset, AssetId};
use crate::document::{
    AdjustmentKind, AppState, BlendMode, Falloff, GroupId, HistoryLog, ImageFilters, LayerEffect,
    LayerGroup, LayerId, LayerKind, LayerTransform, Libraries, LockFlags, MaskSlot,
    ProjectMetadata, Stroke, TextElement, UvRect,
};
use crate::hash::ContentHash;
use chrono::{DateTime, Utc};
use kurbo::Rect;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Magic bytes opening every encoded project.
pub const MAGIC: &[u8; 4] = b"ATLR";

/// Magic as recorded in the durable header.
pub const MAGIC_STR: &str = "ATLR";

/// File type recorded in the durable header.
pub const FILE_TYPE: &str = "atelier.project";

/// Format version written by this build.
pub const CURRENT_VERSION: FormatVersion = FormatVersion { major: 1, minor: 2 };

/// Format errors.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Invalid file format: {0}")]
    InvalidFileFormat(String),
    #[error("Unsupported format version {found} (this build reads {supported})")]
    UnsupportedVersion {
        found: FormatVersion,
        supported: FormatVersion,
    },
    #[error("Payload could not be read: inflate failed ({decompress}) and raw parse failed ({parse})")]
    DecompressionFailure { decompress: String, parse: String },
    #[error("Content hash mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
    #[error("Malformed project data: {0}")]
    Malformed(String),
}

/// Result type for format operations.
pub type FormatResult<T> = Result<T, FormatError>;

/// Major/minor format version, written as `"M.m"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Whether this build can read documents of this version.
    pub fn is_readable(self) -> bool {
        self.major == CURRENT_VERSION.major
    }

    /// Reject versions with a different major.
    pub fn check_supported(self) -> FormatResult<()> {
        if !self.is_readable() {
            return Err(FormatError::UnsupportedVersion {
                found: self,
                supported: CURRENT_VERSION,
            });
        }
        if self.minor > CURRENT_VERSION.minor {
            log::info!(
                "Reading format {} written by a newer build; unknown fields are ignored",
                self
            );
        }
        Ok(())
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for FormatVersion {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || FormatError::InvalidFileFormat(format!("bad version string '{s}'"));
        let (major, minor) = s.trim().split_once('.').ok_or_else(bad)?;
        Ok(Self {
            major: major.parse().map_err(|_| bad())?,
            minor: minor.parse().map_err(|_| bad())?,
        })
    }
}

impl Serialize for FormatVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FormatVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Payload compression of an encoded project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    /// zlib-wrapped deflate.
    Deflate,
}

/// Identifying header of a durable document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatHeader {
    pub magic: String,
    pub file_type: String,
    pub version: FormatVersion,
    #[serde(default)]
    pub compression: Compression,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
}

impl Default for FormatHeader {
    fn default() -> Self {
        Self::current()
    }
}

impl FormatHeader {
    /// Header for a document written by this build.
    pub fn current() -> Self {
        Self {
            magic: MAGIC_STR.to_string(),
            file_type: FILE_TYPE.to_string(),
            version: CURRENT_VERSION,
            compression: Compression::None,
            content_hash: None,
        }
    }

    /// Validate magic, file type and version, in that order.
    pub fn check(&self) -> FormatResult<()> {
        if self.magic != MAGIC_STR {
            return Err(FormatError::InvalidFileFormat(format!(
                "bad magic '{}'",
                self.magic
            )));
        }
        if self.file_type != FILE_TYPE {
            return Err(FormatError::InvalidFileFormat(format!(
                "unexpected file type '{}'",
                self.file_type
            )));
        }
        self.version.check_supported()
    }
}

/// Project-level record: descriptive metadata and the document preview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub metadata: ProjectMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<AssetId>,
}

/// A mask whose bitmap lives in the asset registry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DurableMask {
    pub asset: AssetId,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub inverted: bool,
    #[serde(default = "full")]
    pub density: f32,
    #[serde(default)]
    pub feather: f32,
}

fn enabled() -> bool {
    true
}

fn full() -> f32 {
    1.0
}

/// The three mask slots of a durable layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableMasks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_mask: Option<DurableMask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip_mask: Option<DurableMask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_mask: Option<DurableMask>,
}

impl DurableMasks {
    pub fn get(&self, slot: MaskSlot) -> Option<&DurableMask> {
        match slot {
            MaskSlot::LayerMask => self.layer_mask.as_ref(),
            MaskSlot::ClipMask => self.clip_mask.as_ref(),
            MaskSlot::VectorMask => self.vector_mask.as_ref(),
        }
    }

    pub fn set(&mut self, slot: MaskSlot, mask: Option<DurableMask>) {
        match slot {
            MaskSlot::LayerMask => self.layer_mask = mask,
            MaskSlot::ClipMask => self.clip_mask = mask,
            MaskSlot::VectorMask => self.vector_mask = mask,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.layer_mask.is_none() && self.clip_mask.is_none() && self.vector_mask.is_none()
    }
}

/// Image element with its source bitmap as an asset reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableImageElement {
    pub id: Uuid,
    pub source: AssetId,
    #[serde(default)]
    pub uv: UvRect,
    pub placement: Rect,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub filters: ImageFilters,
}

/// Puff element with its height map as an asset reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurablePuffElement {
    pub id: Uuid,
    pub height_map: AssetId,
    pub bounds: Rect,
    #[serde(default = "full")]
    pub height: f32,
    #[serde(default)]
    pub softness: f32,
    #[serde(default)]
    pub falloff: Falloff,
}

/// Durable layer content, tagged by `kind` with the payload under `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    content = "content",
    rename_all = "lowercase",
    rename_all_fields = "camelCase"
)]
pub enum DurableContent {
    Paint {
        canvas: AssetId,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        strokes: Vec<Stroke>,
    },
    Text {
        elements: Vec<TextElement>,
    },
    Image {
        elements: Vec<DurableImageElement>,
    },
    Puff {
        elements: Vec<DurablePuffElement>,
    },
    Group {
        children: Vec<LayerId>,
        #[serde(default = "enabled")]
        pass_through: bool,
    },
    Adjustment {
        adjustment: AdjustmentKind,
        #[serde(default)]
        params: BTreeMap<String, f64>,
        #[serde(default)]
        affected_layers: Vec<LayerId>,
    },
}

impl DurableContent {
    pub fn kind(&self) -> LayerKind {
        match self {
            DurableContent::Paint { .. } => LayerKind::Paint,
            DurableContent::Text { .. } => LayerKind::Text,
            DurableContent::Image { .. } => LayerKind::Image,
            DurableContent::Puff { .. } => LayerKind::Puff,
            DurableContent::Group { .. } => LayerKind::Group,
            DurableContent::Adjustment { .. } => LayerKind::Adjustment,
        }
    }

    /// Asset ids referenced by the content.
    pub fn asset_ids(&self) -> Vec<AssetId> {
        match self {
            DurableContent::Paint { canvas, .. } => vec![*canvas],
            DurableContent::Image { elements } => elements.iter().map(|e| e.source).collect(),
            DurableContent::Puff { elements } => elements.iter().map(|e| e.height_map).collect(),
            _ => Vec::new(),
        }
    }
}

/// A layer in durable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableLayer {
    pub id: LayerId,
    pub name: String,
    #[serde(default = "enabled")]
    pub visible: bool,
    #[serde(default = "full")]
    pub opacity: f32,
    #[serde(default)]
    pub blend_mode: BlendMode,
    #[serde(default)]
    pub transform: LayerTransform,
    #[serde(default)]
    pub bounds: Rect,
    #[serde(default)]
    pub locks: LockFlags,
    #[serde(default)]
    pub effects: Vec<LayerEffect>,
    #[serde(default, skip_serializing_if = "DurableMasks::is_empty")]
    pub masks: DurableMasks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<AssetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clipped_by: Option<LayerId>,
    #[serde(flatten)]
    pub content: DurableContent,
}

impl DurableLayer {
    pub fn kind(&self) -> LayerKind {
        self.content.kind()
    }

    /// Every asset this layer references: content, masks and thumbnail.
    pub fn asset_ids(&self) -> Vec<AssetId> {
        let mut ids = self.content.asset_ids();
        for slot in [MaskSlot::LayerMask, MaskSlot::ClipMask, MaskSlot::VectorMask] {
            if let Some(mask) = self.masks.get(slot) {
                ids.push(mask.asset);
            }
        }
        ids.extend(self.thumbnail);
        ids
    }

    /// Every layer or group id this layer points at, with the field name.
    pub fn references(&self) -> Vec<(&'static str, Uuid)> {
        let mut refs: Vec<(&'static str, Uuid)> = Vec::new();
        refs.extend(self.group_id.map(|g| ("groupId", g)));
        refs.extend(self.clipped_by.map(|c| ("clippedBy", c)));
        match &self.content {
            DurableContent::Group { children, .. } => {
                refs.extend(children.iter().map(|&c| ("children", c)))
            }
            DurableContent::Adjustment {
                affected_layers, ..
            } => refs.extend(affected_layers.iter().map(|&l| ("affectedLayers", l))),
            _ => {}
        }
        refs
    }

    /// Drop every pointer at `target`.
    fn forget(&mut self, target: Uuid) {
        if self.group_id == Some(target) {
            self.group_id = None;
        }
        if self.clipped_by == Some(target) {
            self.clipped_by = None;
        }
        match &mut self.content {
            DurableContent::Group { children, .. } => children.retain(|&c| c != target),
            DurableContent::Adjustment {
                affected_layers, ..
            } => affected_layers.retain(|&l| l != target),
            _ => {}
        }
    }
}

/// A cross reference dropped from a saved document because its target was
/// not part of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrunedReference {
    pub owner: Uuid,
    pub field: &'static str,
    pub target: Uuid,
}

/// A complete saved document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableDocument {
    pub header: FormatHeader,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub project: ProjectRecord,
    pub layer_order: Vec<LayerId>,
    pub layers: BTreeMap<LayerId, DurableLayer>,
    #[serde(default)]
    pub groups: BTreeMap<GroupId, LayerGroup>,
    #[serde(default)]
    pub assets: BTreeMap<AssetId, Asset>,
    #[serde(default)]
    pub libraries: Libraries,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryLog>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_state: Option<AppState>,
}

impl DurableDocument {
    pub fn name(&self) -> &str {
        &self.project.metadata.name
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Every asset id referenced by layers or the project thumbnail.
    pub fn referenced_assets(&self) -> HashSet<AssetId> {
        let mut ids: HashSet<AssetId> = self
            .layers
            .values()
            .flat_map(DurableLayer::asset_ids)
            .collect();
        ids.extend(self.project.thumbnail);
        ids
    }

    /// Sum of registry payload sizes.
    pub fn total_asset_size(&self) -> u64 {
        self.assets.values().map(|asset| asset.size).sum()
    }

    /// Remove every reference to a layer that is not part of the document.
    pub(crate) fn prune_layer_refs(&mut self, target: LayerId) {
        self.layer_order.retain(|&id| id != target);
        for layer in self.layers.values_mut() {
            layer.forget(target);
        }
        for group in self.groups.values_mut() {
            group.children.retain(|&c| c != target);
        }
        if let Some(state) = &mut self.app_state {
            state.selection.retain(|&id| id != target);
        }
        if let Some(history) = &mut self.history {
            for entry in &mut history.entries {
                entry.layer_ids.retain(|&id| id != target);
            }
        }
    }

    /// Remove every layer or group reference whose target is missing.
    pub(crate) fn prune_dangling_refs(&mut self) -> Vec<PrunedReference> {
        let group_ids: HashSet<Uuid> = self.groups.keys().copied().collect();
        let known: HashSet<Uuid> = self
            .layers
            .keys()
            .chain(group_ids.iter())
            .copied()
            .collect();
        let mut pruned = Vec::new();

        for layer in self.layers.values_mut() {
            for (field, target) in layer.references() {
                if !known.contains(&target) {
                    layer.forget(target);
                    pruned.push(PrunedReference {
                        owner: layer.id,
                        field,
                        target,
                    });
                }
            }
        }
        for group in self.groups.values_mut() {
            if let Some(parent) = group.parent_id.filter(|p| !group_ids.contains(p)) {
                group.parent_id = None;
                pruned.push(PrunedReference {
                    owner: group.id,
                    field: "parentId",
                    target: parent,
                });
            }
            let owner = group.id;
            group.children.retain(|child| {
                let keep = known.contains(child);
                if !keep {
                    pruned.push(PrunedReference {
                        owner,
                        field: "children",
                        target: *child,
                    });
                }
                keep
            });
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paint_layer(canvas: AssetId) -> DurableLayer {
        DurableLayer {
            id: Uuid::new_v4(),
            name: "Ink".to_string(),
            visible: true,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            transform: LayerTransform::default(),
            bounds: Rect::new(0.0, 0.0, 10.0, 10.0),
            locks: LockFlags::default(),
            effects: Vec::new(),
            masks: DurableMasks::default(),
            thumbnail: None,
            group_id: None,
            clipped_by: None,
            content: DurableContent::Paint {
                canvas,
                strokes: Vec::new(),
            },
        }
    }

    #[test]
    fn test_version_string_form() {
        let json = serde_json::to_value(CURRENT_VERSION).unwrap();
        assert_eq!(json, json!("1.2"));

        let parsed: FormatVersion = serde_json::from_value(json!("1.0")).unwrap();
        assert_eq!(parsed, FormatVersion::new(1, 0));
        assert!("one.two".parse::<FormatVersion>().is_err());
    }

    #[test]
    fn test_header_check_order() {
        let mut header = FormatHeader::current();
        assert!(header.check().is_ok());

        header.version = FormatVersion::new(2, 0);
        header.file_type = "other".to_string();
        assert!(matches!(header.check(), Err(FormatError::InvalidFileFormat(_))));

        header.file_type = FILE_TYPE.to_string();
        assert!(matches!(
            header.check(),
            Err(FormatError::UnsupportedVersion { found, .. }) if found.major == 2
        ));
    }

    #[test]
    fn test_newer_minor_is_readable() {
        let mut header = FormatHeader::current();
        header.version = FormatVersion::new(1, 9);
        assert!(header.check().is_ok());
    }

    #[test]
    fn test_layer_content_is_tagged_by_kind() {
        let canvas = Uuid::new_v4();
        let layer = paint_layer(canvas);
        let json = serde_json::to_value(&layer).unwrap();

        assert_eq!(json["kind"], "paint");
        assert_eq!(json["content"]["canvas"], json!(canvas.to_string()));
        assert!(json.get("masks").is_none());

        let back: DurableLayer = serde_json::from_value(json).unwrap();
        assert_eq!(back, layer);
    }

    #[test]
    fn test_group_content_uses_camel_case_fields() {
        let content = DurableContent::Group {
            children: Vec::new(),
            pass_through: false,
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["content"]["passThrough"], false);
    }

    #[test]
    fn test_layer_asset_ids_cover_masks_and_thumbnail() {
        let canvas = Uuid::new_v4();
        let mask = Uuid::new_v4();
        let thumb = Uuid::new_v4();
        let mut layer = paint_layer(canvas);
        layer.masks.set(
            MaskSlot::ClipMask,
            Some(DurableMask {
                asset: mask,
                enabled: true,
                inverted: false,
                density: 1.0,
                feather: 0.0,
            }),
        );
        layer.thumbnail = Some(thumb);

        assert_eq!(layer.asset_ids(), vec![canvas, mask, thumb]);
    }
}
