//! Conversion between the live [`Document`] and its durable form.
//!
//! Serialization pulls every bitmap out of the document through the
//! [`Rasterizer`], parks the bytes in the [`AssetStore`] and leaves an asset
//! id in its place. A layer that cannot be encoded is dropped from the output
//! instead of failing the whole save. Deserialization is all-or-nothing.

use crate::assets::{AssetError, AssetId, AssetKind, AssetMetadata, AssetStore, ImageFormat};
use crate::document::{
    Document, DocumentError, ImageElement, Layer, LayerContent, LayerId, LayerMasks, Mask,
    MaskSlot, PuffElement,
};
use crate::format::{
    DurableContent, DurableDocument, DurableImageElement, DurableLayer, DurableMask,
    DurableMasks, DurablePuffElement, FormatError, FormatHeader, ProjectRecord, PrunedReference,
};
use crate::raster::{RasterError, Rasterizer, SurfaceRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const MASK_SLOTS: [MaskSlot; 3] = [MaskSlot::LayerMask, MaskSlot::ClipMask, MaskSlot::VectorMask];

/// How much of the document a save writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailLevel {
    /// Only what is needed to reconstruct the picture: no strokes, no
    /// history, no editor state.
    Basic,
    /// The full schema.
    #[default]
    Detailed,
}

/// Serialization options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SerializeOptions {
    pub detail: DetailLevel,
    /// Write layer and document thumbnails.
    pub include_thumbnails: bool,
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self {
            detail: DetailLevel::Detailed,
            include_thumbnails: true,
        }
    }
}

impl SerializeOptions {
    pub fn basic() -> Self {
        Self {
            detail: DetailLevel::Basic,
            ..Default::default()
        }
    }
}

/// A layer left out of a save because it could not be encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedLayer {
    pub layer_id: LayerId,
    pub layer_name: String,
    pub reason: String,
}

/// Result of serializing a document.
#[derive(Debug, Clone)]
pub struct SerializeOutcome {
    pub document: DurableDocument,
    /// Layers omitted from `document`. Empty on a complete save.
    pub skipped: Vec<SkippedLayer>,
    /// References dropped because their target was missing.
    pub pruned: Vec<PrunedReference>,
}

impl SerializeOutcome {
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

/// Failure to encode one layer.
#[derive(Debug, Error)]
enum LayerError {
    #[error("{field} bitmap could not be encoded: {source}")]
    Bitmap {
        field: &'static str,
        source: RasterError,
    },
    #[error(transparent)]
    Asset(#[from] AssetError),
}

/// Deserialization errors. Any of them aborts the whole load.
#[derive(Debug, Error)]
pub enum DeserializeError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("Asset for {owner}.{field} is unusable: {source}")]
    Asset {
        owner: Uuid,
        field: &'static str,
        source: AssetError,
    },
    #[error("Bitmap {asset} for {owner}.{field} could not be decoded: {source}")]
    Bitmap {
        owner: Uuid,
        field: &'static str,
        asset: AssetId,
        source: RasterError,
    },
    #[error("Layer stored under key {key} has id {id}")]
    KeyMismatch { key: LayerId, id: LayerId },
    #[error("{layer}.{field} references unknown id {target}")]
    DanglingReference {
        layer: Uuid,
        field: &'static str,
        target: Uuid,
    },
    #[error("Invalid document: {0}")]
    Invalid(DocumentError),
}

impl From<DocumentError> for DeserializeError {
    fn from(err: DocumentError) -> Self {
        match err {
            DocumentError::DanglingReference {
                owner,
                field,
                target,
            } => DeserializeError::DanglingReference {
                layer: owner,
                field,
                target,
            },
            other => DeserializeError::Invalid(other),
        }
    }
}

/// Converts documents to and from their durable form.
#[derive(Clone)]
pub struct DocumentSerializer {
    rasterizer: Arc<dyn Rasterizer>,
}

impl DocumentSerializer {
    pub fn new(rasterizer: Arc<dyn Rasterizer>) -> Self {
        Self { rasterizer }
    }

    pub fn rasterizer(&self) -> &Arc<dyn Rasterizer> {
        &self.rasterizer
    }

    /// Serialize a document, storing its bitmaps in `store`.
    ///
    /// Never fails as a whole: layers whose bitmaps cannot be encoded are
    /// reported in [`SerializeOutcome::skipped`] and every reference to them
    /// is removed from the output.
    pub fn serialize(
        &self,
        document: &Document,
        store: &mut AssetStore,
        options: SerializeOptions,
    ) -> SerializeOutcome {
        let mut layers = BTreeMap::new();
        let mut skipped = Vec::new();

        for layer in document.layers_ordered() {
            let mut linked = Vec::new();
            match self.serialize_layer(layer, store, options, &mut linked) {
                Ok(durable) => {
                    layers.insert(layer.id(), durable);
                }
                Err(err) => {
                    for asset in linked {
                        let _ = store.unlink(asset, layer.id());
                    }
                    log::warn!(
                        "Skipping layer '{}' ({}) during save: {}",
                        layer.name,
                        layer.id(),
                        err
                    );
                    skipped.push(SkippedLayer {
                        layer_id: layer.id(),
                        layer_name: layer.name.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let thumbnail = match &document.thumbnail {
            Some(surface) if options.include_thumbnails => {
                match self.store_bitmap(surface, store, "thumbnail", AssetKind::Thumbnail, document.name()) {
                    Ok(id) => Some(id),
                    Err(err) => {
                        log::warn!("Dropping unreadable document thumbnail: {}", err);
                        None
                    }
                }
            }
            _ => None,
        };

        let detailed = options.detail == DetailLevel::Detailed;
        let mut durable = DurableDocument {
            header: FormatHeader::current(),
            id: document.id,
            created_at: document.created_at,
            modified_at: document.modified_at,
            project: ProjectRecord {
                metadata: document.metadata.clone(),
                thumbnail,
            },
            layer_order: document.layer_order().to_vec(),
            layers,
            groups: document.groups().map(|g| (g.id, g.clone())).collect(),
            assets: BTreeMap::new(),
            libraries: document.libraries.clone(),
            history: document.history.clone().filter(|_| detailed),
            app_state: detailed.then(|| document.app_state.clone()),
        };

        for skip in &skipped {
            durable.prune_layer_refs(skip.layer_id);
        }
        let pruned = durable.prune_dangling_refs();
        for reference in &pruned {
            log::warn!(
                "Dropping dangling {} reference from {} to {}",
                reference.field,
                reference.owner,
                reference.target
            );
        }

        log::debug!(
            "Serialized '{}': {} layer(s), {} skipped",
            document.name(),
            durable.layers.len(),
            skipped.len()
        );
        SerializeOutcome {
            document: durable,
            skipped,
            pruned,
        }
    }

    fn serialize_layer(
        &self,
        layer: &Layer,
        store: &mut AssetStore,
        options: SerializeOptions,
        linked: &mut Vec<AssetId>,
    ) -> Result<DurableLayer, LayerError> {
        let owner = layer.id();
        let mut put = |surface: &SurfaceRef,
                       field: &'static str,
                       kind: AssetKind,
                       store: &mut AssetStore|
         -> Result<AssetId, LayerError> {
            let id = self
                .store_bitmap(surface, store, field, kind, &layer.name)
                .map_err(|source| LayerError::Bitmap { field, source })?;
            if !store.asset(id)?.used_by_layers.contains(&owner) {
                store.link(id, owner)?;
                linked.push(id);
            }
            Ok(id)
        };

        let content = match &layer.content {
            LayerContent::Paint { canvas, strokes } => DurableContent::Paint {
                canvas: put(canvas, "canvas", AssetKind::Bitmap, store)?,
                strokes: match options.detail {
                    DetailLevel::Detailed => strokes.clone(),
                    DetailLevel::Basic => Vec::new(),
                },
            },
            LayerContent::Text { elements } => DurableContent::Text {
                elements: elements.clone(),
            },
            LayerContent::Image { elements } => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.push(DurableImageElement {
                        id: element.id,
                        source: put(&element.source, "images", AssetKind::Image, store)?,
                        uv: element.uv,
                        placement: element.placement,
                        rotation: element.rotation,
                        filters: element.filters,
                    });
                }
                DurableContent::Image { elements: out }
            }
            LayerContent::Puff { elements } => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.push(DurablePuffElement {
                        id: element.id,
                        height_map: put(&element.height_map, "heightMap", AssetKind::HeightMap, store)?,
                        bounds: element.bounds,
                        height: element.height,
                        softness: element.softness,
                        falloff: element.falloff,
                    });
                }
                DurableContent::Puff { elements: out }
            }
            LayerContent::Group {
                children,
                pass_through,
            } => DurableContent::Group {
                children: children.clone(),
                pass_through: *pass_through,
            },
            LayerContent::Adjustment {
                adjustment,
                params,
                affected_layers,
            } => DurableContent::Adjustment {
                adjustment: *adjustment,
                params: params.clone(),
                affected_layers: affected_layers.clone(),
            },
        };

        let mut masks = DurableMasks::default();
        for slot in MASK_SLOTS {
            if let Some(mask) = layer.masks.get(slot) {
                let asset = put(&mask.surface, mask_field(slot), AssetKind::Mask, store)?;
                masks.set(
                    slot,
                    Some(DurableMask {
                        asset,
                        enabled: mask.enabled,
                        inverted: mask.inverted,
                        density: mask.density,
                        feather: mask.feather,
                    }),
                );
            }
        }

        let thumbnail = match &layer.thumbnail {
            Some(surface) if options.include_thumbnails => {
                Some(put(surface, "thumbnail", AssetKind::Thumbnail, store)?)
            }
            _ => None,
        };

        Ok(DurableLayer {
            id: layer.id(),
            name: layer.name.clone(),
            visible: layer.visible,
            opacity: layer.opacity,
            blend_mode: layer.blend_mode,
            transform: layer.transform,
            bounds: layer.bounds,
            locks: layer.locks,
            effects: layer.effects.clone(),
            masks,
            thumbnail,
            group_id: layer.group_id,
            clipped_by: layer.clipped_by,
            content,
        })
    }

    /// Encode a surface under its read lock and put the bytes in the store.
    fn store_bitmap(
        &self,
        surface: &SurfaceRef,
        store: &mut AssetStore,
        field: &str,
        kind: AssetKind,
        owner_name: &str,
    ) -> Result<AssetId, RasterError> {
        let (bytes, width, height) = surface.with_snapshot(|s| {
            self.rasterizer
                .encode_to_bytes(s)
                .map(|bytes| (bytes, s.width, s.height))
        })??;
        let mime = self.rasterizer.mime_type();
        let metadata = AssetMetadata {
            width,
            height,
            format: ImageFormat::from_magic_bytes(&bytes)
                .or_else(|| ImageFormat::from_mime_type(mime)),
        };
        Ok(store.put(
            &bytes,
            &format!("{owner_name} {field}"),
            kind,
            mime,
            Some(metadata),
        ))
    }

    /// Rebuild a live document from its durable form.
    ///
    /// Validates the header, decodes and checksums every referenced bitmap,
    /// and checks every cross reference before anything is returned.
    pub fn deserialize(
        &self,
        durable: &DurableDocument,
        store: &AssetStore,
    ) -> Result<Document, DeserializeError> {
        durable.header.check()?;

        let mut layers = HashMap::with_capacity(durable.layers.len());
        for (key, stored) in &durable.layers {
            if *key != stored.id {
                return Err(DeserializeError::KeyMismatch {
                    key: *key,
                    id: stored.id,
                });
            }
            layers.insert(stored.id, self.deserialize_layer(stored, store)?);
        }

        let thumbnail = match durable.project.thumbnail {
            Some(asset) => Some(self.load_bitmap(asset, durable.id, "thumbnail", store)?),
            None => None,
        };

        let mut app_state = durable.app_state.clone().unwrap_or_default();
        app_state.selection.retain(|id| layers.contains_key(id));

        let groups = durable
            .groups
            .values()
            .map(|group| (group.id, group.clone()))
            .collect();

        let mut document = Document::new();
        document.replace_contents(durable.layer_order.clone(), layers, groups)?;
        document.id = durable.id;
        document.metadata = durable.project.metadata.clone();
        document.thumbnail = thumbnail;
        document.libraries = durable.libraries.clone();
        document.history = durable.history.clone();
        document.app_state = app_state;
        document.created_at = durable.created_at;
        document.modified_at = durable.modified_at;

        log::debug!(
            "Deserialized '{}' with {} layer(s)",
            document.name(),
            document.layer_count()
        );
        Ok(document)
    }

    fn deserialize_layer(
        &self,
        stored: &DurableLayer,
        store: &AssetStore,
    ) -> Result<Layer, DeserializeError> {
        let owner = stored.id;
        let content = match &stored.content {
            DurableContent::Paint { canvas, strokes } => LayerContent::Paint {
                canvas: self.load_bitmap(*canvas, owner, "canvas", store)?,
                strokes: strokes.clone(),
            },
            DurableContent::Text { elements } => LayerContent::Text {
                elements: elements.clone(),
            },
            DurableContent::Image { elements } => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.push(ImageElement {
                        id: element.id,
                        source: self.load_bitmap(element.source, owner, "images", store)?,
                        uv: element.uv,
                        placement: element.placement,
                        rotation: element.rotation,
                        filters: element.filters,
                    });
                }
                LayerContent::Image { elements: out }
            }
            DurableContent::Puff { elements } => {
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.push(PuffElement {
                        id: element.id,
                        height_map: self.load_bitmap(element.height_map, owner, "heightMap", store)?,
                        bounds: element.bounds,
                        height: element.height,
                        softness: element.softness,
                        falloff: element.falloff,
                    });
                }
                LayerContent::Puff { elements: out }
            }
            DurableContent::Group {
                children,
                pass_through,
            } => LayerContent::Group {
                children: children.clone(),
                pass_through: *pass_through,
            },
            DurableContent::Adjustment {
                adjustment,
                params,
                affected_layers,
            } => LayerContent::Adjustment {
                adjustment: *adjustment,
                params: params.clone(),
                affected_layers: affected_layers.clone(),
            },
        };

        let mut masks = LayerMasks::default();
        for slot in MASK_SLOTS {
            if let Some(stored_mask) = stored.masks.get(slot) {
                masks.set(
                    slot,
                    Some(Mask {
                        surface: self.load_bitmap(stored_mask.asset, owner, mask_field(slot), store)?,
                        enabled: stored_mask.enabled,
                        inverted: stored_mask.inverted,
                        density: stored_mask.density.clamp(0.0, 1.0),
                        feather: stored_mask.feather,
                    }),
                );
            }
        }

        let thumbnail = match stored.thumbnail {
            Some(asset) => Some(self.load_bitmap(asset, owner, "thumbnail", store)?),
            None => None,
        };

        let mut layer = Layer::with_id(stored.id, stored.name.clone(), content)
            .with_opacity(stored.opacity)
            .with_bounds(stored.bounds);
        layer.visible = stored.visible;
        layer.blend_mode = stored.blend_mode;
        layer.transform = stored.transform;
        layer.locks = stored.locks;
        layer.effects = stored.effects.clone();
        layer.masks = masks;
        layer.thumbnail = thumbnail;
        layer.group_id = stored.group_id;
        layer.clipped_by = stored.clipped_by;
        Ok(layer)
    }

    fn load_bitmap(
        &self,
        asset: AssetId,
        owner: Uuid,
        field: &'static str,
        store: &AssetStore,
    ) -> Result<SurfaceRef, DeserializeError> {
        let asset_error = |source| DeserializeError::Asset {
            owner,
            field,
            source,
        };
        let payload = store.payload(asset).map_err(asset_error)?;
        store.verify(asset, payload).map_err(asset_error)?;
        let bitmap_error = |source| DeserializeError::Bitmap {
            owner,
            field,
            asset,
            source,
        };

        let declared = store
            .asset(asset)
            .ok()
            .and_then(|record| ImageFormat::from_mime_type(&record.mime_type));
        if let (Some(declared), Some(found)) = (declared, ImageFormat::from_magic_bytes(payload)) {
            if declared != found {
                return Err(bitmap_error(RasterError::Decode(format!(
                    "declared {} but the payload is {}",
                    declared.mime_type(),
                    found.mime_type()
                ))));
            }
        }
        let surface = self
            .rasterizer
            .decode_to_surface(payload)
            .map_err(bitmap_error)?;
        Ok(SurfaceRef::new(surface))
    }
}

fn mask_field(slot: MaskSlot) -> &'static str {
    match slot {
        MaskSlot::LayerMask => "layerMask",
        MaskSlot::ClipMask => "clipMask",
        MaskSlot::VectorMask => "vectorMask",
    }
}
