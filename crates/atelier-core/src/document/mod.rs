//! The live, editable document.
//!
//! [`Document`] is the in-memory aggregate the editor mutates. It owns the
//! layer set, the layer order, groups, libraries and editor state, and tells
//! registered [`DocumentObserver`]s about every change it makes.

mod content;
mod layer;
mod library;
mod style;

pub use content::{
    AdjustmentKind, Falloff, Fill, GradientStop, ImageElement, ImageFilters, LayerContent,
    PuffElement, Stroke, StrokePoint, TextAlign, TextElement, TextStroke, Typography, UvRect,
};
pub use layer::{
    GroupId, Layer, LayerGroup, LayerId, LayerKind, LayerMasks, LayerTransform, LockFlags, Mask,
    MaskSlot,
};
pub use library::{
    AppState, Gradient, GradientKind, HistoryEntry, HistoryLog, Libraries, PanelState, Pattern,
    PatternKind, Swatch, Viewport,
};
pub use style::{BlendMode, EffectKind, LayerEffect, Rgba8};

use crate::raster::SurfaceRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Document invariant violations.
#[derive(Debug, Error, PartialEq)]
pub enum DocumentError {
    #[error("Layer {0} not found")]
    LayerNotFound(LayerId),
    #[error("Group {0} not found")]
    GroupNotFound(GroupId),
    #[error("Layer {0} already exists")]
    DuplicateLayer(LayerId),
    #[error("Layer order is not a permutation of the layer set: {0}")]
    OrderMismatch(String),
    #[error("{owner}.{field} references unknown id {target}")]
    DanglingReference {
        owner: Uuid,
        field: &'static str,
        target: Uuid,
    },
}

/// What changed in a document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    LayerAdded(LayerId),
    LayerRemoved(LayerId),
    LayerUpdated(LayerId),
    GroupAdded(GroupId),
    GroupRemoved(GroupId),
    OrderChanged,
    MetadataChanged,
    Replaced,
}

/// Receives change notifications from a document.
pub trait DocumentObserver: Send + Sync {
    fn document_changed(&self, change: &DocumentChange);
}

/// Canvas dimensions and color handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasSettings {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_profile")]
    pub color_profile: String,
    #[serde(default = "Rgba8::white")]
    pub background: Rgba8,
}

fn default_profile() -> String {
    "sRGB IEC61966-2.1".to_string()
}

impl Default for CanvasSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            color_profile: default_profile(),
            background: Rgba8::white(),
        }
    }
}

/// Descriptive project metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetadata {
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub canvas: CanvasSettings,
}

impl Default for ProjectMetadata {
    fn default() -> Self {
        Self {
            name: "Untitled".to_string(),
            author: String::new(),
            description: String::new(),
            tags: Vec::new(),
            canvas: CanvasSettings::default(),
        }
    }
}

/// A layered design document.
pub struct Document {
    /// Unique document identifier.
    pub id: Uuid,
    pub metadata: ProjectMetadata,
    /// Document preview shown in project browsers.
    pub thumbnail: Option<SurfaceRef>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    layer_order: Vec<LayerId>,
    layers: HashMap<LayerId, Layer>,
    groups: HashMap<GroupId, LayerGroup>,
    pub libraries: Libraries,
    pub history: Option<HistoryLog>,
    pub app_state: AppState,
    observers: Vec<Arc<dyn DocumentObserver>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Document {
    /// Clones the content; observers stay with the original.
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            metadata: self.metadata.clone(),
            thumbnail: self.thumbnail.clone(),
            created_at: self.created_at,
            modified_at: self.modified_at,
            layer_order: self.layer_order.clone(),
            layers: self.layers.clone(),
            groups: self.groups.clone(),
            libraries: self.libraries.clone(),
            history: self.history.clone(),
            app_state: self.app_state.clone(),
            observers: Vec::new(),
        }
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("name", &self.metadata.name)
            .field("layers", &self.layer_order.len())
            .field("groups", &self.groups.len())
            .finish()
    }
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            metadata: ProjectMetadata::default(),
            thumbnail: None,
            created_at: now,
            modified_at: now,
            layer_order: Vec::new(),
            layers: HashMap::new(),
            groups: HashMap::new(),
            libraries: Libraries::default(),
            history: None,
            app_state: AppState::default(),
            observers: Vec::new(),
        }
    }

    /// Create a named document with the given canvas size.
    pub fn with_canvas(name: impl Into<String>, width: u32, height: u32) -> Self {
        let mut doc = Self::new();
        doc.metadata.name = name.into();
        doc.metadata.canvas.width = width;
        doc.metadata.canvas.height = height;
        doc
    }

    /// Register a change observer.
    pub fn subscribe(&mut self, observer: Arc<dyn DocumentObserver>) {
        self.observers.push(observer);
    }

    fn notify(&mut self, change: DocumentChange) {
        self.modified_at = Utc::now();
        for observer in &self.observers {
            observer.document_changed(&change);
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Rename the document.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.metadata.name = name.into();
        self.notify(DocumentChange::MetadataChanged);
    }

    /// Report a change made through direct field access (metadata, libraries, app state).
    pub fn touch(&mut self) {
        self.notify(DocumentChange::MetadataChanged);
    }

    /// Add a layer on top of the stack.
    pub fn add_layer(&mut self, layer: Layer) -> LayerId {
        let id = layer.id();
        if self.layers.insert(id, layer).is_none() {
            self.layer_order.push(id);
        }
        self.notify(DocumentChange::LayerAdded(id));
        id
    }

    /// Insert a layer at a stack position (0 is the bottom).
    pub fn insert_layer_at(&mut self, index: usize, layer: Layer) -> Result<LayerId, DocumentError> {
        let id = layer.id();
        if self.layers.contains_key(&id) {
            return Err(DocumentError::DuplicateLayer(id));
        }
        let index = index.min(self.layer_order.len());
        self.layers.insert(id, layer);
        self.layer_order.insert(index, id);
        self.notify(DocumentChange::LayerAdded(id));
        Ok(id)
    }

    /// Remove a layer.
    pub fn remove_layer(&mut self, id: LayerId) -> Option<Layer> {
        let removed = self.layers.remove(&id)?;
        self.layer_order.retain(|&layer_id| layer_id != id);
        for layer in self.layers.values_mut() {
            layer.forget(id);
        }
        for group in self.groups.values_mut() {
            group.children.retain(|&child| child != id);
        }
        self.app_state.selection.retain(|&selected| selected != id);
        if let Some(history) = &mut self.history {
            for entry in &mut history.entries {
                entry.layer_ids.retain(|&layer_id| layer_id != id);
            }
        }
        self.notify(DocumentChange::LayerRemoved(id));
        Some(removed)
    }

    /// Mutate a layer in place and notify observers.
    pub fn update_layer<T>(
        &mut self,
        id: LayerId,
        f: impl FnOnce(&mut Layer) -> T,
    ) -> Result<T, DocumentError> {
        let layer = self
            .layers
            .get_mut(&id)
            .ok_or(DocumentError::LayerNotFound(id))?;
        let result = f(layer);
        self.notify(DocumentChange::LayerUpdated(id));
        Ok(result)
    }

    /// Add a layer group.
    pub fn add_group(&mut self, group: LayerGroup) -> GroupId {
        let id = group.id;
        self.groups.insert(id, group);
        self.notify(DocumentChange::GroupAdded(id));
        id
    }

    /// Remove a group, detaching its members.
    pub fn remove_group(&mut self, id: GroupId) -> Option<LayerGroup> {
        let removed = self.groups.remove(&id)?;
        for layer in self.layers.values_mut() {
            layer.forget(id);
        }
        for group in self.groups.values_mut() {
            if group.parent_id == Some(id) {
                group.parent_id = None;
            }
            group.children.retain(|&child| child != id);
        }
        self.notify(DocumentChange::GroupRemoved(id));
        Some(removed)
    }

    /// Replace the layer order. Must be a permutation of the current layers.
    pub fn set_layer_order(&mut self, order: Vec<LayerId>) -> Result<(), DocumentError> {
        check_permutation(&order, &self.layers)?;
        self.layer_order = order;
        self.notify(DocumentChange::OrderChanged);
        Ok(())
    }

    /// Swap in a complete layer and group set, e.g. after a load.
    pub fn replace_contents(
        &mut self,
        layer_order: Vec<LayerId>,
        layers: HashMap<LayerId, Layer>,
        groups: HashMap<GroupId, LayerGroup>,
    ) -> Result<(), DocumentError> {
        check_permutation(&layer_order, &layers)?;
        check_references(&layers, &groups)?;
        self.layer_order = layer_order;
        self.layers = layers;
        self.groups = groups;
        self.notify(DocumentChange::Replaced);
        Ok(())
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(&id)
    }

    pub fn group(&self, id: GroupId) -> Option<&LayerGroup> {
        self.groups.get(&id)
    }

    /// Layer ids bottom to top.
    pub fn layer_order(&self) -> &[LayerId] {
        &self.layer_order
    }

    /// Layers bottom to top.
    pub fn layers_ordered(&self) -> impl Iterator<Item = &Layer> {
        self.layer_order.iter().filter_map(|id| self.layers.get(id))
    }

    pub fn groups(&self) -> impl Iterator<Item = &LayerGroup> {
        self.groups.values()
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Check the order permutation and every cross reference.
    pub fn validate(&self) -> Result<(), DocumentError> {
        check_permutation(&self.layer_order, &self.layers)?;
        check_references(&self.layers, &self.groups)
    }

    /// Same layers, in the same order, with equal content.
    pub fn layer_equivalent(&self, other: &Document) -> bool {
        self.layer_order == other.layer_order
            && self
                .layer_order
                .iter()
                .all(|id| self.layers.get(id) == other.layers.get(id))
            && self.groups == other.groups
    }
}

fn check_permutation(
    order: &[LayerId],
    layers: &HashMap<LayerId, Layer>,
) -> Result<(), DocumentError> {
    let mut seen = HashSet::with_capacity(order.len());
    for id in order {
        if !seen.insert(*id) {
            return Err(DocumentError::OrderMismatch(format!("{id} listed twice")));
        }
        if !layers.contains_key(id) {
            return Err(DocumentError::OrderMismatch(format!("{id} is not a layer")));
        }
    }
    if seen.len() != layers.len() {
        return Err(DocumentError::OrderMismatch(format!(
            "{} layers but {} ordered",
            layers.len(),
            seen.len()
        )));
    }
    Ok(())
}

fn check_references(
    layers: &HashMap<LayerId, Layer>,
    groups: &HashMap<GroupId, LayerGroup>,
) -> Result<(), DocumentError> {
    let resolves = |id: &Uuid| layers.contains_key(id) || groups.contains_key(id);
    for layer in layers.values() {
        for (field, target) in layer.references() {
            if !resolves(&target) {
                return Err(DocumentError::DanglingReference {
                    owner: layer.id(),
                    field,
                    target,
                });
            }
        }
    }
    for group in groups.values() {
        if let Some(parent) = group.parent_id {
            if !groups.contains_key(&parent) {
                return Err(DocumentError::DanglingReference {
                    owner: group.id,
                    field: "parentId",
                    target: parent,
                });
            }
        }
        for child in &group.children {
            if !resolves(child) {
                return Err(DocumentError::DanglingReference {
                    owner: group.id,
                    field: "children",
                    target: *child,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Surface;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl DocumentObserver for Counter {
        fn document_changed(&self, _change: &DocumentChange) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn paint_layer(name: &str) -> Layer {
        Layer::new(name, LayerContent::paint(Surface::new(2, 2)))
    }

    #[test]
    fn test_add_and_remove_layer() {
        let mut doc = Document::new();
        let a = doc.add_layer(paint_layer("A"));
        let b = doc.add_layer(paint_layer("B"));

        assert_eq!(doc.layer_order(), &[a, b]);
        assert!(doc.remove_layer(a).is_some());
        assert_eq!(doc.layer_order(), &[b]);
        assert!(doc.validate().is_ok());
    }

    #[test]
    fn test_observers_see_every_mutation() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let mut doc = Document::new();
        doc.subscribe(counter.clone());

        let id = doc.add_layer(paint_layer("A"));
        doc.update_layer(id, |layer| layer.visible = false).unwrap();
        doc.rename("Poster");
        doc.app_state.selection.push(id);
        doc.touch();

        assert_eq!(counter.0.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_order_must_be_permutation() {
        let mut doc = Document::new();
        let a = doc.add_layer(paint_layer("A"));
        doc.add_layer(paint_layer("B"));

        assert!(matches!(
            doc.set_layer_order(vec![a]),
            Err(DocumentError::OrderMismatch(_))
        ));
        assert!(matches!(
            doc.set_layer_order(vec![a, a]),
            Err(DocumentError::OrderMismatch(_))
        ));
    }

    #[test]
    fn test_validate_catches_dangling_clip() {
        let mut doc = Document::new();
        let mut layer = paint_layer("A");
        let ghost = Uuid::new_v4();
        layer.clipped_by = Some(ghost);
        doc.add_layer(layer);

        assert!(matches!(
            doc.validate(),
            Err(DocumentError::DanglingReference { field: "clippedBy", target, .. }) if target == ghost
        ));
    }

    #[test]
    fn test_remove_group_detaches_members() {
        let mut doc = Document::new();
        let group = doc.add_group(LayerGroup::new("Sketch"));
        let layer = doc.add_layer(paint_layer("A").in_group(group));

        doc.remove_group(group);

        assert_eq!(doc.layer(layer).unwrap().group_id, None);
        assert!(doc.validate().is_ok());
    }

    #[test]
    fn test_remove_layer_drops_every_reference() {
        let mut doc = Document::new();
        let base = doc.add_layer(paint_layer("Base"));
        let mut top = paint_layer("Top");
        top.clipped_by = Some(base);
        let top = doc.add_layer(top);
        let folder = doc.add_layer(Layer::new("Folder", LayerContent::group(vec![base, top])));
        let tone = doc.add_layer(Layer::new(
            "Tone",
            LayerContent::Adjustment {
                adjustment: AdjustmentKind::Levels,
                params: Default::default(),
                affected_layers: vec![base],
            },
        ));
        doc.app_state.selection = vec![base, top];
        let mut history = HistoryLog::default();
        history.record("Paint", vec![base]);
        doc.history = Some(history);

        doc.remove_layer(base);

        assert!(doc.validate().is_ok());
        assert_eq!(doc.layer(top).unwrap().clipped_by, None);
        assert!(matches!(
            &doc.layer(folder).unwrap().content,
            LayerContent::Group { children, .. } if children == &vec![top]
        ));
        assert!(matches!(
            &doc.layer(tone).unwrap().content,
            LayerContent::Adjustment { affected_layers, .. } if affected_layers.is_empty()
        ));
        assert_eq!(doc.app_state.selection, vec![top]);
        assert!(doc.history.as_ref().unwrap().entries[0].layer_ids.is_empty());
    }

    #[test]
    fn test_remove_group_clears_content_children() {
        let mut doc = Document::new();
        let outer = doc.add_group(LayerGroup::new("Outer"));
        let mut inner = LayerGroup::new("Inner");
        inner.parent_id = Some(outer);
        let inner = doc.add_group(inner);
        let folder = doc.add_layer(Layer::new("Folder", LayerContent::group(vec![inner])));
        doc.update_layer(folder, |layer| layer.group_id = Some(inner)).unwrap();

        doc.remove_group(inner);

        assert!(doc.validate().is_ok());
        let layer = doc.layer(folder).unwrap();
        assert_eq!(layer.group_id, None);
        assert!(matches!(&layer.content, LayerContent::Group { children, .. } if children.is_empty()));
    }

    #[test]
    fn test_clone_drops_observers() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let mut doc = Document::new();
        doc.subscribe(counter.clone());

        let mut copy = doc.clone();
        copy.add_layer(paint_layer("A"));

        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }
}
