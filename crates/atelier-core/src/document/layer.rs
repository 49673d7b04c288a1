//! Layers, groups and their per-layer properties.

use super::content::LayerContent;
use super::style::{BlendMode, LayerEffect, default_opacity, default_true};
use crate::raster::SurfaceRef;
use kurbo::{Affine, Point, Rect, Vec2};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for layers.
pub type LayerId = Uuid;

/// Unique identifier for layer groups.
pub type GroupId = Uuid;

/// Layer kind tag, always derived from the layer's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Paint,
    Text,
    Image,
    Puff,
    Group,
    Adjustment,
}

impl LayerKind {
    pub fn name(self) -> &'static str {
        match self {
            LayerKind::Paint => "paint",
            LayerKind::Text => "text",
            LayerKind::Image => "image",
            LayerKind::Puff => "puff",
            LayerKind::Group => "group",
            LayerKind::Adjustment => "adjustment",
        }
    }
}

/// Every channel of a layer's placement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerTransform {
    pub translate: Vec2,
    #[serde(default = "unit_scale")]
    pub scale: Vec2,
    /// Rotation in radians around `anchor`.
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub skew: Vec2,
    #[serde(default)]
    pub anchor: Point,
    #[serde(default)]
    pub flip_x: bool,
    #[serde(default)]
    pub flip_y: bool,
}

fn unit_scale() -> Vec2 {
    Vec2::new(1.0, 1.0)
}

impl Default for LayerTransform {
    fn default() -> Self {
        Self {
            translate: Vec2::ZERO,
            scale: unit_scale(),
            rotation: 0.0,
            skew: Vec2::ZERO,
            anchor: Point::ZERO,
            flip_x: false,
            flip_y: false,
        }
    }
}

impl LayerTransform {
    pub fn translated(x: f64, y: f64) -> Self {
        Self {
            translate: Vec2::new(x, y),
            ..Default::default()
        }
    }

    /// Compose into one affine: translate * anchor * rotate * skew * scale * -anchor.
    pub fn to_affine(&self) -> Affine {
        let sx = if self.flip_x { -self.scale.x } else { self.scale.x };
        let sy = if self.flip_y { -self.scale.y } else { self.scale.y };
        let skew = Affine::new([1.0, self.skew.y.tan(), self.skew.x.tan(), 1.0, 0.0, 0.0]);
        Affine::translate(self.translate)
            * Affine::translate(self.anchor.to_vec2())
            * Affine::rotate(self.rotation)
            * skew
            * Affine::scale_non_uniform(sx, sy)
            * Affine::translate(-self.anchor.to_vec2())
    }
}

/// Per-layer lock flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LockFlags {
    #[serde(default)]
    pub position: bool,
    #[serde(default)]
    pub pixels: bool,
    #[serde(default)]
    pub alpha: bool,
}

/// A bitmap mask attached to a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub surface: SurfaceRef,
    pub enabled: bool,
    pub inverted: bool,
    /// Mask density in `[0, 1]`.
    pub density: f32,
    /// Feather radius in pixels.
    pub feather: f32,
}

impl Mask {
    pub fn new(surface: SurfaceRef) -> Self {
        Self {
            surface,
            enabled: true,
            inverted: false,
            density: 1.0,
            feather: 0.0,
        }
    }
}

/// Which mask slot a mask occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MaskSlot {
    LayerMask,
    ClipMask,
    VectorMask,
}

impl MaskSlot {
    pub fn name(self) -> &'static str {
        match self {
            MaskSlot::LayerMask => "layer mask",
            MaskSlot::ClipMask => "clip mask",
            MaskSlot::VectorMask => "vector mask",
        }
    }
}

/// The three optional mask slots of a layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerMasks {
    pub layer_mask: Option<Mask>,
    pub clip_mask: Option<Mask>,
    /// Rasterized vector mask.
    pub vector_mask: Option<Mask>,
}

impl LayerMasks {
    pub fn get(&self, slot: MaskSlot) -> Option<&Mask> {
        match slot {
            MaskSlot::LayerMask => self.layer_mask.as_ref(),
            MaskSlot::ClipMask => self.clip_mask.as_ref(),
            MaskSlot::VectorMask => self.vector_mask.as_ref(),
        }
    }

    pub fn set(&mut self, slot: MaskSlot, mask: Option<Mask>) {
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

/// A document layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub(crate) id: LayerId,
    pub name: String,
    pub visible: bool,
    /// Opacity in `[0, 1]`.
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub transform: LayerTransform,
    pub bounds: Rect,
    pub locks: LockFlags,
    pub effects: Vec<LayerEffect>,
    pub masks: LayerMasks,
    pub thumbnail: Option<SurfaceRef>,
    pub group_id: Option<GroupId>,
    pub clipped_by: Option<LayerId>,
    pub content: LayerContent,
}

impl Layer {
    /// Create a visible, fully opaque layer with fresh id.
    pub fn new(name: impl Into<String>, content: LayerContent) -> Self {
        Self::with_id(Uuid::new_v4(), name, content)
    }

    /// Create a layer with a specific ID.
    pub fn with_id(id: LayerId, name: impl Into<String>, content: LayerContent) -> Self {
        Self {
            id,
            name: name.into(),
            visible: true,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            transform: LayerTransform::default(),
            bounds: Rect::ZERO,
            locks: LockFlags::default(),
            effects: Vec::new(),
            masks: LayerMasks::default(),
            thumbnail: None,
            group_id: None,
            clipped_by: None,
            content,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn kind(&self) -> LayerKind {
        self.content.kind()
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity.clamp(0.0, 1.0);
        self
    }

    pub fn with_bounds(mut self, bounds: Rect) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_mask(mut self, slot: MaskSlot, mask: Mask) -> Self {
        self.masks.set(slot, Some(mask));
        self
    }

    pub fn with_effect(mut self, effect: LayerEffect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn in_group(mut self, group: GroupId) -> Self {
        self.group_id = Some(group);
        self
    }

    /// Every layer or group id this layer points at, with the field name.
    pub fn references(&self) -> Vec<(&'static str, Uuid)> {
        let mut refs = Vec::new();
        if let Some(group) = self.group_id {
            refs.push(("groupId", group));
        }
        if let Some(clip) = self.clipped_by {
            refs.push(("clippedBy", clip));
        }
        match &self.content {
            LayerContent::Group { children, .. } => {
                refs.extend(children.iter().map(|&c| ("children", c)));
            }
            LayerContent::Adjustment { affected_layers, .. } => {
                refs.extend(affected_layers.iter().map(|&l| ("affectedLayers", l)));
            }
            _ => {}
        }
        refs
    }

    /// Drop every reference to a removed layer or group.
    pub(crate) fn forget(&mut self, target: Uuid) {
        if self.group_id == Some(target) {
            self.group_id = None;
        }
        if self.clipped_by == Some(target) {
            self.clipped_by = None;
        }
        match &mut self.content {
            LayerContent::Group { children, .. } => children.retain(|&c| c != target),
            LayerContent::Adjustment { affected_layers, .. } => {
                affected_layers.retain(|&l| l != target)
            }
            _ => {}
        }
    }
}

/// A named group of layers in the layer panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerGroup {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub children: Vec<LayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<GroupId>,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub collapsed: bool,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
    #[serde(default)]
    pub blend_mode: BlendMode,
}

impl LayerGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            children: Vec::new(),
            parent_id: None,
            visible: true,
            collapsed: false,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
        }
    }
}
