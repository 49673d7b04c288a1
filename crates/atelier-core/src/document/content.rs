//! Layer content variants.

use super::layer::{LayerId, LayerKind};
use super::style::{LayerEffect, Rgba8, default_opacity};
use crate::raster::SurfaceRef;
use kurbo::{Point, Rect};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The content of a layer. Exactly one variant, matching the layer kind.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerContent {
    Paint {
        canvas: SurfaceRef,
        strokes: Vec<Stroke>,
    },
    Text {
        elements: Vec<TextElement>,
    },
    Image {
        elements: Vec<ImageElement>,
    },
    /// Raised "puff" paint driven by displacement height maps.
    Puff {
        elements: Vec<PuffElement>,
    },
    Group {
        children: Vec<LayerId>,
        pass_through: bool,
    },
    Adjustment {
        adjustment: AdjustmentKind,
        params: BTreeMap<String, f64>,
        affected_layers: Vec<LayerId>,
    },
}

impl LayerContent {
    pub fn paint(canvas: impl Into<SurfaceRef>) -> Self {
        LayerContent::Paint {
            canvas: canvas.into(),
            strokes: Vec::new(),
        }
    }

    pub fn group(children: Vec<LayerId>) -> Self {
        LayerContent::Group {
            children,
            pass_through: true,
        }
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            LayerContent::Paint { .. } => LayerKind::Paint,
            LayerContent::Text { .. } => LayerKind::Text,
            LayerContent::Image { .. } => LayerKind::Image,
            LayerContent::Puff { .. } => LayerKind::Puff,
            LayerContent::Group { .. } => LayerKind::Group,
            LayerContent::Adjustment { .. } => LayerKind::Adjustment,
        }
    }

    /// Whether the content carries bitmap surfaces.
    pub fn has_bitmaps(&self) -> bool {
        match self {
            LayerContent::Paint { .. } => true,
            LayerContent::Image { elements } => !elements.is_empty(),
            LayerContent::Puff { elements } => !elements.is_empty(),
            _ => false,
        }
    }
}

/// One sampled point of a brush stroke.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrokePoint {
    pub x: f64,
    pub y: f64,
    /// Pen pressure in `[0, 1]`. Older files without it load as full pressure.
    #[serde(default = "full_pressure")]
    pub pressure: f32,
    #[serde(default)]
    pub tilt_x: f32,
    #[serde(default)]
    pub tilt_y: f32,
    /// Milliseconds since the stroke started.
    #[serde(default)]
    pub time_ms: u32,
}

fn full_pressure() -> f32 {
    1.0
}

impl StrokePoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            pressure: 1.0,
            tilt_x: 0.0,
            tilt_y: 0.0,
            time_ms: 0,
        }
    }

    pub fn with_pressure(mut self, pressure: f32) -> Self {
        self.pressure = pressure;
        self
    }
}

/// A recorded brush stroke on a paint layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stroke {
    pub id: Uuid,
    pub tool: String,
    pub color: Rgba8,
    pub size: f32,
    #[serde(default = "default_opacity")]
    pub opacity: f32,
    #[serde(default = "default_hardness")]
    pub hardness: f32,
    #[serde(default = "default_spacing")]
    pub spacing: f32,
    #[serde(default)]
    pub points: Vec<StrokePoint>,
}

fn default_hardness() -> f32 {
    0.8
}

fn default_spacing() -> f32 {
    0.1
}

impl Stroke {
    pub fn new(tool: impl Into<String>, color: Rgba8, size: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool: tool.into(),
            color,
            size,
            opacity: 1.0,
            hardness: default_hardness(),
            spacing: default_spacing(),
            points: Vec::new(),
        }
    }

    pub fn with_points(mut self, points: Vec<StrokePoint>) -> Self {
        self.points = points;
        self
    }
}

/// Horizontal text alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
    Justify,
}

/// Font and spacing settings of a text element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typography {
    pub font_family: String,
    pub font_size: f64,
    #[serde(default = "default_weight")]
    pub font_weight: u16,
    #[serde(default)]
    pub italic: bool,
    #[serde(default)]
    pub letter_spacing: f64,
    #[serde(default = "default_line_height")]
    pub line_height: f64,
    #[serde(default)]
    pub align: TextAlign,
}

fn default_weight() -> u16 {
    400
}

fn default_line_height() -> f64 {
    1.2
}

impl Default for Typography {
    fn default() -> Self {
        Self {
            font_family: "Noto Sans".to_string(),
            font_size: 24.0,
            font_weight: default_weight(),
            italic: false,
            letter_spacing: 0.0,
            line_height: default_line_height(),
            align: TextAlign::Left,
        }
    }
}

/// Gradient stop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientStop {
    pub offset: f32,
    pub color: Rgba8,
}

/// Fill of a text element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Fill {
    None,
    Solid { color: Rgba8 },
    Linear { angle: f64, stops: Vec<GradientStop> },
}

impl Default for Fill {
    fn default() -> Self {
        Fill::Solid {
            color: Rgba8::black(),
        }
    }
}

/// Outline of a text element.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TextStroke {
    pub color: Rgba8,
    pub width: f64,
}

/// A block of text on a text layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextElement {
    pub id: Uuid,
    pub text: String,
    pub position: Point,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub typography: Typography,
    #[serde(default)]
    pub fill: Fill,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke: Option<TextStroke>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effects: Vec<LayerEffect>,
}

impl TextElement {
    pub fn new(text: impl Into<String>, position: Point) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            position,
            rotation: 0.0,
            typography: Typography::default(),
            fill: Fill::default(),
            stroke: None,
            effects: Vec::new(),
        }
    }
}

/// Normalized source rectangle within an image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UvRect {
    pub u0: f32,
    pub v0: f32,
    pub u1: f32,
    pub v1: f32,
}

impl Default for UvRect {
    fn default() -> Self {
        Self {
            u0: 0.0,
            v0: 0.0,
            u1: 1.0,
            v1: 1.0,
        }
    }
}

/// Non-destructive filter parameters of an image element.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageFilters {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub hue: f32,
    pub blur: f32,
}

/// An embedded raster image placed on an image layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageElement {
    pub id: Uuid,
    pub source: SurfaceRef,
    pub uv: UvRect,
    /// Placement on the canvas in pixels.
    pub placement: Rect,
    pub rotation: f64,
    pub filters: ImageFilters,
}

impl ImageElement {
    pub fn new(source: impl Into<SurfaceRef>, placement: Rect) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            uv: UvRect::default(),
            placement,
            rotation: 0.0,
            filters: ImageFilters::default(),
        }
    }
}

/// Height falloff curve of a puff element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Falloff {
    #[default]
    Linear,
    Smooth,
    Sharp,
    Plateau,
}

/// A displacement element on a puff layer.
#[derive(Debug, Clone, PartialEq)]
pub struct PuffElement {
    pub id: Uuid,
    pub height_map: SurfaceRef,
    pub bounds: Rect,
    pub height: f32,
    pub softness: f32,
    pub falloff: Falloff,
}

impl PuffElement {
    pub fn new(height_map: impl Into<SurfaceRef>, bounds: Rect) -> Self {
        Self {
            id: Uuid::new_v4(),
            height_map: height_map.into(),
            bounds,
            height: 1.0,
            softness: 0.5,
            falloff: Falloff::default(),
        }
    }
}

/// Adjustment layer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdjustmentKind {
    BrightnessContrast,
    HueSaturation,
    Levels,
    Curves,
    ColorBalance,
    Invert,
    Threshold,
}
