//! Color libraries, edit history and application state.

use super::content::GradientStop;
use super::layer::LayerId;
use super::style::Rgba8;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named color swatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Swatch {
    pub id: Uuid,
    pub name: String,
    pub color: Rgba8,
}

impl Swatch {
    pub fn new(name: impl Into<String>, color: Rgba8) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            color,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GradientKind {
    #[default]
    Linear,
    Radial,
    Angular,
}

/// A saved gradient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gradient {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub kind: GradientKind,
    pub stops: Vec<GradientStop>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Checker,
    Dots,
    Stripes,
    Crosshatch,
}

/// A procedural fill pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: Uuid,
    pub name: String,
    pub kind: PatternKind,
    #[serde(default = "unit")]
    pub scale: f64,
    pub foreground: Rgba8,
    pub background: Rgba8,
}

fn unit() -> f64 {
    1.0
}

/// Color, gradient and pattern libraries of a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Libraries {
    #[serde(default)]
    pub colors: Vec<Swatch>,
    #[serde(default)]
    pub gradients: Vec<Gradient>,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
}

impl Libraries {
    pub fn is_empty(&self) -> bool {
        self.colors.is_empty() && self.gradients.is_empty() && self.patterns.is_empty()
    }
}

/// One labelled step of the edit journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub label: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub layer_ids: Vec<LayerId>,
}

/// Journal of edit labels with the current undo position.
///
/// This is what the history panel shows; pixel-level undo data is not kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryLog {
    pub entries: Vec<HistoryEntry>,
    pub cursor: usize,
}

/// Maximum number of journal entries kept.
const MAX_HISTORY_ENTRIES: usize = 200;

impl HistoryLog {
    /// Record an edit, discarding any redo tail past the cursor.
    pub fn record(&mut self, label: impl Into<String>, layer_ids: Vec<LayerId>) {
        self.entries.truncate(self.cursor);
        self.entries.push(HistoryEntry {
            id: Uuid::new_v4(),
            label: label.into(),
            timestamp: Utc::now(),
            layer_ids,
        });
        if self.entries.len() > MAX_HISTORY_ENTRIES {
            self.entries.remove(0);
        }
        self.cursor = self.entries.len();
    }
}

/// Viewport position and zoom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub zoom: f64,
    pub pan_x: f64,
    pub pan_y: f64,
    #[serde(default)]
    pub rotation: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            pan_x: 0.0,
            pan_y: 0.0,
            rotation: 0.0,
        }
    }
}

/// Placement of a UI panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelState {
    pub id: String,
    pub visible: bool,
    #[serde(default)]
    pub docked: bool,
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default)]
    pub width: f32,
    #[serde(default)]
    pub height: f32,
}

/// Editor state carried with a document for continuity across sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    #[serde(default)]
    pub selection: Vec<LayerId>,
    #[serde(default)]
    pub viewport: Viewport,
    #[serde(default = "default_tool")]
    pub active_tool: String,
    #[serde(default)]
    pub panels: Vec<PanelState>,
}

fn default_tool() -> String {
    "brush".to_string()
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            selection: Vec::new(),
            viewport: Viewport::default(),
            active_tool: default_tool(),
            panels: Vec::new(),
        }
    }
}
