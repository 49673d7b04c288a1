//! Atelier Core Library
//!
//! Persistence and asset management for layered Atelier documents: the live
//! document model, content-addressed asset storage, the durable project
//! format and crash-safe autosave.

pub mod assets;
pub mod config;
pub mod document;
pub mod format;
pub mod hash;
pub mod project;
pub mod raster;
pub mod serializer;
pub mod storage;

pub use assets::{Asset, AssetError, AssetId, AssetStore, AssetStoreConfig};
pub use config::{ConfigError, EngineConfig};
pub use document::{Document, DocumentChange, DocumentError, DocumentObserver, Layer, LayerId};
pub use format::{CURRENT_VERSION, DurableDocument, FormatError, FormatVersion, PrunedReference};
pub use hash::ContentHash;
pub use project::{Manifest, ProjectConfig, ProjectError, ProjectFileManager};
pub use raster::{RasterError, Rasterizer, RawRasterizer, Surface, SurfaceRef};
pub use serializer::{DetailLevel, DocumentSerializer, SerializeOptions, SkippedLayer};
pub use storage::{
    AutoSaveConfig, AutoSaveManager, FileStore, KeyValueStore, MemoryStore, RecoveryPoint,
    StorageError,
};
