//! Project save, load and export.
//!
//! [`ProjectFileManager`] ties the serializer, the asset store and the binary
//! codec together. It owns the asset store of the open project, so assets
//! stay deduplicated across successive saves of the same document.

mod codec;
mod manifest;

pub use codec::{
    ARCHIVE_PROJECT_ENTRY, DecodedProject, EncodeOptions, decode, decode_archive, encode,
    read_manifest,
};
pub use manifest::Manifest;

use crate::assets::{AssetError, AssetStorage, AssetStore, AssetStoreConfig};
use crate::document::{Document, ProjectMetadata};
use crate::format::{Compression, DurableDocument, FormatError, PrunedReference};
use crate::raster::{RasterError, Rasterizer};
use crate::serializer::{
    DeserializeError, DetailLevel, DocumentSerializer, SerializeOptions, SkippedLayer,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Project errors.
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Deserialize(#[from] DeserializeError),
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error("Flatten failed: {0}")]
    Raster(#[from] RasterError),
}

/// Result type for project operations.
pub type ProjectResult<T> = Result<T, ProjectError>;

/// Project save settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectConfig {
    pub compression: Compression,
    pub embed_files: bool,
    pub detail: DetailLevel,
    pub include_thumbnails: bool,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            compression: Compression::Deflate,
            embed_files: true,
            detail: DetailLevel::Detailed,
            include_thumbnails: true,
        }
    }
}

impl ProjectConfig {
    pub fn serialize_options(&self) -> SerializeOptions {
        SerializeOptions {
            detail: self.detail,
            include_thumbnails: self.include_thumbnails,
        }
    }

    pub fn encode_options(&self) -> EncodeOptions {
        EncodeOptions {
            compression: self.compression,
            embed_files: self.embed_files,
        }
    }
}

/// Result of a save.
#[derive(Debug, Clone)]
pub struct SaveReport {
    pub document: DurableDocument,
    /// Layers that could not be written.
    pub skipped: Vec<SkippedLayer>,
    /// Cross references dropped because their target was missing.
    pub pruned: Vec<PrunedReference>,
}

/// Export targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// The visible document composited into one image.
    FlattenedImage,
    /// The project stream plus file-tier assets as separate entries.
    Archive,
    /// One self-contained project stream.
    Encoded,
}

/// Output of an export.
#[derive(Debug, Clone, PartialEq)]
pub enum Export {
    Image { mime_type: String, bytes: Vec<u8> },
    Archive(BTreeMap<String, Vec<u8>>),
    Encoded(Vec<u8>),
}

/// Saves, loads and exports one open project.
pub struct ProjectFileManager {
    serializer: DocumentSerializer,
    assets: AssetStore,
    metadata: Option<ProjectMetadata>,
    config: ProjectConfig,
}

impl ProjectFileManager {
    pub fn new(rasterizer: Arc<dyn Rasterizer>) -> Self {
        Self::with_config(rasterizer, ProjectConfig::default(), AssetStoreConfig::default())
    }

    pub fn with_config(
        rasterizer: Arc<dyn Rasterizer>,
        config: ProjectConfig,
        asset_config: AssetStoreConfig,
    ) -> Self {
        Self {
            serializer: DocumentSerializer::new(rasterizer),
            assets: AssetStore::with_config(asset_config),
            metadata: None,
            config,
        }
    }

    pub fn assets(&self) -> &AssetStore {
        &self.assets
    }

    /// Metadata of the open project, if it has been saved or loaded.
    pub fn metadata(&self) -> Option<&ProjectMetadata> {
        self.metadata.as_ref()
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    /// Serialize the document with the configured options.
    pub fn save(&mut self, document: &Document) -> ProjectResult<SaveReport> {
        self.save_with(document, self.config.serialize_options())
    }

    /// Serialize the document into a durable form with its asset registry.
    ///
    /// Assets no longer used by the document are dropped from the store.
    pub fn save_with(
        &mut self,
        document: &Document,
        options: SerializeOptions,
    ) -> ProjectResult<SaveReport> {
        match &mut self.metadata {
            Some(metadata) => *metadata = document.metadata.clone(),
            None => {
                log::info!("Creating project metadata for '{}'", document.name());
                self.metadata = Some(document.metadata.clone());
            }
        }

        self.assets.clear_links();
        let outcome = self.serializer.serialize(document, &mut self.assets, options);
        let mut durable = outcome.document;

        let referenced = durable.referenced_assets();
        self.assets.retain(&referenced);
        durable.assets = self
            .assets
            .registry()
            .into_iter()
            .filter(|(id, _)| referenced.contains(id))
            .collect();
        durable.modified_at = Utc::now();

        if outcome.skipped.is_empty() {
            log::info!(
                "Saved '{}': {} layer(s), {} asset(s)",
                durable.name(),
                durable.layer_count(),
                durable.assets.len()
            );
        } else {
            log::warn!(
                "Saved '{}' with {} layer(s) skipped",
                durable.name(),
                outcome.skipped.len()
            );
        }

        Ok(SaveReport {
            document: durable,
            skipped: outcome.skipped,
            pruned: outcome.pruned,
        })
    }

    /// Encode a durable document, attaching its file-tier payloads when asked.
    pub fn encode(&self, document: &DurableDocument, options: EncodeOptions) -> ProjectResult<Vec<u8>> {
        let files = if options.embed_files {
            self.files_for(document)
        } else {
            BTreeMap::new()
        };
        Ok(codec::encode(document, &files, options)?)
    }

    /// Save and encode in one step with the configured options.
    pub fn save_encoded(&mut self, document: &Document) -> ProjectResult<(SaveReport, Vec<u8>)> {
        let report = self.save(document)?;
        let bytes = self.encode(&report.document, self.config.encode_options())?;
        Ok((report, bytes))
    }

    /// Rebuild a document from a decoded project.
    ///
    /// The asset store and metadata are only replaced once the whole
    /// document has been rebuilt, so a failed load leaves the manager as it
    /// was.
    pub fn load(&mut self, decoded: DecodedProject) -> ProjectResult<Document> {
        let store = AssetStore::from_registry(
            self.assets.config().clone(),
            decoded.document.assets.clone(),
            decoded.files,
        )?;
        let document = self.serializer.deserialize(&decoded.document, &store)?;

        self.assets = store;
        self.metadata = Some(document.metadata.clone());
        log::info!(
            "Loaded '{}' ({} layer(s), format {})",
            document.name(),
            document.layer_count(),
            decoded.source_version
        );
        Ok(document)
    }

    /// Decode and load an encoded project stream.
    pub fn load_bytes(&mut self, bytes: &[u8]) -> ProjectResult<Document> {
        let decoded = codec::decode(bytes)?;
        self.load(decoded)
    }

    pub fn manifest(&self, document: &DurableDocument) -> Manifest {
        Manifest::of(document)
    }

    /// Export the document.
    pub fn export(&mut self, document: &Document, kind: ExportKind) -> ProjectResult<Export> {
        match kind {
            ExportKind::FlattenedImage => {
                let rasterizer = self.serializer.rasterizer();
                let bytes = rasterizer.flatten(document)?;
                Ok(Export::Image {
                    mime_type: rasterizer.mime_type().to_string(),
                    bytes,
                })
            }
            ExportKind::Archive => {
                let report = self.save(document)?;
                let project = self.encode(
                    &report.document,
                    EncodeOptions {
                        compression: self.config.compression,
                        embed_files: false,
                    },
                )?;
                let mut entries = self.files_for(&report.document);
                entries.insert(ARCHIVE_PROJECT_ENTRY.to_string(), project);
                Ok(Export::Archive(entries))
            }
            ExportKind::Encoded => {
                let report = self.save(document)?;
                let bytes = self.encode(
                    &report.document,
                    EncodeOptions {
                        compression: self.config.compression,
                        embed_files: true,
                    },
                )?;
                Ok(Export::Encoded(bytes))
            }
        }
    }

    /// File-tier payloads referenced by a durable document's registry.
    fn files_for(&self, document: &DurableDocument) -> BTreeMap<String, Vec<u8>> {
        let mut files = self.assets.export_all();
        files.retain(|path, _| {
            document.assets.values().any(|asset| {
                matches!(&asset.storage, AssetStorage::File { path: p } if p == path)
            })
        });
        files
    }
}
