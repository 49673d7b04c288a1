//! Asset registry records.

use crate::document::LayerId;
use crate::hash::ContentHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Unique identifier for assets.
pub type AssetId = Uuid;

/// What an asset is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetKind {
    /// Paint layer canvas.
    Bitmap,
    Mask,
    Thumbnail,
    /// Puff displacement map.
    HeightMap,
    /// Embedded image placed on an image layer.
    Image,
}

impl AssetKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            AssetKind::Bitmap => "bitmaps",
            AssetKind::Mask => "masks",
            AssetKind::Thumbnail => "thumbnails",
            AssetKind::HeightMap => "height-maps",
            AssetKind::Image => "images",
        }
    }
}

/// Encoded image format of an asset payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    WebP,
    /// Uncompressed RGBA with a small header.
    Raw,
}

impl ImageFormat {
    /// Get MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::WebP => "image/webp",
            ImageFormat::Raw => "image/x-atelier-rgba",
        }
    }

    /// File extension used for file-tier payloads.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::WebP => "webp",
            ImageFormat::Raw => "rgba",
        }
    }

    /// Detect format from a MIME type.
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        match mime.to_lowercase().as_str() {
            "image/png" => Some(ImageFormat::Png),
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            "image/webp" => Some(ImageFormat::WebP),
            "image/x-atelier-rgba" => Some(ImageFormat::Raw),
            _ => None,
        }
    }

    /// Sniff the format from a payload's leading bytes.
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        const SIGNATURES: [(&[u8], ImageFormat); 3] = [
            (b"\x89PNG\r\n\x1a\n", ImageFormat::Png),
            (b"\xff\xd8\xff", ImageFormat::Jpeg),
            (b"RGBA", ImageFormat::Raw),
        ];
        if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Some(ImageFormat::WebP);
        }
        SIGNATURES
            .iter()
            .find(|(magic, _)| data.starts_with(magic))
            .map(|&(_, format)| format)
    }
}

/// Optional pixel metadata of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageFormat>,
}

/// Storage tier of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTier {
    Inline,
    File,
    Url,
}

/// Where an asset's bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AssetStorage {
    /// Embedded in the document, base64 in JSON.
    Inline {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Stored next to the document under a relative path.
    File { path: String },
    /// Hosted elsewhere.
    Url { url: String },
}

impl AssetStorage {
    pub fn tier(&self) -> StorageTier {
        match self {
            AssetStorage::Inline { .. } => StorageTier::Inline,
            AssetStorage::File { .. } => StorageTier::File,
            AssetStorage::Url { .. } => StorageTier::Url,
        }
    }
}

/// A registered binary payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: AssetId,
    pub name: String,
    pub kind: AssetKind,
    pub mime_type: String,
    /// Payload size in bytes.
    pub size: u64,
    pub storage: AssetStorage,
    pub checksum: ContentHash,
    #[serde(default)]
    pub used_by_layers: BTreeSet<LayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AssetMetadata>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
}

impl Asset {
    pub fn tier(&self) -> StorageTier {
        self.storage.tier()
    }

    pub fn is_referenced(&self) -> bool {
        !self.used_by_layers.is_empty()
    }
}

/// Serde adapter storing bytes as standard base64 text.
pub(crate) mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_detection() {
        assert_eq!(
            ImageFormat::from_magic_bytes(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"),
            Some(ImageFormat::Png)
        );
        assert_eq!(ImageFormat::from_magic_bytes(b"\x89PNG"), None);
        assert_eq!(ImageFormat::from_magic_bytes(b"RIFF\0\0\0\0WEBPVP8 "), Some(ImageFormat::WebP));
        assert_eq!(ImageFormat::from_magic_bytes(b"RGBA\0\0\0\0"), Some(ImageFormat::Raw));
        assert_eq!(ImageFormat::from_magic_bytes(b"abc"), None);
        assert_eq!(ImageFormat::from_mime_type("IMAGE/PNG"), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::from_mime_type("application/zip"), None);
    }

    #[test]
    fn test_storage_tag_is_type() {
        let file = serde_json::to_value(AssetStorage::File { path: "assets/a.png".into() }).unwrap();
        assert_eq!(file["type"], "file");

        let inline = serde_json::to_value(AssetStorage::Inline { data: vec![1, 2, 3] }).unwrap();
        assert_eq!(inline["type"], "inline");
        assert_eq!(inline["data"], "AQID");

        let back: AssetStorage = serde_json::from_value(inline).unwrap();
        assert_eq!(back, AssetStorage::Inline { data: vec![1, 2, 3] });
    }
}
