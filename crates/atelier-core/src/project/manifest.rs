//! Project manifests: what a project browser needs without loading the body.

use crate::assets::{AssetStorage, base64_bytes};
use crate::format::{DurableDocument, FormatVersion};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Summary of a saved project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: Uuid,
    pub name: String,
    /// Encoded preview bytes when the thumbnail is stored inline.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "optional_bytes")]
    pub thumbnail: Option<Vec<u8>>,
    pub modified_at: DateTime<Utc>,
    /// Sum of all asset payload sizes in bytes.
    pub total_size: u64,
    pub layer_count: usize,
    pub version: FormatVersion,
}

impl Manifest {
    /// Summarize a durable document.
    pub fn of(document: &DurableDocument) -> Self {
        let thumbnail = document
            .project
            .thumbnail
            .and_then(|id| document.assets.get(&id))
            .and_then(|asset| match &asset.storage {
                AssetStorage::Inline { data } => Some(data.clone()),
                _ => None,
            });

        Self {
            id: document.id,
            name: document.name().to_string(),
            thumbnail,
            modified_at: document.modified_at,
            total_size: document.total_asset_size(),
            layer_count: document.layer_count(),
            version: document.header.version,
        }
    }
}

mod optional_bytes {
    use super::base64_bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(data) => base64_bytes::serialize(data, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "base64_bytes")] Vec<u8>);

        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(data)| data))
    }
}
