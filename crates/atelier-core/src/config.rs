//! Engine configuration.

use crate::assets::AssetStoreConfig;
use crate::project::ProjectConfig;
use crate::storage::AutoSaveConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },
    #[error("Invalid configuration in {path}: {message}")]
    Parse { path: String, message: String },
}

/// Settings for every component of the engine.
///
/// Missing sections and fields take their defaults, so `{}` is a valid
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub assets: AssetStoreConfig,
    pub project: ProjectConfig,
    pub autosave: AutoSaveConfig,
}

impl EngineConfig {
    /// Load a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config = serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Serialize as pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Compression;
    use crate::serializer::DetailLevel;
    use tempfile::tempdir;

    #[test]
    fn test_empty_object_is_default() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.autosave.interval_secs, 30);
        assert_eq!(config.autosave.max_backups, 5);
        assert_eq!(config.assets.inline_threshold, 100 * 1024);
        assert!(config.assets.dedup);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("atelier.json");
        fs::write(
            &path,
            r#"{
                "assets": { "inlineThreshold": 4096 },
                "project": { "compression": "none", "detail": "basic" },
                "autosave": { "intervalSecs": 10 }
            }"#,
        )
        .unwrap();

        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.assets.inline_threshold, 4096);
        assert!(config.assets.dedup);
        assert_eq!(config.project.compression, Compression::None);
        assert_eq!(config.project.detail, DetailLevel::Basic);
        assert!(config.project.embed_files);
        assert_eq!(config.autosave.interval_secs, 10);
        assert!(config.autosave.enabled);
    }

    #[test]
    fn test_round_trip_through_json() {
        let mut config = EngineConfig::default();
        config.autosave.enabled = false;
        let json = config.to_json().unwrap();
        assert_eq!(serde_json::from_str::<EngineConfig>(&json).unwrap(), config);
    }

    #[test]
    fn test_errors_name_the_file() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        let err = EngineConfig::from_json_file(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("missing.json"));

        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            EngineConfig::from_json_file(&bad),
            Err(ConfigError::Parse { .. })
        ));
    }
}
