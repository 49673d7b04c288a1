//! Upgrades of older durable documents.
//!
//! Migration works on the untyped JSON body before it is parsed into
//! [`DurableDocument`](super::DurableDocument), one explicit step per minor
//! version. Each step rewrites the fields that changed and bumps the header
//! version, so a document is always parsed with the current schema.

use super::{CURRENT_VERSION, FormatError, FormatResult, FormatVersion};
use serde_json::{Map, Value, json};

/// Read the version recorded in a body's header.
pub fn body_version(body: &Value) -> FormatResult<FormatVersion> {
    let version = body
        .pointer("/header/version")
        .and_then(Value::as_str)
        .ok_or_else(|| FormatError::InvalidFileFormat("missing header.version".to_string()))?;
    version.parse()
}

/// Bring a body up to the current minor version in place.
///
/// Returns the version the body was written with. Newer minors are left
/// untouched; a different major is rejected.
pub fn upgrade(body: &mut Value) -> FormatResult<FormatVersion> {
    let original = body_version(body)?;
    original.check_supported()?;

    let mut version = original;
    while version < CURRENT_VERSION {
        version = match version.minor {
            0 => upgrade_1_0(body)?,
            1 => upgrade_1_1(body)?,
            _ => {
                return Err(FormatError::Malformed(format!(
                    "no upgrade path from {version}"
                )));
            }
        };
        set_version(body, version);
        log::debug!("Upgraded document body to format {}", version);
    }

    if original < CURRENT_VERSION {
        log::info!("Migrated document from format {} to {}", original, CURRENT_VERSION);
    }
    Ok(original)
}

/// 1.0 to 1.1: layer effects and stroke pressure became part of the schema.
fn upgrade_1_0(body: &mut Value) -> FormatResult<FormatVersion> {
    if let Some(layers) = body.get_mut("layers").and_then(Value::as_object_mut) {
        for layer in layers.values_mut() {
            let Some(layer) = layer.as_object_mut() else {
                return Err(FormatError::Malformed("layer is not an object".to_string()));
            };
            layer.entry("effects").or_insert_with(|| json!([]));

            let strokes = layer
                .get_mut("content")
                .and_then(|content| content.get_mut("strokes"))
                .and_then(Value::as_array_mut);
            for stroke in strokes.into_iter().flatten() {
                let points = stroke.get_mut("points").and_then(Value::as_array_mut);
                for point in points.into_iter().flatten() {
                    if let Some(point) = point.as_object_mut() {
                        point.entry("pressure").or_insert_with(|| json!(1.0));
                    }
                }
            }
        }
    }
    Ok(FormatVersion::new(1, 1))
}

/// 1.1 to 1.2: the top-level swatch list moved into the libraries block,
/// which also gained gradients and patterns.
fn upgrade_1_1(body: &mut Value) -> FormatResult<FormatVersion> {
    let Some(root) = body.as_object_mut() else {
        return Err(FormatError::Malformed("document body is not an object".to_string()));
    };

    let swatches = root.remove("swatches").unwrap_or_else(|| json!([]));
    let libraries = root
        .entry("libraries")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(libraries) = libraries.as_object_mut() else {
        return Err(FormatError::Malformed("libraries is not an object".to_string()));
    };

    libraries.entry("colors").or_insert(swatches);
    libraries.entry("gradients").or_insert_with(|| json!([]));
    libraries.entry("patterns").or_insert_with(|| json!([]));
    Ok(FormatVersion::new(1, 2))
}

fn set_version(body: &mut Value, version: FormatVersion) {
    if let Some(header) = body.get_mut("header").and_then(Value::as_object_mut) {
        header.insert("version".to_string(), json!(version.to_string()));
    }
}
