//! Binary container for encoded projects.
//!
//! ```text
//! "ATLR"                      magic
//! major u16 LE, minor u16 LE  format version
//! header length u32 LE
//! header JSON                 fileType, version, compression, contentHash, manifest
//! payload                     optionally zlib-compressed:
//!     body length u64 LE, body JSON
//!     attachment count u32 LE, then per attachment:
//!         path length u32 LE, path, data length u64 LE, data
//! ```
//!
//! The content hash covers the uncompressed payload.

use super::manifest::Manifest;
use crate::assets::is_safe_relative_path;
use crate::format::{
    CURRENT_VERSION, Compression, DurableDocument, FILE_TYPE, FormatError, FormatResult,
    FormatVersion, MAGIC, migrate,
};
use crate::hash::ContentHash;
use flate2::Compression as Level;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Archive entry holding the encoded project inside a multi-file export.
pub const ARCHIVE_PROJECT_ENTRY: &str = "project.atlr";

/// Fixed prefix: magic, version, header length.
const PREFIX_LEN: usize = 4 + 2 + 2 + 4;

/// Encoding options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EncodeOptions {
    pub compression: Compression,
    /// Carry file-tier payloads inside the stream.
    pub embed_files: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            compression: Compression::Deflate,
            embed_files: true,
        }
    }
}

/// Header JSON of the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerHeader {
    file_type: String,
    version: FormatVersion,
    compression: Compression,
    content_hash: ContentHash,
    manifest: Manifest,
}

/// A decoded project stream.
#[derive(Debug, Clone)]
pub struct DecodedProject {
    /// The body, upgraded to the current format version.
    pub document: DurableDocument,
    /// Attached file-tier payloads keyed by relative path.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Version the body was written with.
    pub source_version: FormatVersion,
}

/// Encode a durable document and its attachments.
pub fn encode(
    document: &DurableDocument,
    files: &BTreeMap<String, Vec<u8>>,
    options: EncodeOptions,
) -> FormatResult<Vec<u8>> {
    let mut body_doc = document.clone();
    body_doc.header.compression = options.compression;
    body_doc.header.content_hash = None;
    let body = serde_json::to_vec(&body_doc)
        .map_err(|e| FormatError::Malformed(format!("body serialization failed: {e}")))?;

    let attachments: Vec<(&String, &Vec<u8>)> = if options.embed_files {
        files.iter().collect()
    } else {
        Vec::new()
    };

    let mut payload = Vec::with_capacity(
        12 + body.len() + attachments.iter().map(|(p, d)| 12 + p.len() + d.len()).sum::<usize>(),
    );
    payload.extend_from_slice(&(body.len() as u64).to_le_bytes());
    payload.extend_from_slice(&body);
    payload.extend_from_slice(&(attachments.len() as u32).to_le_bytes());
    for (path, data) in &attachments {
        payload.extend_from_slice(&(path.len() as u32).to_le_bytes());
        payload.extend_from_slice(path.as_bytes());
        payload.extend_from_slice(&(data.len() as u64).to_le_bytes());
        payload.extend_from_slice(data);
    }

    let content_hash = ContentHash::compute(&payload);
    let payload = match options.compression {
        Compression::None => payload,
        Compression::Deflate => deflate(&payload)?,
    };

    let header = ContainerHeader {
        file_type: FILE_TYPE.to_string(),
        version: CURRENT_VERSION,
        compression: options.compression,
        content_hash,
        manifest: Manifest::of(document),
    };
    let header = serde_json::to_vec(&header)
        .map_err(|e| FormatError::Malformed(format!("header serialization failed: {e}")))?;

    let mut out = Vec::with_capacity(PREFIX_LEN + header.len() + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&CURRENT_VERSION.major.to_le_bytes());
    out.extend_from_slice(&CURRENT_VERSION.minor.to_le_bytes());
    out.extend_from_slice(&(header.len() as u32).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&payload);

    log::debug!(
        "Encoded project '{}': {} bytes ({:?}, {} attachment(s))",
        document.name(),
        out.len(),
        options.compression,
        attachments.len()
    );
    Ok(out)
}

/// Decode a project stream.
///
/// Inflating the payload is tried first and the raw payload is the
/// fallback; the first candidate that parses and matches the content hash
/// wins.
pub fn decode(bytes: &[u8]) -> FormatResult<DecodedProject> {
    let (header, payload) = split(bytes)?;

    let inflated = inflate(payload);
    let inflated_err = match &inflated {
        Ok(data) => match read_payload(data, &header.content_hash) {
            Ok(decoded) => return finish(decoded),
            Err(err) => Some(err),
        },
        Err(_) => None,
    };

    let raw_err = match read_payload(payload, &header.content_hash) {
        Ok(decoded) => {
            if header.compression == Compression::Deflate {
                log::warn!("Payload marked as deflate was stored uncompressed");
            }
            return finish(decoded);
        }
        Err(err) => err,
    };

    let failure = match (inflated, inflated_err) {
        (_, Some(err @ FormatError::ChecksumMismatch { .. })) => err,
        (_, _) if matches!(raw_err, FormatError::ChecksumMismatch { .. }) => raw_err,
        (Err(decompress), _) => FormatError::DecompressionFailure {
            decompress: decompress.to_string(),
            parse: raw_err.to_string(),
        },
        (Ok(_), Some(err)) => err,
        (Ok(_), None) => raw_err,
    };
    log::warn!("Failed to decode project: {}", failure);
    Err(failure)
}

/// Read only the manifest from the container header.
pub fn read_manifest(bytes: &[u8]) -> FormatResult<Manifest> {
    Ok(split(bytes)?.0.manifest)
}

/// Decode a multi-file archive produced by a project export.
pub fn decode_archive(entries: &BTreeMap<String, Vec<u8>>) -> FormatResult<DecodedProject> {
    let project = entries.get(ARCHIVE_PROJECT_ENTRY).ok_or_else(|| {
        FormatError::InvalidFileFormat(format!("archive has no {ARCHIVE_PROJECT_ENTRY} entry"))
    })?;
    let mut decoded = decode(project)?;
    for (path, data) in entries {
        if path != ARCHIVE_PROJECT_ENTRY {
            decoded.files.entry(path.clone()).or_insert_with(|| data.clone());
        }
    }
    Ok(decoded)
}

/// Check the fixed prefix and parse the header. Returns the header and payload.
fn split(bytes: &[u8]) -> FormatResult<(ContainerHeader, &[u8])> {
    if bytes.len() < PREFIX_LEN || &bytes[0..4] != MAGIC {
        return Err(FormatError::InvalidFileFormat("not an Atelier project".to_string()));
    }
    let version = FormatVersion::new(
        u16::from_le_bytes([bytes[4], bytes[5]]),
        u16::from_le_bytes([bytes[6], bytes[7]]),
    );
    version.check_supported()?;

    let header_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let header_end = PREFIX_LEN
        .checked_add(header_len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| FormatError::Malformed("header runs past end of data".to_string()))?;

    let header: ContainerHeader = serde_json::from_slice(&bytes[PREFIX_LEN..header_end])
        .map_err(|e| FormatError::Malformed(format!("header: {e}")))?;
    if header.file_type != FILE_TYPE {
        return Err(FormatError::InvalidFileFormat(format!(
            "unexpected file type '{}'",
            header.file_type
        )));
    }
    Ok((header, &bytes[header_end..]))
}

struct RawPayload {
    body: Vec<u8>,
    files: BTreeMap<String, Vec<u8>>,
}

/// Parse payload framing, then check the content hash.
fn read_payload(data: &[u8], expected: &ContentHash) -> FormatResult<RawPayload> {
    let mut cursor = Cursor { data, pos: 0 };
    let body_len = cursor.len_u64("body")?;
    let body = cursor.take(body_len, "body")?.to_vec();

    let count = cursor.u32("attachment count")?;
    let mut files = BTreeMap::new();
    for _ in 0..count {
        let path_len = cursor.u32("path length")? as usize;
        let path = std::str::from_utf8(cursor.take(path_len, "path")?)
            .map_err(|_| FormatError::Malformed("attachment path is not UTF-8".to_string()))?
            .to_string();
        let data_len = cursor.len_u64("attachment")?;
        let data = cursor.take(data_len, "attachment")?.to_vec();
        files.insert(path, data);
    }
    if cursor.pos != data.len() {
        return Err(FormatError::Malformed(format!(
            "{} trailing bytes after payload",
            data.len() - cursor.pos
        )));
    }

    let actual = ContentHash::compute(data);
    if actual != *expected {
        return Err(FormatError::ChecksumMismatch {
            expected: expected.clone(),
            actual,
        });
    }
    Ok(RawPayload { body, files })
}

fn finish(raw: RawPayload) -> FormatResult<DecodedProject> {
    if let Some(path) = raw.files.keys().find(|path| !is_safe_relative_path(path)) {
        return Err(FormatError::Malformed(format!(
            "attachment path escapes the project: {path}"
        )));
    }
    let mut body: serde_json::Value = serde_json::from_slice(&raw.body)
        .map_err(|e| FormatError::Malformed(format!("body: {e}")))?;
    let source_version = migrate::upgrade(&mut body)?;
    let document: DurableDocument = serde_json::from_value(body)
        .map_err(|e| FormatError::Malformed(format!("body: {e}")))?;
    document.header.check()?;

    Ok(DecodedProject {
        document,
        files: raw.files,
        source_version,
    })
}

fn deflate(data: &[u8]) -> FormatResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Level::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| FormatError::Malformed(format!("compression failed: {e}")))
}

fn inflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize, what: &str) -> FormatResult<&'a [u8]> {
        let data = self.data;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| FormatError::Malformed(format!("{what} runs past end of payload")))?;
        let slice = &data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self, what: &str) -> FormatResult<u32> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn len_u64(&mut self, what: &str) -> FormatResult<usize> {
        let bytes = self.take(8, what)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        usize::try_from(u64::from_le_bytes(buf))
            .map_err(|_| FormatError::Malformed(format!("{what} length overflows")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FormatHeader, ProjectRecord};
    use crate::document::ProjectMetadata;
    use chrono::Utc;
    use uuid::Uuid;

    fn document(name: &str) -> DurableDocument {
        let now = Utc::now();
        DurableDocument {
            header: FormatHeader::current(),
            id: Uuid::new_v4(),
            created_at: now,
            modified_at: now,
            project: ProjectRecord {
                metadata: ProjectMetadata {
                    name: name.to_string(),
                    ..Default::default()
                },
                thumbnail: None,
            },
            layer_order: Vec::new(),
            layers: BTreeMap::new(),
            groups: BTreeMap::new(),
            assets: BTreeMap::new(),
            libraries: Default::default(),
            history: None,
            app_state: None,
        }
    }

    fn files() -> BTreeMap<String, Vec<u8>> {
        [("assets/bitmaps/a.png".to_string(), vec![7u8; 300])]
            .into_iter()
            .collect()
    }

    fn options(compression: Compression) -> EncodeOptions {
        EncodeOptions {
            compression,
            embed_files: true,
        }
    }

    #[test]
    fn test_round_trip_both_compressions() {
        let doc = document("Poster");
        for compression in [Compression::None, Compression::Deflate] {
            let bytes = encode(&doc, &files(), options(compression)).unwrap();
            assert_eq!(&bytes[0..4], MAGIC);

            let decoded = decode(&bytes).unwrap();
            assert_eq!(decoded.document.id, doc.id);
            assert_eq!(decoded.document.header.compression, compression);
            assert_eq!(decoded.files, files());
            assert_eq!(decoded.source_version, CURRENT_VERSION);
        }
    }

    #[test]
    fn test_embed_files_off() {
        let bytes = encode(
            &document("Poster"),
            &files(),
            EncodeOptions {
                compression: Compression::Deflate,
                embed_files: false,
            },
        )
        .unwrap();
        assert!(decode(&bytes).unwrap().files.is_empty());
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(
            decode(b"PK\x03\x04 not a project"),
            Err(FormatError::InvalidFileFormat(_))
        ));
    }

    #[test]
    fn test_foreign_major_version() {
        let mut bytes = encode(&document("Poster"), &files(), EncodeOptions::default()).unwrap();
        bytes[4..6].copy_from_slice(&2u16.to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(FormatError::UnsupportedVersion { .. })
        ));
    }

    /// Re-frame an encoded project after editing its container header.
    fn rewrite_header(bytes: &[u8], edit: impl FnOnce(&mut ContainerHeader)) -> Vec<u8> {
        let header_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let header_end = PREFIX_LEN + header_len;
        let mut header: ContainerHeader =
            serde_json::from_slice(&bytes[PREFIX_LEN..header_end]).unwrap();
        edit(&mut header);
        let header = serde_json::to_vec(&header).unwrap();

        let mut out = bytes[..8].to_vec();
        out.extend_from_slice(&(header.len() as u32).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&bytes[header_end..]);
        out
    }

    #[test]
    fn test_foreign_file_type() {
        let bytes = encode(&document("Poster"), &files(), EncodeOptions::default()).unwrap();
        let unchanged = rewrite_header(&bytes, |_| {});
        assert!(decode(&unchanged).is_ok());

        let foreign = rewrite_header(&bytes, |header| header.file_type = "sketch-board".to_string());
        assert_eq!(&foreign[0..4], MAGIC);
        assert!(matches!(
            decode(&foreign),
            Err(FormatError::InvalidFileFormat(message)) if message.contains("sketch-board")
        ));
    }

    #[test]
    fn test_escaping_attachment_path_is_rejected() {
        let files: BTreeMap<String, Vec<u8>> = [("../../../tmp/evil.bin".to_string(), vec![1u8; 8])]
            .into_iter()
            .collect();
        for compression in [Compression::None, Compression::Deflate] {
            let bytes = encode(&document("Poster"), &files, options(compression)).unwrap();
            assert!(matches!(
                decode(&bytes),
                Err(FormatError::Malformed(message)) if message.contains("evil.bin")
            ));
        }
    }

    #[test]
    fn test_tampered_payload_is_a_checksum_mismatch() {
        let mut bytes = encode(&document("Poster"), &files(), options(Compression::None)).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        assert!(matches!(
            decode(&bytes),
            Err(FormatError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupt_deflate_stream_reports_both_failures() {
        let mut bytes = encode(&document("Poster"), &files(), options(Compression::Deflate)).unwrap();
        let header_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let payload_start = PREFIX_LEN + header_len;
        let len = bytes.len();
        for byte in &mut bytes[payload_start + 2..len] {
            *byte = 0xAB;
        }

        match decode(&bytes) {
            Err(FormatError::DecompressionFailure { decompress, parse }) => {
                assert!(!decompress.is_empty());
                assert!(!parse.is_empty());
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_truncated_stream_is_rejected() {
        let bytes = encode(&document("Poster"), &files(), options(Compression::None)).unwrap();
        assert!(decode(&bytes[..bytes.len() - 10]).is_err());
        assert!(decode(&bytes[..PREFIX_LEN + 3]).is_err());
    }

    #[test]
    fn test_manifest_without_body() {
        let doc = document("Sketchbook");
        let mut bytes = encode(&doc, &files(), EncodeOptions::default()).unwrap();
        let len = bytes.len();
        bytes.truncate(len - 5);

        let manifest = read_manifest(&bytes).unwrap();
        assert_eq!(manifest.name, "Sketchbook");
        assert_eq!(manifest.id, doc.id);
        assert_eq!(manifest.layer_count, 0);
    }

    #[test]
    fn test_archive_entries_fill_in_files() {
        let doc = document("Poster");
        let project = encode(
            &doc,
            &files(),
            EncodeOptions {
                compression: Compression::Deflate,
                embed_files: false,
            },
        )
        .unwrap();

        let mut entries = files();
        entries.insert(ARCHIVE_PROJECT_ENTRY.to_string(), project);

        let decoded = decode_archive(&entries).unwrap();
        assert_eq!(decoded.files, files());
        assert!(decode_archive(&files()).is_err());
    }

    #[test]
    fn test_old_body_is_migrated() {
        let doc = document("Legacy");
        let mut body = serde_json::to_value(&doc).unwrap();
        body["header"]["version"] = serde_json::json!("1.1");
        body["swatches"] = serde_json::json!([]);
        body.as_object_mut().unwrap().remove("libraries");
        let body = serde_json::to_vec(&body).unwrap();

        let mut payload = Vec::new();
        payload.extend_from_slice(&(body.len() as u64).to_le_bytes());
        payload.extend_from_slice(&body);
        payload.extend_from_slice(&0u32.to_le_bytes());

        let header = ContainerHeader {
            file_type: FILE_TYPE.to_string(),
            version: FormatVersion::new(1, 1),
            compression: Compression::None,
            content_hash: ContentHash::compute(&payload),
            manifest: Manifest::of(&doc),
        };
        let header = serde_json::to_vec(&header).unwrap();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&payload);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.source_version, FormatVersion::new(1, 1));
        assert_eq!(decoded.document.header.version, CURRENT_VERSION);
        assert!(decoded.document.libraries.is_empty());
    }
}
