//! Bitmap surfaces and the rasterizer abstraction.
//!
//! The persistence engine never touches pixels itself. Bitmaps live in
//! [`SurfaceRef`] handles shared with the rendering engine, and every
//! conversion between a surface and bytes goes through a [`Rasterizer`].

use crate::document::Document;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Rasterizer errors.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("Surface lock poisoned")]
    Poisoned,
    #[error("Surface is malformed: {0}")]
    Malformed(String),
    #[error("Encode failed: {0}")]
    Encode(String),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Operation not supported by this rasterizer: {0}")]
    Unsupported(&'static str),
}

/// Result type for rasterizer operations.
pub type RasterResult<T> = Result<T, RasterError>;

/// A straight-alpha RGBA8 bitmap.
#[derive(Clone, PartialEq, Eq)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
    /// Row-major RGBA8 pixels, `width * height * 4` bytes.
    pub pixels: Vec<u8>,
}

impl Surface {
    /// Byte length of a `width` x `height` RGBA8 buffer, `None` if it does
    /// not fit in memory.
    pub fn byte_len(width: u32, height: u32) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(4)
    }

    /// Create a transparent surface.
    ///
    /// Dimensions too large to address leave the buffer empty, which
    /// [`Surface::check`] rejects.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; Self::byte_len(width, height).unwrap_or(0)],
        }
    }

    /// Create a surface filled with one color.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let len = Self::byte_len(width, height).unwrap_or(0);
        Self {
            width,
            height,
            pixels: rgba.iter().copied().cycle().take(len).collect(),
        }
    }

    /// Wrap existing pixel data, checking its length.
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<u8>) -> RasterResult<Self> {
        let surface = Self { width, height, pixels };
        surface.check()?;
        Ok(surface)
    }

    /// Expected pixel buffer length in bytes.
    pub fn expected_len(&self) -> Option<usize> {
        Self::byte_len(self.width, self.height)
    }

    /// Verify the pixel buffer matches the declared dimensions.
    pub fn check(&self) -> RasterResult<()> {
        let Some(expected) = self.expected_len() else {
            return Err(RasterError::Malformed(format!(
                "{}x{} surface is too large",
                self.width, self.height
            )));
        };
        if self.pixels.len() != expected {
            return Err(RasterError::Malformed(format!(
                "{}x{} surface carries {} bytes, expected {}",
                self.width,
                self.height,
                self.pixels.len(),
                expected
            )));
        }
        Ok(())
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        (y as usize)
            .checked_mul(self.width as usize)?
            .checked_add(x as usize)?
            .checked_mul(4)
    }

    /// Read one pixel.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let i = self.offset(x, y)?;
        let p = self.pixels.get(i..)?.get(..4)?;
        Some([p[0], p[1], p[2], p[3]])
    }

    /// Write one pixel. Out-of-bounds writes are ignored.
    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        let Some(i) = self.offset(x, y) else {
            return;
        };
        if let Some(p) = self.pixels.get_mut(i..).and_then(|rest| rest.get_mut(..4)) {
            p.copy_from_slice(&rgba);
        }
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Shared handle to a surface that the rendering engine may keep drawing into.
///
/// Encoding always happens inside [`SurfaceRef::with_snapshot`], which holds
/// the read lock so no writer can tear the bitmap mid-encode.
#[derive(Clone)]
pub struct SurfaceRef(Arc<RwLock<Surface>>);

impl SurfaceRef {
    pub fn new(surface: Surface) -> Self {
        Self(Arc::new(RwLock::new(surface)))
    }

    /// Run `f` against a stable view of the surface.
    pub fn with_snapshot<T>(&self, f: impl FnOnce(&Surface) -> T) -> RasterResult<T> {
        let guard = self.0.read().map_err(|_| RasterError::Poisoned)?;
        Ok(f(&guard))
    }

    /// Take an owned copy of the pixels.
    pub fn snapshot(&self) -> RasterResult<Surface> {
        self.with_snapshot(Surface::clone)
    }

    pub fn read(&self) -> RasterResult<RwLockReadGuard<'_, Surface>> {
        self.0.read().map_err(|_| RasterError::Poisoned)
    }

    pub fn write(&self) -> RasterResult<RwLockWriteGuard<'_, Surface>> {
        self.0.write().map_err(|_| RasterError::Poisoned)
    }

    /// Dimensions, if the surface is readable.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.with_snapshot(|s| (s.width, s.height)).ok()
    }

    /// Whether two handles point at the same allocation.
    pub fn ptr_eq(&self, other: &SurfaceRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Surface> for SurfaceRef {
    fn from(surface: Surface) -> Self {
        Self::new(surface)
    }
}

impl PartialEq for SurfaceRef {
    /// Surfaces compare by pixel content; an unreadable surface equals nothing.
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return self.0.read().is_ok();
        }
        match (self.0.read(), other.0.read()) {
            (Ok(a), Ok(b)) => *a == *b,
            _ => false,
        }
    }
}

impl fmt::Debug for SurfaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.read() {
            Ok(surface) => surface.fmt(f),
            Err(_) => f.write_str("Surface(<poisoned>)"),
        }
    }
}

/// Conversion between surfaces and encoded bitmaps, plus document flattening.
///
/// This is the seam to the rendering engine. Implementations must be lossless
/// for `encode_to_bytes` followed by `decode_to_surface`.
pub trait Rasterizer: Send + Sync {
    /// Encode a surface to bytes.
    fn encode_to_bytes(&self, surface: &Surface) -> RasterResult<Vec<u8>>;

    /// Decode bytes produced by `encode_to_bytes`.
    fn decode_to_surface(&self, bytes: &[u8]) -> RasterResult<Surface>;

    /// Composite the visible document into one encoded image.
    fn flatten(&self, document: &Document) -> RasterResult<Vec<u8>>;

    /// MIME type of the encoded bytes.
    fn mime_type(&self) -> &'static str;
}

/// Magic prefix of the raw surface encoding.
const RAW_MAGIC: &[u8; 4] = b"RGBA";

/// Lossless raw encoding: magic, width and height (u32 LE), then pixels.
///
/// Used for headless tooling and tests. It cannot flatten.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawRasterizer;

impl Rasterizer for RawRasterizer {
    fn encode_to_bytes(&self, surface: &Surface) -> RasterResult<Vec<u8>> {
        surface.check().map_err(|e| RasterError::Encode(e.to_string()))?;
        let mut out = Vec::with_capacity(12 + surface.pixels.len());
        out.extend_from_slice(RAW_MAGIC);
        out.extend_from_slice(&surface.width.to_le_bytes());
        out.extend_from_slice(&surface.height.to_le_bytes());
        out.extend_from_slice(&surface.pixels);
        Ok(out)
    }

    fn decode_to_surface(&self, bytes: &[u8]) -> RasterResult<Surface> {
        if bytes.len() < 12 || &bytes[0..4] != RAW_MAGIC {
            return Err(RasterError::Decode("not a raw RGBA bitmap".to_string()));
        }
        let width = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let height = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        Surface::from_pixels(width, height, bytes[12..].to_vec())
            .map_err(|e| RasterError::Decode(e.to_string()))
    }

    fn flatten(&self, _document: &Document) -> RasterResult<Vec<u8>> {
        Err(RasterError::Unsupported("flatten"))
    }

    fn mime_type(&self) -> &'static str {
        "image/x-atelier-rgba"
    }
}
