//! PNG encoding of surfaces.

use crate::compose::flatten_document;
use atelier_core::document::Document;
use atelier_core::raster::{RasterError, RasterResult, Rasterizer, Surface};

/// Lossless PNG rasterizer.
///
/// Encodes 8-bit RGBA. Decoding accepts any PNG and expands it to RGBA8.
#[derive(Debug, Default, Clone, Copy)]
pub struct PngRasterizer;

impl PngRasterizer {
    pub fn new() -> Self {
        Self
    }
}

/// Encode RGBA pixel data to PNG bytes.
fn encode_png(rgba_data: &[u8], width: u32, height: u32) -> RasterResult<Vec<u8>> {
    let mut png_data = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut png_data, width, height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);

        let mut writer = encoder
            .write_header()
            .map_err(|e| RasterError::Encode(format!("PNG header: {}", e)))?;
        writer
            .write_image_data(rgba_data)
            .map_err(|e| RasterError::Encode(format!("PNG data: {}", e)))?;
        writer
            .finish()
            .map_err(|e| RasterError::Encode(format!("PNG trailer: {}", e)))?;
    }
    Ok(png_data)
}

fn decode_png(bytes: &[u8]) -> RasterResult<Surface> {
    let mut decoder = png::Decoder::new(bytes);
    decoder.set_transformations(png::Transformations::normalize_to_color8());
    let mut reader = decoder
        .read_info()
        .map_err(|e| RasterError::Decode(format!("PNG header: {}", e)))?;
    let (width, height) = reader.info().size();
    if Surface::byte_len(width, height).is_none() {
        return Err(RasterError::Decode(format!(
            "PNG of {}x{} is too large",
            width, height
        )));
    }
    let mut buf = vec![0; reader.output_buffer_size()];
    let info = reader
        .next_frame(&mut buf)
        .map_err(|e| RasterError::Decode(format!("PNG data: {}", e)))?;
    buf.truncate(info.buffer_size());

    let pixels = match info.color_type {
        png::ColorType::Rgba => buf,
        png::ColorType::Rgb => buf
            .chunks_exact(3)
            .flat_map(|p| [p[0], p[1], p[2], 255])
            .collect(),
        png::ColorType::GrayscaleAlpha => buf
            .chunks_exact(2)
            .flat_map(|p| [p[0], p[0], p[0], p[1]])
            .collect(),
        png::ColorType::Grayscale => buf.iter().flat_map(|&v| [v, v, v, 255]).collect(),
        png::ColorType::Indexed => {
            return Err(RasterError::Decode(
                "indexed PNG was not expanded".to_string(),
            ));
        }
    };
    Surface::from_pixels(info.width, info.height, pixels)
        .map_err(|e| RasterError::Decode(e.to_string()))
}

impl Rasterizer for PngRasterizer {
    fn encode_to_bytes(&self, surface: &Surface) -> RasterResult<Vec<u8>> {
        surface.check().map_err(|e| RasterError::Encode(e.to_string()))?;
        encode_png(&surface.pixels, surface.width, surface.height)
    }

    fn decode_to_surface(&self, bytes: &[u8]) -> RasterResult<Surface> {
        decode_png(bytes)
    }

    fn flatten(&self, document: &Document) -> RasterResult<Vec<u8>> {
        let surface = flatten_document(document)?;
        let png_data = encode_png(&surface.pixels, surface.width, surface.height)?;
        log::info!(
            "Flattened '{}' to {}x{} PNG ({} bytes)",
            document.name(),
            surface.width,
            surface.height,
            png_data.len()
        );
        Ok(png_data)
    }

    fn mime_type(&self) -> &'static str {
        "image/png"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::document::{Layer, LayerContent};
    use atelier_core::project::{Export, ExportKind, ProjectFileManager};
    use std::sync::Arc;

    fn gradient(width: u32, height: u32) -> Surface {
        let mut surface = Surface::new(width, height);
        for y in 0..height {
            for x in 0..width {
                surface.set_pixel(x, y, [(x * 16) as u8, (y * 16) as u8, 7, ((x + y) as u8).wrapping_mul(9)]);
            }
        }
        surface
    }

    #[test]
    fn test_png_is_lossless() {
        let surface = gradient(13, 9);
        let bytes = PngRasterizer.encode_to_bytes(&surface).unwrap();

        assert_eq!(&bytes[1..4], b"PNG");
        assert_eq!(PngRasterizer.decode_to_surface(&bytes).unwrap(), surface);
    }

    #[test]
    fn test_grayscale_png_expands_to_rgba() {
        let mut bytes = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut bytes, 2, 1);
            encoder.set_color(png::ColorType::Grayscale);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(&[0, 200]).unwrap();
        }

        let surface = PngRasterizer.decode_to_surface(&bytes).unwrap();
        assert_eq!(surface.pixel(0, 0), Some([0, 0, 0, 255]));
        assert_eq!(surface.pixel(1, 0), Some([200, 200, 200, 255]));
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(matches!(
            PngRasterizer.decode_to_surface(b"not a png"),
            Err(RasterError::Decode(_))
        ));
    }

    #[test]
    fn test_project_round_trip_through_png() {
        let mut doc = Document::with_canvas("Poster", 16, 16);
        doc.add_layer(Layer::new("Paint", LayerContent::paint(gradient(16, 16))));

        let mut manager = ProjectFileManager::new(Arc::new(PngRasterizer));
        let (_, bytes) = manager.save_encoded(&doc).unwrap();

        let mut other = ProjectFileManager::new(Arc::new(PngRasterizer));
        let loaded = other.load_bytes(&bytes).unwrap();
        assert!(loaded.layer_equivalent(&doc));
    }

    #[test]
    fn test_flattened_export_is_png() {
        let mut doc = Document::with_canvas("Poster", 4, 4);
        doc.add_layer(Layer::new(
            "Paint",
            LayerContent::paint(Surface::filled(4, 4, [0, 0, 255, 255])),
        ));

        let mut manager = ProjectFileManager::new(Arc::new(PngRasterizer));
        let Export::Image { mime_type, bytes } =
            manager.export(&doc, ExportKind::FlattenedImage).unwrap()
        else {
            panic!("expected an image export");
        };
        assert_eq!(mime_type, "image/png");
        let flat = PngRasterizer.decode_to_surface(&bytes).unwrap();
        assert_eq!(flat.pixel(2, 2), Some([0, 0, 255, 255]));
    }
}
