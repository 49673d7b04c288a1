//! Atelier Render Library
//!
//! PNG-backed [`Rasterizer`](atelier_core::raster::Rasterizer) for Atelier
//! documents, with flatten-to-image export.

mod compose;
mod png_rasterizer;

pub use compose::flatten_document;
pub use png_rasterizer::PngRasterizer;
