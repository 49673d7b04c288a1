//! Flattening a document into one surface.
//!
//! Raster content only: paint canvases and image elements are composited
//! source-over in layer order onto the canvas background. Text, puff and
//! adjustment layers need the full engine and are left out of the export.

use atelier_core::document::{BlendMode, Document, GroupId, Layer, LayerContent};
use atelier_core::raster::{RasterResult, Surface};
use kurbo::{Affine, Point, Rect, Vec2};

/// Composite the visible raster content of `document`.
pub fn flatten_document(document: &Document) -> RasterResult<Surface> {
    let canvas = &document.metadata.canvas;
    let bg = canvas.background;
    let mut out = Surface::filled(canvas.width, canvas.height, [bg.r, bg.g, bg.b, bg.a]);
    out.check()?;

    for layer in document.layers_ordered() {
        if !layer.visible {
            continue;
        }
        let Some(group_opacity) = group_opacity(document, layer.group_id) else {
            continue;
        };
        let opacity = (layer.opacity * group_opacity).clamp(0.0, 1.0);
        if opacity <= 0.0 {
            continue;
        }
        if layer.blend_mode != BlendMode::Normal {
            log::debug!(
                "Layer '{}' uses {:?}; flattening as normal",
                layer.name,
                layer.blend_mode
            );
        }
        draw_layer(&mut out, layer, opacity)?;
    }
    Ok(out)
}

/// Combined opacity of a layer's group chain, `None` if any group is hidden.
fn group_opacity(document: &Document, mut group: Option<GroupId>) -> Option<f32> {
    let mut opacity = 1.0;
    let mut remaining = document.groups().count();
    while let Some(id) = group {
        let Some(g) = document.group(id) else {
            break;
        };
        if !g.visible {
            return None;
        }
        opacity *= g.opacity;
        group = g.parent_id;
        if remaining == 0 {
            log::warn!("Group nesting of '{}' loops; stopping", g.name);
            break;
        }
        remaining -= 1;
    }
    Some(opacity)
}

fn draw_layer(out: &mut Surface, layer: &Layer, opacity: f32) -> RasterResult<()> {
    let layer_affine = layer.transform.to_affine();
    match &layer.content {
        LayerContent::Paint { canvas, .. } => canvas.with_snapshot(|source| {
            let bounds = Rect::new(0.0, 0.0, source.width as f64, source.height as f64);
            draw_surface(out, source, bounds, layer_affine, opacity);
        }),
        LayerContent::Image { elements } => {
            for element in elements {
                element.source.with_snapshot(|source| {
                    let (w, h) = (source.width as f64, source.height as f64);
                    let uv = element.uv;
                    let src = Rect::new(
                        uv.u0 as f64 * w,
                        uv.v0 as f64 * h,
                        uv.u1 as f64 * w,
                        uv.v1 as f64 * h,
                    );
                    if src.width() <= 0.0 || src.height() <= 0.0 {
                        return;
                    }
                    let placement = element.placement;
                    let to_canvas = layer_affine
                        * Affine::rotate_about(element.rotation, placement.center())
                        * Affine::translate(placement.origin().to_vec2())
                        * Affine::scale_non_uniform(
                            placement.width() / src.width(),
                            placement.height() / src.height(),
                        )
                        * Affine::translate(-src.origin().to_vec2());
                    draw_surface(out, source, src, to_canvas, opacity);
                })?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Draw the `src` region of `source`, mapped onto `out` by `to_canvas`.
///
/// Nearest-neighbour sampling at destination pixel centers.
fn draw_surface(out: &mut Surface, source: &Surface, src: Rect, to_canvas: Affine, opacity: f32) {
    if to_canvas.determinant().abs() < f64::EPSILON {
        return;
    }
    let to_source = to_canvas.inverse();
    let target = Rect::new(0.0, 0.0, out.width as f64, out.height as f64);
    let area = to_canvas.transform_rect_bbox(src).intersect(target);
    if area.width() <= 0.0 || area.height() <= 0.0 {
        return;
    }

    let (x0, y0) = (area.x0.floor() as u32, area.y0.floor() as u32);
    let (x1, y1) = (area.x1.ceil() as u32, area.y1.ceil() as u32);
    for y in y0..y1.min(out.height) {
        for x in x0..x1.min(out.width) {
            let p = to_source * (Point::new(x as f64, y as f64) + Vec2::new(0.5, 0.5));
            if p.x < src.x0 || p.y < src.y0 || p.x >= src.x1 || p.y >= src.y1 {
                continue;
            }
            let Some(color) = source.pixel(p.x as u32, p.y as u32) else {
                continue;
            };
            if let Some(under) = out.pixel(x, y) {
                out.set_pixel(x, y, source_over(color, under, opacity));
            }
        }
    }
}

/// Straight-alpha source-over.
fn source_over(src: [u8; 4], dst: [u8; 4], opacity: f32) -> [u8; 4] {
    let sa = src[3] as f32 / 255.0 * opacity;
    let da = dst[3] as f32 / 255.0;
    let oa = sa + da * (1.0 - sa);
    if oa <= 0.0 {
        return [0, 0, 0, 0];
    }
    let mut out = [0u8; 4];
    for i in 0..3 {
        let c = (src[i] as f32 * sa + dst[i] as f32 * da * (1.0 - sa)) / oa;
        out[i] = c.round().clamp(0.0, 255.0) as u8;
    }
    out[3] = (oa * 255.0).round() as u8;
    out
}
