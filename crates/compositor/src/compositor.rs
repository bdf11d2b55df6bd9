//! Software compositor: blends layer snapshots into an RGBA output buffer.

use crate::buffer::{GraphicBuffer, PixelBuffer};
use crate::layer::LayerSnapshot;
use common::color::Color;
use common::geometry::{PixelRect, Point, Transform};
use rayon::prelude::*;

/// The compositor blends a stack of layers, back to front, into one buffer.
#[derive(Clone, Debug)]
pub struct Compositor {
    /// Color of pixels no layer covers.
    clear_color: Color,
}

/// Compositor statistics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompositorStats {
    /// Number of layers that contributed to the pass.
    pub layers_composited: u32,
    /// Destination pixels written by a layer.
    pub pixels_blended: u64,
    /// Composition time in milliseconds.
    pub composition_time_ms: f32,
}

/// Output of one composite pass.
#[derive(Clone, Debug)]
pub struct Composition {
    /// Pixel `(0, 0)` is the top-left corner of the composited region.
    pub buffer: PixelBuffer,
    pub stats: CompositorStats,
}

/// A layer reduced to what the blending loop needs.
struct PreparedLayer<'a> {
    buffer: &'a GraphicBuffer,
    source: PixelRect,
    inverse: Transform,
    dest: PixelRect,
    alpha: f32,
    opaque: bool,
}

impl Compositor {
    pub fn new(clear_color: Color) -> Self {
        Self {
            clear_color: clear_color.opaque(),
        }
    }

    pub fn clear_color(&self) -> Color {
        self.clear_color
    }

    /// Composite `layers` (already in back-to-front order) over `region`,
    /// given in display coordinates.
    pub fn composite(&self, layers: &[LayerSnapshot], region: PixelRect) -> Composition {
        let start = std::time::Instant::now();

        let mut buffer = PixelBuffer::new(region.width, region.height);
        buffer.fill(self.clear_color);

        let prepared: Vec<PreparedLayer<'_>> = layers
            .iter()
            .filter_map(|layer| Self::prepare(layer, region))
            .collect();

        let row_bytes = buffer.row_bytes();
        let pixels_blended = if prepared.is_empty() || row_bytes == 0 {
            0
        } else {
            buffer
                .data
                .par_chunks_mut(row_bytes)
                .enumerate()
                .map(|(row, line)| {
                    let y = region.y + row as i32;
                    prepared
                        .iter()
                        .filter(|layer| y >= layer.dest.y && y < layer.dest.bottom())
                        .map(|layer| Self::blend_row(layer, line, y, region.x))
                        .sum::<u64>()
                })
                .sum()
        };

        let stats = CompositorStats {
            layers_composited: prepared.len() as u32,
            pixels_blended,
            composition_time_ms: start.elapsed().as_secs_f32() * 1000.0,
        };
        tracing::trace!(
            "composited {} layers into {}x{} at ({}, {}): {} pixels in {:.3}ms",
            stats.layers_composited,
            region.width,
            region.height,
            region.x,
            region.y,
            stats.pixels_blended,
            stats.composition_time_ms
        );

        Composition { buffer, stats }
    }

    /// Returns `None` for layers that cannot draw anything inside `region`.
    fn prepare(layer: &LayerSnapshot, region: PixelRect) -> Option<PreparedLayer<'_>> {
        if !layer.is_visible() || layer.alpha <= 0.0 {
            return None;
        }
        let buffer = layer.buffer.as_deref()?;
        let source = layer.source_rect()?;

        let transform = layer.transform();
        // Singular matrices collapse the layer to nothing.
        let inverse = transform.inverse()?;

        let mut dest = transform
            .transform_rect(source.to_rect())
            .to_enclosing_pixel_rect()?;
        if let Some(final_crop) = &layer.final_crop {
            dest = dest.intersection(final_crop)?;
        }
        dest = dest.intersection(&region)?;

        Some(PreparedLayer {
            buffer,
            source,
            inverse,
            dest,
            alpha: layer.alpha,
            opaque: layer.is_opaque(),
        })
    }

    fn blend_row(layer: &PreparedLayer<'_>, line: &mut [u8], y: i32, origin_x: i32) -> u64 {
        let mut blended = 0;
        let centre_y = y as f32 + 0.5;

        for x in layer.dest.x..layer.dest.right() {
            let src = layer.inverse.transform_point(Point::new(x as f32 + 0.5, centre_y));
            let sx = src.x.floor() as i32;
            let sy = src.y.floor() as i32;
            if !layer.source.contains(sx, sy) {
                continue;
            }

            let texel = layer.buffer.texel(sx as u32, sy as u32);
            let texel_alpha = if layer.opaque { 255 } else { texel.a };
            let coverage = Color::coverage(texel_alpha, layer.alpha);
            if coverage == 0 {
                continue;
            }

            let offset = (x - origin_x) as usize * 4;
            let dst = &mut line[offset..offset + 4];
            let background = Color::rgba(dst[0], dst[1], dst[2], dst[3]);
            dst.copy_from_slice(&texel.blend_with_coverage(background, coverage).to_bytes());
            blended += 1;
        }

        blended
    }
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new(Color::BLACK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PixelFormat;
    use crate::layer::{LayerFlags, LayerId, LayerMatrix};
    use common::geometry::Size;
    use slotmap::SlotMap;
    use std::sync::Arc;

    const BG: Color = Color::rgb(63, 63, 195);
    const FG: Color = Color::rgb(195, 63, 63);

    fn snapshot(ids: &mut SlotMap<LayerId, ()>, width: u32, height: u32, color: Color) -> LayerSnapshot {
        let buffer = GraphicBuffer::filled(width, height, PixelFormat::Rgba8888, color).unwrap();
        LayerSnapshot {
            id: ids.insert(()),
            sequence: 0,
            z: 0,
            layer_stack: 0,
            position: Point::ZERO,
            size: Size::new(width, height),
            crop: None,
            final_crop: None,
            matrix: LayerMatrix::IDENTITY,
            alpha: 1.0,
            flags: LayerFlags::empty(),
            buffer: Some(Arc::new(buffer)),
        }
    }

    fn scene() -> (SlotMap<LayerId, ()>, LayerSnapshot, LayerSnapshot) {
        let mut ids = SlotMap::with_key();
        let bg = snapshot(&mut ids, 32, 32, BG);
        let mut fg = snapshot(&mut ids, 8, 8, FG);
        fg.position = Point::new(8.0, 8.0);
        (ids, bg, fg)
    }

    fn pixel(composition: &Composition, x: u32, y: u32) -> Color {
        composition.buffer.get_pixel(x, y).unwrap()
    }

    #[test]
    fn test_empty_stack_is_clear_color() {
        let compositor = Compositor::new(Color::rgba(1, 2, 3, 0));
        let composition = compositor.composite(&[], PixelRect::new(0, 0, 4, 4));
        assert_eq!(pixel(&composition, 3, 3), Color::rgb(1, 2, 3));
        assert_eq!(composition.stats.layers_composited, 0);
    }

    #[test]
    fn test_back_to_front() {
        let (_ids, bg, fg) = scene();
        let composition = Compositor::default().composite(&[bg, fg], PixelRect::new(0, 0, 32, 32));

        assert_eq!(pixel(&composition, 7, 7), BG);
        assert_eq!(pixel(&composition, 8, 8), FG);
        assert_eq!(pixel(&composition, 15, 15), FG);
        assert_eq!(pixel(&composition, 16, 16), BG);
        assert_eq!(composition.stats.layers_composited, 2);
        assert_eq!(composition.stats.pixels_blended, 32 * 32 + 8 * 8);
    }

    #[test]
    fn test_layer_alpha_blend() {
        let (_ids, bg, mut fg) = scene();
        fg.alpha = 0.75;
        let composition = Compositor::default().composite(&[bg, fg], PixelRect::new(0, 0, 32, 32));
        assert_eq!(pixel(&composition, 10, 10), Color::rgb(162, 63, 96));
    }

    #[test]
    fn test_hidden_and_transparent_layers_skipped() {
        let (_ids, bg, mut fg) = scene();
        fg.flags = LayerFlags::HIDDEN;
        let mut faded = fg.clone();
        faded.flags = LayerFlags::empty();
        faded.alpha = 0.0;

        let composition = Compositor::default().composite(&[bg, fg, faded], PixelRect::new(0, 0, 32, 32));
        assert_eq!(pixel(&composition, 10, 10), BG);
        assert_eq!(composition.stats.layers_composited, 1);
    }

    #[test]
    fn test_crop_does_not_move_content() {
        let (_ids, bg, mut fg) = scene();
        fg.crop = PixelRect::from_ltrb(2, 2, 6, 6);
        let composition = Compositor::default().composite(&[bg, fg], PixelRect::new(0, 0, 32, 32));

        assert_eq!(pixel(&composition, 9, 9), BG);
        assert_eq!(pixel(&composition, 10, 10), FG);
        assert_eq!(pixel(&composition, 13, 13), FG);
        assert_eq!(pixel(&composition, 14, 14), BG);
    }

    #[test]
    fn test_final_crop_in_screen_space() {
        let (_ids, bg, mut fg) = scene();
        fg.final_crop = PixelRect::from_ltrb(0, 0, 12, 12);
        let composition = Compositor::default().composite(&[bg, fg], PixelRect::new(0, 0, 32, 32));

        assert_eq!(pixel(&composition, 11, 11), FG);
        assert_eq!(pixel(&composition, 12, 12), BG);
    }

    #[test]
    fn test_texel_alpha_and_opaque_flag() {
        let mut ids = SlotMap::with_key();
        let bg = snapshot(&mut ids, 4, 4, BG);
        let mut fg = snapshot(&mut ids, 4, 4, Color::rgba(195, 63, 63, 0));

        let composition = Compositor::default().composite(&[bg.clone(), fg.clone()], PixelRect::new(0, 0, 4, 4));
        assert_eq!(pixel(&composition, 1, 1), BG);

        fg.flags = LayerFlags::OPAQUE;
        let composition = Compositor::default().composite(&[bg, fg], PixelRect::new(0, 0, 4, 4));
        assert_eq!(pixel(&composition, 1, 1), FG);
    }

    #[test]
    fn test_rotation_samples_pixel_centres() {
        let mut ids = SlotMap::with_key();
        let mut data = Vec::new();
        data.extend_from_slice(&Color::rgb(255, 0, 0).to_bytes());
        data.extend_from_slice(&Color::rgb(0, 255, 0).to_bytes());
        let buffer = GraphicBuffer::new(data, 2, 1, 2, PixelFormat::Rgba8888).unwrap();

        let mut layer = snapshot(&mut ids, 2, 1, Color::WHITE);
        layer.buffer = Some(Arc::new(buffer));
        layer.position = Point::new(2.0, 0.0);
        // Quarter turn: x' = -y + 2, y' = x.
        layer.matrix = LayerMatrix::new(0.0, 1.0, -1.0, 0.0);

        let composition = Compositor::default().composite(&[layer], PixelRect::new(0, 0, 3, 3));
        assert_eq!(pixel(&composition, 1, 0), Color::rgb(255, 0, 0));
        assert_eq!(pixel(&composition, 1, 1), Color::rgb(0, 255, 0));
        assert_eq!(pixel(&composition, 0, 0), Color::BLACK);
        assert_eq!(pixel(&composition, 2, 0), Color::BLACK);
    }

    #[test]
    fn test_crop_rotates_but_final_crop_stays_in_screen_space() {
        let (_ids, bg, mut fg) = scene();
        // Quarter turn at (16, 8): texel (cx, cy) lands on pixel (15 - cy, 8 + cx).
        fg.position = Point::new(16.0, 8.0);
        fg.matrix = LayerMatrix::new(0.0, 1.0, -1.0, 0.0);
        // Left half of the buffer becomes the top half on screen.
        fg.crop = PixelRect::from_ltrb(0, 0, 4, 8);
        fg.final_crop = PixelRect::from_ltrb(12, 0, 32, 32);
        let composition = Compositor::default().composite(&[bg, fg], PixelRect::new(0, 0, 32, 32));

        assert_eq!(pixel(&composition, 13, 9), FG);
        assert_eq!(pixel(&composition, 12, 11), FG);
        assert_eq!(pixel(&composition, 15, 8), FG);
        // Texel (1, 6): inside the crop, left of the final crop.
        assert_eq!(pixel(&composition, 9, 9), BG);
        // Texel (5, 2): inside the final crop, cropped away in buffer space.
        assert_eq!(pixel(&composition, 13, 13), BG);
        assert_eq!(pixel(&composition, 12, 12), BG);
    }

    #[test]
    fn test_singular_matrix_draws_nothing() {
        let (_ids, bg, mut fg) = scene();
        fg.matrix = LayerMatrix::new(0.0, 0.0, 0.0, 0.0);
        let composition = Compositor::default().composite(&[bg, fg], PixelRect::new(0, 0, 32, 32));
        assert_eq!(pixel(&composition, 8, 8), BG);
        assert_eq!(composition.stats.layers_composited, 1);
    }

    #[test]
    fn test_offset_region() {
        let (_ids, bg, fg) = scene();
        let composition = Compositor::default().composite(&[bg, fg], PixelRect::new(6, 6, 4, 4));
        assert_eq!(composition.buffer.width, 4);
        assert_eq!(pixel(&composition, 1, 1), BG);
        assert_eq!(pixel(&composition, 2, 2), FG);
    }

    #[test]
    fn test_output_alpha_is_opaque() {
        let (_ids, bg, mut fg) = scene();
        fg.alpha = 0.5;
        let composition = Compositor::default().composite(&[bg, fg], PixelRect::new(0, 0, 32, 32));
        assert!(composition.buffer.data.chunks_exact(4).all(|px| px[3] == 255));
    }
}
