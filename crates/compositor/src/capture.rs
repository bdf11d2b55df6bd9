//! Screen capture: an offscreen composite of one layer stack.

use crate::buffer::PixelBuffer;
use crate::service::Composer;
use common::color::Color;
use common::error::{CompositorError, CompositorResult};
use common::geometry::PixelRect;
use thiserror::Error;

/// Returned by [`ScreenCapture::check_pixel`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PixelMismatch {
    #[error("pixel ({x}, {y}) is outside the captured region")]
    OutOfRegion { x: i32, y: i32 },

    #[error("pixel ({x}, {y}): expected [{:3}, {:3}, {:3}], got [{:3}, {:3}, {:3}]", .expected.r, .expected.g, .expected.b, .actual.r, .actual.g, .actual.b)]
    Color {
        x: i32,
        y: i32,
        expected: Color,
        actual: Color,
    },
}

/// Captured pixels of a screen region.
#[derive(Clone, Debug)]
pub struct ScreenCapture {
    buffer: PixelBuffer,
    region: PixelRect,
}

impl ScreenCapture {
    pub fn new(buffer: PixelBuffer, region: PixelRect) -> Self {
        Self { buffer, region }
    }

    /// Screen area covered by the capture.
    pub fn region(&self) -> PixelRect {
        self.region
    }

    /// Pixel at screen coordinate `(x, y)`.
    pub fn pixel_at(&self, x: i32, y: i32) -> Option<Color> {
        if !self.region.contains(x, y) {
            return None;
        }
        self.buffer
            .get_pixel((x - self.region.x) as u32, (y - self.region.y) as u32)
    }

    /// Compares the color channels at `(x, y)`; alpha is ignored.
    pub fn check_pixel(&self, x: i32, y: i32, r: u8, g: u8, b: u8) -> Result<(), PixelMismatch> {
        let actual = self.pixel_at(x, y).ok_or(PixelMismatch::OutOfRegion { x, y })?;
        let expected = Color::rgb(r, g, b);
        if actual.opaque() != expected {
            return Err(PixelMismatch::Color {
                x,
                y,
                expected,
                actual,
            });
        }
        Ok(())
    }

    pub fn buffer(&self) -> &PixelBuffer {
        &self.buffer
    }

    pub fn into_buffer(self) -> PixelBuffer {
        self.buffer
    }
}

impl Composer {
    /// Composite `layer_stack` over `region` (display coordinates) into a
    /// fresh buffer. Secure layers are left out.
    pub fn capture_composite(&self, layer_stack: u32, region: PixelRect) -> CompositorResult<ScreenCapture> {
        if region.is_empty() {
            return Err(CompositorError::invalid(format!(
                "capture region {}x{} is empty",
                region.width, region.height
            )));
        }
        self.config()
            .limits()
            .check_buffer(region.width, region.height, PixelBuffer::BYTES_PER_PIXEL)?;

        let layers = self.snapshot_stack(layer_stack, false);
        let composition = self.compositor().composite(&layers, region);
        tracing::trace!(
            "captured stack {} ({} layers) in {:.3}ms",
            layer_stack,
            composition.stats.layers_composited,
            composition.stats.composition_time_ms
        );

        Ok(ScreenCapture::new(composition.buffer, region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PixelFormat;
    use crate::config::CompositorConfig;
    use crate::layer::LayerFlags;

    fn capture() -> ScreenCapture {
        let mut buffer = PixelBuffer::new(4, 4);
        buffer.fill(Color::rgb(63, 63, 195));
        buffer.set_pixel(0, 0, Color::rgb(195, 63, 63));
        ScreenCapture::new(buffer, PixelRect::new(10, 20, 4, 4))
    }

    #[test]
    fn test_pixel_at_uses_screen_coordinates() {
        let sc = capture();
        assert_eq!(sc.pixel_at(10, 20), Some(Color::rgb(195, 63, 63)));
        assert_eq!(sc.pixel_at(13, 23), Some(Color::rgb(63, 63, 195)));
        assert_eq!(sc.pixel_at(0, 0), None);
        assert_eq!(sc.pixel_at(14, 20), None);
    }

    #[test]
    fn test_check_pixel() {
        let sc = capture();
        assert!(sc.check_pixel(10, 20, 195, 63, 63).is_ok());

        let err = sc.check_pixel(11, 20, 195, 63, 63).unwrap_err();
        assert_eq!(
            err.to_string(),
            "pixel (11, 20): expected [195,  63,  63], got [ 63,  63, 195]"
        );
        assert_eq!(
            sc.check_pixel(0, 0, 0, 0, 0),
            Err(PixelMismatch::OutOfRegion { x: 0, y: 0 })
        );
    }

    #[test]
    fn test_capture_composite() {
        let composer = Composer::new(CompositorConfig::headless()).unwrap();
        let layer = composer
            .create_layer("surface", 3, 8, 8, PixelFormat::Rgbx8888, LayerFlags::empty())
            .unwrap();
        composer.fill_layer(layer, Color::rgba(1, 2, 3, 0)).unwrap();

        let sc = composer.capture_composite(3, PixelRect::new(4, 4, 8, 8)).unwrap();
        assert_eq!(sc.buffer().width, 8);
        assert!(sc.check_pixel(7, 7, 1, 2, 3).is_ok());
        assert!(sc.check_pixel(8, 8, 0, 0, 0).is_ok());

        assert!(matches!(
            composer.capture_composite(3, PixelRect::new(0, 0, 0, 8)),
            Err(CompositorError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_oversized_capture_is_refused() {
        let composer = Composer::new(CompositorConfig::headless()).unwrap();
        assert!(matches!(
            composer.capture_composite(0, PixelRect::new(0, 0, u32::MAX, u32::MAX)),
            Err(CompositorError::OutOfResources(_))
        ));

        let config = CompositorConfig::headless().with_buffer_limits(8192, 1024);
        let composer = Composer::new(config).unwrap();
        assert!(matches!(
            composer.capture_composite(0, PixelRect::new(0, 0, 32, 32)),
            Err(CompositorError::OutOfResources(_))
        ));
        assert!(composer.capture_composite(0, PixelRect::new(0, 0, 16, 16)).is_ok());
    }
}
