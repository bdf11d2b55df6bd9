//! Pixel storage: producer buffers and composited output.

use common::color::Color;
use common::error::{CompositorError, CompositorResult};
use common::geometry::{PixelRect, Size};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Pixel layout of a buffer. Every supported format is 4 bytes per pixel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Straight-alpha RGBA, 8 bits per channel.
    #[default]
    Rgba8888,
    /// RGB with an ignored fourth byte; always opaque.
    Rgbx8888,
    /// Straight-alpha BGRA, 8 bits per channel.
    Bgra8888,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        4
    }

    pub const fn is_opaque(self) -> bool {
        matches!(self, PixelFormat::Rgbx8888)
    }

    #[inline]
    fn decode(self, px: &[u8]) -> Color {
        match self {
            PixelFormat::Rgba8888 => Color::rgba(px[0], px[1], px[2], px[3]),
            PixelFormat::Rgbx8888 => Color::rgb(px[0], px[1], px[2]),
            PixelFormat::Bgra8888 => Color::rgba(px[2], px[1], px[0], px[3]),
        }
    }

    #[inline]
    fn encode(self, color: Color) -> [u8; 4] {
        match self {
            PixelFormat::Rgba8888 => color.to_bytes(),
            PixelFormat::Rgbx8888 => [color.r, color.g, color.b, 255],
            PixelFormat::Bgra8888 => [color.b, color.g, color.r, color.a],
        }
    }
}

/// A producer buffer: the content a layer presents once latched.
///
/// `stride` is measured in pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphicBuffer {
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    data: Arc<[u8]>,
}

impl GraphicBuffer {
    /// Wraps raw pixel data after checking that it describes a whole image.
    pub fn new(
        data: impl Into<Arc<[u8]>>,
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
    ) -> CompositorResult<Self> {
        let data = data.into();
        if width == 0 || height == 0 {
            return Err(CompositorError::invalid(format!(
                "buffer size {}x{} is empty",
                width, height
            )));
        }
        if stride < width {
            return Err(CompositorError::invalid(format!(
                "stride {} is smaller than width {}",
                stride, width
            )));
        }
        let required = Self::required_len(width, height, stride, format);
        if data.len() < required {
            return Err(CompositorError::invalid(format!(
                "buffer holds {} bytes, {}x{} with stride {} needs {}",
                data.len(),
                width,
                height,
                stride,
                required
            )));
        }

        Ok(Self {
            width,
            height,
            stride,
            format,
            data,
        })
    }

    /// A tightly packed buffer filled with one color.
    pub fn filled(width: u32, height: u32, format: PixelFormat, color: Color) -> CompositorResult<Self> {
        let pixel = format.encode(color);
        let count = width as usize * height as usize;
        let mut data = Vec::with_capacity(count * format.bytes_per_pixel());
        for _ in 0..count {
            data.extend_from_slice(&pixel);
        }
        Self::new(data, width, height, width, format)
    }

    fn required_len(width: u32, height: u32, stride: u32, format: PixelFormat) -> usize {
        let bpp = format.bytes_per_pixel();
        (height as usize - 1) * stride as usize * bpp + width as usize * bpp
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn bounds(&self) -> PixelRect {
        PixelRect::from_size(self.size())
    }

    /// Bytes of backing storage.
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Reads the texel at `(x, y)`; callers keep coordinates inside `bounds()`.
    #[inline]
    pub fn texel(&self, x: u32, y: u32) -> Color {
        let bpp = self.format.bytes_per_pixel();
        let offset = (y as usize * self.stride as usize + x as usize) * bpp;
        self.format.decode(&self.data[offset..offset + bpp])
    }
}

/// Composited RGBA8 output. `stride` is measured in pixels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelBuffer {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Row stride in pixels.
    pub stride: u32,
    /// RGBA pixel data (4 bytes per pixel).
    pub data: Vec<u8>,
}

impl PixelBuffer {
    pub const BYTES_PER_PIXEL: usize = 4;

    pub fn new(width: u32, height: u32) -> Self {
        let size = width as usize * height as usize * Self::BYTES_PER_PIXEL;
        Self {
            width,
            height,
            stride: width,
            data: vec![0; size],
        }
    }

    /// Fill with an opaque version of `color`.
    pub fn fill(&mut self, color: Color) {
        let bytes = color.opaque().to_bytes();
        for chunk in self.data.chunks_exact_mut(4) {
            chunk.copy_from_slice(&bytes);
        }
    }

    /// Get pixel at position.
    pub fn get_pixel(&self, x: u32, y: u32) -> Option<Color> {
        if x >= self.width || y >= self.height {
            return None;
        }

        let offset = (y as usize * self.stride as usize + x as usize) * 4;
        let px = &self.data[offset..offset + 4];
        Some(Color::rgba(px[0], px[1], px[2], px[3]))
    }

    /// Set pixel at position.
    pub fn set_pixel(&mut self, x: u32, y: u32, color: Color) {
        if x >= self.width || y >= self.height {
            return;
        }

        let offset = (y as usize * self.stride as usize + x as usize) * 4;
        self.data[offset..offset + 4].copy_from_slice(&color.to_bytes());
    }

    /// Bytes per row.
    pub fn row_bytes(&self) -> usize {
        self.stride as usize * 4
    }

    /// Pixel data without row padding, suitable for image encoders.
    pub fn to_packed_rgba(&self) -> Vec<u8> {
        if self.stride == self.width {
            return self.data.clone();
        }
        let row = self.width as usize * 4;
        self.data
            .chunks(self.row_bytes())
            .take(self.height as usize)
            .flat_map(|line| line[..row].iter().copied())
            .collect()
    }
}
