//! Color representation and blending.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Full coverage in the 16-bit fixed-point blending domain.
pub const FULL_COVERAGE: u32 = 0xFFFF;

/// RGBA color with 8-bit components.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const WHITE: Color = Color::rgb(255, 255, 255);

    #[inline]
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    #[inline]
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    #[inline]
    pub const fn to_bytes(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// Same color with alpha forced to 255.
    #[inline]
    pub const fn opaque(self) -> Self {
        Self::rgb(self.r, self.g, self.b)
    }

    /// Parse color from hex string (e.g., "#ff0000", "#f00", "#ff000080").
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.strip_prefix('#').unwrap_or(hex);
        let nibble = |i: usize| u8::from_str_radix(hex.get(i..i + 1)?, 16).ok();
        let byte = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();

        match hex.len() {
            3 => Some(Self::rgb(nibble(0)? * 17, nibble(1)? * 17, nibble(2)? * 17)),
            6 => Some(Self::rgb(byte(0)?, byte(2)?, byte(4)?)),
            8 => Some(Self::rgba(byte(0)?, byte(2)?, byte(4)?, byte(6)?)),
            _ => None,
        }
    }

    /// Coverage of a texel with straight alpha `a` drawn at layer opacity
    /// `alpha`, in `0..=FULL_COVERAGE`.
    #[inline]
    pub fn coverage(a: u8, alpha: f32) -> u32 {
        let scaled = alpha.clamp(0.0, 1.0) * f32::from(a) * 257.0;
        (scaled.round() as u32).min(FULL_COVERAGE)
    }

    /// Blends `self` over `background` with the given coverage.
    ///
    /// Channels are mixed in 32-bit fixed point and rounded to nearest. The
    /// result keeps the background's alpha.
    #[inline]
    pub fn blend_with_coverage(&self, background: Color, coverage: u32) -> Color {
        if coverage >= FULL_COVERAGE {
            return Color::rgba(self.r, self.g, self.b, background.a);
        }
        if coverage == 0 {
            return background;
        }

        let inverse = FULL_COVERAGE - coverage;
        let mix = |fg: u8, bg: u8| -> u8 {
            let value = u32::from(fg) * coverage + u32::from(bg) * inverse;
            ((value + FULL_COVERAGE / 2) / FULL_COVERAGE) as u8
        };

        Color::rgba(
            mix(self.r, background.r),
            mix(self.g, background.g),
            mix(self.b, background.b),
            background.a,
        )
    }
}

impl fmt::Debug for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rgba({}, {}, {}, {})", self.r, self.g, self.b, self.a)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.a == 255 {
            write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            write!(f, "#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }
}
