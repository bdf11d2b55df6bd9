//! Common utilities and types shared by the compositor crates.

pub mod color;
pub mod geometry;
pub mod error;

pub use color::Color;
pub use geometry::{PixelRect, Point, Rect, Size, Transform};
pub use error::{CompositorError, CompositorResult};
