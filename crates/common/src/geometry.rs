//! Geometric primitives.

use serde::{Deserialize, Serialize};

/// A 2D point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const ZERO: Point = Point { x: 0.0, y: 0.0 };

    #[inline]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// An integer 2D size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    #[inline]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether `other` fits inside this size.
    #[inline]
    pub fn contains(&self, other: Size) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

/// A floating-point rectangle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    #[inline]
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    #[inline]
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    #[inline]
    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Smallest pixel rectangle that covers this rectangle.
    pub fn to_enclosing_pixel_rect(&self) -> Option<PixelRect> {
        if self.is_empty() || !self.x.is_finite() || !self.y.is_finite() {
            return None;
        }
        let left = self.x.floor() as i32;
        let top = self.y.floor() as i32;
        let right = self.right().ceil() as i32;
        let bottom = self.bottom().ceil() as i32;
        PixelRect::from_ltrb(left, top, right, bottom)
    }
}

/// Integer rectangle for pixel operations.
///
/// Covers the half-open ranges `x..x + width` and `y..y + height`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    #[inline]
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Builds a rectangle from its edges. Returns `None` when an edge is
    /// inverted.
    pub fn from_ltrb(left: i32, top: i32, right: i32, bottom: i32) -> Option<Self> {
        if right < left || bottom < top {
            return None;
        }
        Some(Self {
            x: left,
            y: top,
            width: (right as i64 - left as i64) as u32,
            height: (bottom as i64 - top as i64) as u32,
        })
    }

    #[inline]
    pub fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    /// Right edge, clamped to `i32::MAX`.
    #[inline]
    pub fn right(&self) -> i32 {
        Self::far_edge(self.x, self.width)
    }

    /// Bottom edge, clamped to `i32::MAX`.
    #[inline]
    pub fn bottom(&self) -> i32 {
        Self::far_edge(self.y, self.height)
    }

    #[inline]
    fn far_edge(origin: i32, extent: u32) -> i32 {
        (i64::from(origin) + i64::from(extent)).min(i64::from(i32::MAX)) as i32
    }

    #[inline]
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    pub fn intersection(&self, other: &PixelRect) -> Option<PixelRect> {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());

        if right > left && bottom > top {
            PixelRect::from_ltrb(left, top, right, bottom)
        } else {
            None
        }
    }

    #[inline]
    pub fn to_rect(&self) -> Rect {
        Rect::new(self.x as f32, self.y as f32, self.width as f32, self.height as f32)
    }
}

/// A 2D affine transformation matrix.
///
/// Points map as `x' = m11·x + m21·y + m31`, `y' = m12·x + m22·y + m32`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub m11: f32,
    pub m12: f32,
    pub m21: f32,
    pub m22: f32,
    pub m31: f32,
    pub m32: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub const fn identity() -> Self {
        Self {
            m11: 1.0,
            m12: 0.0,
            m21: 0.0,
            m22: 1.0,
            m31: 0.0,
            m32: 0.0,
        }
    }

    pub fn transform_point(&self, point: Point) -> Point {
        Point::new(
            self.m11 * point.x + self.m21 * point.y + self.m31,
            self.m12 * point.x + self.m22 * point.y + self.m32,
        )
    }

    /// Axis-aligned bounds of the transformed rectangle.
    pub fn transform_rect(&self, rect: Rect) -> Rect {
        let p1 = self.transform_point(Point::new(rect.x, rect.y));
        let p2 = self.transform_point(Point::new(rect.right(), rect.y));
        let p3 = self.transform_point(Point::new(rect.x, rect.bottom()));
        let p4 = self.transform_point(Point::new(rect.right(), rect.bottom()));

        let min_x = p1.x.min(p2.x).min(p3.x).min(p4.x);
        let min_y = p1.y.min(p2.y).min(p3.y).min(p4.y);
        let max_x = p1.x.max(p2.x).max(p3.x).max(p4.x);
        let max_y = p1.y.max(p2.y).max(p3.y).max(p4.y);

        Rect::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }

    pub fn determinant(&self) -> f32 {
        self.m11 * self.m22 - self.m12 * self.m21
    }

    /// Inverse mapping, or `None` when the matrix is singular or its
    /// inverse does not fit in `f32`.
    pub fn inverse(&self) -> Option<Transform> {
        let det = self.determinant();
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let inv_det = det.recip();
        if !inv_det.is_finite() {
            return None;
        }
        Some(Transform {
            m11: self.m22 * inv_det,
            m12: -self.m12 * inv_det,
            m21: -self.m21 * inv_det,
            m22: self.m11 * inv_det,
            m31: (self.m21 * self.m32 - self.m22 * self.m31) * inv_det,
            m32: (self.m12 * self.m31 - self.m11 * self.m32) * inv_det,
        })
    }

}
