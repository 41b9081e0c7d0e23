//! Affine mapping between canonical and original image space.
//!
//! The pipeline works at a fixed canonical resolution and reports
//! geometry at the input's resolution. The two spaces differ by a pure
//! per-axis scaling:
//!
//! ```text
//! sx = original_width  / canonical_width
//! sy = original_height / canonical_height
//! ```
//!
//! Mapping stays in `f64` throughout; rounding to integers happens only
//! when a result is emitted ([`BoxF::round`]).

use crate::types::{Dimensions, Point, Rect};

/// Scale factors from canonical to original space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    pub sx: f64,
    pub sy: f64,
}

impl Scale {
    /// Scale factors for `original` relative to `canonical`.
    ///
    /// Both sizes must be non-empty.
    #[must_use]
    pub fn between(original: Dimensions, canonical: Dimensions) -> Self {
        Self {
            sx: f64::from(original.width) / f64::from(canonical.width),
            sy: f64::from(original.height) / f64::from(canonical.height),
        }
    }

    /// Map a canonical-space point to original space.
    #[must_use]
    pub fn to_original(&self, p: Point) -> Point {
        Point::new(p.x * self.sx, p.y * self.sy)
    }

    /// Map an original-space point to canonical space.
    #[must_use]
    pub fn to_canonical(&self, p: Point) -> Point {
        Point::new(p.x / self.sx, p.y / self.sy)
    }
}

/// Axis-aligned box with fractional edges, `[x0, x1) × [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxF {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BoxF {
    /// Box covering the pixels of an integer rectangle.
    #[must_use]
    pub fn from_rect(rect: &Rect) -> Self {
        Self {
            x0: f64::from(rect.x),
            y0: f64::from(rect.y),
            x1: f64::from(rect.right()),
            y1: f64::from(rect.bottom()),
        }
    }

    /// Map from canonical to original space.
    #[must_use]
    pub fn to_original(&self, scale: Scale) -> Self {
        let a = scale.to_original(Point::new(self.x0, self.y0));
        let b = scale.to_original(Point::new(self.x1, self.y1));
        Self {
            x0: a.x,
            y0: a.y,
            x1: b.x,
            y1: b.y,
        }
    }

    /// Map from original to canonical space.
    #[must_use]
    pub fn to_canonical(&self, scale: Scale) -> Self {
        let a = scale.to_canonical(Point::new(self.x0, self.y0));
        let b = scale.to_canonical(Point::new(self.x1, self.y1));
        Self {
            x0: a.x,
            y0: a.y,
            x1: b.x,
            y1: b.y,
        }
    }

    /// Round edges to the nearest pixel boundary.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn round(&self) -> Rect {
        let x0 = self.x0.round() as i32;
        let y0 = self.y0.round() as i32;
        let x1 = self.x1.round() as i32;
        let y1 = self.y1.round() as i32;
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }
}
