//! Contour tracing and result extraction on the final mask.
//!
//! This module defines the [`ContourTracer`] trait for pluggable contour
//! tracing algorithms and the [`ContourTracerKind`] enum for selecting
//! which algorithm to use at runtime. Tracers return external borders
//! only: holes inside a nodule and islands inside those holes are
//! ignored.
//!
//! [`extract`] turns traced borders into numbered [`DetectionResult`]s
//! in either output mode, dropping degenerate shapes:
//!
//! - contour mode: enclosed area below `min_contour_area` or fewer than
//!   `min_contour_points` boundary points;
//! - box mode: width or height at most `min_box_side`.
//!
//! Ids run 1..=N over the survivors in discovery order (row-major scan of
//! the mask).

use imageproc::contours::{BorderType, Contour, find_contours};

use crate::types::{
    DetectionResult, Geometry, GrayImage, OutputMode, PipelineConfig, PixelPoint, Rect,
};

/// Selects which contour tracing algorithm to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContourTracerKind {
    /// Suzuki-Abe border following via `imageproc::contours::find_contours`,
    /// keeping outermost borders.
    #[default]
    BorderFollowing,
}

/// Trait for contour tracing strategies.
///
/// Input: a binary mask (nonzero = foreground).
/// Output: one closed boundary per outermost connected region, in
/// discovery order. Every boundary pixel is listed.
pub trait ContourTracer {
    /// Trace external contours in the given mask.
    fn trace(&self, mask: &GrayImage) -> Vec<Vec<PixelPoint>>;
}

impl ContourTracer for ContourTracerKind {
    fn trace(&self, mask: &GrayImage) -> Vec<Vec<PixelPoint>> {
        match *self {
            Self::BorderFollowing => trace_border_following(mask),
        }
    }
}

/// Suzuki-Abe border following, outer borders without a parent only.
fn trace_border_following(mask: &GrayImage) -> Vec<Vec<PixelPoint>> {
    let contours: Vec<Contour<i32>> = find_contours(&framed(mask));
    contours
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .map(|c| {
            c.points
                .into_iter()
                .map(|p| PixelPoint::new(p.x - 1, p.y - 1))
                .collect()
        })
        .collect()
}

/// `mask` inside a one-pixel background frame. `find_contours` reports
/// regions touching the image edge as holes otherwise.
fn framed(mask: &GrayImage) -> GrayImage {
    let (width, height) = mask.dimensions();
    let mut out = GrayImage::new(width + 2, height + 2);
    for (x, y, p) in mask.enumerate_pixels() {
        out.put_pixel(x + 1, y + 1, *p);
    }
    out
}

/// Area enclosed by a closed polygon (shoelace formula), in square
/// pixels. Points are pixel centers, so a filled `n × n` square encloses
/// `(n - 1)²`.
#[must_use]
pub fn polygon_area(points: &[PixelPoint]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(a, b)| i64::from(a.x) * i64::from(b.y) - i64::from(b.x) * i64::from(a.y))
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let area = twice.unsigned_abs() as f64 / 2.0;
    area
}

/// Numbered results plus the count of shapes the filters dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub results: Vec<DetectionResult>,
    pub discarded: usize,
}

/// Trace `mask` (already at original resolution) and emit results in
/// `mode`.
#[must_use]
pub fn extract(
    mask: &GrayImage,
    mode: OutputMode,
    config: &PipelineConfig,
    tracer: &dyn ContourTracer,
) -> Extraction {
    let traced = tracer.trace(mask);
    let total = traced.len();
    let geometries: Vec<Geometry> = match mode {
        OutputMode::Contour => traced
            .into_iter()
            .filter(|c| keeps_contour(c, config))
            .map(|contour| Geometry::Contour { contour })
            .collect(),
        OutputMode::BoundingBox => traced
            .iter()
            .filter_map(|c| Rect::bounding(c))
            .filter(|r| keeps_box(r, config))
            .map(Geometry::BoundingBox)
            .collect(),
    };
    let discarded = total - geometries.len();
    let results = geometries
        .into_iter()
        .zip(1..)
        .map(|(geometry, id)| DetectionResult { id, geometry })
        .collect();
    Extraction { results, discarded }
}

fn keeps_contour(contour: &[PixelPoint], config: &PipelineConfig) -> bool {
    contour.len() >= config.min_contour_points && polygon_area(contour) >= config.min_contour_area
}

const fn keeps_box(rect: &Rect, config: &PipelineConfig) -> bool {
    rect.width > config.min_box_side && rect.height > config.min_box_side
}
