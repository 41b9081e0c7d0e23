//! Shared types for the nodule detection pipeline.

use serde::{Deserialize, Serialize};

use crate::dicom::DicomError;
use crate::regions::ExtractorKind;

/// Re-export `GrayImage` so downstream crates can reference binary
/// masks without depending on `image` directly.
pub use image::GrayImage;

/// Single-channel floating-point raster.
///
/// Used for raw decoded intensities, normalized images, probability
/// maps and distance maps.
pub type FloatImage = image::ImageBuffer<image::Luma<f32>, Vec<f32>>;

/// Foreground value of every binary mask in the pipeline.
pub const MASK_ON: u8 = 255;

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.hypot(dy)
    }
}

/// An integer point in original-image coordinates, as emitted in
/// contour records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: i32,
    pub y: i32,
}

impl PixelPoint {
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned integer rectangle. `width` and `height` count pixels,
/// so a single pixel has width 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    #[must_use]
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Exclusive right edge.
    #[must_use]
    pub const fn right(&self) -> i32 {
        self.x + self.width
    }

    /// Exclusive bottom edge.
    #[must_use]
    pub const fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// Smallest rectangle covering every point, or `None` for an empty
    /// slice.
    #[must_use]
    pub fn bounding(points: &[PixelPoint]) -> Option<Self> {
        let first = points.first()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Some(Self::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Square dimensions, as used for the canonical working resolution.
    #[must_use]
    pub const fn square(side: u32) -> Self {
        Self::new(side, side)
    }

    /// Dimensions of any image buffer.
    #[must_use]
    pub fn of<I: image::GenericImageView>(image: &I) -> Self {
        let (width, height) = image.dimensions();
        Self { width, height }
    }

    /// Returns `true` if either side is zero.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Which decoder recognized the input bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFormat {
    /// DICOM Part-10 stream with native pixel data.
    Dicom,
    /// Standard raster encoding (PNG, JPEG, BMP, WebP, ...).
    Raster,
}

/// Linear transform from stored values to Hounsfield units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub slope: f64,
    pub intercept: f64,
}

impl Calibration {
    /// Slope 1, intercept 0: the values used when the rescale tags are
    /// absent.
    pub const IDENTITY: Self = Self {
        slope: 1.0,
        intercept: 0.0,
    };

    /// Apply `raw * slope + intercept`.
    #[must_use]
    pub fn apply(&self, raw: f64) -> f64 {
        raw.mul_add(self.slope, self.intercept)
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Raw intensities as decoded from the input, before any windowing.
///
/// DICOM input always carries a [`Calibration`]; raster input never
/// does and holds 8-bit gray levels.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub pixels: FloatImage,
    pub calibration: Option<Calibration>,
    pub format: SourceFormat,
}

impl DecodedImage {
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::of(&self.pixels)
    }
}

/// Image at canonical size with every value in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct NormalizedImage(FloatImage);

impl NormalizedImage {
    /// Wrap a raster, clamping every value into `[0, 1]`. Non-finite
    /// values become 0.
    #[must_use]
    pub fn new(mut image: FloatImage) -> Self {
        for p in image.pixels_mut() {
            p.0[0] = clamp_unit(p.0[0]);
        }
        Self(image)
    }

    #[must_use]
    pub const fn image(&self) -> &FloatImage {
        &self.0
    }

    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::of(&self.0)
    }
}

/// Per-pixel nodule probability produced by the segmentation oracle.
#[derive(Debug, Clone)]
pub struct ProbabilityMap(FloatImage);

impl ProbabilityMap {
    /// Wrap an oracle output, clamping every value into `[0, 1]`.
    #[must_use]
    pub fn new(mut image: FloatImage) -> Self {
        for p in image.pixels_mut() {
            p.0[0] = clamp_unit(p.0[0]);
        }
        Self(image)
    }

    /// Build a map from row-major values. Returns `None` if `values`
    /// does not hold exactly `width * height` entries.
    #[must_use]
    pub fn from_raw(width: u32, height: u32, values: Vec<f32>) -> Option<Self> {
        FloatImage::from_raw(width, height, values).map(Self::new)
    }

    #[must_use]
    pub const fn image(&self) -> &FloatImage {
        &self.0
    }

    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::of(&self.0)
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 }
}

/// Class chosen by the classification oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoduleLabel {
    FalsePositive,
    TruePositive,
}

/// Whether a candidate survives into the final mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Accepted,
    Rejected,
}

impl From<NoduleLabel> for Verdict {
    fn from(label: NoduleLabel) -> Self {
        match label {
            NoduleLabel::TruePositive => Self::Accepted,
            NoduleLabel::FalsePositive => Self::Rejected,
        }
    }
}

/// A provisional detection in canonical space.
///
/// `mask` covers exactly `bbox`: pixel `(x, y)` of the mask corresponds
/// to canonical pixel `(bbox.x + x, bbox.y + y)`.
#[derive(Debug, Clone)]
pub struct CandidateRegion {
    pub label: u32,
    pub centroid: Point,
    pub bbox: Rect,
    pub mask: GrayImage,
    pub area: u32,
    /// `None` until classified. Single-stage extraction pre-accepts.
    pub verdict: Option<Verdict>,
}

impl CandidateRegion {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.verdict == Some(Verdict::Accepted)
    }
}

/// Detection geometry in original-image coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Geometry {
    /// Ordered boundary points.
    Contour { contour: Vec<PixelPoint> },
    /// Axis-aligned rectangle.
    BoundingBox(Rect),
}

/// One detected nodule.
///
/// Serializes as `{ "id", "contour": [{x, y}, ...] }` or
/// `{ "id", "x", "y", "width", "height" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// 1-based, consecutive, in contour discovery order.
    pub id: u32,
    #[serde(flatten)]
    pub geometry: Geometry,
}

/// Response envelope: `{ "nodules": [...] }`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub nodules: Vec<DetectionResult>,
}

impl From<Vec<DetectionResult>> for DetectionResponse {
    fn from(nodules: Vec<DetectionResult>) -> Self {
        Self { nodules }
    }
}

/// Pipeline variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Variant {
    /// Connected components, no classifier, rectangles out.
    SingleStageBbox,
    /// Connected components, no classifier, contours out.
    #[default]
    SingleStageContour,
    /// Watershed splitting followed by per-region classification.
    TwoStage,
}

impl Variant {
    /// Candidate extraction policy for this variant.
    #[must_use]
    pub const fn extractor(self) -> ExtractorKind {
        match self {
            Self::SingleStageBbox | Self::SingleStageContour => ExtractorKind::ConnectedComponents,
            Self::TwoStage => ExtractorKind::Watershed,
        }
    }

    /// Whether candidates go through the classification oracle.
    #[must_use]
    pub const fn classifies(self) -> bool {
        matches!(self, Self::TwoStage)
    }

    /// Output mode when the config does not override it.
    #[must_use]
    pub const fn default_output(self) -> OutputMode {
        match self {
            Self::SingleStageBbox => OutputMode::BoundingBox,
            Self::SingleStageContour | Self::TwoStage => OutputMode::Contour,
        }
    }
}

/// Shape of the emitted geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    Contour,
    BoundingBox,
}

/// Configuration for the detection pipeline.
///
/// Defaults reproduce the lung-window, 512x512 single-stage contour
/// pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Which pipeline variant to run.
    pub variant: Variant,

    /// Output mode override. `None` lets the variant decide.
    pub output: Option<OutputMode>,

    /// Window center in Hounsfield units (calibrated input only).
    pub window_center: f64,

    /// Window width in Hounsfield units (calibrated input only).
    pub window_width: f64,

    /// Side of the square working resolution the segmentation oracle
    /// expects.
    pub canonical_size: u32,

    /// Pixels with probability strictly above this value are foreground.
    pub probability_threshold: f32,

    /// Connected components smaller than this many pixels are dropped.
    pub min_component_area: u32,

    /// Minimum separation (Chebyshev, pixels) between watershed seeds.
    pub peak_min_distance: u32,

    /// Side of the square patch given to the classification oracle.
    pub patch_size: u32,

    /// Contours enclosing less area than this are dropped.
    pub min_contour_area: f64,

    /// Contours with fewer boundary points than this are dropped.
    pub min_contour_points: usize,

    /// Rectangles with a side less than or equal to this are dropped.
    pub min_box_side: i32,

    /// Return decode failures as errors instead of an empty result.
    pub strict_decode: bool,
}

impl PipelineConfig {
    pub const DEFAULT_WINDOW_CENTER: f64 = -600.0;
    pub const DEFAULT_WINDOW_WIDTH: f64 = 1500.0;
    pub const DEFAULT_CANONICAL_SIZE: u32 = 512;
    pub const DEFAULT_PROBABILITY_THRESHOLD: f32 = 0.5;
    pub const DEFAULT_MIN_COMPONENT_AREA: u32 = 20;
    pub const DEFAULT_PEAK_MIN_DISTANCE: u32 = 10;
    pub const DEFAULT_PATCH_SIZE: u32 = 64;
    pub const DEFAULT_MIN_CONTOUR_AREA: f64 = 10.0;
    pub const DEFAULT_MIN_CONTOUR_POINTS: usize = 5;
    pub const DEFAULT_MIN_BOX_SIDE: i32 = 5;

    /// Effective output mode.
    #[must_use]
    pub fn output_mode(&self) -> OutputMode {
        self.output.unwrap_or_else(|| self.variant.default_output())
    }

    /// Canonical working resolution.
    #[must_use]
    pub const fn canonical(&self) -> Dimensions {
        Dimensions::square(self.canonical_size)
    }

    /// Check invariants that the pipeline relies on.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.canonical_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "canonical_size must be positive".to_string(),
            ));
        }
        if !(self.window_width.is_finite() && self.window_width > 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "window_width must be positive, got {}",
                self.window_width
            )));
        }
        if !self.window_center.is_finite() {
            return Err(PipelineError::InvalidConfig(
                "window_center must be finite".to_string(),
            ));
        }
        if !(self.probability_threshold > 0.0 && self.probability_threshold < 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "probability_threshold must lie in (0, 1), got {}",
                self.probability_threshold
            )));
        }
        if self.peak_min_distance == 0 {
            return Err(PipelineError::InvalidConfig(
                "peak_min_distance must be positive".to_string(),
            ));
        }
        if self.patch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "patch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            variant: Variant::default(),
            output: None,
            window_center: Self::DEFAULT_WINDOW_CENTER,
            window_width: Self::DEFAULT_WINDOW_WIDTH,
            canonical_size: Self::DEFAULT_CANONICAL_SIZE,
            probability_threshold: Self::DEFAULT_PROBABILITY_THRESHOLD,
            min_component_area: Self::DEFAULT_MIN_COMPONENT_AREA,
            peak_min_distance: Self::DEFAULT_PEAK_MIN_DISTANCE,
            patch_size: Self::DEFAULT_PATCH_SIZE,
            min_contour_area: Self::DEFAULT_MIN_CONTOUR_AREA,
            min_contour_points: Self::DEFAULT_MIN_CONTOUR_POINTS,
            min_box_side: Self::DEFAULT_MIN_BOX_SIDE,
            strict_decode: false,
        }
    }
}

/// Counts collected during one detection call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionSummary {
    /// Decoder that recognized the input; `None` if decoding failed.
    pub source: Option<SourceFormat>,
    /// Original image size; `None` if decoding failed.
    pub original: Option<Dimensions>,
    /// Candidate regions extracted from the probability map.
    pub candidates: usize,
    /// Candidates that made it into the final mask.
    pub accepted: usize,
    /// Candidates rejected by the classifier (including failed calls).
    pub rejected: usize,
    /// Traced shapes dropped by the area, point-count or side filters.
    pub discarded: usize,
}

/// Errors raised while decoding the input bytes.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The input bytes were empty.
    #[error("input image data is empty")]
    Empty,

    /// The bytes are a DICOM stream that could not be read.
    #[error("failed to read DICOM data: {0}")]
    Dicom(#[from] DicomError),

    /// The bytes are a known raster format but the data is corrupt.
    #[error("failed to decode raster image: {0}")]
    Raster(#[from] image::ImageError),

    /// Neither DICOM nor any supported raster format.
    #[error("unrecognized image format")]
    Unrecognized,
}

/// Errors raised by the segmentation or classification oracles.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// The oracle failed to initialize (now or on an earlier attempt).
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    /// The model file could not be loaded.
    #[error("failed to load model {path}: {message}")]
    Load { path: String, message: String },

    /// The forward pass failed.
    #[error("inference failed: {0}")]
    Inference(String),

    /// The oracle returned an output of unexpected shape.
    #[error("unexpected oracle output shape: expected {expected}, got {actual}")]
    Shape { expected: String, actual: String },

    /// A previous holder of the oracle lock panicked.
    #[error("oracle lock poisoned")]
    LockPoisoned,
}

/// Errors that can escape a detection call.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Input decoding failed and the config asks for strict decoding.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// An oracle failed while a request was in flight.
    #[error(transparent)]
    Oracle(#[from] OracleError),

    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn point_distance() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert!((a.distance(b) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rect_bounding_counts_pixels_inclusively() {
        let points = [
            PixelPoint::new(50, 50),
            PixelPoint::new(79, 50),
            PixelPoint::new(79, 79),
            PixelPoint::new(50, 79),
        ];
        assert_eq!(Rect::bounding(&points), Some(Rect::new(50, 50, 30, 30)));
        assert_eq!(Rect::bounding(&[]), None);
    }

    #[test]
    fn calibration_applies_slope_then_intercept() {
        let c = Calibration {
            slope: 2.0,
            intercept: -1024.0,
        };
        assert!((c.apply(600.0) - 176.0).abs() < 1e-9);
        assert_eq!(Calibration::default(), Calibration::IDENTITY);
    }

    #[test]
    fn probability_map_clamps_and_rejects_bad_length() {
        let map = ProbabilityMap::from_raw(2, 1, vec![1.5, f32::NAN]).unwrap();
        assert!((map.image().get_pixel(0, 0).0[0] - 1.0).abs() < f32::EPSILON);
        assert!(map.image().get_pixel(1, 0).0[0].abs() < f32::EPSILON);
        assert!(ProbabilityMap::from_raw(2, 2, vec![0.0; 3]).is_none());
    }

    #[test]
    fn variant_selects_policies() {
        assert_eq!(
            Variant::SingleStageBbox.extractor(),
            ExtractorKind::ConnectedComponents
        );
        assert_eq!(Variant::TwoStage.extractor(), ExtractorKind::Watershed);
        assert!(Variant::TwoStage.classifies());
        assert!(!Variant::SingleStageContour.classifies());
        assert_eq!(
            Variant::SingleStageBbox.default_output(),
            OutputMode::BoundingBox
        );
    }

    #[test]
    fn output_override_wins() {
        let config = PipelineConfig {
            variant: Variant::TwoStage,
            output: Some(OutputMode::BoundingBox),
            ..PipelineConfig::default()
        };
        assert_eq!(config.output_mode(), OutputMode::BoundingBox);
        assert_eq!(
            PipelineConfig::default().output_mode(),
            OutputMode::Contour
        );
    }

    #[test]
    fn pipeline_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.variant, Variant::SingleStageContour);
        assert!((config.window_center + 600.0).abs() < f64::EPSILON);
        assert!((config.window_width - 1500.0).abs() < f64::EPSILON);
        assert_eq!(config.canonical_size, 512);
        assert!((config.probability_threshold - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.min_component_area, 20);
        assert_eq!(config.peak_min_distance, 10);
        assert_eq!(config.patch_size, 64);
        assert_eq!(config.min_contour_points, 5);
        assert!(!config.strict_decode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let zero = PipelineConfig {
            canonical_size: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));

        let threshold = PipelineConfig {
            probability_threshold: 1.0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            threshold.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));

        let peaks = PipelineConfig {
            peak_min_distance: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            peaks.validate(),
            Err(PipelineError::InvalidConfig(ref s)) if s.contains("peak_min_distance")
        ));

        let window = PipelineConfig {
            window_width: 0.0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            window.validate(),
            Err(PipelineError::InvalidConfig(ref s)) if s.contains("window_width")
        ));
    }

    #[test]
    fn config_json_fills_missing_fields_with_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"variant":"TwoStage","window_width":400.0}"#).unwrap();
        assert_eq!(config.variant, Variant::TwoStage);
        assert!((config.window_width - 400.0).abs() < f64::EPSILON);
        assert_eq!(config.canonical_size, 512);
    }

    #[test]
    fn contour_record_shape() {
        let result = DetectionResult {
            id: 1,
            geometry: Geometry::Contour {
                contour: vec![PixelPoint::new(3, 4), PixelPoint::new(5, 6)],
            },
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": 1, "contour": [{"x": 3, "y": 4}, {"x": 5, "y": 6}]})
        );
    }

    #[test]
    fn bbox_record_shape() {
        let result = DetectionResult {
            id: 2,
            geometry: Geometry::BoundingBox(Rect::new(10, 20, 30, 40)),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": 2, "x": 10, "y": 20, "width": 30, "height": 40})
        );
        let back: DetectionResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn response_envelope_shape() {
        let response = DetectionResponse::from(Vec::new());
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"nodules": []})
        );
    }

    #[test]
    fn error_display() {
        assert_eq!(DecodeError::Empty.to_string(), "input image data is empty");
        assert_eq!(
            PipelineError::from(DecodeError::Unrecognized).to_string(),
            "unrecognized image format"
        );
        assert_eq!(
            OracleError::Unavailable("no weights".to_string()).to_string(),
            "oracle unavailable: no weights"
        );
    }
}
