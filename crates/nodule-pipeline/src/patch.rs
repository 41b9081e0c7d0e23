//! Classifier patches: crop, channel normalization, label decision.
//!
//! Each watershed region is judged from a fixed-size square patch of the
//! normalized canonical image centered on the region's centroid. The
//! crop is clamped to the image; when clamping shrinks it, the crop is
//! resized back up to full size. The patch is then replicated to three
//! channels and standardized with the ImageNet channel statistics, the
//! layout the classification networks are trained on.

use image::imageops;

use crate::resize::resize_patch;
use crate::types::{FloatImage, NoduleLabel, NormalizedImage, OracleError, Point};

/// Per-channel mean of `[0, 1]` RGB input.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// Per-channel standard deviation of `[0, 1]` RGB input.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Crop a `side × side` patch centered on `centroid`.
///
/// The crop window is clamped to the image bounds. A clamped window is
/// resized to `side × side`, so the result always has that size.
#[must_use = "returns the cropped patch"]
pub fn crop_patch(image: &NormalizedImage, centroid: Point, side: u32) -> FloatImage {
    let img = image.image();
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 || side == 0 {
        return FloatImage::new(side, side);
    }
    let (x0, x1) = clamped_span(centroid.x, side, width);
    let (y0, y1) = clamped_span(centroid.y, side, height);
    let crop = imageops::crop_imm(img, x0, y0, x1 - x0, y1 - y0).to_image();
    resize_patch(&crop, side)
}

/// Half-open span of length `side` centered on `center`, clamped to
/// `0..len`. Never empty for `side >= 1` and `len >= 1`.
#[allow(clippy::cast_possible_truncation)]
fn clamped_span(center: f64, side: u32, len: u32) -> (u32, u32) {
    let last = i64::from(len) - 1;
    let center = if center.is_finite() {
        (center.round() as i64).clamp(0, last)
    } else {
        0
    };
    let start = center - i64::from(side / 2);
    let end = start + i64::from(side);
    let start = u32::try_from(start.max(0)).unwrap_or(0);
    let end = u32::try_from(end.min(i64::from(len))).unwrap_or(len);
    (start, end)
}

/// A standardized three-channel patch in `C × H × W` order, ready to be
/// batched as `[1, 3, side, side]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierInput {
    side: u32,
    data: Vec<f32>,
}

impl ClassifierInput {
    pub const CHANNELS: usize = 3;

    /// Replicate a square grayscale patch to three channels and apply
    /// [`IMAGENET_MEAN`] / [`IMAGENET_STD`].
    #[must_use]
    pub fn from_patch(patch: &FloatImage) -> Self {
        let side = patch.width();
        let plane: Vec<f32> = patch.pixels().map(|p| p.0[0]).collect();
        let mut data = Vec::with_capacity(plane.len() * Self::CHANNELS);
        for (mean, std) in IMAGENET_MEAN.iter().zip(IMAGENET_STD) {
            data.extend(plane.iter().map(|v| (v - mean) / std));
        }
        Self { side, data }
    }

    /// Crop around `centroid` and standardize in one step.
    #[must_use]
    pub fn around(image: &NormalizedImage, centroid: Point, side: u32) -> Self {
        Self::from_patch(&crop_patch(image, centroid, side))
    }

    /// Tensor shape `[batch, channels, height, width]`.
    #[must_use]
    pub fn shape(&self) -> [usize; 4] {
        let side = self.side as usize;
        [1, Self::CHANNELS, side, side]
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Pick the most likely class from `[false_positive, true_positive]`
/// scores (logits or probabilities). Ties go to false positive.
///
/// # Errors
///
/// Returns [`OracleError::Shape`] unless exactly two scores are given.
pub fn argmax_label(scores: &[f32]) -> Result<NoduleLabel, OracleError> {
    match *scores {
        [negative, positive] => Ok(if positive > negative {
            NoduleLabel::TruePositive
        } else {
            NoduleLabel::FalsePositive
        }),
        _ => Err(OracleError::Shape {
            expected: "2 class scores".to_string(),
            actual: format!("{} scores", scores.len()),
        }),
    }
}
