//! Resampling between original and canonical resolution.
//!
//! The forward direction interpolates: intensities are continuous, so a
//! bilinear (triangle) filter is the right tool. The inverse direction
//! carries binary masks and must not invent blended values at region
//! boundaries, so it samples the nearest source pixel.
//!
//! Both directions are no-ops when the sizes already match.

use image::imageops::{self, FilterType};

use crate::types::{Dimensions, FloatImage, GrayImage, NormalizedImage};

/// Filter used for every interpolating resize.
const INTERPOLATION: FilterType = FilterType::Triangle;

/// Resample a normalized image to the canonical working resolution.
#[must_use = "returns the canonical-size image"]
pub fn to_canonical(image: &FloatImage, canonical: Dimensions) -> NormalizedImage {
    if Dimensions::of(image) == canonical {
        return NormalizedImage::new(image.clone());
    }
    NormalizedImage::new(imageops::resize(
        image,
        canonical.width,
        canonical.height,
        INTERPOLATION,
    ))
}

/// Resample a float patch to `side × side` with smoothing.
#[must_use = "returns the resized patch"]
pub fn resize_patch(patch: &FloatImage, side: u32) -> FloatImage {
    if Dimensions::of(patch) == Dimensions::square(side) {
        return patch.clone();
    }
    imageops::resize(patch, side, side, INTERPOLATION)
}

/// Resample a binary mask to `target` with nearest-neighbor sampling.
///
/// Destination pixel `(x, y)` takes source pixel
/// `(floor(x · w / W), floor(y · h / H))` for a `w × h` mask resized to
/// `W × H`. Integer arithmetic keeps exact multiples exact. The output
/// only ever holds values present in the input.
#[must_use = "returns the resized mask"]
pub fn mask_to(mask: &GrayImage, target: Dimensions) -> GrayImage {
    let source = Dimensions::of(mask);
    if source == target || source.is_empty() {
        return if source == target {
            mask.clone()
        } else {
            GrayImage::new(target.width, target.height)
        };
    }
    GrayImage::from_fn(target.width, target.height, |x, y| {
        let sx = nearest_index(x, source.width, target.width);
        let sy = nearest_index(y, source.height, target.height);
        *mask.get_pixel(sx, sy)
    })
}

fn nearest_index(dst: u32, source_len: u32, target_len: u32) -> u32 {
    let index = u64::from(dst) * u64::from(source_len) / u64::from(target_len);
    u32::try_from(index).map_or(source_len - 1, |i| i.min(source_len - 1))
}
