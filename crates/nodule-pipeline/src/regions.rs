//! Candidate region extraction: probability map to disjoint regions.
//!
//! This module defines the [`CandidateExtractor`] trait for pluggable
//! extraction policies and the [`ExtractorKind`] enum for selecting one
//! at runtime. Both policies start from the same thresholded mask and
//! end in the same [`regions_from_labels`] step, so they differ only in
//! how foreground pixels are grouped:
//!
//! - [`ExtractorKind::ConnectedComponents`] groups 8-connected pixels and
//!   drops small components. Survivors are pre-accepted.
//! - [`ExtractorKind::Watershed`] splits touching blobs around distance
//!   peaks (see [`crate::watershed`]). Verdicts are left for the
//!   classifier.

use std::collections::BTreeMap;

use image::Luma;
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::{Deserialize, Serialize};

use crate::types::{
    CandidateRegion, GrayImage, MASK_ON, PipelineConfig, Point, ProbabilityMap, Rect, Verdict,
};
use crate::watershed;

/// Per-pixel region labels. 0 is background.
pub type LabelImage = image::ImageBuffer<Luma<u32>, Vec<u32>>;

/// Binarize a probability map: values strictly above `cutoff` become
/// [`MASK_ON`], everything else 0.
#[must_use = "returns the binary mask"]
pub fn threshold(map: &ProbabilityMap, cutoff: f32) -> GrayImage {
    let image = map.image();
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([if image.get_pixel(x, y).0[0] > cutoff {
            MASK_ON
        } else {
            0
        }])
    })
}

/// Returns `true` if no pixel of `mask` is set.
#[must_use]
pub fn is_empty(mask: &GrayImage) -> bool {
    mask.as_raw().iter().all(|&v| v == 0)
}

/// Selects which candidate extraction policy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExtractorKind {
    /// 8-connected components with a minimum pixel area.
    #[default]
    ConnectedComponents,

    /// Distance-transform peaks flooded back over the mask.
    Watershed,
}

/// Trait for candidate extraction strategies.
///
/// Input: a binary mask at canonical size (nonzero = foreground).
/// Output: pairwise pixel-disjoint regions in label order.
pub trait CandidateExtractor {
    /// Group the foreground pixels of `mask` into candidate regions.
    fn extract(&self, mask: &GrayImage, config: &PipelineConfig) -> Vec<CandidateRegion>;
}

impl CandidateExtractor for ExtractorKind {
    fn extract(&self, mask: &GrayImage, config: &PipelineConfig) -> Vec<CandidateRegion> {
        if is_empty(mask) {
            return Vec::new();
        }
        match *self {
            Self::ConnectedComponents => {
                filtered_components(mask, config.min_component_area)
            }
            Self::Watershed => watershed::split(mask, config.peak_min_distance),
        }
    }
}

/// Label 8-connected components and keep those of at least `min_area`
/// pixels, each pre-accepted.
#[must_use]
pub fn filtered_components(mask: &GrayImage, min_area: u32) -> Vec<CandidateRegion> {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    regions_from_labels(&labels)
        .into_iter()
        .filter(|region| region.area >= min_area)
        .map(|mut region| {
            region.verdict = Some(Verdict::Accepted);
            region
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct RegionStats {
    area: u32,
    sum_x: f64,
    sum_y: f64,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

impl RegionStats {
    fn new(x: u32, y: u32) -> Self {
        Self {
            area: 0,
            sum_x: 0.0,
            sum_y: 0.0,
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        }
    }

    fn add(&mut self, x: u32, y: u32) {
        self.area += 1;
        self.sum_x += f64::from(x);
        self.sum_y += f64::from(y);
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }
}

/// Build one [`CandidateRegion`] per nonzero label, in ascending label
/// order.
///
/// The centroid is the mean pixel coordinate. The region mask covers
/// exactly the bounding box. Verdicts are left unset.
#[must_use]
pub fn regions_from_labels(labels: &LabelImage) -> Vec<CandidateRegion> {
    let mut stats: BTreeMap<u32, RegionStats> = BTreeMap::new();
    for (x, y, p) in labels.enumerate_pixels() {
        let label = p.0[0];
        if label != 0 {
            stats
                .entry(label)
                .or_insert_with(|| RegionStats::new(x, y))
                .add(x, y);
        }
    }

    stats
        .into_iter()
        .map(|(label, s)| {
            let width = s.max_x - s.min_x + 1;
            let height = s.max_y - s.min_y + 1;
            let mask = GrayImage::from_fn(width, height, |x, y| {
                let inside = labels.get_pixel(s.min_x + x, s.min_y + y).0[0] == label;
                Luma([if inside { MASK_ON } else { 0 }])
            });
            let area = f64::from(s.area);
            CandidateRegion {
                label,
                centroid: Point::new(s.sum_x / area, s.sum_y / area),
                bbox: Rect::new(
                    to_i32(s.min_x),
                    to_i32(s.min_y),
                    to_i32(width),
                    to_i32(height),
                ),
                mask,
                area: s.area,
                verdict: None,
            }
        })
        .collect()
}

fn to_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}
