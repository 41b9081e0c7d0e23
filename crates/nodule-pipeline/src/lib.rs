//! nodule-pipeline: lung nodule detection on a single CT slice (sans-IO).
//!
//! Turns the raw bytes of one slice (DICOM or a standard raster) into a
//! list of numbered nodule outlines through:
//! decode -> window/normalize -> resize to canonical -> segmentation ->
//! threshold -> candidate extraction -> optional classification ->
//! mask composition -> resize to original -> contour/box extraction.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! byte slices and returns structured data. The learned models sit
//! behind the [`SegmentationOracle`] and [`ClassificationOracle`]
//! traits; ONNX Runtime implementations are available with the `onnx`
//! feature.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

pub mod compose;
pub mod contour;
pub mod decode;
pub mod dicom;
pub mod geometry;
pub mod normalize;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod oracle;
pub mod patch;
pub mod regions;
pub mod resize;
pub mod types;
pub mod watershed;

pub use contour::{ContourTracer, ContourTracerKind};
pub use oracle::{ClassificationOracle, Device, OracleSlot, SegmentationOracle};
pub use patch::ClassifierInput;
pub use regions::{CandidateExtractor, ExtractorKind};
pub use types::{
    DecodeError, DetectionResponse, DetectionResult, DetectionSummary, Dimensions, Geometry,
    NoduleLabel, NormalizedImage, OracleError, OutputMode, PipelineConfig, PipelineError,
    PixelPoint, ProbabilityMap, Rect, Variant,
};

use crate::geometry::{BoxF, Scale};
use crate::normalize::Window;
use crate::types::{CandidateRegion, Verdict};

/// Run the full detection pipeline.
///
/// See [`detect_with_summary`].
///
/// # Errors
///
/// As [`detect_with_summary`].
pub fn detect(
    image_bytes: &[u8],
    config: &PipelineConfig,
    segmenter: &dyn SegmentationOracle,
    classifier: Option<&dyn ClassificationOracle>,
) -> Result<Vec<DetectionResult>, PipelineError> {
    detect_with_summary(image_bytes, config, segmenter, classifier).map(|(results, _)| results)
}

/// Run the full detection pipeline and report what happened on the way.
///
/// # Pipeline steps
///
/// 1. Decode (DICOM first, raster fallback)
/// 2. Window and normalize to `[0, 1]`
/// 3. Resize to the canonical resolution
/// 4. Segmentation oracle
/// 5. Threshold and extract candidates (variant's policy)
/// 6. Classify candidates (two-stage variant only)
/// 7. Compose accepted candidates into one mask
/// 8. Resize the mask back to the original resolution
/// 9. Trace contours or boxes and number them
///
/// Empty maps and masks short-circuit to an empty list. A classifier
/// error rejects that one candidate and the request carries on. A
/// two-stage run without a classifier yields an empty list.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] if `config` fails
/// validation, [`PipelineError::Decode`] for undecodable input when
/// `config.strict_decode` is set (otherwise the list is empty), and
/// [`PipelineError::Oracle`] if segmentation inference fails.
pub fn detect_with_summary(
    image_bytes: &[u8],
    config: &PipelineConfig,
    segmenter: &dyn SegmentationOracle,
    classifier: Option<&dyn ClassificationOracle>,
) -> Result<(Vec<DetectionResult>, DetectionSummary), PipelineError> {
    config.validate()?;
    let mut summary = DetectionSummary::default();

    // 1. Decode.
    let decoded = match decode::decode(image_bytes) {
        Ok(decoded) => decoded,
        Err(e) if config.strict_decode => return Err(e.into()),
        Err(e) => {
            warn!(error = %e, "could not decode input, reporting no nodules");
            return Ok((Vec::new(), summary));
        }
    };
    let original = decoded.dimensions();
    summary.source = Some(decoded.format);
    summary.original = Some(original);
    info!(
        format = ?decoded.format,
        width = original.width,
        height = original.height,
        "decoded input"
    );
    if original.is_empty() {
        warn!("input has no pixels");
        return Ok((Vec::new(), summary));
    }

    // 2. Window and normalize.
    let window = Window::of(config);
    let normalized = normalize::normalize(&decoded, window);

    // 3. Canonical resolution.
    let canonical = config.canonical();
    let working = resize::to_canonical(&normalized, canonical);

    // 4. Segmentation.
    let map = segmenter.predict(&working)?;
    if map.dimensions() != canonical {
        return Err(OracleError::Shape {
            expected: format!("{}x{}", canonical.width, canonical.height),
            actual: format!("{}x{}", map.dimensions().width, map.dimensions().height),
        }
        .into());
    }

    // 5. Threshold and extract candidates.
    let mask = regions::threshold(&map, config.probability_threshold);
    if regions::is_empty(&mask) {
        info!("probability map has no foreground");
        return Ok((Vec::new(), summary));
    }
    let mut candidates = config.variant.extractor().extract(&mask, config);
    summary.candidates = candidates.len();
    debug!(count = candidates.len(), "extracted candidates");

    // 6. Classification.
    if config.variant.classifies() {
        let Some(classifier) = classifier else {
            error!("two-stage variant requires a classification oracle");
            return Ok((Vec::new(), summary));
        };
        classify_candidates(&mut candidates, &working, classifier, config.patch_size);
    }
    summary.accepted = candidates.iter().filter(|c| c.is_accepted()).count();
    summary.rejected = candidates
        .iter()
        .filter(|c| c.verdict == Some(Verdict::Rejected))
        .count();
    log_candidates(&candidates, Scale::between(original, canonical));

    // 7. Compose.
    let final_mask = compose::compose(&candidates, canonical);
    if regions::is_empty(&final_mask) {
        info!(candidates = summary.candidates, "no candidate accepted");
        return Ok((Vec::new(), summary));
    }

    // 8. Back to original resolution.
    let restored = resize::mask_to(&final_mask, original);

    // 9. Trace and number.
    let extraction = contour::extract(
        &restored,
        config.output_mode(),
        config,
        &ContourTracerKind::default(),
    );
    summary.discarded = extraction.discarded;
    info!(
        nodules = extraction.results.len(),
        discarded = extraction.discarded,
        "detection finished"
    );
    Ok((extraction.results, summary))
}

/// Set the verdict of every candidate from the classifier. A failed call
/// rejects its candidate.
fn classify_candidates(
    candidates: &mut [CandidateRegion],
    image: &NormalizedImage,
    classifier: &dyn ClassificationOracle,
    patch_size: u32,
) {
    for candidate in candidates {
        let input = ClassifierInput::around(image, candidate.centroid, patch_size);
        let verdict = match classifier.classify(&input) {
            Ok(label) => Verdict::from(label),
            Err(e) => {
                warn!(label = candidate.label, error = %e, "classification failed, rejecting candidate");
                Verdict::Rejected
            }
        };
        candidate.verdict = Some(verdict);
    }
}

fn log_candidates(candidates: &[CandidateRegion], scale: Scale) {
    for c in candidates {
        let centroid = scale.to_original(c.centroid);
        let bbox = BoxF::from_rect(&c.bbox).to_original(scale).round();
        debug!(
            label = c.label,
            area = c.area,
            verdict = ?c.verdict,
            x = centroid.x,
            y = centroid.y,
            ?bbox,
            "candidate"
        );
    }
}

/// A configured pipeline sharing process-wide oracle slots.
///
/// `Detector` is `Send + Sync`; one instance serves concurrent requests.
/// Oracles are loaded on first use (see [`OracleSlot`]).
#[derive(Debug, Clone)]
pub struct Detector {
    config: PipelineConfig,
    segmenter: Arc<OracleSlot<dyn SegmentationOracle>>,
    classifier: Option<Arc<OracleSlot<dyn ClassificationOracle>>>,
}

impl Detector {
    /// A detector without a classifier.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] if `config` fails
    /// validation.
    pub fn new(
        config: PipelineConfig,
        segmenter: Arc<OracleSlot<dyn SegmentationOracle>>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            segmenter,
            classifier: None,
        })
    }

    /// Attach the classifier used by the two-stage variant.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<OracleSlot<dyn ClassificationOracle>>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Detect nodules in one image.
    ///
    /// # Errors
    ///
    /// As [`detect_with_summary`], plus [`OracleError::LockPoisoned`]
    /// if an oracle slot is poisoned.
    pub fn detect(&self, image_bytes: &[u8]) -> Result<Vec<DetectionResult>, PipelineError> {
        self.detect_with_summary(image_bytes)
            .map(|(results, _)| results)
    }

    /// Detect nodules and report run counts.
    ///
    /// An oracle that fails to initialize yields an empty list and an
    /// error log instead of an error.
    ///
    /// # Errors
    ///
    /// As [`detect`](Self::detect).
    pub fn detect_with_summary(
        &self,
        image_bytes: &[u8],
    ) -> Result<(Vec<DetectionResult>, DetectionSummary), PipelineError> {
        let Some(segmenter) = resolve(&self.segmenter, "segmentation")? else {
            return Ok((Vec::new(), DetectionSummary::default()));
        };

        let classifier = if self.config.variant.classifies() {
            let Some(slot) = &self.classifier else {
                error!("two-stage variant requires a classification oracle");
                return Ok((Vec::new(), DetectionSummary::default()));
            };
            let Some(classifier) = resolve(slot, "classification")? else {
                return Ok((Vec::new(), DetectionSummary::default()));
            };
            Some(classifier)
        } else {
            None
        };

        detect_with_summary(
            image_bytes,
            &self.config,
            segmenter.as_ref(),
            classifier.as_deref(),
        )
    }
}

/// Fetch an oracle, mapping "unavailable" to `None` with an error log.
fn resolve<T: ?Sized>(slot: &OracleSlot<T>, role: &str) -> Result<Option<Arc<T>>, PipelineError> {
    match slot.get() {
        Ok(oracle) => Ok(Some(oracle)),
        Err(OracleError::Unavailable(reason)) => {
            error!(oracle = role, %reason, "oracle unavailable, reporting no nodules");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::FloatImage;

    struct Flat(f32);

    impl SegmentationOracle for Flat {
        fn predict(&self, image: &NormalizedImage) -> Result<ProbabilityMap, OracleError> {
            let (w, h) = image.image().dimensions();
            Ok(ProbabilityMap::new(FloatImage::from_pixel(
                w,
                h,
                image::Luma([self.0]),
            )))
        }
    }

    struct Tiny;

    impl SegmentationOracle for Tiny {
        fn predict(&self, _: &NormalizedImage) -> Result<ProbabilityMap, OracleError> {
            Ok(ProbabilityMap::new(FloatImage::new(8, 8)))
        }
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::GrayImage::from_pixel(width, height, image::Luma([90]));
        let mut buf = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buf);
        image::ImageEncoder::write_image(
            encoder,
            img.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::L8,
        )
        .unwrap();
        buf
    }

    #[test]
    fn empty_input_is_empty_result_unless_strict() {
        let config = PipelineConfig::default();
        assert!(detect(&[], &config, &Flat(1.0), None).unwrap().is_empty());

        let strict = PipelineConfig {
            strict_decode: true,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            detect(&[], &strict, &Flat(1.0), None),
            Err(PipelineError::Decode(DecodeError::Empty))
        ));
    }

    #[test]
    fn all_zero_map_gives_no_nodules() {
        let (results, summary) =
            detect_with_summary(&png(100, 80), &PipelineConfig::default(), &Flat(0.0), None)
                .unwrap();
        assert!(results.is_empty());
        assert_eq!(summary.original, Some(Dimensions::new(100, 80)));
        assert_eq!(summary.candidates, 0);
    }

    #[test]
    fn full_map_gives_one_frame_sized_nodule() {
        let (results, summary) =
            detect_with_summary(&png(100, 80), &PipelineConfig::default(), &Flat(0.9), None)
                .unwrap();
        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.accepted, 1);
        assert_eq!(results.len(), 1);
        let Geometry::Contour { contour } = &results[0].geometry else {
            unreachable!("default variant emits contours");
        };
        assert_eq!(Rect::bounding(contour), Some(Rect::new(0, 0, 100, 80)));
    }

    #[test]
    fn wrong_map_size_is_an_oracle_error() {
        let result = detect(&png(20, 20), &PipelineConfig::default(), &Tiny, None);
        assert!(matches!(
            result,
            Err(PipelineError::Oracle(OracleError::Shape { .. }))
        ));
    }

    #[test]
    fn two_stage_without_classifier_is_empty() {
        let config = PipelineConfig {
            variant: Variant::TwoStage,
            ..PipelineConfig::default()
        };
        assert!(detect(&png(64, 64), &config, &Flat(0.9), None).unwrap().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected_before_decoding() {
        for config in [
            PipelineConfig {
                canonical_size: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                peak_min_distance: 0,
                ..PipelineConfig::default()
            },
        ] {
            let (bytes, oracle) = (png(64, 64), Flat(0.9));
            assert!(matches!(
                detect(&bytes, &config, &oracle, None),
                Err(PipelineError::InvalidConfig(_))
            ));
            assert!(matches!(
                detect(b"not an image", &config, &oracle, None),
                Err(PipelineError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn detector_rejects_invalid_config() {
        let slot: Arc<OracleSlot<dyn SegmentationOracle>> =
            Arc::new(OracleSlot::ready(Arc::new(Flat(0.0)) as Arc<dyn SegmentationOracle>));
        let config = PipelineConfig {
            patch_size: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            Detector::new(config, slot),
            Err(PipelineError::InvalidConfig(_))
        ));
    }
}
