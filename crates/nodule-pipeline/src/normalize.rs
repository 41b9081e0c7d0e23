//! Intensity normalization: decoded intensities to `[0, 1]`.
//!
//! Calibrated input (DICOM) goes through the rescale transform, is
//! clipped to the configured window and linearly mapped onto `[0, 1]`:
//!
//! ```text
//! hu   = raw × slope + intercept
//! norm = (clamp(hu, lo, hi) − lo) / (hi − lo)      lo/hi = center ∓ width/2
//! ```
//!
//! Uncalibrated input (8-bit raster) skips windowing and is divided by
//! 255. Out-of-window values are clipped, never rejected.

use crate::types::{DecodedImage, FloatImage, PipelineConfig};

/// Intensity window in Hounsfield units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub center: f64,
    pub width: f64,
}

impl Window {
    /// Lung window: the range in which lung parenchyma is visible.
    pub const LUNG: Self = Self {
        center: PipelineConfig::DEFAULT_WINDOW_CENTER,
        width: PipelineConfig::DEFAULT_WINDOW_WIDTH,
    };

    #[must_use]
    pub const fn new(center: f64, width: f64) -> Self {
        Self { center, width }
    }

    /// The window a pipeline run applies.
    #[must_use]
    pub const fn of(config: &PipelineConfig) -> Self {
        Self::new(config.window_center, config.window_width)
    }

    /// Lower bound of the window.
    #[must_use]
    pub fn lower(&self) -> f64 {
        self.center - self.width / 2.0
    }

    /// Upper bound of the window.
    #[must_use]
    pub fn upper(&self) -> f64 {
        self.center + self.width / 2.0
    }

    /// Clip `hu` to the window and rescale to `[0, 1]`.
    ///
    /// Non-finite input maps to 0.
    #[must_use]
    pub fn apply(&self, hu: f64) -> f64 {
        if !hu.is_finite() {
            return 0.0;
        }
        let (lo, hi) = (self.lower(), self.upper());
        (hu.clamp(lo, hi) - lo) / (hi - lo)
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::LUNG
    }
}

/// Divisor for uncalibrated 8-bit input.
const RASTER_FULL_SCALE: f32 = 255.0;

/// Normalize a decoded image to `[0, 1]` at its original resolution.
///
/// `window` must have a positive width; the pipeline config validates
/// this before any request runs.
#[must_use = "returns the normalized image"]
#[allow(clippy::cast_possible_truncation)]
pub fn normalize(decoded: &DecodedImage, window: Window) -> FloatImage {
    let mut out = decoded.pixels.clone();
    match decoded.calibration {
        Some(calibration) => {
            for p in out.pixels_mut() {
                let hu = calibration.apply(f64::from(p.0[0]));
                p.0[0] = window.apply(hu) as f32;
            }
        }
        None => {
            for p in out.pixels_mut() {
                let v = p.0[0] / RASTER_FULL_SCALE;
                p.0[0] = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
            }
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{Calibration, SourceFormat};

    fn dicom(values: Vec<f32>, calibration: Calibration) -> DecodedImage {
        let width = u32::try_from(values.len()).unwrap();
        DecodedImage {
            pixels: FloatImage::from_vec(width, 1, values).unwrap(),
            calibration: Some(calibration),
            format: SourceFormat::Dicom,
        }
    }

    fn values(image: &FloatImage) -> Vec<f32> {
        image.pixels().map(|p| p.0[0]).collect()
    }

    #[test]
    fn lung_window_bounds() {
        assert!((Window::LUNG.lower() + 1350.0).abs() < f64::EPSILON);
        assert!((Window::LUNG.upper() - 150.0).abs() < f64::EPSILON);
        assert_eq!(Window::default(), Window::LUNG);
        assert_eq!(Window::of(&PipelineConfig::default()), Window::LUNG);
    }

    #[test]
    fn window_edges_and_center() {
        let w = Window::LUNG;
        assert!(w.apply(-1350.0).abs() < 1e-12);
        assert!((w.apply(150.0) - 1.0).abs() < 1e-12);
        assert!((w.apply(-600.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn out_of_window_values_are_clipped() {
        let w = Window::LUNG;
        assert!(w.apply(-3000.0).abs() < 1e-12);
        assert!((w.apply(3000.0) - 1.0).abs() < 1e-12);
        assert!(w.apply(f64::NAN).abs() < 1e-12);
    }

    #[test]
    fn calibration_is_applied_before_windowing() {
        // Stored 424 with intercept -1024 is -600 HU: the window center.
        // Stored 0 is -1024 HU, 326 HU above the window floor of -1350.
        let decoded = dicom(
            vec![424.0, 0.0, 5000.0],
            Calibration {
                slope: 1.0,
                intercept: -1024.0,
            },
        );
        let out = values(&normalize(&decoded, Window::LUNG));
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[1] - 326.0 / 1500.0).abs() < 1e-6);
        assert!((out[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn slope_scales_stored_values() {
        let decoded = dicom(
            vec![-300.0],
            Calibration {
                slope: 2.0,
                intercept: 0.0,
            },
        );
        let out = values(&normalize(&decoded, Window::LUNG));
        assert!((out[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn raster_input_skips_windowing() {
        let decoded = DecodedImage {
            pixels: FloatImage::from_vec(3, 1, vec![0.0, 51.0, 255.0]).unwrap(),
            calibration: None,
            format: SourceFormat::Raster,
        };
        let out = values(&normalize(&decoded, Window::LUNG));
        assert!(out[0].abs() < 1e-6);
        assert!((out[1] - 0.2).abs() < 1e-6);
        assert!((out[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn output_stays_in_unit_range() {
        let decoded = dicom(
            (-40..40).map(|v| (v * 100) as f32).collect(),
            Calibration::IDENTITY,
        );
        for v in values(&normalize(&decoded, Window::new(40.0, 400.0))) {
            assert!((0.0..=1.0).contains(&v), "value {v} escaped [0, 1]");
        }
    }
}
