//! Input decoding: DICOM first, raster fallback.
//!
//! [`probe`] tries each decoder in turn and reports which one recognized
//! the bytes as an explicit [`Probe`] value, so every failure path is a
//! match arm rather than an error caught and retried.

use image::ImageError;

use crate::dicom;
use crate::types::{Calibration, DecodeError, DecodedImage, FloatImage, SourceFormat};

/// Outcome of format detection.
#[derive(Debug)]
pub enum Probe {
    /// A DICOM stream with native grayscale pixel data.
    Dicom(DecodedImage),
    /// A raster encoding the `image` crate understands.
    Raster(DecodedImage),
    /// Neither decoder recognized the bytes.
    Unrecognized,
}

/// Detect the input format and decode it.
///
/// DICOM is tried first. Bytes that are not DICOM fall through to the
/// `image` crate; bytes that neither recognizes yield
/// [`Probe::Unrecognized`].
///
/// # Errors
///
/// Returns [`DecodeError::Empty`] for empty input,
/// [`DecodeError::Dicom`] for a recognized but unreadable DICOM stream,
/// and [`DecodeError::Raster`] for a recognized but corrupt raster.
pub fn probe(bytes: &[u8]) -> Result<Probe, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    if let Some(slice) = dicom::read(bytes)? {
        let calibration = Calibration {
            slope: slice.rescale_slope.unwrap_or(Calibration::IDENTITY.slope),
            intercept: slice
                .rescale_intercept
                .unwrap_or(Calibration::IDENTITY.intercept),
        };
        let pixels = FloatImage::from_raw(slice.columns, slice.rows, slice.pixels).ok_or_else(
            || {
                DecodeError::Dicom(dicom::DicomError::PixelLayout(
                    "pixel count does not match rows x columns".to_string(),
                ))
            },
        )?;
        return Ok(Probe::Dicom(DecodedImage {
            pixels,
            calibration: Some(calibration),
            format: SourceFormat::Dicom,
        }));
    }

    match image::load_from_memory(bytes) {
        Ok(img) => {
            let gray = img.to_luma8();
            let pixels = FloatImage::from_fn(gray.width(), gray.height(), |x, y| {
                image::Luma([f32::from(gray.get_pixel(x, y).0[0])])
            });
            Ok(Probe::Raster(DecodedImage {
                pixels,
                calibration: None,
                format: SourceFormat::Raster,
            }))
        }
        Err(ImageError::Unsupported(_)) => Ok(Probe::Unrecognized),
        Err(e) => Err(DecodeError::Raster(e)),
    }
}

/// Decode raw bytes into a [`DecodedImage`].
///
/// # Errors
///
/// As [`probe`], plus [`DecodeError::Unrecognized`] when no decoder
/// recognizes the bytes.
pub fn decode(bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
    match probe(bytes)? {
        Probe::Dicom(image) | Probe::Raster(image) => Ok(image),
        Probe::Unrecognized => Err(DecodeError::Unrecognized),
    }
}
