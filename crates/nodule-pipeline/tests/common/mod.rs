//! Stub oracles and input builders shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Mutex;

use image::{GrayImage, Luma};
use nodule_pipeline::types::FloatImage;
use nodule_pipeline::{
    ClassificationOracle, ClassifierInput, NoduleLabel, NormalizedImage, OracleError,
    ProbabilityMap, SegmentationOracle,
};

/// Returns the same probability map for every input.
pub struct FixedMap(pub ProbabilityMap);

impl SegmentationOracle for FixedMap {
    fn predict(&self, _: &NormalizedImage) -> Result<ProbabilityMap, OracleError> {
        Ok(self.0.clone())
    }
}

/// Returns its input as the probability map.
pub struct Echo;

impl SegmentationOracle for Echo {
    fn predict(&self, image: &NormalizedImage) -> Result<ProbabilityMap, OracleError> {
        Ok(ProbabilityMap::new(image.image().clone()))
    }
}

/// Fails every forward pass.
pub struct Broken;

impl SegmentationOracle for Broken {
    fn predict(&self, _: &NormalizedImage) -> Result<ProbabilityMap, OracleError> {
        Err(OracleError::Inference("device lost".to_string()))
    }
}

/// Answers classification calls from a script, in call order. Calls past
/// the end of the script fail.
pub struct Scripted {
    answers: Mutex<Vec<Result<NoduleLabel, String>>>,
}

impl Scripted {
    pub fn new(mut answers: Vec<Result<NoduleLabel, String>>) -> Self {
        answers.reverse();
        Self {
            answers: Mutex::new(answers),
        }
    }
}

impl ClassificationOracle for Scripted {
    fn classify(&self, input: &ClassifierInput) -> Result<NoduleLabel, OracleError> {
        assert_eq!(input.shape(), [1, 3, 64, 64]);
        self.answers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Err("script exhausted".to_string()))
            .map_err(OracleError::Inference)
    }
}

/// Probability 1 inside any of `squares` (`x, y, side`), 0 elsewhere.
pub fn square_map(size: u32, squares: &[(u32, u32, u32)]) -> ProbabilityMap {
    ProbabilityMap::new(FloatImage::from_fn(size, size, |x, y| {
        let inside = squares
            .iter()
            .any(|&(sx, sy, side)| (sx..sx + side).contains(&x) && (sy..sy + side).contains(&y));
        Luma([if inside { 1.0 } else { 0.0 }])
    }))
}

/// Probability 1 inside any disk of `radius` around `centers`.
pub fn disk_map(size: u32, centers: &[(f64, f64)], radius: f64) -> ProbabilityMap {
    ProbabilityMap::new(FloatImage::from_fn(size, size, |x, y| {
        let inside = centers
            .iter()
            .any(|&(cx, cy)| (f64::from(x) - cx).hypot(f64::from(y) - cy) <= radius);
        Luma([if inside { 1.0 } else { 0.0 }])
    }))
}

/// Uniform gray PNG of the given size.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    png_from(&GrayImage::from_pixel(width, height, Luma([60])))
}

pub fn png_from(img: &GrayImage) -> Vec<u8> {
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

/// Explicit VR little endian DICOM slice of unsigned 16-bit samples
/// with the given rescale intercept.
pub fn dicom(width: u16, height: u16, intercept: &str, pixel: impl Fn(u16, u16) -> u16) -> Vec<u8> {
    fn element(buf: &mut Vec<u8>, group: u16, elem: u16, vr: &[u8; 2], value: &[u8]) {
        let mut value = value.to_vec();
        if value.len() % 2 == 1 {
            value.push(if vr == b"UI" { 0 } else { b' ' });
        }
        buf.extend(group.to_le_bytes());
        buf.extend(elem.to_le_bytes());
        buf.extend(vr);
        if vr == b"OW" {
            buf.extend([0, 0]);
            buf.extend(u32::try_from(value.len()).unwrap().to_le_bytes());
        } else {
            buf.extend(u16::try_from(value.len()).unwrap().to_le_bytes());
        }
        buf.extend(value);
    }

    let mut buf = vec![0; 128];
    buf.extend(b"DICM");
    element(&mut buf, 0x0002, 0x0010, b"UI", b"1.2.840.10008.1.2.1");
    element(&mut buf, 0x0028, 0x0002, b"US", &1_u16.to_le_bytes());
    element(&mut buf, 0x0028, 0x0010, b"US", &height.to_le_bytes());
    element(&mut buf, 0x0028, 0x0011, b"US", &width.to_le_bytes());
    element(&mut buf, 0x0028, 0x0100, b"US", &16_u16.to_le_bytes());
    element(&mut buf, 0x0028, 0x0103, b"US", &0_u16.to_le_bytes());
    element(&mut buf, 0x0028, 0x1052, b"DS", intercept.as_bytes());
    let mut pixels = Vec::new();
    for y in 0..height {
        for x in 0..width {
            pixels.extend(pixel(x, y).to_le_bytes());
        }
    }
    element(&mut buf, 0x7FE0, 0x0010, b"OW", &pixels);
    buf
}
