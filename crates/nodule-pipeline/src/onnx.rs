//! ONNX Runtime backed oracles.
//!
//! Each oracle owns one `ort` session behind a mutex (`Session::run`
//! needs `&mut self`). Models take a single `f32` NCHW input and produce
//! a single `f32` output:
//!
//! | model | input | output |
//! |---|---|---|
//! | segmentation | `[1, 1, S, S]` in `[0, 1]` | `[1, 1, S, S]` probabilities or logits |
//! | classification | `[1, 3, P, P]` standardized | `[1, 2]` class scores |

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ndarray::Array4;
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::{Session, SessionInputs};
use ort::value::TensorRef;

use crate::oracle::{ClassificationOracle, Device, OracleSlot, SegmentationOracle};
use crate::patch::{ClassifierInput, argmax_label};
use crate::types::{FloatImage, NoduleLabel, NormalizedImage, OracleError, ProbabilityMap};

/// How raw segmentation outputs become probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputActivation {
    /// The network already ends in a sigmoid.
    #[default]
    Identity,
    /// The network emits logits.
    Sigmoid,
}

fn load_session(path: &Path, device: Device) -> Result<Session, OracleError> {
    let load_error = |e: ort::Error| OracleError::Load {
        path: path.display().to_string(),
        message: e.to_string(),
    };
    tracing::info!(path = %path.display(), %device, "loading ONNX model");
    Session::builder()
        .map_err(load_error)?
        .with_execution_providers(execution_providers(device))
        .map_err(load_error)?
        .commit_from_file(path)
        .map_err(load_error)
}

fn execution_providers(device: Device) -> Vec<ExecutionProviderDispatch> {
    let cpu = CPUExecutionProvider::default().build();
    match device {
        Device::Cpu => vec![cpu],
        Device::Cuda(id) => vec![cuda_provider(id), cpu],
    }
}

#[cfg(feature = "cuda")]
fn cuda_provider(id: i32) -> ExecutionProviderDispatch {
    ort::execution_providers::CUDAExecutionProvider::default()
        .with_device_id(id)
        .build()
}

#[cfg(not(feature = "cuda"))]
fn cuda_provider(id: i32) -> ExecutionProviderDispatch {
    tracing::warn!(
        device_id = id,
        "built without CUDA support, running on CPU"
    );
    CPUExecutionProvider::default().build()
}

fn inference_error(e: impl std::fmt::Display) -> OracleError {
    OracleError::Inference(e.to_string())
}

/// Run a single-input, single-output model.
fn run_single(
    session: &Mutex<Session>,
    input: &Array4<f32>,
) -> Result<(Vec<i64>, Vec<f32>), OracleError> {
    let dims: Vec<i64> = input
        .shape()
        .iter()
        .map(|&d| i64::try_from(d).unwrap_or(i64::MAX))
        .collect();
    let data = input
        .as_slice()
        .ok_or_else(|| inference_error("input tensor is not contiguous"))?;
    let tensor = TensorRef::from_array_view((dims, data)).map_err(inference_error)?;

    let mut session = session.lock().map_err(|_| OracleError::LockPoisoned)?;
    let inputs: SessionInputs<'_, '_, 1> = SessionInputs::ValueArray([tensor.into()]);
    let outputs = session.run(inputs).map_err(inference_error)?;
    let (shape, values) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(inference_error)?;
    Ok((shape.iter().copied().collect(), values.to_vec()))
}

/// U-Net style segmentation model.
pub struct OnnxSegmenter {
    session: Mutex<Session>,
    activation: OutputActivation,
}

impl OnnxSegmenter {
    /// Load the model at `path` on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`OracleError::Load`] if the session cannot be created.
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<Self, OracleError> {
        Ok(Self {
            session: Mutex::new(load_session(path.as_ref(), device)?),
            activation: OutputActivation::default(),
        })
    }

    #[must_use]
    pub const fn with_activation(mut self, activation: OutputActivation) -> Self {
        self.activation = activation;
        self
    }

}

impl SegmentationOracle for OnnxSegmenter {
    fn predict(&self, image: &NormalizedImage) -> Result<ProbabilityMap, OracleError> {
        let (width, height) = image.image().dimensions();
        let input = Array4::from_shape_vec(
            (1, 1, height as usize, width as usize),
            image.image().as_raw().clone(),
        )
        .map_err(inference_error)?;

        let (shape, mut values) = run_single(&self.session, &input)?;
        if values.len() != (width as usize) * (height as usize) {
            return Err(OracleError::Shape {
                expected: format!("[1, 1, {height}, {width}]"),
                actual: format!("{shape:?}"),
            });
        }
        if self.activation == OutputActivation::Sigmoid {
            for v in &mut values {
                *v = 1.0 / (1.0 + (-*v).exp());
            }
        }
        FloatImage::from_raw(width, height, values)
            .map(ProbabilityMap::new)
            .ok_or_else(|| inference_error("probability map size mismatch"))
    }
}

/// Two-class nodule / false-positive patch classifier.
pub struct OnnxClassifier {
    session: Mutex<Session>,
}

impl OnnxClassifier {
    /// Load the model at `path` on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`OracleError::Load`] if the session cannot be created.
    pub fn load(path: impl AsRef<Path>, device: Device) -> Result<Self, OracleError> {
        Ok(Self {
            session: Mutex::new(load_session(path.as_ref(), device)?),
        })
    }
}

impl ClassificationOracle for OnnxClassifier {
    fn classify(&self, input: &ClassifierInput) -> Result<NoduleLabel, OracleError> {
        let [n, c, h, w] = input.shape();
        let array = Array4::from_shape_vec((n, c, h, w), input.data().to_vec())
            .map_err(inference_error)?;
        let (_, scores) = run_single(&self.session, &array)?;
        argmax_label(&scores)
    }
}

/// A slot that loads the segmentation model on first use.
#[must_use]
pub fn segmentation_slot(
    path: impl Into<PathBuf>,
    device: Device,
    activation: OutputActivation,
) -> OracleSlot<dyn SegmentationOracle> {
    let path = path.into();
    OracleSlot::new(move || {
        let oracle = OnnxSegmenter::load(&path, device)?.with_activation(activation);
        Ok(Arc::new(oracle) as Arc<dyn SegmentationOracle>)
    })
}

/// A slot that loads the classification model on first use.
#[must_use]
pub fn classification_slot(
    path: impl Into<PathBuf>,
    device: Device,
) -> OracleSlot<dyn ClassificationOracle> {
    let path = path.into();
    OracleSlot::new(move || {
        let oracle = OnnxClassifier::load(&path, device)?;
        Ok(Arc::new(oracle) as Arc<dyn ClassificationOracle>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_is_a_load_error() {
        let slot = segmentation_slot("does/not/exist.onnx", Device::Cpu, OutputActivation::Sigmoid);
        assert!(matches!(
            slot.get(),
            Err(OracleError::Unavailable(ref m)) if m.contains("does/not/exist.onnx")
        ));
        assert!(!slot.is_initialized());
    }
}
