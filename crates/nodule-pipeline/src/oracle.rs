//! Oracle contracts and process-wide oracle state.
//!
//! The segmentation and classification models are opaque: the pipeline
//! only needs [`SegmentationOracle`] and [`ClassificationOracle`].
//! Implementations must be `Send + Sync` because one instance serves
//! every concurrent request.
//!
//! # Init-once contract
//!
//! [`OracleSlot`] holds an oracle that is loaded on first use:
//!
//! - the loader runs at most once per slot, under the slot's lock, so
//!   concurrent first callers block until it finishes and never see a
//!   partially built oracle;
//! - a successful load is shared by every later call as an `Arc`;
//! - a failed load is remembered and reported as
//!   [`OracleError::Unavailable`] on every later call without retrying.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::patch::ClassifierInput;
use crate::types::{NoduleLabel, NormalizedImage, OracleError, ProbabilityMap};

/// Pixel-wise nodule segmentation.
pub trait SegmentationOracle: Send + Sync {
    /// Map a canonical-size normalized image to a probability map of the
    /// same size.
    ///
    /// # Errors
    ///
    /// Returns an [`OracleError`] if inference fails or produces an
    /// output of the wrong shape.
    fn predict(&self, image: &NormalizedImage) -> Result<ProbabilityMap, OracleError>;
}

/// Binary nodule / false-positive classification of one patch.
pub trait ClassificationOracle: Send + Sync {
    /// Classify one standardized patch.
    ///
    /// # Errors
    ///
    /// Returns an [`OracleError`] if inference fails.
    fn classify(&self, input: &ClassifierInput) -> Result<NoduleLabel, OracleError>;
}

/// Compute device, chosen once when the oracles are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    /// CUDA device by ordinal.
    Cuda(i32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

type Loader<T> = Box<dyn FnOnce() -> Result<Arc<T>, OracleError> + Send>;

enum SlotState<T: ?Sized> {
    Pending(Loader<T>),
    Ready(Arc<T>),
    Failed(String),
}

/// Lazily initialized, process-wide oracle holder.
pub struct OracleSlot<T: ?Sized> {
    state: Mutex<SlotState<T>>,
}

impl<T: ?Sized> OracleSlot<T> {
    /// A slot that runs `loader` on first [`get`](Self::get).
    pub fn new<F>(loader: F) -> Self
    where
        F: FnOnce() -> Result<Arc<T>, OracleError> + Send + 'static,
    {
        Self {
            state: Mutex::new(SlotState::Pending(Box::new(loader))),
        }
    }

    /// A slot that is already initialized.
    #[must_use]
    pub fn ready(oracle: Arc<T>) -> Self {
        Self {
            state: Mutex::new(SlotState::Ready(oracle)),
        }
    }

    /// Return the oracle, loading it first if this is the first call.
    ///
    /// # Errors
    ///
    /// Returns [`OracleError::Unavailable`] if the load failed (on this
    /// call or an earlier one) and [`OracleError::LockPoisoned`] if a
    /// loader panicked.
    pub fn get(&self) -> Result<Arc<T>, OracleError> {
        let mut state = self.state.lock().map_err(|_| OracleError::LockPoisoned)?;
        match &*state {
            SlotState::Ready(oracle) => return Ok(Arc::clone(oracle)),
            SlotState::Failed(reason) => return Err(OracleError::Unavailable(reason.clone())),
            SlotState::Pending(_) => {}
        }

        let pending = std::mem::replace(
            &mut *state,
            SlotState::Failed("initialization interrupted".to_string()),
        );
        let SlotState::Pending(loader) = pending else {
            return Err(OracleError::Unavailable(
                "initialization interrupted".to_string(),
            ));
        };

        match loader() {
            Ok(oracle) => {
                tracing::info!("oracle initialized");
                *state = SlotState::Ready(Arc::clone(&oracle));
                Ok(oracle)
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::error!(error = %reason, "oracle failed to initialize");
                *state = SlotState::Failed(reason.clone());
                Err(OracleError::Unavailable(reason))
            }
        }
    }

    /// Returns `true` once a load has succeeded.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state
            .lock()
            .is_ok_and(|state| matches!(*state, SlotState::Ready(_)))
    }
}

impl<T: ?Sized> fmt::Debug for OracleSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.lock() {
            Ok(state) => match *state {
                SlotState::Pending(_) => "pending",
                SlotState::Ready(_) => "ready",
                SlotState::Failed(_) => "failed",
            },
            Err(_) => "poisoned",
        };
        f.debug_struct("OracleSlot").field("state", &state).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Constant(f32);

    impl SegmentationOracle for Constant {
        fn predict(&self, image: &NormalizedImage) -> Result<ProbabilityMap, OracleError> {
            let (w, h) = image.image().dimensions();
            Ok(ProbabilityMap::new(crate::types::FloatImage::from_pixel(
                w,
                h,
                image::Luma([self.0]),
            )))
        }
    }

    #[test]
    fn ready_slot_returns_oracle() {
        let oracle: Arc<dyn SegmentationOracle> = Arc::new(Constant(0.7));
        let slot = OracleSlot::ready(oracle);
        assert!(slot.is_initialized());
        let oracle = slot.get().unwrap();
        let image = NormalizedImage::new(crate::types::FloatImage::new(2, 2));
        let map = oracle.predict(&image).unwrap();
        assert!((map.image().get_pixel(1, 1).0[0] - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn loader_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let slot: OracleSlot<dyn SegmentationOracle> = OracleSlot::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Constant(0.0)) as Arc<dyn SegmentationOracle>)
        });
        assert!(!slot.is_initialized());
        for _ in 0..3 {
            slot.get().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(slot.is_initialized());
    }

    #[test]
    fn failure_is_remembered() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let slot: OracleSlot<dyn SegmentationOracle> = OracleSlot::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(OracleError::Load {
                path: "model.onnx".to_string(),
                message: "no such file".to_string(),
            })
        });
        for _ in 0..2 {
            assert!(matches!(
                slot.get(),
                Err(OracleError::Unavailable(ref m)) if m.contains("model.onnx")
            ));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!slot.is_initialized());
        assert_eq!(format!("{slot:?}"), "OracleSlot { state: \"failed\" }");
    }

    #[test]
    fn device_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
        assert_eq!(Device::default(), Device::Cpu);
    }
}
