//! nodule-detect: run lung nodule detection on one CT slice.
//!
//! Loads the oracles once at startup, reads the image file, runs the
//! pipeline and prints `{"nodules": [...]}` on stdout. Logs go to stderr
//! (filter with `RUST_LOG`).
//!
//! The segmentation oracle is either an ONNX model (`--segmentation-model`,
//! requires the `onnx` feature) or a precomputed probability map image
//! (`--probability-map`), which is handy for checking post-processing
//! without a model.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --features onnx --bin nodule-detect -- \
//!     --segmentation-model unet.onnx slice.dcm
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use nodule_pipeline::types::FloatImage;
use nodule_pipeline::{
    ClassificationOracle, DetectionResponse, Detector, Device, NormalizedImage, OracleError,
    OracleSlot, OutputMode, PipelineConfig, ProbabilityMap, SegmentationOracle, Variant,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Lung nodule detection on a single CT slice.
///
/// Accepts a DICOM file or a standard raster image (PNG, JPEG, BMP,
/// WebP) and prints the detected nodules as JSON.
#[derive(Parser)]
#[command(name = "nodule-detect", version)]
struct Cli {
    /// Path to the input slice.
    image_path: PathBuf,

    /// Pipeline variant.
    #[arg(long, value_enum, default_value_t = CliVariant::SingleStageContour)]
    variant: CliVariant,

    /// Output geometry. Defaults to the variant's own.
    #[arg(long, value_enum)]
    output: Option<CliOutput>,

    /// ONNX segmentation model.
    #[arg(long, conflicts_with = "probability_map")]
    segmentation_model: Option<PathBuf>,

    /// Apply a sigmoid to the segmentation model's output.
    #[arg(long)]
    sigmoid: bool,

    /// ONNX patch classification model (two-stage variant).
    #[arg(long)]
    classifier_model: Option<PathBuf>,

    /// Precomputed probability map (grayscale image at canonical size)
    /// used in place of a segmentation model.
    #[arg(long)]
    probability_map: Option<PathBuf>,

    /// Compute device for the ONNX models.
    #[arg(long, value_enum, default_value_t = CliDevice::Cpu)]
    device: CliDevice,

    /// CUDA device ordinal.
    #[arg(long, default_value_t = 0)]
    cuda_device_id: i32,

    /// Window center in Hounsfield units.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_WINDOW_CENTER, allow_hyphen_values = true)]
    window_center: f64,

    /// Window width in Hounsfield units.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_WINDOW_WIDTH)]
    window_width: f64,

    /// Fail on undecodable input instead of reporting no nodules.
    #[arg(long)]
    strict: bool,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, all other pipeline parameter flags are ignored.
    /// The JSON must be a valid `PipelineConfig` serialization; missing
    /// fields take their defaults.
    #[arg(long)]
    config_json: Option<String>,

    /// Also print the run summary (to stderr).
    #[arg(long)]
    summary: bool,

    /// Pretty-print the JSON output.
    #[arg(long)]
    pretty: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliVariant {
    /// Connected components, rectangles out.
    SingleStageBbox,
    /// Connected components, contours out.
    SingleStageContour,
    /// Watershed split plus patch classification.
    TwoStage,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliOutput {
    Contour,
    Bbox,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliDevice {
    Cpu,
    Cuda,
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("error parsing --config-json: {e}"));
    }

    Ok(PipelineConfig {
        variant: match cli.variant {
            CliVariant::SingleStageBbox => Variant::SingleStageBbox,
            CliVariant::SingleStageContour => Variant::SingleStageContour,
            CliVariant::TwoStage => Variant::TwoStage,
        },
        output: cli.output.map(|o| match o {
            CliOutput::Contour => OutputMode::Contour,
            CliOutput::Bbox => OutputMode::BoundingBox,
        }),
        window_center: cli.window_center,
        window_width: cli.window_width,
        strict_decode: cli.strict,
        ..PipelineConfig::default()
    })
}

const fn device_from_cli(cli: &Cli) -> Device {
    match cli.device {
        CliDevice::Cpu => Device::Cpu,
        CliDevice::Cuda => Device::Cuda(cli.cuda_device_id),
    }
}

/// Segmentation oracle backed by a stored probability map.
struct PrecomputedMap(ProbabilityMap);

impl PrecomputedMap {
    fn load(path: &Path) -> Result<Self, OracleError> {
        let img = image::open(path).map_err(|e| OracleError::Load {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let gray = img.to_luma8();
        let map = FloatImage::from_fn(gray.width(), gray.height(), |x, y| {
            image::Luma([f32::from(gray.get_pixel(x, y).0[0]) / 255.0])
        });
        Ok(Self(ProbabilityMap::new(map)))
    }
}

impl SegmentationOracle for PrecomputedMap {
    fn predict(&self, _: &NormalizedImage) -> Result<ProbabilityMap, OracleError> {
        Ok(self.0.clone())
    }
}

fn segmentation_slot(cli: &Cli) -> Result<OracleSlot<dyn SegmentationOracle>, String> {
    if let Some(path) = cli.probability_map.clone() {
        return Ok(OracleSlot::new(move || {
            Ok(Arc::new(PrecomputedMap::load(&path)?) as Arc<dyn SegmentationOracle>)
        }));
    }
    let Some(path) = cli.segmentation_model.clone() else {
        return Err("one of --segmentation-model or --probability-map is required".to_string());
    };
    onnx_segmentation_slot(path, device_from_cli(cli), cli.sigmoid)
}

fn classification_slot(cli: &Cli) -> Result<Option<OracleSlot<dyn ClassificationOracle>>, String> {
    cli.classifier_model
        .clone()
        .map(|path| onnx_classification_slot(path, device_from_cli(cli)))
        .transpose()
}

#[cfg(feature = "onnx")]
fn onnx_segmentation_slot(
    path: PathBuf,
    device: Device,
    sigmoid: bool,
) -> Result<OracleSlot<dyn SegmentationOracle>, String> {
    use nodule_pipeline::onnx::OutputActivation;
    let activation = if sigmoid {
        OutputActivation::Sigmoid
    } else {
        OutputActivation::Identity
    };
    Ok(nodule_pipeline::onnx::segmentation_slot(
        path, device, activation,
    ))
}

#[cfg(not(feature = "onnx"))]
fn onnx_segmentation_slot(
    path: PathBuf,
    _: Device,
    _: bool,
) -> Result<OracleSlot<dyn SegmentationOracle>, String> {
    Err(format!(
        "cannot load {}: built without the `onnx` feature",
        path.display()
    ))
}

#[cfg(feature = "onnx")]
fn onnx_classification_slot(
    path: PathBuf,
    device: Device,
) -> Result<OracleSlot<dyn ClassificationOracle>, String> {
    Ok(nodule_pipeline::onnx::classification_slot(path, device))
}

#[cfg(not(feature = "onnx"))]
fn onnx_classification_slot(
    path: PathBuf,
    _: Device,
) -> Result<OracleSlot<dyn ClassificationOracle>, String> {
    Err(format!(
        "cannot load {}: built without the `onnx` feature",
        path.display()
    ))
}

/// Build the detector and load every oracle it will use.
///
/// An oracle that fails to load here is fatal, so the process never runs
/// in a state where every request silently returns nothing.
fn build_detector(cli: &Cli, config: PipelineConfig) -> Result<Detector, String> {
    let classifies = config.variant.classifies();

    let segmenter = Arc::new(segmentation_slot(cli)?);
    segmenter
        .get()
        .map_err(|e| format!("segmentation oracle: {e}"))?;
    let mut detector = Detector::new(config, segmenter).map_err(|e| e.to_string())?;

    match classification_slot(cli)? {
        Some(slot) => {
            if classifies {
                slot.get()
                    .map_err(|e| format!("classification oracle: {e}"))?;
            }
            detector = detector.with_classifier(Arc::new(slot));
        }
        None if classifies => {
            return Err("--classifier-model is required for the two-stage variant".to_string());
        }
        None => {}
    }
    Ok(detector)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            error!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let detector = match build_detector(&cli, config) {
        Ok(d) => d,
        Err(msg) => {
            error!("startup failed: {msg}");
            return ExitCode::FAILURE;
        }
    };

    let image_bytes = match std::fs::read(&cli.image_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("error reading {}: {e}", cli.image_path.display());
            return ExitCode::FAILURE;
        }
    };
    info!(
        path = %cli.image_path.display(),
        bytes = image_bytes.len(),
        variant = ?detector.config().variant,
        "running detection"
    );

    let (results, summary) = match detector.detect_with_summary(&image_bytes) {
        Ok(out) => out,
        Err(e) => {
            error!("detection failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let response = DetectionResponse::from(results);
    let json = if cli.pretty {
        serde_json::to_string_pretty(&response)
    } else {
        serde_json::to_string(&response)
    };
    match json {
        Ok(json) => println!("{json}"),
        Err(e) => {
            error!("error serializing results: {e}");
            return ExitCode::FAILURE;
        }
    }

    if cli.summary {
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => eprintln!("{json}"),
            Err(e) => error!("error serializing summary: {e}"),
        }
    }

    ExitCode::SUCCESS
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_build_config() {
        let cli = Cli::parse_from([
            "nodule-detect",
            "--variant",
            "two-stage",
            "--output",
            "bbox",
            "--window-center",
            "-500",
            "--strict",
            "slice.dcm",
        ]);
        let config = config_from_cli(&cli).unwrap();
        assert_eq!(config.variant, Variant::TwoStage);
        assert_eq!(config.output_mode(), OutputMode::BoundingBox);
        assert!((config.window_center + 500.0).abs() < f64::EPSILON);
        assert!(config.strict_decode);
    }

    #[test]
    fn config_json_overrides_flags() {
        let cli = Cli::parse_from([
            "nodule-detect",
            "--variant",
            "two-stage",
            "--config-json",
            r#"{"variant":"SingleStageBbox","min_box_side":3}"#,
            "slice.png",
        ]);
        let config = config_from_cli(&cli).unwrap();
        assert_eq!(config.variant, Variant::SingleStageBbox);
        assert_eq!(config.min_box_side, 3);
    }

    #[test]
    fn missing_segmentation_source_is_a_startup_error() {
        let cli = Cli::parse_from(["nodule-detect", "slice.png"]);
        let config = config_from_cli(&cli).unwrap();
        assert!(build_detector(&cli, config).is_err());
    }

    #[test]
    fn unreadable_probability_map_is_a_startup_error() {
        let cli = Cli::parse_from([
            "nodule-detect",
            "--probability-map",
            "no/such/map.png",
            "slice.png",
        ]);
        let config = config_from_cli(&cli).unwrap();
        let err = build_detector(&cli, config).unwrap_err();
        assert!(err.contains("no/such/map.png"), "{err}");
    }
}
