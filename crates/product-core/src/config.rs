//! Configuration structures for every pipeline stage.
//!
//! Each stage owns a typed config with documented defaults. All structs
//! deserialize with `#[serde(default)]`, so a TOML file only needs to name
//! the values it changes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{ClassSet, ImageDimensions};

/// Product classes used when no class list is configured.
pub const DEFAULT_CLASSES: &[&str] = &[
    "zyn-apple-mint",
    "zyn-spearmint",
    "terea-yellow",
    "terea-sienna",
    "iqos-iluma-prime",
];

/// Side length of the square model input, in pixels.
pub const DEFAULT_INPUT_SIZE: u32 = 224;

/// One randomized transform and the probability that it fires for a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    /// Probability in `[0, 1]` that this transform is applied
    pub probability: f64,
    #[serde(flatten)]
    pub kind: TransformKind,
}

impl TransformSpec {
    pub fn new(probability: f64, kind: TransformKind) -> Self {
        Self { probability, kind }
    }
}

/// Transform vocabulary of the augmentation engine.
///
/// Ranges are symmetric limits unless a `min`/`max` pair is given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformKind {
    /// Rotation by an angle drawn from `[-limit_deg, limit_deg]`
    Rotate { limit_deg: f32 },
    /// Combined translation (fraction of size), scaling and rotation
    ShiftScaleRotate {
        shift_limit: f32,
        scale_limit: f32,
        rotate_limit_deg: f32,
    },
    /// Additive brightness and multiplicative contrast change
    BrightnessContrast {
        brightness_limit: f32,
        contrast_limit: f32,
    },
    /// Shifts in HSV space: hue in degrees, saturation and value on 0..255
    HueSaturationValue {
        hue_shift: f32,
        sat_shift: f32,
        val_shift: f32,
    },
    /// Independent per-channel offsets in `[-limit, limit]`
    RgbShift { limit: f32 },
    /// Additive Gaussian noise with variance drawn from `[var_min, var_max]`
    GaussianNoise { var_min: f32, var_max: f32 },
    /// Gaussian blur with sigma drawn from `[sigma_min, sigma_max]`
    GaussianBlur { sigma_min: f32, sigma_max: f32 },
    /// 3x3 mean filter
    BoxBlur,
    /// Downscale by a factor in `[scale_min, scale_max]` and scale back up
    Downscale { scale_min: f32, scale_max: f32 },
    /// JPEG re-encode with quality in `[quality_min, quality_max]`
    JpegCompression { quality_min: u8, quality_max: u8 },
    /// Mirror left to right
    HorizontalFlip,
    /// Apply exactly one child, chosen with weights equal to child probabilities
    OneOf { transforms: Vec<TransformSpec> },
}

/// Ordered transform list plus the output size of every sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationSpec {
    pub transforms: Vec<TransformSpec>,
    /// Side length of the square output image
    pub target_size: u32,
}

impl Default for AugmentationSpec {
    fn default() -> Self {
        use TransformKind::*;
        Self {
            transforms: vec![
                TransformSpec::new(0.8, Rotate { limit_deg: 25.0 }),
                TransformSpec::new(
                    0.7,
                    ShiftScaleRotate {
                        shift_limit: 0.1,
                        scale_limit: 0.2,
                        rotate_limit_deg: 15.0,
                    },
                ),
                TransformSpec::new(
                    0.8,
                    BrightnessContrast {
                        brightness_limit: 0.3,
                        contrast_limit: 0.3,
                    },
                ),
                TransformSpec::new(
                    0.6,
                    HueSaturationValue {
                        hue_shift: 10.0,
                        sat_shift: 20.0,
                        val_shift: 20.0,
                    },
                ),
                TransformSpec::new(0.5, RgbShift { limit: 15.0 }),
                TransformSpec::new(
                    0.4,
                    GaussianNoise {
                        var_min: 10.0,
                        var_max: 50.0,
                    },
                ),
                TransformSpec::new(
                    0.3,
                    OneOf {
                        transforms: vec![
                            TransformSpec::new(
                                1.0,
                                GaussianBlur {
                                    sigma_min: 0.5,
                                    sigma_max: 1.5,
                                },
                            ),
                            TransformSpec::new(1.0, BoxBlur),
                        ],
                    },
                ),
                TransformSpec::new(
                    0.3,
                    JpegCompression {
                        quality_min: 85,
                        quality_max: 100,
                    },
                ),
                TransformSpec::new(
                    0.2,
                    Downscale {
                        scale_min: 0.8,
                        scale_max: 0.99,
                    },
                ),
            ],
            target_size: DEFAULT_INPUT_SIZE,
        }
    }
}

impl AugmentationSpec {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.target_size == 0 {
            return Err("target_size must be positive".to_string());
        }
        fn check(specs: &[TransformSpec]) -> std::result::Result<(), String> {
            for spec in specs {
                if !(0.0..=1.0).contains(&spec.probability) {
                    return Err(format!(
                        "transform probability {} outside [0, 1]",
                        spec.probability
                    ));
                }
                if let TransformKind::OneOf { transforms } = &spec.kind {
                    if transforms.is_empty() {
                        return Err("one_of group has no transforms".to_string());
                    }
                    check(transforms)?;
                }
            }
            Ok(())
        }
        check(&self.transforms)
    }
}

/// Augmentation stage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    pub spec: AugmentationSpec,
    /// Number of random variants per source image (the original copy is extra)
    pub augmentations_per_image: usize,
    /// Base seed; every variant derives its own seed from it
    pub seed: u64,
    /// JPEG quality of written samples
    pub jpeg_quality: u8,
    /// Worker threads, `None` uses all available cores
    pub workers: Option<usize>,
    /// Restrict augmentation to these classes (empty means all)
    pub only_classes: Vec<String>,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            spec: AugmentationSpec::default(),
            augmentations_per_image: 12,
            seed: 42,
            jpeg_quality: 95,
            workers: None,
            only_classes: Vec::new(),
        }
    }
}

/// How split members refer to their augmented sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    #[default]
    Symlink,
    Hardlink,
    Copy,
}

/// Partition stage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Fraction of each class assigned to training
    pub train_ratio: f64,
    /// Shuffle seed, reapplied for every class
    pub seed: u64,
    pub link_mode: LinkMode,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            train_ratio: 0.8,
            seed: 42,
            link_mode: LinkMode::Symlink,
        }
    }
}

impl PartitionConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(0.0..=1.0).contains(&self.train_ratio) {
            return Err(format!("train_ratio {} outside [0, 1]", self.train_ratio));
        }
        Ok(())
    }
}

/// External command that runs training.
///
/// Arguments may contain the placeholders `{data_dir}`, `{manifest}`,
/// `{output_dir}`, `{classes}`, `{epochs}`, `{batch_size}`,
/// `{learning_rate}` and `{input_size}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for TrainerCommand {
    fn default() -> Self {
        let args = [
            "train_model.py",
            "--data-dir",
            "{data_dir}",
            "--output-dir",
            "{output_dir}",
            "--classes",
            "{classes}",
            "--epochs",
            "{epochs}",
            "--batch-size",
            "{batch_size}",
            "--learning-rate",
            "{learning_rate}",
            "--img-size",
            "{input_size}",
        ];
        Self {
            program: "python3".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Training hyperparameters and invocation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Side length of the square model input
    pub input_size: u32,
    /// Wall-clock limit for the trainer, `None` waits forever
    pub deadline_secs: Option<u64>,
    pub command: TrainerCommand,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 32,
            learning_rate: 0.001,
            input_size: DEFAULT_INPUT_SIZE,
            deadline_secs: Some(6 * 60 * 60),
            command: TrainerCommand::default(),
        }
    }
}

impl TrainingParams {
    pub fn input_dims(&self) -> ImageDimensions {
        ImageDimensions::square_rgb(self.input_size)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.epochs == 0 {
            return Err("epochs must be positive".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be positive".to_string());
        }
        if !(self.learning_rate > 0.0) {
            return Err("learning_rate must be positive".to_string());
        }
        if self.input_size == 0 {
            return Err("input_size must be positive".to_string());
        }
        Ok(())
    }
}

/// Validation stage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// A prediction counts as a success when its confidence reaches this
    pub confidence_threshold: f32,
    /// Write `predictions.json` next to the report
    pub export_predictions: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            export_predictions: true,
        }
    }
}

/// Conversion and publish configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Store weights as uint8 with per-tensor affine parameters
    pub quantize: bool,
    /// Maximum size of one weight shard in bytes
    pub shard_size_bytes: usize,
    /// Replace `<publish_dir>/ml-model` with the converted model
    pub publish_dir: Option<PathBuf>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            quantize: true,
            shard_size_bytes: 4 * 1024 * 1024,
            publish_dir: Some(PathBuf::from("public")),
        }
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ordered class labels
    pub classes: Vec<String>,
    /// Raw images, one subdirectory per class
    pub raw_dir: PathBuf,
    /// Augmented images, one subdirectory per class
    pub augmented_dir: PathBuf,
    /// Partitioned dataset root (`train/` and `val/`)
    pub splits_dir: PathBuf,
    /// Parent of the timestamped training directories
    pub models_dir: PathBuf,
    /// Run records and the run registry
    pub runs_dir: PathBuf,
    pub skip_augmentation: bool,
    pub skip_training: bool,
    pub skip_conversion: bool,
    /// Training directory to use instead of the registry when training is skipped
    pub model_dir: Option<PathBuf>,
    pub augmentation: AugmentationConfig,
    pub partition: PartitionConfig,
    pub training: TrainingParams,
    pub validation: ValidationConfig,
    pub conversion: ConversionConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            classes: DEFAULT_CLASSES.iter().map(|s| s.to_string()).collect(),
            raw_dir: PathBuf::from("data/raw"),
            augmented_dir: PathBuf::from("data/augmented"),
            splits_dir: PathBuf::from("data/splits"),
            models_dir: PathBuf::from("models"),
            runs_dir: PathBuf::from("runs"),
            skip_augmentation: false,
            skip_training: false,
            skip_conversion: false,
            model_dir: None,
            augmentation: AugmentationConfig::default(),
            partition: PartitionConfig::default(),
            training: TrainingParams::default(),
            validation: ValidationConfig::default(),
            conversion: ConversionConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Builds the class set every stage receives.
    pub fn class_set(&self) -> Result<ClassSet> {
        ClassSet::new(self.classes.iter().cloned())
    }

    /// Validates every stage section.
    pub fn validate(&self) -> Result<()> {
        self.class_set()?;
        self.augmentation.spec.validate().map_err(Error::Config)?;
        self.partition.validate().map_err(Error::Config)?;
        self.training.validate().map_err(Error::Config)?;
        if self.training.input_size != self.augmentation.spec.target_size {
            return Err(Error::Config(format!(
                "training.input_size {} differs from augmentation target_size {}",
                self.training.input_size, self.augmentation.spec.target_size
            )));
        }
        if !(0.0..=1.0).contains(&self.validation.confidence_threshold) {
            return Err(Error::Config(format!(
                "confidence_threshold {} outside [0, 1]",
                self.validation.confidence_threshold
            )));
        }
        if self.conversion.shard_size_bytes == 0 {
            return Err(Error::Config("shard_size_bytes must be positive".to_string()));
        }
        Ok(())
    }
}
