//! `model_metadata.json`: what a consumer needs to use the converted model.

use std::path::Path;

use chrono::{DateTime, Utc};
use product_core::cli::write_json;
use product_core::{ClassSet, Result};
use product_training::TrainingRecord;
use serde::{Deserialize, Serialize};

use crate::converter::ConversionPathKind;

pub const METADATA_FILE: &str = "model_metadata.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// `layers-model` or `graph-model`
    pub format: String,
    pub conversion_path: ConversionPathKind,
    pub quantized: bool,
}

/// Input preparation the model expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessing {
    /// Multiply 8-bit pixel values by this
    pub rescale: f32,
    /// `[height, width]`
    pub resize: [u32; 2],
    pub color_mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// `[height, width, channels]`
    pub input_shape: Vec<usize>,
    pub num_classes: usize,
    /// Output index to label
    pub classes: Vec<String>,
    pub preprocessing: Preprocessing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub load_url: String,
    pub input_format: String,
    pub output_format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_info: ModelInfo,
    pub model_config: ModelConfig,
    pub training_info: TrainingRecord,
    pub usage: Usage,
}

impl ModelMetadata {
    pub fn new(
        classes: &ClassSet,
        input_shape: Vec<usize>,
        record: &TrainingRecord,
        format: &str,
        conversion_path: ConversionPathKind,
        quantized: bool,
    ) -> Self {
        let height = input_shape.first().copied().unwrap_or(0) as u32;
        let width = input_shape.get(1).copied().unwrap_or(0) as u32;
        Self {
            model_info: ModelInfo {
                name: "product-classifier".to_string(),
                created_at: Utc::now(),
                format: format.to_string(),
                conversion_path,
                quantized,
            },
            model_config: ModelConfig {
                input_shape,
                num_classes: classes.len(),
                classes: classes.names().to_vec(),
                preprocessing: Preprocessing {
                    rescale: 1.0 / 255.0,
                    resize: [height, width],
                    color_mode: "rgb".to_string(),
                },
            },
            training_info: record.clone(),
            usage: Usage {
                load_url: format!("/{}/model.json", crate::publish::PUBLISHED_DIR_NAME),
                input_format: format!("float32 tensor [1, {height}, {width}, 3] scaled to [0, 1]"),
                output_format: format!("{} class probabilities in model_config.classes order", classes.len()),
            },
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        write_json(&dir.join(METADATA_FILE), self)
    }
}
