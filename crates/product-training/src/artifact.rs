//! On-disk layout of a training run.
//!
//! ```text
//! <models_dir>/training_<YYYYmmdd_HHMMSS>/
//!     training_config.json
//!     final_model/
//!         model.json
//!         weights.bin
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use product_core::cli::{read_json, write_json};
use product_core::{ClassSet, Error, ImageDimensions, Result, TrainingParams};
use serde::{Deserialize, Serialize};

use crate::model::{LoadedModel, MODEL_FILE, WEIGHTS_FILE};

pub const TRAINING_RECORD_FILE: &str = "training_config.json";
pub const FINAL_MODEL_DIR: &str = "final_model";
pub const TRAINING_DIR_PREFIX: &str = "training_";

/// Name of the training directory for a run started at `started`.
pub fn training_dir_name(started: DateTime<Utc>) -> String {
    format!("{TRAINING_DIR_PREFIX}{}", started.format("%Y%m%d_%H%M%S"))
}

/// Hyperparameters and data sizes of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    /// Label order of the model outputs
    pub classes: Vec<String>,
    pub batch_size: usize,
    pub epochs: usize,
    pub input_size: u32,
    pub learning_rate: f64,
    pub training_samples: usize,
    pub validation_samples: usize,
    /// `YYYYmmdd_HHMMSS`, matches the directory suffix
    pub timestamp: String,
}

impl TrainingRecord {
    pub fn new(
        classes: &ClassSet,
        params: &TrainingParams,
        training_samples: usize,
        validation_samples: usize,
        started: DateTime<Utc>,
    ) -> Self {
        Self {
            classes: classes.names().to_vec(),
            batch_size: params.batch_size,
            epochs: params.epochs,
            input_size: params.input_size,
            learning_rate: params.learning_rate,
            training_samples,
            validation_samples,
            timestamp: started.format("%Y%m%d_%H%M%S").to_string(),
        }
    }
}

/// A finished training directory.
#[derive(Debug, Clone)]
pub struct TrainedModelArtifact {
    root: PathBuf,
    record: TrainingRecord,
}

impl TrainedModelArtifact {
    /// Opens a training directory, checking that the record and both model
    /// files are present.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::missing("training directory", root));
        }
        let record: TrainingRecord = read_json(&root.join(TRAINING_RECORD_FILE), "training record")?;
        let model_dir = root.join(FINAL_MODEL_DIR);
        for file in [MODEL_FILE, WEIGHTS_FILE] {
            let path = model_dir.join(file);
            if !path.exists() {
                return Err(Error::missing("trained model file", path));
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
            record,
        })
    }

    /// Writes the training record into `root`.
    pub fn write_record(root: &Path, record: &TrainingRecord) -> Result<()> {
        write_json(&root.join(TRAINING_RECORD_FILE), record)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root.join(FINAL_MODEL_DIR)
    }

    pub fn record(&self) -> &TrainingRecord {
        &self.record
    }

    pub fn input_dims(&self) -> ImageDimensions {
        ImageDimensions::square_rgb(self.record.input_size)
    }

    /// Fails with [`Error::ClassOrderMismatch`] unless the model was trained
    /// with exactly `classes`.
    pub fn verify_classes(&self, classes: &ClassSet) -> Result<()> {
        classes.ensure_same_order(&self.record.classes)
    }

    pub fn load_model(&self) -> Result<LoadedModel> {
        LoadedModel::load(&self.model_dir())
    }
}
