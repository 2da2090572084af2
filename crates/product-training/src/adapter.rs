//! Boundary to the external training runtime.
//!
//! The pipeline never trains in-process. A [`TrainingAdapter`] receives a
//! [`TrainingRequest`] and must leave `model.json` and `weights.bin` in
//! [`TrainingRequest::model_dir`]. [`run_training`] wraps any adapter with
//! the bookkeeping every run needs: directory creation, the training record
//! and verification of the produced model.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use product_core::{
    CancellationToken, ClassSet, DataSplit, Error, Result, Stage, TrainerCommand, TrainingParams,
};
use product_dataset::DatasetManifest;
use tracing::{info, warn};

use crate::artifact::{training_dir_name, TrainedModelArtifact, TrainingRecord, FINAL_MODEL_DIR};
use crate::model::Classifier;

/// Everything a trainer needs for one run.
#[derive(Debug, Clone)]
pub struct TrainingRequest {
    /// Partitioned dataset root containing `train/` and `val/`
    pub data_dir: PathBuf,
    pub manifest: DatasetManifest,
    pub classes: ClassSet,
    pub params: TrainingParams,
    /// The `training_<timestamp>` directory of this run
    pub output_dir: PathBuf,
    pub started: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl TrainingRequest {
    /// Prepares a request whose output directory is a fresh
    /// `training_<timestamp>` below `models_dir`.
    pub fn new(
        data_dir: &Path,
        manifest: DatasetManifest,
        classes: ClassSet,
        params: TrainingParams,
        models_dir: &Path,
    ) -> Self {
        let started = Utc::now();
        let base = training_dir_name(started);
        let mut output_dir = models_dir.join(&base);
        let mut n = 1;
        while output_dir.exists() {
            output_dir = models_dir.join(format!("{base}_{n}"));
            n += 1;
        }
        Self {
            data_dir: data_dir.to_path_buf(),
            manifest,
            classes,
            params,
            output_dir,
            started,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Where the adapter must write the model files.
    pub fn model_dir(&self) -> PathBuf {
        self.output_dir.join(FINAL_MODEL_DIR)
    }
}

/// An external training runtime.
pub trait TrainingAdapter {
    /// Short name used in logs and run records.
    fn name(&self) -> &str;

    /// Trains and writes the model files into `request.model_dir()`.
    fn train(&self, request: &TrainingRequest) -> Result<()>;
}

/// Runs `adapter` and returns the verified artifact.
pub fn run_training(adapter: &dyn TrainingAdapter, request: &TrainingRequest) -> Result<TrainedModelArtifact> {
    request.manifest.verify_classes(&request.classes)?;
    let train_samples = request.manifest.split_total(DataSplit::Train);
    let val_samples = request.manifest.split_total(DataSplit::Val);
    if train_samples == 0 {
        return Err(Error::missing("training samples", request.data_dir.join("train")));
    }

    fs::create_dir_all(request.model_dir())?;
    info!(
        trainer = adapter.name(),
        output = %request.output_dir.display(),
        epochs = request.params.epochs,
        batch_size = request.params.batch_size,
        train_samples,
        val_samples,
        "Starting training"
    );

    request.cancel.check()?;
    adapter.train(request)?;

    let record = TrainingRecord::new(
        &request.classes,
        &request.params,
        train_samples,
        val_samples,
        request.started,
    );
    TrainedModelArtifact::write_record(&request.output_dir, &record)?;
    let artifact = TrainedModelArtifact::open(&request.output_dir)?;

    let model = artifact.load_model().map_err(|e| Error::StageExecution {
        stage: Stage::Training,
        message: format!("trainer produced an unreadable model: {e}"),
    })?;
    if model.topology.has_opaque_layers() {
        warn!("Trained model contains ops without a local implementation");
    } else {
        let outputs = model.num_outputs()?;
        if outputs != request.classes.len() {
            return Err(Error::StageExecution {
                stage: Stage::Training,
                message: format!(
                    "model has {outputs} outputs for {} classes",
                    request.classes.len()
                ),
            });
        }
    }

    info!(dir = %artifact.root().display(), "Training complete");
    Ok(artifact)
}

/// Runs training as a child process built from a [`TrainerCommand`].
#[derive(Debug, Clone)]
pub struct CommandTrainer {
    command: TrainerCommand,
    poll_interval: Duration,
}

impl CommandTrainer {
    pub fn new(command: TrainerCommand) -> Self {
        Self {
            command,
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Command arguments with every placeholder filled in.
    pub fn build_args(&self, request: &TrainingRequest) -> Vec<String> {
        let classes = request.classes.names().join(",");
        let replacements = [
            ("{data_dir}", request.data_dir.display().to_string()),
            (
                "{manifest}",
                request
                    .data_dir
                    .join(product_dataset::MANIFEST_FILE)
                    .display()
                    .to_string(),
            ),
            ("{output_dir}", request.model_dir().display().to_string()),
            ("{classes}", classes),
            ("{epochs}", request.params.epochs.to_string()),
            ("{batch_size}", request.params.batch_size.to_string()),
            ("{learning_rate}", request.params.learning_rate.to_string()),
            ("{input_size}", request.params.input_size.to_string()),
        ];

        self.command
            .args
            .iter()
            .map(|arg| {
                replacements
                    .iter()
                    .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
            })
            .collect()
    }
}

impl TrainingAdapter for CommandTrainer {
    fn name(&self) -> &str {
        &self.command.program
    }

    fn train(&self, request: &TrainingRequest) -> Result<()> {
        let args = self.build_args(request);
        info!(program = %self.command.program, ?args, "Launching trainer");

        let mut child = Command::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| Error::StageExecution {
                stage: Stage::Training,
                message: format!("failed to start '{}': {e}", self.command.program),
            })?;

        let deadline = request.params.deadline_secs.map(Duration::from_secs);
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                if status.success() {
                    return Ok(());
                }
                return Err(Error::StageExecution {
                    stage: Stage::Training,
                    message: format!("trainer exited with {status}"),
                });
            }

            if request.cancel.is_cancelled() {
                warn!("Cancelling trainer");
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Cancelled);
            }

            if let Some(limit) = deadline {
                if started.elapsed() >= limit {
                    warn!(seconds = limit.as_secs(), "Trainer exceeded its deadline");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Timeout {
                        what: "training".to_string(),
                        seconds: limit.as_secs(),
                    });
                }
            }

            thread::sleep(self.poll_interval);
        }
    }
}
