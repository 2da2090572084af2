//! Stage sequencing with partial-failure semantics.
//!
//! Augmentation (with partitioning), training and conversion failures abort
//! the run. A validation failure is recorded and conversion still runs,
//! because the trained artifact is valid regardless of its evaluation.

use std::path::PathBuf;

use product_core::{CancellationToken, ClassSet, Error, PipelineConfig, Result, Stage};
use product_dataset::{check_raw_data, AugmentationEngine, DatasetManifest, DatasetPartitioner, MANIFEST_FILE};
use product_deploy::{ArtifactConverter, ConversionReport};
use product_training::{
    run_training, TrainedModelArtifact, TrainingAdapter, TrainingRequest, ValidationEvaluator,
    ValidationReport,
};
use tracing::{error, info, warn};

use crate::run::{PipelineRun, RunRegistry, RunStatus, StageRecord, StageStatus};

/// Everything a finished pipeline produced.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub run: PipelineRun,
    pub run_file: PathBuf,
    pub artifact: TrainedModelArtifact,
    pub manifest: Option<DatasetManifest>,
    pub validation: Option<ValidationReport>,
    pub conversion: Option<ConversionReport>,
}

/// Runs the pipeline stages in order.
pub struct Orchestrator {
    config: PipelineConfig,
    classes: ClassSet,
    trainer: Box<dyn TrainingAdapter>,
    cancel: CancellationToken,
}

/// State passed between stages.
#[derive(Default)]
struct Progress {
    manifest: Option<DatasetManifest>,
    splits_dir: Option<PathBuf>,
    artifact: Option<TrainedModelArtifact>,
    validation: Option<ValidationReport>,
    conversion: Option<ConversionReport>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, trainer: Box<dyn TrainingAdapter>) -> Result<Self> {
        config.validate()?;
        let classes = config.class_set()?;
        Ok(Self {
            config,
            classes,
            trainer,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn classes(&self) -> &ClassSet {
        &self.classes
    }

    /// Runs every configured stage. The run record is written whether the
    /// pipeline succeeds or not. Stages that ran to completion are entered
    /// in the registry even when a later stage aborts the run.
    pub fn run(&self) -> Result<PipelineOutcome> {
        let mut run = PipelineRun::new(self.classes.names().to_vec());
        let mut registry = RunRegistry::load(&self.config.runs_dir)?;
        info!(run_id = %run.run_id, classes = %self.classes, "Pipeline started");

        let mut progress = Progress::default();
        let result = self.run_stages(&mut run, &registry, &mut progress);
        let registered = register_outputs(&run, &mut registry);

        match result {
            Ok(()) => {
                run.finish(RunStatus::Succeeded);
                if registered > 0 {
                    registry.save()?;
                }
                let run_file = run.save(&self.config.runs_dir)?;
                info!(run_id = %run.run_id, file = %run_file.display(), "Pipeline finished");

                let artifact = progress
                    .artifact
                    .ok_or_else(|| Error::missing("trained model", &self.config.models_dir))?;
                Ok(PipelineOutcome {
                    run,
                    run_file,
                    artifact,
                    manifest: progress.manifest,
                    validation: progress.validation,
                    conversion: progress.conversion,
                })
            }
            Err(e) => {
                let status = if matches!(source_of(&e), Error::Cancelled) {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                run.failed_stage = e.stage();
                if let Some(stage) = run.failed_stage {
                    let record = run.stage_mut(stage);
                    if record.status != StageStatus::Failed {
                        record.fail(source_of(&e));
                    }
                }
                run.finish(status);
                if registered > 0 {
                    if let Err(save_err) = registry.save() {
                        error!(error = %save_err, "Run registry could not be saved");
                    }
                }
                match run.save(&self.config.runs_dir) {
                    Ok(path) => error!(file = %path.display(), "Pipeline aborted: {e}"),
                    Err(save_err) => error!(error = %save_err, "Pipeline aborted and run record could not be saved: {e}"),
                }
                Err(e)
            }
        }
    }

    fn run_stages(&self, run: &mut PipelineRun, registry: &RunRegistry, progress: &mut Progress) -> Result<()> {
        let cfg = &self.config;

        // Raw data and augmentation
        if cfg.skip_augmentation {
            run.stage_mut(Stage::Check).note("augmentation skipped").skip();
            run.stage_mut(Stage::Augmentation).skip();
        } else {
            self.fatal(run, Stage::Check, |record| {
                record.input("raw", &cfg.raw_dir);
                let summary = check_raw_data(&cfg.raw_dir, &self.classes)?;
                record.note(format!("{} raw images", summary.total_images));
                Ok(())
            })?;
            self.fatal(run, Stage::Augmentation, |record| {
                record.input("raw", &cfg.raw_dir);
                let engine = AugmentationEngine::new(cfg.augmentation.clone(), self.classes.clone())?
                    .with_cancellation(self.cancel.clone());
                let report = engine.run(&cfg.raw_dir, &cfg.augmented_dir)?;
                record
                    .output("augmented", &cfg.augmented_dir)
                    .note(format!(
                        "{} samples, {} unreadable sources skipped",
                        report.total_generated,
                        report.total_skipped()
                    ));
                Ok(())
            })?;
        }

        // Partition
        if cfg.skip_augmentation {
            let splits_dir = self.resolve_splits(registry)?;
            let manifest = DatasetManifest::load(&splits_dir.join(MANIFEST_FILE))
                .and_then(|m| m.verify_classes(&self.classes).map(|_| m))
                .map_err(|e| e.in_stage(Stage::Partition))?;
            run.stage_mut(Stage::Partition)
                .output("splits", &splits_dir)
                .note("reused existing partition")
                .resolve();
            info!(dir = %splits_dir.display(), "Reusing partitioned dataset");
            progress.manifest = Some(manifest);
            progress.splits_dir = Some(splits_dir);
        } else {
            let manifest = self.fatal(run, Stage::Partition, |record| {
                record.input("augmented", &cfg.augmented_dir);
                let partitioner = DatasetPartitioner::new(cfg.partition.clone(), self.classes.clone())?;
                let manifest = partitioner.partition(&cfg.augmented_dir, &cfg.splits_dir)?;
                record.output("splits", &cfg.splits_dir);
                Ok(manifest)
            })?;
            progress.manifest = Some(manifest);
            progress.splits_dir = Some(cfg.splits_dir.clone());
        }
        let splits_dir = progress
            .splits_dir
            .clone()
            .ok_or_else(|| Error::missing("partitioned dataset", &cfg.splits_dir))?;

        // Training
        let artifact = if cfg.skip_training {
            let dir = self.resolve_training(registry)?;
            let artifact = TrainedModelArtifact::open(&dir)
                .and_then(|a| a.verify_classes(&self.classes).map(|_| a))
                .map_err(|e| e.in_stage(Stage::Training))?;
            run.stage_mut(Stage::Training)
                .output("model", &dir)
                .note("reused existing model")
                .resolve();
            info!(dir = %dir.display(), "Reusing trained model");
            artifact
        } else {
            let manifest = progress
                .manifest
                .clone()
                .ok_or_else(|| Error::missing("dataset manifest", splits_dir.join(MANIFEST_FILE)))?;
            self.fatal(run, Stage::Training, |record| {
                record.input("splits", &splits_dir);
                let request = TrainingRequest::new(
                    &splits_dir,
                    manifest,
                    self.classes.clone(),
                    cfg.training.clone(),
                    &cfg.models_dir,
                )
                .with_cancellation(self.cancel.clone());
                let artifact = run_training(self.trainer.as_ref(), &request)?;
                record.output("model", artifact.root());
                Ok(artifact)
            })?
        };
        progress.artifact = Some(artifact.clone());

        // Validation (recoverable)
        let val_dir = splits_dir.join(product_core::DataSplit::Val.dir_name());
        let validation = self.stage(run, Stage::Validation, |record| {
            record.input("val", &val_dir).input("model", artifact.root());
            let model = artifact.load_model()?;
            let evaluator = ValidationEvaluator::new(
                &model,
                self.classes.clone(),
                artifact.record().input_size,
                cfg.validation.clone(),
            )?;
            let report = evaluator.evaluate_dir(&val_dir, artifact.root())?;
            record
                .output("report", &artifact.root().join(product_training::evaluator::REPORT_FILE))
                .note(format!("accuracy {:.4}, macro F1 {:.4}", report.overall_accuracy, report.macro_f1));
            Ok(report)
        });
        match validation {
            Ok(report) => progress.validation = Some(report),
            Err(Error::Cancelled) => return Err(Error::Cancelled.in_stage(Stage::Validation)),
            Err(e) => warn!(error = %e, "Validation failed, continuing with conversion"),
        }

        // Conversion
        if cfg.skip_conversion {
            run.stage_mut(Stage::Conversion).skip();
        } else {
            let report = self.fatal(run, Stage::Conversion, |record| {
                record.input("model", artifact.root());
                let converter = ArtifactConverter::new(cfg.conversion.clone(), self.classes.clone());
                let report = converter.convert(&artifact)?;
                record
                    .output("web_model", &report.output_dir)
                    .note(format!("{} path; {}", report.path_used, report.size_summary()));
                if let Some(published) = &report.published_to {
                    record.output("published", published);
                }
                Ok(report)
            })?;
            progress.conversion = Some(report);
        }

        Ok(())
    }

    /// Runs one stage, recording its timing and outcome.
    fn stage<T>(
        &self,
        run: &mut PipelineRun,
        stage: Stage,
        f: impl FnOnce(&mut StageRecord) -> Result<T>,
    ) -> Result<T> {
        info!(%stage, "Stage started");
        let record = run.stage_mut(stage);
        record.start();
        let result = self.cancel.check().and_then(|()| f(&mut *record));
        match &result {
            Ok(_) => {
                record.succeed();
                info!(%stage, "Stage finished");
            }
            Err(e) => {
                record.fail(e);
                warn!(%stage, error = %e, "Stage failed");
            }
        }
        result
    }

    /// Like [`Self::stage`], attributing any error to the stage.
    fn fatal<T>(
        &self,
        run: &mut PipelineRun,
        stage: Stage,
        f: impl FnOnce(&mut StageRecord) -> Result<T>,
    ) -> Result<T> {
        self.stage(run, stage, f).map_err(|e| e.in_stage(stage))
    }

    /// Partitioned dataset for a run that skips augmentation: the registry
    /// first, then the configured splits directory if it holds a manifest.
    fn resolve_splits(&self, registry: &RunRegistry) -> Result<PathBuf> {
        if let Some(dir) = registry.resolve(Stage::Partition) {
            if dir.join(MANIFEST_FILE).exists() {
                return Ok(dir);
            }
        }
        let configured = &self.config.splits_dir;
        if configured.join(MANIFEST_FILE).exists() {
            return Ok(configured.clone());
        }
        Err(Error::missing("partitioned dataset (no registered or configured partition)", configured)
            .in_stage(Stage::Partition))
    }

    /// Training directory for a run that skips training: the explicit
    /// override first, then the registry.
    fn resolve_training(&self, registry: &RunRegistry) -> Result<PathBuf> {
        if let Some(dir) = &self.config.model_dir {
            if dir.is_dir() {
                return Ok(dir.clone());
            }
            return Err(Error::missing("configured model directory", dir).in_stage(Stage::Training));
        }
        registry.resolve(Stage::Training).ok_or_else(|| {
            Error::missing(
                "trained model (no registered training run and no model_dir override)",
                &self.config.models_dir,
            )
            .in_stage(Stage::Training)
        })
    }
}

/// Enters the output of every stage that ran to completion in the registry.
/// Returns the number of entries written.
fn register_outputs(run: &PipelineRun, registry: &mut RunRegistry) -> usize {
    let mut registered = 0;
    for record in &run.stages {
        if record.status != StageStatus::Ran {
            continue;
        }
        if let Some(output) = primary_output(record) {
            registry.record(record.stage, &run.run_id, output);
            registered += 1;
        }
    }
    registered
}

/// Registry output of a stage record.
fn primary_output(record: &StageRecord) -> Option<&std::path::Path> {
    let key = match record.stage {
        Stage::Check => return None,
        Stage::Augmentation => "augmented",
        Stage::Partition => "splits",
        Stage::Training => "model",
        Stage::Validation => "report",
        Stage::Conversion => "web_model",
    };
    record.outputs.get(key).map(PathBuf::as_path)
}

fn source_of(error: &Error) -> &Error {
    match error {
        Error::Stage { source, .. } => source_of(source),
        other => other,
    }
}
