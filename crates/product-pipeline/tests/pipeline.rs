use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use product_core::{CancellationToken, Error, PipelineConfig, Result, Stage};
use product_pipeline::{Orchestrator, PipelineRun, RunRegistry, RunStatus, StageStatus};
use product_training::model::linear_probe;
use product_training::{LayerSpec, TrainingAdapter, TrainingRequest};
use tempfile::TempDir;

const CLASSES: [&str; 2] = ["cola", "water"];

/// Writes a linear probe sized for the request, optionally with an op the
/// local interpreter cannot run.
struct StubTrainer {
    opaque: bool,
    fail: bool,
}

impl StubTrainer {
    fn ok() -> Box<Self> {
        Box::new(Self { opaque: false, fail: false })
    }
}

impl TrainingAdapter for StubTrainer {
    fn name(&self) -> &str {
        "stub"
    }

    fn train(&self, request: &TrainingRequest) -> Result<()> {
        if self.fail {
            return Err(Error::StageExecution {
                stage: Stage::Training,
                message: "trainer exited with status 1".into(),
            });
        }
        let n = request.classes.len();
        // red channel votes for the first class, blue for the second
        let kernel: Vec<f32> = (0..3 * n)
            .map(|i| match (i / n, i % n) {
                (0, 0) | (2, 1) => 1.0,
                _ => 0.0,
            })
            .collect();
        let mut model = linear_probe(request.params.input_size as usize, kernel, vec![0.0; n])?;
        if self.opaque {
            model.topology.layers.insert(
                0,
                LayerSpec::Opaque {
                    op: "RandomAugmentLayer".into(),
                    weights: vec![],
                    config: serde_json::Value::Null,
                },
            );
        }
        model.save(&request.model_dir())
    }
}

fn write_raw(root: &Path) {
    for (i, class) in CLASSES.iter().enumerate() {
        let dir = root.join(class);
        fs::create_dir_all(&dir).unwrap();
        for j in 0..5u8 {
            let color = if i == 0 { Rgb([200, 20 + j, 20]) } else { Rgb([20, 20 + j, 200]) };
            RgbImage::from_pixel(24, 24, color)
                .save(dir.join(format!("img_{j}.jpg")))
                .unwrap();
        }
    }
}

fn config(root: &Path) -> PipelineConfig {
    let mut config = PipelineConfig {
        classes: CLASSES.iter().map(|c| c.to_string()).collect(),
        raw_dir: root.join("raw"),
        augmented_dir: root.join("augmented"),
        splits_dir: root.join("splits"),
        models_dir: root.join("models"),
        runs_dir: root.join("runs"),
        ..PipelineConfig::default()
    };
    config.augmentation.augmentations_per_image = 1;
    config.augmentation.spec.target_size = 8;
    config.augmentation.workers = Some(1);
    config.training.input_size = 8;
    config.conversion.publish_dir = Some(root.join("public"));
    config
}

fn only_run(runs_dir: &Path) -> PipelineRun {
    let runs: Vec<PathBuf> = fs::read_dir(runs_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .collect();
    assert_eq!(runs.len(), 1);
    PipelineRun::load(&runs[0].join("run.json")).unwrap()
}

fn status(run: &PipelineRun, stage: Stage) -> StageStatus {
    run.stage(stage).unwrap().status
}

#[test]
fn test_full_pipeline() {
    let dir = TempDir::new().unwrap();
    write_raw(&dir.path().join("raw"));
    let config = config(dir.path());

    let outcome = Orchestrator::new(config, StubTrainer::ok()).unwrap().run().unwrap();

    assert_eq!(outcome.run.status, RunStatus::Succeeded);
    for stage in [
        Stage::Check,
        Stage::Augmentation,
        Stage::Partition,
        Stage::Training,
        Stage::Validation,
        Stage::Conversion,
    ] {
        assert_eq!(status(&outcome.run, stage), StageStatus::Ran, "{stage}");
    }

    // 5 sources x (1 variant + original) per class, 80/20
    let manifest = outcome.manifest.as_ref().unwrap();
    assert_eq!(manifest.total_images, 20);
    assert_eq!(manifest.splits.train["cola"], 8);
    assert_eq!(manifest.splits.val["water"], 2);

    let validation = outcome.validation.as_ref().unwrap();
    assert_eq!(validation.total_images, 4);

    let conversion = outcome.conversion.as_ref().unwrap();
    assert!(conversion.output_dir.join("model.json").exists());
    assert!(conversion.output_dir.join("model_metadata.json").exists());
    assert!(dir.path().join("public/ml-model/model.json").exists());

    assert!(outcome.run_file.exists());
    let registry = RunRegistry::load(&dir.path().join("runs")).unwrap();
    assert_eq!(
        registry.resolve(Stage::Training).as_deref(),
        Some(outcome.artifact.root())
    );
    assert_eq!(
        registry.latest(Stage::Partition).unwrap().run_id,
        outcome.run.run_id
    );
}

#[test]
fn test_rerun_resolves_from_registry() {
    let dir = TempDir::new().unwrap();
    write_raw(&dir.path().join("raw"));
    let first = Orchestrator::new(config(dir.path()), StubTrainer::ok())
        .unwrap()
        .run()
        .unwrap();

    let mut config = config(dir.path());
    config.skip_augmentation = true;
    config.skip_training = true;
    config.conversion.publish_dir = None;
    let second = Orchestrator::new(config, StubTrainer::ok()).unwrap().run().unwrap();

    assert_eq!(second.artifact.root(), first.artifact.root());
    assert_eq!(status(&second.run, Stage::Augmentation), StageStatus::Skipped);
    assert_eq!(status(&second.run, Stage::Partition), StageStatus::Resolved);
    assert_eq!(status(&second.run, Stage::Training), StageStatus::Resolved);
    assert_eq!(status(&second.run, Stage::Validation), StageStatus::Ran);
    assert_eq!(status(&second.run, Stage::Conversion), StageStatus::Ran);
}

#[test]
fn test_skip_training_without_model_fails() {
    let dir = TempDir::new().unwrap();
    write_raw(&dir.path().join("raw"));
    let mut config = config(dir.path());
    config.skip_training = true;

    let err = Orchestrator::new(config, StubTrainer::ok()).unwrap().run().unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Training));
    match &err {
        Error::Stage { source, .. } => assert!(matches!(**source, Error::MissingInput { .. })),
        other => panic!("unexpected error: {other}"),
    }

    let run = only_run(&dir.path().join("runs"));
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_stage, Some(Stage::Training));
    assert_eq!(status(&run, Stage::Training), StageStatus::Failed);

    let registry = RunRegistry::load(&dir.path().join("runs")).unwrap();
    assert!(registry.latest(Stage::Training).is_none());
    assert_eq!(registry.latest(Stage::Partition).unwrap().run_id, run.run_id);
}

#[test]
fn test_training_failure_aborts() {
    let dir = TempDir::new().unwrap();
    write_raw(&dir.path().join("raw"));
    let trainer = Box::new(StubTrainer { opaque: false, fail: true });

    let err = Orchestrator::new(config(dir.path()), trainer).unwrap().run().unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Training));

    let run = only_run(&dir.path().join("runs"));
    assert_eq!(run.failed_stage, Some(Stage::Training));
    assert_eq!(status(&run, Stage::Partition), StageStatus::Ran);
    assert!(run.stage(Stage::Validation).is_none());
    assert!(run.stage(Stage::Conversion).is_none());
    assert!(!dir.path().join("public").exists());
}

#[test]
fn test_conversion_failure_keeps_trained_model_registered() {
    let dir = TempDir::new().unwrap();
    write_raw(&dir.path().join("raw"));
    let runs_dir = dir.path().join("runs");
    let first = Orchestrator::new(config(dir.path()), StubTrainer::ok())
        .unwrap()
        .run()
        .unwrap();

    // another publisher holds the lock, so publishing the new model fails
    let lock = dir.path().join("public/.ml-model.lock");
    fs::write(&lock, "pid=0").unwrap();
    let err = Orchestrator::new(config(dir.path()), StubTrainer::ok())
        .unwrap()
        .run()
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Conversion));
    assert!(err.to_string().contains("lock"), "{err}");
    assert!(lock.exists());

    let registry = RunRegistry::load(&runs_dir).unwrap();
    let trained = registry.latest(Stage::Training).unwrap();
    assert_ne!(trained.run_id, first.run.run_id);
    assert_ne!(trained.output.as_path(), first.artifact.root());
    assert_eq!(registry.latest(Stage::Conversion).unwrap().run_id, first.run.run_id);

    let second = PipelineRun::load(&runs_dir.join(&trained.run_id).join("run.json")).unwrap();
    assert_eq!(second.status, RunStatus::Failed);
    assert_eq!(second.failed_stage, Some(Stage::Conversion));
    assert_eq!(status(&second, Stage::Training), StageStatus::Ran);
    assert_eq!(status(&second, Stage::Validation), StageStatus::Ran);
    let conversion = second.stage(Stage::Conversion).unwrap();
    assert_eq!(conversion.status, StageStatus::Failed);
    assert!(conversion.error.as_deref().unwrap().contains("lock"));
    assert_eq!(
        second.stage(Stage::Training).unwrap().outputs["model"],
        trained.output
    );

    fs::remove_file(&lock).unwrap();
    let mut config = config(dir.path());
    config.skip_augmentation = true;
    config.skip_training = true;
    let third = Orchestrator::new(config, StubTrainer::ok()).unwrap().run().unwrap();

    assert_eq!(third.artifact.root(), trained.output.as_path());
    assert_eq!(status(&third.run, Stage::Training), StageStatus::Resolved);
    assert_eq!(third.conversion.unwrap().published_to, Some(dir.path().join("public/ml-model")));
}

#[test]
fn test_validation_failure_still_converts() {
    let dir = TempDir::new().unwrap();
    write_raw(&dir.path().join("raw"));
    let trainer = Box::new(StubTrainer { opaque: true, fail: false });

    let outcome = Orchestrator::new(config(dir.path()), trainer).unwrap().run().unwrap();

    assert_eq!(outcome.run.status, RunStatus::Succeeded);
    assert_eq!(status(&outcome.run, Stage::Validation), StageStatus::Failed);
    assert!(outcome.validation.is_none());
    let conversion = outcome.conversion.unwrap();
    assert_eq!(conversion.path_used.to_string(), "interchange");
    assert!(dir.path().join("public/ml-model/model.json").exists());
}

#[test]
fn test_cancelled_run() {
    let dir = TempDir::new().unwrap();
    write_raw(&dir.path().join("raw"));
    let token = CancellationToken::new();
    token.cancel();

    let err = Orchestrator::new(config(dir.path()), StubTrainer::ok())
        .unwrap()
        .with_cancellation(token)
        .run()
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Check));

    let run = only_run(&dir.path().join("runs"));
    assert_eq!(run.status, RunStatus::Cancelled);
}

#[test]
fn test_invalid_config_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path());
    config.partition.train_ratio = 1.5;
    assert!(matches!(
        Orchestrator::new(config, StubTrainer::ok()),
        Err(Error::Config(_))
    ));
}
