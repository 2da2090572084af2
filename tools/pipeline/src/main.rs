//! Product Recognition Pipeline CLI
//!
//! Runs the whole pipeline (augment, partition, train, validate, convert) or
//! any single stage of it against a directory layout described by a TOML
//! config file and command-line overrides.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use product_core::cli::{load_toml_config, setup_cli_logging};
use product_core::{DataSplit, PipelineConfig, Stage};
use product_dataset::{check_raw_data, AugmentationEngine, DatasetPartitioner};
use product_deploy::ArtifactConverter;
use product_pipeline::{Orchestrator, RunRegistry, StageStatus};
use product_training::{CommandTrainer, TrainedModelArtifact, ValidationEvaluator};

/// Product Recognition Training Pipeline
///
/// Augments raw product photos, partitions them, trains a classifier through
/// an external command, validates it and converts it for browser inference.
#[derive(Parser, Debug)]
#[command(name = "product-pipeline")]
#[command(version)]
#[command(about = "Train and package product image classifiers", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML pipeline configuration; flags override its values
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct Overrides {
    /// Comma-separated class names, in label order
    #[arg(long, global = true, value_delimiter = ',')]
    classes: Option<Vec<String>>,

    /// Root data directory; sets raw/, augmented/ and splits/ below it
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "DIR")]
    raw_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "DIR")]
    augmented_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "DIR")]
    splits_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "DIR")]
    models_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "DIR")]
    runs_dir: Option<PathBuf>,

    /// Directory the converted model is published into (as ml-model/)
    #[arg(long, global = true, value_name = "DIR")]
    public_dir: Option<PathBuf>,

    /// Do not publish the converted model
    #[arg(long, global = true)]
    no_publish: bool,

    /// Existing training directory to validate or convert
    #[arg(long, global = true, value_name = "DIR")]
    model_dir: Option<PathBuf>,

    /// Seed for augmentation and partitioning
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[arg(long, global = true)]
    epochs: Option<usize>,

    #[arg(long, global = true)]
    batch_size: Option<usize>,

    #[arg(long, global = true)]
    learning_rate: Option<f64>,

    /// Side length of the square model input
    #[arg(long, global = true)]
    input_size: Option<u32>,

    #[arg(long, global = true)]
    augmentations: Option<usize>,

    /// Worker threads for augmentation
    #[arg(long, global = true)]
    workers: Option<usize>,

    #[arg(long, global = true)]
    train_ratio: Option<f64>,

    #[arg(long, global = true)]
    confidence_threshold: Option<f32>,

    /// Store weights as float32 instead of uint8
    #[arg(long, global = true)]
    no_quantize: bool,

    #[arg(long, global = true, value_name = "BYTES")]
    shard_size: Option<usize>,

    /// Training program, e.g. python3
    #[arg(long, global = true, value_name = "PROGRAM")]
    trainer: Option<String>,

    /// Training program argument (repeatable, supports {placeholders})
    #[arg(long = "trainer-arg", global = true, value_name = "ARG", allow_hyphen_values = true)]
    trainer_args: Vec<String>,

    /// Kill the training process after this many seconds (0 disables)
    #[arg(long, global = true, value_name = "SECONDS")]
    training_deadline: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full pipeline
    Run {
        /// Reuse the latest partitioned dataset
        #[arg(long)]
        skip_augmentation: bool,

        /// Reuse an existing model (--model-dir or the latest registered one)
        #[arg(long)]
        skip_training: bool,

        /// Stop after validation
        #[arg(long)]
        skip_conversion: bool,
    },

    /// Check the raw data directory
    Check,

    /// Generate augmented samples from the raw images
    Augment {
        /// Only process these classes (comma-separated)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
    },

    /// Split augmented samples into train/ and val/
    Partition,

    /// Evaluate a trained model on the validation split
    Validate,

    /// Classify a single image
    Predict {
        /// Image to classify
        image: PathBuf,
    },

    /// Convert a trained model into the web format
    Convert,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = setup_cli_logging(cli.verbose) {
        eprintln!("{} {e}", "Warning:".yellow());
    }

    if let Err(e) = run(cli) {
        eprintln!("{} {e:#}", "Error:".red().bold());
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config: PipelineConfig = match &cli.config {
        Some(path) => load_toml_config(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    apply_overrides(&mut config, &cli.overrides);

    print_banner();

    match cli.command {
        Commands::Run {
            skip_augmentation,
            skip_training,
            skip_conversion,
        } => {
            config.skip_augmentation |= skip_augmentation;
            config.skip_training |= skip_training;
            config.skip_conversion |= skip_conversion;
            cmd_run(config)
        }
        Commands::Check => cmd_check(&config),
        Commands::Augment { only } => {
            if !only.is_empty() {
                config.augmentation.only_classes = only;
            }
            cmd_augment(&config)
        }
        Commands::Partition => cmd_partition(&config),
        Commands::Validate => cmd_validate(&config),
        Commands::Predict { image } => cmd_predict(&config, &image),
        Commands::Convert => cmd_convert(&config),
    }
}

fn apply_overrides(config: &mut PipelineConfig, o: &Overrides) {
    if let Some(classes) = &o.classes {
        config.classes = classes.clone();
    }
    if let Some(data_dir) = &o.data_dir {
        config.raw_dir = data_dir.join("raw");
        config.augmented_dir = data_dir.join("augmented");
        config.splits_dir = data_dir.join("splits");
    }
    let dirs = [
        (&o.raw_dir, &mut config.raw_dir),
        (&o.augmented_dir, &mut config.augmented_dir),
        (&o.splits_dir, &mut config.splits_dir),
        (&o.models_dir, &mut config.models_dir),
        (&o.runs_dir, &mut config.runs_dir),
    ];
    for (value, target) in dirs {
        if let Some(dir) = value {
            *target = dir.clone();
        }
    }
    if let Some(dir) = &o.public_dir {
        config.conversion.publish_dir = Some(dir.clone());
    }
    if o.no_publish {
        config.conversion.publish_dir = None;
    }
    if o.model_dir.is_some() {
        config.model_dir = o.model_dir.clone();
    }
    if let Some(seed) = o.seed {
        config.augmentation.seed = seed;
        config.partition.seed = seed;
    }
    if let Some(epochs) = o.epochs {
        config.training.epochs = epochs;
    }
    if let Some(batch_size) = o.batch_size {
        config.training.batch_size = batch_size;
    }
    if let Some(lr) = o.learning_rate {
        config.training.learning_rate = lr;
    }
    if let Some(size) = o.input_size {
        config.training.input_size = size;
        config.augmentation.spec.target_size = size;
    }
    if let Some(k) = o.augmentations {
        config.augmentation.augmentations_per_image = k;
    }
    if o.workers.is_some() {
        config.augmentation.workers = o.workers;
    }
    if let Some(ratio) = o.train_ratio {
        config.partition.train_ratio = ratio;
    }
    if let Some(threshold) = o.confidence_threshold {
        config.validation.confidence_threshold = threshold;
    }
    if o.no_quantize {
        config.conversion.quantize = false;
    }
    if let Some(size) = o.shard_size {
        config.conversion.shard_size_bytes = size;
    }
    if let Some(program) = &o.trainer {
        config.training.command.program = program.clone();
    }
    if !o.trainer_args.is_empty() {
        config.training.command.args = o.trainer_args.clone();
    }
    if let Some(secs) = o.training_deadline {
        config.training.deadline_secs = (secs > 0).then_some(secs);
    }
}

fn cmd_run(config: PipelineConfig) -> Result<()> {
    let trainer = CommandTrainer::new(config.training.command.clone());
    let orchestrator = Orchestrator::new(config, Box::new(trainer))?;
    let outcome = orchestrator.run()?;

    println!("\n{}", "Pipeline complete".green().bold());
    println!("  Run:    {}", outcome.run.run_id);
    for record in &outcome.run.stages {
        let status = match record.status {
            StageStatus::Ran => "ran".green(),
            StageStatus::Skipped => "skipped".yellow(),
            StageStatus::Resolved => "reused".cyan(),
            StageStatus::Failed => "failed".red(),
            StageStatus::Pending => "pending".normal(),
        };
        println!("  {:<14} {}", record.stage.to_string(), status);
    }
    println!("  Model:  {}", outcome.artifact.root().display());
    if let Some(report) = &outcome.validation {
        println!("  Accuracy: {:.2}%", report.overall_accuracy * 100.0);
        println!("  Macro F1: {:.4}", report.macro_f1);
    }
    if let Some(report) = &outcome.conversion {
        println!("  Web model: {} ({})", report.output_dir.display(), report.size_summary());
        if let Some(published) = &report.published_to {
            println!("  Published: {}", published.display());
        }
    }
    println!("  Record: {}", outcome.run_file.display());
    Ok(())
}

fn cmd_check(config: &PipelineConfig) -> Result<()> {
    let classes = config.class_set()?;
    let summary = check_raw_data(&config.raw_dir, &classes)?;

    println!("{}", "Raw data".cyan().bold());
    for (class, count) in &summary.classes {
        if *count == 0 {
            println!("  {class:<24} {:>6} images", count.to_string().yellow());
        } else {
            println!("  {class:<24} {count:>6} images");
        }
    }
    println!("  {:<24} {:>6}", "total", summary.total_images);
    Ok(())
}

fn cmd_augment(config: &PipelineConfig) -> Result<()> {
    config.validate()?;
    let engine = AugmentationEngine::new(config.augmentation.clone(), config.class_set()?)?;
    let report = engine.run(&config.raw_dir, &config.augmented_dir)?;

    for class in &report.classes {
        println!(
            "  {:<24} {:>4} sources -> {:>6} samples ({} skipped)",
            class.class, class.source_images, class.generated, class.skipped
        );
    }
    println!(
        "{} {} samples in {}",
        "Done:".green().bold(),
        report.total_generated,
        config.augmented_dir.display()
    );
    Ok(())
}

fn cmd_partition(config: &PipelineConfig) -> Result<()> {
    config.validate()?;
    let partitioner = DatasetPartitioner::new(config.partition.clone(), config.class_set()?)?;
    let manifest = partitioner.partition(&config.augmented_dir, &config.splits_dir)?;

    for class in &manifest.classes {
        println!(
            "  {:<24} train {:>6}  val {:>6}",
            class,
            manifest.count(DataSplit::Train, class),
            manifest.count(DataSplit::Val, class)
        );
    }
    println!(
        "{} {} train / {} val in {}",
        "Done:".green().bold(),
        manifest.split_total(DataSplit::Train),
        manifest.split_total(DataSplit::Val),
        config.splits_dir.display()
    );
    Ok(())
}

fn cmd_validate(config: &PipelineConfig) -> Result<()> {
    let classes = config.class_set()?;
    let artifact = open_artifact(config)?;
    artifact.verify_classes(&classes)?;
    let model = artifact.load_model()?;

    let evaluator = ValidationEvaluator::new(
        &model,
        classes,
        artifact.record().input_size,
        config.validation.clone(),
    )?;
    let val_dir = config.splits_dir.join(DataSplit::Val.dir_name());
    let report = evaluator.evaluate_dir(&val_dir, artifact.root())?;
    report.print_summary();
    println!("Report saved to {}", artifact.root().display());
    Ok(())
}

fn cmd_predict(config: &PipelineConfig, image: &Path) -> Result<()> {
    if !image.is_file() {
        bail!("image not found: {}", image.display());
    }
    let classes = config.class_set()?;
    let artifact = open_artifact(config)?;
    artifact.verify_classes(&classes)?;
    let model = artifact.load_model()?;

    let evaluator = ValidationEvaluator::new(
        &model,
        classes.clone(),
        artifact.record().input_size,
        config.validation.clone(),
    )?;
    let prediction = evaluator.predict_image(image)?;

    let verdict = if prediction.success {
        "confident".green()
    } else {
        "below threshold".yellow()
    };
    println!(
        "{} {} ({:.2}%, {})",
        "Prediction:".bold(),
        prediction.class_name.cyan(),
        prediction.confidence * 100.0,
        verdict
    );
    for (class, score) in prediction.ranked(&classes) {
        println!("  {class:<24} {:>7.2}%", score * 100.0);
    }
    Ok(())
}

fn cmd_convert(config: &PipelineConfig) -> Result<()> {
    let artifact = open_artifact(config)?;
    let converter = ArtifactConverter::new(config.conversion.clone(), config.class_set()?);
    let report = converter.convert(&artifact)?;

    println!(
        "{} {} path, {}",
        "Converted:".green().bold(),
        report.path_used,
        report.size_summary()
    );
    println!("  Output: {}", report.output_dir.display());
    if let Some(published) = &report.published_to {
        println!("  Published: {}", published.display());
    }
    Ok(())
}

/// The `--model-dir` override, else the latest registered training run.
fn open_artifact(config: &PipelineConfig) -> Result<TrainedModelArtifact> {
    let dir = match &config.model_dir {
        Some(dir) => dir.clone(),
        None => RunRegistry::load(&config.runs_dir)?
            .resolve(Stage::Training)
            .ok_or_else(|| {
                product_core::Error::missing(
                    "trained model (pass --model-dir or run training first)",
                    &config.models_dir,
                )
            })?,
    };
    info!(dir = %dir.display(), "Using trained model");
    Ok(TrainedModelArtifact::open(&dir)?)
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ==============================================================
    Product Recognition Pipeline
    augment -> partition -> train -> validate -> convert
 ==============================================================
  "#
        .green()
    );
}
