//! Validation of a trained model on the held-out split.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use product_core::cli::write_json;
use product_core::{
    macro_average, ClassSet, ClassStats, ConfidenceStats, ConfusionMatrix, Error, LabeledImage,
    Result, Stage, ValidationConfig,
};
use product_dataset::{scan_images, ImagePreprocessor};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::Classifier;

pub const REPORT_FILE: &str = "validation_report.json";
pub const CONFUSION_CSV_FILE: &str = "confusion_matrix.csv";
pub const PREDICTIONS_FILE: &str = "predictions.json";

/// Index and value of the largest score. The first maximum wins and NaN
/// never wins.
pub fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &s) in scores.iter().enumerate() {
        if s.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if s <= b => {}
            _ => best = Some((i, s)),
        }
    }
    best
}

/// Classification of one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub class_index: usize,
    pub class_name: String,
    pub confidence: f32,
    pub success: bool,
    /// Score of every class in class-set order
    pub scores: Vec<f32>,
}

impl Prediction {
    /// `(class, score)` pairs sorted by descending score.
    pub fn ranked(&self, classes: &ClassSet) -> Vec<(String, f32)> {
        let mut ranked: Vec<(String, f32)> = self
            .scores
            .iter()
            .enumerate()
            .map(|(i, &s)| (classes.name(i).unwrap_or("?").to_string(), s))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }
}

/// Outcome for one validation sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub path: PathBuf,
    pub true_class: String,
    pub predicted_class: String,
    pub confidence: f32,
    pub confidences: Vec<f32>,
    pub correct: bool,
    /// Confidence reached the threshold
    pub success: bool,
}

/// Contents of `validation_report.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub validation_date: DateTime<Utc>,
    pub classes: Vec<String>,
    pub total_images: usize,
    pub overall_accuracy: f64,
    pub confidence_threshold: f32,
    /// Share of samples whose confidence reached the threshold
    pub success_rate: f64,
    pub skipped_samples: usize,
    /// Unweighted mean of the per-class F1 scores
    #[serde(default)]
    pub macro_f1: f64,
    pub per_class_stats: BTreeMap<String, ClassStats>,
    pub confusion_matrix: ConfusionMatrix,
    pub confidence_stats: ConfidenceStats,
}

impl ValidationReport {
    /// Builds the report from per-sample results, in `classes` order.
    pub fn from_results(
        classes: &ClassSet,
        results: &[ValidationResult],
        threshold: f32,
        skipped_samples: usize,
    ) -> Result<Self> {
        let mut matrix = ConfusionMatrix::new(classes.len());
        for r in results {
            let actual = class_index(classes, &r.true_class)?;
            let predicted = class_index(classes, &r.predicted_class)?;
            matrix.record(actual, predicted)?;
        }

        let stats = matrix.class_stats();
        let macro_f1 = macro_average(&stats, |s| s.f1_score);
        let per_class_stats = classes
            .iter()
            .zip(stats)
            .map(|(name, stats)| (name.to_string(), stats))
            .collect();
        let confidences: Vec<f32> = results.iter().map(|r| r.confidence).collect();
        let successes = results.iter().filter(|r| r.success).count();

        Ok(Self {
            validation_date: Utc::now(),
            classes: classes.names().to_vec(),
            total_images: results.len(),
            overall_accuracy: matrix.accuracy(),
            confidence_threshold: threshold,
            success_rate: if results.is_empty() {
                0.0
            } else {
                successes as f64 / results.len() as f64
            },
            skipped_samples,
            macro_f1,
            per_class_stats,
            confusion_matrix: matrix,
            confidence_stats: ConfidenceStats::from_values(&confidences),
        })
    }

    /// Stats of every class in class order.
    pub fn ordered_stats(&self) -> Vec<(&str, &ClassStats)> {
        self.classes
            .iter()
            .filter_map(|c| self.per_class_stats.get(c).map(|s| (c.as_str(), s)))
            .collect()
    }

    /// Writes the report JSON and the confusion matrix CSV into `dir`.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(REPORT_FILE);
        write_json(&path, self)?;
        self.export_confusion_matrix(&dir.join(CONFUSION_CSV_FILE))?;
        info!(path = %path.display(), "Validation report saved");
        Ok(path)
    }

    /// Confusion matrix as CSV with class names on both axes.
    pub fn export_confusion_matrix(&self, output_path: &Path) -> Result<()> {
        let mut file = File::create(output_path)?;

        write!(file, "True\\Predicted")?;
        for name in &self.classes {
            write!(file, ",{name}")?;
        }
        writeln!(file)?;

        for (name, row) in self.classes.iter().zip(self.confusion_matrix.rows()) {
            write!(file, "{name}")?;
            for val in row {
                write!(file, ",{val}")?;
            }
            writeln!(file)?;
        }
        Ok(())
    }

    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(72));
        println!("VALIDATION RESULTS");
        println!("{}", "=".repeat(72));
        println!("Total samples:    {}", self.total_images);
        println!("Skipped samples:  {}", self.skipped_samples);
        println!("Overall accuracy: {:.2}%", self.overall_accuracy * 100.0);
        println!("Macro F1:         {:.4}", self.macro_f1);
        println!(
            "Success rate:     {:.2}% (confidence >= {:.2})",
            self.success_rate * 100.0,
            self.confidence_threshold
        );
        println!(
            "Confidence:       mean {:.3}, std {:.3}, min {:.3}, max {:.3}",
            self.confidence_stats.mean,
            self.confidence_stats.std,
            self.confidence_stats.min,
            self.confidence_stats.max
        );
        println!("\nPer-Class Metrics:");
        println!(
            "{:<20} {:>9} {:>9} {:>9} {:>9} {:>8}",
            "Class", "Accuracy", "Precision", "Recall", "F1-Score", "Support"
        );
        println!("{}", "-".repeat(72));
        for (name, stats) in self.ordered_stats() {
            println!(
                "{:<20} {:>9.4} {:>9.4} {:>9.4} {:>9.4} {:>8}",
                name,
                stats.accuracy(),
                stats.precision,
                stats.recall,
                stats.f1_score,
                stats.total_samples
            );
        }
        println!("{}", "=".repeat(72));
    }
}

fn class_index(classes: &ClassSet, name: &str) -> Result<usize> {
    classes
        .index_of(name)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown class '{name}'")))
}

/// Scores a [`Classifier`] on labeled images.
pub struct ValidationEvaluator<'a, C: Classifier + ?Sized> {
    classifier: &'a C,
    classes: ClassSet,
    preprocessor: ImagePreprocessor,
    config: ValidationConfig,
}

impl<'a, C: Classifier + ?Sized> ValidationEvaluator<'a, C> {
    /// Fails with a validation stage error when the classifier's output
    /// width differs from the number of classes.
    pub fn new(
        classifier: &'a C,
        classes: ClassSet,
        input_size: u32,
        config: ValidationConfig,
    ) -> Result<Self> {
        let outputs = classifier.num_outputs().map_err(|e| Error::StageExecution {
            stage: Stage::Validation,
            message: format!("model cannot be evaluated: {e}"),
        })?;
        if outputs != classes.len() {
            return Err(Error::StageExecution {
                stage: Stage::Validation,
                message: format!("model has {outputs} outputs for {} classes", classes.len()),
            });
        }
        Ok(Self {
            classifier,
            classes,
            preprocessor: ImagePreprocessor::new(input_size),
            config,
        })
    }

    pub fn classes(&self) -> &ClassSet {
        &self.classes
    }

    /// Classifies a single image.
    pub fn predict_image(&self, path: &Path) -> Result<Prediction> {
        let input = self.preprocessor.load_tensor(path)?;
        let scores = self.classifier.predict(&input)?;
        if scores.len() != self.classes.len() {
            return Err(Error::StageExecution {
                stage: Stage::Validation,
                message: format!("model returned {} scores", scores.len()),
            });
        }
        let (class_index, confidence) = argmax(&scores).ok_or_else(|| Error::StageExecution {
            stage: Stage::Validation,
            message: format!("model returned no usable score for {}", path.display()),
        })?;
        Ok(Prediction {
            class_index,
            class_name: self.classes.name(class_index).unwrap_or_default().to_string(),
            confidence,
            success: confidence >= self.config.confidence_threshold,
            scores,
        })
    }

    /// Lists `val_dir/<class>` images in class order, each class sorted by
    /// file name. Missing class directories are logged and skipped.
    pub fn collect_samples(&self, val_dir: &Path) -> Result<Vec<LabeledImage>> {
        if !val_dir.is_dir() {
            return Err(Error::missing("validation directory", val_dir));
        }
        let mut samples = Vec::new();
        for (label, class) in self.classes.iter().enumerate() {
            let class_dir = val_dir.join(class);
            if !class_dir.is_dir() {
                warn!(class, dir = %class_dir.display(), "No validation images for class");
                continue;
            }
            samples.extend(
                scan_images(&class_dir)?
                    .into_iter()
                    .map(|path| LabeledImage { path, label }),
            );
        }
        Ok(samples)
    }

    /// Evaluates every sample, skipping unreadable images.
    pub fn evaluate_samples(
        &self,
        samples: &[LabeledImage],
    ) -> Result<(ValidationReport, Vec<ValidationResult>)> {
        let mut results = Vec::with_capacity(samples.len());
        let mut skipped = 0;

        for sample in samples {
            let prediction = match self.predict_image(&sample.path) {
                Ok(p) => p,
                Err(Error::CorruptSample { path, reason }) => {
                    warn!(path = %path.display(), %reason, "Skipping unreadable validation image");
                    skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let true_class = self.classes.name(sample.label).ok_or_else(|| {
                Error::InvalidArgument(format!("label {} out of range", sample.label))
            })?;
            results.push(ValidationResult {
                path: sample.path.clone(),
                true_class: true_class.to_string(),
                predicted_class: prediction.class_name,
                confidence: prediction.confidence,
                correct: prediction.class_index == sample.label,
                success: prediction.success,
                confidences: prediction.scores,
            });
        }

        let report = ValidationReport::from_results(
            &self.classes,
            &results,
            self.config.confidence_threshold,
            skipped,
        )?;
        info!(
            samples = report.total_images,
            skipped,
            accuracy = report.overall_accuracy,
            "Validation complete"
        );
        Ok((report, results))
    }

    /// Evaluates `val_dir` and writes the report files into `output_dir`.
    pub fn evaluate_dir(&self, val_dir: &Path, output_dir: &Path) -> Result<ValidationReport> {
        let samples = self.collect_samples(val_dir)?;
        info!(samples = samples.len(), dir = %val_dir.display(), "Evaluating validation split");

        let (report, results) = self.evaluate_samples(&samples)?;
        report.save(output_dir)?;
        if self.config.export_predictions {
            write_json(&output_dir.join(PREDICTIONS_FILE), &results)?;
        }
        Ok(report)
    }
}
