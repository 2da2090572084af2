//! Evaluation metrics for validation runs.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Square confusion matrix, rows are true classes and columns predictions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    /// Counts one prediction.
    pub fn record(&mut self, actual: usize, predicted: usize) -> Result<()> {
        let n = self.num_classes();
        if actual >= n || predicted >= n {
            return Err(Error::InvalidArgument(format!(
                "class index out of range: actual={actual}, predicted={predicted}, classes={n}"
            )));
        }
        self.counts[actual][predicted] += 1;
        Ok(())
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.counts[actual][predicted]
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.counts
    }

    /// Number of samples whose true class is `class`.
    pub fn row_total(&self, class: usize) -> usize {
        self.counts[class].iter().sum()
    }

    /// Number of samples predicted as `class`.
    pub fn column_total(&self, class: usize) -> usize {
        self.counts.iter().map(|row| row[class]).sum()
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.num_classes()).map(|i| self.counts[i][i]).sum()
    }

    /// Correct over total, 0 for an empty matrix.
    pub fn accuracy(&self) -> f64 {
        ratio(self.correct() as f64, self.total() as f64)
    }

    /// Per-class statistics in class index order.
    pub fn class_stats(&self) -> Vec<ClassStats> {
        (0..self.num_classes())
            .map(|c| ClassStats::from_confusion_matrix(self, c))
            .collect()
    }
}

/// Precision, recall and F1 for one class with the underlying counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassStats {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub true_positives: usize,
    pub false_negatives: usize,
    pub false_positives: usize,
    /// Samples whose true class is this one
    pub total_samples: usize,
}

impl ClassStats {
    /// Computes stats for `class`. Ratios with a zero denominator are 0.
    pub fn from_confusion_matrix(matrix: &ConfusionMatrix, class: usize) -> Self {
        let true_positives = matrix.get(class, class);
        let total_samples = matrix.row_total(class);
        let false_negatives = total_samples - true_positives;
        let false_positives = matrix.column_total(class) - true_positives;

        let tp = true_positives as f64;
        let precision = ratio(tp, tp + false_positives as f64);
        let recall = ratio(tp, tp + false_negatives as f64);
        let f1_score = ratio(2.0 * precision * recall, precision + recall);

        Self {
            precision,
            recall,
            f1_score,
            true_positives,
            false_negatives,
            false_positives,
            total_samples,
        }
    }

    /// Share of this class's samples predicted correctly (equals recall).
    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives as f64, self.total_samples as f64)
    }
}

/// Summary of the winning confidences of a validation run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ConfidenceStats {
    pub mean: f64,
    /// Population standard deviation
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl ConfidenceStats {
    /// All fields are 0 for an empty input.
    pub fn from_values(values: &[f32]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = values
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        let min = values.iter().fold(f64::INFINITY, |m, &v| m.min(v as f64));
        let max = values.iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v as f64));
        Self {
            mean,
            std: variance.sqrt(),
            min,
            max,
        }
    }
}

/// Macro average of a per-class quantity.
pub fn macro_average(stats: &[ClassStats], f: impl Fn(&ClassStats) -> f64) -> f64 {
    if stats.is_empty() {
        return 0.0;
    }
    stats.iter().map(f).sum::<f64>() / stats.len() as f64
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}
