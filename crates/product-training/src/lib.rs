//! Training-side components of the product recognition pipeline.
//!
//! Training itself runs in an external process behind the
//! [`TrainingAdapter`] trait. This crate defines the artifact that process
//! must leave behind, a small interpreter for the artifact's layer graph,
//! and the [`ValidationEvaluator`] that scores it on held-out data.

pub mod adapter;
pub mod artifact;
pub mod evaluator;
pub mod model;

pub use adapter::{run_training, CommandTrainer, TrainingAdapter, TrainingRequest};
pub use artifact::{TrainedModelArtifact, TrainingRecord};
pub use evaluator::{argmax, Prediction, ValidationEvaluator, ValidationReport, ValidationResult};
pub use model::{Activation, Classifier, LayerSpec, LoadedModel, ModelTopology, WeightSpec};
