//! Sequencing of the product recognition pipeline.
//!
//! The [`Orchestrator`] runs augmentation, partitioning, training,
//! validation and conversion in order, writes a [`PipelineRun`] record for
//! every invocation and keeps the [`RunRegistry`] that later runs use to
//! find the outputs of skipped stages.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use product_core::PipelineConfig;
//! use product_pipeline::Orchestrator;
//! use product_training::CommandTrainer;
//!
//! let config = PipelineConfig::default();
//! let trainer = CommandTrainer::new(config.training.command.clone());
//! let outcome = Orchestrator::new(config, Box::new(trainer))?.run()?;
//! println!("run {} finished", outcome.run.run_id);
//! ```

pub mod orchestrator;
pub mod run;

pub use orchestrator::{Orchestrator, PipelineOutcome};
pub use run::{PipelineRun, RegistryEntry, RunRegistry, RunStatus, StageRecord, StageStatus};
