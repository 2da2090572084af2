//! Core types and utilities for the product recognition training pipeline.
//!
//! This crate provides the shared vocabulary of the workspace: the
//! [`ClassSet`] that fixes label order across every stage, the per-stage
//! configuration structs, evaluation metrics, the error type, and small CLI
//! helpers used by the binaries.

pub mod cancel;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use cancel::CancellationToken;
pub use config::*;
pub use error::{Error, Result};
pub use metrics::*;
pub use types::*;

/// Commonly used items in one import.
pub mod prelude {
    pub use crate::cancel::CancellationToken;
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::*;
    pub use crate::types::*;
}
