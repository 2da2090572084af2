//! Error types for the product recognition pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::Stage;

/// Main error type for the pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding or encoding error
    #[error("Image processing error: {0}")]
    Image(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A directory or file a stage needs does not exist.
    #[error("Missing input: {what} not found at {}", path.display())]
    MissingInput { what: String, path: PathBuf },

    /// A single image could not be read. Callers skip the sample.
    #[error("Corrupt sample {}: {reason}", path.display())]
    CorruptSample { path: PathBuf, reason: String },

    /// An external step (trainer process, converter) ended abnormally.
    #[error("{stage} step failed: {message}")]
    StageExecution { stage: Stage, message: String },

    /// Both conversion paths failed.
    #[error("Conversion failed on both paths (direct: {direct}; interchange: {interchange})")]
    ConversionFallbackExhausted { direct: String, interchange: String },

    /// A persisted class order differs from the configured one.
    #[error("Class order mismatch: expected {expected:?}, found {found:?}")]
    ClassOrderMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// An operation exceeded its deadline.
    #[error("{what} timed out after {seconds}s")]
    Timeout { what: String, seconds: u64 },

    /// Cooperative cancellation was requested.
    #[error("Operation cancelled")]
    Cancelled,

    /// A fatal failure attributed to the pipeline stage it happened in.
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Helper for [`Error::MissingInput`].
    pub fn missing(what: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Error::MissingInput {
            what: what.into(),
            path: path.into(),
        }
    }

    /// Wraps this error with the stage it aborted.
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            Error::Stage { .. } => self,
            other => Error::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage a fatal error is attributed to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } | Error::StageExecution { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Image(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Specialized Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
