//! Deployment side of the product recognition pipeline.
//!
//! [`ArtifactConverter`] turns a trained model directory into the web model
//! layout (`model.json`, `group1-shard*of*.bin`, `model_metadata.json`) and
//! [`publish`] swaps it into the public directory.

pub mod converter;
pub mod metadata;
pub mod publish;
pub mod quantize;
pub mod shard;

pub use converter::{
    ArtifactConverter, ConversionAttempt, ConversionErrorKind, ConversionFailure, ConversionPath,
    ConversionPathKind, ConversionReport, ConvertedGraph, DirectConversion, InterchangeConversion,
};
pub use metadata::ModelMetadata;
pub use publish::{publish, PUBLISHED_DIR_NAME};
pub use quantize::{dequantize_uint8, quantize_uint8, QuantizationParams};
pub use shard::{shard_file_name, write_shards};
