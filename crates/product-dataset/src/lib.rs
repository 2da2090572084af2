//! Dataset handling for the product recognition pipeline.
//!
//! ## Modules
//!
//! - [`loader`]: directory scanning, image decoding and the raw-data check
//! - [`preprocess`]: color normalization, resizing and tensor conversion
//! - [`augmentation`]: the randomized transform pipeline
//! - [`engine`]: per-class corpus generation ([`AugmentationEngine`])
//! - [`partition`]: deterministic train/val splitting ([`DatasetPartitioner`])
//! - [`manifest`]: the `dataset_info.json` record

pub mod augmentation;
pub mod engine;
pub mod loader;
pub mod manifest;
pub mod partition;
pub mod preprocess;

pub use augmentation::AugmentationPipeline;
pub use engine::{variant_seed, AugmentationEngine, AugmentationReport, AugmentedSample};
pub use loader::{check_raw_data, load_image, scan_images, RawDataSummary};
pub use manifest::DatasetManifest;
pub use partition::{DatasetPartitioner, MANIFEST_FILE};
pub use preprocess::ImagePreprocessor;

/// Test fixtures shared by the unit tests of this crate.
#[cfg(test)]
pub(crate) mod testutil {
    use std::path::Path;

    use image::{ImageBuffer, Rgb, RgbImage};

    /// 100x100 image with four colored quadrants.
    pub fn create_test_image() -> RgbImage {
        ImageBuffer::from_fn(100, 100, |x, y| match (x < 50, y < 50) {
            (true, true) => Rgb([255, 0, 0]),
            (false, true) => Rgb([0, 255, 0]),
            (true, false) => Rgb([0, 0, 255]),
            (false, false) => Rgb([255, 255, 0]),
        })
    }

    pub fn write_test_image(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        create_test_image().save(path).unwrap();
    }
}
