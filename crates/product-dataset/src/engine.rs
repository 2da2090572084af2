//! Per-class generation of the augmented corpus.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use indicatif::{ProgressBar, ProgressStyle};
use product_core::cli::write_json;
use product_core::{
    AugmentationConfig, CancellationToken, ClassSet, Error, Result, SampleOrigin,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::augmentation::AugmentationPipeline;
use crate::loader::{load_image, scan_images};
use crate::preprocess::ImagePreprocessor;

/// Report file written at the root of the augmented corpus.
pub const AUGMENTATION_REPORT_FILE: &str = "augmentation_report.json";

/// One written sample and where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AugmentedSample {
    pub path: PathBuf,
    pub source: PathBuf,
    pub class: String,
    /// 0 for the original copy, `i + 1` for random variant `i`
    pub variant: usize,
    pub origin: SampleOrigin,
}

/// Outcome for a single class.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassAugmentation {
    pub class: String,
    pub source_images: usize,
    /// Sources that could not be decoded
    pub skipped: usize,
    pub generated: usize,
    pub output_dir: PathBuf,
}

/// Summary of an augmentation run, also written as [`AUGMENTATION_REPORT_FILE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentationReport {
    pub classes: Vec<ClassAugmentation>,
    pub augmentations_per_image: usize,
    pub seed: u64,
    pub target_size: u32,
    pub total_generated: usize,
}

impl AugmentationReport {
    pub fn total_skipped(&self) -> usize {
        self.classes.iter().map(|c| c.skipped).sum()
    }
}

/// Seed of one variant, stable across runs, platforms and thread schedules.
///
/// 64-bit FNV-1a over the base seed, class, source stem and variant index.
pub fn variant_seed(base: u64, class: &str, stem: &str, variant: usize) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    let mut feed = |bytes: &[u8]| {
        for &b in bytes {
            hash ^= b as u64;
            hash = hash.wrapping_mul(PRIME);
        }
    };
    feed(&base.to_le_bytes());
    feed(class.as_bytes());
    feed(&[0]);
    feed(stem.as_bytes());
    feed(&[0]);
    feed(&(variant as u64).to_le_bytes());
    hash
}

/// Generates `k + 1` samples per readable source image, class by class.
pub struct AugmentationEngine {
    config: AugmentationConfig,
    classes: ClassSet,
    pipeline: AugmentationPipeline,
    preprocessor: ImagePreprocessor,
    cancel: CancellationToken,
}

impl AugmentationEngine {
    pub fn new(config: AugmentationConfig, classes: ClassSet) -> Result<Self> {
        let pipeline = AugmentationPipeline::new(config.spec.clone())?;
        let preprocessor = ImagePreprocessor::new(config.spec.target_size);
        Ok(Self {
            config,
            classes,
            pipeline,
            preprocessor,
            cancel: CancellationToken::new(),
        })
    }

    /// Uses `token` for cooperative cancellation between images.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Classes selected by `only_classes`, in class-set order.
    fn selected_classes(&self) -> Vec<&str> {
        if self.config.only_classes.is_empty() {
            return self.classes.iter().collect();
        }
        for name in &self.config.only_classes {
            if !self.classes.contains(name) {
                warn!(class = %name, "Ignoring unknown class in augmentation filter");
            }
        }
        self.classes
            .iter()
            .filter(|c| self.config.only_classes.iter().any(|f| f == c))
            .collect()
    }

    /// Augments every selected class from `raw_dir/<class>` into `out_dir/<class>`.
    pub fn run(&self, raw_dir: &Path, out_dir: &Path) -> Result<AugmentationReport> {
        if !raw_dir.is_dir() {
            return Err(Error::missing("raw data directory", raw_dir));
        }
        fs::create_dir_all(out_dir)?;

        let classes = self.selected_classes();
        info!(
            classes = classes.len(),
            per_image = self.config.augmentations_per_image,
            "Starting augmentation"
        );

        let work = || -> Result<Vec<ClassAugmentation>> {
            classes
                .iter()
                .map(|class| {
                    self.cancel.check()?;
                    self.augment_class(class, &raw_dir.join(class), &out_dir.join(class))
                        .map(|(summary, _)| summary)
                })
                .collect()
        };

        let per_class = match self.config.workers {
            Some(n) => rayon::ThreadPoolBuilder::new()
                .num_threads(n.max(1))
                .build()
                .map_err(|e| Error::Config(format!("Failed to build worker pool: {e}")))?
                .install(work)?,
            None => work()?,
        };

        let report = AugmentationReport {
            total_generated: per_class.iter().map(|c| c.generated).sum(),
            classes: per_class,
            augmentations_per_image: self.config.augmentations_per_image,
            seed: self.config.seed,
            target_size: self.config.spec.target_size,
        };
        write_json(&out_dir.join(AUGMENTATION_REPORT_FILE), &report)?;

        info!(
            generated = report.total_generated,
            skipped = report.total_skipped(),
            "Augmentation complete"
        );
        Ok(report)
    }

    /// Regenerates one class directory from scratch.
    ///
    /// A missing source directory yields an empty class with a warning.
    pub fn augment_class(
        &self,
        class: &str,
        source_dir: &Path,
        output_dir: &Path,
    ) -> Result<(ClassAugmentation, Vec<AugmentedSample>)> {
        if output_dir.exists() {
            fs::remove_dir_all(output_dir)?;
        }
        fs::create_dir_all(output_dir)?;

        let mut summary = ClassAugmentation {
            class: class.to_string(),
            output_dir: output_dir.to_path_buf(),
            ..Default::default()
        };

        if !source_dir.is_dir() {
            warn!(class, dir = %source_dir.display(), "No raw images for class");
            return Ok((summary, Vec::new()));
        }

        let sources = scan_images(source_dir)?;
        summary.source_images = sources.len();
        let stems = unique_stems(&sources);

        let pb = ProgressBar::new(sources.len() as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb.set_message(class.to_string());

        let results: Vec<Result<Vec<AugmentedSample>>> = sources
            .par_iter()
            .zip(stems.par_iter())
            .map(|(source, stem)| {
                self.cancel.check()?;
                let out = self.process_source(class, source, stem, output_dir);
                pb.inc(1);
                out
            })
            .collect();
        pb.finish_and_clear();

        let mut samples = Vec::new();
        for result in results {
            match result {
                Ok(mut written) => samples.append(&mut written),
                Err(Error::CorruptSample { path, reason }) => {
                    warn!(path = %path.display(), %reason, "Skipping unreadable image");
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        summary.generated = samples.len();

        info!(
            class,
            sources = summary.source_images,
            skipped = summary.skipped,
            generated = summary.generated,
            "Class augmented"
        );
        Ok((summary, samples))
    }

    /// Writes the original copy and `k` variants of one source image.
    fn process_source(
        &self,
        class: &str,
        source: &Path,
        stem: &str,
        output_dir: &Path,
    ) -> Result<Vec<AugmentedSample>> {
        let full = ImagePreprocessor::normalize(&load_image(source)?);
        let base = self.preprocessor.resize(&full);
        let k = self.config.augmentations_per_image;
        let mut samples = Vec::with_capacity(k + 1);

        let original = output_dir.join(format!("{class}_{stem}_original.jpg"));
        self.write_jpeg(&base, &original)?;
        samples.push(AugmentedSample {
            path: original,
            source: source.to_path_buf(),
            class: class.to_string(),
            variant: 0,
            origin: SampleOrigin::Original,
        });

        for i in 0..k {
            let mut rng = ChaCha8Rng::seed_from_u64(variant_seed(self.config.seed, class, stem, i));
            let variant = self.pipeline.augment(&full, &mut rng)?;
            let path = output_dir.join(format!("{class}_{stem}_aug_{i:03}.jpg"));
            self.write_jpeg(&variant, &path)?;
            samples.push(AugmentedSample {
                path,
                source: source.to_path_buf(),
                class: class.to_string(),
                variant: i + 1,
                origin: SampleOrigin::Generated,
            });
        }

        debug!(source = %source.display(), written = samples.len(), "Source augmented");
        Ok(samples)
    }

    fn write_jpeg(&self, image: &RgbImage, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        JpegEncoder::new_with_quality(&mut writer, self.config.jpeg_quality).encode_image(image)?;
        Ok(())
    }
}

/// File stems used in output names.
///
/// Stems shared by several sources in the same directory get their
/// extension appended, plus a counter while the name is still taken. Names
/// are compared case-insensitively so no two sources write the same files.
fn unique_stems(sources: &[PathBuf]) -> Vec<String> {
    let stem = |p: &Path| {
        p.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    let mut counts: HashMap<String, usize> = HashMap::new();
    for source in sources {
        *counts.entry(stem(source).to_lowercase()).or_default() += 1;
    }
    let is_shared = |s: &str| counts.get(&s.to_lowercase()).copied().unwrap_or(0) > 1;

    // stems without a collision keep their plain name
    let mut taken: HashSet<String> = sources
        .iter()
        .map(|p| stem(p))
        .filter(|s| !is_shared(s))
        .map(|s| s.to_lowercase())
        .collect();

    sources
        .iter()
        .map(|source| {
            let s = stem(source);
            if !is_shared(&s) {
                return s;
            }
            let ext = source
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            let base = format!("{s}_{ext}");
            let mut candidate = base.clone();
            let mut n = 1;
            while !taken.insert(candidate.to_lowercase()) {
                candidate = format!("{base}_{n}");
                n += 1;
            }
            candidate
        })
        .collect()
}
