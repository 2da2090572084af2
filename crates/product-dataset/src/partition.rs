//! Deterministic train/validation partitioning.
//!
//! Each class is listed in file-name order, shuffled with a generator seeded
//! afresh from the configured seed, and cut at `floor(n * train_ratio)`. The
//! same seed and the same files always give the same membership.

use std::fs;
use std::path::{Path, PathBuf};

use product_core::{ClassSet, DataSplit, Error, LinkMode, PartitionConfig, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::loader::scan_images;
use crate::manifest::{DatasetManifest, SplitCounts};

/// Manifest file name inside the splits directory.
pub const MANIFEST_FILE: &str = "dataset_info.json";

/// Splits an augmented corpus into `train/` and `val/`.
#[derive(Debug, Clone)]
pub struct DatasetPartitioner {
    config: PartitionConfig,
    classes: ClassSet,
}

impl DatasetPartitioner {
    pub fn new(config: PartitionConfig, classes: ClassSet) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        Ok(Self { config, classes })
    }

    /// Number of samples out of `n` that go to training.
    pub fn train_count(&self, n: usize) -> usize {
        ((n as f64 * self.config.train_ratio).floor() as usize).min(n)
    }

    /// Shuffles `items` with a fresh generator and splits them into
    /// `(train, val)`. `items` should already be in a stable order.
    pub fn assign<T: Clone>(&self, items: &[T]) -> (Vec<T>, Vec<T>) {
        let mut shuffled = items.to_vec();
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        shuffled.shuffle(&mut rng);
        let val = shuffled.split_off(self.train_count(items.len()));
        (shuffled, val)
    }

    /// Partitions `augmented_dir/<class>` into `splits_dir/{train,val}/<class>`
    /// and writes [`MANIFEST_FILE`].
    pub fn partition(&self, augmented_dir: &Path, splits_dir: &Path) -> Result<DatasetManifest> {
        if !augmented_dir.is_dir() {
            return Err(Error::missing("augmented data directory", augmented_dir));
        }

        for split in DataSplit::ALL {
            let dir = splits_dir.join(split.dir_name());
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            fs::create_dir_all(&dir)?;
        }

        let mut splits = SplitCounts::default();
        let mut total_images = 0;

        for class in self.classes.iter() {
            let class_dir = augmented_dir.join(class);
            let samples = if class_dir.is_dir() {
                scan_images(&class_dir)?
            } else {
                warn!(class, dir = %class_dir.display(), "No augmented images for class");
                Vec::new()
            };
            total_images += samples.len();

            let (train, val) = self.assign(&samples);
            for (split, members) in [(DataSplit::Train, &train), (DataSplit::Val, &val)] {
                let target = splits_dir.join(split.dir_name()).join(class);
                fs::create_dir_all(&target)?;
                for member in members {
                    self.link(member, &target)?;
                }
                splits.get_mut(split).insert(class.to_string(), members.len());
            }

            info!(class, train = train.len(), val = val.len(), "Class partitioned");
        }

        let manifest = DatasetManifest {
            classes: self.classes.names().to_vec(),
            total_images,
            splits,
            seed: self.config.seed,
            train_ratio: self.config.train_ratio,
        };
        manifest.save(&splits_dir.join(MANIFEST_FILE))?;

        info!(
            total = total_images,
            train = manifest.split_total(DataSplit::Train),
            val = manifest.split_total(DataSplit::Val),
            "Dataset partitioned"
        );
        Ok(manifest)
    }

    /// Places `source` into `target_dir` according to the link mode.
    fn link(&self, source: &Path, target_dir: &Path) -> Result<PathBuf> {
        let name = source
            .file_name()
            .ok_or_else(|| Error::InvalidArgument(format!("no file name: {}", source.display())))?;
        let dest = target_dir.join(name);

        match self.config.link_mode {
            LinkMode::Symlink => symlink_or_copy(source, &dest)?,
            LinkMode::Hardlink => {
                if let Err(e) = fs::hard_link(source, &dest) {
                    debug!(error = %e, "Hard link failed, copying instead");
                    fs::copy(source, &dest)?;
                }
            }
            LinkMode::Copy => {
                fs::copy(source, &dest)?;
            }
        }
        Ok(dest)
    }
}

#[cfg(unix)]
fn symlink_or_copy(source: &Path, dest: &Path) -> Result<()> {
    let absolute = fs::canonicalize(source)?;
    std::os::unix::fs::symlink(absolute, dest)?;
    Ok(())
}

#[cfg(not(unix))]
fn symlink_or_copy(source: &Path, dest: &Path) -> Result<()> {
    fs::copy(source, dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_test_image;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn partitioner(ratio: f64, mode: LinkMode) -> DatasetPartitioner {
        DatasetPartitioner::new(
            PartitionConfig {
                train_ratio: ratio,
                seed: 42,
                link_mode: mode,
            },
            ClassSet::new(["a", "b"]).unwrap(),
        )
        .unwrap()
    }

    fn members(dir: &Path) -> BTreeSet<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_hundred_items_split_eighty_twenty() {
        let p = partitioner(0.8, LinkMode::Symlink);
        let items: Vec<usize> = (0..100).collect();
        let (train, val) = p.assign(&items);
        assert_eq!(train.len(), 80);
        assert_eq!(val.len(), 20);

        let (train2, val2) = p.assign(&items);
        assert_eq!(train, train2);
        assert_eq!(val, val2);

        let mut all: Vec<usize> = train.into_iter().chain(val).collect();
        all.sort_unstable();
        assert_eq!(all, items);
    }

    #[test]
    fn test_train_count_floors() {
        let p = partitioner(0.8, LinkMode::Copy);
        assert_eq!(p.train_count(0), 0);
        assert_eq!(p.train_count(1), 0);
        assert_eq!(p.train_count(7), 5);
        assert_eq!(p.train_count(13), 10);
        assert_eq!(partitioner(1.0, LinkMode::Copy).train_count(9), 9);
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let config = PartitionConfig {
            train_ratio: -0.1,
            ..PartitionConfig::default()
        };
        assert!(DatasetPartitioner::new(config, ClassSet::new(["a"]).unwrap()).is_err());
    }

    #[test]
    fn test_partition_writes_splits_and_manifest() {
        let dir = TempDir::new().unwrap();
        let aug = dir.path().join("aug");
        for i in 0..10 {
            write_test_image(&aug.join(format!("a/s{i:02}.png")));
        }
        let splits = dir.path().join("splits");

        let p = partitioner(0.8, LinkMode::Symlink);
        let manifest = p.partition(&aug, &splits).unwrap();

        assert_eq!(manifest.total_images, 10);
        assert_eq!(manifest.count(DataSplit::Train, "a"), 8);
        assert_eq!(manifest.count(DataSplit::Val, "a"), 2);
        assert_eq!(manifest.count(DataSplit::Train, "b"), 0);
        assert_eq!(manifest.classes, vec!["a", "b"]);
        assert!(splits.join(MANIFEST_FILE).exists());
        assert_eq!(scan_images(&splits.join("train/a")).unwrap().len(), 8);
        assert_eq!(scan_images(&splits.join("val/a")).unwrap().len(), 2);

        let train = members(&splits.join("train/a"));
        let val = members(&splits.join("val/a"));
        assert!(train.is_disjoint(&val));
    }

    #[test]
    fn test_repartition_is_reproducible() {
        let dir = TempDir::new().unwrap();
        let aug = dir.path().join("aug");
        for i in 0..20 {
            write_test_image(&aug.join(format!("b/s{i:02}.png")));
        }
        let splits = dir.path().join("splits");
        let p = partitioner(0.75, LinkMode::Copy);

        p.partition(&aug, &splits).unwrap();
        let first = members(&splits.join("val/b"));
        fs::write(splits.join("val/b/stale.png"), b"x").unwrap();
        p.partition(&aug, &splits).unwrap();
        let second = members(&splits.join("val/b"));

        assert_eq!(first, second);
        assert_eq!(second.len(), 5);
    }

    #[test]
    fn test_missing_augmented_dir() {
        let dir = TempDir::new().unwrap();
        let err = partitioner(0.8, LinkMode::Copy)
            .partition(&dir.path().join("nope"), &dir.path().join("splits"))
            .unwrap_err();
        assert!(matches!(err, Error::MissingInput { .. }));
    }
}
