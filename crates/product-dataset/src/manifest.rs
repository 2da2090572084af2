//! The `dataset_info.json` record of a partition.

use std::collections::BTreeMap;
use std::path::Path;

use product_core::cli::{read_json, write_json};
use product_core::{ClassSet, DataSplit, Result};
use serde::{Deserialize, Serialize};

/// Per-class sample counts of both splits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitCounts {
    pub train: BTreeMap<String, usize>,
    pub val: BTreeMap<String, usize>,
}

impl SplitCounts {
    pub fn get(&self, split: DataSplit) -> &BTreeMap<String, usize> {
        match split {
            DataSplit::Train => &self.train,
            DataSplit::Val => &self.val,
        }
    }

    pub fn get_mut(&mut self, split: DataSplit) -> &mut BTreeMap<String, usize> {
        match split {
            DataSplit::Train => &mut self.train,
            DataSplit::Val => &mut self.val,
        }
    }
}

/// Composition of a partitioned dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetManifest {
    /// Class order used to build the partition
    pub classes: Vec<String>,
    pub total_images: usize,
    pub splits: SplitCounts,
    pub seed: u64,
    pub train_ratio: f64,
}

impl DatasetManifest {
    pub fn count(&self, split: DataSplit, class: &str) -> usize {
        self.splits.get(split).get(class).copied().unwrap_or(0)
    }

    pub fn split_total(&self, split: DataSplit) -> usize {
        self.splits.get(split).values().sum()
    }

    /// Fails unless the manifest was built with exactly `classes`.
    pub fn verify_classes(&self, classes: &ClassSet) -> Result<()> {
        classes.ensure_same_order(&self.classes)
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_json(path, "dataset manifest")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }
}
