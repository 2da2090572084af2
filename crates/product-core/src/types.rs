//! Core types shared by every pipeline stage.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// File extensions treated as images when scanning directories.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// Returns true if the path has one of the [`IMAGE_EXTENSIONS`].
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Ordered, immutable set of class labels.
///
/// The position of a label is its index everywhere: augmentation output
/// folders, the label order handed to the trainer, confusion-matrix axes and
/// the label array of the converted model. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ClassSet {
    names: Arc<[String]>,
}

impl ClassSet {
    /// Builds a class set, rejecting empty, blank or duplicate labels.
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(Error::Config("class set must not be empty".to_string()));
        }
        for (i, name) in names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(Error::Config(format!("class at position {i} has an empty name")));
            }
            if name.contains(['/', '\\']) {
                return Err(Error::Config(format!("class name '{name}' contains a path separator")));
            }
            if names[..i].contains(name) {
                return Err(Error::Config(format!("duplicate class name '{name}'")));
            }
        }
        Ok(Self { names: names.into() })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Label at `index`.
    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Index of `name`, if it belongs to the set.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Fails with [`Error::ClassOrderMismatch`] unless `found` has exactly
    /// this order.
    pub fn ensure_same_order(&self, found: &[String]) -> Result<()> {
        if self.names.as_ref() == found {
            Ok(())
        } else {
            Err(Error::ClassOrderMismatch {
                expected: self.names.to_vec(),
                found: found.to_vec(),
            })
        }
    }
}

impl TryFrom<Vec<String>> for ClassSet {
    type Error = Error;

    fn try_from(names: Vec<String>) -> Result<Self> {
        ClassSet::new(names)
    }
}

impl From<ClassSet> for Vec<String> {
    fn from(set: ClassSet) -> Self {
        set.names.to_vec()
    }
}

impl fmt::Display for ClassSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.names.join(", "))
    }
}

/// Dataset split produced by the partitioner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DataSplit {
    /// Training data
    Train,
    /// Held-out validation data
    Val,
}

impl DataSplit {
    pub const ALL: [DataSplit; 2] = [DataSplit::Train, DataSplit::Val];

    /// Directory name of this split below the splits root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            DataSplit::Train => "train",
            DataSplit::Val => "val",
        }
    }
}

impl fmt::Display for DataSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Whether an augmented sample is the resized source or a random variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SampleOrigin {
    Original,
    Generated,
}

/// Pipeline stage, used for logging, run records and error attribution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Check,
    Augmentation,
    Partition,
    Training,
    Validation,
    Conversion,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Check => "check",
            Stage::Augmentation => "augmentation",
            Stage::Partition => "partition",
            Stage::Training => "training",
            Stage::Validation => "validation",
            Stage::Conversion => "conversion",
        };
        f.write_str(name)
    }
}

/// Image dimensions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageDimensions {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Number of channels (3 for RGB)
    pub channels: u32,
}

impl ImageDimensions {
    pub fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Square RGB input of the given side length.
    pub fn square_rgb(size: u32) -> Self {
        Self::new(size, size, 3)
    }

    /// Shape as `[height, width, channels]`.
    pub fn shape(&self) -> [usize; 3] {
        [self.height as usize, self.width as usize, self.channels as usize]
    }

    /// Number of scalar values in one input tensor.
    pub fn num_values(&self) -> usize {
        self.shape().iter().product()
    }
}

/// A labeled image on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledImage {
    pub path: PathBuf,
    /// Index into the [`ClassSet`]
    pub label: usize,
}
