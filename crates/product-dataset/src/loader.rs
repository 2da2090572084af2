//! Image discovery and decoding.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use product_core::{is_image_file, ClassSet, Error, Result};
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Lists the images directly inside `dir`, sorted by file name.
///
/// Symlinks are followed so partitioned split directories can be scanned.
pub fn scan_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::missing("image directory", dir));
    }

    let mut images = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() && is_image_file(entry.path()) {
            images.push(entry.into_path());
        }
    }
    Ok(images)
}

/// Decodes an image, reporting any decode failure as [`Error::CorruptSample`].
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    if !path.exists() {
        return Err(Error::missing("image", path));
    }
    image::open(path).map_err(|e| Error::CorruptSample {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Per-class image counts of the raw data directory.
#[derive(Debug, Clone, Serialize)]
pub struct RawDataSummary {
    /// `(class, image count)` in class order
    pub classes: Vec<(String, usize)>,
    pub total_images: usize,
}

/// Checks that raw training data is present.
///
/// Fails when the raw directory is absent, when any class directory is
/// missing, or when no class holds an image.
pub fn check_raw_data(raw_dir: &Path, classes: &ClassSet) -> Result<RawDataSummary> {
    if !raw_dir.is_dir() {
        return Err(Error::missing("raw data directory", raw_dir));
    }

    let mut summary = RawDataSummary {
        classes: Vec::with_capacity(classes.len()),
        total_images: 0,
    };
    let mut missing = Vec::new();

    for class in classes.iter() {
        let class_dir = raw_dir.join(class);
        if class_dir.is_dir() {
            let count = scan_images(&class_dir)?.len();
            info!(class, count, "Raw images found");
            summary.total_images += count;
            summary.classes.push((class.to_string(), count));
        } else {
            warn!(class, dir = %class_dir.display(), "Raw class directory missing");
            missing.push(class);
        }
    }

    if !missing.is_empty() {
        return Err(Error::missing(
            format!("raw class directories for {}", missing.join(", ")),
            raw_dir,
        ));
    }
    if summary.total_images == 0 {
        return Err(Error::missing("raw training images", raw_dir));
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_test_image;
    use tempfile::TempDir;

    #[test]
    fn test_scan_images_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        write_test_image(&dir.path().join("b.png"));
        write_test_image(&dir.path().join("a.jpg"));
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("sub.png")).unwrap();

        let images = scan_images(dir.path()).unwrap();
        let names: Vec<_> = images
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.png"]);
    }

    #[test]
    fn test_scan_missing_dir() {
        let dir = TempDir::new().unwrap();
        let err = scan_images(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, Error::MissingInput { .. }));
    }

    #[test]
    fn test_load_corrupt_image() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(matches!(load_image(&path), Err(Error::CorruptSample { .. })));
    }

    #[test]
    fn test_check_raw_data() {
        let dir = TempDir::new().unwrap();
        let classes = ClassSet::new(["a", "b"]).unwrap();

        assert!(check_raw_data(&dir.path().join("raw"), &classes).is_err());

        write_test_image(&dir.path().join("raw/a/1.png"));
        write_test_image(&dir.path().join("raw/a/2.png"));
        std::fs::create_dir_all(dir.path().join("raw/b")).unwrap();
        let summary = check_raw_data(&dir.path().join("raw"), &classes).unwrap();
        assert_eq!(summary.total_images, 2);
        assert_eq!(summary.classes, vec![("a".to_string(), 2), ("b".to_string(), 0)]);
    }

    #[test]
    fn test_check_raw_data_missing_class_fails() {
        let dir = TempDir::new().unwrap();
        let classes = ClassSet::new(["a", "b", "c"]).unwrap();
        write_test_image(&dir.path().join("a/1.png"));

        match check_raw_data(dir.path(), &classes) {
            Err(Error::MissingInput { what, .. }) => assert!(what.contains("b, c"), "{what}"),
            other => panic!("expected missing input, got {other:?}"),
        }
    }

    #[test]
    fn test_check_raw_data_without_images_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        let classes = ClassSet::new(["a"]).unwrap();
        assert!(matches!(
            check_raw_data(dir.path(), &classes),
            Err(Error::MissingInput { .. })
        ));
    }
}
