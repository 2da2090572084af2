//! Replacing the published model in the public directory.
//!
//! The new model is copied into a staging directory next to the target
//! first. Then, holding `.ml-model.lock`, the current target is renamed
//! aside and the staging directory renamed into place. Publishers exclude
//! each other through the lock; readers that ignore it can still find the
//! target missing for the instant between the two renames.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use product_core::{Error, Result, Stage};
use tracing::{error, info, warn};
use walkdir::WalkDir;

pub const PUBLISHED_DIR_NAME: &str = "ml-model";
const LOCK_FILE: &str = ".ml-model.lock";
const STAGING_DIR: &str = ".ml-model.staging";
const PREVIOUS_DIR: &str = ".ml-model.previous";

/// Exclusive publish lock, released on drop.
struct PublishLock {
    path: PathBuf,
}

impl PublishLock {
    fn acquire(path: PathBuf) -> Result<Self> {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "pid={} at={}", std::process::id(), Utc::now().to_rfc3339())?;
                Ok(Self { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::StageExecution {
                stage: Stage::Conversion,
                message: format!(
                    "publish lock {} is held; remove it if no other publish is running",
                    path.display()
                ),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for PublishLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release publish lock");
        }
    }
}

/// Recursively copies `src` into a new directory `dst`.
fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Moves the set-aside model back to `target`. Returns false, leaving the
/// model at `previous`, when the rename fails.
fn restore_previous(previous: &Path, target: &Path) -> bool {
    match fs::rename(previous, target) {
        Ok(()) => true,
        Err(e) => {
            error!(
                previous = %previous.display(),
                target = %target.display(),
                error = %e,
                "Failed to restore previous model; it remains at the previous path"
            );
            false
        }
    }
}

/// Replaces `<public_dir>/ml-model` with a copy of `model_dir`.
pub fn publish(model_dir: &Path, public_dir: &Path) -> Result<PathBuf> {
    if !model_dir.is_dir() {
        return Err(Error::missing("converted model directory", model_dir));
    }
    fs::create_dir_all(public_dir)?;

    let target = public_dir.join(PUBLISHED_DIR_NAME);
    let staging = public_dir.join(STAGING_DIR);
    let previous = public_dir.join(PREVIOUS_DIR);

    let _lock = PublishLock::acquire(public_dir.join(LOCK_FILE))?;

    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    copy_dir(model_dir, &staging)?;

    if previous.exists() {
        fs::remove_dir_all(&previous)?;
    }
    if target.exists() {
        fs::rename(&target, &previous)?;
    }
    if let Err(e) = fs::rename(&staging, &target) {
        // put the old model back before reporting
        if previous.exists() {
            restore_previous(&previous, &target);
        }
        return Err(e.into());
    }
    if previous.exists() {
        if let Err(e) = fs::remove_dir_all(&previous) {
            warn!(path = %previous.display(), error = %e, "Failed to remove previous model");
        }
    }

    info!(target = %target.display(), "Model published");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn model_dir(root: &Path, marker: &str) -> PathBuf {
        let dir = root.join(format!("model-{marker}"));
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("model.json"), marker).unwrap();
        fs::write(dir.join("nested/extra.bin"), [1, 2, 3]).unwrap();
        dir
    }

    #[test]
    fn test_publish_replaces_previous_model() {
        let dir = TempDir::new().unwrap();
        let public = dir.path().join("public");

        publish(&model_dir(dir.path(), "one"), &public).unwrap();
        fs::write(public.join("ml-model/stale.txt"), "old").unwrap();
        let target = publish(&model_dir(dir.path(), "two"), &public).unwrap();

        assert_eq!(fs::read_to_string(target.join("model.json")).unwrap(), "two");
        assert_eq!(fs::read(target.join("nested/extra.bin")).unwrap(), vec![1, 2, 3]);
        assert!(!target.join("stale.txt").exists());
        assert!(!public.join(LOCK_FILE).exists());
        assert!(!public.join(STAGING_DIR).exists());
        assert!(!public.join(PREVIOUS_DIR).exists());
    }

    #[test]
    fn test_held_lock_blocks_publish() {
        let dir = TempDir::new().unwrap();
        let public = dir.path().join("public");
        fs::create_dir_all(&public).unwrap();
        fs::write(public.join(LOCK_FILE), "pid=1").unwrap();

        let err = publish(&model_dir(dir.path(), "x"), &public).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Conversion));
        assert!(!public.join(PUBLISHED_DIR_NAME).exists());
        // a foreign lock is left alone
        assert!(public.join(LOCK_FILE).exists());
    }

    #[test]
    fn test_restore_previous() {
        let dir = TempDir::new().unwrap();
        let previous = model_dir(dir.path(), "old");

        // the target's parent is missing, so the rename fails
        let unreachable = dir.path().join("gone/ml-model");
        assert!(!restore_previous(&previous, &unreachable));
        assert_eq!(fs::read_to_string(previous.join("model.json")).unwrap(), "old");

        let target = dir.path().join("ml-model");
        assert!(restore_previous(&previous, &target));
        assert_eq!(fs::read_to_string(target.join("model.json")).unwrap(), "old");
        assert!(!previous.exists());
    }

    #[test]
    fn test_missing_model_dir() {
        let dir = TempDir::new().unwrap();
        let err = publish(&dir.path().join("none"), dir.path()).unwrap_err();
        assert!(matches!(err, Error::MissingInput { .. }));
    }
}
