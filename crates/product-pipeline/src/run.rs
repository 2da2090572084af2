//! Run records and the run registry.
//!
//! Every pipeline invocation writes `<runs_dir>/<run_id>/run.json`. The
//! registry `<runs_dir>/registry.json` maps each stage to the output of its
//! latest successful run, replacing any guess based on directory names or
//! modification times.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use product_core::cli::write_json;
use product_core::{Error, Result, Stage};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const RUN_FILE: &str = "run.json";
pub const REGISTRY_FILE: &str = "registry.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Ran,
    Skipped,
    /// Not run; the output of an earlier run was reused
    Resolved,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// What happened to one stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub inputs: BTreeMap<String, PathBuf>,
    pub outputs: BTreeMap<String, PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRecord {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            note: None,
            error: None,
        }
    }

    pub fn input(&mut self, name: &str, path: &Path) -> &mut Self {
        self.inputs.insert(name.to_string(), path.to_path_buf());
        self
    }

    pub fn output(&mut self, name: &str, path: &Path) -> &mut Self {
        self.outputs.insert(name.to_string(), path.to_path_buf());
        self
    }

    pub fn note(&mut self, note: impl Into<String>) -> &mut Self {
        self.note = Some(note.into());
        self
    }

    pub(crate) fn start(&mut self) {
        self.status = StageStatus::Pending;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn succeed(&mut self) {
        self.status = StageStatus::Ran;
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, error: &Error) {
        self.status = StageStatus::Failed;
        self.error = Some(error.to_string());
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn skip(&mut self) {
        self.mark(StageStatus::Skipped);
    }

    pub(crate) fn resolve(&mut self) {
        self.mark(StageStatus::Resolved);
    }

    fn mark(&mut self, status: StageStatus) {
        self.status = status;
        let now = Utc::now();
        self.started_at = Some(now);
        self.finished_at = Some(now);
    }
}

/// Record of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub classes: Vec<String>,
    pub stages: Vec<StageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
}

impl PipelineRun {
    pub fn new(classes: Vec<String>) -> Self {
        let started_at = Utc::now();
        Self {
            run_id: format!("run_{}", started_at.format("%Y%m%d_%H%M%S_%3f")),
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            classes,
            stages: Vec::new(),
            failed_stage: None,
        }
    }

    /// The record for `stage`, created on first use.
    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageRecord {
        let index = match self.stages.iter().position(|s| s.stage == stage) {
            Some(i) => i,
            None => {
                self.stages.push(StageRecord::new(stage));
                self.stages.len() - 1
            }
        };
        &mut self.stages[index]
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn path(&self, runs_dir: &Path) -> PathBuf {
        runs_dir.join(&self.run_id).join(RUN_FILE)
    }

    pub fn save(&self, runs_dir: &Path) -> Result<PathBuf> {
        let path = self.path(runs_dir);
        write_json(&path, self)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        product_core::cli::read_json(path, "run record")
    }
}

/// Latest successful output of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub run_id: String,
    pub output: PathBuf,
    pub recorded_at: DateTime<Utc>,
}

/// Per-stage pointers to the latest successful outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRegistry {
    #[serde(skip)]
    path: PathBuf,
    pub stages: BTreeMap<Stage, RegistryEntry>,
}

impl RunRegistry {
    /// Loads `<runs_dir>/registry.json`, or an empty registry if absent.
    pub fn load(runs_dir: &Path) -> Result<Self> {
        let path = runs_dir.join(REGISTRY_FILE);
        let mut registry = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str::<RunRegistry>(&content)?
        } else {
            RunRegistry::default()
        };
        registry.path = path;
        Ok(registry)
    }

    pub fn latest(&self, stage: Stage) -> Option<&RegistryEntry> {
        self.stages.get(&stage)
    }

    /// Output of the latest successful `stage` run if it still exists.
    pub fn resolve(&self, stage: Stage) -> Option<PathBuf> {
        let entry = self.latest(stage)?;
        if entry.output.exists() {
            Some(entry.output.clone())
        } else {
            debug!(%stage, path = %entry.output.display(), "Registered output no longer exists");
            None
        }
    }

    pub fn record(&mut self, stage: Stage, run_id: &str, output: &Path) {
        self.stages.insert(
            stage,
            RegistryEntry {
                run_id: run_id.to_string(),
                output: output.to_path_buf(),
                recorded_at: Utc::now(),
            },
        );
    }

    /// Writes the registry through a temporary file and a rename.
    pub fn save(&self) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        write_json(&tmp, self)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stage_records() {
        let mut run = PipelineRun::new(vec!["a".into()]);
        assert!(run.run_id.starts_with("run_"));

        run.stage_mut(Stage::Training).start();
        run.stage_mut(Stage::Training)
            .output("model", Path::new("models/training_1"));
        run.stage_mut(Stage::Training).succeed();
        run.stage_mut(Stage::Validation).fail(&Error::Cancelled);

        assert_eq!(run.stages.len(), 2);
        let training = run.stage(Stage::Training).unwrap();
        assert_eq!(training.status, StageStatus::Ran);
        assert!(training.finished_at.is_some());
        let validation = run.stage(Stage::Validation).unwrap();
        assert_eq!(validation.status, StageStatus::Failed);
        assert_eq!(validation.error.as_deref(), Some("Operation cancelled"));
    }

    #[test]
    fn test_run_save_load() {
        let dir = TempDir::new().unwrap();
        let mut run = PipelineRun::new(vec!["a".into(), "b".into()]);
        run.stage_mut(Stage::Conversion).skip();
        run.finish(RunStatus::Succeeded);
        let path = run.save(dir.path()).unwrap();
        assert_eq!(PipelineRun::load(&path).unwrap(), run);

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["stages"][0]["status"], "skipped");
        assert_eq!(json["stages"][0]["stage"], "conversion");
    }

    #[test]
    fn test_registry_roundtrip_and_resolve() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("models/training_x");
        fs::create_dir_all(&output).unwrap();

        let mut registry = RunRegistry::load(dir.path()).unwrap();
        assert!(registry.latest(Stage::Training).is_none());
        registry.record(Stage::Training, "run_1", &output);
        registry.record(Stage::Partition, "run_1", &dir.path().join("gone"));
        registry.save().unwrap();

        let loaded = RunRegistry::load(dir.path()).unwrap();
        assert_eq!(loaded.latest(Stage::Training).unwrap().run_id, "run_1");
        assert_eq!(loaded.resolve(Stage::Training), Some(output));
        assert_eq!(loaded.resolve(Stage::Partition), None);

        let json: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join(REGISTRY_FILE)).unwrap(),
        )
        .unwrap();
        assert!(json["stages"]["training"]["output"].is_string());
    }
}
