use crate::{
    config::Config,
    task::{TaskId, TaskState},
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub state: TaskState,
    pub started: String,
    pub finished: String,
    pub languages: String,
    pub total_weight: u64,
    pub progress: u8,
    pub units: Vec<UnitReport>,
    pub result_file: Option<String>,
    pub artifact_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitReport {
    pub name: String,
    pub original_name: String,
    pub weight: u64,
    pub attempted: bool,
    pub ok: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl TaskReport {
    /// Inputs that were attempted and failed to convert.
    pub fn failed_inputs(&self) -> Vec<&str> {
        self.units
            .iter()
            .filter(|u| u.attempted && !u.ok)
            .map(|u| u.name.as_str())
            .collect()
    }

    /// The task completed, but not every input made it into the artifact.
    pub fn is_partial_failure(&self) -> bool {
        self.state == TaskState::Done && !self.failed_inputs().is_empty()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing task index: {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading task index: {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing task index: {}", path.display()))
    }
}

pub fn index_path(cfg: &Config, task_id: &TaskId) -> PathBuf {
    cfg.task_dir(&task_id.to_string()).join(INDEX_FILE)
}
