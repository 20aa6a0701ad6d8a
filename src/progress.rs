//! Task progress: the shared percentage store polled by collaborators, and the
//! per-task accumulator that decides what gets published to it.

use crate::{task::TaskId, util::ensure_dir};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::debug;

/// Process-wide `task id -> percentage` map. Each write replaces the whole
/// value for its key; readers never see a partial write.
pub trait ProgressStore: Send + Sync {
    /// Values above 100 are stored as 100.
    fn update(&self, task_id: &TaskId, percent: u8) -> Result<()>;
    /// Unknown tasks read as 0.
    fn get(&self, task_id: &TaskId) -> u8;
}

#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    inner: RwLock<HashMap<TaskId, u8>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn update(&self, task_id: &TaskId, percent: u8) -> Result<()> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(*task_id, percent.min(100));
        Ok(())
    }

    fn get(&self, task_id: &TaskId) -> u8 {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(task_id).copied().unwrap_or(0)
    }
}

/// One `<dir>/<task_id>.txt` record per task, readable from any process.
/// Writes land in a temp file next to the record and are renamed over it.
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    dir: PathBuf,
}

impl FileProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        ensure_dir(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(format!("{task_id}.txt"))
    }
}

impl ProgressStore for FileProgressStore {
    fn update(&self, task_id: &TaskId, percent: u8) -> Result<()> {
        let path = self.record_path(task_id);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("create temp progress file in {}", self.dir.display()))?;
        write!(tmp, "{}", percent.min(100))?;
        tmp.flush()?;
        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("replace progress record {}", path.display()))?;
        Ok(())
    }

    fn get(&self, task_id: &TaskId) -> u8 {
        let path = self.record_path(task_id);
        match std::fs::read_to_string(&path) {
            Ok(raw) => raw.trim().parse::<u8>().map(|p| p.min(100)).unwrap_or_else(|e| {
                debug!("unreadable progress record {}: {e}", path.display());
                0
            }),
            Err(_) => 0,
        }
    }
}

/// Weighted completion of one task.
///
/// The denominator is fixed at construction. With a total weight of zero,
/// progress falls back to attempted units over total units. Values of 100 are
/// never published from here: only a packaged task reaches 100.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_weight: u64,
    total_units: usize,
    processed_weight: u64,
    attempted: usize,
    published: u8,
}

impl ProgressTracker {
    pub fn new(total_weight: u64, total_units: usize) -> Self {
        Self {
            total_weight,
            total_units,
            processed_weight: 0,
            attempted: 0,
            published: 0,
        }
    }

    pub fn percent(&self) -> u8 {
        let pct = if self.total_weight > 0 {
            100 * u128::from(self.processed_weight) / u128::from(self.total_weight)
        } else if self.total_units > 0 {
            100 * self.attempted as u128 / self.total_units as u128
        } else {
            0
        };
        pct.min(100) as u8
    }

    /// Account for one attempted unit. Returns the value to publish, if it
    /// moved forward. While units are still outstanding the value is capped
    /// at 99; once every unit is attempted a full 100 is left to packaging.
    pub fn record(&mut self, weight: u64) -> Option<u8> {
        self.attempted += 1;
        self.processed_weight = self.processed_weight.saturating_add(weight);
        let pct = self.percent();
        if pct == 100 && self.attempted >= self.total_units {
            return None;
        }
        let capped = pct.min(99);
        if capped > self.published {
            self.published = capped;
            Some(capped)
        } else {
            None
        }
    }
}
