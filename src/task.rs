use crate::error::TaskError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque task identifier, rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A named blob handed over by the submitting collaborator.
#[derive(Debug, Clone)]
pub struct InputDoc {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl InputDoc {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// One stored source document of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputUnit {
    pub index: usize,
    pub original_name: String,
    /// Sanitized, unique within the task.
    pub name: String,
    pub path: PathBuf,
    pub weight: u64,
}

/// A file inside the shared directory, addressed by its name relative to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    pub input: String,
    pub output: ArtifactRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    pub input: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum UnitOutcome {
    Converted(ConversionResult),
    Failed(Tombstone),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Weighing,
    Converting,
    Packaging,
    Done,
    Failed { error: TaskError },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Weighing => "weighing",
            TaskState::Converting => "converting",
            TaskState::Packaging => "packaging",
            TaskState::Done => "done",
            TaskState::Failed { .. } => "failed",
        }
    }
}
