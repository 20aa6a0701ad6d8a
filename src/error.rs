//! Error types for batch OCR tasks.
//!
//! [`ConversionError`] belongs to a single input and is absorbed by the
//! orchestrator unless it is [`ConversionError::EngineUnavailable`].
//! [`TaskError`] is a terminal task outcome. [`SubmitError`] means no task was
//! created at all.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Failure of one engine invocation.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The engine process could not be started at all.
    #[error("engine could not be launched: {reason}")]
    EngineUnavailable { reason: String },

    /// The engine ran and exited non-zero. `code` is `None` when it was
    /// terminated by a signal.
    #[error("engine exited with status {code:?}: {stderr}")]
    ToolFailed { code: Option<i32>, stderr: String },

    #[error("engine exceeded timeout of {secs}s")]
    TimedOut { secs: u64 },

    #[error("engine exited 0 but produced no output at {}", path.display())]
    MissingOutput { path: PathBuf },

    #[error("path is outside the shared directory: {}", path.display())]
    OutsideSharedDir { path: PathBuf },

    #[error("engine i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl ConversionError {
    /// Fatal errors stop the whole task; everything else only tombstones the
    /// input that caused it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConversionError::EngineUnavailable { .. })
    }
}

/// Terminal failure of a task. Progress stays at its last published value.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    #[error("none of the {attempted} inputs converted successfully")]
    NoValidInput { attempted: usize },

    #[error("engine unavailable: {reason}")]
    EngineUnavailable { reason: String },

    #[error("packaging failed: {reason}")]
    PackagingFailure { reason: String },
}

/// Submission was rejected before a task was created.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("no inputs were submitted")]
    Empty,

    #[error("none of the {submitted} inputs has an allowed extension")]
    NoAcceptedInput { submitted: usize },

    #[error("too many inputs: {count} > {max}")]
    TooManyInputs { count: usize, max: usize },

    #[error("input '{name}' is {bytes} bytes, limit is {max}")]
    InputTooLarge { name: String, bytes: u64, max: u64 },

    #[error("storing inputs: {0}")]
    Io(#[from] std::io::Error),

    #[error("starting task worker: {0}")]
    Spawn(std::io::Error),
}

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("nothing to package")]
    Empty,

    #[error("archive i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}
