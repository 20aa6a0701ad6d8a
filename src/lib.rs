//! Batch OCR orchestration: one external engine run per document, weighted
//! progress published to a shared store, and a single downloadable artifact
//! per task.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod package;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod task;
pub mod util;
pub mod weigh;

pub use error::{ConversionError, PackagingError, SubmitError, TaskError};
pub use pipeline::{BatchOrchestrator, TaskHandle};
pub use progress::{FileProgressStore, MemoryProgressStore, ProgressStore, ProgressTracker};
pub use task::{ArtifactRef, InputDoc, TaskId, TaskState};
