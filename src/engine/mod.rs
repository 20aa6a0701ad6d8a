pub mod docker;
pub mod types;

use crate::{error::ConversionError, task::ArtifactRef};
use anyhow::Result;

pub use types::{language_flag, ConvertIn, DocDiag};

/// The external conversion tool, invoked once per input document.
pub trait Engine: Send + Sync {
    fn doctor(&self) -> Result<DocDiag>;
    /// Blocks until the tool exits.
    fn convert(&self, req: &ConvertIn) -> Result<ArtifactRef, ConversionError>;
}
