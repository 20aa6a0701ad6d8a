use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, warn};

/// Reports how many units of work (pages) a document represents.
pub trait PageCounter: Send + Sync {
    fn count_pages(&self, bytes: &[u8]) -> Result<u64>;
}

/// Counts pages by parsing the PDF page tree in-process.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfPageCounter;

impl PageCounter for PdfPageCounter {
    fn count_pages(&self, bytes: &[u8]) -> Result<u64> {
        let doc = lopdf::Document::load_mem(bytes).with_context(|| "parsing PDF")?;
        Ok(doc.get_pages().len() as u64)
    }
}

/// Weight of one document. Never fails: a document that cannot be inspected
/// weighs 0 and the reason is logged.
pub fn weigh(counter: &dyn PageCounter, name: &str, bytes: &[u8]) -> u64 {
    match counter.count_pages(bytes) {
        Ok(pages) => {
            debug!("weigh input={name} pages={pages}");
            pages
        }
        Err(err) => {
            warn!("weigh failed input={name}; counting as 0 pages: {err:#}");
            0
        }
    }
}

pub fn weigh_file(counter: &dyn PageCounter, path: &Path) -> u64 {
    let name = path.display().to_string();
    match std::fs::read(path) {
        Ok(bytes) => weigh(counter, &name, &bytes),
        Err(err) => {
            warn!("weigh failed input={name}; cannot read file: {err}");
            0
        }
    }
}
