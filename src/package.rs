use crate::{
    error::PackagingError,
    task::{ArtifactRef, ConversionResult},
};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use tracing::info;
use zip::{write::SimpleFileOptions, CompressionMethod, DateTime, ZipWriter};

pub fn archive_file_name(prefix: &str, task_id: &str) -> String {
    format!("{prefix}{task_id}.zip")
}

/// Turn a task's successful results into its downloadable artifact.
///
/// A single result is returned as is. Several results are written, in the
/// given order, into a new archive at `archive`.
pub fn package(
    results: &[ConversionResult],
    archive: &ArtifactRef,
) -> Result<ArtifactRef, PackagingError> {
    match results {
        [] => Err(PackagingError::Empty),
        [only] => Ok(only.output.clone()),
        many => {
            write_archive(many, &archive.path)?;
            info!(
                "packaged {} outputs into {}",
                many.len(),
                archive.path.display()
            );
            Ok(archive.clone())
        }
    }
}

/// Entries carry a fixed timestamp and mode, so the same inputs always give
/// the same archive bytes.
pub fn write_archive(results: &[ConversionResult], dest: &Path) -> Result<(), PackagingError> {
    let part = dest.with_extension("zip.part");
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644);

    let written = (|| -> Result<(), PackagingError> {
        let mut zip = ZipWriter::new(File::create(&part)?);
        for r in results {
            zip.start_file(entry_name(&r.output), options)?;
            let mut src = File::open(&r.output.path)?;
            io::copy(&mut src, &mut zip)?;
        }
        let mut file = zip.finish()?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(err) = written {
        let _ = std::fs::remove_file(&part);
        return Err(err);
    }

    std::fs::rename(&part, dest)?;
    Ok(())
}

fn entry_name(artifact: &ArtifactRef) -> String {
    artifact
        .name
        .rsplit('/')
        .next()
        .unwrap_or(artifact.name.as_str())
        .to_string()
}
