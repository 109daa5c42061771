//! Streaming ZIP archive writer.
//!
//! An archive is built entry by entry: each source file is opened, copied
//! into the ZIP through a fixed-size buffer, and closed before the next one
//! is touched, so memory use does not grow with the size of the archive.
//!
//! The ZIP is written to `<destination>.part` and renamed to its final name
//! only after the central directory is flushed. Any failure, including a
//! cancellation reported by the progress callback, removes the partial file;
//! the final path therefore only ever holds a complete archive.

use crate::paths::{PathError, PathResolver, ResolvedPath};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to archive {name}: {source}")]
    Entry {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write archive: {0}")]
    Io(#[from] io::Error),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("{0}")]
    Aborted(String),
}

/// One file to add: `name` is the entry path inside the ZIP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub source: PathBuf,
}

impl From<ResolvedPath> for ArchiveEntry {
    fn from(resolved: ResolvedPath) -> Self {
        Self {
            name: resolved.relative_path,
            source: resolved.absolute_path,
        }
    }
}

/// Progress report handed to the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveProgress<'a> {
    /// Entries fully written so far.
    pub processed: u64,
    pub total: u64,
    /// Entry being written, or the one just finished.
    pub current: &'a str,
}

/// Outcome of a finished archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub entries: u64,
    /// Uncompressed bytes copied in.
    pub bytes: u64,
}

/// Expand requested paths into archive entries.
///
/// Files become one entry each; directories are expanded recursively (see
/// [`PathResolver::list_files`]). Entries are named by their path relative
/// to the source root. A file reached through two requested paths is added
/// once, at its first position.
pub fn plan_entries(
    resolver: &PathResolver,
    source_key: &str,
    paths: &[String],
) -> Result<Vec<ArchiveEntry>, PathError> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for path in paths {
        let resolved = resolver.resolve_entry(source_key, path)?;
        for file in resolver.list_files(&resolved) {
            if seen.insert(file.relative_path.clone()) {
                entries.push(ArchiveEntry::from(file));
            }
        }
    }
    Ok(entries)
}

/// `<destination>.part`
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Write `entries` into a ZIP at `destination`.
///
/// `on_progress` runs before each entry (with `processed` equal to the
/// number of entries already written) and after it (with `processed`
/// incremented). Returning an error from it aborts the archive.
pub fn write_archive<F>(
    entries: &[ArchiveEntry],
    destination: &Path,
    mut on_progress: F,
) -> Result<ArchiveSummary, ArchiveError>
where
    F: FnMut(ArchiveProgress<'_>) -> Result<(), ArchiveError>,
{
    let partial = partial_path(destination);
    match write_entries(entries, &partial, &mut on_progress) {
        Ok(summary) => {
            if let Err(e) = std::fs::rename(&partial, destination) {
                let _ = std::fs::remove_file(&partial);
                return Err(e.into());
            }
            Ok(summary)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            Err(e)
        }
    }
}

fn write_entries<F>(
    entries: &[ArchiveEntry],
    partial: &Path,
    on_progress: &mut F,
) -> Result<ArchiveSummary, ArchiveError>
where
    F: FnMut(ArchiveProgress<'_>) -> Result<(), ArchiveError>,
{
    if let Some(parent) = partial.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut zip = ZipWriter::new(BufWriter::new(File::create(partial)?));
    let total = entries.len() as u64;
    let mut bytes = 0u64;

    for (index, entry) in entries.iter().enumerate() {
        let index = index as u64;
        on_progress(ArchiveProgress {
            processed: index,
            total,
            current: &entry.name,
        })?;

        let entry_error = |source: io::Error| ArchiveError::Entry {
            name: entry.name.clone(),
            source,
        };
        let mut file = File::open(&entry.source).map_err(entry_error)?;
        let len = file.metadata().map_err(entry_error)?.len();
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .large_file(len >= u32::MAX as u64);
        zip.start_file(entry.name.as_str(), options)?;
        bytes += io::copy(&mut file, &mut zip).map_err(entry_error)?;

        on_progress(ArchiveProgress {
            processed: index + 1,
            total,
            current: &entry.name,
        })?;
    }

    let mut writer = zip.finish()?;
    io::Write::flush(&mut writer)?;
    writer
        .into_inner()
        .map_err(|e| ArchiveError::Io(e.into_error()))?
        .sync_all()?;

    Ok(ArchiveSummary {
        entries: total,
        bytes,
    })
}
