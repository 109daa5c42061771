//! On-disk artifact layout.
//!
//! Every derived file lives at a location that is a pure function of the
//! request that produced it. Clients can probe for a preview without asking
//! the job store, and the worker can detect an up-to-date artifact before
//! spending time on an encode.
//!
//! # Layout
//!
//! ```text
//! <cache_dir>/<source>/<edge>/<relative path>.jpg     previews
//! <archive_dir>/<token>.zip                           finished archives
//! <archive_dir>/<token>.zip.part                      archive being written (see crate::archive)
//! ```
//!
//! The preview keeps the source's own extension and appends `.jpg`
//! (`albumA/IMG_1.CR2` → `albumA/IMG_1.CR2.jpg`), so two sources that differ
//! only by extension never collide.
//!
//! ## Archive identity
//!
//! Two archive requests are the same request when they name the same source
//! and the same set of paths, in any order. [`archive_digest`] hashes that
//! set with SHA-256; the job store keys deduplication on it.

use crate::paths::normalize_relative;
use crate::types::TargetSize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Extension appended to every preview.
pub const PREVIEW_EXTENSION: &str = "jpg";

const ARCHIVE_EXTENSION: &str = "zip";

/// Location of the preview for `(source_key, relative_path, target)`.
///
/// `relative_path` is normalized first, so every spelling of the same file
/// maps to the same artifact.
pub fn cache_path(
    cache_dir: &Path,
    source_key: &str,
    relative_path: &str,
    target: TargetSize,
) -> PathBuf {
    let relative = normalize_relative(relative_path);
    cache_dir
        .join(source_key)
        .join(target.edge().to_string())
        .join(format!("{relative}.{PREVIEW_EXTENSION}"))
}

/// Final location of a finished archive.
pub fn archive_path(archive_dir: &Path, token: &str) -> PathBuf {
    archive_dir.join(format!("{token}.{ARCHIVE_EXTENSION}"))
}

/// Download file name offered for an archive.
pub fn archive_download_name(token: &str) -> String {
    format!("{token}.{ARCHIVE_EXTENSION}")
}

/// SHA-256 over the source key and the sorted, normalized path set.
pub fn archive_digest(source_key: &str, paths: &[String]) -> String {
    let mut normalized: Vec<String> = paths.iter().map(|p| normalize_relative(p)).collect();
    normalized.sort();
    normalized.dedup();

    let mut hasher = Sha256::new();
    hasher.update(b"archive\0");
    hasher.update(source_key.as_bytes());
    hasher.update(b"\0");
    for path in &normalized {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// True when `artifact` exists and was written no earlier than `source`
/// was last modified.
pub fn is_fresh(artifact: &Path, source: &Path) -> bool {
    match (modified(artifact), modified(source)) {
        (Some(artifact), Some(source)) => artifact >= source,
        _ => false,
    }
}
