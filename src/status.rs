//! Read side of the engine.
//!
//! Everything here is a query over the job store plus, for per-file probes,
//! a look at the deterministic artifact location. The one exception is
//! [`StatusApi::download_archive`], which disposes of the archive once it has
//! been handed over.

use crate::cache::{archive_download_name, cache_path};
use crate::config::EngineConfig;
use crate::paths::{PathError, PathResolver, normalize_relative};
use crate::store::{JobStore, StoreError};
use crate::types::{ArchiveJob, FolderCacheAggregate, JobStatus, TargetSize};
use serde::Serialize;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatusError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Per-file status needs a target size")]
    SizeRequired,
    #[error("Unknown archive job: {0}")]
    UnknownArchive(String),
    #[error("Archive {token} is not ready (status: {status})")]
    NotReady { token: String, status: JobStatus },
    #[error("Archive file for {0} is missing")]
    MissingArchive(String),
    #[error("Failed to send archive: {0}")]
    Io(#[from] io::Error),
}

/// State of one requested file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileCacheStatus {
    pub relative_path: String,
    /// Status of the newest job for this target; `None` if never requested.
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// True when the artifact exists on disk, whatever the job rows say.
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatusReport {
    pub source_key: String,
    pub folder: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_size: Option<TargetSize>,
    pub aggregate: FolderCacheAggregate,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileCacheStatus>,
}

/// A delivered archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveDownload {
    pub file_name: String,
    pub bytes: u64,
}

pub struct StatusApi<'a> {
    store: &'a JobStore,
    resolver: &'a PathResolver,
    config: &'a EngineConfig,
}

impl<'a> StatusApi<'a> {
    pub fn new(store: &'a JobStore, resolver: &'a PathResolver, config: &'a EngineConfig) -> Self {
        Self {
            store,
            resolver,
            config,
        }
    }

    /// Aggregate cache state under `folder`, optionally for one size, plus a
    /// probe of each path in `files` (relative to the source).
    pub fn cache_status(
        &self,
        source_key: &str,
        folder: &str,
        target: Option<TargetSize>,
        files: &[String],
    ) -> Result<CacheStatusReport, StatusError> {
        if target.is_none() && !files.is_empty() {
            return Err(StatusError::SizeRequired);
        }
        let dir = self.resolver.resolve_dir(source_key, folder)?;
        let total_eligible_files = self
            .resolver
            .list_files(&dir)
            .iter()
            .filter(|f| self.config.images.is_eligible(Path::new(&f.relative_path)))
            .count();
        let counts = self
            .store
            .cache_counts_under(source_key, &dir.relative_path, target)?;
        // without a size, every size requested under the folder is a target
        let sizes = match target {
            Some(_) => 1,
            None => self
                .store
                .requested_sizes_under(source_key, &dir.relative_path)?
                .len()
                .max(1),
        };

        let files = match target {
            Some(target) => files
                .iter()
                .map(|f| self.file_status(source_key, f, target))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        Ok(CacheStatusReport {
            source_key: source_key.to_string(),
            folder: dir.relative_path,
            target_size: target,
            aggregate: FolderCacheAggregate {
                pending: counts.pending,
                processing: counts.processing,
                completed: counts.completed,
                failed: counts.failed,
                total_eligible_files,
                total_targets: total_eligible_files * sizes,
            },
            files,
        })
    }

    fn file_status(
        &self,
        source_key: &str,
        path: &str,
        target: TargetSize,
    ) -> Result<FileCacheStatus, StatusError> {
        let relative_path = normalize_relative(path);
        let latest = self
            .store
            .latest_cache_job(source_key, &relative_path, target)?;
        let cached = cache_path(&self.config.cache_dir, source_key, &relative_path, target).is_file();
        Ok(FileCacheStatus {
            status: latest.as_ref().map(|job| job.status),
            message: latest.and_then(|job| job.result_message),
            relative_path,
            cached,
        })
    }

    pub fn archive_status(&self, token: &str) -> Result<ArchiveJob, StatusError> {
        self.store
            .get_archive_job(token)?
            .ok_or_else(|| StatusError::UnknownArchive(token.to_string()))
    }

    /// Result path of a completed archive, without touching it.
    pub fn archive_ready(&self, token: &str) -> Result<String, StatusError> {
        let job = self.archive_status(token)?;
        match (job.status, job.result_path) {
            (JobStatus::Completed, Some(path)) => Ok(path),
            (status, _) => Err(StatusError::NotReady {
                token: token.to_string(),
                status,
            }),
        }
    }

    /// Stream a completed archive into `out`, then delete the file and its
    /// job row.
    ///
    /// Fails without side effects unless the job is `completed`.
    pub fn download_archive(
        &self,
        token: &str,
        out: &mut impl Write,
    ) -> Result<ArchiveDownload, StatusError> {
        let result_path = self.archive_ready(token)?;
        let mut file = File::open(&result_path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StatusError::MissingArchive(token.to_string()),
            _ => StatusError::Io(e),
        })?;
        let bytes = io::copy(&mut file, out)?;
        out.flush()?;
        drop(file);

        if let Err(e) = std::fs::remove_file(&result_path) {
            tracing::warn!(token, error = %e, "could not remove delivered archive");
        }
        self.store.delete_archive_job(token)?;
        tracing::info!(token, bytes, "archive delivered");

        Ok(ArchiveDownload {
            file_name: archive_download_name(token),
            bytes,
        })
    }
}
