//! The job engine as one object.
//!
//! [`JobEngine`] bundles the configuration, the path sandbox and a store
//! connection, and exposes every operation collaborators call: enqueue,
//! status, download, cancel and the maintenance sweeps. The CLI is a thin
//! layer over it.

use crate::config::{ConfigError, EngineConfig};
use crate::dispatch::{CacheEnqueueReport, DispatchError, Dispatcher};
use crate::imaging::ImageBackend;
use crate::paths::PathResolver;
use crate::status::{ArchiveDownload, CacheStatusReport, StatusApi, StatusError};
use crate::store::{ArchiveEnqueue, JobStore, StatusCounts, StoreError, now_epoch_seconds};
use crate::types::{ArchiveJob, JobKind, TargetSize};
use crate::worker::{ReconcileReport, WorkerError, WorkerPool, reconcile};
use rayon::prelude::*;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelReport {
    pub kind: JobKind,
    pub cancelled_jobs: usize,
}

/// Rows removed by a maintenance sweep, per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemovedRows {
    pub cache_jobs: usize,
    pub archive_jobs: usize,
}

impl RemovedRows {
    pub fn total(&self) -> usize {
        self.cache_jobs + self.archive_jobs
    }
}

pub struct JobEngine {
    config: EngineConfig,
    resolver: PathResolver,
    store: JobStore,
}

impl JobEngine {
    /// Validate `config`, canonicalize its sources and open the job store.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let resolver = config.path_resolver()?;
        let store = JobStore::open_with_busy_timeout(&config.database, config.workers.busy_timeout())?;
        tracing::debug!(
            database = %config.database.display(),
            sources = resolver.source_keys().count(),
            "engine opened"
        );
        Ok(Self {
            config,
            resolver,
            store,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.store, &self.resolver, &self.config.images)
    }

    pub fn status(&self) -> StatusApi<'_> {
        StatusApi::new(&self.store, &self.resolver, &self.config)
    }

    /// Worker pool over the same database and sources.
    pub fn worker_pool<B: ImageBackend>(&self, backend: B) -> Result<WorkerPool<B>, EngineError> {
        Ok(WorkerPool::new(
            self.config.clone(),
            self.resolver.clone(),
            backend,
        )?)
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// `size` is a positive integer or a configured variant name.
    pub fn enqueue_cache(
        &self,
        source_key: &str,
        path: &str,
        size: &str,
    ) -> Result<CacheEnqueueReport, EngineError> {
        let dispatcher = self.dispatcher();
        let target = dispatcher.parse_target_size(size)?;
        Ok(dispatcher.enqueue_cache(source_key, path, target)?)
    }

    pub fn enqueue_archive(
        &self,
        source_key: &str,
        paths: &[String],
    ) -> Result<ArchiveEnqueue, EngineError> {
        Ok(self.dispatcher().enqueue_archive(source_key, paths)?)
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn cache_status(
        &self,
        source_key: &str,
        folder: &str,
        size: Option<&str>,
        files: &[String],
    ) -> Result<CacheStatusReport, EngineError> {
        let target: Option<TargetSize> = size
            .map(|s| self.dispatcher().parse_target_size(s))
            .transpose()?;
        Ok(self.status().cache_status(source_key, folder, target, files)?)
    }

    pub fn archive_status(&self, token: &str) -> Result<ArchiveJob, EngineError> {
        Ok(self.status().archive_status(token)?)
    }

    pub fn download_archive(
        &self,
        token: &str,
        out: &mut impl Write,
    ) -> Result<ArchiveDownload, EngineError> {
        Ok(self.status().download_archive(token, out)?)
    }

    pub fn job_counts(&self, kind: JobKind) -> Result<StatusCounts, EngineError> {
        Ok(self.store.job_counts(kind)?)
    }

    // =========================================================================
    // Control and maintenance
    // =========================================================================

    /// Fail every pending and processing job of `kind`. In-flight work is not
    /// interrupted, but its worker can no longer report progress or finish.
    pub fn cancel_active_jobs(&self, kind: JobKind) -> Result<CancelReport, EngineError> {
        let cancelled_jobs = match kind {
            JobKind::Cache => self.store.cancel_cache_jobs()?,
            JobKind::Archive => self.store.cancel_archive_jobs()?,
        };
        tracing::info!(%kind, cancelled_jobs, "cancelled active jobs");
        Ok(CancelReport {
            kind,
            cancelled_jobs,
        })
    }

    /// Delete every `failed` row of both kinds.
    pub fn clear_failed_jobs(&self) -> Result<RemovedRows, EngineError> {
        let removed = RemovedRows {
            cache_jobs: self.store.clear_failed_cache_jobs()?,
            archive_jobs: self.store.clear_failed_archive_jobs()?,
        };
        tracing::info!(
            cache_jobs = removed.cache_jobs,
            archive_jobs = removed.archive_jobs,
            "cleared failed jobs"
        );
        Ok(removed)
    }

    /// Delete rows whose recorded artifact no longer exists on disk.
    pub fn cleanup_orphaned_records(&self) -> Result<RemovedRows, EngineError> {
        let orphaned_cache: Vec<i64> = self
            .store
            .cache_artifacts()?
            .into_par_iter()
            .filter(|(_, artifact)| !Path::new(artifact).exists())
            .map(|(id, _)| id)
            .collect();
        let orphaned_archives: Vec<String> = self
            .store
            .archive_results()?
            .into_par_iter()
            .filter(|(_, result)| !Path::new(result).exists())
            .map(|(token, _)| token)
            .collect();

        let mut removed = RemovedRows {
            cache_jobs: self.store.delete_cache_jobs(&orphaned_cache)?,
            archive_jobs: 0,
        };
        for token in &orphaned_archives {
            if self.store.delete_archive_job(token)? {
                removed.archive_jobs += 1;
            }
        }
        tracing::info!(
            cache_jobs = removed.cache_jobs,
            archive_jobs = removed.archive_jobs,
            "removed orphaned records"
        );
        Ok(removed)
    }

    /// Run one reconciliation pass now.
    pub fn reconcile(&self) -> Result<ReconcileReport, EngineError> {
        Ok(reconcile(&self.store, &self.config, now_epoch_seconds())?)
    }
}
