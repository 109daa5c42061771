//! Background workers.
//!
//! A [`WorkerPool`] owns a dedicated rayon thread pool. Each thread opens its
//! own connection to the job store and runs the same loop:
//!
//! 1. claim the oldest pending archive job, else the oldest pending cache job
//! 2. produce the artifact
//! 3. write the terminal state, guarded on the row still being `processing`
//!
//! Nothing about a job is kept between iterations; every decision is made
//! from the row the claim returned. A job cancelled or timed out while its
//! artifact was being produced simply loses the final write: the guarded
//! `UPDATE` affects no rows and the result is discarded.
//!
//! ## Reconciliation
//!
//! [`reconcile`] is the self-healing pass. It fails `processing` jobs whose
//! `started_at` is older than `workers.stale_timeout_secs` (their worker
//! crashed) and purges terminal archive jobs, with their files, once
//! `archives.retention_secs` has passed. The pool runs it once before
//! claiming anything and then every `workers.reconcile_interval_secs`.
//!
//! ## Store errors
//!
//! Several processes share one database, so a call can fail with
//! `database is locked` once `workers.busy_timeout_ms` runs out. A serving
//! worker logs the error, sleeps one poll interval and carries on; a job it
//! held at that moment stays `processing` until reconciliation times it
//! out. A draining worker gives up after [`DRAIN_STORE_RETRIES`] errors in
//! a row.
//!
//! ## Progress events
//!
//! An optional channel receives a [`WorkerEvent`] per finished job so a CLI
//! can print progress while the pool runs (see `output::format_worker_event`).

use crate::archive::{ArchiveEntry, ArchiveError, partial_path, plan_entries, write_archive};
use crate::cache::{archive_path, cache_path, is_fresh};
use crate::config::{EngineConfig, effective_workers};
use crate::imaging::{BackendError, ImageBackend, Quality, SourceFormat, create_preview};
use crate::paths::{PathError, PathResolver};
use crate::store::{JobStore, StoreError, now_epoch_seconds};
use crate::types::{ArchiveJob, CacheJob, TargetSize};
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::Instant;
use thiserror::Error;

/// Consecutive store errors a draining worker tolerates before it stops.
pub const DRAIN_STORE_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Failed to start worker threads: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Why a single job failed. Rendered into the job row.
#[derive(Error, Debug)]
enum JobError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("{path}: {source}")]
    Backend {
        path: String,
        #[source]
        source: BackendError,
    },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("Job is no longer active")]
    Lost,
}

/// Emitted once per finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    CacheCompleted {
        id: i64,
        source_key: String,
        relative_path: String,
        target: TargetSize,
        /// True when an up-to-date artifact already existed.
        cached: bool,
    },
    CacheFailed {
        id: i64,
        message: String,
    },
    ArchiveCompleted {
        token: String,
        entries: u64,
        bytes: u64,
    },
    ArchiveFailed {
        token: String,
        message: String,
    },
    Reconciled(ReconcileReport),
}

/// Totals over one pool run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Jobs that reached `completed`, including cache hits.
    pub completed: usize,
    /// Completed cache jobs that reused an existing artifact.
    pub cached: usize,
    pub failed: usize,
}

impl RunStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Cached => {
                self.completed += 1;
                self.cached += 1;
            }
            Outcome::Failed => self.failed += 1,
            Outcome::Lost => {}
        }
    }

    fn merge(self, other: RunStats) -> RunStats {
        RunStats {
            completed: self.completed + other.completed,
            cached: self.cached + other.cached,
            failed: self.failed + other.failed,
        }
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed ({} already cached), {} failed",
            self.completed, self.cached, self.failed
        )
    }
}

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub stale_cache_jobs: usize,
    pub stale_archive_jobs: usize,
    pub expired_archives: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Final state a worker left a job in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Cached,
    Failed,
    /// The job was cancelled or timed out before the worker finished.
    Lost,
}

/// Fail stale `processing` jobs and purge expired archives, as of `now`
/// (epoch seconds).
pub fn reconcile(
    store: &JobStore,
    config: &EngineConfig,
    now: i64,
) -> Result<ReconcileReport, StoreError> {
    let stale_before = now.saturating_sub(config.workers.stale_timeout().as_secs() as i64);
    let (stale_cache_jobs, stale_archive_jobs) = store.fail_stale_jobs(stale_before)?;

    let retention_cutoff = now.saturating_sub(config.archives.retention().as_secs() as i64);
    let mut expired_archives = 0;
    for job in store.expired_archive_jobs(retention_cutoff)? {
        let destination = archive_path(&config.archive_dir, &job.token);
        let files = job
            .result_path
            .iter()
            .map(PathBuf::from)
            .chain([partial_path(&destination), destination]);
        for file in files {
            remove_if_exists(&file);
        }
        if store.delete_archive_job(&job.token)? {
            expired_archives += 1;
        }
    }

    let report = ReconcileReport {
        stale_cache_jobs,
        stale_archive_jobs,
        expired_archives,
    };
    if !report.is_empty() {
        tracing::info!(
            stale_cache_jobs,
            stale_archive_jobs,
            expired_archives,
            "reconciled job store"
        );
    }
    Ok(report)
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove file"),
    }
}

/// A set of worker threads sharing one job store.
pub struct WorkerPool<B: ImageBackend> {
    config: EngineConfig,
    resolver: PathResolver,
    backend: B,
    database: PathBuf,
    threads: usize,
    pool: rayon::ThreadPool,
    events: Option<Sender<WorkerEvent>>,
}

impl<B: ImageBackend> WorkerPool<B> {
    /// Size the pool from `workers.max_workers`. No thread touches the store
    /// until a run starts.
    pub fn new(config: EngineConfig, resolver: PathResolver, backend: B) -> Result<Self, WorkerError> {
        let threads = effective_workers(&config.workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("proofsheet-worker-{i}"))
            .build()?;
        Ok(Self {
            database: config.database.clone(),
            config,
            resolver,
            backend,
            threads,
            pool,
            events: None,
        })
    }

    /// Send a [`WorkerEvent`] for every finished job to `events`.
    pub fn with_events(mut self, events: Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Reconcile once, then process jobs until none are pending.
    ///
    /// Fails once a worker has hit [`DRAIN_STORE_RETRIES`] consecutive
    /// store errors.
    pub fn run_until_idle(&self) -> Result<RunStats, WorkerError> {
        let stores = self.open_stores()?;
        self.startup_reconcile(&stores);
        self.run_workers(stores, |worker| worker.drain())
    }

    /// Process jobs until `shutdown` is set, polling for new work every
    /// `workers.poll_interval_ms` and reconciling every
    /// `workers.reconcile_interval_secs`.
    ///
    /// Store errors inside the loop are logged and retried; only failing
    /// to open the store connections ends the run early.
    pub fn run(&self, shutdown: &AtomicBool) -> Result<RunStats, WorkerError> {
        let stores = self.open_stores()?;
        self.startup_reconcile(&stores);
        tracing::info!(threads = self.threads, "workers started");
        let stats = self.run_workers(stores, |worker| Ok(worker.serve(shutdown)))?;
        tracing::info!(%stats, "workers stopped");
        Ok(stats)
    }

    /// One connection per thread, opened up front so a bad database fails
    /// the run before any job is claimed.
    fn open_stores(&self) -> Result<Vec<JobStore>, StoreError> {
        let busy_timeout = self.config.workers.busy_timeout();
        (0..self.threads)
            .map(|_| JobStore::open_with_busy_timeout(&self.database, busy_timeout))
            .collect()
    }

    fn startup_reconcile(&self, stores: &[JobStore]) {
        let Some(store) = stores.first() else {
            return;
        };
        if let Err(e) = self.reconcile_now(store) {
            tracing::warn!(error = %e, "startup reconcile failed, continuing");
        }
    }

    fn run_workers<F>(&self, stores: Vec<JobStore>, body: F) -> Result<RunStats, WorkerError>
    where
        F: Fn(&Worker<'_, B>) -> Result<RunStats, StoreError> + Sync,
    {
        let per_thread = self.pool.install(|| {
            stores
                .into_par_iter()
                .enumerate()
                .map(|(index, store)| {
                    body(&Worker {
                        index,
                        pool: self,
                        store,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()
        })?;
        Ok(per_thread
            .into_iter()
            .fold(RunStats::default(), RunStats::merge))
    }

    fn reconcile_now(&self, store: &JobStore) -> Result<ReconcileReport, StoreError> {
        let report = reconcile(store, &self.config, now_epoch_seconds())?;
        if !report.is_empty() {
            self.emit(WorkerEvent::Reconciled(report));
        }
        Ok(report)
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(events) = &self.events {
            // a dropped receiver only means nobody is listening
            let _ = events.send(event);
        }
    }
}

/// One worker thread: a pool reference plus its own store connection.
struct Worker<'a, B: ImageBackend> {
    index: usize,
    pool: &'a WorkerPool<B>,
    store: JobStore,
}

impl<B: ImageBackend> Worker<'_, B> {
    fn drain(&self) -> Result<RunStats, StoreError> {
        let poll = self.pool.config.workers.poll_interval();
        let mut stats = RunStats::default();
        let mut failures = 0;
        loop {
            match self.step() {
                Ok(Some(outcome)) => {
                    failures = 0;
                    stats.record(outcome);
                }
                Ok(None) => return Ok(stats),
                Err(e) if failures < DRAIN_STORE_RETRIES => {
                    failures += 1;
                    tracing::warn!(worker = self.index, attempt = failures, error = %e, "store error, retrying");
                    std::thread::sleep(poll);
                }
                Err(e) => {
                    tracing::error!(worker = self.index, error = %e, "store keeps failing, worker stopping");
                    return Err(e);
                }
            }
        }
    }

    fn serve(&self, shutdown: &AtomicBool) -> RunStats {
        let interval = self.pool.config.workers.reconcile_interval();
        let poll = self.pool.config.workers.poll_interval();
        let mut last_reconcile = Instant::now();
        let mut stats = RunStats::default();

        while !shutdown.load(Ordering::Relaxed) {
            // one thread is enough to keep the store healthy
            if self.index == 0 && last_reconcile.elapsed() >= interval {
                if let Err(e) = self.pool.reconcile_now(&self.store) {
                    tracing::warn!(worker = self.index, error = %e, "reconcile failed, retrying next interval");
                }
                last_reconcile = Instant::now();
            }
            match self.step() {
                Ok(Some(outcome)) => stats.record(outcome),
                Ok(None) => std::thread::sleep(poll),
                Err(e) => {
                    tracing::warn!(worker = self.index, error = %e, "store error, backing off");
                    std::thread::sleep(poll);
                }
            }
        }
        stats
    }

    /// Claim and run one job. `None` when both queues are empty.
    fn step(&self) -> Result<Option<Outcome>, StoreError> {
        if let Some(job) = self.store.claim_next_archive_job()? {
            return self.run_archive(job).map(Some);
        }
        if let Some(job) = self.store.claim_next_cache_job()? {
            return self.run_cache(job).map(Some);
        }
        Ok(None)
    }

    // =========================================================================
    // Cache jobs
    // =========================================================================

    fn run_cache(&self, job: CacheJob) -> Result<Outcome, StoreError> {
        let span = tracing::info_span!(
            "cache_job",
            job_id = job.id,
            source = %job.source_key,
            path = %job.relative_path,
            size = job.target_size.edge()
        );
        let _enter = span.enter();
        tracing::debug!("claimed");

        match self.build_preview(&job) {
            Ok(preview) => {
                let artifact = preview.artifact.to_string_lossy();
                if !self
                    .store
                    .complete_cache_job(job.id, &preview.message, &artifact)?
                {
                    tracing::warn!("job no longer processing, result discarded");
                    return Ok(Outcome::Lost);
                }
                tracing::info!(cached = preview.cached, "{}", preview.message);
                self.pool.emit(WorkerEvent::CacheCompleted {
                    id: job.id,
                    source_key: job.source_key,
                    relative_path: job.relative_path,
                    target: job.target_size,
                    cached: preview.cached,
                });
                Ok(if preview.cached {
                    Outcome::Cached
                } else {
                    Outcome::Completed
                })
            }
            Err(e) => {
                let message = e.to_string();
                if !self.store.fail_cache_job(job.id, &message)? {
                    tracing::warn!(error = %message, "job no longer processing");
                    return Ok(Outcome::Lost);
                }
                tracing::warn!(error = %message, "cache job failed");
                self.pool.emit(WorkerEvent::CacheFailed {
                    id: job.id,
                    message,
                });
                Ok(Outcome::Failed)
            }
        }
    }

    fn build_preview(&self, job: &CacheJob) -> Result<BuiltPreview, JobError> {
        let config = &self.pool.config;
        let resolved = self
            .pool
            .resolver
            .resolve_file(&job.source_key, &job.relative_path)?;
        let artifact = cache_path(
            &config.cache_dir,
            &job.source_key,
            &resolved.relative_path,
            job.target_size,
        );

        if is_fresh(&artifact, &resolved.absolute_path) {
            return Ok(BuiltPreview {
                artifact,
                message: "Already cached".to_string(),
                cached: true,
            });
        }

        let format = if config.images.is_raw(Path::new(&resolved.relative_path)) {
            SourceFormat::Raw
        } else {
            SourceFormat::Raster
        };
        let preview = create_preview(
            &self.pool.backend,
            &resolved.absolute_path,
            format,
            &artifact,
            job.target_size,
            Quality::new(config.images.quality),
        )
        .map_err(|source| JobError::Backend {
            path: resolved.relative_path.clone(),
            source,
        })?;
        tracing::debug!(
            width = preview.width,
            height = preview.height,
            downscaled = preview.downscaled,
            "preview written"
        );

        Ok(BuiltPreview {
            artifact,
            message: format!("Cached at {}x{}", preview.width, preview.height),
            cached: false,
        })
    }

    // =========================================================================
    // Archive jobs
    // =========================================================================

    fn run_archive(&self, job: ArchiveJob) -> Result<Outcome, StoreError> {
        let span = tracing::info_span!(
            "archive_job",
            token = %job.token,
            source = %job.source_key
        );
        let _enter = span.enter();
        tracing::debug!(paths = job.source_paths.len(), "claimed");

        let destination = archive_path(&self.pool.config.archive_dir, &job.token);
        let built = self
            .plan_archive(&job)
            .and_then(|entries| self.write_planned_archive(&job, &entries, &destination));
        self.finish_archive(job, &destination, built)
    }

    /// Write the terminal state for an archive job from the build result.
    fn finish_archive(
        &self,
        job: ArchiveJob,
        destination: &Path,
        built: Result<(u64, u64), JobError>,
    ) -> Result<Outcome, StoreError> {
        match built {
            Ok((entries, bytes)) => {
                let result = destination.to_string_lossy();
                if !self.store.complete_archive_job(&job.token, &result)? {
                    tracing::warn!("job no longer processing, archive discarded");
                    remove_if_exists(destination);
                    return Ok(Outcome::Lost);
                }
                tracing::info!(entries, bytes, "archive ready");
                self.pool.emit(WorkerEvent::ArchiveCompleted {
                    token: job.token,
                    entries,
                    bytes,
                });
                Ok(Outcome::Completed)
            }
            Err(e) => {
                let message = e.to_string();
                if !self.store.fail_archive_job(&job.token, &message)? {
                    tracing::info!(reason = %message, "archive stopped");
                    return Ok(Outcome::Lost);
                }
                tracing::warn!(error = %message, "archive job failed");
                self.pool.emit(WorkerEvent::ArchiveFailed {
                    token: job.token,
                    message,
                });
                Ok(Outcome::Failed)
            }
        }
    }

    /// Expand the requested paths and publish the entry count.
    fn plan_archive(&self, job: &ArchiveJob) -> Result<Vec<ArchiveEntry>, JobError> {
        let entries = plan_entries(&self.pool.resolver, &job.source_key, &job.source_paths)?;
        if !self
            .store
            .set_archive_total(&job.token, entries.len() as u64)
            .map_err(|e| ArchiveError::Aborted(e.to_string()))?
        {
            return Err(JobError::Lost);
        }
        Ok(entries)
    }

    /// Stream `entries` into the archive, publishing progress per entry.
    /// Returns `(entries, bytes)`.
    fn write_planned_archive(
        &self,
        job: &ArchiveJob,
        entries: &[ArchiveEntry],
        destination: &Path,
    ) -> Result<(u64, u64), JobError> {
        let summary = write_archive(entries, destination, |progress| {
            match self
                .store
                .update_archive_progress(&job.token, progress.processed, progress.current)
            {
                Ok(true) => Ok(()),
                Ok(false) => Err(ArchiveError::Aborted("Job is no longer active".to_string())),
                Err(e) => Err(ArchiveError::Aborted(e.to_string())),
            }
        })?;
        Ok((summary.entries, summary.bytes))
    }
}

struct BuiltPreview {
    artifact: PathBuf,
    message: String,
    cached: bool,
}
