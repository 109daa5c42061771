//! Durable job store backed by SQLite.
//!
//! The store is the only coordination point between the processes and
//! threads that enqueue work and the workers that execute it. Nothing about
//! a job lives only in memory: after a restart every row can be picked up
//! exactly where it was left.
//!
//! ## Concurrency
//!
//! Each thread opens its own [`JobStore`] on the same file (see
//! [`JobStore::reopen`]). The database runs in WAL mode with a busy timeout,
//! so readers never block and writers queue briefly instead of failing.
//!
//! Every state transition is a single `UPDATE ... WHERE status = <expected>`
//! whose affected-row count decides whether the caller won:
//!
//! | Transition | Guard |
//! |---|---|
//! | claim | `status = 'pending'` |
//! | progress, complete, fail | `status = 'processing'` |
//! | cancel | `status IN ('pending', 'processing')` |
//!
//! A worker whose progress write affects no rows has lost its job (it was
//! cancelled or timed out) and must stop.
//!
//! ## Deduplication
//!
//! Partial unique indexes make the dedup rules a property of the schema:
//! at most one active cache job per `(source, path, size)` and at most one
//! live archive job per path-set digest. Enqueue runs inside an `IMMEDIATE`
//! transaction, so the lookup and the insert cannot interleave with another
//! writer.

mod archive_jobs;
mod cache_jobs;

pub use archive_jobs::ArchiveEnqueue;
pub use cache_jobs::{CacheEnqueue, StatusCounts};

use crate::types::{JobKind, JobStatus};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode archive paths: {0}")]
    Json(#[from] serde_json::Error),
}

/// How long a writer waits for the lock before giving up, unless the
/// caller picks its own with [`JobStore::open_with_busy_timeout`].
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_key TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    target_size INTEGER NOT NULL CHECK (target_size > 0),
    status TEXT NOT NULL
        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    result_message TEXT,
    artifact_path TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS cache_jobs_active_target
    ON cache_jobs (source_key, relative_path, target_size)
    WHERE status IN ('pending', 'processing');
CREATE INDEX IF NOT EXISTS cache_jobs_by_status ON cache_jobs (status, id);
CREATE INDEX IF NOT EXISTS cache_jobs_by_target
    ON cache_jobs (source_key, relative_path, target_size, id);

CREATE TABLE IF NOT EXISTS archive_jobs (
    token TEXT PRIMARY KEY,
    source_key TEXT NOT NULL,
    paths_digest TEXT NOT NULL,
    source_paths TEXT NOT NULL,
    status TEXT NOT NULL
        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    total_files INTEGER NOT NULL DEFAULT 0,
    processed_files INTEGER NOT NULL DEFAULT 0,
    current_file TEXT,
    result_path TEXT,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    CHECK (processed_files >= 0 AND processed_files <= total_files),
    CHECK ((status = 'completed') = (result_path IS NOT NULL))
);
CREATE UNIQUE INDEX IF NOT EXISTS archive_jobs_live_digest
    ON archive_jobs (paths_digest)
    WHERE status IN ('pending', 'processing', 'completed');
CREATE INDEX IF NOT EXISTS archive_jobs_by_status ON archive_jobs (status, created_at);
";

/// Current time as Unix epoch seconds.
pub fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs() as i64
}

/// A connection to the job database.
pub struct JobStore {
    conn: Connection,
    path: PathBuf,
    busy_timeout: Duration,
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore").field("path", &self.path).finish()
    }
}

impl JobStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Like [`open`](Self::open), waiting at most `busy_timeout` for a lock
    /// held by another connection before a call fails with `DatabaseBusy`.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            busy_timeout,
        })
    }

    /// A fresh connection to the same database, for another thread.
    pub fn reopen(&self) -> Result<Self, StoreError> {
        Self::open_with_busy_timeout(&self.path, self.busy_timeout)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fail every `processing` job of either kind that started before
    /// `stale_before`. Returns `(cache, archive)` counts.
    pub fn fail_stale_jobs(&self, stale_before: i64) -> Result<(usize, usize), StoreError> {
        Ok((
            self.fail_stale_cache_jobs(stale_before)?,
            self.fail_stale_archive_jobs(stale_before)?,
        ))
    }

    /// Row counts by status across every job of one kind.
    pub fn job_counts(&self, kind: JobKind) -> Result<StatusCounts, StoreError> {
        let table = match kind {
            JobKind::Cache => "cache_jobs",
            JobKind::Archive => "archive_jobs",
        };
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT status, COUNT(*) FROM {table} GROUP BY status"))?;
        let mut rows = stmt.query([])?;
        let mut counts = StatusCounts::default();
        while let Some(row) = rows.next()? {
            let status: JobStatus = row.get(0)?;
            let count: i64 = row.get(1)?;
            counts.add(status, count.max(0) as usize);
        }
        Ok(counts)
    }
}

/// Message recorded on jobs the staleness sweep gives up on.
pub const TIMED_OUT_MESSAGE: &str = "Timed out: worker stopped responding";

/// Message recorded on jobs stopped by an explicit cancel.
pub const CANCELLED_MESSAGE: &str = "Cancelled by user";
