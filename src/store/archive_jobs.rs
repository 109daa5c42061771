use super::{CANCELLED_MESSAGE, JobStore, StoreError, TIMED_OUT_MESSAGE, now_epoch_seconds};
use crate::types::{ArchiveJob, JobStatus};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, Transaction, TransactionBehavior, params};
use serde::Serialize;
use std::path::Path;

const ARCHIVE_COLUMNS: &str = "token, source_key, source_paths, status, total_files, \
     processed_files, current_file, result_path, error_message, created_at, started_at, completed_at";

/// Outcome of [`JobStore::enqueue_archive_job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveEnqueue {
    #[serde(rename = "job_token")]
    pub token: String,
    /// False when an existing live job for the same path set was reused.
    pub created: bool,
}

fn archive_job_from_row(row: &Row<'_>) -> rusqlite::Result<ArchiveJob> {
    let paths_json: String = row.get(2)?;
    let source_paths: Vec<String> = serde_json::from_str(&paths_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let total: i64 = row.get(4)?;
    let processed: i64 = row.get(5)?;
    Ok(ArchiveJob {
        token: row.get(0)?,
        source_key: row.get(1)?,
        source_paths,
        status: row.get(3)?,
        total_files: total.max(0) as u64,
        processed_files: processed.max(0) as u64,
        current_file: row.get(6)?,
        result_path: row.get(7)?,
        error_message: row.get(8)?,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

impl JobStore {
    /// Create a pending archive job for `paths`, or return the live job that
    /// already covers the same path set.
    ///
    /// A completed job whose archive file has disappeared is not reused; its
    /// row is dropped and a fresh job takes its place.
    pub fn enqueue_archive_job(
        &self,
        source_key: &str,
        paths: &[String],
        digest: &str,
    ) -> Result<ArchiveEnqueue, StoreError> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let existing: Option<(String, JobStatus, Option<String>)> = tx
            .query_row(
                "SELECT token, status, result_path FROM archive_jobs
                 WHERE paths_digest = ?1 AND status IN ('pending', 'processing', 'completed')",
                params![digest],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        if let Some((token, status, result_path)) = existing {
            let reusable = match status {
                JobStatus::Completed => result_path.is_some_and(|p| Path::new(&p).is_file()),
                _ => true,
            };
            if reusable {
                tx.commit()?;
                return Ok(ArchiveEnqueue {
                    token,
                    created: false,
                });
            }
            tracing::debug!(token = %token, "archive file missing, replacing job");
            tx.execute("DELETE FROM archive_jobs WHERE token = ?1", params![token])?;
        }

        let token = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO archive_jobs (token, source_key, paths_digest, source_paths, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                token,
                source_key,
                digest,
                serde_json::to_string(paths)?,
                now_epoch_seconds()
            ],
        )?;
        tx.commit()?;
        Ok(ArchiveEnqueue {
            token,
            created: true,
        })
    }

    pub fn try_claim_archive_job(&self, token: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE archive_jobs SET status = 'processing', started_at = ?2
             WHERE token = ?1 AND status = 'pending'",
            params![token, now_epoch_seconds()],
        )?;
        Ok(changed == 1)
    }

    /// Claim the oldest pending archive job.
    pub fn claim_next_archive_job(&self) -> Result<Option<ArchiveJob>, StoreError> {
        loop {
            let next: Option<String> = self
                .conn
                .query_row(
                    "SELECT token FROM archive_jobs WHERE status = 'pending'
                     ORDER BY created_at, rowid LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(token) = next else {
                return Ok(None);
            };
            if self.try_claim_archive_job(&token)? {
                match self.get_archive_job(&token)? {
                    Some(job) => return Ok(Some(job)),
                    // cancelled and cleared before the re-read
                    None => {
                        tracing::debug!(token = %token, "claimed archive job vanished");
                        continue;
                    }
                }
            }
            tracing::trace!(token = %token, "lost archive claim race");
        }
    }

    /// Record the planned entry count. Resets progress to zero.
    pub fn set_archive_total(&self, token: &str, total: u64) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE archive_jobs SET total_files = ?2, processed_files = 0, current_file = NULL
             WHERE token = ?1 AND status = 'processing'",
            params![token, total as i64],
        )?;
        Ok(changed == 1)
    }

    /// Publish progress. The stored count never decreases and never passes
    /// `total_files`.
    ///
    /// Returns false once the job is no longer `processing`: the caller has
    /// lost the job and must stop writing.
    pub fn update_archive_progress(
        &self,
        token: &str,
        processed: u64,
        current_file: &str,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE archive_jobs
             SET processed_files = MIN(MAX(processed_files, ?2), total_files), current_file = ?3
             WHERE token = ?1 AND status = 'processing'",
            params![token, processed as i64, current_file],
        )?;
        Ok(changed == 1)
    }

    pub fn complete_archive_job(&self, token: &str, result_path: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE archive_jobs
             SET status = 'completed', result_path = ?2, processed_files = total_files,
                 current_file = NULL, completed_at = ?3
             WHERE token = ?1 AND status = 'processing'",
            params![token, result_path, now_epoch_seconds()],
        )?;
        Ok(changed == 1)
    }

    pub fn fail_archive_job(&self, token: &str, message: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE archive_jobs
             SET status = 'failed', error_message = ?2, completed_at = ?3
             WHERE token = ?1 AND status = 'processing'",
            params![token, message, now_epoch_seconds()],
        )?;
        Ok(changed == 1)
    }

    pub fn get_archive_job(&self, token: &str) -> Result<Option<ArchiveJob>, StoreError> {
        let sql = format!("SELECT {ARCHIVE_COLUMNS} FROM archive_jobs WHERE token = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![token], archive_job_from_row)
            .optional()?)
    }

    pub fn delete_archive_job(&self, token: &str) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute("DELETE FROM archive_jobs WHERE token = ?1", params![token])?;
        Ok(changed == 1)
    }

    pub(super) fn fail_stale_archive_jobs(&self, stale_before: i64) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "UPDATE archive_jobs
             SET status = 'failed', error_message = ?2, completed_at = ?3
             WHERE status = 'processing' AND started_at < ?1",
            params![stale_before, TIMED_OUT_MESSAGE, now_epoch_seconds()],
        )?)
    }

    /// Fail every pending and processing archive job.
    pub fn cancel_archive_jobs(&self) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "UPDATE archive_jobs
             SET status = 'failed', error_message = ?1, completed_at = ?2
             WHERE status IN ('pending', 'processing')",
            params![CANCELLED_MESSAGE, now_epoch_seconds()],
        )?)
    }

    pub fn clear_failed_archive_jobs(&self) -> Result<usize, StoreError> {
        Ok(self
            .conn
            .execute("DELETE FROM archive_jobs WHERE status = 'failed'", [])?)
    }

    /// Terminal archive jobs that finished before `finished_before`.
    pub fn expired_archive_jobs(&self, finished_before: i64) -> Result<Vec<ArchiveJob>, StoreError> {
        let sql = format!(
            "SELECT {ARCHIVE_COLUMNS} FROM archive_jobs
             WHERE status IN ('completed', 'failed') AND completed_at < ?1
             ORDER BY completed_at"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(params![finished_before], archive_job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// `(token, result_path)` of every completed archive job.
    pub fn archive_results(&self) -> Result<Vec<(String, String)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT token, result_path FROM archive_jobs
             WHERE status = 'completed' ORDER BY created_at, rowid",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
