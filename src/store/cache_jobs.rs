use super::{CANCELLED_MESSAGE, JobStore, StoreError, TIMED_OUT_MESSAGE, now_epoch_seconds};
use crate::types::{CacheJob, JobStatus, TargetSize};
use rusqlite::{OptionalExtension, Row, Transaction, TransactionBehavior, params};
use serde::Serialize;

const CACHE_COLUMNS: &str = "id, source_key, relative_path, target_size, status, result_message, \
     artifact_path, created_at, started_at, completed_at";

/// Outcome of enqueueing one cache target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEnqueue {
    /// A new pending row was created.
    Queued(i64),
    /// An active row for the same target already existed.
    AlreadyQueued(i64),
}

impl CacheEnqueue {
    pub fn id(self) -> i64 {
        match self {
            CacheEnqueue::Queued(id) | CacheEnqueue::AlreadyQueued(id) => id,
        }
    }

    pub fn is_new(self) -> bool {
        matches!(self, CacheEnqueue::Queued(_))
    }
}

/// Row counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub(super) fn add(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

fn cache_job_from_row(row: &Row<'_>) -> rusqlite::Result<CacheJob> {
    let edge: u32 = row.get(3)?;
    Ok(CacheJob {
        id: row.get(0)?,
        source_key: row.get(1)?,
        relative_path: row.get(2)?,
        target_size: TargetSize::new(edge)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(3, i64::from(edge)))?,
        status: row.get(4)?,
        result_message: row.get(5)?,
        artifact_path: row.get(6)?,
        created_at: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

/// Latest row id per `(relative_path, target_size)` under a folder prefix.
/// `?1` source, `?2` normalized folder (`''` = whole source), `?3` optional size.
const LATEST_UNDER_FOLDER: &str = "
    SELECT MAX(id) FROM cache_jobs
    WHERE source_key = ?1
      AND (?2 = '' OR substr(relative_path, 1, length(?2) + 1) = ?2 || '/')
      AND (?3 IS NULL OR target_size = ?3)
    GROUP BY relative_path, target_size";

impl JobStore {
    /// Enqueue one cache target per path, skipping targets that already have
    /// an active job. Runs as one `IMMEDIATE` transaction.
    pub fn enqueue_cache_jobs(
        &self,
        source_key: &str,
        relative_paths: &[String],
        target: TargetSize,
    ) -> Result<Vec<CacheEnqueue>, StoreError> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let now = now_epoch_seconds();
        let mut outcomes = Vec::with_capacity(relative_paths.len());
        {
            let mut find = tx.prepare_cached(
                "SELECT id FROM cache_jobs
                 WHERE source_key = ?1 AND relative_path = ?2 AND target_size = ?3
                   AND status IN ('pending', 'processing')",
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO cache_jobs (source_key, relative_path, target_size, status, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
            )?;
            for path in relative_paths {
                let existing: Option<i64> = find
                    .query_row(params![source_key, path, target.edge()], |row| row.get(0))
                    .optional()?;
                let outcome = match existing {
                    Some(id) => CacheEnqueue::AlreadyQueued(id),
                    None => {
                        insert.execute(params![source_key, path, target.edge(), now])?;
                        CacheEnqueue::Queued(tx.last_insert_rowid())
                    }
                };
                outcomes.push(outcome);
            }
        }
        tx.commit()?;
        Ok(outcomes)
    }

    /// Move one specific job from `pending` to `processing`.
    ///
    /// True only for the single caller whose update hit the row.
    pub fn try_claim_cache_job(&self, id: i64) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE cache_jobs SET status = 'processing', started_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now_epoch_seconds()],
        )?;
        Ok(changed == 1)
    }

    /// Claim the oldest pending cache job, or `None` when the queue is empty.
    ///
    /// A lost race is retried against the next candidate; it is never
    /// reported to the caller.
    pub fn claim_next_cache_job(&self) -> Result<Option<CacheJob>, StoreError> {
        loop {
            let next: Option<i64> = self
                .conn
                .query_row(
                    "SELECT id FROM cache_jobs WHERE status = 'pending' ORDER BY id LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(id) = next else {
                return Ok(None);
            };
            if self.try_claim_cache_job(id)? {
                match self.get_cache_job(id)? {
                    Some(job) => return Ok(Some(job)),
                    // cancelled and cleared before the re-read
                    None => {
                        tracing::debug!(job_id = id, "claimed cache job vanished");
                        continue;
                    }
                }
            }
            tracing::trace!(job_id = id, "lost cache claim race");
        }
    }

    pub fn complete_cache_job(
        &self,
        id: i64,
        message: &str,
        artifact_path: &str,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE cache_jobs
             SET status = 'completed', result_message = ?2, artifact_path = ?3, completed_at = ?4
             WHERE id = ?1 AND status = 'processing'",
            params![id, message, artifact_path, now_epoch_seconds()],
        )?;
        Ok(changed == 1)
    }

    pub fn fail_cache_job(&self, id: i64, message: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE cache_jobs
             SET status = 'failed', result_message = ?2, completed_at = ?3
             WHERE id = ?1 AND status = 'processing'",
            params![id, message, now_epoch_seconds()],
        )?;
        Ok(changed == 1)
    }

    pub fn get_cache_job(&self, id: i64) -> Result<Option<CacheJob>, StoreError> {
        let sql = format!("SELECT {CACHE_COLUMNS} FROM cache_jobs WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id], cache_job_from_row)
            .optional()?)
    }

    /// Most recent row for one target, whatever its status.
    pub fn latest_cache_job(
        &self,
        source_key: &str,
        relative_path: &str,
        target: TargetSize,
    ) -> Result<Option<CacheJob>, StoreError> {
        let sql = format!(
            "SELECT {CACHE_COLUMNS} FROM cache_jobs
             WHERE source_key = ?1 AND relative_path = ?2 AND target_size = ?3
             ORDER BY id DESC LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(
                &sql,
                params![source_key, relative_path, target.edge()],
                cache_job_from_row,
            )
            .optional()?)
    }

    /// Counts by status over the latest row of every target under `folder`
    /// (recursively). A retried target counts once, by its newest row.
    pub fn cache_counts_under(
        &self,
        source_key: &str,
        folder: &str,
        target: Option<TargetSize>,
    ) -> Result<StatusCounts, StoreError> {
        let sql = format!(
            "SELECT status, COUNT(*) FROM cache_jobs
             WHERE id IN ({LATEST_UNDER_FOLDER})
             GROUP BY status"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![source_key, folder, target.map(TargetSize::edge)])?;
        let mut counts = StatusCounts::default();
        while let Some(row) = rows.next()? {
            let status: JobStatus = row.get(0)?;
            let count: i64 = row.get(1)?;
            counts.add(status, count.max(0) as usize);
        }
        Ok(counts)
    }

    /// Distinct sizes ever requested for files under `folder`, ascending.
    pub fn requested_sizes_under(
        &self,
        source_key: &str,
        folder: &str,
    ) -> Result<Vec<TargetSize>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT target_size FROM cache_jobs
             WHERE source_key = ?1
               AND (?2 = '' OR substr(relative_path, 1, length(?2) + 1) = ?2 || '/')
             ORDER BY target_size",
        )?;
        let edges = stmt
            .query_map(params![source_key, folder], |row| row.get::<_, u32>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges.into_iter().filter_map(TargetSize::new).collect())
    }

    pub(super) fn fail_stale_cache_jobs(&self, stale_before: i64) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "UPDATE cache_jobs
             SET status = 'failed', result_message = ?2, completed_at = ?3
             WHERE status = 'processing' AND started_at < ?1",
            params![stale_before, TIMED_OUT_MESSAGE, now_epoch_seconds()],
        )?)
    }

    /// Fail every pending and processing cache job.
    pub fn cancel_cache_jobs(&self) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "UPDATE cache_jobs
             SET status = 'failed', result_message = ?1, completed_at = ?2
             WHERE status IN ('pending', 'processing')",
            params![CANCELLED_MESSAGE, now_epoch_seconds()],
        )?)
    }

    pub fn clear_failed_cache_jobs(&self) -> Result<usize, StoreError> {
        Ok(self
            .conn
            .execute("DELETE FROM cache_jobs WHERE status = 'failed'", [])?)
    }

    /// `(id, artifact_path)` of every row that recorded an artifact.
    pub fn cache_artifacts(&self) -> Result<Vec<(i64, String)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, artifact_path FROM cache_jobs WHERE artifact_path IS NOT NULL ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_cache_jobs(&self, ids: &[i64]) -> Result<usize, StoreError> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let mut removed = 0;
        {
            let mut delete = tx.prepare_cached("DELETE FROM cache_jobs WHERE id = ?1")?;
            for id in ids {
                removed += delete.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, JobStore) {
        let tmp = TempDir::new().unwrap();
        let store = JobStore::open(&tmp.path().join("jobs.db")).unwrap();
        (tmp, store)
    }

    fn size(edge: u32) -> TargetSize {
        TargetSize::new(edge).unwrap()
    }

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn enqueue_one(store: &JobStore, path: &str, edge: u32) -> CacheEnqueue {
        store
            .enqueue_cache_jobs("main", &paths(&[path]), size(edge))
            .unwrap()[0]
    }

    fn status_of(store: &JobStore, id: i64) -> JobStatus {
        store.get_cache_job(id).unwrap().unwrap().status
    }

    // =========================================================================
    // Enqueue / dedup
    // =========================================================================

    #[test]
    fn enqueue_creates_pending_row() {
        let (_tmp, store) = store();
        let outcome = enqueue_one(&store, "albumA/one.jpg", 750);
        assert!(outcome.is_new());
        let job = store.get_cache_job(outcome.id()).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.relative_path, "albumA/one.jpg");
        assert_eq!(job.target_size, size(750));
        assert!(job.started_at.is_none());
    }

    #[test]
    fn enqueue_same_target_while_active_is_merged() {
        let (_tmp, store) = store();
        let first = enqueue_one(&store, "a.jpg", 300);
        let second = enqueue_one(&store, "a.jpg", 300);
        assert_eq!(second, CacheEnqueue::AlreadyQueued(first.id()));

        // still merged while processing
        assert!(store.try_claim_cache_job(first.id()).unwrap());
        let third = enqueue_one(&store, "a.jpg", 300);
        assert_eq!(third, CacheEnqueue::AlreadyQueued(first.id()));
    }

    #[test]
    fn enqueue_other_size_is_a_new_target() {
        let (_tmp, store) = store();
        let a = enqueue_one(&store, "a.jpg", 300);
        let b = enqueue_one(&store, "a.jpg", 1600);
        assert!(a.is_new() && b.is_new());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn enqueue_after_terminal_creates_fresh_row() {
        let (_tmp, store) = store();
        let first = enqueue_one(&store, "a.jpg", 300);
        store.try_claim_cache_job(first.id()).unwrap();
        store.fail_cache_job(first.id(), "boom").unwrap();

        let retry = enqueue_one(&store, "a.jpg", 300);
        assert!(retry.is_new());
        assert_ne!(retry.id(), first.id());
        // the failed row is kept for diagnostics
        assert_eq!(status_of(&store, first.id()), JobStatus::Failed);
    }

    #[test]
    fn duplicate_paths_in_one_batch_create_one_row() {
        let (_tmp, store) = store();
        let outcomes = store
            .enqueue_cache_jobs("main", &paths(&["a.jpg", "a.jpg"]), size(300))
            .unwrap();
        assert!(outcomes[0].is_new());
        assert_eq!(outcomes[1], CacheEnqueue::AlreadyQueued(outcomes[0].id()));
    }

    #[test]
    fn unique_index_rejects_second_active_row() {
        let (_tmp, store) = store();
        enqueue_one(&store, "a.jpg", 300);
        let result = store.conn.execute(
            "INSERT INTO cache_jobs (source_key, relative_path, target_size, status, created_at)
             VALUES ('main', 'a.jpg', 300, 'processing', 0)",
            [],
        );
        assert!(result.is_err());
    }

    // =========================================================================
    // Claim and transitions
    // =========================================================================

    #[test]
    fn claim_takes_oldest_pending_first() {
        let (_tmp, store) = store();
        let a = enqueue_one(&store, "a.jpg", 300);
        let b = enqueue_one(&store, "b.jpg", 300);

        let claimed = store.claim_next_cache_job().unwrap().unwrap();
        assert_eq!(claimed.id, a.id());
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(claimed.started_at.is_some());

        assert_eq!(store.claim_next_cache_job().unwrap().unwrap().id, b.id());
        assert!(store.claim_next_cache_job().unwrap().is_none());
    }

    #[test]
    fn claim_skips_a_row_deleted_right_after_its_claim() {
        let (_tmp, store) = store();
        let doomed = enqueue_one(&store, "doomed.jpg", 300);
        let next = enqueue_one(&store, "next.jpg", 300);
        // stands in for cancel plus clear-failed landing between claim and re-read
        store
            .conn
            .execute_batch(
                "CREATE TEMP TRIGGER drop_on_claim AFTER UPDATE OF status ON cache_jobs
                 WHEN NEW.status = 'processing' AND NEW.relative_path = 'doomed.jpg'
                 BEGIN DELETE FROM cache_jobs WHERE id = NEW.id; END;",
            )
            .unwrap();

        let claimed = store.claim_next_cache_job().unwrap().unwrap();

        assert_eq!(claimed.id, next.id());
        assert!(store.get_cache_job(doomed.id()).unwrap().is_none());
        assert!(store.claim_next_cache_job().unwrap().is_none());
    }

    #[test]
    fn claim_is_exclusive() {
        let (_tmp, store) = store();
        let job = enqueue_one(&store, "a.jpg", 300);
        assert!(store.try_claim_cache_job(job.id()).unwrap());
        assert!(!store.try_claim_cache_job(job.id()).unwrap());
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let (_tmp, store) = store();
        let id = enqueue_one(&store, "a.jpg", 300).id();

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let conn = store.reopen().unwrap();
                    scope.spawn(move || conn.try_claim_cache_job(id).unwrap())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap() as usize)
                .sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn transitions_require_processing() {
        let (_tmp, store) = store();
        let id = enqueue_one(&store, "a.jpg", 300).id();

        // pending: cannot complete or fail
        assert!(!store.complete_cache_job(id, "ok", "/x.jpg").unwrap());
        assert!(!store.fail_cache_job(id, "no").unwrap());

        store.try_claim_cache_job(id).unwrap();
        assert_eq!(
            store.get_cache_job(id).unwrap().unwrap().status,
            JobStatus::Processing
        );
        assert!(store.complete_cache_job(id, "ok", "/x.jpg").unwrap());

        // terminal: no further transitions
        assert!(!store.fail_cache_job(id, "late").unwrap());
        assert!(!store.try_claim_cache_job(id).unwrap());
        let job = store.get_cache_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.artifact_path.as_deref(), Some("/x.jpg"));
        assert!(job.completed_at.is_some());
    }

    // =========================================================================
    // Reconciliation, cancel, cleanup
    // =========================================================================

    #[test]
    fn stale_processing_jobs_fail() {
        let (_tmp, store) = store();
        let old = enqueue_one(&store, "old.jpg", 300).id();
        let fresh = enqueue_one(&store, "fresh.jpg", 300).id();
        store.try_claim_cache_job(old).unwrap();
        store.try_claim_cache_job(fresh).unwrap();
        store
            .conn
            .execute("UPDATE cache_jobs SET started_at = 10 WHERE id = ?1", [old])
            .unwrap();

        let changed = store.fail_stale_cache_jobs(50).unwrap();

        assert_eq!(changed, 1);
        let job = store.get_cache_job(old).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.result_message.as_deref(), Some(TIMED_OUT_MESSAGE));
        assert_eq!(status_of(&store, fresh), JobStatus::Processing);
    }

    #[test]
    fn cancel_fails_pending_and_processing_only() {
        let (_tmp, store) = store();
        let pending = enqueue_one(&store, "p.jpg", 300).id();
        let processing = enqueue_one(&store, "r.jpg", 300).id();
        let done = enqueue_one(&store, "d.jpg", 300).id();
        store.try_claim_cache_job(processing).unwrap();
        store.try_claim_cache_job(done).unwrap();
        store.complete_cache_job(done, "ok", "/d.jpg").unwrap();

        assert_eq!(store.cancel_cache_jobs().unwrap(), 2);
        assert_eq!(status_of(&store, pending), JobStatus::Failed);
        assert_eq!(status_of(&store, processing), JobStatus::Failed);
        assert_eq!(status_of(&store, done), JobStatus::Completed);
        // the cancelled worker can no longer finish its job
        assert!(!store.complete_cache_job(processing, "ok", "/r.jpg").unwrap());
    }

    #[test]
    fn clear_failed_deletes_only_failed() {
        let (_tmp, store) = store();
        let failed = enqueue_one(&store, "f.jpg", 300).id();
        let pending = enqueue_one(&store, "p.jpg", 300).id();
        store.try_claim_cache_job(failed).unwrap();
        store.fail_cache_job(failed, "x").unwrap();

        assert_eq!(store.clear_failed_cache_jobs().unwrap(), 1);
        assert!(store.get_cache_job(failed).unwrap().is_none());
        assert!(store.get_cache_job(pending).unwrap().is_some());
    }

    #[test]
    fn delete_by_ids() {
        let (_tmp, store) = store();
        let a = enqueue_one(&store, "a.jpg", 300).id();
        let b = enqueue_one(&store, "b.jpg", 300).id();
        assert_eq!(store.delete_cache_jobs(&[a, 999]).unwrap(), 1);
        assert!(store.get_cache_job(a).unwrap().is_none());
        assert!(store.get_cache_job(b).unwrap().is_some());
    }

    // =========================================================================
    // Folder aggregation
    // =========================================================================

    #[test]
    fn counts_use_latest_row_per_target() {
        let (_tmp, store) = store();
        let first = enqueue_one(&store, "albumA/a.jpg", 300).id();
        store.try_claim_cache_job(first).unwrap();
        store.fail_cache_job(first, "boom").unwrap();
        let retry = enqueue_one(&store, "albumA/a.jpg", 300).id();
        store.try_claim_cache_job(retry).unwrap();
        store.complete_cache_job(retry, "ok", "/a.jpg").unwrap();
        enqueue_one(&store, "albumA/b.jpg", 300);

        let counts = store.cache_counts_under("main", "albumA", None).unwrap();
        assert_eq!(
            counts,
            StatusCounts {
                pending: 1,
                processing: 0,
                completed: 1,
                failed: 0,
            }
        );
    }

    #[test]
    fn folder_prefix_does_not_match_sibling_names() {
        let (_tmp, store) = store();
        enqueue_one(&store, "albumA/a.jpg", 300);
        enqueue_one(&store, "albumA/nested/b.jpg", 300);
        enqueue_one(&store, "albumAB/c.jpg", 300);
        enqueue_one(&store, "top.jpg", 300);

        assert_eq!(store.cache_counts_under("main", "albumA", None).unwrap().total(), 2);
        assert_eq!(store.cache_counts_under("main", "", None).unwrap().total(), 4);
        assert_eq!(store.cache_counts_under("other", "", None).unwrap().total(), 0);
    }

    #[test]
    fn counts_filter_by_size() {
        let (_tmp, store) = store();
        enqueue_one(&store, "a.jpg", 300);
        enqueue_one(&store, "a.jpg", 1600);
        assert_eq!(store.cache_counts_under("main", "", None).unwrap().total(), 2);
        assert_eq!(
            store
                .cache_counts_under("main", "", Some(size(300)))
                .unwrap()
                .total(),
            1
        );
    }

    #[test]
    fn requested_sizes_are_distinct_per_folder() {
        let (_tmp, store) = store();
        enqueue_one(&store, "albumA/a.jpg", 1600);
        enqueue_one(&store, "albumA/b.jpg", 300);
        enqueue_one(&store, "albumA/a.jpg", 300);
        enqueue_one(&store, "albumB/c.jpg", 750);
        assert_eq!(
            store.requested_sizes_under("main", "albumA").unwrap(),
            vec![size(300), size(1600)]
        );
        assert_eq!(store.requested_sizes_under("main", "").unwrap().len(), 3);
        assert!(store.requested_sizes_under("main", "albumC").unwrap().is_empty());
    }

    #[test]
    fn latest_job_for_target() {
        let (_tmp, store) = store();
        assert!(store.latest_cache_job("main", "a.jpg", size(300)).unwrap().is_none());
        let first = enqueue_one(&store, "a.jpg", 300).id();
        store.try_claim_cache_job(first).unwrap();
        store.fail_cache_job(first, "x").unwrap();
        let second = enqueue_one(&store, "a.jpg", 300).id();
        let latest = store.latest_cache_job("main", "a.jpg", size(300)).unwrap().unwrap();
        assert_eq!(latest.id, second);
    }
}
