//! Shared job model types.
//!
//! These are the snapshots the [`store`](crate::store) hands out and the
//! [`status`](crate::status) API serializes for pollers. Callers never get a
//! handle into the store itself, only these values.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state shared by every job kind.
///
/// Transitions only ever go `pending → processing → {completed | failed}`
/// (or straight from `pending` to `failed` on cancellation). A retry is a new
/// row, never a reset of a terminal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|err: String| FromSqlError::Other(err.into()))
    }
}

/// The closed set of job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Resized preview of one source file.
    Cache,
    /// ZIP archive of a set of source paths.
    Archive,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Cache => f.write_str("cache"),
            JobKind::Archive => f.write_str("archive"),
        }
    }
}

/// Longer-edge length of a derived preview, in pixels. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetSize(u32);

impl TargetSize {
    pub fn new(edge: u32) -> Option<Self> {
        (edge > 0).then_some(Self(edge))
    }

    pub fn edge(self) -> u32 {
        self.0
    }

    /// Parse a request value: either a positive integer (`"750"`) or the name
    /// of a configured variant (`"thumb"`).
    pub fn parse(input: &str, variants: &BTreeMap<String, u32>) -> Option<Self> {
        let input = input.trim();
        match input.parse::<u32>() {
            Ok(edge) => Self::new(edge),
            Err(_) => variants.get(input).copied().and_then(Self::new),
        }
    }
}

impl fmt::Display for TargetSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}px", self.0)
    }
}

/// One unit of preview work for one `(source, file, size)` target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheJob {
    pub id: i64,
    pub source_key: String,
    pub relative_path: String,
    pub target_size: TargetSize,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

/// One ZIP-building task.
///
/// `processed_files <= total_files` always holds, and `result_path` is set
/// exactly when `status` is [`JobStatus::Completed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveJob {
    pub token: String,
    pub source_key: String,
    pub source_paths: Vec<String>,
    pub status: JobStatus,
    pub total_files: u64,
    pub processed_files: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl ArchiveJob {
    /// Completed fraction in `[0, 1]`; zero until the file list is known.
    pub fn progress(&self) -> f64 {
        if self.total_files == 0 {
            return if self.status == JobStatus::Completed { 1.0 } else { 0.0 };
        }
        self.processed_files as f64 / self.total_files as f64
    }
}

/// Cache job counts under one folder, by state. Derived, never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FolderCacheAggregate {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_eligible_files: usize,
    /// Denominator for progress: eligible files times the sizes covered
    /// (the one requested, or every size ever requested under the folder).
    pub total_targets: usize,
}

impl FolderCacheAggregate {
    pub fn active(&self) -> usize {
        self.pending + self.processing
    }

    pub fn is_settled(&self) -> bool {
        self.active() == 0
    }
}

impl fmt::Display for FolderCacheAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} completed, {} failed, {} processing, {} pending of {} targets ({} eligible files)",
            self.completed,
            self.failed,
            self.processing,
            self.pending,
            self.total_targets,
            self.total_eligible_files
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn target_size_rejects_zero() {
        assert_eq!(TargetSize::new(0), None);
        assert_eq!(TargetSize::new(750).map(TargetSize::edge), Some(750));
    }

    #[test]
    fn target_size_parses_numbers_and_variants() {
        let variants = BTreeMap::from([("thumb".to_string(), 300)]);
        assert_eq!(TargetSize::parse("750", &variants), TargetSize::new(750));
        assert_eq!(TargetSize::parse(" thumb ", &variants), TargetSize::new(300));
        assert_eq!(TargetSize::parse("0", &variants), None);
        assert_eq!(TargetSize::parse("-5", &variants), None);
        assert_eq!(TargetSize::parse("huge", &variants), None);
    }

    #[test]
    fn archive_progress_fraction() {
        let mut job = ArchiveJob {
            token: "t".into(),
            source_key: "main".into(),
            source_paths: vec![],
            status: JobStatus::Processing,
            total_files: 4,
            processed_files: 1,
            current_file: None,
            result_path: None,
            error_message: None,
            created_at: 0,
            started_at: None,
            completed_at: None,
        };
        assert_eq!(job.progress(), 0.25);
        job.total_files = 0;
        assert_eq!(job.progress(), 0.0);
        job.status = JobStatus::Completed;
        assert_eq!(job.progress(), 1.0);
    }

    #[test]
    fn aggregate_display() {
        let agg = FolderCacheAggregate {
            pending: 1,
            processing: 2,
            completed: 3,
            failed: 4,
            total_eligible_files: 10,
            total_targets: 20,
        };
        assert_eq!(
            agg.to_string(),
            "3 completed, 4 failed, 2 processing, 1 pending of 20 targets (10 eligible files)"
        );
        assert!(!agg.is_settled());
    }
}
