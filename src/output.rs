//! CLI output formatting.
//!
//! # Information-First Display
//!
//! Every report leads with what the caller asked about (a folder, a file, an
//! archive token) and its state; counts and messages follow as indented
//! context lines. Absolute paths are never shown, only source keys and
//! source-relative paths.
//!
//! # Output Format
//!
//! ## Enqueue
//!
//! ```text
//! main:albumA @ 750px: queued
//!     3 new jobs, 1 already queued
//! ```
//!
//! ## Cache status
//!
//! ```text
//! main:albumA
//!     12 eligible files, 24 targets
//!     completed  9
//!     failed     1
//!     processing 1
//!     pending    1
//!     albumA/IMG_1.CR2: completed (cached)
//!     albumA/IMG_2.CR2: failed: albumA/IMG_2.CR2: No embedded preview found in RAW file
//! ```
//!
//! ## Archive status
//!
//! ```text
//! Archive 0b6f…: processing 3/10 (30%)
//!     Current: albumA/IMG_4.jpg
//! ```
//!
//! ## Worker events
//!
//! ```text
//! main:albumA/IMG_1.jpg @ 300px: encoded
//! main:albumA/IMG_2.jpg @ 300px: cached
//! Job 17 failed: albumA/broken.jpg: Failed to decode image: …
//! ```
//!
//! # Architecture
//!
//! Each report has a `format_*` function (returns `Vec<String>`) for
//! testability; [`print_lines`] writes them to stdout. Format functions are
//! pure — no I/O, no side effects.

use crate::dispatch::{CacheEnqueueReport, EnqueueStatus};
use crate::engine::{CancelReport, RemovedRows};
use crate::paths::normalize_relative;
use crate::status::{ArchiveDownload, CacheStatusReport, FileCacheStatus};
use crate::store::{ArchiveEnqueue, StatusCounts};
use crate::types::{ArchiveJob, JobKind, JobStatus, TargetSize};
use crate::worker::{ReconcileReport, RunStats, WorkerEvent};

// ============================================================================
// Shared helpers
// ============================================================================

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// `source:path`, with the source root shown as `source:/`.
fn location(source_key: &str, path: &str) -> String {
    let path = normalize_relative(path);
    if path.is_empty() {
        format!("{source_key}:/")
    } else {
        format!("{source_key}:{path}")
    }
}

/// `processed/total (pct%)`. A zero total reads as 0%.
fn progress(processed: u64, total: u64) -> String {
    let pct = if total == 0 {
        0
    } else {
        processed.saturating_mul(100) / total
    };
    format!("{processed}/{total} ({pct}%)")
}

fn plural(n: usize, one: &str, many: &str) -> String {
    if n == 1 {
        format!("{n} {one}")
    } else {
        format!("{n} {many}")
    }
}

fn count_lines(counts: &StatusCounts, depth: usize) -> Vec<String> {
    [
        ("completed", counts.completed),
        ("failed", counts.failed),
        ("processing", counts.processing),
        ("pending", counts.pending),
    ]
    .into_iter()
    .map(|(label, n)| format!("{}{label:<10} {n}", indent(depth)))
    .collect()
}

/// Write formatted lines to stdout.
pub fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

// ============================================================================
// Enqueue
// ============================================================================

pub fn format_cache_enqueue(source_key: &str, path: &str, report: &CacheEnqueueReport) -> Vec<String> {
    let status = match report.status {
        EnqueueStatus::Queued => "queued",
        EnqueueStatus::AlreadyQueued => "already queued",
        EnqueueStatus::NothingToQueue => "no eligible files",
    };
    vec![
        format!(
            "{} @ {}: {status}",
            location(source_key, path),
            report.target_size
        ),
        format!(
            "{}{}, {} already queued",
            indent(1),
            plural(report.queued_count, "new job", "new jobs"),
            report.already_queued_count
        ),
    ]
}

pub fn format_archive_enqueue(outcome: &ArchiveEnqueue) -> Vec<String> {
    let verb = if outcome.created { "queued" } else { "already queued" };
    vec![format!("Archive {}: {verb}", outcome.token)]
}

// ============================================================================
// Status
// ============================================================================

fn file_line(file: &FileCacheStatus) -> String {
    let state = match file.status {
        Some(status) => status.to_string(),
        None => "not requested".to_string(),
    };
    let disk = if file.cached { " (cached)" } else { "" };
    match (&file.message, file.status) {
        (Some(message), Some(JobStatus::Failed)) => {
            format!("{}{}: {state}{disk}: {message}", indent(1), file.relative_path)
        }
        _ => format!("{}{}: {state}{disk}", indent(1), file.relative_path),
    }
}

pub fn format_cache_status(report: &CacheStatusReport) -> Vec<String> {
    let mut header = location(&report.source_key, &report.folder);
    if let Some(size) = report.target_size {
        header.push_str(&format!(" @ {size}"));
    }
    let agg = &report.aggregate;
    let mut lines = vec![
        header,
        format!(
            "{}{}, {}",
            indent(1),
            plural(agg.total_eligible_files, "eligible file", "eligible files"),
            plural(agg.total_targets, "target", "targets")
        ),
    ];
    lines.extend(count_lines(
        &StatusCounts {
            pending: agg.pending,
            processing: agg.processing,
            completed: agg.completed,
            failed: agg.failed,
        },
        1,
    ));
    lines.extend(report.files.iter().map(file_line));
    lines
}

pub fn format_archive_status(job: &ArchiveJob) -> Vec<String> {
    let mut lines = vec![format!(
        "Archive {}: {} {}",
        job.token,
        job.status,
        progress(job.processed_files, job.total_files)
    )];
    if let Some(current) = &job.current_file {
        lines.push(format!("{}Current: {current}", indent(1)));
    }
    if let Some(error) = &job.error_message {
        lines.push(format!("{}Error: {error}", indent(1)));
    }
    lines
}

pub fn format_job_counts(counts: &[(JobKind, StatusCounts)]) -> Vec<String> {
    let mut lines = Vec::new();
    for (kind, c) in counts {
        lines.push(format!("{kind} jobs ({})", c.total()));
        lines.extend(count_lines(c, 1));
    }
    lines
}

pub fn format_download(download: &ArchiveDownload, destination: &str) -> Vec<String> {
    vec![format!(
        "{} → {destination} ({} bytes)",
        download.file_name, download.bytes
    )]
}

// ============================================================================
// Maintenance
// ============================================================================

pub fn format_cancel(report: &CancelReport) -> Vec<String> {
    vec![format!(
        "Cancelled {} {}",
        report.cancelled_jobs,
        if report.cancelled_jobs == 1 {
            format!("{} job", report.kind)
        } else {
            format!("{} jobs", report.kind)
        }
    )]
}

pub fn format_removed(action: &str, removed: &RemovedRows) -> Vec<String> {
    vec![format!(
        "{action}: {} cache, {} archive",
        removed.cache_jobs, removed.archive_jobs
    )]
}

pub fn format_reconcile(report: &ReconcileReport) -> Vec<String> {
    vec![
        format!(
            "Timed out: {} cache, {} archive",
            report.stale_cache_jobs, report.stale_archive_jobs
        ),
        format!("Expired archives purged: {}", report.expired_archives),
    ]
}

// ============================================================================
// Worker events
// ============================================================================

fn target_line(source_key: &str, relative_path: &str, target: TargetSize, what: &str) -> String {
    format!("{} @ {target}: {what}", location(source_key, relative_path))
}

/// Format a single worker event as display lines.
pub fn format_worker_event(event: &WorkerEvent) -> Vec<String> {
    match event {
        WorkerEvent::CacheCompleted {
            source_key,
            relative_path,
            target,
            cached,
            ..
        } => vec![target_line(
            source_key,
            relative_path,
            *target,
            if *cached { "cached" } else { "encoded" },
        )],
        WorkerEvent::CacheFailed { id, message } => vec![format!("Job {id} failed: {message}")],
        WorkerEvent::ArchiveCompleted {
            token,
            entries,
            bytes,
        } => vec![format!(
            "Archive {token}: {} ({bytes} bytes)",
            plural(*entries as usize, "file", "files")
        )],
        WorkerEvent::ArchiveFailed { token, message } => {
            vec![format!("Archive {token} failed: {message}")]
        }
        WorkerEvent::Reconciled(report) => {
            let mut lines = vec!["Reconciled job store".to_string()];
            lines.extend(
                format_reconcile(report)
                    .into_iter()
                    .map(|l| format!("{}{l}", indent(1))),
            );
            lines
        }
    }
}

pub fn format_run_stats(stats: &RunStats) -> Vec<String> {
    vec![format!("Done: {stats}")]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FolderCacheAggregate;

    fn size(edge: u32) -> TargetSize {
        TargetSize::new(edge).unwrap()
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    #[test]
    fn location_shows_root_as_slash() {
        assert_eq!(location("main", ""), "main:/");
        assert_eq!(location("main", "/albumA/"), "main:albumA");
    }

    #[test]
    fn progress_handles_zero_total() {
        assert_eq!(progress(0, 0), "0/0 (0%)");
        assert_eq!(progress(3, 10), "3/10 (30%)");
        assert_eq!(progress(10, 10), "10/10 (100%)");
    }

    #[test]
    fn indent_levels() {
        assert_eq!(indent(0), "");
        assert_eq!(indent(2), "        ");
    }

    // =========================================================================
    // Reports
    // =========================================================================

    #[test]
    fn cache_enqueue_report() {
        let report = CacheEnqueueReport {
            status: EnqueueStatus::Queued,
            queued_count: 3,
            already_queued_count: 1,
            target_size: size(750),
            job_ids: vec![1, 2, 3, 4],
        };
        assert_eq!(
            format_cache_enqueue("main", "albumA", &report),
            vec!["main:albumA @ 750px: queued", "    3 new jobs, 1 already queued"]
        );
    }

    #[test]
    fn already_queued_single_file() {
        let report = CacheEnqueueReport {
            status: EnqueueStatus::AlreadyQueued,
            queued_count: 0,
            already_queued_count: 1,
            target_size: size(300),
            job_ids: vec![9],
        };
        let lines = format_cache_enqueue("main", "a.jpg", &report);
        assert_eq!(lines[0], "main:a.jpg @ 300px: already queued");
        assert_eq!(lines[1], "    0 new jobs, 1 already queued");
    }

    #[test]
    fn empty_folder_enqueue() {
        let report = CacheEnqueueReport {
            status: EnqueueStatus::NothingToQueue,
            queued_count: 0,
            already_queued_count: 0,
            target_size: size(300),
            job_ids: vec![],
        };
        let lines = format_cache_enqueue("main", "docs", &report);
        assert_eq!(lines[0], "main:docs @ 300px: no eligible files");
    }

    #[test]
    fn cache_status_report() {
        let report = CacheStatusReport {
            source_key: "main".into(),
            folder: "albumA".into(),
            target_size: Some(size(300)),
            aggregate: FolderCacheAggregate {
                pending: 1,
                processing: 0,
                completed: 2,
                failed: 1,
                total_eligible_files: 4,
                total_targets: 4,
            },
            files: vec![
                FileCacheStatus {
                    relative_path: "albumA/a.jpg".into(),
                    status: Some(JobStatus::Completed),
                    message: Some("Cached at 300x200".into()),
                    cached: true,
                },
                FileCacheStatus {
                    relative_path: "albumA/b.jpg".into(),
                    status: Some(JobStatus::Failed),
                    message: Some("albumA/b.jpg: boom".into()),
                    cached: false,
                },
                FileCacheStatus {
                    relative_path: "albumA/c.jpg".into(),
                    status: None,
                    message: None,
                    cached: false,
                },
            ],
        };
        assert_eq!(
            format_cache_status(&report),
            vec![
                "main:albumA @ 300px",
                "    4 eligible files, 4 targets",
                "    completed  2",
                "    failed     1",
                "    processing 0",
                "    pending    1",
                "    albumA/a.jpg: completed (cached)",
                "    albumA/b.jpg: failed: albumA/b.jpg: boom",
                "    albumA/c.jpg: not requested",
            ]
        );
    }

    #[test]
    fn archive_status_report() {
        let job = ArchiveJob {
            token: "tok".into(),
            source_key: "main".into(),
            source_paths: vec!["albumA".into()],
            status: JobStatus::Processing,
            total_files: 10,
            processed_files: 3,
            current_file: Some("albumA/d.jpg".into()),
            result_path: None,
            error_message: None,
            created_at: 0,
            started_at: Some(1),
            completed_at: None,
        };
        assert_eq!(
            format_archive_status(&job),
            vec![
                "Archive tok: processing 3/10 (30%)",
                "    Current: albumA/d.jpg"
            ]
        );
    }

    #[test]
    fn cancel_report_pluralizes() {
        let one = CancelReport {
            kind: JobKind::Archive,
            cancelled_jobs: 1,
        };
        let many = CancelReport {
            kind: JobKind::Cache,
            cancelled_jobs: 4,
        };
        assert_eq!(format_cancel(&one), vec!["Cancelled 1 archive job"]);
        assert_eq!(format_cancel(&many), vec!["Cancelled 4 cache jobs"]);
    }

    // =========================================================================
    // Worker events
    // =========================================================================

    #[test]
    fn worker_event_cache_completed() {
        let event = WorkerEvent::CacheCompleted {
            id: 1,
            source_key: "main".into(),
            relative_path: "albumA/a.jpg".into(),
            target: size(300),
            cached: false,
        };
        assert_eq!(
            format_worker_event(&event),
            vec!["main:albumA/a.jpg @ 300px: encoded"]
        );
    }

    #[test]
    fn worker_event_failures() {
        assert_eq!(
            format_worker_event(&WorkerEvent::CacheFailed {
                id: 17,
                message: "albumA/x.jpg: boom".into()
            }),
            vec!["Job 17 failed: albumA/x.jpg: boom"]
        );
        assert_eq!(
            format_worker_event(&WorkerEvent::ArchiveFailed {
                token: "tok".into(),
                message: "Failed to archive b.jpg: gone".into()
            }),
            vec!["Archive tok failed: Failed to archive b.jpg: gone"]
        );
    }

    #[test]
    fn worker_event_reconciled_is_indented() {
        let lines = format_worker_event(&WorkerEvent::Reconciled(ReconcileReport {
            stale_cache_jobs: 2,
            stale_archive_jobs: 0,
            expired_archives: 1,
        }));
        assert_eq!(
            lines,
            vec![
                "Reconciled job store",
                "    Timed out: 2 cache, 0 archive",
                "    Expired archives purged: 1",
            ]
        );
    }
}
