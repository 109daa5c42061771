//! # Proofsheet
//!
//! A background job engine for large, multi-root photo libraries. Clients
//! ask for resized previews of single files or whole folders, or for ZIP
//! archives of arbitrary selections; the engine queues the work in SQLite
//! and a pool of workers carries it out.
//!
//! # Architecture: Request → Queue → Worker
//!
//! ```text
//! 1. Dispatch   (source, path, size)  →  job rows        (validated, deduplicated)
//! 2. Work       job rows              →  cache/, archives/ (atomic claim, build, finish)
//! 3. Status     job rows + disk       →  reports          (aggregates, progress, download)
//! ```
//!
//! Nothing is shared between the stages except the database file and the
//! artifact directories, so any number of worker processes can run against
//! one queue, and a crashed worker costs nothing but a timeout.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`paths`] | Sandboxes request paths inside named source roots |
//! | [`dispatch`] | Validates requests and inserts deduplicated job rows |
//! | [`store`] | Durable job rows with atomic claims and guarded transitions |
//! | [`worker`] | Claims jobs, builds artifacts, reconciles stale and expired work |
//! | [`status`] | Folder aggregates, archive progress and one-shot downloads |
//! | [`engine`] | [`JobEngine`], the single entry point tying the above together |
//! | [`archive`] | Streaming ZIP writer with progress reporting |
//! | [`cache`] | Deterministic artifact locations and freshness checks |
//! | [`imaging`] | Pure-Rust decoding, RAW preview extraction and resizing |
//! | [`config`] | `proofsheet.toml` loading, merging with stock defaults, validation |
//! | [`types`] | Job snapshots and shared value types |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## The Database Is the Queue
//!
//! Job rows are the only coordination mechanism. A worker owns a job from the
//! moment its `pending → processing` update affects one row, and every later
//! write is conditional on the row still being `processing`. Cancellation and
//! timeouts just move rows to `failed`; the worker notices on its next write
//! and throws its result away.
//!
//! ## Deterministic Artifact Paths
//!
//! A preview for `(source, path, size)` always lives at the same place under
//! the cache directory. Clients can serve a cached preview without touching
//! the queue, and a rerun of an already-built job is a cheap freshness check.
//!
//! ## Pure-Rust Imaging
//!
//! Decoding, resizing and JPEG encoding use the `image` crate; RAW files are
//! handled by pulling the embedded JPEG preview out of the TIFF container.
//! No system libraries, no external processes.

pub mod archive;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod imaging;
pub mod logging;
pub mod output;
pub mod paths;
pub mod status;
pub mod store;
pub mod types;
pub mod worker;

pub use engine::{EngineError, JobEngine};

#[cfg(test)]
pub(crate) mod test_helpers;
