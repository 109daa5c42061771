//! Enqueue surface.
//!
//! The dispatcher is the only writer that creates job rows. It validates a
//! request completely before touching the store: an unknown source, a path
//! that escapes its root, an ineligible file or an out-of-range size is
//! rejected synchronously and leaves no row behind.
//!
//! Folder requests are expanded from a snapshot listing taken at request
//! time. A file that disappears between the listing and the insert still gets
//! its job; the worker turns the missing file into a `failed` row later.

use crate::cache::archive_digest;
use crate::config::ImagesConfig;
use crate::paths::{EntryKind, PathError, PathResolver};
use crate::store::{ArchiveEnqueue, JobStore, StoreError};
use crate::types::TargetSize;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Invalid target size '{value}': expected 1-{max_edge} or a variant name")]
    InvalidTargetSize { value: String, max_edge: u32 },
    #[error("Not an eligible image in source '{source_key}': {relative_path}")]
    NotEligible {
        source_key: String,
        relative_path: String,
    },
    #[error("Archive request names no paths")]
    EmptyArchive,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// True when the request itself is at fault.
    pub fn is_validation(&self) -> bool {
        match self {
            DispatchError::Path(e) => e.is_validation(),
            DispatchError::InvalidTargetSize { .. }
            | DispatchError::NotEligible { .. }
            | DispatchError::EmptyArchive => true,
            DispatchError::Store(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueStatus {
    Queued,
    AlreadyQueued,
    /// The folder holds no eligible file; no row was touched.
    NothingToQueue,
}

/// Response to a cache request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEnqueueReport {
    /// `already_queued` only when every target already had an active job,
    /// `nothing_to_queue` when a folder request found no eligible file.
    pub status: EnqueueStatus,
    /// Rows this request created.
    pub queued_count: usize,
    /// Targets merged into an existing active job.
    pub already_queued_count: usize,
    pub target_size: TargetSize,
    /// One id per target, new or existing, in listing order.
    pub job_ids: Vec<i64>,
}

pub struct Dispatcher<'a> {
    store: &'a JobStore,
    resolver: &'a PathResolver,
    images: &'a ImagesConfig,
}

impl<'a> Dispatcher<'a> {
    pub fn new(store: &'a JobStore, resolver: &'a PathResolver, images: &'a ImagesConfig) -> Self {
        Self {
            store,
            resolver,
            images,
        }
    }

    /// Turn a request value (`"750"`, `"thumb"`) into a bounded target size.
    pub fn parse_target_size(&self, input: &str) -> Result<TargetSize, DispatchError> {
        TargetSize::parse(input, &self.images.variants)
            .filter(|size| size.edge() <= self.images.max_edge)
            .ok_or_else(|| DispatchError::InvalidTargetSize {
                value: input.trim().to_string(),
                max_edge: self.images.max_edge,
            })
    }

    /// Queue a preview of one file, or of every eligible file below a folder.
    pub fn enqueue_cache(
        &self,
        source_key: &str,
        path: &str,
        target: TargetSize,
    ) -> Result<CacheEnqueueReport, DispatchError> {
        if target.edge() > self.images.max_edge {
            return Err(DispatchError::InvalidTargetSize {
                value: target.edge().to_string(),
                max_edge: self.images.max_edge,
            });
        }

        let resolved = self.resolver.resolve_entry(source_key, path)?;
        let targets: Vec<String> = match resolved.kind {
            EntryKind::File => {
                if !self.images.is_eligible(Path::new(&resolved.relative_path)) {
                    return Err(DispatchError::NotEligible {
                        source_key: resolved.source_key,
                        relative_path: resolved.relative_path,
                    });
                }
                vec![resolved.relative_path]
            }
            EntryKind::Directory => self
                .resolver
                .list_files(&resolved)
                .into_iter()
                .map(|file| file.relative_path)
                .filter(|rel| self.images.is_eligible(Path::new(rel)))
                .collect(),
        };

        let outcomes = self.store.enqueue_cache_jobs(source_key, &targets, target)?;
        let queued_count = outcomes.iter().filter(|o| o.is_new()).count();
        let already_queued_count = outcomes.len() - queued_count;
        let status = if outcomes.is_empty() {
            EnqueueStatus::NothingToQueue
        } else if queued_count == 0 {
            EnqueueStatus::AlreadyQueued
        } else {
            EnqueueStatus::Queued
        };

        tracing::info!(
            source = source_key,
            path = %normalize_for_log(path),
            size = target.edge(),
            queued = queued_count,
            already_queued = already_queued_count,
            "cache request"
        );

        Ok(CacheEnqueueReport {
            status,
            queued_count,
            already_queued_count,
            target_size: target,
            job_ids: outcomes.iter().map(|o| o.id()).collect(),
        })
    }

    /// Queue a ZIP of `paths` (files or folders) and return its token.
    ///
    /// Every path must resolve now. The same path set, in any order or
    /// spelling, maps to the same live job.
    pub fn enqueue_archive(
        &self,
        source_key: &str,
        paths: &[String],
    ) -> Result<ArchiveEnqueue, DispatchError> {
        if paths.is_empty() {
            return Err(DispatchError::EmptyArchive);
        }
        let normalized = paths
            .iter()
            .map(|p| {
                self.resolver
                    .resolve_entry(source_key, p)
                    .map(|resolved| resolved.relative_path)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let digest = archive_digest(source_key, &normalized);
        let outcome = self
            .store
            .enqueue_archive_job(source_key, &normalized, &digest)?;
        tracing::info!(
            source = source_key,
            token = %outcome.token,
            paths = normalized.len(),
            created = outcome.created,
            "archive request"
        );
        Ok(outcome)
    }
}

fn normalize_for_log(path: &str) -> String {
    let normalized = crate::paths::normalize_relative(path);
    if normalized.is_empty() {
        "/".to_string()
    } else {
        normalized
    }
}
