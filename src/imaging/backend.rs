//! Image processing backend trait and shared types.
//!
//! The [`ImageBackend`] trait defines the two operations every backend must
//! support: identify and resize.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend) — pure Rust, statically
//! linked. Workers are generic over the trait so tests can count or fail
//! renders without touching pixels.

use super::params::{ResizeParams, SourceFormat};
use std::path::Path;
use thiserror::Error;

/// Errors never include absolute paths: the worker prefixes them with the
/// source-relative path before they reach a job row.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode image: {0}")]
    Decode(String),
    #[error("No embedded preview found in RAW file")]
    NoEmbeddedPreview,
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

/// Result of an identify operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Trait for image processing backends.
///
/// `Sync` so a single backend can be shared by every worker thread.
pub trait ImageBackend: Sync {
    /// Get the dimensions of the raster a preview would be rendered from.
    /// For RAW sources that is the embedded preview, not the sensor size.
    fn identify(&self, path: &Path, format: SourceFormat) -> Result<Dimensions, BackendError>;

    /// Render `params.source` at exactly `width`×`height` and write it to
    /// `params.output`. Output must be byte-identical for identical input.
    fn resize(&self, params: &ResizeParams) -> Result<(), BackendError>;
}
