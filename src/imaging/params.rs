//! Parameter types for image operations.
//!
//! These structs describe *what* to do, not *how* to do it. They are the
//! interface between the high-level [`operations`](super::operations) module
//! (which decides the output dimensions) and the [`backend`](super::backend)
//! (which does the actual pixel work). Swapping the backend for a mock in
//! tests leaves the operation logic untouched.
//!
//! ## Types
//!
//! - [`Quality`] — JPEG encoding quality (1–100, default 85). Clamped on construction.
//! - [`SourceFormat`] — How the source is decoded: directly, or via its embedded RAW preview.
//! - [`ResizeParams`] — Full specification for a preview: source, output path, exact dimensions, quality.

use std::path::PathBuf;

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(pub u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(85)
    }
}

/// How a source file is turned into pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Decoded directly by a raster decoder (JPEG, PNG, TIFF, WebP).
    Raster,
    /// A RAW container; the embedded JPEG preview is decoded instead of the
    /// sensor data.
    Raw,
}

/// Parameters for one preview render.
#[derive(Debug, Clone, PartialEq)]
pub struct ResizeParams {
    pub source: PathBuf,
    pub format: SourceFormat,
    /// Final artifact location. Written atomically.
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub quality: Quality,
}
