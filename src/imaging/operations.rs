//! High-level image operations.
//!
//! These functions combine calculations with backend execution.
//! They take a request, compute parameters, and call the backend.

use super::backend::{BackendError, ImageBackend};
use super::calculations::{calculate_fit_dimensions, needs_resize};
use super::params::{Quality, ResizeParams, SourceFormat};
use crate::types::TargetSize;
use std::path::Path;

/// Result type for image operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Get image dimensions using the backend.
pub fn get_dimensions(
    backend: &impl ImageBackend,
    path: &Path,
    format: SourceFormat,
) -> Result<(u32, u32)> {
    let dims = backend.identify(path, format)?;
    Ok((dims.width, dims.height))
}

/// A written preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratedPreview {
    pub width: u32,
    pub height: u32,
    /// False when the source already fit inside the target and was only
    /// re-encoded.
    pub downscaled: bool,
}

/// Render one preview of `source` whose longer edge is at most `target`.
///
/// Dimensions are computed from the source (or its embedded RAW preview)
/// and never exceed it.
pub fn create_preview(
    backend: &impl ImageBackend,
    source: &Path,
    format: SourceFormat,
    output: &Path,
    target: TargetSize,
    quality: Quality,
) -> Result<GeneratedPreview> {
    let original = get_dimensions(backend, source, format)?;
    let (width, height) = calculate_fit_dimensions(original, target.edge());

    backend.resize(&ResizeParams {
        source: source.to_path_buf(),
        format,
        output: output.to_path_buf(),
        width,
        height,
        quality,
    })?;

    Ok(GeneratedPreview {
        width,
        height,
        downscaled: needs_resize(original, target.edge()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::Dimensions;
    use crate::imaging::backend::tests::{MockBackend, RecordedOp};

    fn target(edge: u32) -> TargetSize {
        TargetSize::new(edge).unwrap()
    }

    #[test]
    fn get_dimensions_calls_backend() {
        let backend = MockBackend::with_dimensions(vec![Dimensions {
            width: 1920,
            height: 1080,
        }]);

        let dims = get_dimensions(&backend, Path::new("/test.jpg"), SourceFormat::Raster).unwrap();
        assert_eq!(dims, (1920, 1080));
    }

    #[test]
    fn create_preview_scales_longer_edge() {
        let backend = MockBackend::with_dimensions(vec![Dimensions {
            width: 2000,
            height: 1500,
        }]);

        let preview = create_preview(
            &backend,
            Path::new("/src/a.jpg"),
            SourceFormat::Raster,
            Path::new("/cache/main/800/a.jpg.jpg"),
            target(800),
            Quality::new(85),
        )
        .unwrap();

        assert_eq!((preview.width, preview.height), (800, 600));
        assert!(preview.downscaled);

        let ops = backend.get_operations();
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], RecordedOp::Identify { path, .. } if path == "/src/a.jpg"));
        assert!(matches!(
            &ops[1],
            RecordedOp::Resize {
                width: 800,
                height: 600,
                quality: 85,
                output,
                ..
            } if output == "/cache/main/800/a.jpg.jpg"
        ));
    }

    #[test]
    fn create_preview_never_upscales() {
        let backend = MockBackend::with_dimensions(vec![Dimensions {
            width: 640,
            height: 480,
        }]);

        let preview = create_preview(
            &backend,
            Path::new("/src/small.jpg"),
            SourceFormat::Raster,
            Path::new("/out.jpg"),
            target(1600),
            Quality::default(),
        )
        .unwrap();

        assert_eq!((preview.width, preview.height), (640, 480));
        assert!(!preview.downscaled);
    }

    #[test]
    fn identify_failure_skips_resize() {
        let backend = MockBackend::new();
        let result = create_preview(
            &backend,
            Path::new("/src/a.jpg"),
            SourceFormat::Raster,
            Path::new("/out.jpg"),
            target(300),
            Quality::default(),
        );
        assert!(result.is_err());
        assert_eq!(backend.get_operations().len(), 1);
    }

    #[test]
    fn resize_failure_propagates() {
        let backend = MockBackend {
            identify_results: std::sync::Mutex::new(vec![Dimensions {
                width: 100,
                height: 100,
            }]),
            ..MockBackend::failing("encoder exploded")
        };
        let err = create_preview(
            &backend,
            Path::new("/src/a.jpg"),
            SourceFormat::Raster,
            Path::new("/out.jpg"),
            target(50),
            Quality::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("encoder exploded"));
    }
}
