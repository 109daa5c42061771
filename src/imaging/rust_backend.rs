//! Pure Rust image processing backend.
//!
//! Everything is statically linked into the binary.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, TIFF, WebP) | `image` crate (pure Rust decoders) |
//! | Decode (RAW) | [`raw_preview`](super::raw_preview) locates the embedded JPEG, `image` decodes it |
//! | Resize | `image::DynamicImage::resize_exact` with `Lanczos3` filter |
//! | Encode → JPEG | `image::codecs::jpeg::JpegEncoder` (RGB8, fixed quality) |
//! | Atomic write | `tempfile::NamedTempFile` in the target dir, then `persist` |
//!
//! The JPEG encoder embeds no timestamps or random data, so rendering the
//! same source at the same size and quality twice gives identical bytes.

use super::backend::{BackendError, Dimensions, ImageBackend};
use super::params::{ResizeParams, SourceFormat};
use super::raw_preview::preview_candidates;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageEncoder, ImageError, ImageFormat, ImageReader};
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::LazyLock;

/// Extensions whose decoders are compiled in.
const PHOTO_CANDIDATES: &[(&str, ImageFormat)] = &[
    ("jpg", ImageFormat::Jpeg),
    ("jpeg", ImageFormat::Jpeg),
    ("png", ImageFormat::Png),
    ("tif", ImageFormat::Tiff),
    ("tiff", ImageFormat::Tiff),
    ("webp", ImageFormat::WebP),
];

static SUPPORTED_EXTENSIONS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    PHOTO_CANDIDATES
        .iter()
        .filter(|(_, fmt)| fmt.reading_enabled())
        .map(|(ext, _)| *ext)
        .collect()
});

/// Returns the set of raster file extensions that have working decoders compiled in.
pub fn supported_input_extensions() -> &'static [&'static str] {
    &SUPPORTED_EXTENSIONS
}

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn image_error(err: ImageError) -> BackendError {
    match err {
        ImageError::IoError(io) => BackendError::Io(io),
        other => BackendError::Decode(other.to_string()),
    }
}

/// Load and decode a raster image from disk. The format is sniffed from the
/// content, so a mislabeled extension still decodes.
fn load_raster(path: &Path) -> Result<DynamicImage, BackendError> {
    ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(image_error)
}

/// Decode the best embedded preview of a RAW file.
fn load_raw(path: &Path) -> Result<DynamicImage, BackendError> {
    let bytes = std::fs::read(path)?;
    for candidate in preview_candidates(&bytes) {
        match image::load_from_memory_with_format(candidate, ImageFormat::Jpeg) {
            Ok(img) => return Ok(img),
            Err(e) => tracing::debug!(len = candidate.len(), "skipping embedded stream: {e}"),
        }
    }
    Err(BackendError::NoEmbeddedPreview)
}

fn load_image(path: &Path, format: SourceFormat) -> Result<DynamicImage, BackendError> {
    match format {
        SourceFormat::Raster => load_raster(path),
        SourceFormat::Raw => load_raw(path),
    }
}

/// Header-only dimensions of the first embedded preview that parses.
fn identify_raw(path: &Path) -> Result<Dimensions, BackendError> {
    let bytes = std::fs::read(path)?;
    preview_candidates(&bytes)
        .into_iter()
        .find_map(|candidate| {
            ImageReader::with_format(Cursor::new(candidate), ImageFormat::Jpeg)
                .into_dimensions()
                .ok()
        })
        .map(|(width, height)| Dimensions { width, height })
        .ok_or(BackendError::NoEmbeddedPreview)
}

/// Encode as baseline JPEG. Alpha and high bit depths are flattened to RGB8
/// first since JPEG carries neither.
fn encode_jpeg(img: &DynamicImage, quality: u32) -> Result<Vec<u8>, BackendError> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100) as u8)
        .write_image(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| BackendError::ProcessingFailed(format!("JPEG encode failed: {e}")))?;
    Ok(buf)
}

/// Write `bytes` to `output` so readers only ever see the old file or the
/// complete new one.
pub(crate) fn write_atomic(output: &Path, bytes: &[u8]) -> Result<(), BackendError> {
    let dir = output.parent().ok_or_else(|| {
        BackendError::ProcessingFailed("output path has no parent directory".into())
    })?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(output).map_err(|e| BackendError::Io(e.error))?;
    Ok(())
}

impl ImageBackend for RustBackend {
    fn identify(&self, path: &Path, format: SourceFormat) -> Result<Dimensions, BackendError> {
        match format {
            SourceFormat::Raster => {
                let (width, height) = image::image_dimensions(path).map_err(image_error)?;
                Ok(Dimensions { width, height })
            }
            SourceFormat::Raw => identify_raw(path),
        }
    }

    fn resize(&self, params: &ResizeParams) -> Result<(), BackendError> {
        let img = load_image(&params.source, params.format)?;
        let img = if img.width() == params.width && img.height() == params.height {
            img
        } else {
            img.resize_exact(params.width, params.height, FilterType::Lanczos3)
        };
        let bytes = encode_jpeg(&img, params.quality.value())?;
        write_atomic(&params.output, &bytes)
    }
}
