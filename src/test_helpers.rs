//! Shared test utilities.
//!
//! Synthetic inputs for the engine: real JPEG files generated with the
//! `image` crate, hand-assembled TIFF-style RAW containers wrapping such a
//! JPEG, and a throwaway engine layout (one `main` source, database, cache
//! and archive dirs) under a temp directory.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = TempDir::new().unwrap();
//! let config = test_config(tmp.path());
//! create_test_jpeg(&source_root(&config).join("albumA/one.jpg"), 64, 48);
//! ```

use crate::config::EngineConfig;
use image::{ImageBuffer, Rgb};
use std::path::{Path, PathBuf};

// =========================================================================
// Images
// =========================================================================

/// Encode a `width`×`height` gradient as JPEG bytes.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut bytes = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, 90)
        .encode_image(&img)
        .unwrap();
    bytes
}

/// Write a synthetic JPEG, creating parent directories.
pub fn create_test_jpeg(path: &Path, width: u32, height: u32) {
    write_file(path, &jpeg_bytes(width, height));
}

/// Minimal little-endian TIFF container whose IFD0 points at `jpeg` through
/// `JPEGInterchangeFormat` / `JPEGInterchangeFormatLength`, the way most RAW
/// formats carry their embedded preview.
pub fn raw_container(jpeg: &[u8]) -> Vec<u8> {
    const IFD_OFFSET: u32 = 8;
    const ENTRY_COUNT: u16 = 2;
    let payload_offset = IFD_OFFSET + 2 + 12 * u32::from(ENTRY_COUNT) + 4;

    let mut data = Vec::new();
    data.extend_from_slice(b"II");
    data.extend_from_slice(&42u16.to_le_bytes());
    data.extend_from_slice(&IFD_OFFSET.to_le_bytes());
    data.extend_from_slice(&ENTRY_COUNT.to_le_bytes());
    for (tag, value) in [(0x0201u16, payload_offset), (0x0202, jpeg.len() as u32)] {
        data.extend_from_slice(&tag.to_le_bytes());
        data.extend_from_slice(&4u16.to_le_bytes()); // LONG
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&value.to_le_bytes());
    }
    data.extend_from_slice(&0u32.to_le_bytes()); // no next IFD
    data.extend_from_slice(jpeg);
    data
}

// =========================================================================
// Files and engine layout
// =========================================================================

pub fn write_file(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, contents).unwrap();
}

/// Config rooted at `dir`: source `main` at `dir/main`, everything else
/// beside it. Uses two workers and a one-hour staleness timeout.
pub fn test_config(dir: &Path) -> EngineConfig {
    let main = dir.join("main");
    std::fs::create_dir_all(&main).unwrap();
    let mut config = EngineConfig {
        database: dir.join("jobs.db"),
        cache_dir: dir.join("cache"),
        archive_dir: dir.join("archives"),
        ..EngineConfig::default()
    };
    config.sources.insert("main".to_string(), main);
    config.workers.max_workers = Some(2);
    config.workers.stale_timeout_secs = 3600;
    config
}

/// Base directory of the `main` source.
pub fn source_root(config: &EngineConfig) -> PathBuf {
    config.sources["main"].clone()
}
