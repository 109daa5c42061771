//! Engine configuration.
//!
//! Loads a single `proofsheet.toml`, merged on top of the stock defaults so a
//! config file only needs the keys it wants to change.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! database = "proofsheet.db"   # SQLite job store
//! cache_dir = "cache"          # Root of derived previews
//! archive_dir = "archives"     # Finished ZIP archives
//!
//! [sources]                    # Named source roots (key = absolute path)
//! main = "/srv/photos"
//!
//! [images]
//! quality = 85                 # JPEG quality of previews (1-100)
//! max_edge = 8192              # Largest accepted target size
//! extensions = ["jpg", "jpeg", "png", "tif", "tiff", "webp"]
//! raw_extensions = ["cr2", "nef", "arw", "dng", "orf", "rw2", "pef", "srw", "raf"]
//!
//! [images.variants]            # Named target sizes
//! thumb = 300
//! preview = 1600
//!
//! [workers]
//! max_workers = 4              # Omit for auto (= CPU cores)
//! poll_interval_ms = 500
//! stale_timeout_secs = 900     # processing jobs older than this are failed
//! reconcile_interval_secs = 60
//! busy_timeout_ms = 10000      # wait for a locked database before erroring
//!
//! [archives]
//! retention_secs = 86400
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::imaging::rust_backend::supported_input_extensions;
use crate::paths::PathResolver;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Engine configuration loaded from `proofsheet.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// SQLite database file backing the job store.
    pub database: PathBuf,
    /// Root directory of derived preview artifacts.
    pub cache_dir: PathBuf,
    /// Directory finished archives are written to.
    pub archive_dir: PathBuf,
    /// Named source roots. Immutable for the life of the process.
    pub sources: BTreeMap<String, PathBuf>,
    /// Preview generation settings.
    pub images: ImagesConfig,
    /// Worker pool settings.
    pub workers: WorkersConfig,
    /// Archive retention settings.
    pub archives: ArchivesConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("proofsheet.db"),
            cache_dir: PathBuf::from("cache"),
            archive_dir: PathBuf::from("archives"),
            sources: BTreeMap::new(),
            images: ImagesConfig::default(),
            workers: WorkersConfig::default(),
            archives: ArchivesConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.images.quality) {
            return Err(ConfigError::Validation(
                "images.quality must be 1-100".into(),
            ));
        }
        if self.images.max_edge == 0 {
            return Err(ConfigError::Validation(
                "images.max_edge must be positive".into(),
            ));
        }
        for (name, &edge) in &self.images.variants {
            if edge == 0 || edge > self.images.max_edge {
                return Err(ConfigError::Validation(format!(
                    "images.variants.{name} must be between 1 and images.max_edge"
                )));
            }
        }
        if self.images.extensions.is_empty() && self.images.raw_extensions.is_empty() {
            return Err(ConfigError::Validation(
                "images.extensions and images.raw_extensions must not both be empty".into(),
            ));
        }
        let decodable = supported_input_extensions();
        for ext in &self.images.extensions {
            let bare = ext.trim_start_matches('.');
            if !decodable.iter().any(|known| known.eq_ignore_ascii_case(bare)) {
                return Err(ConfigError::Validation(format!(
                    "images.extensions: no decoder for '{bare}' (supported: {})",
                    decodable.join(", ")
                )));
            }
        }
        if self.workers.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "workers.poll_interval_ms must be positive".into(),
            ));
        }
        if self.workers.stale_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "workers.stale_timeout_secs must be positive".into(),
            ));
        }
        if self.workers.busy_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "workers.busy_timeout_ms must be positive".into(),
            ));
        }
        for (key, root) in &self.sources {
            // Keys become directory names under the cache and archive roots
            if key.is_empty() || key == "." || key == ".." || key.contains(['/', '\\']) {
                return Err(ConfigError::Validation(format!(
                    "invalid source key '{key}'"
                )));
            }
            if !root.is_dir() {
                return Err(ConfigError::Validation(format!(
                    "source '{key}' is not a directory: {}",
                    root.display()
                )));
            }
        }
        Ok(())
    }

    /// Build the path sandbox for the configured sources.
    pub fn path_resolver(&self) -> Result<PathResolver, ConfigError> {
        Ok(PathResolver::new(&self.sources)?)
    }
}

/// Preview generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImagesConfig {
    /// JPEG quality of generated previews (1 = worst, 100 = best).
    pub quality: u32,
    /// Largest target size a request may ask for.
    pub max_edge: u32,
    /// Raster extensions eligible for preview generation (case-insensitive).
    pub extensions: Vec<String>,
    /// RAW extensions; previews come from the embedded JPEG.
    pub raw_extensions: Vec<String>,
    /// Named target sizes usable in place of a number.
    pub variants: BTreeMap<String, u32>,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        let owned = |exts: &[&str]| exts.iter().map(|e| e.to_string()).collect();
        Self {
            quality: 85,
            max_edge: 8192,
            extensions: owned(&["jpg", "jpeg", "png", "tif", "tiff", "webp"]),
            raw_extensions: owned(&["cr2", "nef", "arw", "dng", "orf", "rw2", "pef", "srw", "raf"]),
            variants: BTreeMap::from([("thumb".to_string(), 300), ("preview".to_string(), 1600)]),
        }
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn list_contains(list: &[String], ext: &str) -> bool {
    list.iter()
        .any(|candidate| candidate.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

impl ImagesConfig {
    /// True if a file with this name can have a preview generated.
    pub fn is_eligible(&self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| {
            list_contains(&self.extensions, &ext) || list_contains(&self.raw_extensions, &ext)
        })
    }

    /// True if the file is a RAW container.
    pub fn is_raw(&self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| list_contains(&self.raw_extensions, &ext))
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkersConfig {
    /// Maximum number of concurrent workers.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_workers: Option<usize>,
    /// Sleep between claim attempts when the queue is empty.
    pub poll_interval_ms: u64,
    /// Age after which a `processing` job is considered orphaned.
    pub stale_timeout_secs: u64,
    /// Interval between staleness sweeps.
    pub reconcile_interval_secs: u64,
    /// How long a store call waits on a locked database before failing.
    pub busy_timeout_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            poll_interval_ms: 500,
            stale_timeout_secs: 900,
            reconcile_interval_secs: 60,
            busy_timeout_ms: 10_000,
        }
    }
}

impl WorkersConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Resolve the effective worker count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)`, at least 1
pub fn effective_workers(config: &WorkersConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .max_workers
        .map(|n| n.clamp(1, cores))
        .unwrap_or(cores)
}

/// Archive retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchivesConfig {
    /// Finished or failed archive jobs older than this are purged,
    /// together with their files.
    pub retention_secs: u64,
}

impl Default for ArchivesConfig {
    fn default() -> Self {
        Self {
            retention_secs: 86_400,
        }
    }
}

impl ArchivesConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(EngineConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Merge TOML text over the stock defaults, then deserialize and validate.
pub fn parse_config(content: &str) -> Result<EngineConfig, ConfigError> {
    let overlay: toml::Value = toml::from_str(content)?;
    let merged = merge_toml(stock_defaults_value()?, overlay);
    let config: EngineConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from a file path.
///
/// A missing file yields the validated stock defaults (no sources).
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        let config = EngineConfig::default();
        config.validate()?;
        return Ok(config);
    }
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Returns a fully-commented stock `proofsheet.toml`.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# Proofsheet Configuration
# ========================
# All settings are optional. Values shown below are the defaults.
# Unknown keys will cause an error.

# SQLite file holding the job queue. Safe to share between several
# `proofsheet work` processes on the same machine.
database = "proofsheet.db"

# Where derived previews are written. The location of every preview is
# <cache_dir>/<source>/<size>/<relative path>.jpg, so clients can probe for
# a cached file without asking the job store.
cache_dir = "cache"

# Where finished ZIP archives are written before download.
archive_dir = "archives"

# ---------------------------------------------------------------------------
# Sources
# ---------------------------------------------------------------------------
# Named roots every request path is resolved against. Nothing outside these
# directories is ever read.
[sources]
# main = "/srv/photos"

# ---------------------------------------------------------------------------
# Previews
# ---------------------------------------------------------------------------
[images]
# JPEG quality of generated previews (1 = worst, 100 = best).
quality = 85

# Largest target size (longer edge, px) a request may ask for.
max_edge = 8192

# Raster files eligible for previews.
extensions = ["jpg", "jpeg", "png", "tif", "tiff", "webp"]

# RAW files eligible for previews. The embedded JPEG preview is used.
raw_extensions = ["cr2", "nef", "arw", "dng", "orf", "rw2", "pef", "srw", "raf"]

# Named sizes accepted in place of a number.
[images.variants]
thumb = 300
preview = 1600

# ---------------------------------------------------------------------------
# Workers
# ---------------------------------------------------------------------------
[workers]
# Maximum parallel workers.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_workers = 4

# Sleep between claim attempts while the queue is empty.
poll_interval_ms = 500

# A job left in "processing" longer than this (e.g. after a crash) is
# forced to "failed" so it stops blocking new requests for the same file.
stale_timeout_secs = 900

# How often the staleness sweep runs.
reconcile_interval_secs = 60

# How long a database call waits for another process's lock before the
# worker logs the error and retries on its next poll.
busy_timeout_ms = 10000

# ---------------------------------------------------------------------------
# Archives
# ---------------------------------------------------------------------------
[archives]
# Finished archives that were never downloaded are deleted after this long.
retention_secs = 86400
"##
}
