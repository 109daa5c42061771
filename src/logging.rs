//! Logging setup.
//!
//! Installs a global `tracing` subscriber that writes to stderr, keeping
//! stdout free for command output and `--json`.

use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static INITIALIZED: OnceLock<()> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to install global tracing subscriber: {0}")]
    SetGlobal(#[from] tracing_subscriber::util::TryInitError),
}

/// Filter used when `RUST_LOG` is unset.
fn default_directive(verbose: bool) -> &'static str {
    if verbose { "proofsheet=debug,info" } else { "info" }
}

/// Initialize tracing. `verbose` raises the crate's own level to `debug`
/// and takes precedence over `RUST_LOG`.
///
/// Subsequent calls are no-ops.
pub fn init(verbose: bool) -> Result<(), LoggingError> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }
    let filter = if verbose {
        EnvFilter::new(default_directive(true))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(false)))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()?;
    let _ = INITIALIZED.set(());
    Ok(())
}
