//! Log setup: compact stderr output filtered by `RUST_LOG` (default `info`),
//! plus an optional DEBUG-level file per run under the log directory.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const FILE_FILTER: &str = "info,macroscan=debug,macroscan_core=debug,macroscan_runner=debug";

fn open_log_file(log_dir: &Path) -> Result<(File, PathBuf)> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = log_dir.join(format!("run_{stamp}.log"));
    let file = File::create(&path)
        .with_context(|| format!("Failed to create log file {}", path.display()))?;
    Ok((file, path))
}

/// Install the global subscriber. Returns the log file path when one was opened.
pub fn init(log_dir: Option<&Path>, verbose: bool) -> Result<Option<PathBuf>> {
    let default_level = if verbose { "debug" } else { "info" };
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(stderr_filter);

    let (file_layer, file_path, file_error) = match log_dir.map(open_log_file) {
        Some(Ok((file, path))) => {
            let layer = fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_filter(EnvFilter::new(FILE_FILTER));
            (Some(layer), Some(path), None)
        }
        Some(Err(e)) => (None, None, Some(e)),
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install log subscriber")?;

    if let Some(e) = file_error {
        tracing::warn!("file logging disabled: {e:#}");
    }
    if let Some(path) = &file_path {
        tracing::debug!(path = %path.display(), "logging to file");
    }
    Ok(file_path)
}
