//! Shared logging setup for VulnScan binaries.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "vulnscan=info,vulnscan_scheduler=info,vulnscan_scanner=info,vulnscan_store=info";

/// Logging configuration shared by VulnScan binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Directory for plain-text log files; stderr-only when `None`.
    pub log_dir: Option<&'a Path>,
}

/// Initialize tracing with a stderr layer and an optional append-only file layer.
///
/// The filter comes from `RUST_LOG` when set; `verbose` lowers the stderr
/// filter to debug for the vulnscan crates.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let base_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("vulnscan=debug,vulnscan_scheduler=debug,vulnscan_scanner=debug,vulnscan_store=debug")
        })
    } else {
        base_filter()
    };

    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(console_filter),
    );

    match config.log_dir {
        Some(dir) => {
            let file = open_log_file(dir, config.app_name)?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .with_filter(base_filter()),
                )
                .init();
        }
        None => registry.init(),
    }

    Ok(())
}

/// Open (creating directories as needed) the append-only log file for `app_name`.
pub fn open_log_file(dir: &Path, app_name: &str) -> Result<std::fs::File> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    let path = log_file_path(dir, app_name);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))
}

/// Log file path for an application name, with unsafe characters replaced.
pub fn log_file_path(dir: &Path, app_name: &str) -> PathBuf {
    dir.join(format!("{}.log", sanitize_name(app_name)))
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_app_names() {
        let dir = Path::new("/tmp/logs");
        assert_eq!(
            log_file_path(dir, "vulnscan node#1"),
            PathBuf::from("/tmp/logs/vulnscan_node_1.log")
        );
    }

    #[test]
    fn opens_log_file_in_fresh_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("logs");
        let file = open_log_file(&dir, "scheduler").unwrap();
        drop(file);
        assert!(log_file_path(&dir, "scheduler").exists());
    }
}
