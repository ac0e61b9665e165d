//! Logging setup.
//!
//! The daemon runs detached from any terminal, so logs go to a file under
//! the data directory via a [`fern`] dispatch. The level is taken from the
//! logging section of the configuration.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::LoggingConfig;

/// Initialize the global logger. Safe to call once per process.
pub fn init(config: &LoggingConfig, log_file: &Path) -> Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let level = config
        .level
        .parse::<log::LevelFilter>()
        .unwrap_or(log::LevelFilter::Info);

    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
    }

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] [{}] [{}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ));
        })
        .level(level)
        .chain(fern::log_file(log_file).with_context(|| format!("Failed to open log file: {}", log_file.display()))?)
        .apply()
        .context("Failed to initialize logger")?;

    Ok(())
}
