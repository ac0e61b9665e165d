//! Filesystem layout for configuration, databases and daemon runtime files.
//!
//! Everything lives under the XDG data directory by default. Tests and the
//! daemon accept explicit paths, so only the CLI entry points use these
//! helpers directly.

use anyhow::Result;
use std::path::PathBuf;

use crate::constants::APP_NAME;

/// Root data directory (`~/.local/share/tasknest` on Linux).
pub fn data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))
        .map(|dir| dir.join(APP_NAME))
}

/// Database file for one configured remote.
pub fn remote_db_path(remote_id: &str) -> Result<PathBuf> {
    Ok(data_dir()?.join("remotes").join(format!("{remote_id}.db")))
}

/// Exclusive lock file recording the daemon's pid and socket path.
pub fn lock_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("daemon.lock"))
}

/// Unix domain socket the daemon listens on.
pub fn socket_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("daemon.sock"))
}

/// Heartbeat file the daemon refreshes on a fixed cadence.
pub fn heartbeat_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("heartbeat.json"))
}

/// Daemon and CLI log file.
pub fn log_path() -> Result<PathBuf> {
    Ok(data_dir()?.join(format!("{APP_NAME}.log")))
}

/// Ensure the data directory (and the remotes subdirectory) exist.
pub fn ensure_data_dirs() -> Result<PathBuf> {
    let dir = data_dir()?;
    std::fs::create_dir_all(dir.join("remotes"))?;
    Ok(dir)
}
