//! Exclusive daemon lock file.
//!
//! The lock file guarantees a single daemon instance per data directory. It
//! is created with `O_EXCL` semantics and holds the owner's pid, socket path
//! and start time as JSON so clients can find the daemon and detect stale
//! locks left by a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Lock acquisition errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another live daemon holds the lock.
    #[error("Daemon already running (pid {pid})")]
    Held { pid: u32 },

    #[error("Lock file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Contents of the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMeta {
    pub pid: u32,
    pub socket_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// Held exclusive lock; removed from disk on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock, claiming it for the current process.
    ///
    /// An existing lock whose pid is no longer alive is treated as stale,
    /// removed, and acquisition is retried once. A lock held by a live
    /// process yields [`LockError::Held`].
    pub fn acquire(path: &Path, socket_path: &Path) -> Result<Self, LockError> {
        match Self::try_create(path, socket_path) {
            Ok(lock) => Ok(lock),
            Err(LockError::Held { pid }) if !pid_alive(pid) => {
                log::warn!("Removing stale lock file left by dead pid {pid}");
                std::fs::remove_file(path)?;
                Self::try_create(path, socket_path)
            }
            Err(e) => Err(e),
        }
    }

    fn try_create(path: &Path, socket_path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let result = OpenOptions::new().write(true).create_new(true).open(path);

        match result {
            Ok(mut file) => {
                let meta = LockMeta {
                    pid: std::process::id(),
                    socket_path: socket_path.to_path_buf(),
                    started_at: Utc::now(),
                };
                file.write_all(serde_json::to_string_pretty(&meta)?.as_bytes())?;
                file.sync_all()?;
                Ok(LockFile { path: path.to_path_buf() })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let pid = read_meta(path).map(|meta| meta.pid).unwrap_or(0);
                Err(LockError::Held { pid })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("Failed to remove lock file {}: {e}", self.path.display());
        }
    }
}

/// Read the metadata of an existing lock file.
pub fn read_meta(path: &Path) -> Result<LockMeta, LockError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Check whether a pid refers to a live process.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // Signal 0 performs the permission/existence check without delivering
    // anything. EPERM still means the process exists.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // Without a liveness probe, err on the side of respecting the lock.
    true
}
