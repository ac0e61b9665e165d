//! Configuration management for Tasknest
//!
//! This module handles loading, parsing, and validation of configuration files.

use crate::constants::{
    DAEMON_IDLE_TIMEOUT_SECS, HEARTBEAT_INTERVAL_SECS, MAX_CONSECUTIVE_FAILURES, OP_TIMEOUT_SECS,
    QUEUE_BACKOFF_BASE_MS, QUEUE_BACKOFF_MAX_MS, QUEUE_RETRY_CEILING,
};
use crate::sync::conflict::ConflictStrategy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub daemon: DaemonConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
    pub remotes: RemotesConfig,
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Periodic sync interval in minutes (0 = disabled, notification-driven only)
    pub auto_sync_interval_minutes: u64,
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Idle window in seconds before the daemon exits when no work arrives
    pub idle_timeout_secs: u64,
    /// Heartbeat cadence in seconds
    pub heartbeat_interval_secs: u64,
    /// Consecutive failed cycles before the daemon gives up and exits
    pub max_consecutive_failures: u32,
    /// Per-operation timeout during a push, in seconds
    pub op_timeout_secs: u64,
}

/// Operation queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Retries before an entry is moved to terminal failure
    pub retry_ceiling: u32,
    /// Base delay for retry backoff, in milliseconds
    pub backoff_base_ms: u64,
    /// Maximum delay for retry backoff, in milliseconds
    pub backoff_max_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

/// Remote store configurations
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RemotesConfig {
    /// Remote to use for new items when none is specified
    pub default_remote: String,
    /// Map of remote_id -> remote configuration
    /// This allows multiple instances of the same remote type
    pub instances: HashMap<String, RemoteInstanceConfig>,
}

/// Configuration for a single remote instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteInstanceConfig {
    /// Remote type (e.g., "caldav", "todoist")
    pub remote_type: String,
    /// Human-readable name for this remote instance
    pub name: String,
    /// Whether this remote instance is enabled for sync
    pub enabled: bool,
    /// Conflict resolution strategy when both sides changed a task
    #[serde(default)]
    pub conflict_resolution: ConflictStrategy,
    /// Periodic sync interval override for this remote, in minutes
    pub sync_interval_minutes: Option<u64>,
    /// Remote-specific configuration as a map of key-value pairs
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync_interval_minutes: 5,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DAEMON_IDLE_TIMEOUT_SECS,
            heartbeat_interval_secs: HEARTBEAT_INTERVAL_SECS,
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
            op_timeout_secs: OP_TIMEOUT_SECS,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: QUEUE_RETRY_CEILING,
            backoff_base_ms: QUEUE_BACKOFF_BASE_MS,
            backoff_max_ms: QUEUE_BACKOFF_MAX_MS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }
}

impl RemoteInstanceConfig {
    /// Get a configuration value by key
    pub fn get_config(&self, key: &str) -> Option<&String> {
        self.config.get(key)
    }

    /// Effective periodic sync interval for this remote
    pub fn effective_interval(&self, sync: &SyncConfig) -> Option<Duration> {
        let minutes = self.sync_interval_minutes.unwrap_or(sync.auto_sync_interval_minutes);
        if minutes == 0 {
            None
        } else {
            Some(Duration::from_secs(minutes * 60))
        }
    }
}

impl Config {
    /// Load configuration from file or return defaults
    pub fn load() -> Result<Self> {
        let config_path = Self::find_config_file()?;

        if let Some(path) = config_path {
            Self::load_from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in order of precedence
    fn find_config_file() -> Result<Option<PathBuf>> {
        // 1. Check current directory
        let current_dir_config = PathBuf::from("tasknest.toml");
        if current_dir_config.exists() {
            return Ok(Some(current_dir_config));
        }

        // 2. Check XDG config directory
        if let Some(config_dir) = dirs::config_dir() {
            let xdg_config = config_dir.join("tasknest").join("config.toml");
            if xdg_config.exists() {
                return Ok(Some(xdg_config));
            }
        }

        Ok(None)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.sync.auto_sync_interval_minutes > 1440 {
            anyhow::bail!("auto_sync_interval_minutes cannot exceed 1440 (24 hours)");
        }

        if self.daemon.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs must be greater than 0");
        }

        if self.queue.backoff_base_ms == 0 {
            anyhow::bail!("backoff_base_ms must be greater than 0");
        }
        if self.queue.backoff_max_ms < self.queue.backoff_base_ms {
            anyhow::bail!(
                "backoff_max_ms ({}) cannot be smaller than backoff_base_ms ({})",
                self.queue.backoff_max_ms,
                self.queue.backoff_base_ms
            );
        }

        self.validate_remotes()?;

        Ok(())
    }

    /// Validate remote configurations
    fn validate_remotes(&self) -> Result<()> {
        // Check that the default remote, when set, exists and is enabled
        let default_remote = &self.remotes.default_remote;
        if !default_remote.is_empty() {
            match self.remotes.instances.get(default_remote) {
                Some(instance) => {
                    if !instance.enabled {
                        anyhow::bail!("default_remote '{}' is disabled", default_remote);
                    }
                }
                None => {
                    let available: Vec<String> = self.get_available_remote_ids();
                    anyhow::bail!(
                        "default_remote '{}' not found. Available remotes: {}",
                        default_remote,
                        if available.is_empty() { "none".to_string() } else { available.join(", ") }
                    );
                }
            }
        }

        // Validate each remote instance
        for (remote_id, instance) in &self.remotes.instances {
            if instance.enabled {
                Self::validate_remote_instance(remote_id, instance)?;
            }
        }

        Ok(())
    }

    /// Validate a single remote instance
    fn validate_remote_instance(remote_id: &str, instance: &RemoteInstanceConfig) -> Result<()> {
        if instance.name.is_empty() {
            anyhow::bail!("Remote '{}': name cannot be empty", remote_id);
        }
        if instance.remote_type.is_empty() {
            anyhow::bail!("Remote '{}': remote_type cannot be empty", remote_id);
        }
        if let Some(minutes) = instance.sync_interval_minutes {
            if minutes > 1440 {
                anyhow::bail!("Remote '{}': sync_interval_minutes cannot exceed 1440 (24 hours)", remote_id);
            }
        }
        Ok(())
    }

    /// Get list of available (enabled) remote IDs
    pub fn get_available_remote_ids(&self) -> Vec<String> {
        self.remotes
            .instances
            .iter()
            .filter(|(_, instance)| instance.enabled)
            .map(|(remote_id, _)| remote_id.clone())
            .collect()
    }

    /// Get a specific remote instance configuration
    pub fn get_remote_instance(&self, remote_id: &str) -> Option<&RemoteInstanceConfig> {
        self.remotes.instances.get(remote_id)
    }

    /// Check if a specific remote instance is enabled
    pub fn is_remote_enabled(&self, remote_id: &str) -> bool {
        self.remotes
            .instances
            .get(remote_id)
            .map(|instance| instance.enabled)
            .unwrap_or(false)
    }

    /// Generate default configuration file
    pub fn generate_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Self::default();
        let toml_content = toml::to_string_pretty(&config).context("Failed to serialize default config")?;

        // Add header comment
        let header = format!(
            "# Tasknest Configuration File\n# Generated on {}\n\n",
            chrono::Local::now().format("%Y-%m-%d")
        );

        let full_content = header + &toml_content;

        // Ensure the parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        std::fs::write(&path, full_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        println!("{}: {}", crate::constants::CONFIG_GENERATED, path.as_ref().display());
        Ok(())
    }

    /// Get the XDG config directory path
    pub fn get_xdg_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
            .map(|dir| dir.join("tasknest"))
    }

    /// Get the default config file path
    pub fn get_default_config_path() -> Result<PathBuf> {
        Ok(Self::get_xdg_config_dir()?.join("config.toml"))
    }
}
