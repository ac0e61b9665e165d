//! Remote factory for creating remote store instances from configuration.
//!
//! Backend adapters live in their own crates and register here. The core
//! crate ships only the contract; wiring a concrete adapter in means adding
//! a match arm.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use super::RemoteStore;
use crate::config::RemoteInstanceConfig;

/// Create a remote store instance from a configured remote.
///
/// # Errors
/// Returns an error if the remote type has no adapter compiled in.
pub fn create_remote(remote_id: &str, instance: &RemoteInstanceConfig) -> Result<Arc<dyn RemoteStore>> {
    match instance.remote_type.as_str() {
        // Adapter crates plug in here:
        // "caldav" => Ok(Arc::new(CaldavRemote::from_config(&instance.config)?)),
        // "todoist" => Ok(Arc::new(TodoistRemote::from_config(&instance.config)?)),
        other => Err(anyhow!(
            "Remote '{}': no adapter available for remote_type '{}'",
            remote_id,
            other
        )),
    }
}
