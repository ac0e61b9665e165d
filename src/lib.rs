//! Tasknest - An offline-first personal task manager
//!
//! This library keeps a local SQLite cache of tasks consistent with one or
//! more remote task stores while allowing fully offline operation. Local
//! mutations are written to the cache and a durable operation queue, then
//! pushed in the background by a single-instance daemon that also pulls
//! remote changes and resolves conflicts.
//!
//! # Modules
//!
//! The library is organized into several key modules:
//!
//! * [`config`] - Application configuration management
//! * [`storage`] - Local database, sync metadata and the operation queue
//! * [`sync`] - Bidirectional synchronization engine and conflict resolution
//! * [`remote`] - Remote store abstraction implemented per backend
//! * [`daemon`] - Background sync daemon with lock file, heartbeat and IPC
//! * [`client`] - Foreground-side client for talking to the daemon

/// Foreground client for notifying and querying the daemon
pub mod client;

/// Configuration module for managing application settings
pub mod config;

/// Application constants and default values
pub mod constants;

/// Background daemon: event loop, lock file, heartbeat, IPC
pub mod daemon;

/// Logging setup for the daemon and CLI
pub mod logger;

/// Filesystem layout for config, databases and runtime files
pub mod paths;

/// Remote store abstraction layer for multi-backend support
pub mod remote;

/// Local storage layer: tasks, sync metadata and the operation queue
pub mod storage;

/// Synchronization engine for keeping local and remote data in sync
pub mod sync;
