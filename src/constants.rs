//! Application constants and default values.

/// Application name, used for XDG directories and file names.
pub const APP_NAME: &str = "tasknest";

/// Default idle window before the daemon exits when no work arrives (seconds).
pub const DAEMON_IDLE_TIMEOUT_SECS: u64 = 5;

/// Default heartbeat cadence (seconds). A heartbeat older than twice this
/// value is considered unhealthy.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Default ceiling on consecutive failed sync cycles before the daemon exits.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Default per-operation timeout during a push (seconds).
pub const OP_TIMEOUT_SECS: u64 = 300;

/// Default retry ceiling for a queue entry before it is marked as a
/// terminal failure.
pub const QUEUE_RETRY_CEILING: u32 = 5;

/// Default base delay for queue retry backoff (milliseconds).
pub const QUEUE_BACKOFF_BASE_MS: u64 = 1_000;

/// Default maximum delay for queue retry backoff (milliseconds).
pub const QUEUE_BACKOFF_MAX_MS: u64 = 300_000;

/// Jitter applied to backoff delays, as a fraction of the delay.
pub const QUEUE_BACKOFF_JITTER: f64 = 0.2;

/// Connect timeout for the daemon client (milliseconds).
pub const CLIENT_CONNECT_TIMEOUT_MS: u64 = 500;

/// Title suffix appended to the duplicate task created by the `keep_both`
/// conflict strategy.
pub const CONFLICT_COPY_SUFFIX: &str = " (conflicted copy)";

/// Message printed after generating a default config file.
pub const CONFIG_GENERATED: &str = "Generated default configuration";
