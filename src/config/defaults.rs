//! Default configuration values
//!
//! All constants used throughout the config module are defined here.

/// Maximum number of pending jobs before new triggers are refused
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Sliding window for merging a burst of file drops into one job (ms)
pub const DEFAULT_COALESCE_WINDOW_MS: u64 = 500;

/// Time a cancelled process gets between SIGTERM and SIGKILL (ms)
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 250;

/// How often the elevated transport files are polled (ms)
pub const DEFAULT_ELEVATION_POLL_INTERVAL_MS: u64 = 50;

/// Elevation helper exit codes meaning "the user refused".
/// pkexec exits 126 when the dialog is dismissed and 127 when not authorized.
pub const DEFAULT_DENIAL_EXIT_CODES: &[i32] = &[126, 127];

/// Environment variable overriding the queue capacity
pub const QUEUE_CAPACITY_ENV: &str = "SCRIPT_EXEC_MAX_QUEUE_JOBS";
