//! Structured JSONL logging plus human-readable stderr output.
//!
//! This module provides dual-output logging:
//! - **JSONL to file** (`<data dir>/script-exec/logs/script-exec.jsonl`) - structured records
//! - **Pretty to stderr** - compact, human-readable
//!
//! # Usage
//!
//! ```rust,ignore
//! use script_exec::logging;
//!
//! // Initialize logging - MUST keep guard alive for duration of program
//! let _guard = logging::init(logging::LogOptions::default());
//!
//! // Use tracing macros directly
//! tracing::info!(run_id = 3, "Run started");
//! ```
//!
//! # JSONL Output Format
//!
//! Each line is a valid JSON object:
//! ```json
//! {"timestamp":"2026-01-05T10:30:45.123Z","level":"INFO","target":"script_exec::controller","fields":{"message":"Run finished","run_id":3,"exit_code":0}}
//! ```

use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE_NAME: &str = "script-exec.jsonl";

/// Guard that must be kept alive for the duration of the program.
/// Dropping this guard will flush and close the log file.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Options for [`init`].
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Directory for the JSONL file. `None` uses the default data directory.
    pub log_dir: Option<PathBuf>,
    /// Write the JSONL file at all.
    pub file: bool,
    /// Filter used when `RUST_LOG` is not set.
    pub default_filter: String,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_dir: None,
            file: true,
            default_filter: "info".to_string(),
        }
    }
}

/// Initialize the dual-output logging system.
///
/// Returns a guard that MUST be kept alive for the duration of the program.
/// If the log file can't be opened, logging continues on stderr only.
pub fn init(options: LogOptions) -> LoggingGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

    // Pretty layer for stderr
    let pretty_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(false)
        .compact();

    let log_path = options
        .file
        .then(|| options.log_dir.clone().unwrap_or_else(get_log_dir))
        .and_then(|dir| match fs::create_dir_all(&dir) {
            Ok(()) => Some(dir.join(LOG_FILE_NAME)),
            Err(e) => {
                eprintln!("[LOGGING] Failed to create log directory: {}", e);
                None
            }
        });

    let file = log_path.as_ref().and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("[LOGGING] Failed to open log file: {}", e))
            .ok()
    });

    let (json_layer, file_guard) = match file {
        Some(file) => {
            // Non-blocking writer so a slow disk never stalls the controller
            let (non_blocking_file, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .json()
                .with_writer(non_blocking_file)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_span_events(FmtSpan::NONE);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // try_init: a second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init();

    if let Some(path) = &log_path {
        tracing::info!(
            event_type = "app_lifecycle",
            action = "started",
            log_path = %path.display(),
            "Logging initialized"
        );
    }

    LoggingGuard {
        _file_guard: file_guard,
    }
}

/// Get the default log directory (`<data dir>/script-exec/logs`)
fn get_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("script-exec").join("logs"))
        .unwrap_or_else(|| std::env::temp_dir().join("script-exec-logs"))
}

/// Get the path to the default JSONL log file
pub fn log_path() -> PathBuf {
    get_log_dir().join(LOG_FILE_NAME)
}

/// Category-tagged log line.
///
/// Prefer tracing macros with structured fields where there is data to attach:
/// ```rust
/// tracing::info!(category = "EXEC", pid = 42, "Process spawned");
/// ```
pub fn log(category: &str, message: &str) {
    tracing::info!(category = category, "{}", message);
}

/// Log a run lifecycle event with structured fields
pub fn log_run_event(run_id: u64, action: &str, duration_ms: Option<u64>, exit_code: Option<i32>) {
    tracing::info!(
        event_type = "run_event",
        run_id = run_id,
        action = action,
        duration_ms = duration_ms,
        exit_code = exit_code,
        "Run {} {}", run_id, action
    );
}

/// Log an error with structured fields and context
pub fn log_error(category: &str, error: &str, context: Option<&str>) {
    let msg = match context {
        Some(ctx) => format!("{}: {} (context: {})", category, error, ctx),
        None => format!("{}: {}", category, error),
    };

    tracing::error!(
        event_type = "error",
        category = category,
        error_message = error,
        context = context,
        "{}", msg
    );
}
