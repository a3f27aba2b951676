use std::path::PathBuf;

use thiserror::Error;
use tracing::{error, warn};

/// Error severity for UI display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Info,     // informational, nothing went wrong
    Warning,  // recoverable, the engine keeps going
    Error,    // the current attempt failed
    Critical, // the wrapper cannot continue
}

/// Domain-specific errors for the script execution engine
#[derive(Error, Debug)]
pub enum ScriptExecError {
    /// The child process could not be created.
    #[error("Cannot launch '{program}': {message}")]
    Launch { program: String, message: String },

    /// Privilege elevation was denied by the user or is unavailable.
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// The job queue is full; the offending job was discarded.
    #[error("Job queue is full ({capacity} pending jobs)")]
    Capacity { capacity: usize },

    /// A trigger arrived after the engine stopped accepting work.
    #[error("The engine is no longer accepting jobs")]
    QueueClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read configuration '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl ScriptExecError {
    pub fn launch(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Launch {
            program: program.into(),
            message: message.into(),
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Launch { .. } => ErrorSeverity::Error,
            Self::Authorization(_) => ErrorSeverity::Error,
            Self::Capacity { .. } => ErrorSeverity::Warning,
            Self::QueueClosed => ErrorSeverity::Info,
            Self::Config(_) => ErrorSeverity::Critical,
            Self::ConfigRead { .. } => ErrorSeverity::Critical,
            Self::ConfigParse(_) => ErrorSeverity::Critical,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::Launch { program, message } => {
                format!("Could not start {}: {}", program, message)
            }
            Self::Authorization(msg) => format!("Administrator privileges not granted: {}", msg),
            Self::Capacity { capacity } => format!(
                "Too many pending jobs (limit {}). The dropped items were ignored.",
                capacity
            ),
            Self::QueueClosed => "The application is shutting down.".to_string(),
            Self::Config(msg) => format!("Configuration issue: {}", msg),
            Self::ConfigRead { path, .. } => {
                format!("Could not read settings from {}", path.display())
            }
            Self::ConfigParse(e) => format!("Invalid settings file: {}", e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScriptExecError>;

/// Extension trait for silent error logging with caller location tracking.
/// Use when the operation is recoverable and the user doesn't need to know.
///
/// # Examples
///
/// ```ignore
/// use script_exec::error::ResultExt;
///
/// // Keep going if the document file can't be written
/// write_document(&path, &contents).log_err();
///
/// // Log as warning for expected failures
/// status_tx.try_send(status).warn_on_err();
/// ```
pub trait ResultExt<T> {
    /// Log error with caller location and return None. Use for recoverable failures.
    fn log_err(self) -> Option<T>;
    /// Log as warning with caller location and return None. Use for expected failures.
    fn warn_on_err(self) -> Option<T>;
}

impl<T, E: std::fmt::Debug> ResultExt<T> for std::result::Result<T, E> {
    #[track_caller]
    fn log_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                error!(
                    error = ?error,
                    file = caller.file(),
                    line = caller.line(),
                    "Operation failed"
                );
                None
            }
        }
    }

    #[track_caller]
    fn warn_on_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                warn!(
                    error = ?error,
                    file = caller.file(),
                    line = caller.line(),
                    "Operation had warning"
                );
                None
            }
        }
    }
}
