//! Configuration type definitions
//!
//! This module contains all the struct and enum definitions for configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::defaults::*;
use crate::executor::{ElevationHelper, TextEncoding};
use crate::job::DropPolicy;

// ============================================
// PRESENTATION
// ============================================

/// How the wrapper presents script output. Fixed for the wrapper's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresentationMode {
    /// No visible output at all
    None,
    /// Progress bar with a collapsible details log
    ProgressIndicator,
    #[default]
    ScrollingLog,
    /// Output is a document (HTML, Markdown) re-rendered on every append
    RenderedDocument,
    /// Only the latest line, shown in a status item
    BackgroundIndicator,
    /// Invisible window that accepts dropped files and text
    DropTarget,
}

impl PresentationMode {
    /// Whether this mode keeps accepting new jobs between runs
    pub fn accepts_drops(&self) -> bool {
        matches!(self, Self::DropTarget)
    }
}

// ============================================
// ELEVATION
// ============================================

/// How elevated execution is requested
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElevationConfig {
    /// Command prefix for the helper, e.g. `["pkexec"]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helper: Option<Vec<String>>,
    /// Use `osascript ... with administrator privileges`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apple_script: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_exit_codes: Option<Vec<i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

impl ElevationConfig {
    /// Helper to use: an explicit prefix wins, then the AppleScript flag,
    /// then the platform default
    pub fn get_helper(&self) -> ElevationHelper {
        match (&self.helper, self.apple_script) {
            (Some(prefix), _) if !prefix.is_empty() => ElevationHelper::Prefix(prefix.clone()),
            (_, Some(true)) => ElevationHelper::AppleScript,
            (_, Some(false)) => ElevationHelper::Prefix(vec!["pkexec".to_string()]),
            _ => ElevationHelper::default(),
        }
    }

    pub fn get_denial_exit_codes(&self) -> Vec<i32> {
        self.denial_exit_codes
            .clone()
            .unwrap_or_else(|| DEFAULT_DENIAL_EXIT_CODES.to_vec())
    }

    pub fn get_poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms
                .unwrap_or(DEFAULT_ELEVATION_POLL_INTERVAL_MS),
        )
    }
}

// ============================================
// WRAPPER CONFIG
// ============================================

/// Everything the packaging step decided about this wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrapperConfig {
    /// Interpreter path or bare name looked up on PATH
    pub interpreter: String,
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    pub script: String,
    #[serde(default)]
    pub script_args: Vec<String>,

    #[serde(default)]
    pub presentation: PresentationMode,
    #[serde(default)]
    pub text_encoding: TextEncoding,

    /// Keep running after a job completes
    #[serde(default)]
    pub remain_running: bool,
    /// Run the script with administrator privileges
    #[serde(default)]
    pub privileged: bool,

    /// Accept dropped files and text (always on in drop-target mode)
    #[serde(default)]
    pub accepts_drops: bool,
    /// Accepted file suffixes, without the dot; `*` accepts anything
    #[serde(default)]
    pub drop_suffixes: Vec<String>,
    #[serde(default)]
    pub accept_any_drop: bool,
    #[serde(default)]
    pub accept_folders: bool,

    /// Working directory for the script (default: the script's directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coalesce_window_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_grace_ms: Option<u64>,

    #[serde(default)]
    pub elevation: ElevationConfig,

    /// File the rendered document is written to in rendered-document mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_path: Option<String>,
    /// File each run's output is saved to after it finishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_output_path: Option<String>,
}

impl WrapperConfig {
    /// Minimal config running `script` with `interpreter`
    pub fn new(interpreter: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            interpreter_args: Vec::new(),
            script: script.into(),
            script_args: Vec::new(),
            presentation: PresentationMode::default(),
            text_encoding: TextEncoding::default(),
            remain_running: false,
            privileged: false,
            accepts_drops: false,
            drop_suffixes: Vec::new(),
            accept_any_drop: false,
            accept_folders: false,
            working_directory: None,
            queue_capacity: None,
            coalesce_window_ms: None,
            cancel_grace_ms: None,
            elevation: ElevationConfig::default(),
            document_path: None,
            save_output_path: None,
        }
    }

    /// Queue bound, from the config, then the environment, then the default
    pub fn get_queue_capacity(&self) -> usize {
        self.queue_capacity
            .or_else(|| {
                std::env::var(QUEUE_CAPACITY_ENV)
                    .ok()
                    .and_then(|v| v.trim().parse().ok())
            })
            .unwrap_or(DEFAULT_QUEUE_CAPACITY)
            .max(1)
    }

    /// Coalescing only applies to drop-target wrappers
    pub fn get_coalesce_window(&self) -> Option<Duration> {
        if !self.presentation.accepts_drops() {
            return None;
        }
        let ms = self.coalesce_window_ms.unwrap_or(DEFAULT_COALESCE_WINDOW_MS);
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    pub fn get_cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms.unwrap_or(DEFAULT_CANCEL_GRACE_MS))
    }

    /// Whether drop/open events are turned into jobs at all
    pub fn get_accepts_drops(&self) -> bool {
        self.accepts_drops || self.presentation.accepts_drops()
    }

    pub fn drop_policy(&self) -> DropPolicy {
        DropPolicy {
            suffixes: self.drop_suffixes.clone(),
            accept_any: self.accept_any_drop,
            accept_folders: self.accept_folders,
        }
    }

    pub fn get_document_path(&self) -> Option<PathBuf> {
        self.document_path.as_deref().map(expand_path)
    }

    pub fn get_save_output_path(&self) -> Option<PathBuf> {
        self.save_output_path.as_deref().map(expand_path)
    }
}

/// Expand `~` and environment variables; unknown variables are left as-is
pub(crate) fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).as_ref()),
    }
}
