//! Configuration module - Wrapper settings
//!
//! This module provides functionality for:
//! - Loading the wrapper settings written next to the script
//! - Default values for all policy knobs
//! - Resolving the fixed command line once at startup
//!
//! # Module Structure
//!
//! - `defaults` - All default constant values
//! - `types` - Configuration struct definitions (WrapperConfig, PresentationMode, etc.)
//! - `loader` - File system loading, parsing and command resolution

mod defaults;
mod loader;
mod types;

pub use defaults::{
    DEFAULT_CANCEL_GRACE_MS, DEFAULT_COALESCE_WINDOW_MS, DEFAULT_QUEUE_CAPACITY,
    QUEUE_CAPACITY_ENV,
};

pub use types::{ElevationConfig, PresentationMode, WrapperConfig};

pub use loader::{load_config, parse_config, resolve_command};

#[cfg(test)]
pub use defaults::{DEFAULT_DENIAL_EXIT_CODES, DEFAULT_ELEVATION_POLL_INTERVAL_MS};

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
