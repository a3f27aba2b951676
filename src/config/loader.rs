//! Configuration loading from file system
//!
//! Handles reading the wrapper's JSON settings file and resolving the fixed
//! part of the command line once, before the engine starts.

use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use super::types::{expand_path, WrapperConfig};
use crate::error::{Result, ScriptExecError};
use crate::job::ResolvedCommand;

/// Load the wrapper settings from `path` (`~` and `$VARS` are expanded).
///
/// Unlike a user preferences file there is no fallback: a wrapper without
/// its settings cannot know what to run.
#[instrument(name = "load_config", skip_all, fields(path = %path.as_ref().display()))]
pub fn load_config(path: impl AsRef<Path>) -> Result<WrapperConfig> {
    let config_path = expand_path(&path.as_ref().to_string_lossy());

    let contents =
        std::fs::read_to_string(&config_path).map_err(|source| ScriptExecError::ConfigRead {
            path: config_path.clone(),
            source,
        })?;

    let config = parse_config(&contents)?;
    info!(
        path = %config_path.display(),
        interpreter = %config.interpreter,
        script = %config.script,
        presentation = ?config.presentation,
        "Successfully loaded config"
    );
    Ok(config)
}

/// Parse and sanity-check settings JSON
pub fn parse_config(json: &str) -> Result<WrapperConfig> {
    let config: WrapperConfig = serde_json::from_str(json.trim()).map_err(|e| {
        warn!(error = %e, "Failed to parse config JSON");
        ScriptExecError::ConfigParse(e)
    })?;

    if config.interpreter.trim().is_empty() {
        return Err(ScriptExecError::Config("'interpreter' must not be empty".into()));
    }
    if config.script.trim().is_empty() {
        return Err(ScriptExecError::Config("'script' must not be empty".into()));
    }
    Ok(config)
}

/// Resolve interpreter, script and working directory to absolute paths.
///
/// Bare interpreter names are looked up on PATH. An interpreter path that
/// does not exist is kept as given: the launch attempt reports it.
#[instrument(skip_all)]
pub fn resolve_command(config: &WrapperConfig) -> Result<ResolvedCommand> {
    let interpreter = resolve_interpreter(&config.interpreter)?;
    let script = absolute(expand_path(&config.script))?;

    let working_dir = match config.working_directory.as_deref() {
        Some(dir) => absolute(expand_path(dir))?,
        None => match script.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::env::current_dir().map_err(|e| {
                ScriptExecError::Config(format!("cannot determine working directory: {}", e))
            })?,
        },
    };

    debug!(
        interpreter = %interpreter.display(),
        script = %script.display(),
        working_dir = %working_dir.display(),
        "Resolved command"
    );

    Ok(ResolvedCommand {
        interpreter,
        interpreter_args: config.interpreter_args.clone(),
        script,
        script_args: config.script_args.clone(),
        working_dir,
    })
}

fn resolve_interpreter(raw: &str) -> Result<PathBuf> {
    let expanded = expand_path(raw);
    if expanded.components().count() > 1 || expanded.is_absolute() {
        return absolute(expanded);
    }
    which::which(&expanded).map_err(|e| {
        ScriptExecError::launch(raw, format!("interpreter not found on PATH ({})", e))
    })
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    std::path::absolute(&path).map_err(|e| {
        ScriptExecError::Config(format!("cannot make '{}' absolute: {}", path.display(), e))
    })
}
