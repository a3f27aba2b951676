//! Jobs and the invocations derived from them.
//!
//! A [`Job`] is one request to run the script: the trailing arguments plus an
//! optional standard-input payload. The fixed part of the command line
//! (interpreter, its arguments, the script, the script's arguments) lives in
//! [`ResolvedCommand`], which is resolved once at startup. [`Invocation`] is
//! the concatenation of the two and is never stored beyond one launch.

use std::path::{Path, PathBuf};

use crate::error::{Result, ScriptExecError};

/// Where a job came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrigin {
    /// Arguments the wrapper itself was launched with
    Launch,
    /// Files dropped on (or opened with) a running wrapper
    DroppedFiles,
    /// Text dropped on a running wrapper; delivered on stdin
    DroppedText,
    /// Explicit run request from the control stream
    Request,
}

/// An immutable unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    args: Vec<String>,
    stdin: Option<String>,
    origin: JobOrigin,
}

impl Job {
    pub fn new(args: Vec<String>, stdin: Option<String>, origin: JobOrigin) -> Self {
        Self {
            args,
            stdin,
            origin,
        }
    }

    pub fn launch(args: Vec<String>, stdin: Option<String>) -> Self {
        Self::new(args, stdin, JobOrigin::Launch)
    }

    pub fn dropped_files(files: Vec<String>) -> Self {
        Self::new(files, None, JobOrigin::DroppedFiles)
    }

    pub fn dropped_text(text: String) -> Self {
        Self::new(Vec::new(), Some(text), JobOrigin::DroppedText)
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    pub fn origin(&self) -> JobOrigin {
        self.origin
    }

    /// Whether this job can absorb other file drops of the same gesture
    pub(crate) fn is_mergeable_drop(&self) -> bool {
        self.origin == JobOrigin::DroppedFiles && self.stdin.is_none()
    }

    /// Append the arguments of `other` that this job doesn't already carry.
    pub(crate) fn merge_args_from(&mut self, other: Job) {
        for arg in other.args {
            if !self.args.contains(&arg) {
                self.args.push(arg);
            }
        }
    }
}

/// The fixed head of every command line, resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub interpreter: PathBuf,
    pub interpreter_args: Vec<String>,
    pub script: PathBuf,
    pub script_args: Vec<String>,
    pub working_dir: PathBuf,
}

impl ResolvedCommand {
    /// Build the full invocation for `job`:
    /// `interpreter [interpreterArgs…] script [scriptArgs…] [jobArgs…]`
    pub fn invocation_for(&self, job: &Job) -> Invocation {
        let mut args = Vec::with_capacity(
            self.interpreter_args.len() + 1 + self.script_args.len() + job.args().len(),
        );
        args.extend(self.interpreter_args.iter().cloned());
        args.push(self.script.to_string_lossy().into_owned());
        args.extend(self.script_args.iter().cloned());
        args.extend(job.args().iter().cloned());

        Invocation {
            program: self.interpreter.clone(),
            args,
            working_dir: self.working_dir.clone(),
        }
    }
}

/// A fully assembled argument vector for one child process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl Invocation {
    /// `program` followed by every argument
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.to_string_lossy().into_owned());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Check that the program exists and is executable before anything is
    /// spawned.
    pub fn validate(&self) -> Result<()> {
        let program = self.program.display().to_string();
        let meta = std::fs::metadata(&self.program)
            .map_err(|e| ScriptExecError::launch(&program, format!("not found ({})", e)))?;

        if !meta.is_file() {
            return Err(ScriptExecError::launch(&program, "not a regular file"));
        }
        if !is_executable(&meta) {
            return Err(ScriptExecError::launch(&program, "not executable"));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

/// Which dropped items a wrapper accepts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropPolicy {
    /// File suffixes without the leading dot; `*` accepts anything
    pub suffixes: Vec<String>,
    pub accept_any: bool,
    pub accept_folders: bool,
}

impl DropPolicy {
    pub fn accepts(&self, path: &Path) -> bool {
        if self.accept_any || self.suffixes.iter().any(|s| s == "*") {
            return true;
        }
        if path.is_dir() {
            return self.accept_folders;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let name = name.to_lowercase();
        self.suffixes.iter().any(|suffix| {
            let suffix = suffix.trim_start_matches('.').to_lowercase();
            !suffix.is_empty() && name.ends_with(&format!(".{}", suffix))
        })
    }

    /// Keep the accepted paths, in drop order
    pub fn filter(&self, files: Vec<String>) -> Vec<String> {
        files
            .into_iter()
            .filter(|f| self.accepts(Path::new(f)))
            .collect()
    }
}
