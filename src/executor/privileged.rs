//! Execution with elevated privileges.
//!
//! The elevated child is not our child: an OS elevation helper (`pkexec`, or
//! `osascript ... with administrator privileges` on macOS) starts it on our
//! behalf, so there is no inheritable pipe to read and no process we may
//! signal. The transport is a private staging directory instead:
//!
//! - `pid`: the elevated shell writes its PID here first thing; a non-empty
//!   file is our proof that authorization was granted
//! - `output`: combined stdout/stderr of the script, tailed while it runs
//! - `stdin`: the job's standard-input payload (empty when there is none)
//! - `status`: the script's exit code, written when it returns
//!
//! `launch` returns once the helper is spawned. The tail thread waits for
//! the PID file, publishes `Authorized` (or `AuthorizationFailed`), then
//! tails the output into the same [`OutputSink`] as the normal launcher.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, ScriptExecError};
use crate::executor::decode::{ChunkDecoder, TextEncoding};
use crate::executor::launcher::{ActiveRun, CancelOutcome, ExitReport, Launcher, OutputSink};
use crate::executor::process::drain;
use crate::job::Invocation;
use crate::logging;

#[cfg(unix)]
use crate::executor::process::sys;
#[cfg(unix)]
use std::os::unix::process::CommandExt;

/// Runs inside the elevated shell.
/// `$0` pid file, `$1` output file, `$2` stdin file, `$3` status file,
/// `$4` working directory, then the invocation itself.
const ELEVATED_WRAPPER: &str = r#"echo $$ > "$0"; out=$1; in=$2; st=$3; cd "$4" 2>"$out" || { echo 1 > "$st"; exit 1; }; shift 4; "$@" < "$in" > "$out" 2>&1; code=$?; echo $code > "$st"; exit $code"#;

/// osascript reports a cancelled authorization dialog with this error number
const APPLESCRIPT_USER_CANCELED: &str = "(-128)";

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// How the elevation request is made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElevationHelper {
    /// Prepend these words to the command line, e.g. `["pkexec"]`
    Prefix(Vec<String>),
    /// `osascript -e 'do shell script "..." with administrator privileges'`
    AppleScript,
}

impl Default for ElevationHelper {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Self::AppleScript
        } else {
            Self::Prefix(vec!["pkexec".to_string()])
        }
    }
}

impl ElevationHelper {
    /// Full argv of the helper process that runs `inner` elevated
    fn command_line(&self, inner: &[String]) -> Vec<String> {
        match self {
            Self::Prefix(prefix) => prefix.iter().chain(inner.iter()).cloned().collect(),
            Self::AppleScript => {
                let shell_line = inner
                    .iter()
                    .map(|arg| shell_quote(arg))
                    .collect::<Vec<_>>()
                    .join(" ");
                vec![
                    "osascript".to_string(),
                    "-e".to_string(),
                    format!(
                        "do shell script \"{}\" with administrator privileges",
                        applescript_escape(&shell_line)
                    ),
                ]
            }
        }
    }
}

/// Single-quote `arg` for a POSIX shell
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

fn applescript_escape(s: &str) -> String {
    s.replace('\\', r"\\").replace('"', "\\\"")
}

/// Launches the interpreter through an OS elevation helper
#[derive(Debug, Clone)]
pub struct PrivilegedLauncher {
    helper: ElevationHelper,
    encoding: TextEncoding,
    /// Helper exit codes that mean the user refused
    denial_exit_codes: Vec<i32>,
    poll_interval: Duration,
}

impl PrivilegedLauncher {
    pub fn new(
        helper: ElevationHelper,
        encoding: TextEncoding,
        denial_exit_codes: Vec<i32>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            helper,
            encoding,
            denial_exit_codes,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }
}

/// Authorization error for a helper that exited before the elevated shell
/// reported its PID
fn classify_refusal(denial_exit_codes: &[i32], code: Option<i32>, stderr: &str) -> ScriptExecError {
    let denied =
        code.is_some_and(|c| denial_exit_codes.contains(&c)) || stderr.contains(APPLESCRIPT_USER_CANCELED);
    let message = if denied {
        "request denied".to_string()
    } else {
        match code {
            Some(c) => format!("elevation helper failed with exit code {}", c),
            None => "elevation helper was terminated".to_string(),
        }
    };
    match stderr.trim() {
        "" => ScriptExecError::Authorization(message),
        detail => ScriptExecError::Authorization(format!("{} ({})", message, detail)),
    }
}

fn read_helper_stderr(helper: &mut Child) -> String {
    let mut text = String::new();
    if let Some(mut stderr) = helper.stderr.take() {
        let _ = stderr.read_to_string(&mut text);
    }
    text
}

/// Private directory holding the four transport files
#[derive(Debug)]
struct Staging {
    dir: TempDir,
}

impl Staging {
    fn create(stdin: Option<&str>) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("script-exec-").tempdir()?;
        let staging = Self { dir };
        File::create(staging.pid_path())?;
        File::create(staging.output_path())?;
        File::create(staging.status_path())?;
        std::fs::write(staging.stdin_path(), stdin.unwrap_or_default())?;
        Ok(staging)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn pid_path(&self) -> PathBuf {
        self.path("pid")
    }

    fn output_path(&self) -> PathBuf {
        self.path("output")
    }

    fn stdin_path(&self) -> PathBuf {
        self.path("stdin")
    }

    fn status_path(&self) -> PathBuf {
        self.path("status")
    }

    fn read_pid(&self) -> Option<u32> {
        read_number(&self.pid_path())
    }

    fn read_status(&self) -> Option<i32> {
        read_number(&self.status_path())
    }

    /// argv of the command the helper must run elevated
    fn elevated_argv(&self, invocation: &Invocation) -> Vec<String> {
        let mut argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            ELEVATED_WRAPPER.to_string(),
        ];
        for path in [
            self.pid_path(),
            self.output_path(),
            self.stdin_path(),
            self.status_path(),
            invocation.working_dir.clone(),
        ] {
            argv.push(path.to_string_lossy().into_owned());
        }
        argv.extend(invocation.argv());
        argv
    }
}

fn read_number<T: std::str::FromStr>(path: &Path) -> Option<T> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Progress of one elevated run, shared with its tail thread
#[derive(Debug, Default)]
struct RunFlags {
    cancel_requested: AtomicBool,
    authorized: AtomicBool,
    finished: AtomicBool,
}

/// An elevated run, from the authorization request to its exit
#[derive(Debug)]
struct ElevatedRun {
    helper_pid: u32,
    staging: Arc<Staging>,
    flags: Arc<RunFlags>,
}

impl ActiveRun for ElevatedRun {
    fn pid(&self) -> Option<u32> {
        Some(self.helper_pid)
    }

    fn awaits_authorization(&self) -> bool {
        true
    }

    /// Before authorization the helper is still our own process group and is
    /// stopped outright. Afterwards we usually lack the permission to signal
    /// the elevated process, so this only ever tries.
    fn cancel(&mut self) -> CancelOutcome {
        if self.flags.finished.load(Ordering::SeqCst) {
            return CancelOutcome::AlreadyExited;
        }
        self.flags.cancel_requested.store(true, Ordering::SeqCst);

        #[cfg(unix)]
        {
            if !self.flags.authorized.load(Ordering::SeqCst) {
                return withdraw_request(self.helper_pid, sys::SIGTERM);
            }
            signal_elevated(&self.staging, self.helper_pid);
        }

        logging::log(
            "EXEC",
            &format!(
                "Cancel of elevated run (helper {}) is best effort",
                self.helper_pid
            ),
        );
        CancelOutcome::BestEffort
    }
}

impl Drop for ElevatedRun {
    fn drop(&mut self) {
        // Never leave an authorization prompt behind
        #[cfg(unix)]
        if !self.flags.authorized.load(Ordering::SeqCst) && !self.flags.finished.load(Ordering::SeqCst) {
            withdraw_request(self.helper_pid, sys::SIGKILL);
        }
    }
}

/// Signal the helper's process group while it still waits for authorization
#[cfg(unix)]
fn withdraw_request(helper_pid: u32, signal: libc::c_int) -> CancelOutcome {
    match sys::signal_group(helper_pid, signal) {
        Ok(()) => {
            info!(helper_pid, signal, "Authorization request withdrawn");
            CancelOutcome::Signalled
        }
        Err(e) if sys::is_gone(&e) => CancelOutcome::AlreadyExited,
        Err(e) => {
            warn!(helper_pid, error = %e, "Cannot stop elevation helper");
            CancelOutcome::BestEffort
        }
    }
}

/// SIGTERM to the elevated shell and to the helper, as far as we are allowed
#[cfg(unix)]
fn signal_elevated(staging: &Staging, helper_pid: u32) {
    if let Some(pid) = staging.read_pid() {
        match sys::signal_process(pid, sys::SIGTERM) {
            Ok(()) => info!(pid, "SIGTERM sent to elevated process"),
            Err(e) => warn!(pid, error = %e, "Cannot signal elevated process"),
        }
    }
    if let Err(e) = sys::signal_group(helper_pid, sys::SIGTERM) {
        debug!(pid = helper_pid, error = %e, "Cannot signal elevation helper");
    }
}

impl Launcher for PrivilegedLauncher {
    /// Returns as soon as the helper is spawned. Authorization is settled on
    /// the tail thread and reported as `Authorized` or `AuthorizationFailed`.
    #[instrument(skip_all, fields(program = %invocation.program.display()))]
    fn launch(
        &self,
        invocation: &Invocation,
        stdin: Option<&str>,
        sink: OutputSink,
    ) -> Result<Box<dyn ActiveRun>> {
        invocation.validate()?;
        let program = invocation.program.display().to_string();

        let staging = Staging::create(stdin).map_err(|e| {
            ScriptExecError::launch(&program, format!("cannot stage elevated run: {}", e))
        })?;

        let argv = self.helper.command_line(&staging.elevated_argv(invocation));
        let Some((helper_program, helper_args)) = argv.split_first() else {
            return Err(ScriptExecError::Authorization(
                "no elevation helper configured".to_string(),
            ));
        };

        let mut command = Command::new(helper_program);
        command
            .args(helper_args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let helper = command.spawn().map_err(|e| {
            error!(helper = %helper_program, error = %e, "Elevation helper spawn failed");
            ScriptExecError::Authorization(format!(
                "elevation helper '{}' unavailable: {}",
                helper_program, e
            ))
        })?;
        let helper_pid = helper.id();
        info!(helper_pid, helper = %helper_program, run_id = sink.run_id(), "Waiting for authorization");

        // Dropping this on a failed thread spawn withdraws the request
        let run = ElevatedRun {
            helper_pid,
            staging: Arc::new(staging),
            flags: Arc::new(RunFlags::default()),
        };
        let tail = TailJob {
            helper,
            staging: run.staging.clone(),
            flags: run.flags.clone(),
            denial_exit_codes: self.denial_exit_codes.clone(),
            encoding: self.encoding,
            poll_interval: self.poll_interval,
            sink,
        };
        thread::Builder::new()
            .name(format!("elevated-output-{}", helper_pid))
            .spawn(move || tail.run())
            .map_err(|e| ScriptExecError::launch(&program, format!("cannot start reader: {}", e)))?;

        Ok(Box::new(run))
    }

    fn kind(&self) -> &'static str {
        "privileged"
    }
}

/// State moved onto the tail thread
struct TailJob {
    helper: Child,
    staging: Arc<Staging>,
    flags: Arc<RunFlags>,
    denial_exit_codes: Vec<i32>,
    encoding: TextEncoding,
    poll_interval: Duration,
    sink: OutputSink,
}

impl TailJob {
    fn run(mut self) {
        if let Err(e) = self.await_authorization() {
            self.flags.finished.store(true, Ordering::SeqCst);
            let reason = if self.flags.cancel_requested.load(Ordering::SeqCst) {
                "authorization request cancelled".to_string()
            } else {
                e.user_message()
            };
            warn!(run_id = self.sink.run_id(), reason = %reason, "Elevated run not authorized");
            self.sink.authorization_failed(reason);
            return;
        }

        self.flags.authorized.store(true, Ordering::SeqCst);
        let pid = self.staging.read_pid();
        info!(helper_pid = self.helper.id(), pid = ?pid, run_id = self.sink.run_id(), "Elevated process authorized");
        self.sink.authorized(pid);

        // Cancelled while the prompt was up, and granted anyway
        #[cfg(unix)]
        if self.flags.cancel_requested.load(Ordering::SeqCst) {
            signal_elevated(&self.staging, self.helper.id());
        }
        self.tail();
    }

    /// Poll until the elevated shell has reported its PID (authorized) or
    /// the helper exited without doing so (denied, withdrawn or broken).
    fn await_authorization(&mut self) -> Result<()> {
        loop {
            if self.staging.read_pid().is_some() {
                return Ok(());
            }
            match self.helper.try_wait() {
                Ok(Some(status)) => {
                    // A very short script may have finished already
                    if self.staging.read_pid().is_some() {
                        return Ok(());
                    }
                    let stderr = read_helper_stderr(&mut self.helper);
                    return Err(classify_refusal(&self.denial_exit_codes, status.code(), &stderr));
                }
                Ok(None) => thread::sleep(self.poll_interval),
                Err(e) => {
                    return Err(ScriptExecError::Authorization(format!(
                        "lost track of elevation helper: {}",
                        e
                    )))
                }
            }
        }
    }

    fn tail(mut self) {
        let mut decoder = ChunkDecoder::new(self.encoding);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut output = match File::open(self.staging.output_path()) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(error = %e, "Cannot open elevated output file");
                None
            }
        };

        let helper_status = loop {
            let status = self.helper.try_wait();
            // Drain after observing the exit so nothing written before it is lost
            if let Some(file) = output.as_mut() {
                drain(file, &mut decoder, &mut buf, &self.sink, usize::MAX);
            }
            match status {
                Ok(Some(status)) => break Some(status),
                Ok(None) => thread::sleep(self.poll_interval),
                Err(e) => {
                    error!(error = %e, "Failed to wait for elevation helper");
                    break None;
                }
            }
        };

        if let Some(chunk) = decoder.finish() {
            self.sink.output(chunk);
        }

        let report = if self.flags.cancel_requested.load(Ordering::SeqCst) {
            ExitReport::cancelled()
        } else if let Some(code) = self.staging.read_status() {
            ExitReport::exited(code)
        } else {
            match helper_status {
                Some(status) => ExitReport::from_status(status, false),
                None => ExitReport::crashed(0),
            }
        };
        self.flags.finished.store(true, Ordering::SeqCst);
        debug!(code = report.code, "Elevated run finished");
        self.sink.exited(report);
    }
}
