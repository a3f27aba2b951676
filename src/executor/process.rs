//! Normal (unprivileged) script execution.
//!
//! The child's stdout and stderr share one pipe so the combined stream keeps
//! the order the process wrote it in. A reader thread per run decodes that
//! pipe into chunks until the child exits, takes what the child left in the
//! pipe, and only then publishes the exit report. A background descendant
//! that inherited the pipe does not hold the run open.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, ScriptExecError};
use crate::executor::decode::{ChunkDecoder, TextEncoding};
use crate::executor::launcher::{ActiveRun, CancelOutcome, ExitReport, Launcher, OutputSink};
use crate::job::Invocation;
use crate::logging;

#[cfg(unix)]
use std::os::unix::process::CommandExt;

/// Bytes per read from the output pipe
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// How often to check if the process group has exited during the grace period
const POLL_INTERVAL_MS: u64 = 25;

/// Longest wait for output before checking whether the child exited
const EXIT_POLL: Duration = Duration::from_millis(20);

/// Most bytes read in one pass, so a chatty descendant can't starve the
/// exit check
const DRAIN_PASS_LIMIT: usize = 256 * 1024;

#[cfg(unix)]
pub(crate) mod sys {
    use std::io;
    use std::os::fd::RawFd;
    use std::time::Duration;

    use libc::{c_int, pid_t};

    pub use libc::{SIGKILL, SIGTERM};

    /// `target > 0` is one process, `target < 0` a whole group
    fn deliver(target: pid_t, signal: c_int) -> io::Result<()> {
        // SAFETY: kill(2) takes no pointers
        if unsafe { libc::kill(target, signal) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub fn signal_group(pgid: u32, signal: c_int) -> io::Result<()> {
        deliver(-(pgid as pid_t), signal)
    }

    pub fn signal_process(pid: u32, signal: c_int) -> io::Result<()> {
        deliver(pid as pid_t, signal)
    }

    /// The target no longer exists
    pub fn is_gone(err: &io::Error) -> bool {
        err.raw_os_error() == Some(libc::ESRCH)
    }

    /// Check with signal 0. EPERM still means someone is there.
    pub fn group_alive(pgid: u32) -> bool {
        match deliver(-(pgid as pid_t), 0) {
            Ok(()) => true,
            Err(e) => !is_gone(&e),
        }
    }

    pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
        // SAFETY: fcntl(2) on a descriptor the caller owns
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Sleep until `fd` is readable (or hung up), at most `timeout`
    pub fn wait_readable(fd: RawFd, timeout: Duration) {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd for the duration of the call
        unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as c_int) };
    }
}

/// Handle on the process group of one child.
///
/// The child is spawned with `process_group(0)`, so its PID is also the PGID
/// and signals reach anything it spawned.
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    pgid: u32,
    /// Set by the reader thread once the leader has been reaped
    reaped: Arc<AtomicBool>,
}

impl ProcessGroup {
    pub fn new(pgid: u32) -> Self {
        Self {
            pgid,
            reaped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pgid(&self) -> u32 {
        self.pgid
    }

    fn mark_reaped(&self) {
        self.reaped.store(true, Ordering::SeqCst);
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::SeqCst)
    }

    /// Request termination and escalate in the background.
    ///
    /// ## Escalation Protocol
    /// 1. Send SIGTERM to the process group
    /// 2. A watchdog thread polls group liveness for up to `grace`
    /// 3. If still alive, send SIGKILL
    ///
    /// Returns immediately; the caller never waits for the grace period.
    pub fn terminate(&self, grace: Duration) -> CancelOutcome {
        if self.is_reaped() {
            logging::log(
                "EXEC",
                &format!("Process group {} already reaped, nothing to cancel", self.pgid),
            );
            return CancelOutcome::AlreadyExited;
        }

        #[cfg(unix)]
        {
            use sys::{group_alive, is_gone, signal_group, SIGKILL, SIGTERM};

            let pgid = self.pgid;
            match signal_group(pgid, SIGTERM) {
                Ok(()) => info!(pgid, "SIGTERM sent to process group"),
                Err(e) if is_gone(&e) => {
                    debug!(pgid, "Process group already exited");
                    return CancelOutcome::AlreadyExited;
                }
                // Still escalate below
                Err(e) => warn!(pgid, error = %e, "Failed to send SIGTERM"),
            }

            thread::spawn(move || {
                let start = std::time::Instant::now();
                let poll_interval = Duration::from_millis(POLL_INTERVAL_MS);

                while start.elapsed() < grace {
                    // The group, not the leader: grandchildren may linger
                    if !group_alive(pgid) {
                        debug!(pgid, "Process group terminated gracefully after SIGTERM");
                        return;
                    }
                    thread::sleep(poll_interval);
                }

                logging::log(
                    "EXEC",
                    &format!(
                        "Process group {} did not exit after {}ms, escalating to SIGKILL",
                        pgid,
                        grace.as_millis()
                    ),
                );
                match signal_group(pgid, SIGKILL) {
                    Ok(()) => info!(pgid, "Process group killed with SIGKILL"),
                    Err(e) if is_gone(&e) => debug!(pgid, "Process group exited just before SIGKILL"),
                    Err(e) => warn!(pgid, error = %e, "SIGKILL failed"),
                }
            });

            CancelOutcome::Signalled
        }

        #[cfg(not(unix))]
        {
            let _ = grace;
            logging::log(
                "EXEC",
                &format!("Non-Unix platform: cannot signal process {}", self.pgid),
            );
            CancelOutcome::BestEffort
        }
    }
}

/// Launches the interpreter directly as a child of the wrapper
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    encoding: TextEncoding,
    cancel_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(encoding: TextEncoding, cancel_grace: Duration) -> Self {
        Self {
            encoding,
            cancel_grace,
        }
    }
}

/// A running unprivileged child
#[derive(Debug)]
struct ChildRun {
    group: ProcessGroup,
    cancel_requested: Arc<AtomicBool>,
    grace: Duration,
}

impl ActiveRun for ChildRun {
    fn pid(&self) -> Option<u32> {
        Some(self.group.pgid())
    }

    fn cancel(&mut self) -> CancelOutcome {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.group.terminate(self.grace)
    }
}

impl Drop for ChildRun {
    fn drop(&mut self) {
        // Abandoned before the leader was reaped: don't leave it running
        #[cfg(unix)]
        if !self.group.is_reaped() {
            debug!(pgid = self.group.pgid(), "Active run dropped, killing process group");
            let _ = sys::signal_group(self.group.pgid(), sys::SIGKILL);
        }
    }
}

impl Launcher for ProcessLauncher {
    #[instrument(skip_all, fields(program = %invocation.program.display()))]
    fn launch(
        &self,
        invocation: &Invocation,
        stdin: Option<&str>,
        sink: OutputSink,
    ) -> Result<Box<dyn ActiveRun>> {
        invocation.validate()?;
        let program = invocation.program.display().to_string();

        let (output_reader, output_writer) = std::io::pipe()
            .map_err(|e| ScriptExecError::launch(&program, format!("cannot create pipe: {}", e)))?;

        let mut child = {
            let stderr_writer = output_writer.try_clone().map_err(|e| {
                ScriptExecError::launch(&program, format!("cannot duplicate pipe: {}", e))
            })?;

            let mut command = Command::new(&invocation.program);
            command
                .args(&invocation.args)
                .current_dir(&invocation.working_dir)
                .stdout(output_writer)
                .stderr(stderr_writer)
                .stdin(if stdin.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                });

            // New process group so cancellation reaches grandchildren too
            #[cfg(unix)]
            command.process_group(0);

            // `command` (and with it our copies of the write end) is dropped at
            // the end of this block, so EOF arrives once the child side closes
            command.spawn().map_err(|e| {
                error!(error = %e, program = %program, "Process spawn failed");
                ScriptExecError::launch(&program, e.to_string())
            })?
        };

        let pid = child.id();
        info!(pid, pgid = pid, run_id = sink.run_id(), "Process spawned");

        if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let payload = payload.to_owned();
            thread::spawn(move || {
                // A script that never reads stdin closes the pipe early
                if let Err(e) = pipe.write_all(payload.as_bytes()) {
                    debug!(pid, error = %e, "stdin payload not fully delivered");
                }
            });
        }

        let group = ProcessGroup::new(pid);
        let cancel_requested = Arc::new(AtomicBool::new(false));

        let reader_group = group.clone();
        let reader_cancel = cancel_requested.clone();
        let encoding = self.encoding;
        // Dropping this on a failed reader spawn kills the child again
        let run = ChildRun {
            group,
            cancel_requested,
            grace: self.cancel_grace,
        };
        thread::Builder::new()
            .name(format!("script-output-{}", pid))
            .spawn(move || {
                let report = match pump_until_exit(&mut child, output_reader, encoding, &sink) {
                    Ok(status) => {
                        ExitReport::from_status(status, reader_cancel.load(Ordering::SeqCst))
                    }
                    Err(e) => {
                        error!(pid, error = %e, "Failed to wait for script process");
                        ExitReport::crashed(0)
                    }
                };
                reader_group.mark_reaped();
                debug!(pid, code = report.code, "Script process reaped");
                sink.exited(report);
            })
            .map_err(|e| ScriptExecError::launch(&program, format!("cannot start reader: {}", e)))?;

        Ok(Box::new(run))
    }

    fn kind(&self) -> &'static str {
        "process"
    }
}

/// How a [`drain`] pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadEnd {
    /// End of file, or a read error
    Eof,
    /// Nothing more right now (or the byte limit was reached)
    Again,
}

/// Read what `source` has, publishing decoded chunks in arrival order
pub(crate) fn drain(
    source: &mut impl Read,
    decoder: &mut ChunkDecoder,
    buf: &mut [u8],
    sink: &OutputSink,
    limit: usize,
) -> ReadEnd {
    let mut taken = 0;
    while taken < limit {
        match source.read(buf) {
            Ok(0) => return ReadEnd::Eof,
            Ok(n) => {
                taken += n;
                // A gone controller is no reason to stop draining the child
                if let Some(chunk) = decoder.decode(&buf[..n]) {
                    sink.output(chunk);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return ReadEnd::Again,
            Err(e) => {
                warn!(error = %e, "output read error");
                return ReadEnd::Eof;
            }
        }
    }
    ReadEnd::Again
}

/// Forward output until the child exits, then reap it
#[cfg(unix)]
fn pump_until_exit(
    child: &mut Child,
    mut pipe: std::io::PipeReader,
    encoding: TextEncoding,
    sink: &OutputSink,
) -> std::io::Result<ExitStatus> {
    use std::os::fd::AsRawFd;

    let mut decoder = ChunkDecoder::new(encoding);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let fd = pipe.as_raw_fd();
    let mut pipe_open = match sys::set_nonblocking(fd) {
        Ok(()) => true,
        Err(e) => {
            // Blocking reads would wait for every descendant; just reap
            warn!(error = %e, "Cannot make output pipe non-blocking");
            drain(&mut pipe, &mut decoder, &mut buf, sink, usize::MAX);
            false
        }
    };

    let status = loop {
        if !pipe_open {
            break child.wait()?;
        }
        sys::wait_readable(fd, EXIT_POLL);
        pipe_open = drain(&mut pipe, &mut decoder, &mut buf, sink, DRAIN_PASS_LIMIT) == ReadEnd::Again;
        if let Some(status) = child.try_wait()? {
            // Whatever the child wrote is in the pipe by now
            if pipe_open {
                drain(&mut pipe, &mut decoder, &mut buf, sink, DRAIN_PASS_LIMIT);
            }
            break status;
        }
    };

    if let Some(chunk) = decoder.finish() {
        sink.output(chunk);
    }
    Ok(status)
}

#[cfg(not(unix))]
fn pump_until_exit(
    child: &mut Child,
    mut pipe: std::io::PipeReader,
    encoding: TextEncoding,
    sink: &OutputSink,
) -> std::io::Result<ExitStatus> {
    let mut decoder = ChunkDecoder::new(encoding);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    drain(&mut pipe, &mut decoder, &mut buf, sink, usize::MAX);
    if let Some(chunk) = decoder.finish() {
        sink.output(chunk);
    }
    child.wait()
}
