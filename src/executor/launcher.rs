//! The launcher capability shared by normal and privileged execution.
//!
//! Both launchers publish into the same [`OutputSink`]: zero or more
//! `ProcessEvent::Output` chunks in arrival order, then exactly one
//! `ProcessEvent::Exited`. A run that must be authorized first opens with
//! `Authorized`, or publishes only `AuthorizationFailed`. The controller never
//! needs to know which launcher produced them.

use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::error::Result;
use crate::executor::decode::OutputChunk;
use crate::job::Invocation;

/// Exit code reported for a run that ended because it was cancelled
pub const EXIT_CODE_CANCELLED: i32 = -1;
/// Exit code reported for a run killed by a signal nobody asked for
pub const EXIT_CODE_CRASHED: i32 = -2;

/// Identifies one run; events from an abandoned run are recognised by it
pub type RunId = u64;

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// The process exited by itself with this status code
    Exited,
    /// Terminated by a signal without a cancel request
    Crashed { signal: i32 },
    /// Ended after a cancel request (possibly a synthetic report)
    Cancelled,
}

/// Final status of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: i32,
    pub cause: ExitCause,
}

impl ExitReport {
    pub fn exited(code: i32) -> Self {
        Self {
            code,
            cause: ExitCause::Exited,
        }
    }

    pub fn crashed(signal: i32) -> Self {
        Self {
            code: EXIT_CODE_CRASHED,
            cause: ExitCause::Crashed { signal },
        }
    }

    pub fn cancelled() -> Self {
        Self {
            code: EXIT_CODE_CANCELLED,
            cause: ExitCause::Cancelled,
        }
    }

    /// Interpret a reaped child status. A cancel request wins over whatever
    /// the process returned.
    pub fn from_status(status: std::process::ExitStatus, cancel_requested: bool) -> Self {
        if cancel_requested {
            return Self::cancelled();
        }
        if let Some(code) = status.code() {
            return Self::exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::crashed(signal);
            }
        }
        Self::crashed(0)
    }

    pub fn success(&self) -> bool {
        self.cause == ExitCause::Exited && self.code == 0
    }

    /// Status the wrapper itself exits with when this was its last run
    pub fn wrapper_exit_code(&self) -> i32 {
        if self.code < 0 {
            1
        } else {
            self.code.min(255)
        }
    }
}

/// What a launcher publishes for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Elevation was granted and the run has begun
    Authorized { pid: Option<u32> },
    /// Elevation was refused or abandoned; nothing follows
    AuthorizationFailed(String),
    Output(OutputChunk),
    Exited(ExitReport),
}

/// How far a cancel request got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Termination was requested and will be escalated after the grace period
    Signalled,
    /// The process had already exited
    AlreadyExited,
    /// The process could not be signalled directly; it may run to completion
    BestEffort,
}

/// Event published on the controller's inbox by a launcher
#[derive(Debug)]
pub struct TaggedEvent {
    pub run: RunId,
    pub event: ProcessEvent,
}

/// Write side of a run's output channel
#[derive(Clone)]
pub struct OutputSink {
    run: RunId,
    deliver: Arc<dyn Fn(TaggedEvent) -> bool + Send + Sync>,
}

impl OutputSink {
    /// Publish straight into a channel of tagged events
    pub fn new(run: RunId, tx: Sender<TaggedEvent>) -> Self {
        Self::with_delivery(run, move |event| tx.send(event).is_ok())
    }

    /// Publish through `deliver`, which returns false once nobody listens
    pub fn with_delivery(
        run: RunId,
        deliver: impl Fn(TaggedEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            run,
            deliver: Arc::new(deliver),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run
    }

    /// Returns false once the receiving side is gone
    pub fn output(&self, chunk: OutputChunk) -> bool {
        self.send(ProcessEvent::Output(chunk))
    }

    pub fn exited(&self, report: ExitReport) -> bool {
        self.send(ProcessEvent::Exited(report))
    }

    pub fn authorized(&self, pid: Option<u32>) -> bool {
        self.send(ProcessEvent::Authorized { pid })
    }

    pub fn authorization_failed(&self, reason: String) -> bool {
        self.send(ProcessEvent::AuthorizationFailed(reason))
    }

    fn send(&self, event: ProcessEvent) -> bool {
        (self.deliver)(TaggedEvent {
            run: self.run,
            event,
        })
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink").field("run", &self.run).finish()
    }
}

/// A started process, owned by the controller for the run's duration
pub trait ActiveRun: Send {
    /// Process id of the child (or of the elevation helper)
    fn pid(&self) -> Option<u32>;

    /// Ask the process to stop. Never blocks for the grace period.
    fn cancel(&mut self) -> CancelOutcome;

    /// The run only begins once its `Authorized` event arrives
    fn awaits_authorization(&self) -> bool {
        false
    }
}

/// Starts processes for invocations
pub trait Launcher: Send {
    /// Start `invocation`, feeding `stdin` to it if present. On error nothing
    /// was spawned and nothing will ever be published on `sink`.
    fn launch(
        &self,
        invocation: &Invocation,
        stdin: Option<&str>,
        sink: OutputSink,
    ) -> Result<Box<dyn ActiveRun>>;

    /// Short name for logs
    fn kind(&self) -> &'static str;
}
