//! Runtime triggers via a control stream.
//!
//! The thin UI layer (or a test harness) drives a running wrapper by writing
//! JSONL trigger commands to the control stream, one per line:
//!
//! ```json
//! {"type": "open", "files": ["/path/a.txt", "/path/b.txt"]}
//! {"type": "dropText", "text": "some dropped text"}
//! {"type": "run", "args": ["--flag"], "stdin": "payload"}
//! {"type": "cancel"}
//! {"type": "quit"}
//! {"type": "close"}
//! ```
//!
//! End of the stream means no more triggers will come: the engine runs what
//! is queued and exits.
//!
//! # Example Usage
//!
//! ```bash
//! # Drop two files on a running drop-target wrapper
//! echo '{"type": "open", "files": ["/tmp/a.png", "/tmp/b.png"]}' | script-exec --config app.json --control -
//! ```

use std::io::BufRead;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::controller::EngineHandle;
use crate::error::Result;
use crate::job::{DropPolicy, Job, JobOrigin};
use crate::logging;
use crate::queue::EnqueueOutcome;

/// Control-stream commands
///
/// All commands support an optional `requestId` field for correlation in logs.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TriggerCommand {
    /// Files dropped on (or opened with) the wrapper
    Open {
        files: Vec<String>,
        #[serde(default, rename = "requestId")]
        request_id: Option<String>,
    },
    /// Text dropped on the wrapper; becomes the script's stdin
    DropText {
        text: String,
        #[serde(default, rename = "requestId")]
        request_id: Option<String>,
    },
    /// Run the script again with these arguments
    Run {
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        stdin: Option<String>,
        #[serde(default, rename = "requestId")]
        request_id: Option<String>,
    },
    Cancel {
        #[serde(default, rename = "requestId")]
        request_id: Option<String>,
    },
    Quit {
        #[serde(default, rename = "requestId")]
        request_id: Option<String>,
    },
    /// No more triggers will follow
    Close {
        #[serde(default, rename = "requestId")]
        request_id: Option<String>,
    },
}

impl TriggerCommand {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Open { request_id, .. }
            | Self::DropText { request_id, .. }
            | Self::Run { request_id, .. }
            | Self::Cancel { request_id }
            | Self::Quit { request_id }
            | Self::Close { request_id } => request_id.as_deref(),
        }
    }
}

/// Read trigger commands from `reader` on a background thread.
///
/// Malformed lines are logged and skipped. The channel closes at end of
/// stream or on a read error.
pub fn start_trigger_listener<R>(reader: R) -> async_channel::Receiver<TriggerCommand>
where
    R: BufRead + Send + 'static,
{
    // Bounded: a flood of triggers backs up into the writer
    let (tx, rx) = async_channel::bounded(100);

    thread::spawn(move || {
        logging::log("TRIGGER", "Control stream listener started");

        let mut lines = reader.lines();
        let reason = loop {
            let line = match lines.next() {
                None => break "end of stream",
                Some(Err(e)) => {
                    warn!(error = %e, "Control stream read failed");
                    break "read error";
                }
                Some(Ok(line)) => line,
            };
            if line.trim().is_empty() {
                continue;
            }
            let cmd = match serde_json::from_str::<TriggerCommand>(&line) {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!(error = %e, line = %line, "Skipping malformed trigger");
                    continue;
                }
            };
            debug!(?cmd, "Trigger received");
            if tx.send_blocking(cmd).is_err() {
                break "dispatcher gone";
            }
        };
        logging::log("TRIGGER", &format!("Control stream listener stopped ({})", reason));
    });

    rx
}

/// Turns trigger commands into engine operations
#[derive(Debug, Clone)]
pub struct TriggerDispatcher {
    handle: EngineHandle,
    policy: DropPolicy,
    accepts_drops: bool,
}

impl TriggerDispatcher {
    pub fn new(handle: EngineHandle, policy: DropPolicy, accepts_drops: bool) -> Self {
        Self {
            handle,
            policy,
            accepts_drops,
        }
    }

    /// Apply one command. Returns the queue outcome when a job was submitted.
    pub fn dispatch(&self, cmd: TriggerCommand) -> Result<Option<EnqueueOutcome>> {
        let request_id = cmd.request_id().unwrap_or("-").to_string();
        let job = match cmd {
            TriggerCommand::Open { files, .. } => {
                if !self.accepts_drops {
                    info!(request_id = %request_id, "Drop ignored: wrapper does not accept drops");
                    return Ok(None);
                }
                let offered = files.len();
                let accepted = self.policy.filter(files);
                if accepted.is_empty() {
                    info!(request_id = %request_id, offered, "No dropped item is acceptable");
                    return Ok(None);
                }
                Job::dropped_files(accepted)
            }
            TriggerCommand::DropText { text, .. } => {
                if !self.accepts_drops {
                    info!(request_id = %request_id, "Text drop ignored: wrapper does not accept drops");
                    return Ok(None);
                }
                Job::dropped_text(text)
            }
            TriggerCommand::Run { args, stdin, .. } => Job::new(args, stdin, JobOrigin::Request),
            TriggerCommand::Cancel { .. } => {
                self.handle.cancel();
                return Ok(None);
            }
            TriggerCommand::Quit { .. } => {
                self.handle.quit();
                return Ok(None);
            }
            TriggerCommand::Close { .. } => {
                self.handle.close();
                return Ok(None);
            }
        };

        let outcome = self.handle.submit(job)?;
        debug!(request_id = %request_id, ?outcome, "Trigger queued");
        Ok(Some(outcome))
    }

    /// Dispatch everything from `commands` on a background thread; the
    /// engine is closed when the stream ends.
    pub fn spawn(self, commands: async_channel::Receiver<TriggerCommand>) -> JoinHandle<()> {
        thread::spawn(move || {
            while let Ok(cmd) = commands.recv_blocking() {
                // Rejections are already on the status stream
                let _ = self.dispatch(cmd);
            }
            logging::log("TRIGGER", "Trigger source ended, closing engine");
            self.handle.close();
        })
    }
}
