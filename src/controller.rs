//! Execution controller
//!
//! The state machine tying launchers, the job queue and the output router
//! together. It owns the single active run and reacts to exactly one inbox:
//! launcher events (tagged with their run id), trigger wake-ups, cancel,
//! quit and close requests all arrive there, in order. The only time it
//! waits with a timeout is while a cancellation deadline is pending.
//!
//! A run that needs authorization stays in `Starting` until its launcher
//! reports `Authorized`; the inbox is serviced as usual meanwhile, so quit
//! and cancel withdraw the request.
//!
//! ```text
//! Idle ──dequeue──▶ Starting ──ok──▶ Running ──exit──▶ Finished ─┐
//!   ▲                  │                │                         │
//!   │         error/refused          cancel                       │
//!   │                  ▼                ▼                         │
//!   └──── remain ── Failed         Cancelling ──exit/deadline─────┘
//! ```

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::WrapperConfig;
use crate::error::{Result, ResultExt};
use crate::executor::{
    ActiveRun, CancelOutcome, ExitReport, Launcher, OutputSink, PrivilegedLauncher, ProcessEvent,
    ProcessLauncher, RunId, TaggedEvent,
};
use crate::job::{Job, ResolvedCommand};
use crate::logging;
use crate::output::{OutputRouter, OutputSurface};
use crate::queue::{EnqueueOutcome, JobQueue};

/// Extra time after the kill escalation before an exit report is synthesized
const CANCEL_SETTLE_MARGIN: Duration = Duration::from_millis(750);

/// Wrapper exit status for an engine that never got a run going
const EXIT_CODE_FAILED: i32 = 1;

/// Engine-wide execution status; exactly one at a time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Cancelling,
    Finished(ExitReport),
    Failed(String),
}

/// Notifications for the UI chrome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    RunStarted {
        run_id: RunId,
        pid: Option<u32>,
        args: Vec<String>,
    },
    RunFinished {
        run_id: RunId,
        report: ExitReport,
    },
    RunFailed {
        run_id: RunId,
        reason: String,
    },
    QueueDepthChanged {
        depth: usize,
    },
    /// Some output of this run could not be decoded (reported once per run)
    DecodeWarning {
        run_id: RunId,
    },
    /// The run could not be signalled and may keep running
    CancelUnconfirmed {
        run_id: RunId,
    },
    TriggerRejected {
        reason: String,
    },
}

/// How the engine ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOutcome {
    /// Status for the wrapper process itself (0..=255)
    pub exit_code: i32,
    /// Runs that actually started
    pub runs: u64,
}

/// Policy knobs the controller needs beyond the command itself
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub remain_running: bool,
    /// More triggers can arrive after a run (drop target or a control stream)
    pub accepts_triggers: bool,
    pub cancel_grace: Duration,
    pub save_output_path: Option<PathBuf>,
}

impl EngineOptions {
    pub fn from_config(config: &WrapperConfig) -> Self {
        Self {
            remain_running: config.remain_running,
            accepts_triggers: config.get_accepts_drops(),
            cancel_grace: config.get_cancel_grace(),
            save_output_path: config.get_save_output_path(),
        }
    }
}

enum EngineEvent {
    Process(TaggedEvent),
    /// A job was queued
    Wake,
    Cancel,
    Quit,
    Close,
}

/// Cloneable trigger side of the engine, usable from any thread
#[derive(Clone)]
pub struct EngineHandle {
    queue: Arc<Mutex<JobQueue>>,
    inbox: Sender<EngineEvent>,
    status: async_channel::Sender<EngineStatus>,
}

impl EngineHandle {
    /// Queue `job`. Rejections are reported on the status stream as well.
    pub fn submit(&self, job: Job) -> Result<EnqueueOutcome> {
        let result = self.queue.lock().enqueue(job, Instant::now());
        match &result {
            Ok(outcome) => {
                debug!(depth = outcome.depth(), ?outcome, "Job submitted");
                publish(
                    &self.status,
                    EngineStatus::QueueDepthChanged {
                        depth: outcome.depth(),
                    },
                );
                // Controller gone means the engine has terminated
                let _ = self.inbox.send(EngineEvent::Wake);
            }
            Err(e) => {
                warn!(error = %e, "Trigger rejected");
                publish(
                    &self.status,
                    EngineStatus::TriggerRejected {
                        reason: e.user_message(),
                    },
                );
            }
        }
        result
    }

    /// Cancel the active run, if any
    pub fn cancel(&self) {
        let _ = self.inbox.send(EngineEvent::Cancel);
    }

    /// Stop: cancel the active run, discard pending jobs, exit with 0
    pub fn quit(&self) {
        let _ = self.inbox.send(EngineEvent::Quit);
    }

    /// Accept no more triggers; run what is queued, then exit with 0
    pub fn close(&self) {
        let _ = self.inbox.send(EngineEvent::Close);
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("depth", &self.queue_depth())
            .finish()
    }
}

fn publish(status: &async_channel::Sender<EngineStatus>, event: EngineStatus) {
    // Nobody listening is fine; the stream is unbounded so this never blocks
    let _ = status.try_send(event);
}

/// The run currently owned by the controller
struct CurrentRun {
    id: RunId,
    run: Box<dyn ActiveRun>,
    args: Vec<String>,
    /// Came from the wrapper's own launch
    initial: bool,
    /// Past `Starting`
    running: bool,
    started: Instant,
    cancel_deadline: Option<Instant>,
}

/// Decisions that outlive a single run
#[derive(Debug, Default)]
struct Flow {
    /// The initial job has not been attempted yet
    initial_pending: bool,
    /// Explicit quit request
    quit: bool,
    /// The script printed a quit directive
    quit_after_run: bool,
    /// No more triggers will be accepted
    closing: bool,
    /// At least one job was attempted
    attempted: bool,
    last_exit: i32,
}

pub struct ExecutionController {
    command: ResolvedCommand,
    launcher: Box<dyn Launcher>,
    router: OutputRouter,
    options: EngineOptions,
    queue: Arc<Mutex<JobQueue>>,
    inbox_tx: Sender<EngineEvent>,
    inbox_rx: Receiver<EngineEvent>,
    status_tx: async_channel::Sender<EngineStatus>,
    status_rx: Option<async_channel::Receiver<EngineStatus>>,
    state: RunState,
    current: Option<CurrentRun>,
    next_run_id: RunId,
    runs: u64,
}

impl ExecutionController {
    pub fn new(
        command: ResolvedCommand,
        launcher: Box<dyn Launcher>,
        router: OutputRouter,
        queue: JobQueue,
        options: EngineOptions,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel();
        let (status_tx, status_rx) = async_channel::unbounded();
        Self {
            command,
            launcher,
            router,
            options,
            queue: Arc::new(Mutex::new(queue)),
            inbox_tx,
            inbox_rx,
            status_tx,
            status_rx: Some(status_rx),
            state: RunState::Idle,
            current: None,
            next_run_id: 1,
            runs: 0,
        }
    }

    /// Build the engine a wrapper config describes, showing output on `surface`
    pub fn from_config(config: &WrapperConfig, surface: Box<dyn OutputSurface>) -> Result<Self> {
        let command = crate::config::resolve_command(config)?;

        let launcher: Box<dyn Launcher> = if config.privileged {
            Box::new(PrivilegedLauncher::new(
                config.elevation.get_helper(),
                config.text_encoding,
                config.elevation.get_denial_exit_codes(),
                config.elevation.get_poll_interval(),
            ))
        } else {
            Box::new(ProcessLauncher::new(
                config.text_encoding,
                config.get_cancel_grace(),
            ))
        };

        let router = OutputRouter::new(config.presentation, surface);
        let queue = JobQueue::new(config.get_queue_capacity(), config.get_coalesce_window());

        info!(
            launcher = launcher.kind(),
            presentation = ?config.presentation,
            remain_running = config.remain_running,
            capacity = queue.capacity(),
            "Engine configured"
        );
        Ok(Self::new(
            command,
            launcher,
            router,
            queue,
            EngineOptions::from_config(config),
        ))
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            queue: self.queue.clone(),
            inbox: self.inbox_tx.clone(),
            status: self.status_tx.clone(),
        }
    }

    /// Status stream receiver. Receivers share one stream; each status is
    /// delivered to one of them.
    pub fn subscribe(&self) -> Option<async_channel::Receiver<EngineStatus>> {
        self.status_rx.clone()
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Keep the engine alive between runs for an external trigger source
    pub fn set_accepts_triggers(&mut self, accepts: bool) {
        self.options.accepts_triggers = accepts;
    }

    /// Drive the engine until it terminates.
    ///
    /// `initial` is the job from the wrapper's own launch; a failure to start
    /// it ends the engine with a non-zero status whatever the configuration.
    #[instrument(name = "engine", skip_all)]
    pub fn run(mut self, initial: Option<Job>) -> EngineOutcome {
        // From here on statuses only go to receivers handed out earlier
        self.status_rx = None;

        let mut flow = Flow {
            initial_pending: initial.is_some(),
            ..Default::default()
        };
        if let Some(job) = initial {
            // Ahead of anything a trigger source queued already
            let queued = self.queue.lock().enqueue_first(job);
            match queued {
                Ok(depth) => publish(&self.status_tx, EngineStatus::QueueDepthChanged { depth }),
                Err(e) => {
                    logging::log_error("ENGINE", &e.to_string(), Some("initial job"));
                    return self.outcome(EXIT_CODE_FAILED);
                }
            }
        }

        loop {
            if self.current.is_none() {
                if let Some(exit_code) = self.start_next(&mut flow) {
                    return self.outcome(exit_code);
                }
            }

            let event = match self.next_event() {
                Some(event) => event,
                None => {
                    if let Some(exit_code) = self.cancel_deadline_passed(&mut flow) {
                        return self.outcome(exit_code);
                    }
                    continue;
                }
            };

            if let Some(exit_code) = self.handle_event(event, &mut flow) {
                return self.outcome(exit_code);
            }
        }
    }

    fn outcome(&mut self, exit_code: i32) -> EngineOutcome {
        self.queue.lock().close();
        let outcome = EngineOutcome {
            exit_code,
            runs: self.runs,
        };
        info!(exit_code, runs = self.runs, "Engine terminated");
        outcome
    }

    /// Blocks for the next inbox event. `None` means the cancel deadline of
    /// the current run passed first.
    fn next_event(&self) -> Option<EngineEvent> {
        let deadline = self.current.as_ref().and_then(|c| c.cancel_deadline);
        match deadline {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match self.inbox_rx.recv_timeout(wait) {
                    Ok(event) => Some(event),
                    Err(RecvTimeoutError::Timeout) => None,
                    // We hold a sender ourselves, so this cannot happen
                    Err(RecvTimeoutError::Disconnected) => None,
                }
            }
            // Same here: recv only fails once every sender is gone
            None => self.inbox_rx.recv().ok(),
        }
    }

    /// Idle: start queued jobs until one is running, or decide to terminate.
    /// Returns the exit code when the engine should stop.
    fn start_next(&mut self, flow: &mut Flow) -> Option<i32> {
        loop {
            if flow.quit {
                return Some(0);
            }

            let job = {
                let mut queue = self.queue.lock();
                let job = queue.dequeue();
                if job.is_some() {
                    queue.set_busy(true);
                    if !self.options.remain_running {
                        queue.close();
                    }
                }
                job
            };

            let Some(job) = job else {
                self.state = RunState::Idle;
                return self.idle_verdict(flow);
            };
            publish(
                &self.status_tx,
                EngineStatus::QueueDepthChanged {
                    depth: self.queue.lock().len(),
                },
            );

            let initial = std::mem::take(&mut flow.initial_pending);
            flow.attempted = true;
            if self.start(job, initial).is_ok() {
                return None;
            }
            if let Some(exit_code) = self.start_failed(initial, flow) {
                return Some(exit_code);
            }
            // Failed → Idle; try whatever else is queued
        }
    }

    /// A job never got running. Returns the exit code when that ends the engine.
    fn start_failed(&mut self, initial: bool, flow: &mut Flow) -> Option<i32> {
        self.queue.lock().set_busy(false);
        flow.last_exit = EXIT_CODE_FAILED;
        if flow.quit {
            return Some(0);
        }
        if initial || !self.options.remain_running {
            warn!(initial, "Start failed, terminating");
            return Some(EXIT_CODE_FAILED);
        }
        None
    }

    /// Nothing queued: wait for triggers or stop
    fn idle_verdict(&self, flow: &Flow) -> Option<i32> {
        if flow.closing {
            return Some(0);
        }
        if !flow.attempted {
            return None;
        }
        if self.options.remain_running && self.options.accepts_triggers {
            return None;
        }
        Some(flow.last_exit)
    }

    fn start(&mut self, job: Job, initial: bool) -> Result<()> {
        let run_id = self.next_run_id;
        self.next_run_id += 1;
        self.state = RunState::Starting;
        self.router.begin_run();

        let invocation = self.command.invocation_for(&job);
        let inbox = self.inbox_tx.clone();
        let sink = OutputSink::with_delivery(run_id, move |event| {
            inbox.send(EngineEvent::Process(event)).is_ok()
        });

        let run = self
            .launcher
            .launch(&invocation, job.stdin(), sink)
            .inspect_err(|e| self.report_failure(run_id, e.user_message()))?;
        let authorizing = run.awaits_authorization();
        let pid = run.pid();
        self.current = Some(CurrentRun {
            id: run_id,
            run,
            args: job.args().to_vec(),
            initial,
            running: false,
            started: Instant::now(),
            cancel_deadline: None,
        });
        if authorizing {
            debug!(run_id, "Waiting for authorization");
        } else {
            self.mark_running(pid);
        }
        Ok(())
    }

    /// Starting → Running (or Cancelling, if cancel came first)
    fn mark_running(&mut self, pid: Option<u32>) {
        let Some(current) = self.current.as_mut().filter(|c| !c.running) else {
            return;
        };
        current.running = true;
        current.started = Instant::now();
        self.runs += 1;
        self.state = if current.cancel_deadline.is_some() {
            RunState::Cancelling
        } else {
            RunState::Running
        };
        logging::log_run_event(current.id, "started", None, None);
        publish(
            &self.status_tx,
            EngineStatus::RunStarted {
                run_id: current.id,
                pid: pid.or_else(|| current.run.pid()),
                args: current.args.clone(),
            },
        );
    }

    /// Starting → Failed
    fn report_failure(&mut self, run_id: RunId, reason: String) {
        logging::log_error("ENGINE", &reason, Some(self.launcher.kind()));
        self.state = RunState::Failed(reason.clone());
        publish(&self.status_tx, EngineStatus::RunFailed { run_id, reason });
    }

    /// The current run ended before it was authorized
    fn abandon_start(&mut self, reason: String, flow: &mut Flow) -> Option<i32> {
        let CurrentRun { id, run, initial, .. } = self.current.take()?;
        self.report_failure(id, reason);
        // Withdraws a request still pending
        drop(run);
        self.start_failed(initial, flow)
    }

    /// Returns the exit code when the engine should stop
    fn handle_event(&mut self, event: EngineEvent, flow: &mut Flow) -> Option<i32> {
        match event {
            EngineEvent::Process(TaggedEvent { run, event }) => {
                let Some(current_id) = self.current.as_ref().map(|c| c.id) else {
                    debug!(run_id = run, "Event from a finished run ignored");
                    return None;
                };
                if current_id != run {
                    debug!(run_id = run, current_id, "Event from a stale run ignored");
                    return None;
                }
                match event {
                    ProcessEvent::Authorized { pid } => {
                        self.mark_running(pid);
                        None
                    }
                    ProcessEvent::AuthorizationFailed(reason) => self.abandon_start(reason, flow),
                    ProcessEvent::Output(chunk) => {
                        let effects = self.router.route(&chunk);
                        if effects.decode_warning {
                            publish(&self.status_tx, EngineStatus::DecodeWarning { run_id: run });
                        }
                        flow.quit_after_run |= effects.quit_requested;
                        None
                    }
                    ProcessEvent::Exited(report) => self.finish(report, flow),
                }
            }
            EngineEvent::Wake => None,
            EngineEvent::Cancel => {
                self.request_cancel();
                None
            }
            EngineEvent::Quit => {
                info!("Quit requested");
                flow.quit = true;
                let discarded = {
                    let mut queue = self.queue.lock();
                    queue.close();
                    queue.clear()
                };
                if discarded > 0 {
                    info!(discarded, "Pending jobs discarded on quit");
                }
                self.request_cancel();
                // Idle: start_next sees the flag and stops
                None
            }
            EngineEvent::Close => {
                debug!("Trigger source closed");
                flow.closing = true;
                self.queue.lock().close();
                None
            }
        }
    }

    fn request_cancel(&mut self) {
        let grace = self.options.cancel_grace;
        let Some(current) = self.current.as_mut() else {
            debug!("Cancel requested while idle");
            return;
        };
        if current.cancel_deadline.is_some() {
            return;
        }

        if current.running {
            self.state = RunState::Cancelling;
        }
        current.cancel_deadline = Some(Instant::now() + grace + CANCEL_SETTLE_MARGIN);
        let run_id = current.id;
        match current.run.cancel() {
            CancelOutcome::Signalled => info!(run_id, "Cancel requested"),
            CancelOutcome::AlreadyExited => debug!(run_id, "Cancel raced with exit"),
            CancelOutcome::BestEffort => {
                warn!(run_id, "Cancel could not be confirmed");
                publish(&self.status_tx, EngineStatus::CancelUnconfirmed { run_id });
            }
        }
    }

    fn cancel_deadline_passed(&mut self, flow: &mut Flow) -> Option<i32> {
        let current = self.current.as_ref()?;
        let run_id = current.id;
        if !current.running {
            warn!(run_id, "Authorization request did not end after cancel");
            return self.abandon_start("authorization request cancelled".to_string(), flow);
        }
        warn!(run_id, "No exit after cancel; reporting the run as cancelled");
        self.finish(ExitReport::cancelled(), flow)
    }

    /// Running/Cancelling → Finished. Returns the exit code when the engine
    /// should stop.
    fn finish(&mut self, report: ExitReport, flow: &mut Flow) -> Option<i32> {
        let current = self.current.take()?;
        let effects = self.router.finish_run();
        flow.quit_after_run |= effects.quit_requested;

        let duration_ms = current.started.elapsed().as_millis() as u64;
        logging::log_run_event(current.id, "finished", Some(duration_ms), Some(report.code));

        if let Some(path) = &self.options.save_output_path {
            self.router.buffer().save_to(path).log_err();
        }

        self.queue.lock().set_busy(false);
        self.state = RunState::Finished(report);
        flow.last_exit = report.wrapper_exit_code();
        publish(
            &self.status_tx,
            EngineStatus::RunFinished {
                run_id: current.id,
                report,
            },
        );

        if flow.quit {
            return Some(0);
        }
        if flow.quit_after_run {
            info!(run_id = current.id, "Quitting after run as the script asked");
            return Some(flow.last_exit);
        }
        if !self.options.remain_running {
            let discarded = self.queue.lock().clear();
            if discarded > 0 {
                debug!(discarded, "Single-shot wrapper: pending jobs dropped");
            }
            return Some(flow.last_exit);
        }
        // Back to Idle; start_next re-evaluates the queue
        None
    }
}

impl std::fmt::Debug for ExecutionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionController")
            .field("state", &self.state)
            .field("launcher", &self.launcher.kind())
            .field("runs", &self.runs)
            .finish()
    }
}

#[cfg(all(test, unix))]
#[path = "controller_tests.rs"]
mod tests;
