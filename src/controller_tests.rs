use super::*;
use crate::config::PresentationMode;
use crate::error::ScriptExecError;
use crate::executor::{ElevationHelper, ExitCause, OutputChunk, TextEncoding};
use crate::job::Invocation;
use crate::output::MemorySurface;
use std::thread::{self, JoinHandle};

const WAIT: Duration = Duration::from_secs(10);

// ============================================
// HARNESS
// ============================================

struct Harness {
    handle: EngineHandle,
    status: async_channel::Receiver<EngineStatus>,
    surface: MemorySurface,
    engine: JoinHandle<EngineOutcome>,
    seen: Vec<EngineStatus>,
}

impl Harness {
    fn start(controller: ExecutionController, surface: MemorySurface, initial: Option<Job>) -> Self {
        let handle = controller.handle();
        let status = controller.subscribe().unwrap();
        let engine = thread::spawn(move || controller.run(initial));
        Self {
            handle,
            status,
            surface,
            engine,
            seen: Vec::new(),
        }
    }

    /// Next status matching `pred`; everything received is kept in `seen`
    fn wait_for(&mut self, pred: impl Fn(&EngineStatus) -> bool) -> EngineStatus {
        let deadline = Instant::now() + WAIT;
        loop {
            match self.status.try_recv() {
                Ok(status) => {
                    self.seen.push(status.clone());
                    if pred(&status) {
                        return status;
                    }
                }
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
                Err(_) => panic!("status not observed in time; seen: {:?}", self.seen),
            }
        }
    }

    fn wait_finished(&mut self) -> ExitReport {
        match self.wait_for(|s| matches!(s, EngineStatus::RunFinished { .. })) {
            EngineStatus::RunFinished { report, .. } => report,
            _ => unreachable!(),
        }
    }

    fn wait_started(&mut self) -> Vec<String> {
        match self.wait_for(|s| matches!(s, EngineStatus::RunStarted { .. })) {
            EngineStatus::RunStarted { args, .. } => args,
            _ => unreachable!(),
        }
    }

    fn join(mut self) -> (EngineOutcome, Vec<EngineStatus>) {
        let deadline = Instant::now() + WAIT;
        while !self.engine.is_finished() {
            assert!(Instant::now() < deadline, "engine did not terminate");
            thread::sleep(Duration::from_millis(5));
        }
        let outcome = self.engine.join().unwrap();
        while let Ok(status) = self.status.try_recv() {
            self.seen.push(status);
        }
        (outcome, self.seen)
    }
}

fn shell_command(dir: &tempfile::TempDir, body: &str) -> ResolvedCommand {
    let script = dir.path().join("script.sh");
    std::fs::write(&script, body).unwrap();
    ResolvedCommand {
        interpreter: PathBuf::from("/bin/sh"),
        interpreter_args: Vec::new(),
        script,
        script_args: Vec::new(),
        working_dir: dir.path().to_path_buf(),
    }
}

fn options(remain_running: bool, accepts_triggers: bool) -> EngineOptions {
    EngineOptions {
        remain_running,
        accepts_triggers,
        cancel_grace: Duration::from_millis(200),
        save_output_path: None,
    }
}

fn engine(
    command: ResolvedCommand,
    launcher: Box<dyn Launcher>,
    mode: PresentationMode,
    queue: JobQueue,
    options: EngineOptions,
) -> (ExecutionController, MemorySurface) {
    let surface = MemorySurface::new();
    let router = OutputRouter::new(mode, Box::new(surface.clone()));
    (
        ExecutionController::new(command, launcher, router, queue, options),
        surface,
    )
}

fn shell_engine(
    dir: &tempfile::TempDir,
    body: &str,
    mode: PresentationMode,
    queue: JobQueue,
    options: EngineOptions,
) -> (ExecutionController, MemorySurface) {
    engine(
        shell_command(dir, body),
        Box::new(ProcessLauncher::new(TextEncoding::Utf8, options.cancel_grace)),
        mode,
        queue,
        options,
    )
}

fn started_args(statuses: &[EngineStatus]) -> Vec<Vec<String>> {
    statuses
        .iter()
        .filter_map(|s| match s {
            EngineStatus::RunStarted { args, .. } => Some(args.clone()),
            _ => None,
        })
        .collect()
}

/// Run lifecycle statuses must strictly alternate started/finished
fn assert_runs_never_overlap(statuses: &[EngineStatus]) {
    let mut running = false;
    for status in statuses {
        match status {
            EngineStatus::RunStarted { .. } => {
                assert!(!running, "a run started while another was active: {:?}", statuses);
                running = true;
            }
            EngineStatus::RunFinished { .. } => {
                assert!(running, "finish without start: {:?}", statuses);
                running = false;
            }
            _ => {}
        }
    }
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

// ============================================
// FAKE LAUNCHER
// ============================================

#[derive(Clone, Copy)]
enum Behaviour {
    /// Print the arguments and exit 0 straight away
    Echo,
    /// Never exit and ignore cancellation
    Hang,
    /// Wait for authorization; only a `grant` argument gets it
    Gated,
}

struct FakeLauncher(Behaviour);

struct FakeRun {
    sink: Option<OutputSink>,
    gated: bool,
}

impl ActiveRun for FakeRun {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn cancel(&mut self) -> CancelOutcome {
        match self.sink.take() {
            Some(sink) if self.gated => {
                sink.authorization_failed("authorization request cancelled".into());
                CancelOutcome::Signalled
            }
            sink => {
                self.sink = sink;
                CancelOutcome::BestEffort
            }
        }
    }

    fn awaits_authorization(&self) -> bool {
        self.gated
    }
}

impl Launcher for FakeLauncher {
    fn launch(
        &self,
        invocation: &Invocation,
        _stdin: Option<&str>,
        sink: OutputSink,
    ) -> Result<Box<dyn ActiveRun>> {
        if invocation.args.iter().any(|a| a == "fail") {
            return Err(ScriptExecError::launch("fake", "refused"));
        }
        match self.0 {
            Behaviour::Echo => {
                let text = format!("ran {}\n", invocation.args.join(" "));
                thread::spawn(move || {
                    sink.output(OutputChunk {
                        text,
                        malformed: false,
                    });
                    sink.exited(ExitReport::exited(0));
                });
                Ok(Box::new(FakeRun {
                    sink: None,
                    gated: false,
                }))
            }
            Behaviour::Hang => Ok(Box::new(FakeRun {
                sink: Some(sink),
                gated: false,
            })),
            Behaviour::Gated if invocation.args.iter().any(|a| a == "grant") => {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(100));
                    sink.authorized(Some(42));
                    sink.output(OutputChunk {
                        text: "granted\n".into(),
                        malformed: false,
                    });
                    sink.exited(ExitReport::exited(0));
                });
                Ok(Box::new(FakeRun {
                    sink: None,
                    gated: true,
                }))
            }
            Behaviour::Gated => Ok(Box::new(FakeRun {
                sink: Some(sink),
                gated: true,
            })),
        }
    }

    fn kind(&self) -> &'static str {
        "fake"
    }
}

fn fake_engine(behaviour: Behaviour, queue: JobQueue, options: EngineOptions) -> (ExecutionController, MemorySurface) {
    let command = ResolvedCommand {
        interpreter: PathBuf::from("/fake/interpreter"),
        interpreter_args: Vec::new(),
        script: PathBuf::from("script"),
        script_args: Vec::new(),
        working_dir: PathBuf::from("/"),
    };
    engine(
        command,
        Box::new(FakeLauncher(behaviour)),
        PresentationMode::ScrollingLog,
        queue,
        options,
    )
}

// ============================================
// SINGLE-SHOT
// ============================================

#[test]
fn test_single_shot_exits_with_job_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "echo \"hello $*\"\nexit 3\n",
        PresentationMode::ScrollingLog,
        JobQueue::new(8, None),
        options(false, false),
    );
    let harness = Harness::start(controller, surface.clone(), Some(Job::launch(args(&["world"]), None)));

    let (outcome, statuses) = harness.join();
    assert_eq!(outcome, EngineOutcome { exit_code: 3, runs: 1 });
    assert_eq!(surface.snapshot().text, "hello world\n");
    assert!(statuses.contains(&EngineStatus::RunFinished {
        run_id: 1,
        report: ExitReport::exited(3)
    }));
}

#[test]
fn test_exit_is_reported_after_all_output() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "i=0; while [ $i -lt 500 ]; do echo \"line $i\"; i=$((i+1)); done\n",
        PresentationMode::ScrollingLog,
        JobQueue::new(8, None),
        options(false, false),
    );
    let mut harness = Harness::start(controller, surface.clone(), Some(Job::launch(vec![], None)));

    harness.wait_finished();
    // Everything was on the surface by the time the finish was published
    let expected: String = (0..500).map(|i| format!("line {}\n", i)).collect();
    assert_eq!(harness.surface.snapshot().text, expected);
    harness.join();
}

#[test]
fn test_background_descendant_does_not_hold_run_open() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "echo hi\nsleep 3 &\nexit 0\n",
        PresentationMode::ScrollingLog,
        JobQueue::new(8, None),
        options(false, false),
    );
    let started = Instant::now();
    let (outcome, _) = Harness::start(controller, surface.clone(), Some(Job::launch(vec![], None))).join();

    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 1 });
    assert_eq!(surface.snapshot().text, "hi\n");
}

#[test]
fn test_single_shot_ignores_jobs_queued_before_launch() {
    let (controller, surface) = fake_engine(Behaviour::Echo, JobQueue::new(8, None), options(false, true));
    controller.handle().submit(Job::launch(args(&["early"]), None)).unwrap();

    let (outcome, statuses) =
        Harness::start(controller, surface.clone(), Some(Job::launch(args(&["initial"]), None))).join();
    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 1 });
    assert_eq!(started_args(&statuses), vec![args(&["initial"])]);
    assert_eq!(surface.snapshot().appends, vec!["ran script initial\n"]);
}

#[test]
fn test_single_shot_rejects_triggers_once_started() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "sleep 0.3\n",
        PresentationMode::ScrollingLog,
        JobQueue::new(8, None),
        options(false, true),
    );
    let mut harness = Harness::start(controller, surface, Some(Job::launch(vec![], None)));
    harness.wait_started();

    let late = harness.handle.submit(Job::dropped_files(args(&["/tmp/x"])));
    assert!(matches!(late, Err(ScriptExecError::QueueClosed)));
    harness.wait_for(|s| matches!(s, EngineStatus::TriggerRejected { .. }));

    let handle = harness.handle.clone();
    let (outcome, statuses) = harness.join();
    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 1 });
    assert_eq!(started_args(&statuses).len(), 1);

    // Terminal: still closed afterwards
    assert!(matches!(
        handle.submit(Job::launch(vec![], None)),
        Err(ScriptExecError::QueueClosed)
    ));
}

#[test]
fn test_launch_error_never_starts_a_run() {
    let command = ResolvedCommand {
        interpreter: PathBuf::from("/no/such/interpreter"),
        interpreter_args: Vec::new(),
        script: PathBuf::from("/no/such/script"),
        script_args: Vec::new(),
        working_dir: std::env::temp_dir(),
    };
    let (controller, surface) = engine(
        command,
        Box::new(ProcessLauncher::new(TextEncoding::Utf8, Duration::from_millis(200))),
        PresentationMode::ScrollingLog,
        JobQueue::new(8, None),
        // Initial failure is fatal even for a remain-running wrapper
        options(true, true),
    );
    let harness = Harness::start(controller, surface.clone(), Some(Job::launch(vec![], None)));

    let (outcome, statuses) = harness.join();
    assert_eq!(outcome.runs, 0);
    assert_ne!(outcome.exit_code, 0);
    assert!(statuses
        .iter()
        .any(|s| matches!(s, EngineStatus::RunFailed { .. })));
    assert!(started_args(&statuses).is_empty());
    assert!(!statuses
        .iter()
        .any(|s| matches!(s, EngineStatus::RunFinished { .. })));
    assert!(surface.snapshot().appends.is_empty());
}

#[test]
fn test_decode_warning_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "printf 'a\\377\\n'\nsleep 0.05\nprintf 'b\\376\\n'\n",
        PresentationMode::ScrollingLog,
        JobQueue::new(8, None),
        options(false, false),
    );
    let harness = Harness::start(controller, surface, Some(Job::launch(vec![], None)));

    let (outcome, statuses) = harness.join();
    assert_eq!(outcome.exit_code, 0);
    let warnings = statuses
        .iter()
        .filter(|s| matches!(s, EngineStatus::DecodeWarning { .. }))
        .count();
    assert_eq!(warnings, 1);
}

#[test]
fn test_output_saved_after_run() {
    let dir = tempfile::tempdir().unwrap();
    let saved = dir.path().join("saved.txt");
    let mut opts = options(false, false);
    opts.save_output_path = Some(saved.clone());
    let (controller, surface) = shell_engine(
        &dir,
        "echo kept\n",
        PresentationMode::ScrollingLog,
        JobQueue::new(8, None),
        opts,
    );
    Harness::start(controller, surface, Some(Job::launch(vec![], None))).join();

    assert_eq!(std::fs::read_to_string(&saved).unwrap(), "kept\n");
}

#[test]
fn test_stdin_payload_reaches_script() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "tr a-z A-Z\n",
        PresentationMode::ScrollingLog,
        JobQueue::new(8, None),
        options(false, false),
    );
    let initial = Job::launch(vec![], Some("quiet\n".into()));
    Harness::start(controller, surface.clone(), Some(initial)).join();
    assert_eq!(surface.snapshot().text, "QUIET\n");
}

// ============================================
// CANCELLATION
// ============================================

#[test]
fn test_cancel_finishes_within_bound() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "echo ready\nsleep 30\n",
        PresentationMode::ScrollingLog,
        JobQueue::new(8, None),
        options(false, false),
    );
    let mut harness = Harness::start(controller, surface, Some(Job::launch(vec![], None)));
    harness.wait_started();

    let requested = Instant::now();
    harness.handle.cancel();
    let report = harness.wait_finished();

    assert_eq!(report.cause, ExitCause::Cancelled);
    assert!(requested.elapsed() < Duration::from_secs(3));
    let (outcome, _) = harness.join();
    assert_eq!(outcome.exit_code, 1);
}

#[test]
fn test_unconfirmed_cancel_is_surfaced_and_synthesized() {
    let mut opts = options(false, false);
    opts.cancel_grace = Duration::from_millis(50);
    let (controller, surface) = fake_engine(Behaviour::Hang, JobQueue::new(8, None), opts);
    let mut harness = Harness::start(controller, surface, Some(Job::launch(vec![], None)));
    harness.wait_started();

    let requested = Instant::now();
    harness.handle.cancel();
    harness.wait_for(|s| matches!(s, EngineStatus::CancelUnconfirmed { .. }));
    let report = harness.wait_finished();

    assert_eq!(report, ExitReport::cancelled());
    assert!(requested.elapsed() >= Duration::from_millis(50));
    assert!(requested.elapsed() < Duration::from_secs(3));
    harness.join();
}

#[test]
fn test_cancel_while_idle_is_ignored() {
    let (controller, surface) = fake_engine(Behaviour::Echo, JobQueue::new(8, None), options(true, true));
    let mut harness = Harness::start(controller, surface, Some(Job::launch(vec![], None)));
    harness.wait_finished();

    harness.handle.cancel();
    harness.handle.submit(Job::launch(args(&["again"]), None)).unwrap();
    harness.wait_finished();
    harness.handle.close();

    let (outcome, _) = harness.join();
    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 2 });
}

// ============================================
// REMAIN RUNNING
// ============================================

#[test]
fn test_at_most_one_run_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "mkdir lock 2>/dev/null || echo OVERLAP\nsleep 0.05\nrmdir lock\necho \"run $1\"\n",
        PresentationMode::ScrollingLog,
        JobQueue::new(64, None),
        options(true, true),
    );
    let mut harness = Harness::start(controller, surface.clone(), Some(Job::launch(args(&["0"]), None)));

    let submitters: Vec<_> = (1..=5)
        .map(|i| {
            let handle = harness.handle.clone();
            thread::spawn(move || handle.submit(Job::launch(vec![i.to_string()], None)))
        })
        .collect();
    for submitter in submitters {
        submitter.join().unwrap().unwrap();
    }

    for _ in 0..6 {
        harness.wait_finished();
    }
    harness.handle.close();
    let (outcome, statuses) = harness.join();

    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 6 });
    assert_runs_never_overlap(&statuses);
    let all_output = surface.snapshot().appends.concat();
    assert!(!all_output.contains("OVERLAP"));
}

#[test]
fn test_queued_jobs_run_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "[ \"$1\" = first ] && sleep 0.3\necho \"$1\"\n",
        PresentationMode::ScrollingLog,
        JobQueue::new(8, None),
        options(true, true),
    );
    let mut harness = Harness::start(controller, surface.clone(), Some(Job::launch(args(&["first"]), None)));
    harness.wait_started();

    for name in ["a", "b", "c"] {
        harness.handle.submit(Job::launch(args(&[name]), None)).unwrap();
    }
    for _ in 0..4 {
        harness.wait_finished();
    }
    harness.handle.close();
    let (_, statuses) = harness.join();

    assert_eq!(
        started_args(&statuses),
        vec![args(&["first"]), args(&["a"]), args(&["b"]), args(&["c"])]
    );
    assert_eq!(surface.snapshot().appends.concat(), "first\na\nb\nc\n");
}

#[test]
fn test_three_drops_while_idle_run_separately_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "echo \"$@\"\n",
        PresentationMode::DropTarget,
        JobQueue::new(8, Some(Duration::from_millis(500))),
        options(true, true),
    );
    let handle = controller.handle();

    // Nothing is running yet, so nothing may coalesce
    for (i, file) in ["/tmp/a", "/tmp/b", "/tmp/c"].into_iter().enumerate() {
        let outcome = handle.submit(Job::dropped_files(args(&[file]))).unwrap();
        assert_eq!(outcome, EnqueueOutcome::Queued { depth: i + 1 });
    }

    let mut harness = Harness::start(controller, surface, None);
    for _ in 0..3 {
        harness.wait_finished();
    }
    harness.handle.close();
    let (outcome, statuses) = harness.join();

    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 3 });
    assert_runs_never_overlap(&statuses);
    assert_eq!(
        started_args(&statuses),
        vec![args(&["/tmp/a"]), args(&["/tmp/b"]), args(&["/tmp/c"])]
    );
}

#[test]
fn test_three_drops_during_run_coalesce_into_one_job() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "[ \"$1\" = initial ] && sleep 1\nexit 0\n",
        PresentationMode::DropTarget,
        JobQueue::new(8, Some(Duration::from_millis(500))),
        options(true, true),
    );
    let mut harness = Harness::start(controller, surface, Some(Job::launch(args(&["initial"]), None)));
    harness.wait_started();

    let outcomes: Vec<_> = [vec!["/tmp/a"], vec!["/tmp/b", "/tmp/a"], vec!["/tmp/c"]]
        .into_iter()
        .map(|files| harness.handle.submit(Job::dropped_files(args(&files))).unwrap())
        .collect();
    assert_eq!(
        outcomes,
        vec![
            EnqueueOutcome::Queued { depth: 1 },
            EnqueueOutcome::Coalesced { depth: 1 },
            EnqueueOutcome::Coalesced { depth: 1 },
        ]
    );

    harness.wait_finished();
    harness.wait_finished();
    harness.handle.close();
    let (outcome, statuses) = harness.join();

    assert_eq!(outcome.runs, 2);
    assert_eq!(
        started_args(&statuses),
        vec![args(&["initial"]), args(&["/tmp/a", "/tmp/b", "/tmp/c"])]
    );
}

#[test]
fn test_failed_job_returns_engine_to_idle() {
    let (controller, surface) = fake_engine(Behaviour::Echo, JobQueue::new(8, None), options(true, true));
    let mut harness = Harness::start(controller, surface.clone(), Some(Job::launch(args(&["ok"]), None)));
    harness.wait_finished();

    harness.handle.submit(Job::launch(args(&["fail"]), None)).unwrap();
    harness.wait_for(|s| matches!(s, EngineStatus::RunFailed { .. }));
    harness.handle.submit(Job::launch(args(&["later"]), None)).unwrap();
    harness.wait_finished();
    harness.handle.close();

    let (outcome, _) = harness.join();
    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 2 });
    assert_eq!(
        surface.snapshot().appends,
        vec!["ran script ok\n", "ran script later\n"]
    );
}

#[test]
fn test_initial_job_runs_before_early_triggers() {
    let (controller, surface) = fake_engine(Behaviour::Echo, JobQueue::new(8, None), options(true, true));
    // A control stream can queue work before the engine takes its first job
    controller.handle().submit(Job::launch(args(&["fail"]), None)).unwrap();

    let mut harness = Harness::start(controller, surface.clone(), Some(Job::launch(args(&["ok"]), None)));
    harness.wait_finished();
    harness.wait_for(|s| matches!(s, EngineStatus::RunFailed { .. }));
    harness.handle.close();

    let (outcome, statuses) = harness.join();
    // The failed trigger is not the initial launch, so it is not fatal
    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 1 });
    assert_eq!(started_args(&statuses), vec![args(&["ok"])]);
    assert_eq!(surface.snapshot().appends, vec!["ran script ok\n"]);
}

#[test]
fn test_remain_running_without_triggers_exits_with_last_code() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "exit 4\n",
        PresentationMode::ScrollingLog,
        JobQueue::new(8, None),
        options(true, false),
    );
    let (outcome, _) = Harness::start(controller, surface, Some(Job::launch(vec![], None))).join();
    assert_eq!(outcome, EngineOutcome { exit_code: 4, runs: 1 });
}

#[test]
fn test_quit_while_idle_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "exit 7\n",
        PresentationMode::DropTarget,
        JobQueue::new(8, None),
        options(true, true),
    );
    let mut harness = Harness::start(controller, surface, Some(Job::launch(vec![], None)));
    assert_eq!(harness.wait_finished(), ExitReport::exited(7));

    harness.handle.quit();
    let (outcome, _) = harness.join();
    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 1 });
}

#[test]
fn test_quit_during_run_cancels_and_discards_queue() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "sleep 30\n",
        PresentationMode::ScrollingLog,
        JobQueue::new(8, None),
        options(true, true),
    );
    let mut harness = Harness::start(controller, surface, Some(Job::launch(vec![], None)));
    harness.wait_started();
    harness.handle.submit(Job::launch(args(&["pending"]), None)).unwrap();

    harness.handle.quit();
    let (outcome, statuses) = harness.join();
    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 1 });
    assert_eq!(started_args(&statuses).len(), 1);
}

#[test]
fn test_quit_directive_ends_remain_running_engine() {
    let dir = tempfile::tempdir().unwrap();
    let (controller, surface) = shell_engine(
        &dir,
        "echo working\necho QUITAPP\nexit 5\n",
        PresentationMode::ScrollingLog,
        JobQueue::new(8, None),
        options(true, true),
    );
    let (outcome, _) = Harness::start(controller, surface, Some(Job::launch(vec![], None))).join();
    assert_eq!(outcome, EngineOutcome { exit_code: 5, runs: 1 });
}

#[test]
fn test_capacity_error_discards_trigger() {
    let (controller, surface) = fake_engine(Behaviour::Hang, JobQueue::new(1, None), options(true, true));
    let mut harness = Harness::start(controller, surface, Some(Job::launch(vec![], None)));
    harness.wait_started();

    harness.handle.submit(Job::launch(args(&["one"]), None)).unwrap();
    let overflow = harness.handle.submit(Job::launch(args(&["two"]), None));
    assert!(matches!(overflow, Err(ScriptExecError::Capacity { capacity: 1 })));
    harness.wait_for(|s| matches!(s, EngineStatus::TriggerRejected { .. }));
    assert_eq!(harness.handle.queue_depth(), 1);

    harness.handle.quit();
    let (outcome, _) = harness.join();
    assert_eq!(outcome.exit_code, 0);
}

#[test]
fn test_close_drains_queue_then_exits_zero() {
    let (controller, surface) = fake_engine(Behaviour::Echo, JobQueue::new(8, None), options(true, true));
    let handle = controller.handle();
    handle.submit(Job::launch(args(&["a"]), None)).unwrap();
    handle.submit(Job::launch(args(&["b"]), None)).unwrap();
    handle.close();

    let (outcome, statuses) = Harness::start(controller, surface, None).join();
    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 2 });
    assert_eq!(started_args(&statuses), vec![args(&["a"]), args(&["b"])]);
}

// ============================================
// AUTHORIZATION
// ============================================

#[test]
fn test_authorized_run_starts_once_granted() {
    let (controller, surface) = fake_engine(Behaviour::Gated, JobQueue::new(8, None), options(false, false));
    let mut harness = Harness::start(controller, surface.clone(), Some(Job::launch(args(&["grant"]), None)));

    match harness.wait_for(|s| matches!(s, EngineStatus::RunStarted { .. })) {
        EngineStatus::RunStarted { pid, args: started, .. } => {
            assert_eq!(pid, Some(42));
            assert_eq!(started, args(&["grant"]));
        }
        _ => unreachable!(),
    }
    let (outcome, statuses) = harness.join();
    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 1 });
    assert_runs_never_overlap(&statuses);
    assert_eq!(surface.snapshot().text, "granted\n");
}

#[test]
fn test_quit_while_awaiting_authorization_exits_zero() {
    let (controller, surface) = fake_engine(Behaviour::Gated, JobQueue::new(8, None), options(true, true));
    let harness = Harness::start(controller, surface, Some(Job::launch(vec![], None)));
    thread::sleep(Duration::from_millis(100));

    harness.handle.quit();
    let (outcome, statuses) = harness.join();
    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 0 });
    assert!(started_args(&statuses).is_empty());
    assert!(statuses
        .iter()
        .any(|s| matches!(s, EngineStatus::RunFailed { .. })));
}

#[test]
fn test_cancel_while_awaiting_authorization_fails_initial_job() {
    let (controller, surface) = fake_engine(Behaviour::Gated, JobQueue::new(8, None), options(true, true));
    let mut harness = Harness::start(controller, surface, Some(Job::launch(vec![], None)));
    thread::sleep(Duration::from_millis(100));

    harness.handle.cancel();
    match harness.wait_for(|s| matches!(s, EngineStatus::RunFailed { .. })) {
        EngineStatus::RunFailed { reason, .. } => assert!(reason.contains("cancelled")),
        _ => unreachable!(),
    }
    let (outcome, statuses) = harness.join();
    assert_eq!(outcome, EngineOutcome { exit_code: 1, runs: 0 });
    assert!(started_args(&statuses).is_empty());
}

#[test]
fn test_refused_trigger_returns_engine_to_idle() {
    let (controller, surface) = fake_engine(Behaviour::Gated, JobQueue::new(8, None), options(true, true));
    let mut harness = Harness::start(controller, surface, Some(Job::launch(args(&["grant"]), None)));
    harness.wait_finished();

    harness.handle.submit(Job::launch(args(&["pending"]), None)).unwrap();
    thread::sleep(Duration::from_millis(100));
    harness.handle.cancel();
    harness.wait_for(|s| matches!(s, EngineStatus::RunFailed { .. }));
    harness.handle.submit(Job::launch(args(&["grant"]), None)).unwrap();
    harness.wait_finished();
    harness.handle.close();

    let (outcome, statuses) = harness.join();
    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 2 });
    assert_eq!(started_args(&statuses), vec![args(&["grant"]), args(&["grant"])]);
}

#[test]
fn test_quit_withdraws_pending_elevation_request() {
    let dir = tempfile::tempdir().unwrap();
    // Stands in for a helper whose dialog is still open
    let helper = ElevationHelper::Prefix(vec![
        "sh".into(),
        "-c".into(),
        "sleep 1; exec \"$@\"".into(),
        "helper".into(),
    ]);
    let (controller, surface) = engine(
        shell_command(&dir, "touch ran\n"),
        Box::new(PrivilegedLauncher::new(
            helper,
            TextEncoding::Utf8,
            vec![126, 127],
            Duration::from_millis(10),
        )),
        PresentationMode::ScrollingLog,
        JobQueue::new(8, None),
        options(true, true),
    );
    let harness = Harness::start(controller, surface, Some(Job::launch(vec![], None)));
    thread::sleep(Duration::from_millis(200));

    let requested = Instant::now();
    harness.handle.quit();
    let (outcome, statuses) = harness.join();
    assert!(requested.elapsed() < Duration::from_secs(1), "quit took {:?}", requested.elapsed());
    assert_eq!(outcome, EngineOutcome { exit_code: 0, runs: 0 });
    assert!(started_args(&statuses).is_empty());

    // Past the point where the helper would have run the script
    thread::sleep(Duration::from_millis(1500));
    assert!(!dir.path().join("ran").exists());
}
