use std::fs::File;
use std::io::{BufReader, IsTerminal, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use script_exec::config::{self, PresentationMode, WrapperConfig};
use script_exec::executor::ExitCause;
use script_exec::job::Job;
use script_exec::output::TerminalSurface;
use script_exec::triggers::{start_trigger_listener, TriggerDispatcher};
use script_exec::{EngineStatus, ExecutionController};

/// Control stream argument meaning "read triggers from standard input"
const STDIN_CONTROL: &str = "-";

#[derive(Debug, Parser, Clone)]
#[command(
    name = "script-exec",
    version,
    about = "Run a wrapped script with the wrapper's presentation and queueing policy"
)]
pub struct Cli {
    /// Wrapper settings file (JSON)
    #[arg(long, short)]
    pub config: PathBuf,

    /// Override the configured presentation mode (e.g. scrollingLog, dropTarget)
    #[arg(long, value_parser = parse_presentation)]
    pub presentation: Option<PresentationMode>,

    /// Keep running after a job completes
    #[arg(long)]
    pub remain_running: bool,

    /// Run the script with administrator privileges
    #[arg(long)]
    pub privileged: bool,

    /// Read JSONL trigger commands from this file, or `-` for stdin
    #[arg(long, value_name = "PATH|-")]
    pub control: Option<String>,

    /// Directory for the JSONL log file
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Don't write the JSONL log file
    #[arg(long)]
    pub no_log_file: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Arguments for the script's first run
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

fn parse_presentation(s: &str) -> std::result::Result<PresentationMode, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown presentation mode '{}'", s))
}

impl Cli {
    /// Command-line flags win over the settings file
    fn apply_overrides(&self, config: &mut WrapperConfig) {
        if let Some(mode) = self.presentation {
            config.presentation = mode;
        }
        if self.remain_running {
            config.remain_running = true;
        }
        if self.privileged {
            config.privileged = true;
        }
    }

    fn control_is_stdin(&self) -> bool {
        self.control.as_deref() == Some(STDIN_CONTROL)
    }
}

/// Piped standard input becomes the first run's stdin payload
fn read_piped_stdin() -> Option<String> {
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        return None;
    }
    let mut payload = String::new();
    match stdin.lock().read_to_string(&mut payload) {
        Ok(_) if !payload.is_empty() => Some(payload),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable standard input");
            None
        }
    }
}

fn describe_status(status: &EngineStatus) -> Option<String> {
    match status {
        EngineStatus::RunFailed { reason, .. } => Some(format!("Run failed: {}", reason)),
        EngineStatus::TriggerRejected { reason } => Some(format!("Trigger rejected: {}", reason)),
        EngineStatus::CancelUnconfirmed { run_id } => Some(format!(
            "Run {} could not be stopped and may still be running",
            run_id
        )),
        EngineStatus::RunFinished { report, .. } => match report.cause {
            ExitCause::Crashed { signal } => {
                Some(format!("Script terminated by signal {}", signal))
            }
            _ => None,
        },
        _ => None,
    }
}

/// Run the wrapper; returns its exit status
pub fn run(cli: Cli) -> Result<i32> {
    let mut config = config::load_config(&cli.config)
        .with_context(|| format!("loading wrapper settings from {}", cli.config.display()))?;
    cli.apply_overrides(&mut config);

    let surface = TerminalSurface::stdio(config.get_document_path());
    let mut controller = ExecutionController::from_config(&config, Box::new(surface))
        .context("configuring the script engine")?;

    if let Some(statuses) = controller.subscribe() {
        std::thread::Builder::new()
            .name("status".into())
            .spawn(move || {
                while let Ok(status) = statuses.recv_blocking() {
                    if let Some(line) = describe_status(&status) {
                        eprintln!("{}", line);
                    }
                }
            })
            .context("starting the status thread")?;
    }

    let stdin_payload = if cli.control_is_stdin() {
        None
    } else {
        read_piped_stdin()
    };

    if let Some(control) = &cli.control {
        controller.set_accepts_triggers(true);
        let commands = if control == STDIN_CONTROL {
            start_trigger_listener(BufReader::new(std::io::stdin()))
        } else {
            let file = File::open(control)
                .with_context(|| format!("opening control stream {}", control))?;
            start_trigger_listener(BufReader::new(file))
        };
        TriggerDispatcher::new(
            controller.handle(),
            config.drop_policy(),
            config.get_accepts_drops(),
        )
        .spawn(commands);
        info!(control = %control, "Listening for trigger commands");
    }

    let outcome = controller.run(Some(Job::launch(cli.args, stdin_payload)));
    info!(
        exit_code = outcome.exit_code,
        runs = outcome.runs,
        "Wrapper finished"
    );
    Ok(outcome.exit_code)
}
