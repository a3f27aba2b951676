mod cli;

use std::process::ExitCode;

use clap::Parser;

use script_exec::logging::{self, LogOptions};

fn main() -> ExitCode {
    let args = cli::Cli::parse();

    // Dropped last so buffered log records reach the file
    let _guard = logging::init(LogOptions {
        log_dir: args.log_dir.clone(),
        file: !args.no_log_file,
        default_filter: args.log_level.clone(),
    });

    match cli::run(args) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Wrapper failed to start");
            eprintln!("script-exec: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
