mod cli;
mod commands;
mod error;
mod output;

use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tracing::info_span;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::cli::Cli;
use crate::error::CliError;

fn main() -> ExitCode {
    init_tracing();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let request_id = Uuid::new_v4();
    let span = info_span!("vizq", %request_id);
    let _entered = span.enter();

    let started = Instant::now();
    let data = commands::run(&cli)?;
    let report = output::CommandReport::new(request_id, cli.command.name(), started.elapsed(), data);
    output::render(&report, cli.pretty)
}

/// Logs go to stderr, filtered by `VIZQ_LOG` (default `warn`).
fn init_tracing() {
    let filter = EnvFilter::try_from_env("VIZQ_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
