#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::pedantic)]

mod batch;
mod cli;
mod decoder;
mod process;
mod report;

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

// At least one payload was found but could not be decoded
const EXIT_DECODE_FAILED: u8 = 2;

fn main() -> ExitCode {
    let args = cli::Cli::parse();

    // Logs go to stderr so stdout holds only the report
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level())),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli::run(&args) {
        Ok(summary) if summary.failed > 0 => ExitCode::from(EXIT_DECODE_FAILED),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
