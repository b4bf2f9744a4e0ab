use crate::batch::{self, Summary};
use crate::process::{self, ProcessCommandLine, PROC_ROOT};
use crate::report;
use anyhow::{bail, Result};
use clap::{ArgAction, ArgGroup, Parser};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

// Reads the snapshot from stdin
const STDIN_PATH: &str = "-";

// Inline command lines have no real process behind them
const INLINE_PROCESS_ID: u32 = 0;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "psenc-decode",
    version,
    about = "Recover PowerShell -EncodedCommand scripts from process command lines"
)]
#[command(group(
    ArgGroup::new("source")
        .required(true)
        .args(["command_line", "snapshot", "proc_root"])
))]
pub struct Cli {
    /// Decode a single command line
    #[arg(long, value_name = "TEXT", allow_hyphen_values = true)]
    pub command_line: Option<String>,

    /// JSON process snapshot, e.g. `Get-CimInstance Win32_Process | ConvertTo-Json` ("-" for stdin)
    #[arg(long, value_name = "PATH")]
    pub snapshot: Option<PathBuf>,

    /// Read the local procfs process table
    #[arg(
        long = "proc",
        value_name = "ROOT",
        num_args = 0..=1,
        default_missing_value = PROC_ROOT
    )]
    pub proc_root: Option<PathBuf>,

    /// Only processes with this image name (case-insensitive)
    #[arg(long)]
    pub name: Option<String>,

    /// Only command lines containing this text (case-insensitive)
    #[arg(long, allow_hyphen_values = true)]
    pub contains: Option<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,

    /// Hide processes without an encoded command
    #[arg(long)]
    pub only_encoded: bool,

    /// Decode on the current thread only
    #[arg(long)]
    pub sequential: bool,

    /// More logging on stderr (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

/// Loads, filters, decodes and prints; the summary decides the exit status.
pub fn run(args: &Cli) -> Result<Summary> {
    let records = load_records(args)?;
    let records = process::filter_records(records, args.name.as_deref(), args.contains.as_deref());
    info!("{} processes after filtering", records.len());

    let outcomes = batch::decode_all(&records, !args.sequential);
    let rendered = if args.json {
        report::render_json(&outcomes, args.only_encoded)?
    } else {
        report::render_table(&outcomes, args.only_encoded)
    };

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", rendered.trim_end())?;
    stdout.flush()?;

    Ok(batch::summarize(&outcomes))
}

fn load_records(args: &Cli) -> Result<Vec<ProcessCommandLine>> {
    if let Some(command_line) = &args.command_line {
        return Ok(vec![ProcessCommandLine::new(
            INLINE_PROCESS_ID,
            None,
            command_line.as_str(),
        )]);
    }
    if let Some(path) = &args.snapshot {
        if path.as_os_str() == STDIN_PATH {
            return process::read_snapshot_from(std::io::stdin().lock(), "stdin");
        }
        return process::read_snapshot(path);
    }
    if let Some(root) = &args.proc_root {
        return process::read_proc_table(root);
    }

    bail!("No process source selected")
}
