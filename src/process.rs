//! Process information sources.
//!
//! Each source yields `ProcessCommandLine` records; how the listing was taken
//! is of no concern to the decoder.

use anyhow::{Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Deserializer};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

// procfs layout
pub const PROC_ROOT: &str = "/proc";
const PROC_CMDLINE: &str = "cmdline";
const PROC_COMM: &str = "comm";
const PROC_ARG_SEPARATOR: char = '\0';

/// A command line observed in a process table.
///
/// Field aliases match `Get-CimInstance Win32_Process | ConvertTo-Json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProcessCommandLine {
    #[serde(alias = "ProcessId")]
    pub process_id: u32,

    #[serde(alias = "Name", default)]
    pub name: Option<String>,

    // Protected processes report a null CommandLine
    #[serde(alias = "CommandLine", default, deserialize_with = "null_as_empty")]
    pub command_line: String,
}

impl ProcessCommandLine {
    pub fn new(process_id: u32, name: Option<String>, command_line: impl Into<String>) -> Self {
        Self {
            process_id,
            name,
            command_line: command_line.into(),
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Keeps records matching an image name and a command-line substring.
///
/// Both comparisons ignore case; `None` matches everything.
pub fn filter_records(
    records: Vec<ProcessCommandLine>,
    name: Option<&str>,
    contains: Option<&str>,
) -> Vec<ProcessCommandLine> {
    let contains = contains.map(str::to_lowercase);
    records
        .into_iter()
        .filter(|record| match name {
            Some(wanted) => record
                .name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(wanted)),
            None => true,
        })
        .filter(|record| match &contains {
            Some(needle) => record.command_line.to_lowercase().contains(needle.as_str()),
            None => true,
        })
        .collect()
}

/// Loads a JSON process snapshot from disk.
pub fn read_snapshot(path: &Path) -> Result<Vec<ProcessCommandLine>> {
    let file = File::open(path).with_context(|| format!("Unable to open {}", path.display()))?;
    read_snapshot_from(BufReader::new(file), &path.display().to_string())
}

/// Loads a JSON process snapshot from any reader; `origin` names it in errors.
pub fn read_snapshot_from(mut reader: impl Read, origin: &str) -> Result<Vec<ProcessCommandLine>> {
    let mut text = String::new();
    reader
        .read_to_string(&mut text)
        .with_context(|| format!("Unable to read {}", origin))?;
    parse_snapshot(&text, origin)
}

/// Accepts a JSON array, a single object, or JSON Lines.
pub fn parse_snapshot(text: &str, origin: &str) -> Result<Vec<ProcessCommandLine>> {
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(text)
            .with_context(|| format!("{}: malformed process array", origin));
    }

    // Handles a lone object as well as one object per line
    let mut records = Vec::new();
    for record in serde_json::Deserializer::from_str(text).into_iter::<ProcessCommandLine>() {
        records.push(record.with_context(|| format!("{}: malformed process record", origin))?);
    }

    debug!("Read {} records from {}", records.len(), origin);
    Ok(records)
}

/// Reads every process's command line under a procfs mount.
pub fn read_proc_table(root: &Path) -> Result<Vec<ProcessCommandLine>> {
    let entries =
        fs::read_dir(root).with_context(|| format!("Unable to list {}", root.display()))?;

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Unable to list {}", root.display()))?;
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };

        // Processes exit while we walk the table
        let raw = match fs::read(entry.path().join(PROC_CMDLINE)) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("Skipping PID {}: {}", pid, e);
                continue;
            }
        };
        let name = fs::read_to_string(entry.path().join(PROC_COMM))
            .ok()
            .map(|comm| comm.trim_end().to_string())
            .filter(|comm| !comm.is_empty());

        records.push(ProcessCommandLine::new(pid, name, join_proc_args(&raw)));
    }

    records.sort_by_key(|record| record.process_id);
    debug!("Read {} processes from {}", records.len(), root.display());
    Ok(records)
}

fn join_proc_args(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .split(PROC_ARG_SEPARATOR)
        .filter(|arg| !arg.is_empty())
        .join(" ")
}
