//! Operator-facing rendering of decode outcomes.

use crate::batch::{self, DecodeOutcome, DecodeStatus};
use anyhow::Result;
use itertools::Itertools;
use serde_json::{json, Value};

const SCRIPT_INDENT: &str = "    ";
const UNKNOWN_NAME: &str = "-";

/// One block per outcome followed by a summary line.
///
/// `only_encoded` hides rows without a payload; they are still counted.
pub fn render_table(outcomes: &[DecodeOutcome], only_encoded: bool) -> String {
    let mut out = String::new();
    for outcome in visible(outcomes, only_encoded) {
        let name = outcome.name.as_deref().unwrap_or(UNKNOWN_NAME);
        let row = match &outcome.status {
            DecodeStatus::Decoded(decoded) => format!(
                "{:>7}  {:<20} decoded ({} bytes, sha256 {})\n{}",
                outcome.process_id,
                name,
                decoded.byte_len,
                decoded.sha256(),
                indent(&decoded.script)
            ),
            DecodeStatus::NotPresent => {
                format!("{:>7}  {:<20} no encoded command", outcome.process_id, name)
            }
            DecodeStatus::Failed(e) => {
                format!("{:>7}  {:<20} failed: {}", outcome.process_id, name, e)
            }
        };
        out.push_str(&row);
        out.push('\n');
    }

    let summary = batch::summarize(outcomes);
    out.push_str(&format!(
        "{} processes: {} decoded, {} without encoded command, {} failed\n",
        summary.total(),
        summary.decoded,
        summary.not_present,
        summary.failed
    ));
    out
}

pub fn render_json(outcomes: &[DecodeOutcome], only_encoded: bool) -> Result<String> {
    let values: Vec<Value> = visible(outcomes, only_encoded).map(outcome_json).collect();
    Ok(serde_json::to_string_pretty(&values)?)
}

fn visible(
    outcomes: &[DecodeOutcome],
    only_encoded: bool,
) -> impl Iterator<Item = &DecodeOutcome> {
    outcomes
        .iter()
        .filter(move |o| !only_encoded || o.status != DecodeStatus::NotPresent)
}

fn outcome_json(outcome: &DecodeOutcome) -> Value {
    match &outcome.status {
        DecodeStatus::Decoded(decoded) => json!({
            "process_id": outcome.process_id,
            "name": outcome.name,
            "status": "decoded",
            "script": decoded.script,
            "byte_len": decoded.byte_len,
            "sha256": decoded.sha256(),
        }),
        DecodeStatus::NotPresent => json!({
            "process_id": outcome.process_id,
            "name": outcome.name,
            "status": "not_present",
        }),
        DecodeStatus::Failed(e) => json!({
            "process_id": outcome.process_id,
            "name": outcome.name,
            "status": "failed",
            "error": e.to_string(),
        }),
    }
}

fn indent(script: &str) -> String {
    script
        .lines()
        .map(|line| format!("{}{}", SCRIPT_INDENT, line))
        .join("\n")
}
