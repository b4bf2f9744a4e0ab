//! Decodes a whole process listing, one independent outcome per record.

use crate::decoder::{self, DecodeError, DecodedCommand};
use crate::process::ProcessCommandLine;
use rayon::prelude::*;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStatus {
    Decoded(DecodedCommand),
    /// No encoded-command flag with a payload; not an error.
    NotPresent,
    Failed(DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeOutcome {
    pub process_id: u32,
    pub name: Option<String>,
    pub status: DecodeStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub decoded: usize,
    pub not_present: usize,
    pub failed: usize,
}

impl Summary {
    pub fn total(&self) -> usize {
        self.decoded + self.not_present + self.failed
    }
}

/// Decodes every record, keeping input order.
///
/// A malformed payload only affects its own outcome.
pub fn decode_all(records: &[ProcessCommandLine], parallel: bool) -> Vec<DecodeOutcome> {
    info!(
        "Decoding {} command lines ({})",
        records.len(),
        if parallel { "parallel" } else { "sequential" }
    );

    let outcomes: Vec<DecodeOutcome> = if parallel {
        records.par_iter().map(decode_record).collect()
    } else {
        records.iter().map(decode_record).collect()
    };

    let summary = summarize(&outcomes);
    info!(
        "Decoded {}, not present {}, failed {}",
        summary.decoded, summary.not_present, summary.failed
    );
    outcomes
}

pub fn decode_record(record: &ProcessCommandLine) -> DecodeOutcome {
    let status = match decoder::decode_from_command_line(&record.command_line) {
        Some(Ok(decoded)) => {
            debug!("PID {}: decoded {} bytes", record.process_id, decoded.byte_len);
            DecodeStatus::Decoded(decoded)
        }
        Some(Err(e)) => {
            warn!("PID {}: {}", record.process_id, e);
            DecodeStatus::Failed(e)
        }
        None => DecodeStatus::NotPresent,
    };

    DecodeOutcome {
        process_id: record.process_id,
        name: record.name.clone(),
        status,
    }
}

pub fn summarize(outcomes: &[DecodeOutcome]) -> Summary {
    outcomes
        .iter()
        .fold(Summary::default(), |mut summary, outcome| {
            match outcome.status {
                DecodeStatus::Decoded(_) => summary.decoded += 1,
                DecodeStatus::NotPresent => summary.not_present += 1,
                DecodeStatus::Failed(_) => summary.failed += 1,
            }
            summary
        })
}
