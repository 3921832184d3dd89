//! Deterministic replay of transcripts against fresh workers.
//!
//! Each recorded delivery is re-executed; the syscalls the vat makes are
//! compared against the recorded ones and answered with the recorded
//! responses, so the vat reaches the same state without touching the kernel.

use std::fmt;

use serde_json::Value;
use swing_protocol::{
    ProtocolError, SetBundle, VatSyscallObject, VatSyscallResult, WorkerOptions,
};

use crate::error::WorkerError;
use crate::factory::VatWorkerFactory;
use crate::manager::{SyscallHandler, VatWorker};
use crate::transcript::{SyscallRecord, Transcript, TranscriptEntry};

/// Decides whether a replayed syscall matches the recorded one.
pub trait SyscallComparator: Send + Sync {
    /// Returns a description of the difference, or `None` when they match.
    fn compare(&self, expected: &Value, actual: &Value) -> Option<String>;
}

/// Exact JSON equality.
#[derive(Clone, Copy, Debug, Default)]
pub struct StrictComparator;

impl SyscallComparator for StrictComparator {
    fn compare(&self, expected: &Value, actual: &Value) -> Option<String> {
        (expected != actual).then(|| format!("expected {expected}, got {actual}"))
    }
}

/// Strict, except that `errorId` values inside serialized `#error` records
/// may differ. Error ids come from a per-process counter and are not part of
/// consensus.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerializedErrorTolerance;

impl SyscallComparator for SerializedErrorTolerance {
    fn compare(&self, expected: &Value, actual: &Value) -> Option<String> {
        if expected == actual {
            return None;
        }
        StrictComparator.compare(&strip_error_ids(expected), &strip_error_ids(actual))
    }
}

fn strip_error_ids(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                if key == "body" && map.contains_key("slots") {
                    if let Some(body) = item.as_str() {
                        out.insert(key.clone(), Value::String(strip_body(body)));
                        continue;
                    }
                }
                out.insert(key.clone(), strip_error_ids(item));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_error_ids).collect()),
        other => other.clone(),
    }
}

fn strip_body(body: &str) -> String {
    let Some(json) = body.strip_prefix(swing_protocol::capdata::SMALLCAPS_PREFIX) else {
        return body.to_string();
    };
    let Ok(parsed) = serde_json::from_str::<Value>(json) else {
        return body.to_string();
    };
    format!("#{}", strip_error_records(parsed))
}

fn strip_error_records(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            if map.contains_key("#error") {
                map.remove("errorId");
            }
            Value::Object(
                map.into_iter()
                    .map(|(key, item)| (key, strip_error_records(item)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(strip_error_records).collect()),
        other => other,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayMode {
    /// Stop at the first mismatch.
    Consensus,
    /// Collect every mismatch.
    Diagnostic,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MismatchKind {
    Different { expected: Value, actual: Value, reason: String },
    Missing { expected: Value },
    Extra { actual: Value },
    Result { expected: String, actual: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mismatch {
    pub delivery: usize,
    pub syscall: usize,
    pub kind: MismatchKind,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delivery {} syscall {}: ", self.delivery, self.syscall)?;
        match &self.kind {
            MismatchKind::Different { reason, .. } => f.write_str(reason),
            MismatchKind::Missing { expected } => write!(f, "missing syscall {expected}"),
            MismatchKind::Extra { actual } => write!(f, "extra syscall {actual}"),
            MismatchKind::Result { expected, actual } => {
                write!(f, "result '{actual}' differs from recorded '{expected}'")
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplayReport {
    pub deliveries: usize,
    pub mismatches: Vec<Mismatch>,
}

impl ReplayReport {
    pub fn is_faithful(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Serves recorded syscall responses during one replayed delivery.
struct RecordedSyscalls<'a> {
    delivery: usize,
    recorded: &'a [SyscallRecord],
    next: usize,
    comparator: &'a dyn SyscallComparator,
    mismatches: Vec<Mismatch>,
}

impl RecordedSyscalls<'_> {
    fn answer(&mut self, actual: Value) -> VatSyscallResult {
        let idx = self.next;
        self.next += 1;
        let Some(record) = self.recorded.get(idx) else {
            self.mismatches.push(Mismatch {
                delivery: self.delivery,
                syscall: idx,
                kind: MismatchKind::Extra { actual },
            });
            return VatSyscallResult::error("syscall not present in transcript");
        };
        if let Some(reason) = self.comparator.compare(&record.d, &actual) {
            self.mismatches.push(Mismatch {
                delivery: self.delivery,
                syscall: idx,
                kind: MismatchKind::Different {
                    expected: record.d.clone(),
                    actual,
                    reason,
                },
            });
        }
        VatSyscallResult::from_json(&record.response).unwrap_or_else(|err| {
            VatSyscallResult::Error(format!("unreadable recorded response: {err}"))
        })
    }

    fn finish(mut self) -> Vec<Mismatch> {
        for (idx, record) in self.recorded.iter().enumerate().skip(self.next) {
            self.mismatches.push(Mismatch {
                delivery: self.delivery,
                syscall: idx,
                kind: MismatchKind::Missing {
                    expected: record.d.clone(),
                },
            });
        }
        self.mismatches
    }
}

impl SyscallHandler for RecordedSyscalls<'_> {
    fn handle(&mut self, vso: VatSyscallObject) -> VatSyscallResult {
        self.answer(vso.to_json())
    }

    fn reject(&mut self, error: &ProtocolError) {
        self.answer(Value::String(format!("invalid syscall: {error}")));
    }
}

/// Replays `entries` against `worker`, whose vat must be freshly started.
pub fn replay_entries(
    worker: &mut dyn VatWorker,
    entries: &[TranscriptEntry],
    comparator: &dyn SyscallComparator,
    mode: ReplayMode,
) -> Result<ReplayReport, WorkerError> {
    let mut report = ReplayReport::default();
    for (idx, entry) in entries.iter().enumerate() {
        let delivery = entry.delivery()?;
        let mut syscalls = RecordedSyscalls {
            delivery: idx,
            recorded: &entry.syscalls,
            next: 0,
            comparator,
            mismatches: Vec::new(),
        };
        let result = worker.deliver(&delivery, &mut syscalls)?;
        let mut mismatches = syscalls.finish();
        if let Some(expected) = entry.result_tag() {
            if expected != result.tag() {
                mismatches.push(Mismatch {
                    delivery: idx,
                    syscall: entry.syscalls.len(),
                    kind: MismatchKind::Result {
                        expected: expected.to_string(),
                        actual: result.tag().to_string(),
                    },
                });
            }
        }
        worker.take_test_log();
        report.deliveries += 1;
        if mode == ReplayMode::Consensus {
            if let Some(first) = mismatches.first() {
                return Err(WorkerError::Divergence(format!(
                    "vat {} {first}",
                    worker.vat_id()
                )));
            }
        }
        report.mismatches.extend(mismatches);
    }
    Ok(report)
}

/// Starts a fresh worker from the transcript header and replays every entry.
pub fn replay_transcript(
    factory: &dyn VatWorkerFactory,
    transcript: &Transcript,
    options: WorkerOptions,
    comparator: &dyn SyscallComparator,
    mode: ReplayMode,
) -> Result<(Box<dyn VatWorker>, ReplayReport), WorkerError> {
    let header = &transcript.header;
    let mut worker = factory.start(SetBundle {
        vat_id: header.vat_id.clone(),
        bundle: header.vat_source_bundle.clone(),
        vat_parameters: header.vat_parameters.clone(),
        options,
    })?;
    let report = replay_entries(worker.as_mut(), &transcript.entries, comparator, mode)?;
    log::debug!(
        "replayed {} deliveries for vat {}",
        report.deliveries,
        header.vat_id
    );
    Ok((worker, report))
}
