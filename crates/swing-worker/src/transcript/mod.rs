//! Per-vat delivery transcripts.
//!
//! A transcript starts with a `create-vat` header naming the vat's bundle and
//! parameters, followed by one entry per delivery: the delivery, every
//! syscall it made with the response it got, and the delivery result.
//! Replaying the entries against a fresh worker rebuilds the vat.

pub mod fs;
pub mod mem;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use swing_protocol::{
    CapData, ProtocolError, VatDeliveryObject, VatDeliveryResult, VatId, VatSyscallObject,
    VatSyscallResult,
};
use thiserror::Error;

pub use fs::FsTranscriptStore;
pub use mem::MemTranscriptStore;

pub const CREATE_VAT: &str = "create-vat";

#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt transcript: {0}")]
    Corrupt(String),
    #[error("no transcript for vat {0}")]
    UnknownVat(VatId),
}

/// First line of a transcript.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TranscriptHeader {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "vatID")]
    pub vat_id: VatId,
    #[serde(default)]
    pub incarnation: u64,
    pub vat_parameters: CapData,
    pub vat_source_bundle: Value,
}

impl TranscriptHeader {
    pub fn new(vat_id: VatId, incarnation: u64, vat_parameters: CapData, bundle: Value) -> Self {
        Self {
            kind: CREATE_VAT.to_string(),
            vat_id,
            incarnation,
            vat_parameters,
            vat_source_bundle: bundle,
        }
    }

    pub(crate) fn check(&self) -> Result<(), TranscriptError> {
        if self.kind != CREATE_VAT {
            return Err(TranscriptError::Corrupt(format!(
                "first line has type '{}', expected '{CREATE_VAT}'",
                self.kind
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyscallRecord {
    pub d: Value,
    pub response: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranscriptEntry {
    pub d: Value,
    #[serde(default)]
    pub syscalls: Vec<SyscallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<Value>,
}

impl TranscriptEntry {
    pub fn new(delivery: &VatDeliveryObject) -> Self {
        Self {
            d: delivery.to_json(),
            syscalls: Vec::new(),
            r: None,
        }
    }

    pub fn record_syscall(&mut self, vso: &VatSyscallObject, response: &VatSyscallResult) {
        self.syscalls.push(SyscallRecord {
            d: vso.to_json(),
            response: response.to_json(),
        });
    }

    pub fn finish(&mut self, result: &VatDeliveryResult) {
        self.r = Some(result.to_json());
    }

    pub fn delivery(&self) -> Result<VatDeliveryObject, ProtocolError> {
        VatDeliveryObject::from_json(&self.d)
    }

    /// Tag of the recorded result (`ok`/`error`), if one was recorded.
    pub fn result_tag(&self) -> Option<&str> {
        self.r.as_ref()?.get(0)?.as_str()
    }
}

/// A vat's current incarnation: header plus entries in delivery order.
#[derive(Clone, Debug, PartialEq)]
pub struct Transcript {
    pub header: TranscriptHeader,
    pub entries: Vec<TranscriptEntry>,
}

/// Storage for transcripts, one per vat.
pub trait TranscriptStore: Send {
    /// Starts a new incarnation, discarding the previous one's entries.
    fn start(&mut self, header: TranscriptHeader) -> Result<(), TranscriptError>;

    /// Appends an entry and returns its position within the incarnation.
    fn append(&mut self, vat_id: &VatId, entry: &TranscriptEntry) -> Result<u64, TranscriptError>;

    fn load(&self, vat_id: &VatId) -> Result<Option<Transcript>, TranscriptError>;

    /// Forgets a terminated vat's transcript.
    fn remove(&mut self, vat_id: &VatId) -> Result<(), TranscriptError>;
}
