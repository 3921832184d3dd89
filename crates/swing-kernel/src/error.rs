use swing_protocol::{Kref, ProtocolError, VatId};
use swing_store::StoreError;
use swing_worker::{TranscriptError, WorkerError};
use thiserror::Error;

use crate::state::MeterId;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("bundle store error: {0}")]
    Store(#[from] StoreError),
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("transcript error: {0}")]
    Transcript(#[from] TranscriptError),
    #[error("unknown kref {0}")]
    UnknownKref(Kref),
    #[error("unknown promise {0}")]
    UnknownPromise(Kref),
    #[error("promise {0} is already resolved")]
    AlreadyResolved(Kref),
    #[error("{caller} is not the decider of {kpid} (decider: {decider})")]
    NotDecider {
        kpid: Kref,
        caller: String,
        decider: String,
    },
    #[error("unknown vat {0}")]
    UnknownVat(VatId),
    #[error("unknown meter {0}")]
    UnknownMeter(MeterId),
    #[error("refcount of {kref} underflows (tag '{tag}')")]
    RefCountUnderflow { kref: Kref, tag: String },
    #[error("illegal syscall: {0}")]
    IllegalSyscall(String),
    #[error("replay of vat {vat} diverged: {reason}")]
    Replay { vat: VatId, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("kernel panic: {0}")]
    Panic(String),
}

/// Usage errors raised by device invocations. These are reported to the
/// calling vat as a `callNow` error result.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("device node {0} does not exist")]
    UnknownNode(Kref),
    #[error("{node} has no method '{method}'")]
    UnknownMethod { node: String, method: String },
    #[error("{method}: {reason}")]
    BadArgs { method: String, reason: String },
    #[error("{method}: {what} must not carry slots")]
    SlotsNotAllowed { method: String, what: &'static str },
    #[error("no bundle is named '{0}'")]
    UnknownBundleName(String),
    #[error("bundle {0} is not installed")]
    UnknownBundle(String),
    #[error("unknown vat {0}")]
    UnknownVat(VatId),
    #[error("unknown meter {0}")]
    UnknownMeter(MeterId),
    #[error("{0}")]
    Kernel(String),
}

impl DeviceError {
    pub(crate) fn bad_args(method: &str, reason: impl Into<String>) -> Self {
        DeviceError::BadArgs {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<KernelError> for DeviceError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::UnknownVat(vat) => DeviceError::UnknownVat(vat),
            KernelError::UnknownMeter(meter) => DeviceError::UnknownMeter(meter),
            other => DeviceError::Kernel(other.to_string()),
        }
    }
}
