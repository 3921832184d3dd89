use swing_protocol::ProtocolError;
use swing_store::StoreError;
use thiserror::Error;

use crate::transcript::TranscriptError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("protocol violation: {0}")]
    Violation(String),
    #[error("worker channel closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to build vat: {0}")]
    Build(String),
    #[error("worker is dead: {0}")]
    Dead(String),
    #[error(transparent)]
    Transcript(#[from] TranscriptError),
    #[error("replay diverged: {0}")]
    Divergence(String),
}

impl WorkerError {
    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        WorkerError::Violation(reason.into())
    }
}
