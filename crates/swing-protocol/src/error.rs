use thiserror::Error;

use crate::kref::KrefKind;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid kref '{0}'")]
    InvalidKref(String),
    #[error("kref '{kref}' is not a {expected} reference")]
    WrongKrefKind { kref: String, expected: KrefKind },
    #[error("invalid vat id '{0}'")]
    InvalidVatId(String),
    #[error("invalid capdata: {0}")]
    CapData(String),
    #[error("invalid message: {0}")]
    Message(String),
    #[error("unknown {kind} tag '{tag}'")]
    UnknownTag { kind: &'static str, tag: String },
    #[error("malformed {kind}: {reason}")]
    Malformed { kind: &'static str, reason: String },
    #[error("marshal error: {0}")]
    Marshal(String),
    #[error("json error: {0}")]
    Json(String),
}

impl ProtocolError {
    pub(crate) fn malformed(kind: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::Malformed {
            kind,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Json(err.to_string())
    }
}
