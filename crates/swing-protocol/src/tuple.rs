//! Helpers for the `[tag, ...fields]` arrays used on the wire.

use serde_json::Value;

use crate::error::ProtocolError;
use crate::kref::{Kref, KrefKind};

/// Splits a tagged array into its tag and remaining fields.
pub(crate) fn split<'a>(
    kind: &'static str,
    value: &'a Value,
) -> Result<(&'a str, &'a [Value]), ProtocolError> {
    let items = value
        .as_array()
        .ok_or_else(|| ProtocolError::malformed(kind, "expected a tagged array"))?;
    let (tag, rest) = items
        .split_first()
        .ok_or_else(|| ProtocolError::malformed(kind, "empty array"))?;
    let tag = tag
        .as_str()
        .ok_or_else(|| ProtocolError::malformed(kind, "tag must be a string"))?;
    Ok((tag, rest))
}

pub(crate) fn arity(
    kind: &'static str,
    tag: &str,
    fields: &[Value],
    expected: usize,
) -> Result<(), ProtocolError> {
    if fields.len() == expected {
        Ok(())
    } else {
        Err(ProtocolError::malformed(
            kind,
            format!("'{tag}' takes {expected} fields, got {}", fields.len()),
        ))
    }
}

pub(crate) fn string(kind: &'static str, value: &Value) -> Result<String, ProtocolError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::malformed(kind, format!("expected string, got {value}")))
}

pub(crate) fn boolean(kind: &'static str, value: &Value) -> Result<bool, ProtocolError> {
    value
        .as_bool()
        .ok_or_else(|| ProtocolError::malformed(kind, format!("expected bool, got {value}")))
}

pub(crate) fn kref(kind: &'static str, value: &Value) -> Result<Kref, ProtocolError> {
    Kref::parse(string(kind, value)?)
}

pub(crate) fn kref_of(
    kind: &'static str,
    value: &Value,
    expected: KrefKind,
) -> Result<Kref, ProtocolError> {
    let kref = kref(kind, value)?;
    kref.insist_kind(expected)?;
    Ok(kref)
}

/// Parses a non-empty list of object krefs.
pub(crate) fn object_list(kind: &'static str, value: &Value) -> Result<Vec<Kref>, ProtocolError> {
    let items = value
        .as_array()
        .ok_or_else(|| ProtocolError::malformed(kind, "expected a list of krefs"))?;
    if items.is_empty() {
        return Err(ProtocolError::malformed(kind, "kref list is empty"));
    }
    items
        .iter()
        .map(|item| kref_of(kind, item, KrefKind::Object))
        .collect()
}

pub(crate) fn kref_values(krefs: &[Kref]) -> Value {
    Value::Array(
        krefs
            .iter()
            .map(|kref| Value::String(kref.as_str().to_string()))
            .collect(),
    )
}
