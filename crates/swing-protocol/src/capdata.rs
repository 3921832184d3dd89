//! `{ body, slots }` encoding for values that may embed capability references.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::kref::Kref;

/// Prefix that marks a smallcaps body.
pub const SMALLCAPS_PREFIX: char = '#';

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapData {
    pub body: String,
    pub slots: Vec<Kref>,
}

impl CapData {
    pub fn new(body: impl Into<String>, slots: Vec<Kref>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }

    /// Parses and validates a JSON value as CapData.
    pub fn from_json(value: &Value) -> Result<Self, ProtocolError> {
        let capdata: CapData = serde_json::from_value(value.clone())
            .map_err(|err| ProtocolError::CapData(err.to_string()))?;
        capdata.insist()?;
        Ok(capdata)
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "body": self.body,
            "slots": self.slots.iter().map(Kref::as_str).collect::<Vec<_>>(),
        })
    }

    /// Checks that placeholders in the body and entries in `slots` are in
    /// one-to-one correspondence.
    pub fn insist(&self) -> Result<(), ProtocolError> {
        let Some(json) = self.body.strip_prefix(SMALLCAPS_PREFIX) else {
            if self.slots.is_empty() {
                return Ok(());
            }
            return Err(ProtocolError::CapData(
                "non-smallcaps body cannot carry slots".into(),
            ));
        };
        let parsed: Value = serde_json::from_str(json)
            .map_err(|err| ProtocolError::CapData(format!("body is not JSON: {err}")))?;
        let mut referenced = BTreeSet::new();
        collect_placeholders(&parsed, &mut referenced)?;
        if let Some(max) = referenced.iter().next_back() {
            if *max >= self.slots.len() {
                return Err(ProtocolError::CapData(format!(
                    "placeholder index {max} out of range for {} slots",
                    self.slots.len()
                )));
            }
        }
        if referenced.len() != self.slots.len() {
            let orphan = (0..self.slots.len())
                .find(|idx| !referenced.contains(idx))
                .unwrap_or_default();
            return Err(ProtocolError::CapData(format!(
                "slot {orphan} ({}) is not referenced by the body",
                self.slots[orphan]
            )));
        }
        Ok(())
    }

    pub fn has_slots(&self) -> bool {
        !self.slots.is_empty()
    }
}

fn collect_placeholders(value: &Value, out: &mut BTreeSet<usize>) -> Result<(), ProtocolError> {
    match value {
        Value::String(s) => {
            if let Some(idx) = placeholder_index(s)? {
                out.insert(idx);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_placeholders(item, out)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_placeholders(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Returns the slot index of a `$N.iface` / `&N` placeholder string.
pub(crate) fn placeholder_index(s: &str) -> Result<Option<usize>, ProtocolError> {
    let rest = match s.as_bytes().first() {
        Some(b'$') | Some(b'&') => &s[1..],
        _ => return Ok(None),
    };
    let digits = rest.split_once('.').map_or(rest, |(digits, _)| digits);
    digits
        .parse::<usize>()
        .map(Some)
        .map_err(|_| ProtocolError::CapData(format!("bad placeholder '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kref(s: &str) -> Kref {
        Kref::parse(s).unwrap()
    }

    #[test]
    fn accepts_matching_slots() {
        let cd = CapData::new(r##"#["$0.Alleged: purse","&1","$0"]"##, vec![kref("ko1"), kref("kp2")]);
        cd.insist().unwrap();
    }

    #[test]
    fn rejects_orphan_slot() {
        let cd = CapData::new(r##"#["$0"]"##, vec![kref("ko1"), kref("ko2")]);
        assert!(matches!(cd.insist(), Err(ProtocolError::CapData(_))));
    }

    #[test]
    fn rejects_dangling_placeholder() {
        let cd = CapData::new(r##"#{"a":"$1"}"##, vec![kref("ko1")]);
        assert!(cd.insist().is_err());
    }

    #[test]
    fn escaped_strings_are_not_placeholders() {
        let cd = CapData::new(r##"#"!$0""##, vec![]);
        cd.insist().unwrap();
    }

    #[test]
    fn opaque_body_without_slots_is_allowed() {
        CapData::new("pong", vec![]).insist().unwrap();
        assert!(CapData::new("pong", vec![kref("ko1")]).insist().is_err());
    }

    #[test]
    fn from_json_rejects_unknown_fields_and_bad_slots() {
        let extra = serde_json::json!({"body": "#null", "slots": [], "x": 1});
        assert!(CapData::from_json(&extra).is_err());
        let bad_slot = serde_json::json!({"body": "#\"$0\"", "slots": ["zz"]});
        assert!(CapData::from_json(&bad_slot).is_err());
        let good = serde_json::json!({"body": "#\"$0\"", "slots": ["o+1"]});
        assert_eq!(CapData::from_json(&good).unwrap().slots, vec![kref("o+1")]);
    }
}
