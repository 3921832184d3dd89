//! Smallcaps marshalling between [`Passable`] values and [`CapData`].

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::capdata::{CapData, SMALLCAPS_PREFIX, placeholder_index};
use crate::error::ProtocolError;
use crate::kref::{Kref, KrefKind};

const ERROR_KEY: &str = "#error";

/// Structured value that can cross a vat boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum Passable {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    String(String),
    List(Vec<Passable>),
    Record(BTreeMap<String, Passable>),
    Remotable { kref: Kref, iface: Option<String> },
    Promise(Kref),
    Error {
        name: String,
        message: String,
        error_id: Option<String>,
    },
}

impl Passable {
    pub fn string(value: impl Into<String>) -> Self {
        Passable::String(value.into())
    }

    pub fn list(items: impl IntoIterator<Item = Passable>) -> Self {
        Passable::List(items.into_iter().collect())
    }

    pub fn record<K: Into<String>>(entries: impl IntoIterator<Item = (K, Passable)>) -> Self {
        Passable::Record(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn remotable(kref: Kref) -> Self {
        Passable::Remotable { kref, iface: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Passable::Error {
            name: "Error".into(),
            message: message.into(),
            error_id: None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Passable::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Passable]> {
        match self {
            Passable::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&BTreeMap<String, Passable>> {
        match self {
            Passable::Record(map) => Some(map),
            _ => None,
        }
    }

    /// Returns the value as a natural number, accepting bigints and
    /// integral numbers. Negative or fractional values yield `None`.
    pub fn as_nat(&self) -> Option<u64> {
        match self {
            Passable::BigInt(n) => u64::try_from(*n).ok(),
            Passable::Number(n) if n.fract() == 0.0 && *n >= 0.0 && *n <= u64::MAX as f64 => {
                Some(*n as u64)
            }
            _ => None,
        }
    }
}

/// Encodes a passable value as smallcaps CapData. A kref that appears more
/// than once reuses its slot.
pub fn encode(value: &Passable) -> Result<CapData, ProtocolError> {
    let mut encoder = Encoder::default();
    let json = encoder.encode(value)?;
    let body = format!("{SMALLCAPS_PREFIX}{}", serde_json::to_string(&json)?);
    Ok(CapData::new(body, encoder.slots))
}

/// Decodes smallcaps CapData, validating placeholders first.
pub fn decode(data: &CapData) -> Result<Passable, ProtocolError> {
    data.insist()?;
    let json = data
        .body
        .strip_prefix(SMALLCAPS_PREFIX)
        .ok_or_else(|| ProtocolError::Marshal("body is not smallcaps".into()))?;
    let parsed: Value = serde_json::from_str(json)?;
    decode_value(&parsed, &data.slots)
}

/// Encodes `[method, args]`.
pub fn encode_methargs(method: &str, args: Vec<Passable>) -> Result<CapData, ProtocolError> {
    encode(&Passable::List(vec![
        Passable::string(method),
        Passable::List(args),
    ]))
}

/// Decodes `[method, args]`, requiring a string method and a list of args.
pub fn decode_methargs(data: &CapData) -> Result<(String, Vec<Passable>), ProtocolError> {
    match decode(data)? {
        Passable::List(mut items) if items.len() == 2 => {
            let args = items.pop();
            let method = items.pop();
            match (method, args) {
                (Some(Passable::String(method)), Some(Passable::List(args))) => Ok((method, args)),
                _ => Err(ProtocolError::Marshal(
                    "methargs must be [string, list]".into(),
                )),
            }
        }
        _ => Err(ProtocolError::Marshal(
            "methargs must be a two-element list".into(),
        )),
    }
}

#[derive(Default)]
struct Encoder {
    slots: Vec<Kref>,
    index: BTreeMap<Kref, usize>,
}

impl Encoder {
    fn slot(&mut self, kref: &Kref) -> usize {
        if let Some(idx) = self.index.get(kref) {
            return *idx;
        }
        let idx = self.slots.len();
        self.slots.push(kref.clone());
        self.index.insert(kref.clone(), idx);
        idx
    }

    fn encode(&mut self, value: &Passable) -> Result<Value, ProtocolError> {
        Ok(match value {
            Passable::Undefined => Value::String("#undefined".into()),
            Passable::Null => Value::Null,
            Passable::Bool(b) => Value::Bool(*b),
            Passable::Number(n) => encode_number(*n),
            Passable::BigInt(n) if *n >= 0 => Value::String(format!("+{n}")),
            Passable::BigInt(n) => Value::String(n.to_string()),
            Passable::String(s) => Value::String(escape(s)),
            Passable::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.encode(item))
                    .collect::<Result<_, _>>()?,
            ),
            Passable::Record(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    if key.starts_with('#') {
                        return Err(ProtocolError::Marshal(format!(
                            "record key '{key}' is reserved"
                        )));
                    }
                    out.insert(key.clone(), self.encode(item)?);
                }
                Value::Object(out)
            }
            Passable::Remotable { kref, iface } => {
                if kref.kind() == KrefKind::Promise {
                    return Err(ProtocolError::Marshal(format!(
                        "promise {kref} cannot be a remotable"
                    )));
                }
                let idx = self.slot(kref);
                match iface {
                    Some(iface) => Value::String(format!("${idx}.{iface}")),
                    None => Value::String(format!("${idx}")),
                }
            }
            Passable::Promise(kref) => {
                kref.insist_kind(KrefKind::Promise)?;
                Value::String(format!("&{}", self.slot(kref)))
            }
            Passable::Error {
                name,
                message,
                error_id,
            } => {
                let mut out = Map::new();
                out.insert(ERROR_KEY.into(), Value::String(escape(message)));
                out.insert("name".into(), Value::String(escape(name)));
                if let Some(id) = error_id {
                    out.insert("errorId".into(), Value::String(escape(id)));
                }
                Value::Object(out)
            }
        })
    }
}

fn encode_number(n: f64) -> Value {
    if n.is_nan() {
        return Value::String("#NaN".into());
    }
    if n.is_infinite() {
        let text = if n > 0.0 { "#Infinity" } else { "#-Infinity" };
        return Value::String(text.into());
    }
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
}

/// Strings starting with `!` through `-` collide with encodings and get a
/// leading `!`.
fn starts_special(s: &str) -> bool {
    matches!(s.as_bytes().first(), Some(b'!'..=b'-'))
}

fn escape(s: &str) -> String {
    if starts_special(s) {
        format!("!{s}")
    } else {
        s.to_string()
    }
}

/// Reads a plain string field of a special record, undoing the `!` escape.
fn unescape_field(field: &str, value: &Value) -> Result<String, ProtocolError> {
    let s = value
        .as_str()
        .ok_or_else(|| ProtocolError::Marshal(format!("error {field} must be a string")))?;
    match s.strip_prefix('!') {
        Some(rest) => Ok(rest.to_string()),
        None if starts_special(s) => Err(ProtocolError::Marshal(format!(
            "unescaped error {field} '{s}'"
        ))),
        None => Ok(s.to_string()),
    }
}

fn decode_value(value: &Value, slots: &[Kref]) -> Result<Passable, ProtocolError> {
    Ok(match value {
        Value::Null => Passable::Null,
        Value::Bool(b) => Passable::Bool(*b),
        Value::Number(n) => Passable::Number(
            n.as_f64()
                .ok_or_else(|| ProtocolError::Marshal(format!("unrepresentable number {n}")))?,
        ),
        Value::String(s) => decode_string(s, slots)?,
        Value::Array(items) => Passable::List(
            items
                .iter()
                .map(|item| decode_value(item, slots))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            if let Some(message) = map.get(ERROR_KEY) {
                let message = unescape_field("message", message)?;
                let name = match map.get("name") {
                    Some(name) => unescape_field("name", name)?,
                    None => "Error".to_string(),
                };
                let error_id = map
                    .get("errorId")
                    .map(|id| unescape_field("errorId", id))
                    .transpose()?;
                return Ok(Passable::Error {
                    name,
                    message,
                    error_id,
                });
            }
            let mut out = BTreeMap::new();
            for (key, item) in map {
                if key.starts_with('#') {
                    return Err(ProtocolError::Marshal(format!(
                        "unsupported special record '{key}'"
                    )));
                }
                out.insert(key.clone(), decode_value(item, slots)?);
            }
            Passable::Record(out)
        }
    })
}

fn decode_string(s: &str, slots: &[Kref]) -> Result<Passable, ProtocolError> {
    let Some(first) = s.as_bytes().first() else {
        return Ok(Passable::String(String::new()));
    };
    match first {
        b'!' => Ok(Passable::String(s[1..].to_string())),
        b'#' => match s {
            "#undefined" => Ok(Passable::Undefined),
            "#NaN" => Ok(Passable::Number(f64::NAN)),
            "#Infinity" => Ok(Passable::Number(f64::INFINITY)),
            "#-Infinity" => Ok(Passable::Number(f64::NEG_INFINITY)),
            other => Err(ProtocolError::Marshal(format!(
                "unknown special value '{other}'"
            ))),
        },
        b'+' | b'-' => {
            let digits = if *first == b'+' { &s[1..] } else { s };
            digits
                .parse::<i128>()
                .map(Passable::BigInt)
                .map_err(|_| ProtocolError::Marshal(format!("bad bigint '{s}'")))
        }
        b'$' => {
            let idx = slot_index(s)?;
            let iface = s[1..].split_once('.').map(|(_, iface)| iface.to_string());
            let kref = slot_at(slots, idx)?;
            if kref.is_promise() {
                return Err(ProtocolError::Marshal(format!(
                    "remotable placeholder '{s}' names promise {kref}"
                )));
            }
            Ok(Passable::Remotable { kref, iface })
        }
        b'&' => {
            let kref = slot_at(slots, slot_index(s)?)?;
            kref.insist_kind(KrefKind::Promise)?;
            Ok(Passable::Promise(kref))
        }
        b'!'..=b'-' => Err(ProtocolError::Marshal(format!(
            "unsupported encoding '{s}'"
        ))),
        _ => Ok(Passable::String(s.to_string())),
    }
}

fn slot_index(s: &str) -> Result<usize, ProtocolError> {
    placeholder_index(s)?.ok_or_else(|| ProtocolError::Marshal(format!("bad placeholder '{s}'")))
}

fn slot_at(slots: &[Kref], idx: usize) -> Result<Kref, ProtocolError> {
    slots
        .get(idx)
        .cloned()
        .ok_or_else(|| ProtocolError::Marshal(format!("slot {idx} missing")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kref(s: &str) -> Kref {
        Kref::parse(s).unwrap()
    }

    #[test]
    fn nested_graph_survives_encode_decode() {
        let purse = kref("ko4");
        let value = Passable::record([
            ("purse", Passable::Remotable {
                kref: purse.clone(),
                iface: Some("Alleged: purse".into()),
            }),
            ("again", Passable::remotable(purse.clone())),
            ("pending", Passable::Promise(kref("kp9"))),
            (
                "list",
                Passable::list([
                    Passable::string("$not a slot"),
                    Passable::BigInt(-12),
                    Passable::BigInt(40),
                    Passable::Number(1.5),
                    Passable::Undefined,
                    Passable::Null,
                    Passable::Bool(true),
                ]),
            ),
        ]);
        let data = encode(&value).unwrap();
        assert_eq!(data.slots, vec![purse.clone(), kref("kp9")]);
        data.insist().unwrap();

        let decoded = decode(&data).unwrap();
        let record = decoded.as_record().unwrap();
        assert_eq!(
            record["again"],
            Passable::Remotable {
                kref: purse,
                iface: None
            }
        );
        assert_eq!(record["list"], value.as_record().unwrap()["list"]);
        assert_eq!(record["pending"], Passable::Promise(kref("kp9")));
    }

    #[test]
    fn special_strings_are_escaped() {
        let data = encode(&Passable::string("#undefined")).unwrap();
        assert_eq!(data.body, "#\"!#undefined\"");
        assert_eq!(decode(&data).unwrap(), Passable::string("#undefined"));
    }

    #[test]
    fn methargs_round_trip() {
        let data = encode_methargs("ping", vec![]).unwrap();
        assert_eq!(data.body, r##"#["ping",[]]"##);
        let (method, args) = decode_methargs(&data).unwrap();
        assert_eq!(method, "ping");
        assert!(args.is_empty());
    }

    #[test]
    fn methargs_shape_is_enforced() {
        let data = encode(&Passable::list([Passable::BigInt(1), Passable::list([])])).unwrap();
        assert!(decode_methargs(&data).is_err());
    }

    #[test]
    fn errors_keep_their_id() {
        let err = Passable::Error {
            name: "TypeError".into(),
            message: "boom".into(),
            error_id: Some("error:liveSlots:v1#70001".into()),
        };
        let data = encode(&err).unwrap();
        assert_eq!(decode(&data).unwrap(), err);
    }

    #[test]
    fn error_messages_that_look_like_encodings_are_escaped() {
        for message in ["$5 is too much", "&0", "!x", "#undefined", "-3 left"] {
            let err = Passable::error(message);
            let data = encode(&err).unwrap();
            assert!(data.slots.is_empty());
            data.insist().unwrap();
            assert_eq!(decode(&data).unwrap(), err, "{message}");
        }
        let data = encode(&Passable::error("&0")).unwrap();
        assert_eq!(data.body, r##"#{"#error":"!&0","name":"Error"}"##);
    }

    #[test]
    fn unescaped_error_fields_are_rejected() {
        let data = CapData::new(r##"#{"#error":"+1","name":"Error"}"##, vec![]);
        assert!(matches!(decode(&data), Err(ProtocolError::Marshal(_))));
    }

    #[test]
    fn natural_numbers() {
        assert_eq!(Passable::BigInt(5).as_nat(), Some(5));
        assert_eq!(Passable::Number(7.0).as_nat(), Some(7));
        assert_eq!(Passable::BigInt(-1).as_nat(), None);
        assert_eq!(Passable::Number(1.5).as_nat(), None);
        assert_eq!(Passable::string("3").as_nat(), None);
    }
}
