//! Kernel references and vat identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KrefKind {
    Object,
    Promise,
    Device,
}

impl fmt::Display for KrefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KrefKind::Object => "object",
            KrefKind::Promise => "promise",
            KrefKind::Device => "device",
        })
    }
}

/// Kernel-wide reference to an object, promise or device.
///
/// Two spellings are accepted: kernel-allocated (`ko12`, `kp3`, `kd1`) and
/// vat-named (`o+10`, `p-4`, `d+0`). The kind is carried by the letter.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Kref {
    raw: String,
    kind: KrefKind,
}

impl Kref {
    pub fn parse(raw: impl Into<String>) -> Result<Self, ProtocolError> {
        let raw = raw.into();
        let kind = parse_kind(&raw).ok_or_else(|| ProtocolError::InvalidKref(raw.clone()))?;
        Ok(Self { raw, kind })
    }

    pub fn object(id: u64) -> Self {
        Self {
            raw: format!("ko{id}"),
            kind: KrefKind::Object,
        }
    }

    pub fn promise(id: u64) -> Self {
        Self {
            raw: format!("kp{id}"),
            kind: KrefKind::Promise,
        }
    }

    pub fn device(id: u64) -> Self {
        Self {
            raw: format!("kd{id}"),
            kind: KrefKind::Device,
        }
    }

    /// Vat-named device node (`d+N`).
    pub fn device_node(id: u64) -> Self {
        Self {
            raw: format!("d+{id}"),
            kind: KrefKind::Device,
        }
    }

    pub fn kind(&self) -> KrefKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_object(&self) -> bool {
        self.kind == KrefKind::Object
    }

    pub fn is_promise(&self) -> bool {
        self.kind == KrefKind::Promise
    }

    pub fn is_device(&self) -> bool {
        self.kind == KrefKind::Device
    }

    pub fn insist_kind(&self, expected: KrefKind) -> Result<(), ProtocolError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(ProtocolError::WrongKrefKind {
                kref: self.raw.clone(),
                expected,
            })
        }
    }
}

fn parse_kind(raw: &str) -> Option<KrefKind> {
    let (kernel_form, rest) = match raw.strip_prefix('k') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let mut chars = rest.chars();
    let kind = match chars.next()? {
        'o' => KrefKind::Object,
        'p' => KrefKind::Promise,
        'd' => KrefKind::Device,
        _ => return None,
    };
    let digits = chars.as_str();
    let digits = if kernel_form {
        digits
    } else {
        digits
            .strip_prefix('+')
            .or_else(|| digits.strip_prefix('-'))?
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(kind)
}

impl TryFrom<String> for Kref {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Kref::parse(value)
    }
}

impl TryFrom<&str> for Kref {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Kref::parse(value)
    }
}

impl From<Kref> for String {
    fn from(value: Kref) -> Self {
        value.raw
    }
}

impl fmt::Debug for Kref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kref({})", self.raw)
    }
}

impl fmt::Display for Kref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Stable vat identifier (`v1`, `v2`, ...).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VatId(String);

impl VatId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, ProtocolError> {
        let raw = raw.into();
        match raw.strip_prefix('v') {
            Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
                Ok(Self(raw))
            }
            _ => Err(ProtocolError::InvalidVatId(raw)),
        }
    }

    pub fn from_index(index: u64) -> Self {
        Self(format!("v{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for VatId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        VatId::parse(value)
    }
}

impl From<VatId> for String {
    fn from(value: VatId) -> Self {
        value.0
    }
}

impl fmt::Debug for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VatId({})", self.0)
    }
}

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kernel_and_vat_spellings() {
        assert_eq!(Kref::parse("ko12").unwrap().kind(), KrefKind::Object);
        assert_eq!(Kref::parse("kp3").unwrap().kind(), KrefKind::Promise);
        assert_eq!(Kref::parse("kd1").unwrap().kind(), KrefKind::Device);
        assert_eq!(Kref::parse("o+10").unwrap().kind(), KrefKind::Object);
        assert_eq!(Kref::parse("p-4").unwrap().kind(), KrefKind::Promise);
        assert_eq!(Kref::parse("d+0").unwrap().kind(), KrefKind::Device);
    }

    #[test]
    fn rejects_malformed_krefs() {
        for bad in ["", "k", "ko", "kx1", "o10", "o+", "p+1a", "x+1", "kp-1", "v1"] {
            assert!(Kref::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn serde_validates_krefs() {
        let ok: Kref = serde_json::from_str("\"kp7\"").unwrap();
        assert!(ok.is_promise());
        assert!(serde_json::from_str::<Kref>("\"nope\"").is_err());
    }

    #[test]
    fn vat_ids() {
        assert_eq!(VatId::from_index(3).as_str(), "v3");
        assert!(VatId::parse("v").is_err());
        assert!(VatId::parse("vx").is_err());
        assert!(VatId::parse("ko1").is_err());
    }
}
