use std::collections::BTreeMap;
use std::fmt;

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_cbor::value::Value as CborValue;
use sha2::{Digest, Sha256};

use crate::{StoreError, StoreResult};

pub const BUNDLE_ID_PREFIX: &str = "b1-";

/// Serialize a value into canonical CBOR bytes (sorted map keys,
/// self-describe tag).
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    let canonical: CborValue = serde_cbor::value::to_value(value)?;
    let mut buf = Vec::with_capacity(256);
    let mut serializer = serde_cbor::ser::Serializer::new(&mut buf);
    serializer.self_describe()?;
    canonical.serialize(&mut serializer)?;
    Ok(buf)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleFormat {
    /// Entry module is a wasm vat.
    Wasm,
    /// Entry names a vat builder registered with the worker.
    Native,
}

/// Vat code: an entry point plus named modules (base64 bytes).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Bundle {
    pub module_format: ModuleFormat,
    pub entry: String,
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    module_format: ModuleFormat,
    entry: &'a str,
    modules: BTreeMap<&'a str, String>,
}

impl Bundle {
    pub fn new<N: Into<String>>(
        module_format: ModuleFormat,
        entry: impl Into<String>,
        modules: impl IntoIterator<Item = (N, Vec<u8>)>,
    ) -> Self {
        Self {
            module_format,
            entry: entry.into(),
            modules: modules
                .into_iter()
                .map(|(name, bytes)| (name.into(), BASE64_STANDARD.encode(bytes)))
                .collect(),
        }
    }

    /// Single-module wasm bundle.
    pub fn wasm(bytes: Vec<u8>) -> Self {
        Self::new(ModuleFormat::Wasm, "vat.wasm", [("vat.wasm", bytes)])
    }

    /// Native bundle naming a registered vat builder.
    pub fn native(builder: impl Into<String>) -> Self {
        Self::new(ModuleFormat::Native, builder, Vec::<(String, Vec<u8>)>::new())
    }

    pub fn module_bytes(&self, name: &str) -> StoreResult<Vec<u8>> {
        let encoded = self
            .modules
            .get(name)
            .ok_or_else(|| StoreError::InvalidBundle(format!("module '{name}' missing")))?;
        BASE64_STANDARD
            .decode(encoded)
            .map_err(|err| StoreError::InvalidBundle(format!("module '{name}': {err}")))
    }

    pub fn entry_bytes(&self) -> StoreResult<Vec<u8>> {
        self.module_bytes(&self.entry)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.entry.is_empty() {
            return Err(StoreError::InvalidBundle("entry is empty".into()));
        }
        if self.module_format == ModuleFormat::Wasm && !self.modules.contains_key(&self.entry) {
            return Err(StoreError::InvalidBundle(format!(
                "wasm entry '{}' is not a module",
                self.entry
            )));
        }
        for name in self.modules.keys() {
            self.module_bytes(name)?;
        }
        Ok(())
    }

    /// `b1-` + sha256 of the canonical CBOR manifest, where each module is
    /// replaced by the sha256 hex of its bytes.
    pub fn id(&self) -> StoreResult<BundleId> {
        self.validate()?;
        let mut modules = BTreeMap::new();
        for name in self.modules.keys() {
            let bytes = self.module_bytes(name)?;
            modules.insert(name.as_str(), hex::encode(Sha256::digest(&bytes)));
        }
        let manifest = Manifest {
            module_format: self.module_format,
            entry: &self.entry,
            modules,
        };
        let bytes = to_canonical_cbor(&manifest)?;
        Ok(BundleId(format!(
            "{BUNDLE_ID_PREFIX}{}",
            hex::encode(Sha256::digest(&bytes))
        )))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_json(value: &serde_json::Value) -> StoreResult<Self> {
        let bundle: Bundle = serde_json::from_value(value.clone())?;
        bundle.validate()?;
        Ok(bundle)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BundleId(String);

impl BundleId {
    pub fn parse(raw: impl Into<String>) -> StoreResult<Self> {
        let raw = raw.into();
        let valid = raw.strip_prefix(BUNDLE_ID_PREFIX).is_some_and(|digest| {
            digest.len() == 64 && digest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        });
        if valid {
            Ok(Self(raw))
        } else {
            Err(StoreError::InvalidBundleId(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BundleId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BundleId::parse(value)
    }
}

impl From<BundleId> for String {
    fn from(value: BundleId) -> Self {
        value.0
    }
}

impl fmt::Debug for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BundleId").field(&self.0).finish()
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
