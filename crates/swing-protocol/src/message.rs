use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capdata::CapData;
use crate::error::ProtocolError;
use crate::kref::{Kref, KrefKind};
use crate::marshal::{self, Passable};

/// An eventual send: `[method, args]` plus an optional result promise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    pub methargs: CapData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Kref>,
}

impl Message {
    pub fn new(methargs: CapData, result: Option<Kref>) -> Self {
        Self { methargs, result }
    }

    /// Builds a message by marshalling `[method, args]`.
    pub fn call(
        method: &str,
        args: Vec<Passable>,
        result: Option<Kref>,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(marshal::encode_methargs(method, args)?, result))
    }

    pub fn from_json(value: &Value) -> Result<Self, ProtocolError> {
        let msg: Message = serde_json::from_value(value.clone())
            .map_err(|err| ProtocolError::Message(err.to_string()))?;
        msg.insist()?;
        Ok(msg)
    }

    pub fn to_json(&self) -> Value {
        let mut out = serde_json::Map::new();
        out.insert("methargs".into(), self.methargs.to_json());
        if let Some(result) = &self.result {
            out.insert("result".into(), Value::String(result.as_str().to_string()));
        }
        Value::Object(out)
    }

    pub fn insist(&self) -> Result<(), ProtocolError> {
        self.methargs.insist()?;
        if let Some(result) = &self.result {
            result
                .insist_kind(KrefKind::Promise)
                .map_err(|err| ProtocolError::Message(format!("result: {err}")))?;
        }
        Ok(())
    }

    /// Method name, when `methargs` decodes as `[method, args]`.
    pub fn method(&self) -> Option<String> {
        marshal::decode_methargs(&self.methargs)
            .ok()
            .map(|(method, _)| method)
    }

    /// Every kref the message touches: slots first, then the result.
    pub fn krefs(&self) -> impl Iterator<Item = &Kref> {
        self.methargs.slots.iter().chain(self.result.iter())
    }
}
