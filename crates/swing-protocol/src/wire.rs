//! Messages exchanged between a vat manager (kernel side) and its worker.
//!
//! Frames are JSON arrays `[tag, ...fields]`. The manager drives the
//! exchange; the worker only speaks when answering or while a delivery is in
//! flight (`syscall`, `testLog`).

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::capdata::CapData;
use crate::delivery::{VatDeliveryObject, VatDeliveryResult};
use crate::error::ProtocolError;
use crate::kref::VatId;
use crate::syscall::{VatSyscallObject, VatSyscallResult};
use crate::tuple;

const MANAGER: &str = "manager message";
const WORKER: &str = "worker message";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkerOptions {
    #[serde(default)]
    pub consensus_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vat_name: Option<String>,
    #[serde(default)]
    pub metered: bool,
}

/// Code and parameters for the vat a worker hosts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SetBundle {
    #[serde(rename = "vatID")]
    pub vat_id: VatId,
    pub bundle: Value,
    pub vat_parameters: CapData,
    #[serde(default)]
    pub options: WorkerOptions,
}

impl SetBundle {
    pub fn from_json(value: &Value) -> Result<Self, ProtocolError> {
        let set: SetBundle = serde_json::from_value(value.clone())
            .map_err(|err| ProtocolError::malformed(MANAGER, err.to_string()))?;
        set.vat_parameters.insist()?;
        Ok(set)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "vatID": self.vat_id.as_str(),
            "bundle": self.bundle,
            "vatParameters": self.vat_parameters.to_json(),
            "options": self.options,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ManagerMessage {
    SetUplink,
    SetBundle(Box<SetBundle>),
    Deliver(VatDeliveryObject),
    SyscallResponse(VatSyscallResult),
    Shutdown,
}

impl ManagerMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            ManagerMessage::SetUplink => "setUplink",
            ManagerMessage::SetBundle(_) => "setBundle",
            ManagerMessage::Deliver(_) => "deliver",
            ManagerMessage::SyscallResponse(_) => "syscallResponse",
            ManagerMessage::Shutdown => "shutdown",
        }
    }

    pub fn from_json(value: &Value) -> Result<Self, ProtocolError> {
        let (tag, fields) = tuple::split(MANAGER, value)?;
        Ok(match tag {
            "setUplink" => {
                tuple::arity(MANAGER, tag, fields, 0)?;
                ManagerMessage::SetUplink
            }
            "setBundle" => {
                tuple::arity(MANAGER, tag, fields, 1)?;
                ManagerMessage::SetBundle(Box::new(SetBundle::from_json(&fields[0])?))
            }
            "deliver" => {
                tuple::arity(MANAGER, tag, fields, 1)?;
                ManagerMessage::Deliver(VatDeliveryObject::from_json(&fields[0])?)
            }
            "syscallResponse" => {
                tuple::arity(MANAGER, tag, fields, 1)?;
                ManagerMessage::SyscallResponse(VatSyscallResult::from_json(&fields[0])?)
            }
            "shutdown" => {
                tuple::arity(MANAGER, tag, fields, 0)?;
                ManagerMessage::Shutdown
            }
            other => {
                return Err(ProtocolError::UnknownTag {
                    kind: MANAGER,
                    tag: other.to_string(),
                });
            }
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            ManagerMessage::SetUplink => json!(["setUplink"]),
            ManagerMessage::SetBundle(set) => json!(["setBundle", set.to_json()]),
            ManagerMessage::Deliver(delivery) => json!(["deliver", delivery.to_json()]),
            ManagerMessage::SyscallResponse(result) => json!(["syscallResponse", result.to_json()]),
            ManagerMessage::Shutdown => json!(["shutdown"]),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WorkerMessage {
    SetUplinkAck,
    GotBundle,
    DispatchReady,
    Syscall(VatSyscallObject),
    TestLog(Vec<String>),
    DeliverDone(VatDeliveryResult),
}

impl WorkerMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            WorkerMessage::SetUplinkAck => "setUplinkAck",
            WorkerMessage::GotBundle => "gotBundle",
            WorkerMessage::DispatchReady => "dispatchReady",
            WorkerMessage::Syscall(_) => "syscall",
            WorkerMessage::TestLog(_) => "testLog",
            WorkerMessage::DeliverDone(_) => "deliverDone",
        }
    }

    pub fn from_json(value: &Value) -> Result<Self, ProtocolError> {
        let (tag, fields) = tuple::split(WORKER, value)?;
        Ok(match tag {
            "setUplinkAck" | "gotBundle" | "dispatchReady" => {
                tuple::arity(WORKER, tag, fields, 0)?;
                match tag {
                    "setUplinkAck" => WorkerMessage::SetUplinkAck,
                    "gotBundle" => WorkerMessage::GotBundle,
                    _ => WorkerMessage::DispatchReady,
                }
            }
            "syscall" => {
                tuple::arity(WORKER, tag, fields, 1)?;
                WorkerMessage::Syscall(VatSyscallObject::from_json(&fields[0])?)
            }
            "testLog" => WorkerMessage::TestLog(
                fields
                    .iter()
                    .map(|field| tuple::string(WORKER, field))
                    .collect::<Result<_, _>>()?,
            ),
            "deliverDone" => {
                tuple::arity(WORKER, tag, fields, 1)?;
                WorkerMessage::DeliverDone(VatDeliveryResult::from_json(&fields[0])?)
            }
            other => {
                return Err(ProtocolError::UnknownTag {
                    kind: WORKER,
                    tag: other.to_string(),
                });
            }
        })
    }

    pub fn to_json(&self) -> Value {
        match self {
            WorkerMessage::SetUplinkAck | WorkerMessage::GotBundle | WorkerMessage::DispatchReady => {
                json!([self.tag()])
            }
            WorkerMessage::Syscall(syscall) => json!(["syscall", syscall.to_json()]),
            WorkerMessage::TestLog(lines) => {
                let mut out = vec![Value::String("testLog".into())];
                out.extend(lines.iter().cloned().map(Value::String));
                Value::Array(out)
            }
            WorkerMessage::DeliverDone(result) => json!(["deliverDone", result.to_json()]),
        }
    }
}
