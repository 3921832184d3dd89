//! Vat-to-kernel syscalls and their results.

use serde_json::{Value, json};

use crate::capdata::CapData;
use crate::delivery::{VatOneResolution, resolutions_from_json, resolutions_to_json};
use crate::error::ProtocolError;
use crate::kref::{Kref, KrefKind};
use crate::message::Message;
use crate::tuple;

const SYSCALL: &str = "syscall";
const RESULT: &str = "syscall result";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VatSyscallObject {
    Send {
        target: Kref,
        msg: Message,
    },
    CallNow {
        target: Kref,
        methargs: CapData,
    },
    Subscribe(Kref),
    Resolve(Vec<VatOneResolution>),
    Exit {
        is_failure: bool,
        info: CapData,
    },
    VatstoreGet(String),
    VatstoreGetAfter {
        prior_key: String,
        lower_bound: String,
        upper_bound: Option<String>,
    },
    VatstoreSet {
        key: String,
        value: String,
    },
    VatstoreDelete(String),
    DropImports(Vec<Kref>),
    RetireImports(Vec<Kref>),
    RetireExports(Vec<Kref>),
}

impl VatSyscallObject {
    pub fn tag(&self) -> &'static str {
        match self {
            VatSyscallObject::Send { .. } => "send",
            VatSyscallObject::CallNow { .. } => "callNow",
            VatSyscallObject::Subscribe(_) => "subscribe",
            VatSyscallObject::Resolve(_) => "resolve",
            VatSyscallObject::Exit { .. } => "exit",
            VatSyscallObject::VatstoreGet(_) => "vatstoreGet",
            VatSyscallObject::VatstoreGetAfter { .. } => "vatstoreGetAfter",
            VatSyscallObject::VatstoreSet { .. } => "vatstoreSet",
            VatSyscallObject::VatstoreDelete(_) => "vatstoreDelete",
            VatSyscallObject::DropImports(_) => "dropImports",
            VatSyscallObject::RetireImports(_) => "retireImports",
            VatSyscallObject::RetireExports(_) => "retireExports",
        }
    }

    pub fn from_json(value: &Value) -> Result<Self, ProtocolError> {
        let (tag, fields) = tuple::split(SYSCALL, value)?;
        let syscall = match tag {
            "send" => {
                tuple::arity(SYSCALL, tag, fields, 2)?;
                VatSyscallObject::Send {
                    target: tuple::kref(SYSCALL, &fields[0])?,
                    msg: Message::from_json(&fields[1])?,
                }
            }
            "callNow" => {
                tuple::arity(SYSCALL, tag, fields, 2)?;
                VatSyscallObject::CallNow {
                    target: tuple::kref_of(SYSCALL, &fields[0], KrefKind::Device)?,
                    methargs: CapData::from_json(&fields[1])?,
                }
            }
            "subscribe" => {
                tuple::arity(SYSCALL, tag, fields, 1)?;
                VatSyscallObject::Subscribe(tuple::kref_of(SYSCALL, &fields[0], KrefKind::Promise)?)
            }
            "resolve" => {
                tuple::arity(SYSCALL, tag, fields, 1)?;
                VatSyscallObject::Resolve(resolutions_from_json(SYSCALL, &fields[0])?)
            }
            "exit" => {
                tuple::arity(SYSCALL, tag, fields, 2)?;
                VatSyscallObject::Exit {
                    is_failure: tuple::boolean(SYSCALL, &fields[0])?,
                    info: CapData::from_json(&fields[1])?,
                }
            }
            "vatstoreGet" => {
                tuple::arity(SYSCALL, tag, fields, 1)?;
                VatSyscallObject::VatstoreGet(tuple::string(SYSCALL, &fields[0])?)
            }
            "vatstoreGetAfter" => {
                tuple::arity(SYSCALL, tag, fields, 3)?;
                let upper_bound = match &fields[2] {
                    Value::Null => None,
                    other => Some(tuple::string(SYSCALL, other)?),
                };
                VatSyscallObject::VatstoreGetAfter {
                    prior_key: tuple::string(SYSCALL, &fields[0])?,
                    lower_bound: tuple::string(SYSCALL, &fields[1])?,
                    upper_bound,
                }
            }
            "vatstoreSet" => {
                tuple::arity(SYSCALL, tag, fields, 2)?;
                VatSyscallObject::VatstoreSet {
                    key: tuple::string(SYSCALL, &fields[0])?,
                    value: tuple::string(SYSCALL, &fields[1])?,
                }
            }
            "vatstoreDelete" => {
                tuple::arity(SYSCALL, tag, fields, 1)?;
                VatSyscallObject::VatstoreDelete(tuple::string(SYSCALL, &fields[0])?)
            }
            "dropImports" | "retireImports" | "retireExports" => {
                tuple::arity(SYSCALL, tag, fields, 1)?;
                let krefs = tuple::object_list(SYSCALL, &fields[0])?;
                match tag {
                    "dropImports" => VatSyscallObject::DropImports(krefs),
                    "retireImports" => VatSyscallObject::RetireImports(krefs),
                    _ => VatSyscallObject::RetireExports(krefs),
                }
            }
            other => {
                return Err(ProtocolError::UnknownTag {
                    kind: SYSCALL,
                    tag: other.to_string(),
                });
            }
        };
        Ok(syscall)
    }

    pub fn to_json(&self) -> Value {
        match self {
            VatSyscallObject::Send { target, msg } => json!(["send", target.as_str(), msg.to_json()]),
            VatSyscallObject::CallNow { target, methargs } => {
                json!(["callNow", target.as_str(), methargs.to_json()])
            }
            VatSyscallObject::Subscribe(kpid) => json!(["subscribe", kpid.as_str()]),
            VatSyscallObject::Resolve(resolutions) => {
                json!(["resolve", resolutions_to_json(resolutions)])
            }
            VatSyscallObject::Exit { is_failure, info } => {
                json!(["exit", is_failure, info.to_json()])
            }
            VatSyscallObject::VatstoreGet(key) => json!(["vatstoreGet", key]),
            VatSyscallObject::VatstoreGetAfter {
                prior_key,
                lower_bound,
                upper_bound,
            } => json!(["vatstoreGetAfter", prior_key, lower_bound, upper_bound]),
            VatSyscallObject::VatstoreSet { key, value } => json!(["vatstoreSet", key, value]),
            VatSyscallObject::VatstoreDelete(key) => json!(["vatstoreDelete", key]),
            VatSyscallObject::DropImports(krefs)
            | VatSyscallObject::RetireImports(krefs)
            | VatSyscallObject::RetireExports(krefs) => {
                json!([self.tag(), tuple::kref_values(krefs)])
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum VatSyscallResult {
    Ok(Value),
    Error(String),
}

impl VatSyscallResult {
    pub fn ok_null() -> Self {
        VatSyscallResult::Ok(Value::Null)
    }

    pub fn error(problem: impl Into<String>) -> Self {
        VatSyscallResult::Error(problem.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, VatSyscallResult::Ok(_))
    }

    pub fn from_json(value: &Value) -> Result<Self, ProtocolError> {
        let (tag, fields) = tuple::split(RESULT, value)?;
        tuple::arity(RESULT, tag, fields, 1)?;
        match tag {
            "ok" => Ok(VatSyscallResult::Ok(fields[0].clone())),
            "error" => Ok(VatSyscallResult::Error(tuple::string(RESULT, &fields[0])?)),
            other => Err(ProtocolError::UnknownTag {
                kind: RESULT,
                tag: other.to_string(),
            }),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            VatSyscallResult::Ok(data) => json!(["ok", data]),
            VatSyscallResult::Error(problem) => json!(["error", problem]),
        }
    }
}
