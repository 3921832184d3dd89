//! Kernel-to-vat deliveries and their results.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::capdata::CapData;
use crate::error::ProtocolError;
use crate::kref::{Kref, KrefKind};
use crate::message::Message;
use crate::tuple;

const DELIVERY: &str = "delivery";
const RESULT: &str = "delivery result";
const RESOLUTION: &str = "resolution";

/// One promise resolution: `[kpid, rejected, data]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VatOneResolution {
    pub kpid: Kref,
    pub rejected: bool,
    pub data: CapData,
}

impl VatOneResolution {
    pub fn new(kpid: Kref, rejected: bool, data: CapData) -> Self {
        Self {
            kpid,
            rejected,
            data,
        }
    }

    pub fn from_json(value: &Value) -> Result<Self, ProtocolError> {
        let items = value
            .as_array()
            .ok_or_else(|| ProtocolError::malformed(RESOLUTION, "expected [kpid, rejected, data]"))?;
        if items.len() != 3 {
            return Err(ProtocolError::malformed(
                RESOLUTION,
                format!("expected 3 fields, got {}", items.len()),
            ));
        }
        Ok(Self {
            kpid: tuple::kref_of(RESOLUTION, &items[0], KrefKind::Promise)?,
            rejected: tuple::boolean(RESOLUTION, &items[1])?,
            data: CapData::from_json(&items[2])?,
        })
    }

    pub fn to_json(&self) -> Value {
        json!([self.kpid.as_str(), self.rejected, self.data.to_json()])
    }
}

pub(crate) fn resolutions_from_json(
    kind: &'static str,
    value: &Value,
) -> Result<Vec<VatOneResolution>, ProtocolError> {
    let items = value
        .as_array()
        .ok_or_else(|| ProtocolError::malformed(kind, "expected a list of resolutions"))?;
    if items.is_empty() {
        return Err(ProtocolError::malformed(kind, "no resolutions"));
    }
    items.iter().map(VatOneResolution::from_json).collect()
}

pub(crate) fn resolutions_to_json(resolutions: &[VatOneResolution]) -> Value {
    Value::Array(resolutions.iter().map(VatOneResolution::to_json).collect())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VatDeliveryObject {
    Message { target: Kref, msg: Message },
    Notify(Vec<VatOneResolution>),
    DropExports(Vec<Kref>),
    RetireExports(Vec<Kref>),
    RetireImports(Vec<Kref>),
    StartVat(CapData),
    BringOutYourDead,
}

impl VatDeliveryObject {
    pub fn tag(&self) -> &'static str {
        match self {
            VatDeliveryObject::Message { .. } => "message",
            VatDeliveryObject::Notify(_) => "notify",
            VatDeliveryObject::DropExports(_) => "dropExports",
            VatDeliveryObject::RetireExports(_) => "retireExports",
            VatDeliveryObject::RetireImports(_) => "retireImports",
            VatDeliveryObject::StartVat(_) => "startVat",
            VatDeliveryObject::BringOutYourDead => "bringOutYourDead",
        }
    }

    pub fn from_json(value: &Value) -> Result<Self, ProtocolError> {
        let (tag, fields) = tuple::split(DELIVERY, value)?;
        let delivery = match tag {
            "message" => {
                tuple::arity(DELIVERY, tag, fields, 2)?;
                let target = tuple::kref(DELIVERY, &fields[0])?;
                if target.is_device() {
                    return Err(ProtocolError::malformed(
                        DELIVERY,
                        format!("cannot deliver a message to device {target}"),
                    ));
                }
                VatDeliveryObject::Message {
                    target,
                    msg: Message::from_json(&fields[1])?,
                }
            }
            "notify" => {
                tuple::arity(DELIVERY, tag, fields, 1)?;
                VatDeliveryObject::Notify(resolutions_from_json(DELIVERY, &fields[0])?)
            }
            "dropExports" | "retireExports" | "retireImports" => {
                tuple::arity(DELIVERY, tag, fields, 1)?;
                let krefs = tuple::object_list(DELIVERY, &fields[0])?;
                match tag {
                    "dropExports" => VatDeliveryObject::DropExports(krefs),
                    "retireExports" => VatDeliveryObject::RetireExports(krefs),
                    _ => VatDeliveryObject::RetireImports(krefs),
                }
            }
            "startVat" => {
                tuple::arity(DELIVERY, tag, fields, 1)?;
                VatDeliveryObject::StartVat(CapData::from_json(&fields[0])?)
            }
            "bringOutYourDead" => {
                tuple::arity(DELIVERY, tag, fields, 0)?;
                VatDeliveryObject::BringOutYourDead
            }
            other => {
                return Err(ProtocolError::UnknownTag {
                    kind: DELIVERY,
                    tag: other.to_string(),
                });
            }
        };
        Ok(delivery)
    }

    pub fn to_json(&self) -> Value {
        match self {
            VatDeliveryObject::Message { target, msg } => {
                json!(["message", target.as_str(), msg.to_json()])
            }
            VatDeliveryObject::Notify(resolutions) => {
                json!(["notify", resolutions_to_json(resolutions)])
            }
            VatDeliveryObject::DropExports(krefs)
            | VatDeliveryObject::RetireExports(krefs)
            | VatDeliveryObject::RetireImports(krefs) => {
                json!([self.tag(), tuple::kref_values(krefs)])
            }
            VatDeliveryObject::StartVat(params) => json!(["startVat", params.to_json()]),
            VatDeliveryObject::BringOutYourDead => json!(["bringOutYourDead"]),
        }
    }
}

/// Resource consumption reported by a metered worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeterUsage {
    pub compute: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VatDeliveryResult {
    Ok {
        usage: Option<MeterUsage>,
    },
    Error {
        problem: String,
        usage: Option<MeterUsage>,
    },
}

impl VatDeliveryResult {
    pub fn ok() -> Self {
        VatDeliveryResult::Ok { usage: None }
    }

    pub fn error(problem: impl Into<String>) -> Self {
        VatDeliveryResult::Error {
            problem: problem.into(),
            usage: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, VatDeliveryResult::Ok { .. })
    }

    pub fn tag(&self) -> &'static str {
        match self {
            VatDeliveryResult::Ok { .. } => "ok",
            VatDeliveryResult::Error { .. } => "error",
        }
    }

    pub fn usage(&self) -> Option<MeterUsage> {
        match self {
            VatDeliveryResult::Ok { usage } | VatDeliveryResult::Error { usage, .. } => *usage,
        }
    }

    pub fn with_usage(self, usage: Option<MeterUsage>) -> Self {
        match self {
            VatDeliveryResult::Ok { .. } => VatDeliveryResult::Ok { usage },
            VatDeliveryResult::Error { problem, .. } => VatDeliveryResult::Error { problem, usage },
        }
    }

    pub fn from_json(value: &Value) -> Result<Self, ProtocolError> {
        let (tag, fields) = tuple::split(RESULT, value)?;
        tuple::arity(RESULT, tag, fields, 2)?;
        let usage = match &fields[1] {
            Value::Null => None,
            other => Some(
                serde_json::from_value::<MeterUsage>(other.clone())
                    .map_err(|err| ProtocolError::malformed(RESULT, err.to_string()))?,
            ),
        };
        match tag {
            "ok" => {
                if !fields[0].is_null() {
                    return Err(ProtocolError::malformed(RESULT, "'ok' carries no problem"));
                }
                Ok(VatDeliveryResult::Ok { usage })
            }
            "error" => Ok(VatDeliveryResult::Error {
                problem: tuple::string(RESULT, &fields[0])?,
                usage,
            }),
            other => Err(ProtocolError::UnknownTag {
                kind: RESULT,
                tag: other.to_string(),
            }),
        }
    }

    pub fn to_json(&self) -> Value {
        let usage = match self.usage() {
            Some(usage) => json!({"compute": usage.compute}),
            None => Value::Null,
        };
        match self {
            VatDeliveryResult::Ok { .. } => json!(["ok", null, usage]),
            VatDeliveryResult::Error { problem, .. } => json!(["error", problem, usage]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_delivery_round_trip() {
        let msg = Message::call("ping", vec![], Some(Kref::parse("p+1").unwrap())).unwrap();
        let delivery = VatDeliveryObject::Message {
            target: Kref::parse("o+10").unwrap(),
            msg,
        };
        let json = delivery.to_json();
        assert_eq!(json[0], "message");
        assert_eq!(VatDeliveryObject::from_json(&json).unwrap(), delivery);
    }

    #[test]
    fn unknown_delivery_tag_is_rejected() {
        let err = VatDeliveryObject::from_json(&json!(["explode", 1])).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag { .. }));
    }

    #[test]
    fn notify_requires_promise_kpids() {
        let bad = json!(["notify", [["ko1", false, {"body": "#null", "slots": []}]]]);
        assert!(VatDeliveryObject::from_json(&bad).is_err());
        let good = json!(["notify", [["kp1", true, {"body": "#null", "slots": []}]]]);
        assert!(VatDeliveryObject::from_json(&good).is_ok());
    }

    #[test]
    fn gc_deliveries_require_objects() {
        assert!(VatDeliveryObject::from_json(&json!(["dropExports", ["kp1"]])).is_err());
        assert!(VatDeliveryObject::from_json(&json!(["dropExports", []])).is_err());
        let drop = VatDeliveryObject::from_json(&json!(["dropExports", ["ko1", "o+2"]])).unwrap();
        assert_eq!(drop.tag(), "dropExports");
    }

    #[test]
    fn results_carry_usage() {
        let res = VatDeliveryResult::error("boom").with_usage(Some(MeterUsage { compute: 12 }));
        let json = res.to_json();
        assert_eq!(json, json!(["error", "boom", {"compute": 12}]));
        assert_eq!(VatDeliveryResult::from_json(&json).unwrap(), res);
        assert!(VatDeliveryResult::from_json(&json!(["ok", "x", null])).is_err());
        assert!(VatDeliveryResult::from_json(&json!(["maybe", null, null])).is_err());
    }
}
