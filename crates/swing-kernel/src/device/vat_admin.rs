//! The vat-admin device: bundlecaps, meters and dynamic vat lifecycle.
//!
//! The root node is `d+0`. Bundlecaps are further device nodes `d+N`,
//! allocated the first time a vat asks for a given bundle and reused after
//! that. The node table lives in durable device state, so nothing is written
//! until a bundlecap is actually handed out.

use std::collections::BTreeMap;

use swing_protocol::{CapData, Kref, Passable, VatId, decode_methargs, marshal};
use swing_store::{Bundle, BundleId};

use super::VatAdminEndowments;
use crate::error::DeviceError;
use crate::state::{MeterId, VatOptions};

pub const ROOT_NODE: &str = "d+0";
const NEXT_NODE_KEY: &str = "vatAdmin.nextBundleCap";
const BY_ID_PREFIX: &str = "vatAdmin.bundleCap.byID.";
const BY_NODE_PREFIX: &str = "vatAdmin.bundleCap.byNode.";

#[derive(Clone, Copy, Debug, Default)]
pub struct VatAdminDevice;

impl VatAdminDevice {
    pub fn new() -> Self {
        Self
    }

    pub fn root() -> Kref {
        Kref::device_node(0)
    }

    /// Whether `kref` names one of this device's nodes.
    pub fn owns(kref: &Kref) -> bool {
        kref.is_device() && kref.as_str().starts_with("d+")
    }

    /// Synchronously invokes `methargs` on `target`.
    pub fn invoke(
        &self,
        endowments: &mut dyn VatAdminEndowments,
        target: &Kref,
        methargs: &CapData,
    ) -> Result<CapData, DeviceError> {
        let (method, args) = decode_methargs(methargs)?;
        let result = if target.as_str() == ROOT_NODE {
            self.invoke_root(endowments, &method, &args)?
        } else if Self::owns(target) {
            self.invoke_bundlecap(endowments, target, &method, &args)?
        } else {
            return Err(DeviceError::UnknownNode(target.clone()));
        };
        Ok(marshal::encode(&result)?)
    }

    fn invoke_root(
        &self,
        endowments: &mut dyn VatAdminEndowments,
        method: &str,
        args: &[Passable],
    ) -> Result<Passable, DeviceError> {
        match method {
            "getBundleCap" => {
                arity(method, args, 1)?;
                let bundle_id = bundle_id_arg(method, args, 0)?;
                if !endowments.has_bundle(&bundle_id)? {
                    return Ok(Passable::Null);
                }
                Ok(Passable::remotable(bundlecap(endowments, &bundle_id)?))
            }
            "getNamedBundleCap" => {
                arity(method, args, 1)?;
                let bundle_id = named_bundle(endowments, method, args)?;
                Ok(Passable::remotable(bundlecap(endowments, &bundle_id)?))
            }
            "getBundleIDByName" => {
                arity(method, args, 1)?;
                let bundle_id = named_bundle(endowments, method, args)?;
                Ok(Passable::string(bundle_id.as_str()))
            }
            "createMeter" => {
                arity(method, args, 2)?;
                let remaining = nat_arg(method, args, 0)?;
                let threshold = nat_arg(method, args, 1)?;
                let meter_id = endowments.meter_create(Some(remaining), threshold);
                Ok(Passable::string(meter_id.as_str()))
            }
            "createUnlimitedMeter" => {
                arity(method, args, 0)?;
                let meter_id = endowments.meter_create(None, 0);
                Ok(Passable::string(meter_id.as_str()))
            }
            "addMeterRemaining" => {
                arity(method, args, 2)?;
                let meter_id = meter_arg(method, args, 0)?;
                let delta = nat_arg(method, args, 1)?;
                endowments.meter_add_remaining(&meter_id, delta)?;
                Ok(Passable::Undefined)
            }
            "setMeterThreshold" => {
                arity(method, args, 2)?;
                let meter_id = meter_arg(method, args, 0)?;
                let threshold = nat_arg(method, args, 1)?;
                endowments.meter_set_threshold(&meter_id, threshold)?;
                Ok(Passable::Undefined)
            }
            "getMeter" => {
                arity(method, args, 1)?;
                let meter = endowments.meter_get(&meter_arg(method, args, 0)?)?;
                let remaining = match meter.remaining {
                    Some(n) => Passable::BigInt(i128::from(n)),
                    None => Passable::string("unlimited"),
                };
                Ok(Passable::record([
                    ("remaining", remaining),
                    ("threshold", Passable::BigInt(i128::from(meter.threshold))),
                ]))
            }
            "createByBundle" => {
                arity_range(method, args, 1, 2)?;
                let raw = str_arg(method, args, 0)?;
                let bundle = serde_json::from_str(raw)
                    .map_err(|err| DeviceError::bad_args(method, err.to_string()))
                    .and_then(|value| {
                        Bundle::from_json(&value)
                            .map_err(|err| DeviceError::bad_args(method, err.to_string()))
                    })?;
                let options = vat_options(method, args.get(1))?;
                let vat_id = endowments.push_create_vat_bundle_event(bundle, options)?;
                Ok(Passable::string(vat_id.as_str()))
            }
            "createByBundleID" => {
                arity_range(method, args, 1, 2)?;
                let bundle_id = bundle_id_arg(method, args, 0)?;
                let options = vat_options(method, args.get(1))?;
                let vat_id = endowments.push_create_vat_id_event(bundle_id, options)?;
                Ok(Passable::string(vat_id.as_str()))
            }
            "upgradeVat" => {
                arity_range(method, args, 2, 3)?;
                let vat_id = vat_arg(method, args, 0)?;
                let bundle_id = bundle_id_arg(method, args, 1)?;
                let (vat_parameters, upgrade_message) = upgrade_options(method, args.get(2))?;
                endowments.push_upgrade_vat_event(
                    &vat_id,
                    bundle_id,
                    vat_parameters,
                    upgrade_message,
                )?;
                Ok(Passable::Undefined)
            }
            "terminateWithFailure" => {
                arity(method, args, 2)?;
                let vat_id = vat_arg(method, args, 0)?;
                let reason = marshal::encode(&args[1])?;
                if reason.has_slots() {
                    return Err(DeviceError::SlotsNotAllowed {
                        method: method.to_string(),
                        what: "reason",
                    });
                }
                endowments.terminate(&vat_id, reason)?;
                Ok(Passable::Undefined)
            }
            other => Err(DeviceError::UnknownMethod {
                node: ROOT_NODE.to_string(),
                method: other.to_string(),
            }),
        }
    }

    fn invoke_bundlecap(
        &self,
        endowments: &mut dyn VatAdminEndowments,
        node: &Kref,
        method: &str,
        args: &[Passable],
    ) -> Result<Passable, DeviceError> {
        let bundle_id = endowments
            .get_state(&format!("{BY_NODE_PREFIX}{node}"))
            .and_then(|raw| BundleId::parse(raw).ok())
            .ok_or_else(|| DeviceError::UnknownNode(node.clone()))?;
        arity(method, args, 0)?;
        match method {
            "getBundleID" => Ok(Passable::string(bundle_id.as_str())),
            "getBundle" => {
                let bundle = endowments.get_bundle(&bundle_id)?;
                Ok(Passable::string(bundle.to_json().to_string()))
            }
            other => Err(DeviceError::UnknownMethod {
                node: node.to_string(),
                method: other.to_string(),
            }),
        }
    }
}

/// Returns the bundlecap node for an installed bundle, allocating it on
/// first use.
fn bundlecap(
    endowments: &mut dyn VatAdminEndowments,
    bundle_id: &BundleId,
) -> Result<Kref, DeviceError> {
    let by_id = format!("{BY_ID_PREFIX}{bundle_id}");
    if let Some(existing) = endowments.get_state(&by_id) {
        return Kref::parse(existing).map_err(DeviceError::from);
    }
    let next = endowments
        .get_state(NEXT_NODE_KEY)
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(1);
    let node = Kref::device_node(next);
    endowments.set_state(NEXT_NODE_KEY, &(next + 1).to_string());
    endowments.set_state(&by_id, node.as_str());
    endowments.set_state(&format!("{BY_NODE_PREFIX}{node}"), bundle_id.as_str());
    Ok(node)
}

fn named_bundle(
    endowments: &dyn VatAdminEndowments,
    method: &str,
    args: &[Passable],
) -> Result<BundleId, DeviceError> {
    let name = str_arg(method, args, 0)?;
    endowments
        .get_named_bundle_id(name)?
        .ok_or_else(|| DeviceError::UnknownBundleName(name.to_string()))
}

fn arity(method: &str, args: &[Passable], expected: usize) -> Result<(), DeviceError> {
    arity_range(method, args, expected, expected)
}

fn arity_range(method: &str, args: &[Passable], min: usize, max: usize) -> Result<(), DeviceError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{min} to {max}")
        };
        return Err(DeviceError::bad_args(
            method,
            format!("expected {expected} arguments, got {}", args.len()),
        ));
    }
    Ok(())
}

fn str_arg<'a>(method: &str, args: &'a [Passable], idx: usize) -> Result<&'a str, DeviceError> {
    args.get(idx)
        .and_then(Passable::as_str)
        .ok_or_else(|| DeviceError::bad_args(method, format!("argument {idx} must be a string")))
}

fn nat_arg(method: &str, args: &[Passable], idx: usize) -> Result<u64, DeviceError> {
    args.get(idx).and_then(Passable::as_nat).ok_or_else(|| {
        DeviceError::bad_args(
            method,
            format!("argument {idx} must be a non-negative integer"),
        )
    })
}

fn bundle_id_arg(method: &str, args: &[Passable], idx: usize) -> Result<BundleId, DeviceError> {
    BundleId::parse(str_arg(method, args, idx)?)
        .map_err(|err| DeviceError::bad_args(method, err.to_string()))
}

fn vat_arg(method: &str, args: &[Passable], idx: usize) -> Result<VatId, DeviceError> {
    VatId::parse(str_arg(method, args, idx)?)
        .map_err(|err| DeviceError::bad_args(method, err.to_string()))
}

fn meter_arg(method: &str, args: &[Passable], idx: usize) -> Result<MeterId, DeviceError> {
    MeterId::parse(str_arg(method, args, idx)?).map_err(|reason| DeviceError::bad_args(method, reason))
}

/// Options records are plain data; remotables and promises are refused.
fn options_record<'a>(
    method: &str,
    value: Option<&'a Passable>,
) -> Result<Option<&'a BTreeMap<String, Passable>>, DeviceError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if matches!(value, Passable::Undefined) {
        return Ok(None);
    }
    if marshal::encode(value)?.has_slots() {
        return Err(DeviceError::SlotsNotAllowed {
            method: method.to_string(),
            what: "options",
        });
    }
    value
        .as_record()
        .map(Some)
        .ok_or_else(|| DeviceError::bad_args(method, "options must be a record"))
}

fn vat_options(method: &str, value: Option<&Passable>) -> Result<VatOptions, DeviceError> {
    let mut options = VatOptions::default();
    let Some(record) = options_record(method, value)? else {
        return Ok(options);
    };
    for (key, value) in record {
        match (key.as_str(), value) {
            ("name", Passable::String(name)) => options.name = Some(name.clone()),
            ("vatParameters", params) => options.vat_parameters = marshal::encode(params)?,
            ("meterID", Passable::String(raw)) => {
                options.meter_id =
                    Some(MeterId::parse(raw.as_str()).map_err(|reason| DeviceError::bad_args(method, reason))?);
            }
            ("critical", Passable::Bool(critical)) => options.critical = *critical,
            ("name" | "meterID" | "critical", _) => {
                return Err(DeviceError::bad_args(method, format!("option '{key}' has the wrong type")));
            }
            (other, _) => {
                return Err(DeviceError::bad_args(method, format!("unknown option '{other}'")));
            }
        }
    }
    Ok(options)
}

fn upgrade_options(
    method: &str,
    value: Option<&Passable>,
) -> Result<(CapData, String), DeviceError> {
    let mut vat_parameters = VatOptions::default().vat_parameters;
    let mut upgrade_message = String::new();
    if let Some(record) = options_record(method, value)? {
        for (key, value) in record {
            match (key.as_str(), value) {
                ("vatParameters", params) => vat_parameters = marshal::encode(params)?,
                ("upgradeMessage", Passable::String(message)) => upgrade_message = message.clone(),
                (other, _) => {
                    return Err(DeviceError::bad_args(method, format!("bad option '{other}'")));
                }
            }
        }
    }
    Ok((vat_parameters, upgrade_message))
}

#[cfg(test)]
mod tests {
    use swing_store::{BundleStore, MemBundleStore};

    use super::*;
    use crate::device::KernelEndowments;
    use crate::state::{KernelKeeper, MemKernelKeeper, MeterRecord, QueueEntry};

    struct Fixture {
        keeper: MemKernelKeeper,
        bundles: MemBundleStore,
        terminations: Vec<(VatId, CapData)>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                keeper: MemKernelKeeper::new(),
                bundles: MemBundleStore::new(),
                terminations: Vec::new(),
            }
        }

        fn call(&mut self, target: &Kref, method: &str, args: Vec<Passable>) -> Result<Passable, DeviceError> {
            let methargs = marshal::encode_methargs(method, args).unwrap();
            let mut endowments =
                KernelEndowments::new(&mut self.keeper, &self.bundles, &mut self.terminations);
            let result = VatAdminDevice::new().invoke(&mut endowments, target, &methargs)?;
            Ok(marshal::decode(&result).unwrap())
        }

        fn root(&mut self, method: &str, args: Vec<Passable>) -> Result<Passable, DeviceError> {
            self.call(&VatAdminDevice::root(), method, args)
        }

        fn install(&self, name: &str) -> BundleId {
            let id = self.bundles.put_bundle(&Bundle::native(name)).unwrap();
            self.bundles.set_bundle_name(name, &id).unwrap();
            id
        }
    }

    fn remotable_kref(value: &Passable) -> Kref {
        match value {
            Passable::Remotable { kref, .. } => kref.clone(),
            other => panic!("expected a remotable, got {other:?}"),
        }
    }

    #[test]
    fn construction_writes_no_state() {
        let fixture = Fixture::new();
        let _device = VatAdminDevice::new();
        assert_eq!(fixture.keeper.device_state_get(NEXT_NODE_KEY), None);
    }

    #[test]
    fn bundlecaps_are_allocated_once_per_bundle() {
        let mut fixture = Fixture::new();
        let alpha = fixture.install("alpha");
        let beta = fixture.install("beta");

        let first = remotable_kref(&fixture.root("getBundleCap", vec![Passable::string(alpha.as_str())]).unwrap());
        let again = remotable_kref(&fixture.root("getBundleCap", vec![Passable::string(alpha.as_str())]).unwrap());
        let other = remotable_kref(&fixture.root("getBundleCap", vec![Passable::string(beta.as_str())]).unwrap());
        let named = remotable_kref(&fixture.root("getNamedBundleCap", vec![Passable::string("alpha")]).unwrap());
        assert_eq!(first, again);
        assert_eq!(first, named);
        assert_ne!(first, other);
        assert_eq!(first.as_str(), "d+1");

        let id = fixture.call(&first, "getBundleID", vec![]).unwrap();
        assert_eq!(id, Passable::string(alpha.as_str()));
        let raw = fixture.call(&first, "getBundle", vec![]).unwrap();
        let bundle = Bundle::from_json(&serde_json::from_str(raw.as_str().unwrap()).unwrap()).unwrap();
        assert_eq!(bundle, Bundle::native("alpha"));
    }

    #[test]
    fn missing_bundles_give_null_and_unknown_names_fail() {
        let mut fixture = Fixture::new();
        let missing = Bundle::native("nowhere").id().unwrap();
        assert_eq!(
            fixture.root("getBundleCap", vec![Passable::string(missing.as_str())]).unwrap(),
            Passable::Null
        );
        assert_eq!(fixture.keeper.device_state_get(NEXT_NODE_KEY), None);
        assert_eq!(
            fixture.root("getNamedBundleCap", vec![Passable::string("nowhere")]),
            Err(DeviceError::UnknownBundleName("nowhere".into()))
        );
        assert!(matches!(
            fixture.call(&Kref::device_node(7), "getBundleID", vec![]),
            Err(DeviceError::UnknownNode(_))
        ));
    }

    #[test]
    fn meters_require_natural_numbers() {
        let mut fixture = Fixture::new();
        let meter = fixture
            .root("createMeter", vec![Passable::BigInt(100), Passable::Number(10.0)])
            .unwrap();
        let meter_id = meter.as_str().unwrap().to_string();
        fixture
            .root("addMeterRemaining", vec![Passable::string(&meter_id), Passable::BigInt(5)])
            .unwrap();
        fixture
            .root("setMeterThreshold", vec![Passable::string(&meter_id), Passable::BigInt(20)])
            .unwrap();
        assert_eq!(
            fixture.keeper.get_meter(&MeterId::parse(meter_id.clone()).unwrap()),
            Some(MeterRecord {
                remaining: Some(105),
                threshold: 20,
            })
        );
        let reported = fixture.root("getMeter", vec![Passable::string(&meter_id)]).unwrap();
        assert_eq!(
            reported,
            Passable::record([
                ("remaining", Passable::BigInt(105)),
                ("threshold", Passable::BigInt(20)),
            ])
        );

        for bad in [Passable::BigInt(-1), Passable::Number(1.5), Passable::string("7")] {
            assert!(matches!(
                fixture.root("createMeter", vec![bad.clone(), Passable::BigInt(0)]),
                Err(DeviceError::BadArgs { .. })
            ));
            assert!(matches!(
                fixture.root("addMeterRemaining", vec![Passable::string(&meter_id), bad]),
                Err(DeviceError::BadArgs { .. })
            ));
        }
        assert!(matches!(
            fixture.root("getMeter", vec![Passable::string("m99")]),
            Err(DeviceError::UnknownMeter(_))
        ));

        let unlimited = fixture.root("createUnlimitedMeter", vec![]).unwrap();
        let reported = fixture.root("getMeter", vec![unlimited]).unwrap();
        assert_eq!(
            reported.as_record().unwrap().get("remaining"),
            Some(&Passable::string("unlimited"))
        );
    }

    #[test]
    fn meter_top_ups_may_not_overflow() {
        let mut fixture = Fixture::new();
        let start = i128::from(u64::MAX - 1);
        let meter = fixture
            .root("createMeter", vec![Passable::BigInt(start), Passable::BigInt(0)])
            .unwrap();
        let meter_id = meter.as_str().unwrap().to_string();
        assert!(matches!(
            fixture.root("addMeterRemaining", vec![Passable::string(&meter_id), Passable::BigInt(2)]),
            Err(DeviceError::BadArgs { .. })
        ));
        let parsed = MeterId::parse(meter_id.clone()).unwrap();
        assert_eq!(fixture.keeper.get_meter(&parsed).unwrap().remaining, Some(u64::MAX - 1));

        fixture
            .root("addMeterRemaining", vec![Passable::string(&meter_id), Passable::BigInt(1)])
            .unwrap();
        assert_eq!(fixture.keeper.get_meter(&parsed).unwrap().remaining, Some(u64::MAX));
    }

    #[test]
    fn create_by_bundle_id_queues_a_vat() {
        let mut fixture = Fixture::new();
        let alpha = fixture.install("alpha");
        let options = Passable::record([
            ("name", Passable::string("alice")),
            ("critical", Passable::Bool(true)),
            ("vatParameters", Passable::record([("count", Passable::BigInt(3))])),
        ]);
        let vat = fixture
            .root("createByBundleID", vec![Passable::string(alpha.as_str()), options])
            .unwrap();
        let vat_id = VatId::parse(vat.as_str().unwrap()).unwrap();
        match fixture.keeper.queued().as_slice() {
            [QueueEntry::CreateVat { vat_id: queued, bundle_id, options }] => {
                assert_eq!(queued, &vat_id);
                assert_eq!(bundle_id, &alpha);
                assert_eq!(options.name.as_deref(), Some("alice"));
                assert!(options.critical);
                assert_eq!(
                    marshal::decode(&options.vat_parameters).unwrap(),
                    Passable::record([("count", Passable::BigInt(3))])
                );
            }
            other => panic!("unexpected queue {other:?}"),
        }
    }

    #[test]
    fn create_by_bundle_installs_the_bundle() {
        let mut fixture = Fixture::new();
        let bundle = Bundle::native("gamma");
        let raw = bundle.to_json().to_string();
        let vat = fixture.root("createByBundle", vec![Passable::string(raw)]).unwrap();
        assert!(vat.as_str().is_some());
        assert!(fixture.bundles.has_bundle(&bundle.id().unwrap()).unwrap());
    }

    #[test]
    fn slots_are_refused_in_options_and_reasons() {
        let mut fixture = Fixture::new();
        let alpha = fixture.install("alpha");
        let cap = Passable::remotable(Kref::object(4));
        assert_eq!(
            fixture.root(
                "createByBundleID",
                vec![
                    Passable::string(alpha.as_str()),
                    Passable::record([("vatParameters", cap.clone())]),
                ],
            ),
            Err(DeviceError::SlotsNotAllowed {
                method: "createByBundleID".into(),
                what: "options",
            })
        );
        assert!(matches!(
            fixture.root("terminateWithFailure", vec![Passable::string("v1"), cap]),
            Err(DeviceError::SlotsNotAllowed { what: "reason", .. })
        ));
        assert!(fixture.keeper.queued().is_empty());
    }

    #[test]
    fn termination_forwards_the_reason() {
        let mut fixture = Fixture::new();
        let alpha = fixture.install("alpha");
        let vat = fixture
            .root("createByBundleID", vec![Passable::string(alpha.as_str())])
            .unwrap();
        let reason = Passable::record([("why", Passable::string("bored"))]);
        fixture
            .root("terminateWithFailure", vec![vat.clone(), reason.clone()])
            .unwrap();
        assert_eq!(fixture.terminations.len(), 1);
        assert_eq!(fixture.terminations[0].0.as_str(), vat.as_str().unwrap());
        assert_eq!(marshal::decode(&fixture.terminations[0].1).unwrap(), reason);
        assert!(matches!(
            fixture.root("terminateWithFailure", vec![Passable::string("v42"), reason]),
            Err(DeviceError::UnknownVat(_))
        ));
    }

    #[test]
    fn unknown_methods_are_usage_errors() {
        let mut fixture = Fixture::new();
        assert!(matches!(
            fixture.root("selfDestruct", vec![]),
            Err(DeviceError::UnknownMethod { .. })
        ));
    }
}
