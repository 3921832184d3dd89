#![allow(dead_code)]

//! A scriptable native vat used by kernel tests.
//!
//! Also compiled into the integration tests by path, so it only depends on
//! the published crates.

use std::sync::{Arc, Mutex};

use swing_protocol::{
    CapData, Kref, Message, MeterUsage, Passable, VatDeliveryObject, VatDeliveryResult,
    VatOneResolution, VatSyscallObject, VatSyscallResult, marshal,
};
use swing_store::Bundle;
use swing_worker::{NativeVatContext, NativeVatRegistry, SyscallHandle, VatDispatch};

pub const ACTOR: &str = "actor";

pub fn registry() -> NativeVatRegistry {
    registry_with(None)
}

/// Like [`registry`], but every actor also appends to `journal`.
pub fn journaled_registry(journal: Journal) -> NativeVatRegistry {
    registry_with(Some(journal))
}

fn registry_with(journal: Option<Journal>) -> NativeVatRegistry {
    let registry = NativeVatRegistry::new();
    registry.register(ACTOR, move |ctx: NativeVatContext| {
        Ok(Box::new(Actor::new(ctx, journal.clone())) as Box<dyn VatDispatch>)
    });
    registry
}

/// Messages and notifies as actors received them, across vats, as
/// `<idBase>:<method>[:<first string arg>]` and `<idBase>:notify:<kpid>`.
/// Replays after eviction append again.
#[derive(Clone, Debug, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }
}

pub fn actor_bundle() -> Bundle {
    Bundle::native(ACTOR)
}

/// Vat parameters telling an actor where to start numbering the krefs it
/// invents. Vats sharing a kernel need disjoint ranges.
pub fn id_base(base: u64) -> CapData {
    marshal::encode(&Passable::record([(
        "idBase",
        Passable::BigInt(i128::from(base)),
    )]))
    .unwrap()
}

fn encoded(value: Passable) -> CapData {
    marshal::encode(&value).unwrap()
}

/// What to do with a message's result promise once the method ran.
enum Settle {
    Fulfill(Passable),
    Reject(String),
    Leave,
}

/// Records what it sees in its vatstore:
///
/// - `starts`, `boyd`: counters for `startVat` and `bringOutYourDead`
/// - `resolved.<kpid>`: `fulfilled:<body>` or `rejected:<body>` per notify
/// - `gc`: `<tag>:<kref>` for every GC delivery, comma separated
/// - `log`: notes and the names of methods it does not understand
pub struct Actor {
    syscall: SyscallHandle,
    journal: Option<Journal>,
    id_base: u64,
    metered: bool,
    burn: u64,
}

impl Actor {
    pub fn new(ctx: NativeVatContext, journal: Option<Journal>) -> Self {
        let id_base = marshal::decode(&ctx.vat_parameters)
            .ok()
            .and_then(|params| {
                params
                    .as_record()
                    .and_then(|record| record.get("idBase"))
                    .and_then(Passable::as_nat)
            })
            .unwrap_or(1000);
        Self {
            syscall: ctx.syscall,
            journal,
            id_base,
            metered: ctx.options.metered,
            burn: 0,
        }
    }

    fn record(&self, what: String) {
        if let Some(journal) = &self.journal {
            journal.push(format!("{}:{what}", self.id_base));
        }
    }

    fn call(&self, vso: VatSyscallObject) -> VatSyscallResult {
        self.syscall.syscall(vso)
    }

    fn get(&self, key: &str) -> Option<String> {
        match self.call(VatSyscallObject::VatstoreGet(key.into())) {
            VatSyscallResult::Ok(value) => value.as_str().map(str::to_string),
            VatSyscallResult::Error(_) => None,
        }
    }

    fn set(&self, key: &str, value: &str) {
        self.call(VatSyscallObject::VatstoreSet {
            key: key.into(),
            value: value.into(),
        });
    }

    fn bump(&self, key: &str) -> u64 {
        let next = self
            .get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        self.set(key, &next.to_string());
        next
    }

    fn append(&self, key: &str, item: &str) {
        let value = match self.get(key) {
            Some(prior) if !prior.is_empty() => format!("{prior},{item}"),
            _ => item.to_string(),
        };
        self.set(key, &value);
    }

    fn fresh(&self) -> u64 {
        let id = self
            .get("nextId")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(self.id_base);
        self.set("nextId", &(id + 1).to_string());
        id
    }

    fn resolve(&self, kpid: Kref, rejected: bool, value: Passable) -> VatSyscallResult {
        self.call(VatSyscallObject::Resolve(vec![VatOneResolution::new(
            kpid,
            rejected,
            encoded(value),
        )]))
    }

    fn message(&mut self, msg: Message) -> VatDeliveryResult {
        let (method, args) = match marshal::decode_methargs(&msg.methargs) {
            Ok(decoded) => decoded,
            Err(err) => return VatDeliveryResult::error(err.to_string()),
        };
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Passable::Undefined);
        match arg(0).as_str() {
            Some(first) => self.record(format!("{method}:{first}")),
            None => self.record(method.clone()),
        }
        let settle = match method.as_str() {
            "ping" => Settle::Fulfill(Passable::string("pong")),
            "echo" => Settle::Fulfill(arg(0)),
            "export" => {
                let kref = Kref::parse(format!("o+{}", self.fresh())).unwrap();
                Settle::Fulfill(Passable::remotable(kref))
            }
            "callPing" => {
                let Passable::Remotable { kref: target, .. } = arg(0) else {
                    return VatDeliveryResult::error("callPing needs a target");
                };
                let kpid = Kref::parse(format!("p+{}", self.fresh())).unwrap();
                let ping = Message::call("ping", vec![], Some(kpid.clone())).unwrap();
                self.call(VatSyscallObject::Send { target, msg: ping });
                self.call(VatSyscallObject::Subscribe(kpid.clone()));
                Settle::Fulfill(Passable::string(kpid.as_str()))
            }
            "note" => {
                self.append("log", arg(0).as_str().unwrap_or("?"));
                Settle::Fulfill(Passable::Undefined)
            }
            "bump" => Settle::Fulfill(Passable::BigInt(i128::from(self.bump("n")))),
            "exit" => {
                let is_failure = matches!(arg(0), Passable::Bool(true));
                self.call(VatSyscallObject::Exit {
                    is_failure,
                    info: encoded(Passable::string("bye")),
                });
                Settle::Leave
            }
            "illegal" => {
                let msg = Message::call("nope", vec![], None).unwrap();
                self.call(VatSyscallObject::Send {
                    target: Kref::object(999_999),
                    msg,
                });
                Settle::Leave
            }
            "fail" => return VatDeliveryResult::error("requested failure"),
            "refuse" => Settle::Reject(arg(0).as_str().unwrap_or("refused").to_string()),
            "burn" => {
                self.burn = arg(0).as_nat().unwrap_or(0);
                Settle::Fulfill(Passable::Undefined)
            }
            "admin" => {
                let device_method = arg(0).as_str().unwrap_or_default().to_string();
                let methargs =
                    marshal::encode_methargs(&device_method, args.iter().skip(1).cloned().collect())
                        .unwrap();
                let called = self.call(VatSyscallObject::CallNow {
                    target: Kref::device_node(0),
                    methargs,
                });
                match called {
                    VatSyscallResult::Ok(value) => {
                        let data = CapData::from_json(&value).unwrap();
                        self.set("admin", &data.body);
                        Settle::Fulfill(marshal::decode(&data).unwrap_or(Passable::Null))
                    }
                    VatSyscallResult::Error(problem) => {
                        self.set("adminError", &problem);
                        Settle::Reject(problem)
                    }
                }
            }
            "forget" => {
                if let Passable::Remotable { kref, .. } = arg(0) {
                    self.call(VatSyscallObject::DropImports(vec![kref]));
                }
                Settle::Fulfill(Passable::Undefined)
            }
            "retire" => {
                if let Passable::Remotable { kref, .. } = arg(0) {
                    self.call(VatSyscallObject::RetireExports(vec![kref]));
                }
                Settle::Fulfill(Passable::Undefined)
            }
            other => {
                self.append("log", other);
                Settle::Fulfill(Passable::Undefined)
            }
        };
        if let Some(result) = msg.result {
            match settle {
                Settle::Fulfill(value) => {
                    self.resolve(result, false, value);
                }
                Settle::Reject(problem) => {
                    self.resolve(result, true, Passable::error(problem));
                }
                Settle::Leave => {}
            }
        }
        VatDeliveryResult::ok()
    }
}

impl VatDispatch for Actor {
    fn dispatch(&mut self, delivery: VatDeliveryObject) -> VatDeliveryResult {
        self.burn = 0;
        let tag = delivery.tag();
        let result = match delivery {
            VatDeliveryObject::StartVat(_) => {
                self.bump("starts");
                VatDeliveryResult::ok()
            }
            VatDeliveryObject::Message { msg, .. } => self.message(msg),
            VatDeliveryObject::Notify(resolutions) => {
                for resolution in resolutions {
                    self.record(format!("notify:{}", resolution.kpid));
                    let state = if resolution.rejected {
                        "rejected"
                    } else {
                        "fulfilled"
                    };
                    self.set(
                        &format!("resolved.{}", resolution.kpid),
                        &format!("{state}:{}", resolution.data.body),
                    );
                }
                VatDeliveryResult::ok()
            }
            VatDeliveryObject::DropExports(krefs)
            | VatDeliveryObject::RetireExports(krefs)
            | VatDeliveryObject::RetireImports(krefs) => {
                for kref in krefs {
                    self.append("gc", &format!("{tag}:{kref}"));
                }
                VatDeliveryResult::ok()
            }
            VatDeliveryObject::BringOutYourDead => {
                self.bump("boyd");
                VatDeliveryResult::ok()
            }
        };
        if self.metered {
            result.with_usage(Some(MeterUsage {
                compute: 1 + self.burn,
            }))
        } else {
            result
        }
    }
}
