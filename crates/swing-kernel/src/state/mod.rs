//! Kernel tables and the keeper interface that persists them.

pub mod mem;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use swing_protocol::{CapData, Kref, Message, VatId, WorkerOptions};
use swing_store::BundleId;

use crate::error::KernelError;

pub use mem::MemKernelKeeper;

/// What happens when a kernel-allocated result promise settles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionPolicy {
    /// Fire-and-forget: no result promise is allocated.
    None,
    #[default]
    Ignore,
    LogAlways,
    LogFailure,
    /// A rejection is a kernel-fatal error.
    Panic,
}

impl FromStr for ResolutionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ResolutionPolicy::None),
            "ignore" => Ok(ResolutionPolicy::Ignore),
            "logAlways" => Ok(ResolutionPolicy::LogAlways),
            "logFailure" => Ok(ResolutionPolicy::LogFailure),
            "panic" => Ok(ResolutionPolicy::Panic),
            other => Err(format!("unknown resolution policy '{other}'")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromiseState {
    Unresolved,
    Fulfilled,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelPromise {
    pub state: PromiseState,
    pub decider: Option<VatId>,
    pub subscribers: BTreeSet<VatId>,
    pub policy: ResolutionPolicy,
    pub value: Option<CapData>,
    /// Messages sent to the promise while it was unresolved.
    pub queue: Vec<Message>,
}

impl KernelPromise {
    pub fn new(policy: ResolutionPolicy, decider: Option<VatId>) -> Self {
        Self {
            state: PromiseState::Unresolved,
            decider,
            subscribers: BTreeSet::new(),
            policy,
            value: None,
            queue: Vec::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.state != PromiseState::Unresolved
    }

    pub fn is_rejected(&self) -> bool {
        self.state == PromiseState::Rejected
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// `None` once the exporting vat is gone.
    pub owner: Option<VatId>,
}

/// One run-queue entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum QueueEntry {
    Send {
        target: Kref,
        msg: Message,
    },
    Notify {
        #[serde(rename = "vatID")]
        vat_id: VatId,
        kpid: Kref,
    },
    CreateVat {
        #[serde(rename = "vatID")]
        vat_id: VatId,
        #[serde(rename = "bundleID")]
        bundle_id: BundleId,
        options: VatOptions,
    },
    UpgradeVat {
        #[serde(rename = "vatID")]
        vat_id: VatId,
        #[serde(rename = "bundleID")]
        bundle_id: BundleId,
        #[serde(rename = "vatParameters")]
        vat_parameters: CapData,
        #[serde(rename = "upgradeMessage")]
        upgrade_message: String,
    },
}

impl QueueEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueEntry::Send { .. } => "send",
            QueueEntry::Notify { .. } => "notify",
            QueueEntry::CreateVat { .. } => "create-vat",
            QueueEntry::UpgradeVat { .. } => "upgrade-vat",
        }
    }
}

/// Deliveries the GC pass owes to vats, queued by syscalls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcAction {
    RetireImports { vat_id: VatId, krefs: Vec<Kref> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatOptions {
    #[serde(default)]
    pub name: Option<String>,
    pub vat_parameters: CapData,
    #[serde(default, rename = "meterID")]
    pub meter_id: Option<MeterId>,
    #[serde(default)]
    pub critical: bool,
    /// Hands the vat the vat-admin root node when it starts.
    #[serde(default, rename = "enableVatAdmin")]
    pub enable_vat_admin: bool,
}

impl Default for VatOptions {
    fn default() -> Self {
        Self {
            name: None,
            vat_parameters: CapData::new("#\"#undefined\"", vec![]),
            meter_id: None,
            critical: false,
            enable_vat_admin: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VatStatus {
    Creating,
    Running,
    Terminated,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatRecord {
    #[serde(rename = "vatID")]
    pub vat_id: VatId,
    pub status: VatStatus,
    #[serde(rename = "bundleID")]
    pub bundle_id: BundleId,
    pub options: VatOptions,
    pub incarnation: u64,
    /// Kernel-allocated root object, set once the vat is running.
    pub root: Option<Kref>,
}

impl VatRecord {
    pub fn is_live(&self) -> bool {
        self.status == VatStatus::Running
    }

    pub fn worker_options(&self, consensus_mode: bool) -> WorkerOptions {
        WorkerOptions {
            consensus_mode,
            vat_name: self.options.name.clone(),
            metered: self.options.meter_id.is_some(),
        }
    }
}

/// Meter identifier (`m1`, `m2`, ...).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MeterId(String);

impl MeterId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, String> {
        let raw = raw.into();
        match raw.strip_prefix('m') {
            Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
                Ok(Self(raw))
            }
            _ => Err(format!("invalid meter id '{raw}'")),
        }
    }

    pub fn from_index(index: u64) -> Self {
        Self(format!("m{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MeterId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        MeterId::parse(value)
    }
}

impl From<MeterId> for String {
    fn from(value: MeterId) -> Self {
        value.0
    }
}

impl fmt::Debug for MeterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MeterId({})", self.0)
    }
}

impl fmt::Display for MeterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterRecord {
    /// `None` is unlimited.
    pub remaining: Option<u64>,
    pub threshold: u64,
}

impl MeterRecord {
    pub fn unlimited() -> Self {
        Self {
            remaining: None,
            threshold: 0,
        }
    }
}

/// Storage for all kernel tables. Only the kernel loop mutates it.
pub trait KernelKeeper: Send {
    // promises
    fn add_kernel_promise(&mut self, policy: ResolutionPolicy) -> Kref;
    /// Registers a promise under a vat-chosen name.
    fn add_named_promise(
        &mut self,
        kpid: &Kref,
        policy: ResolutionPolicy,
        decider: Option<VatId>,
    ) -> Result<(), KernelError>;
    fn get_kernel_promise(&self, kpid: &Kref) -> Option<KernelPromise>;
    /// Returns the promise if it is unresolved and `caller` may resolve it.
    /// A `None` caller is the kernel itself and may resolve anything.
    fn get_resolveable_promise(
        &self,
        kpid: &Kref,
        caller: Option<&VatId>,
    ) -> Result<KernelPromise, KernelError>;
    /// Marks the promise terminal, clearing decider, subscribers and queue.
    fn resolve_kernel_promise(
        &mut self,
        kpid: &Kref,
        rejected: bool,
        data: CapData,
    ) -> Result<(), KernelError>;
    fn add_subscriber_to_promise(&mut self, kpid: &Kref, vat_id: &VatId)
    -> Result<(), KernelError>;
    fn set_promise_decider(&mut self, kpid: &Kref, decider: Option<VatId>)
    -> Result<(), KernelError>;
    fn enqueue_promise_message(&mut self, kpid: &Kref, msg: Message) -> Result<(), KernelError>;
    fn delete_kernel_promise(&mut self, kpid: &Kref);
    fn promises_decided_by(&self, vat_id: &VatId) -> Vec<Kref>;

    // objects
    fn allocate_object(&mut self, owner: VatId) -> Kref;
    fn add_object(&mut self, kref: &Kref, owner: Option<VatId>) -> Result<(), KernelError>;
    fn get_object(&self, kref: &Kref) -> Option<ObjectRecord>;
    fn set_object_owner(&mut self, kref: &Kref, owner: Option<VatId>) -> Result<(), KernelError>;
    fn delete_object(&mut self, kref: &Kref);
    fn objects_owned_by(&self, vat_id: &VatId) -> Vec<Kref>;

    // imports: which vats hold which krefs they do not own
    fn add_import(&mut self, vat_id: &VatId, kref: &Kref) -> bool;
    fn remove_import(&mut self, vat_id: &VatId, kref: &Kref) -> bool;
    fn has_import(&self, vat_id: &VatId, kref: &Kref) -> bool;
    fn importers(&self, kref: &Kref) -> Vec<VatId>;
    fn vat_imports(&self, vat_id: &VatId) -> Vec<Kref>;

    // refcounts
    fn increment_ref_count(&mut self, kref: &Kref, tag: &str);
    /// Returns the new count. A count reaching zero schedules the kref for
    /// the next GC pass.
    fn decrement_ref_count(&mut self, kref: &Kref, tag: &str) -> Result<u64, KernelError>;
    fn get_ref_count(&self, kref: &Kref) -> u64;
    fn add_maybe_free(&mut self, kref: &Kref);
    fn take_maybe_free(&mut self) -> BTreeSet<Kref>;
    fn add_gc_action(&mut self, action: GcAction);
    fn take_gc_actions(&mut self) -> Vec<GcAction>;

    // queues
    fn add_to_acceptance_queue(&mut self, entry: QueueEntry);
    /// Moves the acceptance queue, in order, onto the end of the run queue.
    fn move_acceptance_to_run_queue(&mut self);
    fn pop_run_queue(&mut self) -> Option<QueueEntry>;
    fn run_queue_len(&self) -> usize;
    fn acceptance_queue_len(&self) -> usize;

    // stats
    fn inc_stat(&mut self, name: &str);
    fn get_stat(&self, name: &str) -> u64;

    // vats
    fn allocate_vat_id(&mut self) -> VatId;
    fn put_vat(&mut self, record: VatRecord);
    fn get_vat(&self, vat_id: &VatId) -> Option<VatRecord>;
    fn vat_ids(&self) -> Vec<VatId>;

    // meters
    fn add_meter(&mut self, meter: MeterRecord) -> MeterId;
    fn get_meter(&self, meter_id: &MeterId) -> Option<MeterRecord>;
    fn put_meter(&mut self, meter_id: &MeterId, meter: MeterRecord) -> Result<(), KernelError>;

    // vatstore
    fn vatstore_get(&self, vat_id: &VatId, key: &str) -> Option<String>;
    fn vatstore_set(&mut self, vat_id: &VatId, key: &str, value: &str);
    fn vatstore_delete(&mut self, vat_id: &VatId, key: &str);
    /// First entry strictly after `prior_key`, or at/after `lower_bound`
    /// when `prior_key` is empty, that sorts below `upper_bound`.
    fn vatstore_get_after(
        &self,
        vat_id: &VatId,
        prior_key: &str,
        lower_bound: &str,
        upper_bound: Option<&str>,
    ) -> Option<(String, String)>;
    fn vatstore_clear(&mut self, vat_id: &VatId);

    // device state
    fn device_state_get(&self, key: &str) -> Option<String>;
    fn device_state_set(&mut self, key: &str, value: &str);
}
