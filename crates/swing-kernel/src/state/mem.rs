use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Bound;

use swing_protocol::{CapData, Kref, Message, VatId};

use super::{
    GcAction, KernelKeeper, KernelPromise, MeterId, MeterRecord, ObjectRecord, PromiseState,
    QueueEntry, ResolutionPolicy, VatRecord,
};
use crate::error::KernelError;

#[derive(Debug, Default)]
struct RefCount {
    total: u64,
    by_tag: BTreeMap<String, u64>,
}

/// In-memory keeper used by tests and ephemeral kernels.
#[derive(Debug, Default)]
pub struct MemKernelKeeper {
    next_promise: u64,
    next_object: u64,
    next_vat: u64,
    next_meter: u64,
    promises: BTreeMap<Kref, KernelPromise>,
    objects: BTreeMap<Kref, ObjectRecord>,
    imports: BTreeSet<(VatId, Kref)>,
    refcounts: HashMap<Kref, RefCount>,
    maybe_free: BTreeSet<Kref>,
    gc_actions: Vec<GcAction>,
    run_queue: VecDeque<QueueEntry>,
    acceptance_queue: VecDeque<QueueEntry>,
    stats: BTreeMap<String, u64>,
    vats: BTreeMap<VatId, VatRecord>,
    meters: BTreeMap<MeterId, MeterRecord>,
    vatstore: BTreeMap<VatId, BTreeMap<String, String>>,
    device_state: BTreeMap<String, String>,
}

impl MemKernelKeeper {
    pub fn new() -> Self {
        Self {
            next_promise: 1,
            next_object: 1,
            next_vat: 1,
            next_meter: 1,
            ..Self::default()
        }
    }

    /// Refcount contributions per tag, for leak diagnosis.
    pub fn ref_tags(&self, kref: &Kref) -> BTreeMap<String, u64> {
        self.refcounts
            .get(kref)
            .map(|count| count.by_tag.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the run and acceptance queues, run queue first.
    pub fn queued(&self) -> Vec<QueueEntry> {
        self.run_queue
            .iter()
            .chain(self.acceptance_queue.iter())
            .cloned()
            .collect()
    }

    fn promise_mut(&mut self, kpid: &Kref) -> Result<&mut KernelPromise, KernelError> {
        self.promises
            .get_mut(kpid)
            .ok_or_else(|| KernelError::UnknownPromise(kpid.clone()))
    }
}

fn describe(vat: Option<&VatId>) -> String {
    match vat {
        Some(vat) => vat.to_string(),
        None => "kernel".to_string(),
    }
}

impl KernelKeeper for MemKernelKeeper {
    fn add_kernel_promise(&mut self, policy: ResolutionPolicy) -> Kref {
        let kpid = Kref::promise(self.next_promise.max(1));
        self.next_promise = self.next_promise.max(1) + 1;
        self.promises
            .insert(kpid.clone(), KernelPromise::new(policy, None));
        kpid
    }

    fn add_named_promise(
        &mut self,
        kpid: &Kref,
        policy: ResolutionPolicy,
        decider: Option<VatId>,
    ) -> Result<(), KernelError> {
        if !kpid.is_promise() || self.promises.contains_key(kpid) {
            return Err(KernelError::IllegalSyscall(format!(
                "cannot register promise {kpid}"
            )));
        }
        self.promises
            .insert(kpid.clone(), KernelPromise::new(policy, decider));
        Ok(())
    }

    fn get_kernel_promise(&self, kpid: &Kref) -> Option<KernelPromise> {
        self.promises.get(kpid).cloned()
    }

    fn get_resolveable_promise(
        &self,
        kpid: &Kref,
        caller: Option<&VatId>,
    ) -> Result<KernelPromise, KernelError> {
        let promise = self
            .promises
            .get(kpid)
            .ok_or_else(|| KernelError::UnknownPromise(kpid.clone()))?;
        if promise.is_resolved() {
            return Err(KernelError::AlreadyResolved(kpid.clone()));
        }
        if caller.is_some() && promise.decider.as_ref() != caller {
            return Err(KernelError::NotDecider {
                kpid: kpid.clone(),
                caller: describe(caller),
                decider: describe(promise.decider.as_ref()),
            });
        }
        Ok(promise.clone())
    }

    fn resolve_kernel_promise(
        &mut self,
        kpid: &Kref,
        rejected: bool,
        data: CapData,
    ) -> Result<(), KernelError> {
        let promise = self.promise_mut(kpid)?;
        if promise.is_resolved() {
            return Err(KernelError::AlreadyResolved(kpid.clone()));
        }
        promise.state = if rejected {
            PromiseState::Rejected
        } else {
            PromiseState::Fulfilled
        };
        promise.value = Some(data);
        promise.decider = None;
        promise.subscribers.clear();
        promise.queue.clear();
        Ok(())
    }

    fn add_subscriber_to_promise(
        &mut self,
        kpid: &Kref,
        vat_id: &VatId,
    ) -> Result<(), KernelError> {
        self.promise_mut(kpid)?.subscribers.insert(vat_id.clone());
        Ok(())
    }

    fn set_promise_decider(
        &mut self,
        kpid: &Kref,
        decider: Option<VatId>,
    ) -> Result<(), KernelError> {
        self.promise_mut(kpid)?.decider = decider;
        Ok(())
    }

    fn enqueue_promise_message(&mut self, kpid: &Kref, msg: Message) -> Result<(), KernelError> {
        let promise = self.promise_mut(kpid)?;
        if promise.is_resolved() {
            return Err(KernelError::AlreadyResolved(kpid.clone()));
        }
        promise.queue.push(msg);
        Ok(())
    }

    fn delete_kernel_promise(&mut self, kpid: &Kref) {
        self.promises.remove(kpid);
        self.refcounts.remove(kpid);
    }

    fn promises_decided_by(&self, vat_id: &VatId) -> Vec<Kref> {
        self.promises
            .iter()
            .filter(|(_, p)| !p.is_resolved() && p.decider.as_ref() == Some(vat_id))
            .map(|(kpid, _)| kpid.clone())
            .collect()
    }

    fn allocate_object(&mut self, owner: VatId) -> Kref {
        let kref = Kref::object(self.next_object.max(1));
        self.next_object = self.next_object.max(1) + 1;
        self.objects
            .insert(kref.clone(), ObjectRecord { owner: Some(owner) });
        kref
    }

    fn add_object(&mut self, kref: &Kref, owner: Option<VatId>) -> Result<(), KernelError> {
        if !kref.is_object() || self.objects.contains_key(kref) {
            return Err(KernelError::IllegalSyscall(format!(
                "cannot register object {kref}"
            )));
        }
        self.objects.insert(kref.clone(), ObjectRecord { owner });
        Ok(())
    }

    fn get_object(&self, kref: &Kref) -> Option<ObjectRecord> {
        self.objects.get(kref).cloned()
    }

    fn set_object_owner(&mut self, kref: &Kref, owner: Option<VatId>) -> Result<(), KernelError> {
        let record = self
            .objects
            .get_mut(kref)
            .ok_or_else(|| KernelError::UnknownKref(kref.clone()))?;
        record.owner = owner;
        Ok(())
    }

    fn delete_object(&mut self, kref: &Kref) {
        self.objects.remove(kref);
        self.refcounts.remove(kref);
        self.imports.retain(|(_, imported)| imported != kref);
    }

    fn objects_owned_by(&self, vat_id: &VatId) -> Vec<Kref> {
        self.objects
            .iter()
            .filter(|(_, record)| record.owner.as_ref() == Some(vat_id))
            .map(|(kref, _)| kref.clone())
            .collect()
    }

    fn add_import(&mut self, vat_id: &VatId, kref: &Kref) -> bool {
        self.imports.insert((vat_id.clone(), kref.clone()))
    }

    fn remove_import(&mut self, vat_id: &VatId, kref: &Kref) -> bool {
        self.imports.remove(&(vat_id.clone(), kref.clone()))
    }

    fn has_import(&self, vat_id: &VatId, kref: &Kref) -> bool {
        self.imports.contains(&(vat_id.clone(), kref.clone()))
    }

    fn importers(&self, kref: &Kref) -> Vec<VatId> {
        self.imports
            .iter()
            .filter(|(_, imported)| imported == kref)
            .map(|(vat, _)| vat.clone())
            .collect()
    }

    fn vat_imports(&self, vat_id: &VatId) -> Vec<Kref> {
        self.imports
            .iter()
            .filter(|(vat, _)| vat == vat_id)
            .map(|(_, kref)| kref.clone())
            .collect()
    }

    fn increment_ref_count(&mut self, kref: &Kref, tag: &str) {
        let count = self.refcounts.entry(kref.clone()).or_default();
        count.total += 1;
        *count.by_tag.entry(tag.to_string()).or_default() += 1;
    }

    fn decrement_ref_count(&mut self, kref: &Kref, tag: &str) -> Result<u64, KernelError> {
        let underflow = || KernelError::RefCountUnderflow {
            kref: kref.clone(),
            tag: tag.to_string(),
        };
        let count = self.refcounts.get_mut(kref).ok_or_else(underflow)?;
        let tagged = count.by_tag.get_mut(tag).ok_or_else(underflow)?;
        if *tagged == 0 || count.total == 0 {
            return Err(underflow());
        }
        *tagged -= 1;
        if *tagged == 0 {
            count.by_tag.remove(tag);
        }
        count.total -= 1;
        let total = count.total;
        if total == 0 {
            self.maybe_free.insert(kref.clone());
        }
        Ok(total)
    }

    fn get_ref_count(&self, kref: &Kref) -> u64 {
        self.refcounts.get(kref).map(|count| count.total).unwrap_or(0)
    }

    fn add_maybe_free(&mut self, kref: &Kref) {
        self.maybe_free.insert(kref.clone());
    }

    fn take_maybe_free(&mut self) -> BTreeSet<Kref> {
        std::mem::take(&mut self.maybe_free)
    }

    fn add_gc_action(&mut self, action: GcAction) {
        self.gc_actions.push(action);
    }

    fn take_gc_actions(&mut self) -> Vec<GcAction> {
        std::mem::take(&mut self.gc_actions)
    }

    fn add_to_acceptance_queue(&mut self, entry: QueueEntry) {
        self.acceptance_queue.push_back(entry);
    }

    fn move_acceptance_to_run_queue(&mut self) {
        self.run_queue.append(&mut self.acceptance_queue);
    }

    fn pop_run_queue(&mut self) -> Option<QueueEntry> {
        self.run_queue.pop_front()
    }

    fn run_queue_len(&self) -> usize {
        self.run_queue.len()
    }

    fn acceptance_queue_len(&self) -> usize {
        self.acceptance_queue.len()
    }

    fn inc_stat(&mut self, name: &str) {
        *self.stats.entry(name.to_string()).or_default() += 1;
    }

    fn get_stat(&self, name: &str) -> u64 {
        self.stats.get(name).copied().unwrap_or(0)
    }

    fn allocate_vat_id(&mut self) -> VatId {
        let vat_id = VatId::from_index(self.next_vat.max(1));
        self.next_vat = self.next_vat.max(1) + 1;
        vat_id
    }

    fn put_vat(&mut self, record: VatRecord) {
        self.vats.insert(record.vat_id.clone(), record);
    }

    fn get_vat(&self, vat_id: &VatId) -> Option<VatRecord> {
        self.vats.get(vat_id).cloned()
    }

    fn vat_ids(&self) -> Vec<VatId> {
        self.vats.keys().cloned().collect()
    }

    fn add_meter(&mut self, meter: MeterRecord) -> MeterId {
        let meter_id = MeterId::from_index(self.next_meter.max(1));
        self.next_meter = self.next_meter.max(1) + 1;
        self.meters.insert(meter_id.clone(), meter);
        meter_id
    }

    fn get_meter(&self, meter_id: &MeterId) -> Option<MeterRecord> {
        self.meters.get(meter_id).copied()
    }

    fn put_meter(&mut self, meter_id: &MeterId, meter: MeterRecord) -> Result<(), KernelError> {
        let slot = self
            .meters
            .get_mut(meter_id)
            .ok_or_else(|| KernelError::UnknownMeter(meter_id.clone()))?;
        *slot = meter;
        Ok(())
    }

    fn vatstore_get(&self, vat_id: &VatId, key: &str) -> Option<String> {
        self.vatstore.get(vat_id)?.get(key).cloned()
    }

    fn vatstore_set(&mut self, vat_id: &VatId, key: &str, value: &str) {
        self.vatstore
            .entry(vat_id.clone())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    fn vatstore_delete(&mut self, vat_id: &VatId, key: &str) {
        if let Some(store) = self.vatstore.get_mut(vat_id) {
            store.remove(key);
        }
    }

    fn vatstore_get_after(
        &self,
        vat_id: &VatId,
        prior_key: &str,
        lower_bound: &str,
        upper_bound: Option<&str>,
    ) -> Option<(String, String)> {
        let store = self.vatstore.get(vat_id)?;
        let start = if prior_key.is_empty() || prior_key < lower_bound {
            Bound::Included(lower_bound.to_string())
        } else {
            Bound::Excluded(prior_key.to_string())
        };
        let (key, value) = store.range((start, Bound::Unbounded)).next()?;
        if upper_bound.is_some_and(|upper| key.as_str() >= upper) {
            return None;
        }
        Some((key.clone(), value.clone()))
    }

    fn vatstore_clear(&mut self, vat_id: &VatId) {
        self.vatstore.remove(vat_id);
    }

    fn device_state_get(&self, key: &str) -> Option<String> {
        self.device_state.get(key).cloned()
    }

    fn device_state_set(&mut self, key: &str, value: &str) {
        self.device_state
            .insert(key.to_string(), value.to_string());
    }
}
