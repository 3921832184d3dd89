//! Run-queue operations and the promise state machine.
//!
//! Every enqueue increments the refcount of each kref the entry touches,
//! tagged by where the reference lives; [`KernelQueue::release_entry`] undoes
//! exactly those increments once the entry has been processed.

use swing_protocol::{
    CapData, Kref, KrefKind, Message, Passable, VatId, VatOneResolution, encode_methargs,
};

use crate::error::KernelError;
use crate::state::{KernelKeeper, QueueEntry, ResolutionPolicy};

const SEND_TARGET: &str = "send|target";
const SEND_RESULT: &str = "send|result";
const SEND_SLOT: &str = "send|slot";
const NOTIFY: &str = "notify";
pub(crate) const RESOLVE_DATA: &str = "resolve|data";
pub(crate) const QUEUED_RESULT: &str = "queued|result";
pub(crate) const QUEUED_SLOT: &str = "queued|slot";

/// Receives kernel-fatal escalations.
pub trait PanicHook {
    fn raise(&mut self, reason: &str);
}

impl<F> PanicHook for F
where
    F: FnMut(&str),
{
    fn raise(&mut self, reason: &str) {
        self(reason)
    }
}

/// Narrow view of kernel state for queue operations.
pub struct KernelQueue<'a> {
    keeper: &'a mut dyn KernelKeeper,
    on_panic: &'a mut dyn PanicHook,
}

impl<'a> KernelQueue<'a> {
    pub fn new(keeper: &'a mut dyn KernelKeeper, on_panic: &'a mut dyn PanicHook) -> Self {
        Self { keeper, on_panic }
    }

    /// Enqueues a `send`. An unknown result promise is registered with no
    /// decider.
    pub fn do_send(&mut self, target: &Kref, msg: Message) -> Result<(), KernelError> {
        msg.insist()?;
        self.insist_known(target)?;
        for slot in &msg.methargs.slots {
            self.insist_known(slot)?;
        }
        if let Some(result) = &msg.result {
            match self.keeper.get_kernel_promise(result) {
                None => self
                    .keeper
                    .add_named_promise(result, ResolutionPolicy::Ignore, None)?,
                Some(promise) if promise.is_resolved() => {
                    return Err(KernelError::AlreadyResolved(result.clone()));
                }
                Some(_) => {}
            }
        }
        self.keeper.increment_ref_count(target, SEND_TARGET);
        if let Some(result) = &msg.result {
            self.keeper.increment_ref_count(result, SEND_RESULT);
        }
        for slot in &msg.methargs.slots {
            self.keeper.increment_ref_count(slot, SEND_SLOT);
        }
        self.keeper.add_to_acceptance_queue(QueueEntry::Send {
            target: target.clone(),
            msg,
        });
        self.keeper.inc_stat("send");
        Ok(())
    }

    /// Subscribes `vat_id` to `kpid`. A settled promise is notified right
    /// away instead.
    pub fn do_subscribe(&mut self, vat_id: &VatId, kpid: &Kref) -> Result<(), KernelError> {
        kpid.insist_kind(KrefKind::Promise)?;
        let promise = self
            .keeper
            .get_kernel_promise(kpid)
            .ok_or_else(|| KernelError::UnknownPromise(kpid.clone()))?;
        self.keeper.inc_stat("subscribe");
        if promise.is_resolved() {
            self.notify(vat_id, kpid)
        } else {
            self.keeper.add_subscriber_to_promise(kpid, vat_id)
        }
    }

    /// Resolves each promise on behalf of `caller` (`None` is the kernel).
    pub fn do_resolve(
        &mut self,
        caller: Option<&VatId>,
        resolutions: Vec<VatOneResolution>,
    ) -> Result<(), KernelError> {
        for resolution in &resolutions {
            resolution.kpid.insist_kind(KrefKind::Promise)?;
            resolution.data.insist()?;
            for slot in &resolution.data.slots {
                self.insist_known(slot)?;
            }
            self.keeper.get_resolveable_promise(&resolution.kpid, caller)?;
        }
        for resolution in resolutions {
            self.resolve_one(caller, resolution)?;
        }
        Ok(())
    }

    pub fn notify(&mut self, vat_id: &VatId, kpid: &Kref) -> Result<(), KernelError> {
        self.keeper.increment_ref_count(kpid, NOTIFY);
        self.keeper.add_to_acceptance_queue(QueueEntry::Notify {
            vat_id: vat_id.clone(),
            kpid: kpid.clone(),
        });
        Ok(())
    }

    /// Sends `method(args)` to `target` from the kernel. Returns the result
    /// promise, or `None` under [`ResolutionPolicy::None`].
    pub fn queue_to_kref(
        &mut self,
        target: &Kref,
        method: &str,
        args: Vec<Passable>,
        policy: ResolutionPolicy,
    ) -> Result<Option<Kref>, KernelError> {
        let methargs = encode_methargs(method, args)?;
        self.insist_known(target)?;
        for slot in &methargs.slots {
            self.insist_known(slot)?;
        }
        let result = match policy {
            ResolutionPolicy::None => None,
            policy => Some(self.keeper.add_kernel_promise(policy)),
        };
        if let Err(err) = self.do_send(target, Message::new(methargs, result.clone())) {
            if let Some(kpid) = &result {
                self.keeper.delete_kernel_promise(kpid);
            }
            return Err(err);
        }
        Ok(result)
    }

    /// Rejects `kpid` with `error`. When `expected_decider` is given the
    /// promise must still be decided by that vat.
    pub fn resolve_to_error(
        &mut self,
        kpid: &Kref,
        error: CapData,
        expected_decider: Option<&VatId>,
    ) -> Result<(), KernelError> {
        self.keeper.get_resolveable_promise(kpid, expected_decider)?;
        self.resolve_one(None, VatOneResolution::new(kpid.clone(), true, error))
    }

    /// Drops the references taken when `entry` was enqueued.
    pub fn release_entry(&mut self, entry: &QueueEntry) -> Result<(), KernelError> {
        match entry {
            QueueEntry::Send { target, msg } => {
                self.keeper.decrement_ref_count(target, SEND_TARGET)?;
                if let Some(result) = &msg.result {
                    self.keeper.decrement_ref_count(result, SEND_RESULT)?;
                }
                for slot in &msg.methargs.slots {
                    self.keeper.decrement_ref_count(slot, SEND_SLOT)?;
                }
            }
            QueueEntry::Notify { kpid, .. } => {
                self.keeper.decrement_ref_count(kpid, NOTIFY)?;
            }
            QueueEntry::CreateVat { .. } | QueueEntry::UpgradeVat { .. } => {}
        }
        Ok(())
    }

    /// Parks `msg` on an unresolved promise until it settles.
    pub(crate) fn park_on_promise(&mut self, kpid: &Kref, msg: Message) -> Result<(), KernelError> {
        if let Some(result) = &msg.result {
            self.keeper.increment_ref_count(result, QUEUED_RESULT);
        }
        for slot in &msg.methargs.slots {
            self.keeper.increment_ref_count(slot, QUEUED_SLOT);
        }
        self.keeper.enqueue_promise_message(kpid, msg)
    }

    fn resolve_one(
        &mut self,
        caller: Option<&VatId>,
        resolution: VatOneResolution,
    ) -> Result<(), KernelError> {
        let VatOneResolution {
            kpid,
            rejected,
            data,
        } = resolution;
        let promise = self.keeper.get_resolveable_promise(&kpid, caller)?;
        for subscriber in &promise.subscribers {
            self.notify(subscriber, &kpid)?;
        }
        for slot in &data.slots {
            self.keeper.increment_ref_count(slot, RESOLVE_DATA);
        }
        self.keeper
            .resolve_kernel_promise(&kpid, rejected, data.clone())?;
        self.keeper.inc_stat("resolve");

        for msg in promise.queue {
            self.do_send(&kpid, msg.clone())?;
            if let Some(result) = &msg.result {
                self.keeper.decrement_ref_count(result, QUEUED_RESULT)?;
            }
            for slot in &msg.methargs.slots {
                self.keeper.decrement_ref_count(slot, QUEUED_SLOT)?;
            }
        }
        if self.keeper.get_ref_count(&kpid) == 0 {
            self.keeper.add_maybe_free(&kpid);
        }

        let outcome = if rejected { "rejected" } else { "fulfilled" };
        match promise.policy {
            ResolutionPolicy::LogAlways => {
                log::info!("promise {kpid} {outcome}: {}", data.body);
            }
            ResolutionPolicy::LogFailure if rejected => {
                log::warn!("promise {kpid} rejected: {}", data.body);
            }
            ResolutionPolicy::Panic if rejected => {
                self.on_panic
                    .raise(&format!("promise {kpid} rejected: {}", data.body));
            }
            _ => {}
        }
        Ok(())
    }

    fn insist_known(&self, kref: &Kref) -> Result<(), KernelError> {
        let known = match kref.kind() {
            KrefKind::Object => self.keeper.get_object(kref).is_some(),
            KrefKind::Promise => self.keeper.get_kernel_promise(kref).is_some(),
            KrefKind::Device => true,
        };
        if known {
            Ok(())
        } else {
            Err(KernelError::UnknownKref(kref.clone()))
        }
    }
}
