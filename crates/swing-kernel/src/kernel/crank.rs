use swing_protocol::{
    CapData, Kref, KrefKind, Message, Passable, VatDeliveryObject, VatId, VatOneResolution,
    marshal,
};

use super::Kernel;
use super::syscall::{drop_import, import_into};
use crate::error::KernelError;
use crate::queue::PanicHook;
use crate::state::{PromiseState, QueueEntry};

impl Kernel {
    /// Runs one crank. Returns `false` when both queues are empty.
    pub fn step(&mut self) -> Result<bool, KernelError> {
        self.check_panic()?;
        if self.keeper.run_queue_len() == 0 {
            self.keeper.move_acceptance_to_run_queue();
        }
        let Some(entry) = self.keeper.pop_run_queue() else {
            return Ok(false);
        };
        log::debug!("crank: {}", entry.kind());

        let processed = self.process_entry(&entry);
        let released = self.with_queue(|queue| queue.release_entry(&entry));
        self.keeper.move_acceptance_to_run_queue();
        if let Err(err) = processed.and(released) {
            return Err(self.escalate(err));
        }
        if let Err(err) = self.process_gc() {
            return Err(self.escalate(err));
        }
        self.keeper.inc_stat("crank");
        self.check_panic()?;
        Ok(true)
    }

    /// Cranks until the queues drain. Returns the number of cranks run.
    pub fn run(&mut self) -> Result<u64, KernelError> {
        let mut cranks = 0;
        while self.step()? {
            cranks += 1;
        }
        Ok(cranks)
    }

    /// Like [`Kernel::run`], stopping after at most `limit` cranks.
    pub fn run_bounded(&mut self, limit: u64) -> Result<u64, KernelError> {
        let mut cranks = 0;
        while cranks < limit && self.step()? {
            cranks += 1;
        }
        Ok(cranks)
    }

    pub fn queue_len(&self) -> usize {
        self.keeper.run_queue_len() + self.keeper.acceptance_queue_len()
    }

    /// A crank that failed outside any single vat leaves kernel state
    /// suspect, so it panics the kernel.
    fn escalate(&mut self, err: KernelError) -> KernelError {
        match err {
            KernelError::Panic(reason) => KernelError::Panic(reason),
            other => {
                let reason = format!("crank failed: {other}");
                self.panic.raise(&reason);
                KernelError::Panic(reason)
            }
        }
    }

    fn process_entry(&mut self, entry: &QueueEntry) -> Result<(), KernelError> {
        match entry {
            QueueEntry::Send { target, msg } => self.process_send(target, msg.clone()),
            QueueEntry::Notify { vat_id, kpid } => self.process_notify(vat_id, kpid),
            QueueEntry::CreateVat { vat_id, .. } => self.process_create_vat(vat_id),
            QueueEntry::UpgradeVat {
                vat_id,
                bundle_id,
                vat_parameters,
                upgrade_message,
            } => match self.upgrade_vat(vat_id, bundle_id, vat_parameters.clone(), upgrade_message)
            {
                Err(KernelError::Panic(reason)) => Err(KernelError::Panic(reason)),
                Err(err) => {
                    log::warn!("upgrade of vat {vat_id} was not applied: {err}");
                    Ok(())
                }
                Ok(()) => Ok(()),
            },
        }
    }

    fn process_send(&mut self, target: &Kref, msg: Message) -> Result<(), KernelError> {
        match target.kind() {
            KrefKind::Device => self.reject_result(&msg, "cannot send to device"),
            KrefKind::Object => {
                let owner = self
                    .keeper
                    .get_object(target)
                    .and_then(|record| record.owner)
                    .filter(|owner| self.is_live(owner));
                let Some(owner) = owner else {
                    return self.reject_result(&msg, "vat terminated");
                };
                if let Some(result) = &msg.result {
                    let unresolved = self
                        .keeper
                        .get_kernel_promise(result)
                        .is_some_and(|promise| !promise.is_resolved());
                    if unresolved {
                        self.keeper.set_promise_decider(result, Some(owner.clone()))?;
                    }
                }
                for slot in &msg.methargs.slots {
                    import_into(self.keeper.as_mut(), &owner, slot);
                }
                self.deliver_to_vat(
                    &owner,
                    VatDeliveryObject::Message {
                        target: target.clone(),
                        msg,
                    },
                )
            }
            KrefKind::Promise => {
                let promise = self
                    .keeper
                    .get_kernel_promise(target)
                    .ok_or_else(|| KernelError::UnknownPromise(target.clone()))?;
                match (promise.state, promise.value) {
                    (PromiseState::Unresolved, _) | (_, None) => {
                        self.with_queue(|queue| queue.park_on_promise(target, msg))
                    }
                    (PromiseState::Fulfilled, Some(value)) => match marshal::decode(&value) {
                        Ok(Passable::Remotable { kref, .. }) if kref.is_object() => {
                            self.process_send(&kref, msg)
                        }
                        _ => self.reject_result(&msg, "cannot send to non-object"),
                    },
                    (PromiseState::Rejected, Some(value)) => self.reject_result_with(&msg, value),
                }
            }
        }
    }

    fn reject_result(&mut self, msg: &Message, problem: &str) -> Result<(), KernelError> {
        let error = marshal::encode(&Passable::error(problem))?;
        self.reject_result_with(msg, error)
    }

    fn reject_result_with(&mut self, msg: &Message, error: CapData) -> Result<(), KernelError> {
        let Some(result) = &msg.result else {
            return Ok(());
        };
        let unresolved = self
            .keeper
            .get_kernel_promise(result)
            .is_some_and(|promise| !promise.is_resolved());
        if !unresolved {
            return Ok(());
        }
        self.with_queue(|queue| queue.resolve_to_error(result, error, None))
    }

    fn process_notify(&mut self, vat_id: &VatId, kpid: &Kref) -> Result<(), KernelError> {
        if !self.is_live(vat_id) {
            return Ok(());
        }
        let promise = self
            .keeper
            .get_kernel_promise(kpid)
            .ok_or_else(|| KernelError::UnknownPromise(kpid.clone()))?;
        let Some(value) = promise.value.filter(|_| promise.state != PromiseState::Unresolved)
        else {
            log::warn!("notify of unresolved promise {kpid} to {vat_id} dropped");
            return Ok(());
        };
        for slot in &value.slots {
            import_into(self.keeper.as_mut(), vat_id, slot);
        }
        let rejected = promise.state == PromiseState::Rejected;
        self.deliver_to_vat(
            vat_id,
            VatDeliveryObject::Notify(vec![VatOneResolution::new(kpid.clone(), rejected, value)]),
        )?;
        drop_import(self.keeper.as_mut(), vat_id, kpid)
    }
}
