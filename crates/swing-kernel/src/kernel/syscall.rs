//! Kernel side of vat syscalls.
//!
//! Krefs are kernel-wide names. A vat may mention a vat-named kref
//! (`o+N`, `p+N`) the kernel has not seen yet; it is registered as exported
//! (objects) or decided (promises) by that vat. Every other kref must already
//! be held by the calling vat: owned, decided or imported. Device nodes are
//! only ever imported, either granted at creation or received from a device.

use serde_json::Value;
use swing_protocol::{
    CapData, Kref, KrefKind, ProtocolError, VatId, VatOneResolution, VatSyscallObject,
    VatSyscallResult,
};
use swing_store::BundleStore;
use swing_worker::SyscallHandler;

use super::{PanicSink, VAT_IMPORT};
use crate::device::{KernelEndowments, VatAdminDevice};
use crate::error::KernelError;
use crate::queue::KernelQueue;
use crate::state::{GcAction, KernelKeeper, ResolutionPolicy};

/// Side effects of one delivery that the crank applies afterwards.
#[derive(Debug, Default)]
pub(crate) struct DeliveryOutcome {
    pub illegal: Option<String>,
    pub exit: Option<(bool, CapData)>,
    pub terminations: Vec<(VatId, CapData)>,
}

pub(crate) struct VatSyscalls<'a> {
    vat_id: VatId,
    keeper: &'a mut dyn KernelKeeper,
    bundles: &'a dyn BundleStore,
    panic: &'a mut PanicSink,
    device: &'a VatAdminDevice,
    outcome: &'a mut DeliveryOutcome,
}

impl<'a> VatSyscalls<'a> {
    pub(crate) fn new(
        vat_id: VatId,
        keeper: &'a mut dyn KernelKeeper,
        bundles: &'a dyn BundleStore,
        panic: &'a mut PanicSink,
        device: &'a VatAdminDevice,
        outcome: &'a mut DeliveryOutcome,
    ) -> Self {
        Self {
            vat_id,
            keeper,
            bundles,
            panic,
            device,
            outcome,
        }
    }

    fn dispatch(&mut self, vso: VatSyscallObject) -> Result<VatSyscallResult, KernelError> {
        let vat = self.vat_id.clone();
        match vso {
            VatSyscallObject::Send { target, msg } => {
                claim(self.keeper, &vat, &target)?;
                for slot in &msg.methargs.slots {
                    claim(self.keeper, &vat, slot)?;
                }
                if let Some(result) = &msg.result {
                    claim_decided(self.keeper, &vat, result)?;
                }
                let result = msg.result.clone();
                self.queue().do_send(&target, msg)?;
                if let Some(result) = result {
                    self.keeper.set_promise_decider(&result, None)?;
                    import_into(self.keeper, &vat, &result);
                }
                Ok(VatSyscallResult::ok_null())
            }
            VatSyscallObject::CallNow { target, methargs } => {
                if !VatAdminDevice::owns(&target) {
                    return Err(KernelError::UnknownKref(target));
                }
                claim(self.keeper, &vat, &target)?;
                for slot in &methargs.slots {
                    claim(self.keeper, &vat, slot)?;
                }
                let mut endowments = KernelEndowments::new(
                    &mut *self.keeper,
                    self.bundles,
                    &mut self.outcome.terminations,
                );
                let invoked = self.device.invoke(&mut endowments, &target, &methargs);
                Ok(match invoked {
                    Ok(data) => {
                        for slot in &data.slots {
                            import_into(self.keeper, &vat, slot);
                        }
                        VatSyscallResult::Ok(data.to_json())
                    }
                    Err(err) => VatSyscallResult::error(err.to_string()),
                })
            }
            VatSyscallObject::Subscribe(kpid) => {
                claim(self.keeper, &vat, &kpid)?;
                self.queue().do_subscribe(&vat, &kpid)?;
                Ok(VatSyscallResult::ok_null())
            }
            VatSyscallObject::Resolve(resolutions) => {
                for VatOneResolution { kpid, data, .. } in &resolutions {
                    claim_decided(self.keeper, &vat, kpid)?;
                    for slot in &data.slots {
                        claim(self.keeper, &vat, slot)?;
                    }
                }
                self.queue().do_resolve(Some(&vat), resolutions)?;
                Ok(VatSyscallResult::ok_null())
            }
            VatSyscallObject::Exit { is_failure, info } => {
                for slot in &info.slots {
                    claim(self.keeper, &vat, slot)?;
                }
                self.outcome.exit.get_or_insert((is_failure, info));
                Ok(VatSyscallResult::ok_null())
            }
            VatSyscallObject::VatstoreGet(key) => Ok(VatSyscallResult::Ok(
                self.keeper
                    .vatstore_get(&vat, &key)
                    .map_or(Value::Null, Value::String),
            )),
            VatSyscallObject::VatstoreGetAfter {
                prior_key,
                lower_bound,
                upper_bound,
            } => {
                let found = self.keeper.vatstore_get_after(
                    &vat,
                    &prior_key,
                    &lower_bound,
                    upper_bound.as_deref(),
                );
                Ok(VatSyscallResult::Ok(match found {
                    Some((key, value)) => Value::Array(vec![Value::String(key), Value::String(value)]),
                    None => Value::Null,
                }))
            }
            VatSyscallObject::VatstoreSet { key, value } => {
                self.keeper.vatstore_set(&vat, &key, &value);
                Ok(VatSyscallResult::ok_null())
            }
            VatSyscallObject::VatstoreDelete(key) => {
                self.keeper.vatstore_delete(&vat, &key);
                Ok(VatSyscallResult::ok_null())
            }
            VatSyscallObject::DropImports(krefs) => {
                for kref in &krefs {
                    if !self.keeper.has_import(&vat, kref) {
                        return Err(KernelError::IllegalSyscall(format!(
                            "{vat} does not import {kref}"
                        )));
                    }
                }
                for kref in &krefs {
                    drop_import(self.keeper, &vat, kref)?;
                }
                Ok(VatSyscallResult::ok_null())
            }
            VatSyscallObject::RetireImports(krefs) => {
                for kref in &krefs {
                    drop_import(self.keeper, &vat, kref)?;
                }
                Ok(VatSyscallResult::ok_null())
            }
            VatSyscallObject::RetireExports(krefs) => {
                for kref in &krefs {
                    let owned = self
                        .keeper
                        .get_object(kref)
                        .is_some_and(|record| record.owner.as_ref() == Some(&vat));
                    if !owned {
                        return Err(KernelError::IllegalSyscall(format!(
                            "{vat} cannot retire {kref}, which it does not export"
                        )));
                    }
                }
                for kref in krefs {
                    self.retire_export(&kref)?;
                }
                Ok(VatSyscallResult::ok_null())
            }
        }
    }

    /// Orphans an export and tells its importers to forget it.
    fn retire_export(&mut self, kref: &Kref) -> Result<(), KernelError> {
        self.keeper.set_object_owner(kref, None)?;
        for importer in self.keeper.importers(kref) {
            drop_import(self.keeper, &importer, kref)?;
            self.keeper.add_gc_action(GcAction::RetireImports {
                vat_id: importer,
                krefs: vec![kref.clone()],
            });
        }
        if self.keeper.get_ref_count(kref) == 0 {
            self.keeper.add_maybe_free(kref);
        }
        Ok(())
    }

    fn queue(&mut self) -> KernelQueue<'_> {
        KernelQueue::new(&mut *self.keeper, &mut *self.panic)
    }

    fn mark_illegal(&mut self, reason: String) {
        log::warn!("vat {} made an illegal syscall: {reason}", self.vat_id);
        self.outcome.illegal.get_or_insert(reason);
    }
}

impl SyscallHandler for VatSyscalls<'_> {
    fn handle(&mut self, vso: VatSyscallObject) -> VatSyscallResult {
        if self.outcome.illegal.is_some() {
            return VatSyscallResult::error("vat is being terminated");
        }
        self.keeper.inc_stat(&format!("syscall.{}", vso.tag()));
        match self.dispatch(vso) {
            Ok(result) => result,
            Err(err) => {
                let reason = err.to_string();
                self.mark_illegal(reason.clone());
                VatSyscallResult::error(reason)
            }
        }
    }

    fn reject(&mut self, error: &ProtocolError) {
        self.mark_illegal(format!("invalid syscall: {error}"));
    }
}

fn vat_named(kref: &Kref) -> bool {
    !kref.as_str().starts_with('k')
}

/// Checks that `vat_id` holds `kref`, adopting unseen vat-named krefs.
pub(crate) fn claim(
    keeper: &mut dyn KernelKeeper,
    vat_id: &VatId,
    kref: &Kref,
) -> Result<(), KernelError> {
    let held = match kref.kind() {
        KrefKind::Object => match keeper.get_object(kref) {
            None if vat_named(kref) => {
                return keeper.add_object(kref, Some(vat_id.clone()));
            }
            None => return Err(KernelError::UnknownKref(kref.clone())),
            Some(record) => record.owner.as_ref() == Some(vat_id),
        },
        KrefKind::Promise => match keeper.get_kernel_promise(kref) {
            None if vat_named(kref) => {
                return keeper.add_named_promise(
                    kref,
                    ResolutionPolicy::Ignore,
                    Some(vat_id.clone()),
                );
            }
            None => return Err(KernelError::UnknownKref(kref.clone())),
            Some(promise) => promise.decider.as_ref() == Some(vat_id),
        },
        KrefKind::Device => false,
    };
    if held || keeper.has_import(vat_id, kref) {
        Ok(())
    } else {
        Err(KernelError::IllegalSyscall(format!(
            "{vat_id} does not hold {kref}"
        )))
    }
}

/// Like [`claim`], but the vat must be the promise's decider.
fn claim_decided(
    keeper: &mut dyn KernelKeeper,
    vat_id: &VatId,
    kpid: &Kref,
) -> Result<(), KernelError> {
    kpid.insist_kind(KrefKind::Promise)?;
    claim(keeper, vat_id, kpid)?;
    let decider = keeper
        .get_kernel_promise(kpid)
        .and_then(|promise| promise.decider);
    if decider.as_ref() != Some(vat_id) {
        return Err(KernelError::NotDecider {
            kpid: kpid.clone(),
            caller: vat_id.to_string(),
            decider: decider.map_or_else(|| "kernel".to_string(), |vat| vat.to_string()),
        });
    }
    Ok(())
}

/// Records that `vat_id` now references `kref`, unless it owns or decides it.
pub(crate) fn import_into(keeper: &mut dyn KernelKeeper, vat_id: &VatId, kref: &Kref) {
    let held = match kref.kind() {
        KrefKind::Object => keeper
            .get_object(kref)
            .is_some_and(|record| record.owner.as_ref() == Some(vat_id)),
        KrefKind::Promise => keeper
            .get_kernel_promise(kref)
            .is_some_and(|promise| promise.decider.as_ref() == Some(vat_id)),
        KrefKind::Device => false,
    };
    if !held && keeper.add_import(vat_id, kref) {
        keeper.increment_ref_count(kref, VAT_IMPORT);
    }
}

pub(crate) fn drop_import(
    keeper: &mut dyn KernelKeeper,
    vat_id: &VatId,
    kref: &Kref,
) -> Result<(), KernelError> {
    if keeper.remove_import(vat_id, kref) {
        keeper.decrement_ref_count(kref, VAT_IMPORT)?;
    }
    Ok(())
}
