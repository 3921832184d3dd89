//! Reference-count driven collection of promises and objects.

use std::collections::BTreeMap;

use swing_protocol::{Kref, KrefKind, VatDeliveryObject, VatId};

use super::Kernel;
use crate::error::KernelError;
use crate::queue::RESOLVE_DATA;
use crate::state::GcAction;

impl Kernel {
    /// Collects everything that became unreferenced, until a pass frees
    /// nothing new.
    pub(crate) fn process_gc(&mut self) -> Result<(), KernelError> {
        loop {
            let mut progressed = false;

            for action in self.keeper.take_gc_actions() {
                progressed = true;
                match action {
                    GcAction::RetireImports { vat_id, krefs } => {
                        if self.is_live(&vat_id) {
                            self.deliver_to_vat(&vat_id, VatDeliveryObject::RetireImports(krefs))?;
                        }
                    }
                }
            }

            let mut drops: BTreeMap<VatId, Vec<Kref>> = BTreeMap::new();
            for kref in self.keeper.take_maybe_free() {
                if self.keeper.get_ref_count(&kref) > 0 {
                    continue;
                }
                match kref.kind() {
                    KrefKind::Promise => {
                        let Some(promise) = self.keeper.get_kernel_promise(&kref) else {
                            continue;
                        };
                        if !promise.is_resolved() {
                            continue;
                        }
                        log::debug!("collecting promise {kref}");
                        self.keeper.delete_kernel_promise(&kref);
                        if let Some(value) = &promise.value {
                            for slot in &value.slots {
                                self.keeper.decrement_ref_count(slot, RESOLVE_DATA)?;
                            }
                        }
                        progressed = true;
                    }
                    KrefKind::Object => {
                        let Some(record) = self.keeper.get_object(&kref) else {
                            continue;
                        };
                        match record.owner.filter(|owner| self.is_live(owner)) {
                            Some(owner) => drops.entry(owner).or_default().push(kref),
                            None => {
                                log::debug!("collecting orphaned object {kref}");
                                self.keeper.delete_object(&kref);
                                progressed = true;
                            }
                        }
                    }
                    KrefKind::Device => {}
                }
            }

            for (owner, krefs) in drops {
                progressed = true;
                log::debug!("dropping {} exports of {owner}", krefs.len());
                self.deliver_to_vat(&owner, VatDeliveryObject::DropExports(krefs.clone()))?;
                self.deliver_to_vat(&owner, VatDeliveryObject::RetireExports(krefs.clone()))?;
                for kref in krefs {
                    if self.keeper.get_ref_count(&kref) == 0 {
                        self.keeper.delete_object(&kref);
                    }
                }
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    /// Asks `vat_id` to sweep, then collects whatever it released.
    pub fn bring_out_your_dead(&mut self, vat_id: &VatId) -> Result<(), KernelError> {
        if !self.is_live(vat_id) {
            return Err(KernelError::UnknownVat(vat_id.clone()));
        }
        self.deliver_to_vat(vat_id, VatDeliveryObject::BringOutYourDead)?;
        self.keeper.move_acceptance_to_run_queue();
        self.process_gc()
    }
}
