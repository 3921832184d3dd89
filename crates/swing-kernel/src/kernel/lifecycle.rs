use swing_protocol::{CapData, Passable, VatDeliveryObject, VatDeliveryResult, VatId, marshal};
use swing_store::BundleId;

use super::syscall::{DeliveryOutcome, VatSyscalls, drop_import, import_into};
use super::{Kernel, VAT_ROOT};
use crate::device::VatAdminDevice;
use crate::error::KernelError;
use crate::queue::PanicHook;
use crate::state::{MeterRecord, VatStatus};

impl Kernel {
    /// Starts the worker of a vat in `Creating` state and delivers `startVat`.
    pub(crate) fn start_new_vat(&mut self, vat_id: &VatId) -> Result<(), KernelError> {
        let mut record = self
            .keeper
            .get_vat(vat_id)
            .ok_or_else(|| KernelError::UnknownVat(vat_id.clone()))?;
        let bundle = match self.bundles.get_bundle(&record.bundle_id) {
            Ok(bundle) => bundle,
            Err(err) => {
                self.fail_creation(vat_id, &err.to_string())?;
                return Err(err.into());
            }
        };
        let root = self.keeper.allocate_object(vat_id.clone());
        self.keeper.increment_ref_count(&root, VAT_ROOT);
        record.root = Some(root.clone());
        record.status = VatStatus::Running;
        self.keeper.put_vat(record.clone());
        if record.options.enable_vat_admin {
            import_into(self.keeper.as_mut(), vat_id, &VatAdminDevice::root());
        }

        let options = record.worker_options(self.config.consensus_mode);
        if let Err(err) = self.warehouse.start_vat(
            vat_id,
            record.incarnation,
            &bundle,
            &record.options.vat_parameters,
            options,
        ) {
            self.fail_creation(vat_id, &err.to_string())?;
            return Err(err);
        }
        log::info!("created vat {vat_id} from bundle {}", record.bundle_id);
        self.deliver_to_vat(
            vat_id,
            VatDeliveryObject::StartVat(record.options.vat_parameters.clone()),
        )?;
        if self.is_live(vat_id) {
            self.notify_admin(
                "newVatCallback",
                vec![Passable::string(vat_id.as_str()), Passable::remotable(root)],
            );
        }
        Ok(())
    }

    fn fail_creation(&mut self, vat_id: &VatId, problem: &str) -> Result<(), KernelError> {
        log::warn!("vat {vat_id} could not be created: {problem}");
        let reason = marshal::encode(&Passable::error(problem))?;
        self.terminate(vat_id, true, reason)
    }

    /// Processes a queued `create-vat` entry. Failures terminate the new vat
    /// rather than the kernel.
    pub(crate) fn process_create_vat(&mut self, vat_id: &VatId) -> Result<(), KernelError> {
        let pending = self
            .keeper
            .get_vat(vat_id)
            .is_some_and(|record| record.status == VatStatus::Creating);
        if !pending {
            return Ok(());
        }
        match self.start_new_vat(vat_id) {
            Ok(()) => Ok(()),
            Err(KernelError::Panic(reason)) => Err(KernelError::Panic(reason)),
            Err(err) => {
                log::warn!("dynamic vat {vat_id} failed to start: {err}");
                Ok(())
            }
        }
    }

    /// Restarts `vat_id` on a new bundle. Its vatstore and exports survive;
    /// promises it was deciding are rejected.
    pub fn upgrade_vat(
        &mut self,
        vat_id: &VatId,
        bundle_id: &BundleId,
        vat_parameters: CapData,
        upgrade_message: &str,
    ) -> Result<(), KernelError> {
        let mut record = self
            .keeper
            .get_vat(vat_id)
            .filter(|record| record.is_live())
            .ok_or_else(|| KernelError::UnknownVat(vat_id.clone()))?;
        let bundle = self.bundles.get_bundle(bundle_id)?;

        let upgraded = marshal::encode(&Passable::error("vat upgraded"))?;
        for kpid in self.keeper.promises_decided_by(vat_id) {
            self.with_queue(|queue| queue.resolve_to_error(&kpid, upgraded.clone(), None))?;
        }
        record.incarnation += 1;
        record.bundle_id = bundle_id.clone();
        record.options.vat_parameters = vat_parameters.clone();
        self.keeper.put_vat(record.clone());

        let options = record.worker_options(self.config.consensus_mode);
        let started = self.warehouse.start_vat(
            vat_id,
            record.incarnation,
            &bundle,
            &vat_parameters,
            options,
        );
        if let Err(err) = started {
            log::warn!("upgrade of vat {vat_id} failed: {err}");
            let reason = marshal::encode(&Passable::error(format!("upgrade failed: {err}")))?;
            self.terminate(vat_id, true, reason)?;
            self.notify_admin(
                "vatUpgradeCallback",
                vec![
                    Passable::string(vat_id.as_str()),
                    Passable::Bool(false),
                    Passable::string(upgrade_message),
                ],
            );
            return Ok(());
        }
        log::info!(
            "upgraded vat {vat_id} to incarnation {} ({bundle_id})",
            record.incarnation
        );
        self.deliver_to_vat(vat_id, VatDeliveryObject::StartVat(vat_parameters))?;
        let succeeded = self.is_live(vat_id);
        self.notify_admin(
            "vatUpgradeCallback",
            vec![
                Passable::string(vat_id.as_str()),
                Passable::Bool(succeeded),
                Passable::string(upgrade_message),
            ],
        );
        self.keeper.move_acceptance_to_run_queue();
        Ok(())
    }

    /// Host-initiated termination.
    pub fn terminate_vat(&mut self, vat_id: &VatId, reason: Passable) -> Result<(), KernelError> {
        let reason = marshal::encode(&reason)?;
        self.terminate(vat_id, true, reason)?;
        self.keeper.move_acceptance_to_run_queue();
        self.process_gc()
    }

    pub(crate) fn terminate(
        &mut self,
        vat_id: &VatId,
        is_failure: bool,
        reason: CapData,
    ) -> Result<(), KernelError> {
        let mut record = self
            .keeper
            .get_vat(vat_id)
            .ok_or_else(|| KernelError::UnknownVat(vat_id.clone()))?;
        if record.status == VatStatus::Terminated {
            return Ok(());
        }
        if is_failure {
            log::warn!("terminating vat {vat_id}: {}", reason.body);
        } else {
            log::info!("vat {vat_id} exited: {}", reason.body);
        }
        record.status = VatStatus::Terminated;
        self.keeper.put_vat(record.clone());

        let terminated = marshal::encode(&Passable::error("vat terminated"))?;
        for kpid in self.keeper.promises_decided_by(vat_id) {
            self.with_queue(|queue| queue.resolve_to_error(&kpid, terminated.clone(), None))?;
        }
        for kref in self.keeper.objects_owned_by(vat_id) {
            self.keeper.set_object_owner(&kref, None)?;
            if self.keeper.get_ref_count(&kref) == 0 {
                self.keeper.add_maybe_free(&kref);
            }
        }
        for kref in self.keeper.vat_imports(vat_id) {
            drop_import(self.keeper.as_mut(), vat_id, &kref)?;
        }
        if let Some(root) = &record.root {
            self.keeper.decrement_ref_count(root, VAT_ROOT)?;
        }
        if let Err(err) = self.warehouse.remove(vat_id) {
            log::warn!("could not stop the worker of vat {vat_id}: {err}");
        }
        self.keeper.vatstore_clear(vat_id);
        self.keeper.inc_stat("vatTerminated");

        if record.options.critical {
            self.panic
                .raise(&format!("critical vat {vat_id} terminated: {}", reason.body));
        }
        let reason = marshal::decode(&reason).unwrap_or(Passable::Null);
        self.notify_admin(
            "vatTerminated",
            vec![
                Passable::string(vat_id.as_str()),
                Passable::Bool(is_failure),
                reason,
            ],
        );
        Ok(())
    }

    /// Runs one delivery and applies its consequences: syscall side effects,
    /// metering and termination.
    pub(crate) fn deliver_to_vat(
        &mut self,
        vat_id: &VatId,
        delivery: VatDeliveryObject,
    ) -> Result<(), KernelError> {
        let Some(record) = self.keeper.get_vat(vat_id).filter(|record| record.is_live()) else {
            log::debug!("dropping {} for inactive vat {vat_id}", delivery.tag());
            return Ok(());
        };
        let options = record.worker_options(self.config.consensus_mode);
        let mut outcome = DeliveryOutcome::default();
        let delivered = {
            let mut syscalls = VatSyscalls::new(
                vat_id.clone(),
                self.keeper.as_mut(),
                self.bundles.as_ref(),
                &mut self.panic,
                &self.device,
                &mut outcome,
            );
            self.warehouse
                .deliver(vat_id, &options, &delivery, &mut syscalls)
        };
        self.keeper.inc_stat("delivery");

        let result = match delivered {
            Ok(result) => result,
            Err(KernelError::Replay { vat, reason }) => {
                let reason = format!("replay of vat {vat} diverged: {reason}");
                self.panic.raise(&reason);
                return Err(KernelError::Panic(reason));
            }
            Err(err) => {
                let reason = marshal::encode(&Passable::error(format!("worker failed: {err}")))?;
                return self.terminate(vat_id, true, reason);
            }
        };

        for (target, reason) in outcome.terminations {
            self.terminate(&target, true, reason)?;
        }
        if let Some(problem) = outcome.illegal {
            let reason = marshal::encode(&Passable::error(format!("illegal syscall: {problem}")))?;
            return self.terminate(vat_id, true, reason);
        }
        if let VatDeliveryResult::Error { problem, .. } = &result {
            let reason = marshal::encode(&Passable::error(format!("delivery failed: {problem}")))?;
            return self.terminate(vat_id, true, reason);
        }
        if let Some((is_failure, info)) = outcome.exit {
            return self.terminate(vat_id, is_failure, info);
        }
        if let (Some(meter_id), Some(usage)) = (&record.options.meter_id, result.usage()) {
            self.charge_meter(vat_id, meter_id, usage.compute)?;
        }
        Ok(())
    }

    fn charge_meter(
        &mut self,
        vat_id: &VatId,
        meter_id: &crate::state::MeterId,
        compute: u64,
    ) -> Result<(), KernelError> {
        let Some(meter) = self.keeper.get_meter(meter_id) else {
            return Err(KernelError::UnknownMeter(meter_id.clone()));
        };
        let Some(remaining) = meter.remaining else {
            return Ok(());
        };
        if compute > remaining {
            self.keeper.put_meter(
                meter_id,
                MeterRecord {
                    remaining: Some(0),
                    ..meter
                },
            )?;
            let reason = marshal::encode(&Passable::error("meter exhausted"))?;
            return self.terminate(vat_id, true, reason);
        }
        let left = remaining - compute;
        self.keeper.put_meter(
            meter_id,
            MeterRecord {
                remaining: Some(left),
                ..meter
            },
        )?;
        if remaining >= meter.threshold && left < meter.threshold {
            log::info!("meter {meter_id} fell below its threshold ({left} left)");
            self.notify_admin(
                "meterCrossedThreshold",
                vec![
                    Passable::string(meter_id.as_str()),
                    Passable::BigInt(i128::from(left)),
                ],
            );
        }
        Ok(())
    }
}
