//! Kernel devices reachable from vats through `callNow`.

pub mod vat_admin;

pub use vat_admin::VatAdminDevice;

use swing_protocol::{CapData, VatId};
use swing_store::{Bundle, BundleId, BundleStore};

use crate::error::DeviceError;
use crate::state::{KernelKeeper, MeterId, MeterRecord, QueueEntry, VatOptions, VatRecord, VatStatus};

/// Kernel services the vat-admin device acts through.
pub trait VatAdminEndowments {
    fn has_bundle(&self, bundle_id: &BundleId) -> Result<bool, DeviceError>;
    fn get_bundle(&self, bundle_id: &BundleId) -> Result<Bundle, DeviceError>;
    fn get_named_bundle_id(&self, name: &str) -> Result<Option<BundleId>, DeviceError>;

    /// Installs `bundle` and queues creation of a vat running it.
    fn push_create_vat_bundle_event(
        &mut self,
        bundle: Bundle,
        options: VatOptions,
    ) -> Result<VatId, DeviceError>;
    fn push_create_vat_id_event(
        &mut self,
        bundle_id: BundleId,
        options: VatOptions,
    ) -> Result<VatId, DeviceError>;
    fn push_upgrade_vat_event(
        &mut self,
        vat_id: &VatId,
        bundle_id: BundleId,
        vat_parameters: CapData,
        upgrade_message: String,
    ) -> Result<(), DeviceError>;
    /// Requests termination; it takes effect after the current crank.
    fn terminate(&mut self, vat_id: &VatId, reason: CapData) -> Result<(), DeviceError>;

    fn meter_create(&mut self, remaining: Option<u64>, threshold: u64) -> MeterId;
    fn meter_add_remaining(&mut self, meter_id: &MeterId, delta: u64) -> Result<(), DeviceError>;
    fn meter_set_threshold(&mut self, meter_id: &MeterId, threshold: u64)
    -> Result<(), DeviceError>;
    fn meter_get(&self, meter_id: &MeterId) -> Result<MeterRecord, DeviceError>;

    /// Durable device state.
    fn get_state(&self, key: &str) -> Option<String>;
    fn set_state(&mut self, key: &str, value: &str);
}

/// Endowments backed by the kernel keeper and bundle store.
pub struct KernelEndowments<'a> {
    keeper: &'a mut dyn KernelKeeper,
    bundles: &'a dyn BundleStore,
    terminations: &'a mut Vec<(VatId, CapData)>,
}

impl<'a> KernelEndowments<'a> {
    pub fn new(
        keeper: &'a mut dyn KernelKeeper,
        bundles: &'a dyn BundleStore,
        terminations: &'a mut Vec<(VatId, CapData)>,
    ) -> Self {
        Self {
            keeper,
            bundles,
            terminations,
        }
    }

    fn live_vat(&self, vat_id: &VatId) -> Result<VatRecord, DeviceError> {
        self.keeper
            .get_vat(vat_id)
            .filter(|record| record.status != VatStatus::Terminated)
            .ok_or_else(|| DeviceError::UnknownVat(vat_id.clone()))
    }
}

fn store_err(err: swing_store::StoreError) -> DeviceError {
    DeviceError::Kernel(err.to_string())
}

impl VatAdminEndowments for KernelEndowments<'_> {
    fn has_bundle(&self, bundle_id: &BundleId) -> Result<bool, DeviceError> {
        self.bundles.has_bundle(bundle_id).map_err(store_err)
    }

    fn get_bundle(&self, bundle_id: &BundleId) -> Result<Bundle, DeviceError> {
        if !self.has_bundle(bundle_id)? {
            return Err(DeviceError::UnknownBundle(bundle_id.to_string()));
        }
        self.bundles.get_bundle(bundle_id).map_err(store_err)
    }

    fn get_named_bundle_id(&self, name: &str) -> Result<Option<BundleId>, DeviceError> {
        self.bundles.bundle_id_by_name(name).map_err(store_err)
    }

    fn push_create_vat_bundle_event(
        &mut self,
        bundle: Bundle,
        options: VatOptions,
    ) -> Result<VatId, DeviceError> {
        let bundle_id = self.bundles.put_bundle(&bundle).map_err(store_err)?;
        self.push_create_vat_id_event(bundle_id, options)
    }

    fn push_create_vat_id_event(
        &mut self,
        bundle_id: BundleId,
        options: VatOptions,
    ) -> Result<VatId, DeviceError> {
        if !self.has_bundle(&bundle_id)? {
            return Err(DeviceError::UnknownBundle(bundle_id.to_string()));
        }
        if let Some(meter_id) = &options.meter_id {
            self.meter_get(meter_id)?;
        }
        let vat_id = self.keeper.allocate_vat_id();
        self.keeper.put_vat(VatRecord {
            vat_id: vat_id.clone(),
            status: VatStatus::Creating,
            bundle_id: bundle_id.clone(),
            options: options.clone(),
            incarnation: 0,
            root: None,
        });
        self.keeper.add_to_acceptance_queue(QueueEntry::CreateVat {
            vat_id: vat_id.clone(),
            bundle_id,
            options,
        });
        Ok(vat_id)
    }

    fn push_upgrade_vat_event(
        &mut self,
        vat_id: &VatId,
        bundle_id: BundleId,
        vat_parameters: CapData,
        upgrade_message: String,
    ) -> Result<(), DeviceError> {
        self.live_vat(vat_id)?;
        if !self.has_bundle(&bundle_id)? {
            return Err(DeviceError::UnknownBundle(bundle_id.to_string()));
        }
        self.keeper.add_to_acceptance_queue(QueueEntry::UpgradeVat {
            vat_id: vat_id.clone(),
            bundle_id,
            vat_parameters,
            upgrade_message,
        });
        Ok(())
    }

    fn terminate(&mut self, vat_id: &VatId, reason: CapData) -> Result<(), DeviceError> {
        self.live_vat(vat_id)?;
        self.terminations.push((vat_id.clone(), reason));
        Ok(())
    }

    fn meter_create(&mut self, remaining: Option<u64>, threshold: u64) -> MeterId {
        self.keeper.add_meter(MeterRecord {
            remaining,
            threshold,
        })
    }

    fn meter_add_remaining(&mut self, meter_id: &MeterId, delta: u64) -> Result<(), DeviceError> {
        let mut meter = self.meter_get(meter_id)?;
        if let Some(remaining) = meter.remaining {
            let topped = remaining.checked_add(delta).ok_or_else(|| {
                DeviceError::bad_args(
                    "addMeterRemaining",
                    format!("meter {meter_id} cannot hold {remaining} + {delta}"),
                )
            })?;
            meter.remaining = Some(topped);
        }
        Ok(self.keeper.put_meter(meter_id, meter)?)
    }

    fn meter_set_threshold(
        &mut self,
        meter_id: &MeterId,
        threshold: u64,
    ) -> Result<(), DeviceError> {
        let mut meter = self.meter_get(meter_id)?;
        meter.threshold = threshold;
        Ok(self.keeper.put_meter(meter_id, meter)?)
    }

    fn meter_get(&self, meter_id: &MeterId) -> Result<MeterRecord, DeviceError> {
        self.keeper
            .get_meter(meter_id)
            .ok_or_else(|| DeviceError::UnknownMeter(meter_id.clone()))
    }

    fn get_state(&self, key: &str) -> Option<String> {
        self.keeper.device_state_get(key)
    }

    fn set_state(&mut self, key: &str, value: &str) {
        self.keeper.device_state_set(key, value);
    }
}
