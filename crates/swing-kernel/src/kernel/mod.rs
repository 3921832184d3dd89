//! The kernel: owns the tables, the run queue and the vat warehouse, and
//! drives cranks.

use swing_protocol::{Kref, Message, Passable, VatId, marshal};
use swing_store::{Bundle, BundleId, DynBundleStore};
use swing_worker::{
    DynWorkerFactory, MemTranscriptStore, SerializedErrorTolerance, SyscallComparator,
    TranscriptStore,
};

use crate::config::KernelConfig;
use crate::device::VatAdminDevice;
use crate::error::KernelError;
use crate::queue::{KernelQueue, PanicHook};
use crate::state::{
    KernelKeeper, KernelPromise, MemKernelKeeper, MeterId, MeterRecord, ResolutionPolicy,
    VatOptions, VatRecord, VatStatus,
};

mod crank;
mod gc;
mod lifecycle;
mod syscall;
#[cfg(test)]
pub(crate) mod test_support;
mod warehouse;

use warehouse::VatWarehouse;

pub(crate) const VAT_IMPORT: &str = "vat|import";
pub(crate) const VAT_ROOT: &str = "vat|root";
pub(crate) const HOST_EXPORT: &str = "host|export";
pub(crate) const HOST_RESULT: &str = "host|result";

type PanicCallback = Box<dyn FnMut(&str) + Send>;

/// Records the first kernel-fatal error. Later raises are ignored.
#[derive(Default)]
pub(crate) struct PanicSink {
    reason: Option<String>,
    callback: Option<PanicCallback>,
}

impl PanicSink {
    fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

impl PanicHook for PanicSink {
    fn raise(&mut self, reason: &str) {
        if self.reason.is_some() {
            return;
        }
        log::error!("kernel panic: {reason}");
        self.reason = Some(reason.to_string());
        if let Some(callback) = self.callback.as_mut() {
            callback(reason);
        }
    }
}

pub struct KernelBuilder {
    bundles: DynBundleStore,
    factory: DynWorkerFactory,
    config: KernelConfig,
    keeper: Option<Box<dyn KernelKeeper>>,
    transcripts: Option<Box<dyn TranscriptStore>>,
    comparator: Option<Box<dyn SyscallComparator>>,
    on_panic: Option<PanicCallback>,
}

impl KernelBuilder {
    pub fn new(bundles: DynBundleStore, factory: DynWorkerFactory) -> Self {
        Self {
            bundles,
            factory,
            config: KernelConfig::default(),
            keeper: None,
            transcripts: None,
            comparator: None,
            on_panic: None,
        }
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_keeper(mut self, keeper: Box<dyn KernelKeeper>) -> Self {
        self.keeper = Some(keeper);
        self
    }

    pub fn with_transcript_store(mut self, transcripts: Box<dyn TranscriptStore>) -> Self {
        self.transcripts = Some(transcripts);
        self
    }

    /// Comparator used when replaying transcripts to reload evicted vats.
    pub fn with_comparator(mut self, comparator: Box<dyn SyscallComparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    /// Invoked once, with the reason, when the kernel panics.
    pub fn on_panic<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_panic = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> Result<Kernel, KernelError> {
        if self.config.max_vats_online == 0 {
            return Err(KernelError::Config(
                "max_vats_online must be at least 1".into(),
            ));
        }
        let warehouse = VatWarehouse::new(
            self.factory,
            self.transcripts
                .unwrap_or_else(|| Box::new(MemTranscriptStore::new())),
            self.config.max_vats_online,
            self.comparator
                .unwrap_or_else(|| Box::new(SerializedErrorTolerance)),
        );
        Ok(Kernel {
            config: self.config,
            keeper: self
                .keeper
                .unwrap_or_else(|| Box::new(MemKernelKeeper::new())),
            bundles: self.bundles,
            warehouse,
            device: VatAdminDevice::new(),
            panic: PanicSink {
                reason: None,
                callback: self.on_panic,
            },
        })
    }
}

pub struct Kernel {
    config: KernelConfig,
    keeper: Box<dyn KernelKeeper>,
    bundles: DynBundleStore,
    warehouse: VatWarehouse,
    device: VatAdminDevice,
    panic: PanicSink,
}

impl Kernel {
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn keeper(&self) -> &dyn KernelKeeper {
        self.keeper.as_ref()
    }

    /// Reason for the kernel panic, once one has happened.
    pub fn panic_reason(&self) -> Option<&str> {
        self.panic.reason()
    }

    /// Object that receives vat-admin callbacks.
    pub fn set_vat_admin_root(&mut self, root: Kref) -> Result<(), KernelError> {
        if self.keeper.get_object(&root).is_none() {
            return Err(KernelError::UnknownKref(root));
        }
        self.config.vat_admin_root = Some(root);
        Ok(())
    }

    /// Stores `bundle` and, when given, binds `name` to it.
    pub fn install_bundle(
        &mut self,
        bundle: &Bundle,
        name: Option<&str>,
    ) -> Result<BundleId, KernelError> {
        let bundle_id = self.bundles.put_bundle(bundle)?;
        if let Some(name) = name {
            self.bundles.set_bundle_name(name, &bundle_id)?;
        }
        log::debug!("installed bundle {bundle_id}");
        self.notify_admin("bundleInstalled", vec![Passable::string(bundle_id.as_str())]);
        Ok(bundle_id)
    }

    /// Creates a vat right away, delivering `startVat` before returning.
    pub fn create_vat(
        &mut self,
        bundle_id: &BundleId,
        options: VatOptions,
    ) -> Result<VatId, KernelError> {
        if !self.bundles.has_bundle(bundle_id)? {
            return Err(swing_store::StoreError::UnknownBundle(bundle_id.clone()).into());
        }
        if let Some(meter_id) = &options.meter_id {
            if self.keeper.get_meter(meter_id).is_none() {
                return Err(KernelError::UnknownMeter(meter_id.clone()));
            }
        }
        let vat_id = self.keeper.allocate_vat_id();
        self.keeper.put_vat(VatRecord {
            vat_id: vat_id.clone(),
            status: VatStatus::Creating,
            bundle_id: bundle_id.clone(),
            options,
            incarnation: 0,
            root: None,
        });
        self.start_new_vat(&vat_id)?;
        self.keeper.move_acceptance_to_run_queue();
        Ok(vat_id)
    }

    pub fn vat(&self, vat_id: &VatId) -> Option<VatRecord> {
        self.keeper.get_vat(vat_id)
    }

    pub fn vat_root(&self, vat_id: &VatId) -> Option<Kref> {
        self.keeper.get_vat(vat_id).and_then(|record| record.root)
    }

    /// Registers a vat-named object as exported by `vat_id` and pins it for
    /// the host.
    pub fn pin_export(&mut self, vat_id: &VatId, kref: &Kref) -> Result<(), KernelError> {
        if !self.is_live(vat_id) {
            return Err(KernelError::UnknownVat(vat_id.clone()));
        }
        match self.keeper.get_object(kref) {
            None => self.keeper.add_object(kref, Some(vat_id.clone()))?,
            Some(record) if record.owner.as_ref() == Some(vat_id) => {}
            Some(_) => {
                return Err(KernelError::IllegalSyscall(format!(
                    "{kref} is not exported by {vat_id}"
                )));
            }
        }
        self.keeper.increment_ref_count(kref, HOST_EXPORT);
        Ok(())
    }

    /// Sends `method(args)` to `target`. The result promise, if any, stays
    /// pinned until [`Kernel::release_result`].
    pub fn queue_to_kref(
        &mut self,
        target: &Kref,
        method: &str,
        args: Vec<Passable>,
        policy: ResolutionPolicy,
    ) -> Result<Option<Kref>, KernelError> {
        let result = self.with_queue(|queue| queue.queue_to_kref(target, method, args, policy))?;
        if let Some(kpid) = &result {
            self.keeper.increment_ref_count(kpid, HOST_RESULT);
        }
        Ok(result)
    }

    /// [`Kernel::queue_to_kref`] with the configured default policy.
    pub fn call(
        &mut self,
        target: &Kref,
        method: &str,
        args: Vec<Passable>,
    ) -> Result<Option<Kref>, KernelError> {
        let policy = self.config.default_policy;
        self.queue_to_kref(target, method, args, policy)
    }

    /// Enqueues a prepared message. A result promise not yet known to the
    /// kernel is registered and pinned for the host.
    pub fn queue_message(&mut self, target: &Kref, msg: Message) -> Result<(), KernelError> {
        let result = msg.result.clone();
        self.with_queue(|queue| queue.do_send(target, msg))?;
        if let Some(kpid) = &result {
            self.keeper.increment_ref_count(kpid, HOST_RESULT);
        }
        Ok(())
    }

    pub fn release_result(&mut self, kpid: &Kref) -> Result<(), KernelError> {
        self.keeper.decrement_ref_count(kpid, HOST_RESULT)?;
        self.process_gc()
    }

    pub fn promise(&self, kpid: &Kref) -> Option<KernelPromise> {
        self.keeper.get_kernel_promise(kpid)
    }

    /// Decoded settlement of `kpid`: `None` while unresolved.
    pub fn promise_result(&self, kpid: &Kref) -> Result<Option<(bool, Passable)>, KernelError> {
        let Some(promise) = self.keeper.get_kernel_promise(kpid) else {
            return Err(KernelError::UnknownPromise(kpid.clone()));
        };
        match (&promise.value, promise.is_resolved()) {
            (Some(value), true) => Ok(Some((promise.is_rejected(), marshal::decode(value)?))),
            _ => Ok(None),
        }
    }

    pub fn ref_count(&self, kref: &Kref) -> u64 {
        self.keeper.get_ref_count(kref)
    }

    pub fn stat(&self, name: &str) -> u64 {
        self.keeper.get_stat(name)
    }

    pub fn create_meter(&mut self, remaining: Option<u64>, threshold: u64) -> MeterId {
        self.keeper.add_meter(MeterRecord {
            remaining,
            threshold,
        })
    }

    pub fn meter(&self, meter_id: &MeterId) -> Option<MeterRecord> {
        self.keeper.get_meter(meter_id)
    }

    pub fn vatstore_get(&self, vat_id: &VatId, key: &str) -> Option<String> {
        self.keeper.vatstore_get(vat_id, key)
    }

    /// Stops every online worker. Transcripts are kept.
    pub fn shutdown(&mut self) -> Result<(), KernelError> {
        self.warehouse.shutdown_all()
    }

    pub(crate) fn with_queue<R>(&mut self, f: impl FnOnce(&mut KernelQueue<'_>) -> R) -> R {
        let mut queue = KernelQueue::new(self.keeper.as_mut(), &mut self.panic);
        f(&mut queue)
    }

    pub(crate) fn is_live(&self, vat_id: &VatId) -> bool {
        self.keeper
            .get_vat(vat_id)
            .is_some_and(|record| record.is_live())
    }

    fn check_panic(&self) -> Result<(), KernelError> {
        match self.panic.reason() {
            Some(reason) => Err(KernelError::Panic(reason.to_string())),
            None => Ok(()),
        }
    }

    /// Reports a kernel event to the vat-admin root, if one is configured.
    pub(crate) fn notify_admin(&mut self, method: &str, args: Vec<Passable>) {
        let Some(root) = self.config.vat_admin_root.clone() else {
            return;
        };
        let sent = self.with_queue(|queue| {
            queue.queue_to_kref(&root, method, args, ResolutionPolicy::LogFailure)
        });
        if let Err(err) = sent {
            log::warn!("could not deliver {method} to vat admin {root}: {err}");
        }
    }
}
