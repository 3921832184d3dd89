//! Keeps a bounded set of vat workers loaded and records their transcripts.
//!
//! Workers are kept in least-recently-used order. A vat that was evicted is
//! brought back by replaying its transcript against a fresh worker before the
//! next delivery; a replay that diverges is reported as
//! [`KernelError::Replay`].

use indexmap::IndexMap;
use serde_json::Value;
use swing_protocol::{
    CapData, ProtocolError, SetBundle, VatDeliveryObject, VatDeliveryResult, VatId,
    VatSyscallObject, VatSyscallResult, WorkerOptions,
};
use swing_store::Bundle;
use swing_worker::{
    DynWorkerFactory, ReplayMode, SyscallComparator, SyscallHandler, SyscallRecord,
    TranscriptEntry, TranscriptHeader, TranscriptStore, VatWorker, WorkerError, replay_transcript,
};

use crate::error::KernelError;

pub(crate) struct VatWarehouse {
    factory: DynWorkerFactory,
    transcripts: Box<dyn TranscriptStore>,
    online: IndexMap<VatId, Box<dyn VatWorker>>,
    max_online: usize,
    comparator: Box<dyn SyscallComparator>,
}

impl VatWarehouse {
    pub(crate) fn new(
        factory: DynWorkerFactory,
        transcripts: Box<dyn TranscriptStore>,
        max_online: usize,
        comparator: Box<dyn SyscallComparator>,
    ) -> Self {
        Self {
            factory,
            transcripts,
            online: IndexMap::new(),
            max_online: max_online.max(1),
            comparator,
        }
    }

    /// Starts a new incarnation of `vat_id` with an empty transcript.
    pub(crate) fn start_vat(
        &mut self,
        vat_id: &VatId,
        incarnation: u64,
        bundle: &Bundle,
        vat_parameters: &CapData,
        options: WorkerOptions,
    ) -> Result<(), KernelError> {
        self.evict(vat_id)?;
        let bundle = bundle.to_json();
        self.transcripts.start(TranscriptHeader::new(
            vat_id.clone(),
            incarnation,
            vat_parameters.clone(),
            bundle.clone(),
        ))?;
        let worker = self.factory.start(SetBundle {
            vat_id: vat_id.clone(),
            bundle,
            vat_parameters: vat_parameters.clone(),
            options,
        })?;
        self.online.insert(vat_id.clone(), worker);
        self.enforce_limit(vat_id)
    }

    /// Delivers to `vat_id`, reloading it first if it was evicted, and
    /// appends the delivery to its transcript.
    pub(crate) fn deliver(
        &mut self,
        vat_id: &VatId,
        options: &WorkerOptions,
        delivery: &VatDeliveryObject,
        handler: &mut dyn SyscallHandler,
    ) -> Result<VatDeliveryResult, KernelError> {
        self.ensure_online(vat_id, options)?;
        let Some(worker) = self.online.get_mut(vat_id) else {
            return Err(KernelError::UnknownVat(vat_id.clone()));
        };
        let mut recording = Recording {
            inner: handler,
            entry: TranscriptEntry::new(delivery),
        };
        let result = match worker.deliver(delivery, &mut recording) {
            Ok(result) => result,
            Err(err) => {
                if let Some(mut dead) = self.online.shift_remove(vat_id) {
                    if let Err(shutdown_err) = dead.shutdown() {
                        log::warn!(
                            "worker for vat {vat_id} did not shut down cleanly: {shutdown_err}"
                        );
                    }
                }
                return Err(err.into());
            }
        };
        for line in worker.take_test_log() {
            log::info!("vat {vat_id}: {line}");
        }
        recording.entry.finish(&result);
        self.transcripts.append(vat_id, &recording.entry)?;
        Ok(result)
    }

    pub(crate) fn is_online(&self, vat_id: &VatId) -> bool {
        self.online.contains_key(vat_id)
    }

    pub(crate) fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Stops the worker without forgetting the vat.
    pub(crate) fn evict(&mut self, vat_id: &VatId) -> Result<(), KernelError> {
        if let Some(mut worker) = self.online.shift_remove(vat_id) {
            log::debug!("evicting vat {vat_id}");
            worker.shutdown()?;
        }
        Ok(())
    }

    /// Stops the worker and drops the transcript of a terminated vat.
    pub(crate) fn remove(&mut self, vat_id: &VatId) -> Result<(), KernelError> {
        let stopped = self.evict(vat_id);
        self.transcripts.remove(vat_id)?;
        stopped
    }

    pub(crate) fn shutdown_all(&mut self) -> Result<(), KernelError> {
        let mut first_err = None;
        for (vat_id, mut worker) in self.online.drain(..) {
            if let Err(err) = worker.shutdown() {
                log::warn!("worker for vat {vat_id} did not shut down cleanly: {err}");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn ensure_online(&mut self, vat_id: &VatId, options: &WorkerOptions) -> Result<(), KernelError> {
        if let Some(worker) = self.online.shift_remove(vat_id) {
            self.online.insert(vat_id.clone(), worker);
            return Ok(());
        }
        let transcript = self
            .transcripts
            .load(vat_id)?
            .ok_or_else(|| KernelError::UnknownVat(vat_id.clone()))?;
        let (worker, report) = replay_transcript(
            self.factory.as_ref(),
            &transcript,
            options.clone(),
            self.comparator.as_ref(),
            ReplayMode::Consensus,
        )
        .map_err(|err| match err {
            WorkerError::Divergence(reason) => KernelError::Replay {
                vat: vat_id.clone(),
                reason,
            },
            other => other.into(),
        })?;
        log::debug!(
            "reloaded vat {vat_id} from {} transcript entries",
            report.deliveries
        );
        self.online.insert(vat_id.clone(), worker);
        self.enforce_limit(vat_id)
    }

    /// Evicts least recently used workers, never `keep`.
    fn enforce_limit(&mut self, keep: &VatId) -> Result<(), KernelError> {
        while self.online.len() > self.max_online {
            let victim = self
                .online
                .keys()
                .find(|vat_id| *vat_id != keep)
                .cloned();
            match victim {
                Some(victim) => self.evict(&victim)?,
                None => break,
            }
        }
        Ok(())
    }
}

/// Passes syscalls through to the kernel while recording them.
struct Recording<'h> {
    inner: &'h mut dyn SyscallHandler,
    entry: TranscriptEntry,
}

impl SyscallHandler for Recording<'_> {
    fn handle(&mut self, vso: VatSyscallObject) -> VatSyscallResult {
        let result = self.inner.handle(vso.clone());
        self.entry.record_syscall(&vso, &result);
        result
    }

    fn reject(&mut self, error: &ProtocolError) {
        self.inner.reject(error);
        let problem = format!("invalid syscall: {error}");
        self.entry.syscalls.push(SyscallRecord {
            d: Value::String(problem.clone()),
            response: VatSyscallResult::Error(problem).to_json(),
        });
    }
}
