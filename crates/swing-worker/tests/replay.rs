use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use serde_json::json;
use swing_protocol::{
    CapData, Kref, Message, Passable, VatDeliveryObject, VatDeliveryResult, VatId,
    VatOneResolution, VatSyscallObject, VatSyscallResult, WorkerOptions, marshal,
};
use swing_store::Bundle;
use swing_worker::{
    MemTranscriptStore, MismatchKind, NativeVatContext, NativeVatRegistry, ReplayMode,
    SerializedErrorTolerance, StrictComparator, SyscallHandle, SyscallHandler, ThreadWorkerFactory,
    TranscriptEntry, TranscriptHeader, TranscriptStore, VatDispatch, VatLoader, VatWorker,
    VatWorkerFactory, WorkerError, replay_transcript,
};

static ERROR_IDS: AtomicU64 = AtomicU64::new(70_000);

/// Counts `bump` calls in its vatstore; `explode` rejects the result promise
/// with an error whose id comes from a process-wide counter.
struct Tally {
    syscall: SyscallHandle,
}

impl VatDispatch for Tally {
    fn dispatch(&mut self, delivery: VatDeliveryObject) -> VatDeliveryResult {
        let VatDeliveryObject::Message { msg, .. } = delivery else {
            return VatDeliveryResult::ok();
        };
        match msg.method().as_deref() {
            Some("bump") => {
                let current = match self.syscall.syscall(VatSyscallObject::VatstoreGet("n".into())) {
                    VatSyscallResult::Ok(value) => value
                        .as_str()
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(0),
                    VatSyscallResult::Error(problem) => return VatDeliveryResult::error(problem),
                };
                self.syscall.syscall(VatSyscallObject::VatstoreSet {
                    key: "n".into(),
                    value: (current + 1).to_string(),
                });
                VatDeliveryResult::ok()
            }
            Some("explode") => {
                let Some(result) = msg.result.clone() else {
                    return VatDeliveryResult::error("explode needs a result promise");
                };
                let id = ERROR_IDS.fetch_add(1, Ordering::SeqCst);
                let mut error = Passable::error("boom");
                if let Passable::Error { error_id, .. } = &mut error {
                    *error_id = Some(format!("error:liveSlots:v1#{id}"));
                }
                let data = match marshal::encode(&error) {
                    Ok(data) => data,
                    Err(err) => return VatDeliveryResult::error(err.to_string()),
                };
                self.syscall.syscall(VatSyscallObject::Resolve(vec![VatOneResolution::new(
                    result, true, data,
                )]));
                VatDeliveryResult::ok()
            }
            _ => VatDeliveryResult::error("unknown method"),
        }
    }
}

fn factory() -> ThreadWorkerFactory {
    let registry = NativeVatRegistry::new();
    registry.register("tally", |ctx: NativeVatContext| {
        Ok(Box::new(Tally {
            syscall: ctx.syscall,
        }) as Box<dyn VatDispatch>)
    });
    ThreadWorkerFactory::new(Arc::new(VatLoader::native(registry)))
}

/// Kernel stand-in: a vatstore plus the entry being recorded.
struct Recorder {
    vatstore: BTreeMap<String, String>,
    entry: TranscriptEntry,
}

impl SyscallHandler for Recorder {
    fn handle(&mut self, vso: VatSyscallObject) -> VatSyscallResult {
        let result = match &vso {
            VatSyscallObject::VatstoreGet(key) => {
                VatSyscallResult::Ok(self.vatstore.get(key).cloned().into())
            }
            VatSyscallObject::VatstoreSet { key, value } => {
                self.vatstore.insert(key.clone(), value.clone());
                VatSyscallResult::ok_null()
            }
            _ => VatSyscallResult::ok_null(),
        };
        self.entry.record_syscall(&vso, &result);
        result
    }
}

fn call(method: &str, result: Option<Kref>) -> VatDeliveryObject {
    VatDeliveryObject::Message {
        target: Kref::parse("o+0").unwrap(),
        msg: Message::call(method, vec![], result).unwrap(),
    }
}

fn record(
    store: &mut MemTranscriptStore,
    vat_id: &VatId,
    deliveries: &[VatDeliveryObject],
) -> Result<BTreeMap<String, String>> {
    let bundle = Bundle::native("tally");
    let vat_parameters = CapData::new("#null", vec![]);
    store.start(TranscriptHeader::new(
        vat_id.clone(),
        0,
        vat_parameters.clone(),
        bundle.to_json(),
    ))?;
    let mut worker = factory().start(swing_protocol::SetBundle {
        vat_id: vat_id.clone(),
        bundle: bundle.to_json(),
        vat_parameters,
        options: WorkerOptions::default(),
    })?;
    let mut vatstore = BTreeMap::new();
    for delivery in deliveries {
        let mut recorder = Recorder {
            vatstore,
            entry: TranscriptEntry::new(delivery),
        };
        let result = worker.deliver(delivery, &mut recorder)?;
        recorder.entry.finish(&result);
        store.append(vat_id, &recorder.entry)?;
        vatstore = recorder.vatstore;
    }
    worker.shutdown()?;
    Ok(vatstore)
}

#[test]
fn replay_rebuilds_the_vat_faithfully() -> Result<()> {
    let vat_id = VatId::from_index(5);
    let mut store = MemTranscriptStore::new();
    let vatstore = record(&mut store, &vat_id, &[call("bump", None), call("bump", None), call("bump", None)])?;
    assert_eq!(vatstore.get("n").map(String::as_str), Some("3"));

    let transcript = store.load(&vat_id)?.expect("transcript recorded");
    assert_eq!(transcript.entries.len(), 3);
    let (mut worker, report) = replay_transcript(
        &factory(),
        &transcript,
        WorkerOptions::default(),
        &StrictComparator,
        ReplayMode::Consensus,
    )?;
    assert!(report.is_faithful());
    assert_eq!(report.deliveries, 3);

    // The replayed vat keeps going from where the recording left off.
    let mut live = Recorder {
        vatstore,
        entry: TranscriptEntry::new(&call("bump", None)),
    };
    assert!(worker.deliver(&call("bump", None), &mut live)?.is_ok());
    assert_eq!(live.vatstore.get("n").map(String::as_str), Some("4"));
    worker.shutdown()?;
    Ok(())
}

#[test]
fn tampered_transcript_diverges() -> Result<()> {
    let vat_id = VatId::from_index(6);
    let mut store = MemTranscriptStore::new();
    record(&mut store, &vat_id, &[call("bump", None), call("bump", None)])?;
    let mut transcript = store.load(&vat_id)?.expect("transcript recorded");
    transcript.entries[1].syscalls[1].d = json!(["vatstoreSet", "n", "7"]);

    let err = replay_transcript(
        &factory(),
        &transcript,
        WorkerOptions::default(),
        &StrictComparator,
        ReplayMode::Consensus,
    )
    .err()
    .expect("divergence");
    assert!(matches!(err, WorkerError::Divergence(_)), "{err}");

    let (mut worker, report) = replay_transcript(
        &factory(),
        &transcript,
        WorkerOptions::default(),
        &StrictComparator,
        ReplayMode::Diagnostic,
    )?;
    assert_eq!(report.deliveries, 2);
    assert_eq!(report.mismatches.len(), 1);
    assert_eq!(report.mismatches[0].delivery, 1);
    assert!(matches!(report.mismatches[0].kind, MismatchKind::Different { .. }));
    worker.shutdown()?;
    Ok(())
}

#[test]
fn error_ids_do_not_break_replay_under_tolerance() -> Result<()> {
    let vat_id = VatId::from_index(7);
    let mut store = MemTranscriptStore::new();
    record(&mut store, &vat_id, &[call("explode", Some(Kref::parse("kp40")?))])?;
    let transcript = store.load(&vat_id)?.expect("transcript recorded");

    let strict = replay_transcript(
        &factory(),
        &transcript,
        WorkerOptions::default(),
        &StrictComparator,
        ReplayMode::Consensus,
    );
    assert!(matches!(strict, Err(WorkerError::Divergence(_))));

    let (mut worker, report) = replay_transcript(
        &factory(),
        &transcript,
        WorkerOptions::default(),
        &SerializedErrorTolerance,
        ReplayMode::Consensus,
    )?;
    assert!(report.is_faithful());
    worker.shutdown()?;
    Ok(())
}
