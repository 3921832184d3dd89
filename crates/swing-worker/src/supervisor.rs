//! Worker-side supervisor loop.
//!
//! Runs on the worker thread (or in the `swing-vat-worker` process), answers
//! the manager's `setUplink`/`setBundle`/`deliver` frames and relays the
//! vat's syscalls as blocking round-trips on the same transport.

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use swing_protocol::{
    CapData, ManagerMessage, VatDeliveryObject, VatDeliveryResult, VatSyscallObject,
    VatSyscallResult, WorkerMessage, WorkerOptions,
};
use swing_store::Bundle;

use crate::error::WorkerError;
use crate::transport::Transport;

/// Kernel access handed to a vat when it is built.
pub trait VatSyscaller: Send + Sync {
    fn syscall(&self, vso: VatSyscallObject) -> VatSyscallResult;

    /// Issues a syscall that has not been validated yet. Invalid syscalls
    /// yield an error result.
    fn raw_syscall(&self, frame: Value) -> VatSyscallResult {
        match VatSyscallObject::from_json(&frame) {
            Ok(vso) => self.syscall(vso),
            Err(err) => VatSyscallResult::Error(format!("invalid syscall: {err}")),
        }
    }

    /// Side-channel diagnostic output. Dropped in consensus mode.
    fn test_log(&self, line: &str);
}

pub type SyscallHandle = Arc<dyn VatSyscaller>;

/// A running vat: receives one delivery at a time.
pub trait VatDispatch {
    fn dispatch(&mut self, delivery: VatDeliveryObject) -> VatDeliveryResult;
}

/// Builds a vat from its bundle.
pub trait VatBuilder: Send + Sync {
    fn build(
        &self,
        bundle: &Bundle,
        vat_parameters: &CapData,
        options: &WorkerOptions,
        syscall: SyscallHandle,
    ) -> anyhow::Result<Box<dyn VatDispatch>>;
}

type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Syscaller that forwards over the worker transport and blocks for the
/// manager's `syscallResponse`.
struct PortSyscaller {
    transport: SharedTransport,
    consensus_mode: bool,
    fault: Mutex<Option<String>>,
}

impl PortSyscaller {
    fn record_fault(&self, reason: String) {
        log::warn!("worker syscall channel failed: {reason}");
        if let Ok(mut fault) = self.fault.lock() {
            fault.get_or_insert(reason);
        }
    }

    fn take_fault(&self) -> Option<String> {
        self.fault.lock().ok().and_then(|mut fault| fault.take())
    }

    /// Sends `["syscall", frame]`; the manager validates the frame.
    fn round_trip(&self, frame: Value) -> Result<VatSyscallResult, WorkerError> {
        let mut transport = self
            .transport
            .lock()
            .map_err(|_| WorkerError::violation("transport lock poisoned"))?;
        transport.send(&json!(["syscall", frame]))?;
        let frame = transport.recv()?;
        match ManagerMessage::from_json(&frame)? {
            ManagerMessage::SyscallResponse(result) => Ok(result),
            other => Err(WorkerError::violation(format!(
                "expected syscallResponse, got {}",
                other.tag()
            ))),
        }
    }
}

impl VatSyscaller for PortSyscaller {
    fn syscall(&self, vso: VatSyscallObject) -> VatSyscallResult {
        self.raw_syscall(vso.to_json())
    }

    fn raw_syscall(&self, frame: Value) -> VatSyscallResult {
        match self.round_trip(frame) {
            Ok(result) => result,
            Err(err) => {
                let reason = err.to_string();
                self.record_fault(reason.clone());
                VatSyscallResult::Error(reason)
            }
        }
    }

    fn test_log(&self, line: &str) {
        if self.consensus_mode {
            return;
        }
        let sent = self
            .transport
            .lock()
            .map_err(|_| WorkerError::violation("transport lock poisoned"))
            .and_then(|mut transport| {
                transport.send(&WorkerMessage::TestLog(vec![line.to_string()]).to_json())
            });
        if let Err(err) = sent {
            self.record_fault(err.to_string());
        }
    }
}

/// Serves one vat until the manager sends `shutdown` or closes the channel.
pub fn run_worker(transport: Box<dyn Transport>, builder: &dyn VatBuilder) -> Result<(), WorkerError> {
    let transport: SharedTransport = Arc::new(Mutex::new(transport));
    let mut vat: Option<(Box<dyn VatDispatch>, Arc<PortSyscaller>)> = None;
    let mut uplinked = false;

    loop {
        let frame = {
            let mut guard = transport
                .lock()
                .map_err(|_| WorkerError::violation("transport lock poisoned"))?;
            match guard.recv() {
                Ok(frame) => frame,
                Err(WorkerError::Closed) => return Ok(()),
                Err(err) => return Err(err),
            }
        };
        match ManagerMessage::from_json(&frame)? {
            ManagerMessage::SetUplink => {
                if uplinked {
                    return Err(WorkerError::violation("duplicate setUplink"));
                }
                uplinked = true;
                send(&transport, WorkerMessage::SetUplinkAck)?;
            }
            ManagerMessage::SetBundle(set) => {
                if !uplinked || vat.is_some() {
                    return Err(WorkerError::violation("unexpected setBundle"));
                }
                let bundle = Bundle::from_json(&set.bundle)?;
                send(&transport, WorkerMessage::GotBundle)?;
                let syscaller = Arc::new(PortSyscaller {
                    transport: transport.clone(),
                    consensus_mode: set.options.consensus_mode,
                    fault: Mutex::new(None),
                });
                let dispatch = builder
                    .build(&bundle, &set.vat_parameters, &set.options, syscaller.clone())
                    .map_err(|err| WorkerError::Build(format!("{err:#}")))?;
                log::debug!("vat {} ready", set.vat_id);
                vat = Some((dispatch, syscaller));
                send(&transport, WorkerMessage::DispatchReady)?;
            }
            ManagerMessage::Deliver(delivery) => {
                let Some((dispatch, syscaller)) = vat.as_mut() else {
                    return Err(WorkerError::violation("deliver before setBundle"));
                };
                let result = dispatch.dispatch(delivery);
                if let Some(fault) = syscaller.take_fault() {
                    return Err(WorkerError::violation(fault));
                }
                send(&transport, WorkerMessage::DeliverDone(result))?;
            }
            ManagerMessage::SyscallResponse(_) => {
                return Err(WorkerError::violation("syscallResponse outside a syscall"));
            }
            ManagerMessage::Shutdown => return Ok(()),
        }
    }
}

fn send(transport: &SharedTransport, msg: WorkerMessage) -> Result<(), WorkerError> {
    transport
        .lock()
        .map_err(|_| WorkerError::violation("transport lock poisoned"))?
        .send(&msg.to_json())
}
