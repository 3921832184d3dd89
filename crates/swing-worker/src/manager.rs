//! Kernel-side handle on a vat worker.

use std::process::Child;
use std::thread::JoinHandle;

use swing_protocol::{
    ManagerMessage, ProtocolError, SetBundle, VatDeliveryObject, VatDeliveryResult, VatId,
    VatSyscallObject, VatSyscallResult, WorkerMessage,
};

use crate::error::WorkerError;
use crate::transport::Transport;

/// Answers the syscalls a vat makes during one delivery.
pub trait SyscallHandler {
    fn handle(&mut self, vso: VatSyscallObject) -> VatSyscallResult;

    /// Called when the worker sent a syscall frame that failed validation.
    /// The vat receives an error result either way.
    fn reject(&mut self, error: &ProtocolError) {
        log::warn!("rejected malformed syscall: {error}");
    }
}

impl<F> SyscallHandler for F
where
    F: FnMut(VatSyscallObject) -> VatSyscallResult,
{
    fn handle(&mut self, vso: VatSyscallObject) -> VatSyscallResult {
        self(vso)
    }
}

/// A loaded vat as seen by the kernel.
pub trait VatWorker: Send {
    fn vat_id(&self) -> &VatId;

    /// Runs one delivery to completion, routing syscalls through `handler`.
    fn deliver(
        &mut self,
        delivery: &VatDeliveryObject,
        handler: &mut dyn SyscallHandler,
    ) -> Result<VatDeliveryResult, WorkerError>;

    /// Drains the `testLog` lines collected so far.
    fn take_test_log(&mut self) -> Vec<String>;

    fn shutdown(&mut self) -> Result<(), WorkerError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Ready,
    Delivering,
    Dead(String),
}

/// What runs the other end of the pipe.
pub enum WorkerHandle {
    Thread(JoinHandle<Result<(), WorkerError>>),
    Process(Child),
    Detached,
}

/// Manager for a worker reached through a [`Transport`].
pub struct PipeWorker {
    vat_id: VatId,
    transport: Box<dyn Transport>,
    handle: WorkerHandle,
    state: WorkerState,
    test_log: Vec<String>,
}

impl PipeWorker {
    /// Performs the `setUplink`/`setBundle` handshake and waits for
    /// `dispatchReady`.
    pub fn start(
        transport: Box<dyn Transport>,
        handle: WorkerHandle,
        set_bundle: SetBundle,
    ) -> Result<Self, WorkerError> {
        let mut worker = Self {
            vat_id: set_bundle.vat_id.clone(),
            transport,
            handle,
            state: WorkerState::Ready,
            test_log: Vec::new(),
        };
        let started = worker.handshake(set_bundle);
        if let Err(err) = started {
            worker.kill(err.to_string());
            return Err(err);
        }
        Ok(worker)
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    fn handshake(&mut self, set_bundle: SetBundle) -> Result<(), WorkerError> {
        self.send(ManagerMessage::SetUplink)?;
        self.expect(WorkerMessage::SetUplinkAck)?;
        self.send(ManagerMessage::SetBundle(Box::new(set_bundle)))?;
        self.expect(WorkerMessage::GotBundle)?;
        self.expect(WorkerMessage::DispatchReady)
    }

    fn send(&mut self, msg: ManagerMessage) -> Result<(), WorkerError> {
        self.transport.send(&msg.to_json())
    }

    fn recv(&mut self) -> Result<WorkerMessage, WorkerError> {
        let frame = self.transport.recv()?;
        Ok(WorkerMessage::from_json(&frame)?)
    }

    fn expect(&mut self, expected: WorkerMessage) -> Result<(), WorkerError> {
        let got = self.recv()?;
        if got == expected {
            Ok(())
        } else {
            Err(WorkerError::violation(format!(
                "expected {}, got {}",
                expected.tag(),
                got.tag()
            )))
        }
    }

    fn kill(&mut self, reason: String) {
        log::warn!("vat {} worker died: {reason}", self.vat_id);
        self.state = WorkerState::Dead(reason);
        if let WorkerHandle::Process(child) = &mut self.handle {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn delivery_loop(
        &mut self,
        handler: &mut dyn SyscallHandler,
    ) -> Result<VatDeliveryResult, WorkerError> {
        loop {
            let frame = self.transport.recv()?;
            let msg = match WorkerMessage::from_json(&frame) {
                Ok(msg) => msg,
                Err(err) if is_syscall_frame(&frame) => {
                    handler.reject(&err);
                    let response = VatSyscallResult::Error(format!("invalid syscall: {err}"));
                    self.send(ManagerMessage::SyscallResponse(response))?;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            match msg {
                WorkerMessage::Syscall(vso) => {
                    let response = handler.handle(vso);
                    self.send(ManagerMessage::SyscallResponse(response))?;
                }
                WorkerMessage::TestLog(lines) => self.test_log.extend(lines),
                WorkerMessage::DeliverDone(result) => return Ok(result),
                other => {
                    return Err(WorkerError::violation(format!(
                        "unexpected {} during delivery",
                        other.tag()
                    )));
                }
            }
        }
    }
}

fn is_syscall_frame(frame: &serde_json::Value) -> bool {
    frame.get(0).and_then(|tag| tag.as_str()) == Some("syscall")
}

impl VatWorker for PipeWorker {
    fn vat_id(&self) -> &VatId {
        &self.vat_id
    }

    fn deliver(
        &mut self,
        delivery: &VatDeliveryObject,
        handler: &mut dyn SyscallHandler,
    ) -> Result<VatDeliveryResult, WorkerError> {
        match &self.state {
            WorkerState::Ready => {}
            WorkerState::Delivering => {
                return Err(WorkerError::violation("delivery already in flight"));
            }
            WorkerState::Dead(reason) => return Err(WorkerError::Dead(reason.clone())),
        }
        self.state = WorkerState::Delivering;
        let outcome = self
            .send(ManagerMessage::Deliver(delivery.clone()))
            .and_then(|()| self.delivery_loop(handler));
        match outcome {
            Ok(result) => {
                self.state = WorkerState::Ready;
                Ok(result)
            }
            Err(err) => {
                self.kill(err.to_string());
                Err(err)
            }
        }
    }

    fn take_test_log(&mut self) -> Vec<String> {
        std::mem::take(&mut self.test_log)
    }

    fn shutdown(&mut self) -> Result<(), WorkerError> {
        if matches!(self.state, WorkerState::Dead(_)) {
            return Ok(());
        }
        let sent = self.send(ManagerMessage::Shutdown);
        self.state = WorkerState::Dead("shut down".into());
        match std::mem::replace(&mut self.handle, WorkerHandle::Detached) {
            WorkerHandle::Thread(join) => match join.join() {
                Ok(result) => result?,
                Err(_) => return Err(WorkerError::Dead("worker thread panicked".into())),
            },
            WorkerHandle::Process(mut child) => {
                let status = child.wait()?;
                if !status.success() {
                    log::warn!("vat {} worker exited with {status}", self.vat_id);
                }
            }
            WorkerHandle::Detached => {}
        }
        sent
    }
}

impl Drop for PipeWorker {
    fn drop(&mut self) {
        if let WorkerHandle::Process(child) = &mut self.handle {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
