//! Starting vat workers: loading bundles and choosing where vats run.

use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use swing_protocol::{CapData, SetBundle, WorkerOptions};
use swing_store::{Bundle, ModuleFormat};

use crate::error::WorkerError;
use crate::manager::{PipeWorker, VatWorker, WorkerHandle};
use crate::native::{NativeVatContext, NativeVatRegistry};
use crate::supervisor::{SyscallHandle, VatBuilder, VatDispatch, run_worker};
use crate::transport::{ChannelTransport, FramedTransport};
use crate::wasm::WasmVatRuntime;

/// Builds vats from native or wasm bundles.
pub struct VatLoader {
    native: NativeVatRegistry,
    wasm: Option<Arc<WasmVatRuntime>>,
}

impl VatLoader {
    pub fn new(native: NativeVatRegistry, wasm: Option<Arc<WasmVatRuntime>>) -> Self {
        Self { native, wasm }
    }

    pub fn native(native: NativeVatRegistry) -> Self {
        Self::new(native, None)
    }
}

impl VatBuilder for VatLoader {
    fn build(
        &self,
        bundle: &Bundle,
        vat_parameters: &CapData,
        options: &WorkerOptions,
        syscall: SyscallHandle,
    ) -> anyhow::Result<Box<dyn VatDispatch>> {
        match bundle.module_format {
            ModuleFormat::Native => {
                let factory = self
                    .native
                    .get(&bundle.entry)
                    .ok_or_else(|| anyhow!("unknown native vat '{}'", bundle.entry))?;
                factory(NativeVatContext {
                    vat_parameters: vat_parameters.clone(),
                    options: options.clone(),
                    syscall,
                })
            }
            ModuleFormat::Wasm => {
                let runtime = self
                    .wasm
                    .as_ref()
                    .ok_or_else(|| anyhow!("this worker has no wasm runtime"))?;
                let bytes = bundle.entry_bytes().context("read wasm entry module")?;
                let vat = runtime.instantiate(&bytes, syscall, options.metered)?;
                Ok(Box::new(vat))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// Vat runs on a dedicated thread of the kernel process.
    #[default]
    Thread,
    /// Vat runs in a `swing-vat-worker` child process.
    Subprocess,
}

impl FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thread" | "local" => Ok(WorkerKind::Thread),
            "subprocess" => Ok(WorkerKind::Subprocess),
            other => Err(format!("unknown worker kind '{other}'")),
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerKind::Thread => "thread",
            WorkerKind::Subprocess => "subprocess",
        })
    }
}

/// Starts a worker for a vat and completes the handshake.
pub trait VatWorkerFactory: Send + Sync {
    fn start(&self, set_bundle: SetBundle) -> Result<Box<dyn VatWorker>, WorkerError>;
}

pub type DynWorkerFactory = Arc<dyn VatWorkerFactory>;

/// Runs each vat on its own thread, talking over in-process channels.
#[derive(Clone)]
pub struct ThreadWorkerFactory {
    loader: Arc<VatLoader>,
}

impl ThreadWorkerFactory {
    pub fn new(loader: Arc<VatLoader>) -> Self {
        Self { loader }
    }
}

impl VatWorkerFactory for ThreadWorkerFactory {
    fn start(&self, set_bundle: SetBundle) -> Result<Box<dyn VatWorker>, WorkerError> {
        let (manager_end, worker_end) = ChannelTransport::pair();
        let loader = self.loader.clone();
        let join = std::thread::Builder::new()
            .name(format!("vat-{}", set_bundle.vat_id))
            .spawn(move || {
                let result = run_worker(Box::new(worker_end), loader.as_ref());
                if let Err(err) = &result {
                    log::warn!("vat worker thread exited: {err}");
                }
                result
            })?;
        let worker = PipeWorker::start(
            Box::new(manager_end),
            WorkerHandle::Thread(join),
            set_bundle,
        )?;
        Ok(Box::new(worker))
    }
}

/// Runs each vat in a child process speaking framed JSON on stdin/stdout.
#[derive(Clone, Debug)]
pub struct SubprocessWorkerFactory {
    program: PathBuf,
    args: Vec<String>,
}

impl SubprocessWorkerFactory {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl VatWorkerFactory for SubprocessWorkerFactory {
    fn start(&self, set_bundle: SetBundle) -> Result<Box<dyn VatWorker>, WorkerError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(WorkerError::Dead("child process has no pipes".into()));
        };
        log::debug!(
            "started {} for vat {}",
            self.program.display(),
            set_bundle.vat_id
        );
        let transport = FramedTransport::new(stdout, stdin);
        let worker = PipeWorker::start(
            Box::new(transport),
            WorkerHandle::Process(child),
            set_bundle,
        )?;
        Ok(Box::new(worker))
    }
}
