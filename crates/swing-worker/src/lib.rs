//! Vat workers: the kernel-side manager, the worker-side supervisor, the
//! transports between them, and the transcripts that let a vat be rebuilt
//! by replay.

pub mod error;
pub mod factory;
pub mod manager;
pub mod native;
pub mod replay;
pub mod supervisor;
pub mod transcript;
pub mod transport;
pub mod wasm;

pub use error::WorkerError;
pub use factory::{
    DynWorkerFactory, SubprocessWorkerFactory, ThreadWorkerFactory, VatLoader, VatWorkerFactory,
    WorkerKind,
};
pub use manager::{PipeWorker, SyscallHandler, VatWorker, WorkerHandle, WorkerState};
pub use native::{NativeVatContext, NativeVatFactory, NativeVatRegistry};
pub use replay::{
    Mismatch, MismatchKind, ReplayMode, ReplayReport, SerializedErrorTolerance, StrictComparator,
    SyscallComparator, replay_entries, replay_transcript,
};
pub use supervisor::{SyscallHandle, VatBuilder, VatDispatch, VatSyscaller, run_worker};
pub use transcript::{
    FsTranscriptStore, MemTranscriptStore, SyscallRecord, Transcript, TranscriptEntry,
    TranscriptError, TranscriptHeader, TranscriptStore,
};
pub use transport::{ChannelTransport, FramedTransport, Transport};
pub use wasm::{DEFAULT_DELIVERY_FUEL, OUT_OF_FUEL, WasmVat, WasmVatRuntime};
