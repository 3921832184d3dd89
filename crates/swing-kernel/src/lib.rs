//! Vat kernel: run queue, promise table, reference counting, the vat-admin
//! device and the crank loop that delivers messages to vat workers.

pub mod config;
pub mod device;
pub mod error;
pub mod kernel;
pub mod queue;
pub mod state;

pub use config::KernelConfig;
pub use device::{KernelEndowments, VatAdminDevice, VatAdminEndowments};
pub use error::{DeviceError, KernelError};
pub use kernel::{Kernel, KernelBuilder};
pub use queue::{KernelQueue, PanicHook};
pub use state::{
    GcAction, KernelKeeper, KernelPromise, MemKernelKeeper, MeterId, MeterRecord, ObjectRecord,
    PromiseState, QueueEntry, ResolutionPolicy, VatOptions, VatRecord, VatStatus,
};
