//! Wire vocabulary shared by the kernel, vat workers and the worker supervisor.
//!
//! Everything that crosses the kernel/vat boundary is defined here together
//! with its structural validator. Validators are pure and fail on the first
//! violated field; unknown tags are always rejected.

pub mod capdata;
pub mod delivery;
pub mod error;
pub mod kref;
pub mod marshal;
pub mod message;
pub mod syscall;
mod tuple;
pub mod wire;

pub use capdata::CapData;
pub use delivery::{MeterUsage, VatDeliveryObject, VatDeliveryResult, VatOneResolution};
pub use error::ProtocolError;
pub use kref::{Kref, KrefKind, VatId};
pub use marshal::{Passable, decode_methargs, encode_methargs};
pub use message::Message;
pub use syscall::{VatSyscallObject, VatSyscallResult};
pub use wire::{ManagerMessage, SetBundle, WorkerMessage, WorkerOptions};
