//! Shared helpers for kernel integration tests.
//!
//! Each integration test compiles this module separately, so some helpers
//! look unused from any single test file.

#![allow(dead_code)]

#[path = "../src/kernel/test_support.rs"]
pub mod test_support;

use std::sync::Arc;

use swing_kernel::{Kernel, KernelBuilder, KernelConfig, ResolutionPolicy, VatOptions};
use swing_protocol::{Kref, Passable, VatId};
use swing_store::{BundleId, MemBundleStore};
use swing_worker::{ThreadWorkerFactory, VatLoader};

pub fn builder(config: KernelConfig) -> KernelBuilder {
    let factory = ThreadWorkerFactory::new(Arc::new(VatLoader::native(test_support::registry())));
    KernelBuilder::new(Arc::new(MemBundleStore::new()), Arc::new(factory)).with_config(config)
}

pub fn kernel(config: KernelConfig) -> Kernel {
    builder(config).build().unwrap()
}

/// A kernel whose actors all log deliveries to one shared journal.
pub fn journaled_kernel(config: KernelConfig) -> (Kernel, test_support::Journal) {
    let journal = test_support::Journal::default();
    let registry = test_support::journaled_registry(journal.clone());
    let factory = ThreadWorkerFactory::new(Arc::new(VatLoader::native(registry)));
    let kernel = KernelBuilder::new(Arc::new(MemBundleStore::new()), Arc::new(factory))
        .with_config(config)
        .build()
        .unwrap();
    (kernel, journal)
}

pub fn install_actor(kernel: &mut Kernel) -> BundleId {
    kernel
        .install_bundle(&test_support::actor_bundle(), Some(test_support::ACTOR))
        .unwrap()
}

/// Creates an actor vat numbering its own krefs from `id_base`. Returns the
/// vat and its root object.
pub fn spawn(
    kernel: &mut Kernel,
    bundle_id: &BundleId,
    id_base: u64,
    options: VatOptions,
) -> (VatId, Kref) {
    let options = VatOptions {
        vat_parameters: test_support::id_base(id_base),
        ..options
    };
    let vat_id = kernel.create_vat(bundle_id, options).unwrap();
    let root = kernel.vat_root(&vat_id).unwrap();
    (vat_id, root)
}

pub fn actor(kernel: &mut Kernel, id_base: u64) -> (VatId, Kref) {
    let bundle_id = install_actor(kernel);
    spawn(kernel, &bundle_id, id_base, VatOptions::default())
}

/// An actor holding the vat-admin device.
pub fn privileged(kernel: &mut Kernel, id_base: u64) -> (VatId, Kref) {
    let bundle_id = install_actor(kernel);
    let options = VatOptions {
        enable_vat_admin: true,
        ..VatOptions::default()
    };
    spawn(kernel, &bundle_id, id_base, options)
}

pub fn send(kernel: &mut Kernel, target: &Kref, method: &str, args: Vec<Passable>) -> Kref {
    kernel
        .queue_to_kref(target, method, args, ResolutionPolicy::Ignore)
        .unwrap()
        .unwrap()
}

pub fn fulfilled(kernel: &Kernel, kpid: &Kref) -> Passable {
    match kernel.promise_result(kpid).unwrap() {
        Some((false, value)) => value,
        other => panic!("{kpid} is not fulfilled: {other:?}"),
    }
}

/// Message of the error `kpid` was rejected with.
pub fn rejection(kernel: &Kernel, kpid: &Kref) -> String {
    match kernel.promise_result(kpid).unwrap() {
        Some((true, Passable::Error { message, .. })) => message,
        other => panic!("{kpid} is not rejected with an error: {other:?}"),
    }
}

pub fn stored(kernel: &Kernel, vat_id: &VatId, key: &str) -> Option<String> {
    kernel.vatstore_get(vat_id, key)
}

pub fn remotable(value: &Passable) -> Kref {
    match value {
        Passable::Remotable { kref, .. } => kref.clone(),
        other => panic!("expected a remotable, got {other:?}"),
    }
}
