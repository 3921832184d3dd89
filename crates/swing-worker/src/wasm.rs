//! Deterministic wasm vats on Wasmtime.
//!
//! A wasm vat exports `memory`, `alloc(len) -> ptr` and
//! `deliver(ptr, len) -> (ptr, len)`, exchanging JSON-encoded deliveries and
//! delivery results. It may import `env.syscall(ptr, len) -> i64`, which
//! returns the JSON syscall result packed as `ptr << 32 | len`, and
//! `env.test_log(ptr, len)`. Fuel consumed by a delivery is reported as
//! computrons.

use std::collections::HashMap;
use std::fmt::Write;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use sha2::{Digest, Sha256};
use swing_protocol::{MeterUsage, VatDeliveryObject, VatDeliveryResult, VatSyscallResult};
use wasmtime::{Caller, Config, Engine, Linker, Memory, Module, Store, Trap, TypedFunc};

use crate::supervisor::{SyscallHandle, VatDispatch};

const DELIVER_EXPORT: &str = "deliver";
const ALLOC_EXPORT: &str = "alloc";
const MEMORY_EXPORT: &str = "memory";
const HOST_MODULE: &str = "env";
const WASMTIME_VERSION: &str = "36.0.3";

/// Fuel available to a single delivery.
pub const DEFAULT_DELIVERY_FUEL: u64 = 100_000_000;

/// Problem reported when a delivery runs out of fuel.
pub const OUT_OF_FUEL: &str = "compute meter exhausted";

/// Deterministic runtime wrapper around Wasmtime with a compiled-module cache.
pub struct WasmVatRuntime {
    engine: Arc<Engine>,
    module_cache: Mutex<HashMap<ModuleKey, Arc<Module>>>,
    disk_cache: Option<DiskCache>,
    delivery_fuel: u64,
}

impl WasmVatRuntime {
    /// Build a runtime with deterministic configuration (no threads, fuel
    /// metering, canonical NaNs).
    pub fn new() -> Result<Self> {
        Self::new_with_disk_cache(None)
    }

    /// Build a runtime and optionally persist compiled modules under `cache_dir`.
    pub fn new_with_disk_cache(cache_dir: Option<PathBuf>) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.wasm_multi_value(true);
        cfg.wasm_threads(false);
        cfg.wasm_reference_types(true);
        cfg.consume_fuel(true);
        cfg.debug_info(false);
        cfg.cranelift_nan_canonicalization(true);
        let engine = Engine::new(&cfg)?;
        let disk_cache = if let Some(dir) = cache_dir {
            let fingerprint = engine_cache_fingerprint();
            let engine_dir = dir.join(&fingerprint);
            fs::create_dir_all(&engine_dir)
                .with_context(|| format!("create cache dir {}", engine_dir.display()))?;
            Some(DiskCache {
                root: dir,
                engine_fingerprint: fingerprint,
            })
        } else {
            None
        };
        Ok(Self {
            engine: Arc::new(engine),
            module_cache: Mutex::new(HashMap::new()),
            disk_cache,
            delivery_fuel: DEFAULT_DELIVERY_FUEL,
        })
    }

    pub fn with_delivery_fuel(mut self, fuel: u64) -> Self {
        self.delivery_fuel = fuel;
        self
    }

    /// Obtain (and cache) a compiled module for the given wasm bytes.
    pub fn cached_module(&self, wasm_bytes: &[u8]) -> Result<Arc<Module>> {
        let key = ModuleKey::from_bytes(wasm_bytes);
        if let Some(existing) = self.get_cached_module(&key) {
            return Ok(existing);
        }

        if let Some(serialized) = self.load_serialized(&key)? {
            self.insert_cached_module(key, serialized.clone());
            return Ok(serialized);
        }

        let compiled = Arc::new(Module::new(&self.engine, wasm_bytes)?);
        if let Err(err) = self.store_serialized(&key, &compiled) {
            log::warn!("failed to persist compiled vat module: {err:#}");
        }
        self.insert_cached_module(key, compiled.clone());
        Ok(compiled)
    }

    /// Instantiate a vat whose syscalls go to `syscall`.
    pub fn instantiate(
        &self,
        wasm_bytes: &[u8],
        syscall: SyscallHandle,
        metered: bool,
    ) -> Result<WasmVat> {
        let module = self.cached_module(wasm_bytes)?;
        let mut store = Store::new(&self.engine, VatHost { syscall });
        store.set_fuel(self.delivery_fuel)?;
        let mut linker = Linker::new(&self.engine);
        register_host_fns(&mut linker)?;
        let instance = linker.instantiate(&mut store, &module)?;
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .context("wasm export 'memory' not found")?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, ALLOC_EXPORT)
            .context("wasm export 'alloc' not found")?;
        let deliver = instance
            .get_typed_func::<(i32, i32), (i32, i32)>(&mut store, DELIVER_EXPORT)
            .context("wasm export 'deliver' not found")?;
        Ok(WasmVat {
            store,
            memory,
            alloc,
            deliver,
            fuel: self.delivery_fuel,
            metered,
        })
    }

    fn get_cached_module(&self, key: &ModuleKey) -> Option<Arc<Module>> {
        self.module_cache.lock().ok()?.get(key).cloned()
    }

    fn insert_cached_module(&self, key: ModuleKey, module: Arc<Module>) {
        if let Ok(mut cache) = self.module_cache.lock() {
            cache.entry(key).or_insert(module);
        }
    }

    fn load_serialized(&self, key: &ModuleKey) -> Result<Option<Arc<Module>>> {
        let cache = match &self.disk_cache {
            Some(cache) => cache,
            None => return Ok(None),
        };
        let path = cache.module_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = match fs::read(&path) {
            Ok(data) => data,
            Err(_) => {
                let _ = fs::remove_file(&path);
                return Ok(None);
            }
        };
        // Safety: the file was produced by `Module::serialize` for an engine
        // with the same fingerprint.
        match unsafe { Module::deserialize(&self.engine, &bytes) } {
            Ok(module) => Ok(Some(Arc::new(module))),
            Err(_) => {
                let _ = fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    fn store_serialized(&self, key: &ModuleKey, module: &Arc<Module>) -> Result<()> {
        let cache = match &self.disk_cache {
            Some(cache) => cache,
            None => return Ok(()),
        };
        let bytes = module
            .serialize()
            .context("serialize compiled vat module")?;
        let path = cache.module_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create cache dir {}", parent.display()))?;
        }
        fs::write(&path, bytes)
            .with_context(|| format!("write serialized module {}", path.display()))?;
        Ok(())
    }
}

struct VatHost {
    syscall: SyscallHandle,
}

fn register_host_fns(linker: &mut Linker<VatHost>) -> Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "syscall",
        |mut caller: Caller<'_, VatHost>, ptr: i32, len: i32| -> Result<i64> {
            let request = read_guest(&mut caller, ptr, len)?;
            let response = match serde_json::from_slice::<Value>(&request) {
                Ok(frame) => caller.data().syscall.raw_syscall(frame),
                Err(err) => VatSyscallResult::Error(format!("invalid syscall: {err}")),
            };
            let bytes = serde_json::to_vec(&response.to_json())?;
            let out_ptr = write_guest(&mut caller, &bytes)?;
            Ok(((out_ptr as u32 as i64) << 32) | bytes.len() as i64)
        },
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "test_log",
        |mut caller: Caller<'_, VatHost>, ptr: i32, len: i32| -> Result<()> {
            let bytes = read_guest(&mut caller, ptr, len)?;
            let line = String::from_utf8_lossy(&bytes);
            caller.data().syscall.test_log(&line);
            Ok(())
        },
    )?;
    Ok(())
}

fn guest_memory(caller: &mut Caller<'_, VatHost>) -> Result<Memory> {
    caller
        .get_export(MEMORY_EXPORT)
        .and_then(|export| export.into_memory())
        .ok_or_else(|| anyhow!("wasm export 'memory' not found"))
}

fn read_guest(caller: &mut Caller<'_, VatHost>, ptr: i32, len: i32) -> Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let ptr = usize::try_from(ptr).context("negative guest pointer")?;
    let len = usize::try_from(len).context("negative guest length")?;
    let mut buf = vec![0u8; len];
    memory.read(&*caller, ptr, &mut buf)?;
    Ok(buf)
}

fn write_guest(caller: &mut Caller<'_, VatHost>, bytes: &[u8]) -> Result<i32> {
    let memory = guest_memory(caller)?;
    let alloc = caller
        .get_export(ALLOC_EXPORT)
        .and_then(|export| export.into_func())
        .ok_or_else(|| anyhow!("wasm export 'alloc' not found"))?
        .typed::<i32, i32>(&*caller)?;
    let len = i32::try_from(bytes.len()).context("syscall result too large for wasm32")?;
    let ptr = alloc.call(&mut *caller, len)?;
    let offset = usize::try_from(ptr).context("negative guest pointer")?;
    memory.write(&mut *caller, offset, bytes)?;
    Ok(ptr)
}

/// One instantiated wasm vat. Instance state persists across deliveries.
pub struct WasmVat {
    store: Store<VatHost>,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    deliver: TypedFunc<(i32, i32), (i32, i32)>,
    fuel: u64,
    metered: bool,
}

impl WasmVat {
    fn run(&mut self, delivery: &VatDeliveryObject) -> Result<VatDeliveryResult> {
        let input = serde_json::to_vec(&delivery.to_json())?;
        let input_len = i32::try_from(input.len()).context("delivery too large for wasm32")?;
        let input_ptr = self.alloc.call(&mut self.store, input_len)?;
        self.memory
            .write(&mut self.store, input_ptr as usize, &input)?;
        let (out_ptr, out_len) = self
            .deliver
            .call(&mut self.store, (input_ptr, input_len))?;
        let output_len = usize::try_from(out_len).context("negative output length")?;
        let mut output = vec![0u8; output_len];
        self.memory
            .read(&self.store, out_ptr as usize, &mut output)?;
        let value: Value = serde_json::from_slice(&output).context("decode delivery result")?;
        Ok(VatDeliveryResult::from_json(&value)?)
    }
}

impl VatDispatch for WasmVat {
    fn dispatch(&mut self, delivery: VatDeliveryObject) -> VatDeliveryResult {
        if let Err(err) = self.store.set_fuel(self.fuel) {
            return VatDeliveryResult::error(format!("fuel setup failed: {err:#}"));
        }
        let outcome = self.run(&delivery);
        let remaining = self.store.get_fuel().unwrap_or(0);
        let usage = self.metered.then(|| MeterUsage {
            compute: self.fuel.saturating_sub(remaining),
        });
        let result = match outcome {
            Ok(result) => result,
            Err(err) if err.downcast_ref::<Trap>() == Some(&Trap::OutOfFuel) => {
                VatDeliveryResult::error(OUT_OF_FUEL)
            }
            Err(err) => VatDeliveryResult::error(format!("{err:#}")),
        };
        result.with_usage(usage)
    }
}

struct DiskCache {
    root: PathBuf,
    engine_fingerprint: String,
}

impl DiskCache {
    fn module_path(&self, key: &ModuleKey) -> PathBuf {
        self.root
            .join(&self.engine_fingerprint)
            .join(key.hex())
            .join("module.cmod")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ModuleKey([u8; 32]);

impl ModuleKey {
    fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest: [u8; 32] = hasher.finalize().into();
        Self(digest)
    }

    fn hex(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * 2);
        for byte in &self.0 {
            let _ = write!(&mut out, "{:02x}", byte);
        }
        out
    }
}

fn engine_cache_fingerprint() -> String {
    let desc = format!(
        "wasmtime:{version};arch:{arch};os:{os};multi_value:1;threads:0;ref_types:1;fuel:1;debug:0;nan_canon:1",
        version = WASMTIME_VERSION,
        arch = std::env::consts::ARCH,
        os = std::env::consts::OS,
    );
    let digest = Sha256::digest(desc.as_bytes());
    format!("engine-{:x}", digest)
}


#[cfg(test)]
impl WasmVatRuntime {
    fn cached_module_count(&self) -> usize {
        self.module_cache
            .lock()
            .expect("module cache poisoned")
            .len()
    }
}
