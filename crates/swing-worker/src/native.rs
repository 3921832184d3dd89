//! In-process vats written in Rust, looked up by the bundle's entry name.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use swing_protocol::{CapData, WorkerOptions};

use crate::supervisor::{SyscallHandle, VatDispatch};

/// Everything a native vat receives when it is built.
pub struct NativeVatContext {
    pub vat_parameters: CapData,
    pub options: WorkerOptions,
    pub syscall: SyscallHandle,
}

pub type NativeVatFactory =
    Arc<dyn Fn(NativeVatContext) -> anyhow::Result<Box<dyn VatDispatch>> + Send + Sync>;

/// Shared table of native vat factories.
#[derive(Clone, Default)]
pub struct NativeVatRegistry {
    factories: Arc<RwLock<HashMap<String, NativeVatFactory>>>,
}

impl fmt::Debug for NativeVatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self
            .factories
            .read()
            .map(|map| {
                let mut names: Vec<_> = map.keys().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default();
        f.debug_struct("NativeVatRegistry")
            .field("names", &names)
            .finish()
    }
}

impl NativeVatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(NativeVatContext) -> anyhow::Result<Box<dyn VatDispatch>> + Send + Sync + 'static,
    {
        if let Ok(mut map) = self.factories.write() {
            map.insert(name.into(), Arc::new(factory));
        }
    }

    pub fn get(&self, name: &str) -> Option<NativeVatFactory> {
        self.factories.read().ok()?.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}
