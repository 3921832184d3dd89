use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use swing_protocol::Kref;
use swing_worker::{
    DynWorkerFactory, NativeVatRegistry, SubprocessWorkerFactory, ThreadWorkerFactory, VatLoader,
    WasmVatRuntime, WorkerKind,
};

use crate::error::KernelError;
use crate::state::ResolutionPolicy;

pub const DEFAULT_MAX_VATS_ONLINE: usize = 50;
pub const DEFAULT_WORKER_PROGRAM: &str = "swing-vat-worker";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KernelConfig {
    /// Suppresses side channels (`testLog`) that must not affect consensus.
    pub consensus_mode: bool,
    /// Workers kept loaded before the least recently used one is evicted.
    pub max_vats_online: usize,
    pub worker_kind: WorkerKind,
    /// Binary spawned for subprocess workers.
    pub worker_program: Option<PathBuf>,
    pub module_cache_dir: Option<PathBuf>,
    /// Object that receives vat-admin callbacks (`newVatCallback`, ...).
    pub vat_admin_root: Option<Kref>,
    /// Policy for host-initiated calls that do not name one.
    pub default_policy: ResolutionPolicy,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            consensus_mode: false,
            max_vats_online: DEFAULT_MAX_VATS_ONLINE,
            worker_kind: WorkerKind::Thread,
            worker_program: None,
            module_cache_dir: None,
            vat_admin_root: None,
            default_policy: ResolutionPolicy::Ignore,
        }
    }
}

impl KernelConfig {
    /// Reads `SWINGSET_*` variables from the process environment.
    pub fn from_env() -> Result<Self, KernelError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`KernelConfig::from_env`], with the variables supplied by `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, KernelError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup("SWINGSET_CONSENSUS_MODE") {
            config.consensus_mode = parse_bool("SWINGSET_CONSENSUS_MODE", &raw)?;
        }
        if let Some(raw) = lookup("SWINGSET_MAX_VATS_ONLINE") {
            config.max_vats_online = raw
                .trim()
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    KernelError::Config(format!(
                        "SWINGSET_MAX_VATS_ONLINE must be a positive integer, got '{raw}'"
                    ))
                })?;
        }
        if let Some(raw) = lookup("SWINGSET_WORKER") {
            config.worker_kind = raw
                .trim()
                .parse()
                .map_err(|err| KernelError::Config(format!("SWINGSET_WORKER: {err}")))?;
        }
        if let Some(raw) = lookup("SWINGSET_WORKER_PROGRAM") {
            config.worker_program = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup("SWINGSET_MODULE_CACHE_DIR") {
            config.module_cache_dir = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup("SWINGSET_VAT_ADMIN_ROOT") {
            let kref = Kref::parse(raw.trim())
                .map_err(|err| KernelError::Config(format!("SWINGSET_VAT_ADMIN_ROOT: {err}")))?;
            if !kref.is_object() {
                return Err(KernelError::Config(format!(
                    "SWINGSET_VAT_ADMIN_ROOT must name an object, got {kref}"
                )));
            }
            config.vat_admin_root = Some(kref);
        }
        if let Some(raw) = lookup("SWINGSET_DEFAULT_POLICY") {
            config.default_policy = raw
                .trim()
                .parse()
                .map_err(|err| KernelError::Config(format!("SWINGSET_DEFAULT_POLICY: {err}")))?;
        }
        Ok(config)
    }

    /// Builds the worker factory selected by `worker_kind`. Native vats are
    /// only available to thread workers.
    pub fn worker_factory(&self, native: NativeVatRegistry) -> Result<DynWorkerFactory, KernelError> {
        match self.worker_kind {
            WorkerKind::Thread => {
                let runtime = WasmVatRuntime::new_with_disk_cache(self.module_cache_dir.clone())
                    .map_err(|err| KernelError::Config(format!("wasm runtime: {err:#}")))?;
                let loader = VatLoader::new(native, Some(Arc::new(runtime)));
                Ok(Arc::new(ThreadWorkerFactory::new(Arc::new(loader))))
            }
            WorkerKind::Subprocess => {
                let program = self
                    .worker_program
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_PROGRAM));
                let mut factory = SubprocessWorkerFactory::new(program);
                if let Some(dir) = &self.module_cache_dir {
                    factory = factory
                        .arg("--module-cache-dir")
                        .arg(dir.display().to_string());
                }
                Ok(Arc::new(factory))
            }
        }
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, KernelError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(KernelError::Config(format!(
            "{name} must be a boolean, got '{raw}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = KernelConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, KernelConfig::default());
    }

    #[test]
    fn reads_swingset_variables() {
        let config = KernelConfig::from_lookup(lookup(&[
            ("SWINGSET_CONSENSUS_MODE", "true"),
            ("SWINGSET_MAX_VATS_ONLINE", "3"),
            ("SWINGSET_WORKER", "subprocess"),
            ("SWINGSET_WORKER_PROGRAM", "/opt/bin/swing-vat-worker"),
            ("SWINGSET_VAT_ADMIN_ROOT", "ko1"),
            ("SWINGSET_DEFAULT_POLICY", "logFailure"),
        ]))
        .unwrap();
        assert!(config.consensus_mode);
        assert_eq!(config.max_vats_online, 3);
        assert_eq!(config.worker_kind, WorkerKind::Subprocess);
        assert_eq!(
            config.worker_program,
            Some(PathBuf::from("/opt/bin/swing-vat-worker"))
        );
        assert_eq!(config.vat_admin_root, Some(Kref::object(1)));
        assert_eq!(config.default_policy, ResolutionPolicy::LogFailure);
    }

    #[test]
    fn rejects_bad_values() {
        for vars in [
            [("SWINGSET_CONSENSUS_MODE", "maybe")],
            [("SWINGSET_MAX_VATS_ONLINE", "0")],
            [("SWINGSET_WORKER", "xs-worker")],
            [("SWINGSET_VAT_ADMIN_ROOT", "kp1")],
            [("SWINGSET_DEFAULT_POLICY", "shrug")],
        ] {
            assert!(
                matches!(KernelConfig::from_lookup(lookup(&vars)), Err(KernelError::Config(_))),
                "{vars:?}"
            );
        }
    }
}
