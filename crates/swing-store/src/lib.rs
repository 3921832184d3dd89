//! Content-addressed bundle storage with filesystem and in-memory backends.

mod bundle;
mod fs_store;
mod mem_store;

pub use bundle::{BUNDLE_ID_PREFIX, Bundle, BundleId, ModuleFormat, to_canonical_cbor};
pub use fs_store::FsBundleStore;
pub use mem_store::MemBundleStore;

use std::{io, path::PathBuf, sync::Arc};

pub type StoreResult<T> = Result<T, StoreError>;
pub type DynBundleStore = Arc<dyn BundleStore>;

/// Trait implemented by all bundle stores.
pub trait BundleStore: Send + Sync {
    /// Stores a bundle under its computed id. Storing the same bundle twice
    /// is a no-op.
    fn put_bundle(&self, bundle: &Bundle) -> StoreResult<BundleId>;
    fn get_bundle(&self, id: &BundleId) -> StoreResult<Bundle>;
    fn has_bundle(&self, id: &BundleId) -> StoreResult<bool>;

    /// Points `name` at an installed bundle, replacing any earlier binding.
    fn set_bundle_name(&self, name: &str, id: &BundleId) -> StoreResult<()>;
    fn bundle_id_by_name(&self, name: &str) -> StoreResult<Option<BundleId>>;

    /// Stores a bundle after checking it hashes to `expected`.
    fn install_bundle(&self, expected: &BundleId, bundle: &Bundle) -> StoreResult<()> {
        let actual = bundle.id()?;
        if &actual != expected {
            return Err(StoreError::HashMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        self.put_bundle(bundle)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CBOR serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bundle hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: BundleId,
        actual: BundleId,
    },
    #[error("invalid bundle id '{0}'")]
    InvalidBundleId(String),
    #[error("invalid bundle: {0}")]
    InvalidBundle(String),
    #[error("bundle {0} not found")]
    UnknownBundle(BundleId),
    #[error("invalid bundle name '{0}'")]
    InvalidName(String),
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source: err,
    }
}

pub(crate) fn validate_name(name: &str) -> StoreResult<()> {
    let ok = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        && !name.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}
