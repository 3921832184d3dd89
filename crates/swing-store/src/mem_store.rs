use crate::{Bundle, BundleId, BundleStore, StoreError, StoreResult, validate_name};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

#[derive(Clone, Default)]
pub struct MemBundleStore {
    bundles: Arc<RwLock<HashMap<BundleId, Bundle>>>,
    names: Arc<RwLock<HashMap<String, BundleId>>>,
}

impl std::fmt::Debug for MemBundleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBundleStore")
            .field("bundles", &self.bundles.read().unwrap().len())
            .field("names", &self.names.read().unwrap().len())
            .finish()
    }
}

impl MemBundleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BundleStore for MemBundleStore {
    fn put_bundle(&self, bundle: &Bundle) -> StoreResult<BundleId> {
        let id = bundle.id()?;
        let mut guard = self.bundles.write().unwrap();
        guard.entry(id.clone()).or_insert_with(|| bundle.clone());
        Ok(id)
    }

    fn get_bundle(&self, id: &BundleId) -> StoreResult<Bundle> {
        self.bundles
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownBundle(id.clone()))
    }

    fn has_bundle(&self, id: &BundleId) -> StoreResult<bool> {
        Ok(self.bundles.read().unwrap().contains_key(id))
    }

    fn set_bundle_name(&self, name: &str, id: &BundleId) -> StoreResult<()> {
        validate_name(name)?;
        if !self.has_bundle(id)? {
            return Err(StoreError::UnknownBundle(id.clone()));
        }
        self.names
            .write()
            .unwrap()
            .insert(name.to_string(), id.clone());
        Ok(())
    }

    fn bundle_id_by_name(&self, name: &str) -> StoreResult<Option<BundleId>> {
        Ok(self.names.read().unwrap().get(name).cloned())
    }
}
