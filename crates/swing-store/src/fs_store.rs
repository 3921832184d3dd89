use crate::{Bundle, BundleId, BundleStore, StoreError, StoreResult, io_error, validate_name};
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

/// Filesystem-backed store rooted at `<root>/.bundles`.
///
/// Bundles live in `bundles/<id>.json` and are written once; names are small
/// files under `names/` replaced atomically.
#[derive(Clone)]
pub struct FsBundleStore {
    bundles_dir: PathBuf,
    names_dir: PathBuf,
}

impl fmt::Debug for FsBundleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsBundleStore")
            .field("bundles_dir", &self.bundles_dir)
            .field("names_dir", &self.names_dir)
            .finish()
    }
}

impl FsBundleStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let store_root = root.as_ref().join(".bundles");
        let bundles_dir = store_root.join("bundles");
        let names_dir = store_root.join("names");
        fs::create_dir_all(&bundles_dir).map_err(|e| io_error(&bundles_dir, e))?;
        fs::create_dir_all(&names_dir).map_err(|e| io_error(&names_dir, e))?;
        Ok(Self {
            bundles_dir,
            names_dir,
        })
    }

    fn write_once(path: &Path, bytes: &[u8]) -> StoreResult<()> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(bytes).map_err(|e| io_error(path, e))?;
                file.sync_all().map_err(|e| io_error(path, e))?;
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(io_error(path, err)),
        }
    }

    fn replace(path: &Path, bytes: &[u8]) -> StoreResult<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
            file.write_all(bytes).map_err(|e| io_error(&tmp, e))?;
            file.sync_all().map_err(|e| io_error(&tmp, e))?;
        }
        fs::rename(&tmp, path).map_err(|e| io_error(path, e))
    }

    fn bundle_path(&self, id: &BundleId) -> PathBuf {
        self.bundles_dir.join(format!("{}.json", id.as_str()))
    }

    fn name_path(&self, name: &str) -> PathBuf {
        self.names_dir.join(name)
    }
}

impl BundleStore for FsBundleStore {
    fn put_bundle(&self, bundle: &Bundle) -> StoreResult<BundleId> {
        let id = bundle.id()?;
        let bytes = serde_json::to_vec(bundle)?;
        Self::write_once(&self.bundle_path(&id), &bytes)?;
        Ok(id)
    }

    fn get_bundle(&self, id: &BundleId) -> StoreResult<Bundle> {
        let path = self.bundle_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::UnknownBundle(id.clone()));
            }
            Err(err) => return Err(io_error(path, err)),
        };
        let bundle: Bundle = serde_json::from_slice(&bytes)?;
        let actual = bundle.id()?;
        if &actual != id {
            return Err(StoreError::HashMismatch {
                expected: id.clone(),
                actual,
            });
        }
        Ok(bundle)
    }

    fn has_bundle(&self, id: &BundleId) -> StoreResult<bool> {
        Ok(self.bundle_path(id).exists())
    }

    fn set_bundle_name(&self, name: &str, id: &BundleId) -> StoreResult<()> {
        validate_name(name)?;
        if !self.has_bundle(id)? {
            return Err(StoreError::UnknownBundle(id.clone()));
        }
        Self::replace(&self.name_path(name), id.as_str().as_bytes())
    }

    fn bundle_id_by_name(&self, name: &str) -> StoreResult<Option<BundleId>> {
        validate_name(name)?;
        let path = self.name_path(name);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(BundleId::parse(text.trim())?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(path, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bundle_round_trip() {
        let dir = TempDir::new().expect("tmp");
        let store = FsBundleStore::open(dir.path()).expect("open");
        let bundle = Bundle::wasm(b"\0asm\x01\0\0\0".to_vec());
        let id = store.put_bundle(&bundle).expect("put");
        assert!(store.has_bundle(&id).expect("has"));
        assert_eq!(store.get_bundle(&id).expect("get"), bundle);

        let reopened = FsBundleStore::open(dir.path()).expect("reopen");
        assert_eq!(reopened.get_bundle(&id).expect("get"), bundle);
    }

    #[test]
    fn names_survive_reopen_and_rebind() {
        let dir = TempDir::new().expect("tmp");
        let store = FsBundleStore::open(dir.path()).expect("open");
        let one = store.put_bundle(&Bundle::native("v1-logic")).expect("put");
        let two = store.put_bundle(&Bundle::native("v2-logic")).expect("put");
        store.set_bundle_name("zoe", &one).expect("name");
        store.set_bundle_name("zoe", &two).expect("rename");
        let reopened = FsBundleStore::open(dir.path()).expect("reopen");
        assert_eq!(reopened.bundle_id_by_name("zoe").expect("lookup"), Some(two));
    }

    #[test]
    fn hash_mismatch_detected() {
        let dir = TempDir::new().expect("tmp");
        let store = FsBundleStore::open(dir.path()).expect("open");
        let id = store.put_bundle(&Bundle::native("honest")).expect("put");
        let tampered = serde_json::to_vec(&Bundle::native("sneaky")).expect("json");
        fs::write(store.bundle_path(&id), tampered).expect("tamper");
        let err = store.get_bundle(&id).expect_err("should fail");
        assert!(matches!(err, StoreError::HashMismatch { .. }), "{err:?}");
    }

    #[test]
    fn missing_bundle_is_unknown() {
        let dir = TempDir::new().expect("tmp");
        let store = FsBundleStore::open(dir.path()).expect("open");
        let id = Bundle::native("ghost").id().expect("id");
        assert!(!store.has_bundle(&id).expect("has"));
        assert!(matches!(
            store.get_bundle(&id),
            Err(StoreError::UnknownBundle(_))
        ));
    }
}
