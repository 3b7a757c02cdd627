use std::{
    collections::HashMap,
    ffi::OsString,
    fs,
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::RwLock;
use uuid::Uuid;

use super::StorageError;

/// Opaque blob storage addressed by bucket and key.
pub trait ObjectStore: Send + Sync {
    /// Whether an object exists under `bucket/key`.
    fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError>;
    /// Bytes stored under `bucket/key`.
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;
    /// Stores `bytes` under `bucket/key`, replacing any previous object.
    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
}

/// One directory per bucket below `root`; keys may contain `/`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        for part in [bucket, key] {
            let path = Path::new(part);
            let safe = !part.is_empty()
                && path
                    .components()
                    .all(|component| matches!(component, Component::Normal(_)));
            if !safe {
                return Err(StorageError::InvalidKey(format!("{bucket}/{key}")));
            }
        }
        Ok(self.root.join(bucket).join(key))
    }
}

impl ObjectStore for FsObjectStore {
    fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self.object_path(bucket, key)?.is_file())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.object_path(bucket, key)?;
        if !path.is_file() {
            return Err(StorageError::NotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            });
        }
        fs::read(&path).map_err(|err| StorageError::io(path, err))
    }

    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| StorageError::io(parent, err))?;
        }
        // Unique sibling name: keys differing only by extension must not share it.
        let mut staging_name = OsString::from(".");
        staging_name.push(path.file_name().unwrap_or_default());
        staging_name.push(format!(".{}.partial", Uuid::new_v4().simple()));
        let staging = path.with_file_name(staging_name);
        fs::write(&staging, bytes).map_err(|err| StorageError::io(&staging, err))?;
        fs::rename(&staging, &path).map_err(|err| StorageError::io(&path, err))
    }
}

/// In-memory object store that counts uploads.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls so far.
    #[must_use]
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .objects
            .read()
            .contains_key(&(bucket.to_owned(), key.to_owned())))
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            })
    }

    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.objects
            .write()
            .insert((bucket.to_owned(), key.to_owned()), bytes.to_vec());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fs_store_round_trips_nested_keys() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(!store.exists("bucket", "model-registry/model.json").unwrap());
        store
            .put("bucket", "model-registry/model.json", b"{}")
            .unwrap();
        assert!(store.exists("bucket", "model-registry/model.json").unwrap());
        assert_eq!(
            store.get("bucket", "model-registry/model.json").unwrap(),
            b"{}"
        );
    }

    #[test]
    fn fs_store_rejects_escaping_keys() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(matches!(
            store.put("bucket", "../outside", b"x"),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            store.get("bucket", "absent.json"),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn fs_store_keeps_keys_sharing_a_stem_apart() {
        let dir = tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let keys = ["registry/model.json", "registry/model.bin", "registry/model.partial"];
        std::thread::scope(|scope| {
            for (idx, key) in (0u8..).zip(keys) {
                let store = &store;
                scope.spawn(move || {
                    for round in 0..50u8 {
                        store.put("bucket", key, &[idx, round]).unwrap();
                    }
                });
            }
        });
        for (idx, key) in (0u8..).zip(keys) {
            assert_eq!(store.get("bucket", key).unwrap(), [idx, 49]);
        }
        let leftovers = fs::read_dir(dir.path().join("bucket").join("registry"))
            .unwrap()
            .count();
        assert_eq!(leftovers, keys.len());
    }

    #[test]
    fn memory_store_counts_puts() {
        let store = MemoryObjectStore::new();
        store.put("b", "k", b"1").unwrap();
        store.put("b", "k", b"2").unwrap();
        assert_eq!(store.put_count(), 2);
        assert_eq!(store.get("b", "k").unwrap(), b"2");
    }
}
