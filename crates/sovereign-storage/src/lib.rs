//! # Sovereign Storage
//!
//! Persistence for the state that must survive a restart: reputation records
//! and the island log.
//!
//! ## Storage Layout
//!
//! - `reputation/records` - bincode map of peer reputation records
//! - `island/log` - bincode island hash chain
//!
//! [`MemoryStore`] backs tests and ephemeral nodes; [`FileStore`] writes one
//! file per key under a data directory.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sovereign_core::SovereignError;
use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Encoding error on key {key}: {reason}")]
    Encoding { key: String, reason: String },
}

impl From<StorageError> for SovereignError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Encoding { .. } => SovereignError::Serialization(err.to_string()),
            _ => SovereignError::Storage(err.to_string()),
        }
    }
}

/// Byte-oriented key/value store
pub trait KeyValueStore: Send + Sync {
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns whether the key existed
    fn delete(&self, key: &str) -> Result<bool>;

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Encode `value` with bincode and store it under `key`
pub fn put_typed<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value).map_err(|e| StorageError::Encoding {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    store.put(key, &bytes)
}

/// Load and decode the value stored under `key`
pub fn get_typed<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Encoding {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

pub mod memory {
    //! In-memory store

    use super::{KeyValueStore, Result};
    use parking_lot::RwLock;
    use std::collections::HashMap;

    pub struct MemoryStore {
        data: RwLock<HashMap<String, Vec<u8>>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self {
                data: RwLock::new(HashMap::new()),
            }
        }

        pub fn len(&self) -> usize {
            self.data.read().len()
        }

        pub fn is_empty(&self) -> bool {
            self.data.read().is_empty()
        }

        /// Overwrite stored bytes in place, bypassing any typed encoding
        pub fn tamper(&self, key: &str, f: impl FnOnce(&mut Vec<u8>)) -> bool {
            match self.data.write().get_mut(key) {
                Some(value) => {
                    f(value);
                    true
                }
                None => false,
            }
        }
    }

    impl Default for MemoryStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl KeyValueStore for MemoryStore {
        fn put(&self, key: &str, value: &[u8]) -> Result<()> {
            self.data.write().insert(key.to_string(), value.to_vec());
            Ok(())
        }

        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.data.read().get(key).cloned())
        }

        fn delete(&self, key: &str) -> Result<bool> {
            Ok(self.data.write().remove(key).is_some())
        }
    }
}

pub mod file {
    //! Directory-backed store, one file per key

    use super::{KeyValueStore, Result, StorageError};
    use parking_lot::Mutex;
    use std::fs;
    use std::io::{ErrorKind, Write};
    use std::path::{Path, PathBuf};

    pub struct FileStore {
        root: PathBuf,
        // Serializes writers so temp files never collide
        write_lock: Mutex<()>,
    }

    impl FileStore {
        /// Open (creating if needed) a store rooted at `root`
        pub fn open(root: impl AsRef<Path>) -> Result<Self> {
            let root = root.as_ref().to_path_buf();
            fs::create_dir_all(&root).map_err(|source| StorageError::Io {
                key: root.display().to_string(),
                source,
            })?;
            tracing::debug!("Opened file store at {}", root.display());
            Ok(Self {
                root,
                write_lock: Mutex::new(()),
            })
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        fn path_for(&self, key: &str) -> Result<PathBuf> {
            let valid = !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.'))
                && !key.split('/').any(|part| part.is_empty() || part == "." || part == "..");
            if !valid {
                return Err(StorageError::InvalidKey(key.to_string()));
            }
            Ok(self.root.join(format!("{}.bin", key)))
        }

        fn io_err(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
            move |source| StorageError::Io {
                key: key.to_string(),
                source,
            }
        }
    }

    impl KeyValueStore for FileStore {
        fn put(&self, key: &str, value: &[u8]) -> Result<()> {
            let path = self.path_for(key)?;
            let _guard = self.write_lock.lock();

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(Self::io_err(key))?;
            }

            // Write-then-rename so a crash never leaves a torn value
            let tmp = path.with_extension("bin.tmp");
            {
                let mut file = fs::File::create(&tmp).map_err(Self::io_err(key))?;
                file.write_all(value).map_err(Self::io_err(key))?;
                file.sync_all().map_err(Self::io_err(key))?;
            }
            fs::rename(&tmp, &path).map_err(Self::io_err(key))?;
            Ok(())
        }

        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            let path = self.path_for(key)?;
            match fs::read(&path) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(Self::io_err(key)(e)),
            }
        }

        fn delete(&self, key: &str) -> Result<bool> {
            let path = self.path_for(key)?;
            let _guard = self.write_lock.lock();
            match fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(Self::io_err(key)(e)),
            }
        }
    }
}

pub use file::FileStore;
pub use memory::MemoryStore;

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        peer: String,
        score: f64,
    }

    #[test]
    fn test_memory_store_basic() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        store.put("a", b"1").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));
        assert!(store.contains("a").unwrap());

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_typed_roundtrip() {
        let store = MemoryStore::new();
        let record = Record {
            peer: "alice".into(),
            score: 0.8,
        };

        put_typed(&store, "reputation/records", &record).unwrap();
        let loaded: Option<Record> = get_typed(&store, "reputation/records").unwrap();
        assert_eq!(loaded, Some(record));

        let missing: Option<Record> = get_typed(&store, "missing").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_typed_decode_failure() {
        let store = MemoryStore::new();
        store.put("bad", &[0xff]).unwrap();

        let result: Result<Option<Record>> = get_typed(&store, "bad");
        let err = result.unwrap_err();
        assert!(matches!(err, StorageError::Encoding { .. }));
        assert!(matches!(
            SovereignError::from(err),
            SovereignError::Serialization(_)
        ));
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.put("island/log", b"chain").unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get("island/log").unwrap(), Some(b"chain".to_vec()));
        assert!(store.delete("island/log").unwrap());
        assert_eq!(store.get("island/log").unwrap(), None);
    }

    #[test]
    fn test_file_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        for key in ["", "../etc/passwd", "a//b", "a b", "/abs"] {
            assert!(
                matches!(store.put(key, b"x"), Err(StorageError::InvalidKey(_))),
                "key {:?} should be rejected",
                key
            );
        }
    }

    #[test]
    fn test_tamper_helper() {
        let store = MemoryStore::new();
        store.put("k", b"abc").unwrap();
        assert!(store.tamper("k", |v| v[0] = b'x'));
        assert_eq!(store.get("k").unwrap(), Some(b"xbc".to_vec()));
        assert!(!store.tamper("missing", |_| {}));
    }
}
