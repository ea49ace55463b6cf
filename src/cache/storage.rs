//! Durable key/value storage.
//!
//! # Responsibilities
//! - Provide `get_item`/`set_item`/`remove_item`/`key`/`length` semantics
//! - Report every failure as a `StorageError` value, never a panic
//! - Persist entries across restarts (`FileStore`)
//!
//! # Design Decisions
//! - Keys are kept ordered so `key(index)` is stable between mutations
//! - `FileStore` writes through on every mutation; the file is small
//! - Callers treat any error as "not found" / no-op

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Errors produced at the storage boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Storage cannot be used at all (e.g. disabled, private mode).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The write would exceed the configured quota.
    #[error("storage quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// String key/value store with browser-storage semantics.
pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>>;

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Removing an absent key is not an error.
    fn remove_item(&self, key: &str) -> StorageResult<()>;

    /// Key at position `index`, if any.
    fn key(&self, index: usize) -> StorageResult<Option<String>>;

    fn length(&self) -> StorageResult<usize>;

    /// Snapshot of all keys.
    fn keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        for index in 0..self.length()? {
            if let Some(key) = self.key(index)? {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

fn usage(entries: &BTreeMap<String, String>) -> usize {
    entries.iter().map(|(k, v)| k.len() + v.len()).sum()
}

/// In-process store with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the total size of keys plus values, in bytes.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            quota: Some(quota),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut entries = self.lock();
        if let Some(quota) = self.quota {
            let current = usage(&entries);
            let replaced = entries.get(key).map_or(0, |old| key.len() + old.len());
            let needed = current - replaced + key.len() + value.len();
            if needed > quota {
                return Err(StorageError::QuotaExceeded { needed, quota });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        self.lock().remove(key);
        Ok(())
    }

    fn key(&self, index: usize) -> StorageResult<Option<String>> {
        Ok(self.lock().keys().nth(index).cloned())
    }

    fn length(&self) -> StorageResult<usize> {
        Ok(self.lock().len())
    }
}

/// Store persisted as a single JSON object on disk.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store, loading existing entries if the file exists.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries: BTreeMap<String, String> = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            serde_json::from_reader(reader)?
        } else {
            BTreeMap::new()
        };
        tracing::info!(path = ?path, entries = entries.len(), "Opened durable store");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> StorageResult<()> {
        let writer = BufWriter::new(File::create(&self.path)?);
        serde_json::to_writer(writer, entries)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut entries = self.lock();
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        let mut entries = self.lock();
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn key(&self, index: usize) -> StorageResult<Option<String>> {
        Ok(self.lock().keys().nth(index).cloned())
    }

    fn length(&self) -> StorageResult<usize> {
        Ok(self.lock().len())
    }
}

/// Store that refuses every operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableStore;

impl KeyValueStore for UnavailableStore {
    fn get_item(&self, _key: &str) -> StorageResult<Option<String>> {
        Err(StorageError::Unavailable("storage disabled".into()))
    }

    fn set_item(&self, _key: &str, _value: &str) -> StorageResult<()> {
        Err(StorageError::Unavailable("storage disabled".into()))
    }

    fn remove_item(&self, _key: &str) -> StorageResult<()> {
        Err(StorageError::Unavailable("storage disabled".into()))
    }

    fn key(&self, _index: usize) -> StorageResult<Option<String>> {
        Err(StorageError::Unavailable("storage disabled".into()))
    }

    fn length(&self) -> StorageResult<usize> {
        Err(StorageError::Unavailable("storage disabled".into()))
    }
}
