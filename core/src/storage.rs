//! Key-value persistence.
//!
//! Every service persists its state as one JSON document under one key.
//! There are no transactions: the last writer wins.
//!
//! - `MemoryStore` - DashMap-backed, optional byte quota (tests, `--ephemeral`)
//! - `RocksStore` - RocksDB-backed, survives restarts

use crate::{Result, SosError};
use dashmap::DashMap;
use rocksdb::{IteratorMode, Options, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Raw byte key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write `value` under `key`. Returns `SosError::QuotaExceeded` when the
    /// backend refuses the write for size reasons.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    fn keys(&self) -> Result<Vec<String>>;
}

/// JSON helpers on top of any [`KeyValueStore`].
pub trait JsonStoreExt {
    fn get_json<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>>;
    fn put_json<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> Result<()>;
}

impl<S: KeyValueStore + ?Sized> JsonStoreExt for S {
    fn get_json<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        match self.get(key)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn put_json<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> Result<()> {
        let serialized = serde_json::to_vec(value)?;
        self.put(key, &serialized)
    }
}

/// In-memory store.
///
/// With a quota set, a write that would make the sum of all stored values
/// exceed it is rejected with `QuotaExceeded`, mimicking a full browser
/// storage area.
#[derive(Default)]
pub struct MemoryStore {
    items: DashMap<String, Vec<u8>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            items: DashMap::new(),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Total bytes currently stored.
    pub fn used_bytes(&self) -> usize {
        self.items.iter().map(|e| e.value().len()).sum()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.items.get(key).map(|e| e.value().clone()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        if let Some(quota) = self.quota_bytes {
            let existing = self.items.get(key).map(|e| e.value().len()).unwrap_or(0);
            let projected = self.used_bytes() - existing + value.len();
            if projected > quota {
                debug!(target: "storage", key, projected, quota, "Memory store over quota");
                return Err(SosError::QuotaExceeded {
                    key: key.to_string(),
                    bytes: value.len(),
                });
            }
        }
        self.items.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.items.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.items.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}

/// Persistent storage using RocksDB
pub struct RocksStore {
    db: DB,
    max_value_bytes: Option<usize>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path).map_err(|e| SosError::StorageError(e.to_string()))?;

        info!(target: "storage", "RocksDB store initialized");
        Ok(Self {
            db,
            max_value_bytes: None,
        })
    }

    /// Reject single values larger than `bytes`.
    pub fn with_value_limit(mut self, bytes: usize) -> Self {
        self.max_value_bytes = Some(bytes);
        self
    }
}

impl KeyValueStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|e| SosError::StorageError(e.to_string()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        if let Some(limit) = self.max_value_bytes {
            if value.len() > limit {
                return Err(SosError::QuotaExceeded {
                    key: key.to_string(),
                    bytes: value.len(),
                });
            }
        }
        self.db
            .put(key, value)
            .map_err(|e| SosError::StorageError(e.to_string()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db
            .delete(key)
            .map_err(|e| SosError::StorageError(e.to_string()))
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (k, _) = item.map_err(|e| SosError::StorageError(e.to_string()))?;
            keys.push(String::from_utf8_lossy(&k).into_owned());
        }
        Ok(keys)
    }
}

/// Load a JSON document, falling back to `V::default()` on a missing key or
/// an unreadable document.
pub(crate) fn load_or_default<V>(store: &dyn KeyValueStore, key: &str, target: &str) -> V
where
    V: DeserializeOwned + Default,
{
    match store.get_json::<V>(key) {
        Ok(Some(v)) => v,
        Ok(None) => V::default(),
        Err(e) => {
            tracing::error!(target: "storage", key, owner = target, error = %e, "Load error");
            V::default()
        }
    }
}

/// Save a JSON document, logging and swallowing failures.
pub(crate) fn save_or_log<V>(store: &dyn KeyValueStore, key: &str, value: &V, target: &str)
where
    V: Serialize + ?Sized,
{
    if let Err(e) = store.put_json(key, value) {
        tracing::error!(target: "storage", key, owner = target, error = %e, "Save error");
    }
}
