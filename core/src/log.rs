//! Bounded record logs.
//!
//! `BoundedLog` keeps records in arrival order and evicts the oldest once the
//! cap is reached. `PersistedLog` binds one to a storage key and degrades
//! gracefully when the store runs out of room: the persisted window is halved
//! and the write retried, while the in-memory log stays complete.

use crate::storage::{JsonStoreExt, KeyValueStore};
use crate::{Result, SosError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Fixed-capacity FIFO log. Oldest entries are dropped first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundedLog<T> {
    cap: usize,
    entries: VecDeque<T>,
}

impl<T> BoundedLog<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append, returning the evicted entry if the cap was hit.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() >= self.cap {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut()
    }

    /// Newest first, at most `limit` entries.
    pub fn recent(&self, limit: usize) -> Vec<&T> {
        self.entries.iter().rev().take(limit).collect()
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn last_mut(&mut self) -> Option<&mut T> {
        self.entries.back_mut()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn retain<F>(&mut self, f: F)
    where
        F: FnMut(&T) -> bool,
    {
        self.entries.retain(f);
    }

    /// Replace the contents, keeping only the newest `cap` entries.
    pub fn replace(&mut self, entries: impl IntoIterator<Item = T>) {
        self.entries.clear();
        for entry in entries {
            self.push(entry);
        }
    }
}

impl<T: Clone> BoundedLog<T> {
    /// The newest `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<T> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }
}

impl<T: Serialize> BoundedLog<T> {
    /// Chronological JSON array of all entries.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.entries)?)
    }
}

impl<T: DeserializeOwned> BoundedLog<T> {
    /// Parse a chronological JSON array into a log with the given cap.
    pub fn from_json(cap: usize, json: &str) -> Result<Self> {
        let entries: Vec<T> = serde_json::from_str(json)?;
        let mut log = Self::new(cap);
        log.replace(entries);
        Ok(log)
    }
}

/// A [`BoundedLog`] mirrored to one storage key.
pub struct PersistedLog<T> {
    key: String,
    log: BoundedLog<T>,
    /// How many of the newest entries get written.
    persist_window: usize,
    store: Arc<dyn KeyValueStore>,
}

impl<T> PersistedLog<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Load from `store`, starting empty when the key is missing or unreadable.
    pub fn load(store: Arc<dyn KeyValueStore>, key: &str, cap: usize) -> Self {
        let mut log = BoundedLog::new(cap);
        match store.get_json::<Vec<T>>(key) {
            Ok(Some(entries)) => log.replace(entries),
            Ok(None) => {}
            Err(e) => error!(target: "storage", key, error = %e, "Failed to load log"),
        }
        Self {
            key: key.to_string(),
            log,
            persist_window: cap,
            store,
        }
    }

    pub fn with_persist_window(mut self, window: usize) -> Self {
        self.persist_window = window;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn log(&self) -> &BoundedLog<T> {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut BoundedLog<T> {
        &mut self.log
    }

    /// Append and persist.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = self.log.push(entry);
        self.save();
        evicted
    }

    pub fn clear(&mut self) {
        self.log.clear();
        self.save();
    }

    /// Write the newest `persist_window` entries.
    ///
    /// On a quota error the window is halved and the write retried until it
    /// fits or nothing is left to write. Any other error is logged and
    /// dropped. Returns how many entries ended up persisted.
    pub fn save(&self) -> usize {
        let mut window = self.persist_window.min(self.log.len());
        loop {
            let slice = self.log.tail(window);
            match self.store.put_json(&self.key, &slice) {
                Ok(()) => {
                    if window < self.log.len().min(self.persist_window) {
                        warn!(
                            target: "storage",
                            key = %self.key,
                            persisted = window,
                            total = self.log.len(),
                            "Persisted a truncated log after quota errors"
                        );
                    }
                    return window;
                }
                Err(SosError::QuotaExceeded { bytes, .. }) if window > 0 => {
                    debug!(target: "storage", key = %self.key, bytes, window, "Quota exceeded, halving");
                    window /= 2;
                }
                Err(e) => {
                    error!(target: "storage", key = %self.key, error = %e, "Save error");
                    return 0;
                }
            }
        }
    }

    pub fn export_json(&self) -> Result<String> {
        self.log.to_json()
    }

    /// Replace the log with a chronological JSON array and persist it.
    pub fn import_json(&mut self, json: &str) -> Result<usize> {
        let entries: Vec<T> = serde_json::from_str(json)?;
        self.log.replace(entries);
        self.save();
        Ok(self.log.len())
    }
}
