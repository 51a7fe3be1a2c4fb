//! Read cache - bounded, TTL-based memo of fetch results.

use crate::config::CacheConfig;
use indexmap::IndexMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Query results keyed by `(collection, query parameters)`.
///
/// Entries expire after `max_age`; when full, the oldest insertion is
/// evicted. A capacity of zero disables the cache.
#[derive(Debug, Clone)]
pub struct ReadCache<V> {
    capacity: usize,
    max_age: Duration,
    entries: IndexMap<String, Entry<V>>,
}

impl<V: Clone> ReadCache<V> {
    /// Create an empty cache.
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            capacity,
            max_age,
            entries: IndexMap::new(),
        }
    }

    /// Create a cache from configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, config.max_age)
    }

    /// Build the key for a collection and serialized query parameters.
    pub fn key(collection: &str, params: &str) -> String {
        format!("{collection}:{params}")
    }

    /// Get a fresh entry. A stale entry is evicted and reported as absent.
    pub fn get(&mut self, key: &str) -> Option<V> {
        if self.capacity == 0 {
            return None;
        }
        let entry = self.entries.get(key)?;
        if entry.stored_at.elapsed() > self.max_age {
            self.entries.shift_remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Store a value, evicting the oldest insertion when over capacity.
    pub fn put(&mut self, key: impl Into<String>, value: V) {
        if self.capacity == 0 {
            return;
        }
        let key = key.into();
        // Re-inserting moves the key to the newest position.
        self.entries.shift_remove(&key);
        self.entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
        }
    }

    /// Drop every entry.
    pub fn invalidate(&mut self) {
        self.entries.clear();
    }

    /// Number of stored entries (fresh or not yet found stale).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
