//! Identity cache - stable handles for unchanged records.
//!
//! Values live in the store's slot arena, each slot stamped with a version.
//! A [`RecordHandle`] is `(id, version, value)`; as long as a slot is not
//! rewritten, every lookup returns an equal handle sharing the same `Arc`,
//! so callers can detect "this row actually changed" without comparing
//! contents.

use crate::record::Slot;
use crate::{Record, RecordId, Version};
use std::collections::HashMap;
use std::sync::Arc;

/// Cheap-to-compare handle on one version of a record.
#[derive(Debug)]
pub struct RecordHandle<R> {
    id: RecordId,
    version: Version,
    value: Arc<R>,
}

impl<R> RecordHandle<R> {
    /// Record ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Slot version this handle was taken from.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The record value.
    pub fn value(&self) -> &Arc<R> {
        &self.value
    }
}

impl<R> Clone for RecordHandle<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            version: self.version,
            value: Arc::clone(&self.value),
        }
    }
}

impl<R> PartialEq for RecordHandle<R> {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version && self.id == other.id
    }
}

impl<R> Eq for RecordHandle<R> {}

impl<R> std::ops::Deref for RecordHandle<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.value
    }
}

/// Per-store map from record id to the handle of its current slot version.
#[derive(Debug)]
pub struct IdentityCache<R> {
    handles: HashMap<RecordId, RecordHandle<R>>,
}

impl<R: Record> IdentityCache<R> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
        }
    }

    /// Handle for `slot`, reusing the cached one if the version matches.
    pub fn handle(&mut self, id: &str, slot: &Slot<R>) -> RecordHandle<R> {
        if let Some(handle) = self.handles.get(id) {
            if handle.version == slot.version {
                return handle.clone();
            }
        }
        let handle = RecordHandle {
            id: id.to_string(),
            version: slot.version,
            value: Arc::clone(&slot.value),
        };
        self.handles.insert(id.to_string(), handle.clone());
        handle
    }

    /// Drop handles whose slot was removed or rewritten.
    pub fn prune(&mut self, items: &HashMap<RecordId, Slot<R>>) {
        self.handles.retain(|id, handle| {
            items
                .get(id)
                .is_some_and(|slot| slot.version == handle.version)
        });
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check if no handle is cached.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<R: Record> Default for IdentityCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::Note;

    #[test]
    fn same_version_same_handle() {
        let mut cache = IdentityCache::new();
        let slot = Slot::new(Note::new("a", "x"), 1);

        let first = cache.handle("a", &slot);
        let second = cache.handle("a", &slot);
        assert_eq!(first, second);
        assert!(Arc::ptr_eq(first.value(), second.value()));
    }

    #[test]
    fn rewrite_yields_new_handle() {
        let mut cache = IdentityCache::new();
        let before = cache.handle("a", &Slot::new(Note::new("a", "x"), 1));
        let after = cache.handle("a", &Slot::new(Note::new("a", "x"), 2));

        assert_ne!(before, after);
        assert_eq!(after.title, "x");
    }

    #[test]
    fn prune_drops_stale_entries() {
        let mut cache = IdentityCache::new();
        let slot = Slot::new(Note::new("a", "x"), 1);
        cache.handle("a", &slot);
        cache.handle("b", &Slot::new(Note::new("b", "y"), 2));

        let mut items = HashMap::new();
        items.insert("a".to_string(), slot);
        cache.prune(&items);

        assert_eq!(cache.len(), 1);
    }
}
