//! Store registry.
//!
//! Keeps named stores alive for callers that look them up by key instead of
//! passing handles around. Owned by the application; nothing is global.

use crate::store::{Context, Store};
use crate::{Error, Record, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Named stores of one record type.
///
/// Thread-safe and can be shared via `Arc`.
pub struct StoreRegistry<R: Record, C: Context> {
    stores: DashMap<String, Store<R, C>>,
}

impl<R: Record, C: Context> Default for StoreRegistry<R, C> {
    fn default() -> Self {
        Self {
            stores: DashMap::new(),
        }
    }
}

impl<R: Record, C: Context> StoreRegistry<R, C> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a store under `key`. Fails if the key is taken.
    pub fn register(&self, key: impl Into<String>, store: Store<R, C>) -> Result<()> {
        let key = key.into();
        match self.stores.entry(key.clone()) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered(key)),
            Entry::Vacant(slot) => {
                slot.insert(store);
                tracing::debug!(key = %key, "store registered");
                Ok(())
            }
        }
    }

    /// Look up a store.
    pub fn get(&self, key: &str) -> Option<Store<R, C>> {
        self.stores.get(key).map(|entry| entry.value().clone())
    }

    /// Remove a store and destroy it.
    pub fn unregister(&self, key: &str) -> Result<()> {
        let (_, store) = self
            .stores
            .remove(key)
            .ok_or_else(|| Error::StoreNotFound(key.to_string()))?;
        store.destroy();
        tracing::debug!(key, "store unregistered");
        Ok(())
    }

    /// Destroy and remove every store.
    pub fn destroy_all(&self) {
        let keys: Vec<String> = self.stores.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, store)) = self.stores.remove(&key) {
                store.destroy();
            }
        }
        tracing::info!("all stores destroyed");
    }

    /// Number of registered stores.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Check if no store is registered.
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::Note;
    use crate::{CancelToken, Change, FetchResponse, FetchTransport, StoreConfig, SyncResult, SyncTransport};
    use async_trait::async_trait;

    struct Offline;

    #[async_trait]
    impl FetchTransport<Note, ()> for Offline {
        async fn fetch(&self, _context: &(), _cancel: CancelToken) -> Result<FetchResponse<Note>> {
            Err(Error::Transport("offline".into()))
        }
    }

    #[async_trait]
    impl SyncTransport<Note> for Offline {
        async fn sync(&self, _changes: Vec<Change<Note>>, _cancel: CancelToken) -> Result<Vec<SyncResult>> {
            Err(Error::Transport("offline".into()))
        }
    }

    fn store(name: &str) -> Store<Note, ()> {
        let transport = Arc::new(Offline);
        Store::new(StoreConfig::new(name), (), transport.clone(), transport)
    }

    #[test]
    fn register_and_get() {
        let registry = StoreRegistry::new();
        registry.register("notes", store("notes")).unwrap();

        assert_eq!(registry.len(), 1);
        let found = registry.get("notes").unwrap();
        assert_eq!(found.config().collection, "notes");
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let registry = StoreRegistry::new();
        registry.register("notes", store("notes")).unwrap();

        let err = registry.register("notes", store("notes")).unwrap_err();
        assert_eq!(err, Error::AlreadyRegistered("notes".into()));
    }

    #[test]
    fn unregister_destroys_store() {
        let registry = StoreRegistry::new();
        let notes = store("notes");
        registry.register("notes", notes.clone()).unwrap();

        registry.unregister("notes").unwrap();
        assert!(notes.queue().is_destroyed());
        assert!(registry.is_empty());

        let err = registry.unregister("notes").unwrap_err();
        assert_eq!(err, Error::StoreNotFound("notes".into()));
    }

    #[test]
    fn destroy_all_empties_registry() {
        let registry = StoreRegistry::new();
        let a = store("a");
        registry.register("a", a.clone()).unwrap();
        registry.register("b", store("b")).unwrap();

        registry.destroy_all();
        assert!(registry.is_empty());
        assert!(a.queue().is_destroyed());
    }
}
