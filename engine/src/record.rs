//! Record types for storing data.

use crate::{RecordId, Version};
use std::sync::Arc;

/// An application value under management.
///
/// Identity is by [`Record::id`]; content equality is structural
/// (`PartialEq`). The engine never inspects anything else about the value.
pub trait Record: Clone + PartialEq + Send + Sync + 'static {
    /// The record's unique identifier. An empty id means "not yet assigned".
    fn id(&self) -> &str;

    /// Replace the record's identifier (used for temporary ids and remaps).
    fn set_id(&mut self, id: RecordId);

    /// Copy of this record carrying a different id.
    fn with_id(&self, id: RecordId) -> Self {
        let mut copy = self.clone();
        copy.set_id(id);
        copy
    }
}

/// One entry of the store's record arena.
///
/// Every write produces a new slot with a fresh version, so two slots with
/// the same version always hold the same value object.
#[derive(Debug, PartialEq)]
pub struct Slot<R> {
    /// The current value
    pub value: Arc<R>,
    /// Version assigned when this value was written
    pub version: Version,
}

impl<R> Slot<R> {
    /// Create a slot for a freshly written value.
    pub fn new(value: R, version: Version) -> Self {
        Self {
            value: Arc::new(value),
            version,
        }
    }
}

impl<R> Clone for Slot<R> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            version: self.version,
        }
    }
}
