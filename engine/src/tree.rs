//! Tree layer - hierarchical data on top of a [`Store`].
//!
//! Every tree record id is a materialized path: the parent's id, a
//! separator, then a segment of its own (`"docs.a1b2"` is a child of
//! `"docs"`). Top-level records are children of a virtual root whose id is
//! the empty string. All structure is derived from ids, so the store needs
//! no extra bookkeeping and every tree operation is an ordinary sequence of
//! creates, updates and removes (batched where it spans several records).
//!
//! Ids are expected to survive a round trip to the server. A transport that
//! assigns a new id moving a node under a different parent leaves the
//! node's descendants orphaned. [`Tree`] reports such remaps through
//! [`Tree::misplaced_remaps`] and a warning, but does not repair them.

use crate::queue::{IdRemap, ItemStatus, QueueEvent};
use crate::store::{Context, Store};
use crate::subscription::Subscription;
use crate::{Record, RecordId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default path separator.
pub const DEFAULT_SEPARATOR: &str = ".";

/// Payload type storable in a tree.
pub trait NodeValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> NodeValue for T {}

/// One node of a tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeRecord<V> {
    /// Path-encoded id
    pub id: RecordId,
    /// Sort key among siblings (not necessarily contiguous)
    pub position: i64,
    /// Application payload
    pub value: V,
    /// Application-defined node kind ("folder", "file"...)
    #[serde(rename = "type")]
    pub kind: String,
}

impl<V: NodeValue> Record for TreeRecord<V> {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: RecordId) {
        self.id = id;
    }
}

/// Id of the parent of `id` (`""` for top-level nodes).
pub fn parent_id<'a>(id: &'a str, separator: &str) -> &'a str {
    id.rfind(separator).map_or("", |at| &id[..at])
}

/// Number of ancestors below the virtual root.
pub fn depth(id: &str, separator: &str) -> usize {
    id.matches(separator).count()
}

/// Id of a child of `parent` with the given segment.
pub fn child_id(parent: &str, segment: &str, separator: &str) -> RecordId {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}{separator}{segment}")
    }
}

/// Whether `id` is strictly below `ancestor`.
pub fn is_descendant(id: &str, ancestor: &str, separator: &str) -> bool {
    if ancestor.is_empty() {
        return !id.is_empty();
    }
    id.strip_prefix(ancestor)
        .and_then(|rest| rest.strip_prefix(separator))
        .is_some_and(|rest| !rest.is_empty())
}

/// Whether `id` is exactly one level below `parent`.
pub fn is_child(id: &str, parent: &str, separator: &str) -> bool {
    is_descendant(id, parent, separator) && parent_id(id, separator) == parent
}

fn new_segment() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A store interpreted as a tree.
pub struct Tree<V: NodeValue, C: Context> {
    store: Store<TreeRecord<V>, C>,
    separator: String,
    misplaced: Arc<Mutex<Vec<IdRemap>>>,
    remap_subscription: Option<Subscription>,
}

impl<V: NodeValue, C: Context> Tree<V, C> {
    /// Wrap a store using the default separator.
    pub fn new(store: Store<TreeRecord<V>, C>) -> Self {
        Self::with_separator(store, DEFAULT_SEPARATOR)
    }

    /// Wrap a store using a custom, non-empty separator.
    pub fn with_separator(store: Store<TreeRecord<V>, C>, separator: impl Into<String>) -> Self {
        let mut separator = separator.into();
        if separator.is_empty() {
            tracing::warn!("empty tree separator replaced by default");
            separator = DEFAULT_SEPARATOR.to_string();
        }

        let misplaced = Arc::new(Mutex::new(Vec::new()));
        let remap_subscription = store.queue().subscribe({
            let misplaced = Arc::clone(&misplaced);
            let separator = separator.clone();
            move |event| {
                let QueueEvent::Settled(outcome) = event else {
                    return;
                };
                for remap in &outcome.remaps {
                    if parent_id(&remap.old_id, &separator) != parent_id(&remap.new_id, &separator) {
                        tracing::warn!(
                            old_id = %remap.old_id,
                            new_id = %remap.new_id,
                            "remapped tree node changed parent, descendants orphaned"
                        );
                        misplaced.lock().push(remap.clone());
                    }
                }
            }
        });

        Self {
            store,
            separator,
            misplaced,
            remap_subscription: Some(remap_subscription),
        }
    }

    /// Server id remaps that moved a node to a different parent, oldest
    /// first.
    pub fn misplaced_remaps(&self) -> Vec<IdRemap> {
        self.misplaced.lock().clone()
    }

    /// The underlying store.
    pub fn store(&self) -> &Store<TreeRecord<V>, C> {
        &self.store
    }

    /// The path separator.
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// The virtual root; its children are the top-level records.
    pub fn root(&self) -> TreeNode<'_, V, C> {
        self.node("")
    }

    /// Handle for the node with `id`. The record need not exist.
    pub fn node(&self, id: impl Into<RecordId>) -> TreeNode<'_, V, C> {
        TreeNode {
            tree: self,
            id: id.into(),
        }
    }

    fn children_of(&self, parent: &str) -> Vec<Arc<TreeRecord<V>>> {
        let mut children = self
            .store
            .query()
            .filter(|record| is_child(&record.id, parent, &self.separator));
        children.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        children
    }

    /// Rewrite sibling positions to `0..n-1` in the given order.
    fn renumber(&self, siblings: &[Arc<TreeRecord<V>>]) {
        self.store.batch(|| {
            for (index, sibling) in siblings.iter().enumerate() {
                let position = index as i64;
                if sibling.position != position {
                    self.store.update(&sibling.id, |record| record.position = position);
                }
            }
        });
    }
}

impl<V: NodeValue, C: Context> Drop for Tree<V, C> {
    fn drop(&mut self) {
        if let Some(subscription) = self.remap_subscription.take() {
            subscription.unsubscribe();
        }
    }
}

/// A handle over one tree record id.
pub struct TreeNode<'t, V: NodeValue, C: Context> {
    tree: &'t Tree<V, C>,
    id: RecordId,
}

impl<V: NodeValue, C: Context> Clone for TreeNode<'_, V, C> {
    fn clone(&self) -> Self {
        Self {
            tree: self.tree,
            id: self.id.clone(),
        }
    }
}

impl<V: NodeValue, C: Context> std::fmt::Debug for TreeNode<'_, V, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeNode").field("id", &self.id).finish()
    }
}

impl<'t, V: NodeValue, C: Context> TreeNode<'t, V, C> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this is the virtual root.
    pub fn is_root(&self) -> bool {
        self.id.is_empty()
    }

    /// Current record, if present in the store.
    pub fn record(&self) -> Option<Arc<TreeRecord<V>>> {
        if self.is_root() {
            return None;
        }
        self.tree.store.get(&self.id)
    }

    /// Sync status of this node's record.
    pub fn status(&self) -> Option<ItemStatus> {
        self.tree.store.get_item_status(&self.id)
    }

    /// Parent node; `None` for the virtual root.
    pub fn parent(&self) -> Option<TreeNode<'t, V, C>> {
        if self.is_root() {
            return None;
        }
        Some(self.tree.node(parent_id(&self.id, &self.tree.separator)))
    }

    /// Depth below the virtual root (top-level nodes are at depth 0).
    pub fn depth(&self) -> usize {
        depth(&self.id, &self.tree.separator)
    }

    /// Direct children ordered by position, ties broken by id.
    pub fn children(&self) -> Vec<Arc<TreeRecord<V>>> {
        self.tree.children_of(&self.id)
    }

    /// Children of this node's parent, this node included.
    pub fn siblings(&self) -> Vec<Arc<TreeRecord<V>>> {
        match self.parent() {
            Some(parent) => parent.children(),
            None => Vec::new(),
        }
    }

    /// Index of this node among its siblings.
    pub fn index(&self) -> Option<usize> {
        self.siblings().iter().position(|record| record.id == self.id)
    }

    /// All records below this node, ordered by id (parents first).
    pub fn descendants(&self) -> Vec<Arc<TreeRecord<V>>> {
        let mut descendants = self
            .tree
            .store
            .query()
            .filter(|record| is_descendant(&record.id, &self.id, &self.tree.separator));
        descendants.sort_by(|a, b| a.id.cmp(&b.id));
        descendants
    }

    /// Whether `id` is strictly below this node.
    pub fn is_ancestor_of(&self, id: &str) -> bool {
        is_descendant(id, &self.id, &self.tree.separator)
    }

    /// Add a child after the current last child.
    pub fn append(&self, value: V, kind: impl Into<String>) -> TreeNode<'t, V, C> {
        let position = self.children().iter().map(|c| c.position).max().map_or(0, |p| p + 1);
        self.insert_child(position, value, kind.into())
    }

    /// Add a child before the current first child.
    pub fn prepend(&self, value: V, kind: impl Into<String>) -> TreeNode<'t, V, C> {
        let position = self.children().iter().map(|c| c.position).min().map_or(0, |p| p - 1);
        self.insert_child(position, value, kind.into())
    }

    fn insert_child(&self, position: i64, value: V, kind: String) -> TreeNode<'t, V, C> {
        let id = child_id(&self.id, &new_segment(), &self.tree.separator);
        self.tree.store.create(TreeRecord {
            id: id.clone(),
            position,
            value,
            kind,
        });
        self.tree.node(id)
    }

    /// Swap places with the previous sibling.
    pub fn move_up(&self) {
        self.swap_with(-1);
    }

    /// Swap places with the next sibling.
    pub fn move_down(&self) {
        self.swap_with(1);
    }

    fn swap_with(&self, offset: isize) {
        let siblings = self.siblings();
        let Some(index) = siblings.iter().position(|record| record.id == self.id) else {
            return;
        };
        let Some(other) = index
            .checked_add_signed(offset)
            .filter(|other| *other < siblings.len())
        else {
            return;
        };

        let (this, that) = (&siblings[index], &siblings[other]);
        if this.position == that.position {
            self.set_position(other);
            return;
        }

        let store = &self.tree.store;
        store.batch(|| {
            let (this_position, that_position) = (this.position, that.position);
            store.update(&this.id, |record| record.position = that_position);
            store.update(&that.id, |record| record.position = this_position);
        });
    }

    /// Move to `index` among the siblings and renumber them all to
    /// `0..n-1`. Out-of-range indexes are clamped.
    pub fn set_position(&self, index: usize) {
        let mut siblings = self.siblings();
        let Some(current) = siblings.iter().position(|record| record.id == self.id) else {
            return;
        };
        let target = index.min(siblings.len() - 1);
        if target == current {
            return;
        }

        let node = siblings.remove(current);
        siblings.insert(target, node);
        self.tree.renumber(&siblings);
    }

    /// Move to `position` under `parent` (the current parent when `None`).
    ///
    /// Changing parents clones the subtree under the new parent and removes
    /// the original, so the node comes back with a new id. Moving a node
    /// into itself or one of its descendants does nothing.
    pub fn move_to(&self, position: usize, parent: Option<&str>) -> TreeNode<'t, V, C> {
        if self.record().is_none() {
            return self.clone();
        }
        let separator = &self.tree.separator;
        let current_parent = parent_id(&self.id, separator);
        let target = parent.unwrap_or(current_parent);

        if target == current_parent {
            self.set_position(position);
            return self.clone();
        }
        if target == self.id || self.is_ancestor_of(target) {
            tracing::debug!(id = %self.id, parent = target, "move into own subtree ignored");
            return self.clone();
        }
        if !target.is_empty() && self.tree.store.get(target).is_none() {
            tracing::debug!(id = %self.id, parent = target, "move to unknown parent ignored");
            return self.clone();
        }

        let (new_id, clones) = self.clone_under(target);
        let store = &self.tree.store;
        store.batch(|| {
            for record in clones.into_values() {
                store.create(record);
            }
            let mut children: Vec<_> = self
                .tree
                .children_of(target)
                .into_iter()
                .filter(|record| record.id != new_id)
                .collect();
            if let Some(moved) = store.get(&new_id) {
                children.insert(position.min(children.len()), moved);
            }
            self.tree.renumber(&children);
            self.remove();
        });
        tracing::debug!(from = %self.id, to = %new_id, "subtree reparented");
        self.tree.node(new_id)
    }

    /// Copies of this node and its descendants under a fresh id next to
    /// this node. The store is not touched.
    pub fn clone_subtree(&self) -> BTreeMap<RecordId, TreeRecord<V>> {
        let parent = parent_id(&self.id, &self.tree.separator);
        self.clone_under(parent).1
    }

    /// Copies of this node and its descendants under a fresh child id of
    /// `parent`. The store is not touched.
    pub fn clone_into(&self, parent: &str) -> BTreeMap<RecordId, TreeRecord<V>> {
        self.clone_under(parent).1
    }

    fn clone_under(&self, parent: &str) -> (RecordId, BTreeMap<RecordId, TreeRecord<V>>) {
        let new_root = child_id(parent, &new_segment(), &self.tree.separator);
        let mut clones = BTreeMap::new();
        let Some(root) = self.record() else {
            return (new_root, clones);
        };

        for record in std::iter::once(root).chain(self.descendants()) {
            let suffix = &record.id[self.id.len()..];
            let id = format!("{new_root}{suffix}");
            clones.insert(
                id.clone(),
                TreeRecord {
                    id,
                    position: record.position,
                    value: record.value.clone(),
                    kind: record.kind.clone(),
                },
            );
        }
        (new_root, clones)
    }

    /// Remove this node and its whole subtree, deepest records first.
    pub fn remove(&self) {
        if self.is_root() {
            return;
        }
        let separator = &self.tree.separator;
        let mut ids: Vec<RecordId> = self
            .descendants()
            .iter()
            .map(|record| record.id.clone())
            .collect();
        ids.push(self.id.clone());
        ids.sort_by(|a, b| depth(b, separator).cmp(&depth(a, separator)));

        let store = &self.tree.store;
        store.batch(|| {
            for id in &ids {
                store.remove(id);
            }
        });
    }
}
