//! Change types for expressing pending mutations.
//!
//! Local mutations are recorded as changes, not sent directly. Changes for
//! the same record are coalesced while they wait in the queue so a burst of
//! edits reaches the server as the smallest equivalent sequence.

use crate::{Record, RecordId};
use serde::{Deserialize, Serialize};

/// Kind of mutation a change represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// A pending mutation against one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change<R> {
    /// Record ID this change targets
    pub id: RecordId,
    /// Mutation kind
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// Record data (last known value for deletes)
    pub data: R,
}

impl<R: Record> Change<R> {
    /// Create a create change for a record.
    pub fn create(data: R) -> Self {
        Self::new(ChangeKind::Create, data)
    }

    /// Create an update change carrying the record's new data.
    pub fn update(data: R) -> Self {
        Self::new(ChangeKind::Update, data)
    }

    /// Create a delete change carrying the record's last known data.
    pub fn delete(data: R) -> Self {
        Self::new(ChangeKind::Delete, data)
    }

    fn new(kind: ChangeKind, data: R) -> Self {
        Self {
            id: data.id().to_string(),
            kind,
            data,
        }
    }

    /// Rewrite this change (and its data) to target another id.
    pub fn with_id(&self, id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: self.kind,
            data: self.data.with_id(id.to_string()),
        }
    }

    /// Whether this change creates a record.
    pub fn is_create(&self) -> bool {
        self.kind == ChangeKind::Create
    }
}

/// What to do when a delete follows a pending update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateDeletePolicy {
    /// Send both, update first (default)
    #[default]
    KeepBoth,
    /// Drop the update and send only the delete
    CollapseToDelete,
}

/// Fold `next` into the pending change list of one record.
///
/// The rule looks only at the last pending change:
///
/// | previous | next   | result                           |
/// |----------|--------|----------------------------------|
/// | create   | delete | both removed (never sent)        |
/// | create   | update | one create with the update data  |
/// | update   | update | one update with the latest data  |
/// | update   | delete | per [`UpdateDeletePolicy`]       |
/// | other    | any    | list replaced by `next`          |
pub fn coalesce<R: Record>(
    pending: &mut Vec<Change<R>>,
    next: Change<R>,
    policy: UpdateDeletePolicy,
) {
    let Some(last) = pending.last_mut() else {
        pending.push(next);
        return;
    };

    match (last.kind, next.kind) {
        (ChangeKind::Create, ChangeKind::Delete) => {
            pending.pop();
        }
        (ChangeKind::Create, ChangeKind::Update) => {
            last.data = next.data;
        }
        (ChangeKind::Update, ChangeKind::Update) => {
            *last = next;
        }
        (ChangeKind::Update, ChangeKind::Delete) => match policy {
            UpdateDeletePolicy::KeepBoth => pending.push(next),
            UpdateDeletePolicy::CollapseToDelete => {
                pending.pop();
                pending.push(next);
            }
        },
        _ => {
            pending.clear();
            pending.push(next);
        }
    }
}

/// Coalesce a whole sequence of changes for one record, in order.
pub fn coalesce_all<R: Record>(
    changes: impl IntoIterator<Item = Change<R>>,
    policy: UpdateDeletePolicy,
) -> Vec<Change<R>> {
    let mut pending = Vec::new();
    for change in changes {
        coalesce(&mut pending, change, policy);
    }
    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::Note;
    use proptest::prelude::*;

    fn note(title: &str) -> Note {
        Note::new("n1", title)
    }

    fn kinds(changes: &[Change<Note>]) -> Vec<ChangeKind> {
        changes.iter().map(|c| c.kind).collect()
    }

    #[test]
    fn create_then_delete_cancels() {
        let result = coalesce_all(
            [Change::create(note("a")), Change::delete(note("a"))],
            UpdateDeletePolicy::KeepBoth,
        );
        assert!(result.is_empty());
    }

    #[test]
    fn create_then_update_stays_create() {
        let result = coalesce_all(
            [Change::create(note("a")), Change::update(note("b"))],
            UpdateDeletePolicy::KeepBoth,
        );
        assert_eq!(kinds(&result), vec![ChangeKind::Create]);
        assert_eq!(result[0].data.title, "b");
    }

    #[test]
    fn update_then_update_keeps_latest() {
        let result = coalesce_all(
            [Change::update(note("a")), Change::update(note("b"))],
            UpdateDeletePolicy::KeepBoth,
        );
        assert_eq!(kinds(&result), vec![ChangeKind::Update]);
        assert_eq!(result[0].data.title, "b");
    }

    #[test]
    fn update_then_delete_follows_policy() {
        let ops = || [Change::update(note("a")), Change::delete(note("a"))];

        let kept = coalesce_all(ops(), UpdateDeletePolicy::KeepBoth);
        assert_eq!(kinds(&kept), vec![ChangeKind::Update, ChangeKind::Delete]);

        let collapsed = coalesce_all(ops(), UpdateDeletePolicy::CollapseToDelete);
        assert_eq!(kinds(&collapsed), vec![ChangeKind::Delete]);
    }

    #[test]
    fn delete_then_create_replaces() {
        let result = coalesce_all(
            [
                Change::update(note("a")),
                Change::delete(note("a")),
                Change::create(note("c")),
            ],
            UpdateDeletePolicy::KeepBoth,
        );
        assert_eq!(kinds(&result), vec![ChangeKind::Create]);
        assert_eq!(result[0].data.title, "c");
    }

    #[test]
    fn with_id_rewrites_data() {
        let change = Change::create(Note::new("temp-1", "a")).with_id("srv-1");
        assert_eq!(change.id, "srv-1");
        assert_eq!(change.data.id, "srv-1");
    }

    #[test]
    fn serializes_kind_as_type() {
        let json = serde_json::to_string(&Change::delete(note("a"))).unwrap();
        assert!(json.contains("\"type\":\"delete\""));
    }

    proptest! {
        #[test]
        fn create_updates_delete_never_dispatched(
            titles in proptest::collection::vec("[a-z]{1,6}", 0..8),
            collapse in any::<bool>(),
        ) {
            let policy = if collapse {
                UpdateDeletePolicy::CollapseToDelete
            } else {
                UpdateDeletePolicy::KeepBoth
            };
            let mut ops = vec![Change::create(note("initial"))];
            ops.extend(titles.iter().map(|t| Change::update(note(t))));
            ops.push(Change::delete(note("last")));

            prop_assert!(coalesce_all(ops, policy).is_empty());
        }

        #[test]
        fn updates_collapse_to_last(titles in proptest::collection::vec("[a-z]{1,6}", 1..8)) {
            let ops = titles.iter().map(|t| Change::update(note(t)));
            let result = coalesce_all(ops, UpdateDeletePolicy::KeepBoth);

            prop_assert_eq!(result.len(), 1);
            prop_assert_eq!(&result[0].data.title, titles.last().unwrap());
        }
    }
}
