//! Buffered changes of a write transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::RangeInclusive;

use bytes::Bytes;

use crate::index::IndexKey;
use crate::model::SchemaId;
use crate::types::{RecordKey, TableId};

type UniqueSlot = (SchemaId, SchemaId, IndexKey);

/// Changes of an open write transaction, applied as one commit.
///
/// A key maps to the new bytes, or to `None` once deleted. Only the last
/// change of a key is kept. While a savepoint is open every mutation also
/// logs the state it replaced, so a failed nested write can be undone
/// without copying the whole set.
#[derive(Debug, Default)]
pub struct WriteSet {
    changes: BTreeMap<RecordKey, Option<Bytes>>,
    touched: BTreeSet<SchemaId>,
    unique: HashMap<UniqueSlot, u64>,
    id_sequences: HashMap<SchemaId, u64>,
    undo: Vec<Undo>,
    savepoints: usize,
}

/// Position in the undo log of a [`WriteSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint(usize);

#[derive(Debug)]
enum Undo {
    Change(RecordKey, Option<Option<Bytes>>),
    Touched(SchemaId),
    Unique(UniqueSlot, Option<u64>),
    IdSequence(SchemaId, Option<u64>),
}

impl WriteSet {
    /// Creates an empty write set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a put (`Some`) or delete (`None`) of `key`.
    ///
    /// `owner` is the entity notified when the commit lands.
    pub fn stage(&mut self, key: RecordKey, value: Option<Bytes>, owner: SchemaId) {
        let previous = self.changes.insert(key, value);
        let newly_touched = self.touched.insert(owner);
        if self.savepoints > 0 {
            self.undo.push(Undo::Change(key, previous));
            if newly_touched {
                self.undo.push(Undo::Touched(owner));
            }
        }
    }

    /// Pending change of `key`: `Some(None)` for a buffered delete.
    #[must_use]
    pub fn get(&self, key: &RecordKey) -> Option<&Option<Bytes>> {
        self.changes.get(key)
    }

    /// Pending changes inside `range`.
    pub fn range(
        &self,
        range: RangeInclusive<RecordKey>,
    ) -> impl Iterator<Item = (&RecordKey, &Option<Bytes>)> {
        self.changes.range(range)
    }

    /// IDs of `entity` with a pending change.
    pub fn changed_ids(&self, entity: SchemaId) -> impl Iterator<Item = u64> + '_ {
        let table = TableId::Objects(entity);
        self.changes
            .range(RecordKey::table_start(table)..=RecordKey::table_end(table))
            .map(|(key, _)| key.primary)
    }

    /// Object that claimed a unique value in this transaction.
    #[must_use]
    pub fn unique_owner(&self, entity: SchemaId, property: SchemaId, key: &IndexKey) -> Option<u64> {
        self.unique.get(&(entity, property, key.clone())).copied()
    }

    /// Records that `id` now holds a unique value.
    pub fn claim_unique(&mut self, entity: SchemaId, property: SchemaId, key: IndexKey, id: u64) {
        let slot = (entity, property, key);
        if self.savepoints > 0 {
            let previous = self.unique.insert(slot.clone(), id);
            self.undo.push(Undo::Unique(slot, previous));
        } else {
            self.unique.insert(slot, id);
        }
    }

    /// Forgets a unique value if `id` still holds it.
    pub fn release_unique(&mut self, entity: SchemaId, property: SchemaId, key: IndexKey, id: u64) {
        let slot = (entity, property, key);
        if self.unique.get(&slot) == Some(&id) {
            self.unique.remove(&slot);
            if self.savepoints > 0 {
                self.undo.push(Undo::Unique(slot, Some(id)));
            }
        }
    }

    /// ID sequence value set by this transaction.
    #[must_use]
    pub fn id_sequence(&self, entity: SchemaId) -> Option<u64> {
        self.id_sequences.get(&entity).copied()
    }

    /// Moves the ID sequence of `entity` to `last`.
    pub fn set_id_sequence(&mut self, entity: SchemaId, last: u64) {
        let previous = self.id_sequences.insert(entity, last);
        if self.savepoints > 0 {
            self.undo.push(Undo::IdSequence(entity, previous));
        }
    }

    /// Starts logging undo entries; changes made from here on can be
    /// rolled back with [`WriteSet::rollback_to`].
    pub fn savepoint(&mut self) -> Savepoint {
        self.savepoints += 1;
        Savepoint(self.undo.len())
    }

    /// Keeps the changes made since `savepoint`.
    ///
    /// They stay undoable by savepoints opened before it.
    pub fn release(&mut self, savepoint: Savepoint) {
        debug_assert!(savepoint.0 <= self.undo.len());
        self.savepoints = self.savepoints.saturating_sub(1);
        if self.savepoints == 0 {
            self.undo.clear();
        }
    }

    /// Undoes every change made since `savepoint` and releases it.
    pub fn rollback_to(&mut self, savepoint: Savepoint) {
        while self.undo.len() > savepoint.0 {
            let Some(entry) = self.undo.pop() else {
                break;
            };
            match entry {
                Undo::Change(key, Some(value)) => {
                    self.changes.insert(key, value);
                }
                Undo::Change(key, None) => {
                    self.changes.remove(&key);
                }
                Undo::Touched(entity) => {
                    self.touched.remove(&entity);
                }
                Undo::Unique(slot, Some(id)) => {
                    self.unique.insert(slot, id);
                }
                Undo::Unique(slot, None) => {
                    self.unique.remove(&slot);
                }
                Undo::IdSequence(entity, Some(last)) => {
                    self.id_sequences.insert(entity, last);
                }
                Undo::IdSequence(entity, None) => {
                    self.id_sequences.remove(&entity);
                }
            }
        }
        self.release(savepoint);
    }

    /// Splits into the changes, the touched entities and the ID sequences.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        Vec<(RecordKey, Option<Bytes>)>,
        Vec<SchemaId>,
        HashMap<SchemaId, u64>,
    ) {
        (
            self.changes.into_iter().collect(),
            self.touched.into_iter().collect(),
            self.id_sequences,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_change_wins() {
        let mut ws = WriteSet::new();
        let key = RecordKey::object(1, 5);
        ws.stage(key, Some(Bytes::from_static(b"a")), 1);
        ws.stage(key, None, 1);
        assert_eq!(ws.get(&key), Some(&None));
        assert_eq!(ws.changes.len(), 1);
    }

    #[test]
    fn rollback_restores_state_at_savepoint() {
        let mut ws = WriteSet::new();
        let kept = RecordKey::object(1, 1);
        let email = IndexKey::Text("a@x".into());
        ws.stage(kept, Some(Bytes::from_static(b"v1")), 1);
        ws.claim_unique(1, 5, email.clone(), 1);
        ws.set_id_sequence(1, 1);

        let savepoint = ws.savepoint();
        ws.stage(kept, None, 1);
        ws.release_unique(1, 5, email.clone(), 1);
        ws.stage(RecordKey::object(2, 7), Some(Bytes::new()), 2);
        ws.claim_unique(1, 5, IndexKey::Text("b@x".into()), 2);
        ws.set_id_sequence(1, 2);
        ws.rollback_to(savepoint);

        assert_eq!(ws.get(&kept), Some(&Some(Bytes::from_static(b"v1"))));
        assert_eq!(ws.unique_owner(1, 5, &email), Some(1));
        assert_eq!(ws.unique_owner(1, 5, &IndexKey::Text("b@x".into())), None);
        assert_eq!(ws.id_sequence(1), Some(1));
        assert_eq!(ws.changed_ids(2).count(), 0);
        assert!(ws.undo.is_empty());

        let (changes, touched, _) = ws.into_parts();
        assert_eq!(changes.len(), 1);
        assert_eq!(touched, vec![1]);
    }

    #[test]
    fn released_inner_savepoint_stays_undoable_by_outer() {
        let mut ws = WriteSet::new();
        let outer = ws.savepoint();
        let inner = ws.savepoint();
        ws.stage(RecordKey::object(1, 3), Some(Bytes::new()), 1);
        ws.release(inner);
        assert_eq!(ws.changed_ids(1).collect::<Vec<_>>(), vec![3]);
        ws.rollback_to(outer);
        assert_eq!(ws.changed_ids(1).count(), 0);
    }

    #[test]
    fn nothing_is_logged_without_a_savepoint() {
        let mut ws = WriteSet::new();
        ws.stage(RecordKey::object(1, 1), Some(Bytes::new()), 1);
        ws.set_id_sequence(1, 1);
        assert!(ws.undo.is_empty());
    }

    #[test]
    fn changed_ids_stay_in_entity() {
        let mut ws = WriteSet::new();
        ws.stage(RecordKey::object(1, 2), None, 1);
        ws.stage(RecordKey::object(1, 9), Some(Bytes::new()), 1);
        ws.stage(RecordKey::object(2, 3), Some(Bytes::new()), 2);
        ws.stage(RecordKey::relation(1, 2, 3), Some(Bytes::new()), 1);
        assert_eq!(ws.changed_ids(1).collect::<Vec<_>>(), vec![2, 9]);

        let (changes, touched, _) = ws.into_parts();
        assert_eq!(changes.len(), 4);
        assert_eq!(touched, vec![1, 2]);
    }

    #[test]
    fn unique_claims_are_owned() {
        let mut ws = WriteSet::new();
        let key = IndexKey::Text("a".into());
        ws.claim_unique(1, 2, key.clone(), 7);
        ws.release_unique(1, 2, key.clone(), 8);
        assert_eq!(ws.unique_owner(1, 2, &key), Some(7));
        ws.release_unique(1, 2, key.clone(), 7);
        assert_eq!(ws.unique_owner(1, 2, &key), None);
    }
}
