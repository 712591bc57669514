//! Per-entity access outside explicit transactions.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::async_queue::AsyncBox;
use crate::cursor::Cursor;
use crate::error::{CoreError, CoreResult};
use crate::model::SchemaId;
use crate::options::PutMode;
use crate::query::QueryBuilder;
use crate::store::StoreShared;
use crate::transaction::Transaction;
use crate::types::{RecordKey, TableId};

/// Thread-safe handle for the objects of one entity.
///
/// Every call runs in its own transaction, or joins the transaction the
/// calling thread already has open on the store. A data error (unique
/// violation, unknown ID, type mismatch) leaves a surrounding write
/// transaction as it was and does not make it abort.
#[derive(Clone)]
pub struct EntityBox {
    store: Arc<StoreShared>,
    entity: SchemaId,
}

impl EntityBox {
    pub(crate) fn new(store: Arc<StoreShared>, entity: SchemaId) -> CoreResult<Self> {
        store.check_open()?;
        if store.model.entity(entity).is_none() {
            return Err(CoreError::not_in_schema(format!("entity {entity}")));
        }
        Ok(Self { store, entity })
    }

    /// Entity ID of this box.
    #[must_use]
    pub fn entity_id(&self) -> SchemaId {
        self.entity
    }

    fn read<T>(&self, f: impl FnOnce(&Cursor<'_>) -> CoreResult<T>) -> CoreResult<T> {
        let mut txn = Transaction::begin(&self.store, false)?;
        let result = Cursor::new(&txn, self.entity).and_then(|cursor| f(&cursor));
        txn.close()?;
        result
    }

    fn write<T>(&self, f: impl FnOnce(&mut Cursor<'_>) -> CoreResult<T>) -> CoreResult<T> {
        self.write_with(false, f)
    }

    /// Runs `f` in a write transaction.
    ///
    /// On failure a joined transaction is restored to its state before `f`,
    /// unless `fail_fast` is set, in which case it is made to abort.
    fn write_with<T>(
        &self,
        fail_fast: bool,
        f: impl FnOnce(&mut Cursor<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut txn = Transaction::begin(&self.store, true)?;
        let savepoint = if txn.is_recycled_snapshot() && !fail_fast {
            Some(txn.context()?.writes()?.borrow_mut().savepoint())
        } else {
            None
        };
        let result = Cursor::new(&txn, self.entity).and_then(|mut cursor| f(&mut cursor));
        match result {
            Ok(value) => {
                if let Some(savepoint) = savepoint {
                    txn.context()?.writes()?.borrow_mut().release(savepoint);
                }
                txn.success()?;
                Ok(value)
            }
            Err(err) => {
                match savepoint {
                    Some(savepoint) => {
                        txn.context()?.writes()?.borrow_mut().rollback_to(savepoint);
                        txn.mark_success(true);
                        txn.close()?;
                    }
                    None => {
                        txn.fail_outer();
                        txn.abort()?;
                    }
                }
                Err(err)
            }
        }
    }

    /// Returns whether the object exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed.
    pub fn contains(&self, id: u64) -> CoreResult<bool> {
        self.read(|cursor| cursor.contains(id))
    }

    /// Returns whether all of the objects exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed.
    pub fn contains_many(&self, ids: &[u64]) -> CoreResult<bool> {
        self.read(|cursor| {
            for &id in ids {
                if !cursor.contains(id)? {
                    return Ok(false);
                }
            }
            Ok(true)
        })
    }

    /// Reads an object; `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the data is corrupt.
    pub fn get(&self, id: u64) -> CoreResult<Option<Bytes>> {
        self.read(|cursor| cursor.get(id))
    }

    /// Reads several objects in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the data is corrupt.
    pub fn get_many(&self, ids: &[u64]) -> CoreResult<Vec<Option<Bytes>>> {
        self.read(|cursor| ids.iter().map(|&id| cursor.get(id)).collect())
    }

    /// Reads every object, ordered by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or the data is corrupt.
    pub fn get_all(&self) -> CoreResult<Vec<Bytes>> {
        self.read(|cursor| {
            let mut all = Vec::new();
            for id in cursor.ids()? {
                if let Some(bytes) = cursor.get(id)? {
                    all.push(bytes);
                }
            }
            Ok(all)
        })
    }

    /// Iterates over all objects in ID order.
    ///
    /// The iterator holds a read transaction until it is dropped; stopping
    /// early skips the remaining objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the read transaction cannot begin.
    pub fn iter(&self) -> CoreResult<BoxIter> {
        Ok(BoxIter {
            txn: Transaction::begin(&self.store, false)?,
            entity: self.entity,
            next_from: Some(0),
        })
    }

    /// Calls `visitor` for every object until it returns false.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub fn visit_all(&self, mut visitor: impl FnMut(u64, Bytes) -> bool) -> CoreResult<()> {
        for item in self.iter()? {
            let (id, bytes) = item?;
            if !visitor(id, bytes) {
                break;
            }
        }
        Ok(())
    }

    /// Calls `visitor` for each existing object of `ids` until it returns
    /// false. Missing IDs are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub fn visit_many(
        &self,
        ids: &[u64],
        mut visitor: impl FnMut(u64, Bytes) -> bool,
    ) -> CoreResult<()> {
        self.read(|cursor| {
            for &id in ids {
                if let Some(bytes) = cursor.get(id)? {
                    if !visitor(id, bytes) {
                        break;
                    }
                }
            }
            Ok(())
        })
    }

    /// Reserves the ID a put of `id` will use; 0 reserves a new one.
    ///
    /// # Errors
    ///
    /// See [`Cursor::id_for_put`].
    pub fn id_for_put(&self, id: u64) -> CoreResult<u64> {
        self.write(|cursor| cursor.id_for_put(id))
    }

    /// Reserves `count` consecutive IDs and returns the first.
    ///
    /// Concurrent reservations never overlap.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] for a zero count.
    pub fn ids_for_put(&self, count: u64) -> CoreResult<u64> {
        self.write(|cursor| cursor.ids_for_put(count))
    }

    /// Inserts or replaces an object; 0 assigns a new ID.
    ///
    /// # Errors
    ///
    /// See [`Cursor::put_with_mode`].
    pub fn put(&self, id: u64, data: Vec<u8>) -> CoreResult<u64> {
        self.put_with_mode(id, data, PutMode::Put)
    }

    /// Inserts an object whose ID must be free.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IdAlreadyExists`] if the ID is taken.
    pub fn insert(&self, id: u64, data: Vec<u8>) -> CoreResult<u64> {
        self.put_with_mode(id, data, PutMode::Insert)
    }

    /// Replaces an existing object.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IdNotFound`] if the object does not exist.
    pub fn update(&self, id: u64, data: Vec<u8>) -> CoreResult<()> {
        self.put_with_mode(id, data, PutMode::Update).map(drop)
    }

    /// Stores an object with an explicit mode.
    ///
    /// # Errors
    ///
    /// See [`Cursor::put_with_mode`].
    pub fn put_with_mode(&self, id: u64, data: Vec<u8>, mode: PutMode) -> CoreResult<u64> {
        self.write(|cursor| cursor.put_with_mode(id, data, mode))
    }

    /// Puts an object, taking the ID from its ID field.
    ///
    /// # Errors
    ///
    /// See [`Cursor::put_with_mode`].
    pub fn put_object(&self, data: Vec<u8>) -> CoreResult<u64> {
        self.write(|cursor| cursor.put_object(data))
    }

    /// Puts several objects in one transaction; all or nothing.
    ///
    /// # Errors
    ///
    /// Returns the first failure; none of the objects are stored then.
    pub fn put_many(&self, objects: Vec<(u64, Vec<u8>)>) -> CoreResult<Vec<u64>> {
        self.write(|cursor| {
            objects
                .into_iter()
                .map(|(id, data)| cursor.put(id, data))
                .collect()
        })
    }

    /// Puts several objects with a mode, reporting ID failures per object.
    ///
    /// Objects failing with [`CoreError::IdAlreadyExists`] or
    /// [`CoreError::IdNotFound`] yield `None` and are skipped. With
    /// `fail_on_id_failure` the first such failure is returned instead and
    /// nothing is stored; a surrounding write transaction then aborts too.
    ///
    /// # Errors
    ///
    /// Returns the ID failure under `fail_on_id_failure`, or any other
    /// failure.
    pub fn put_many_with_mode(
        &self,
        objects: Vec<(u64, Vec<u8>)>,
        mode: PutMode,
        fail_on_id_failure: bool,
    ) -> CoreResult<Vec<Option<u64>>> {
        self.write_with(fail_on_id_failure, |cursor| {
            let mut ids = Vec::with_capacity(objects.len());
            for (id, data) in objects {
                match cursor.put_with_mode(id, data, mode) {
                    Ok(id) => ids.push(Some(id)),
                    Err(CoreError::IdAlreadyExists { .. } | CoreError::IdNotFound { .. })
                        if !fail_on_id_failure =>
                    {
                        ids.push(None);
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(ids)
        })
    }

    /// Removes an object; false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or read-only.
    pub fn remove(&self, id: u64) -> CoreResult<bool> {
        self.write(|cursor| cursor.remove(id))
    }

    /// Removes several objects and returns how many existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or read-only.
    pub fn remove_many(&self, ids: &[u64]) -> CoreResult<u64> {
        self.write(|cursor| {
            let mut removed = 0;
            for &id in ids {
                if cursor.remove(id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    /// Removes every object and returns how many there were.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or read-only.
    pub fn remove_all(&self) -> CoreResult<u64> {
        self.write(|cursor| cursor.remove_all())
    }

    /// Removes an object and the standalone relation rows attached to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or read-only.
    pub fn remove_with_relations(&self, id: u64) -> CoreResult<bool> {
        self.write(|cursor| cursor.remove_with_relations(id))
    }

    /// Returns true if the box holds no objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed.
    pub fn is_empty(&self) -> CoreResult<bool> {
        self.read(|cursor| cursor.is_empty())
    }

    /// Number of objects, capped at `limit` unless it is zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed.
    pub fn count(&self, limit: u64) -> CoreResult<u64> {
        self.read(|cursor| cursor.count(limit))
    }

    /// Objects whose to-one relation `property` points at `target`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] if `property` is not a
    /// relation property.
    pub fn get_backlink_ids(&self, property: SchemaId, target: u64) -> CoreResult<Vec<u64>> {
        self.read(|cursor| cursor.backlink_ids(property, target))
    }

    /// Links `source` to `target` in a standalone relation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IdNotFound`] if either object is missing.
    pub fn rel_put(&self, relation: SchemaId, source: u64, target: u64) -> CoreResult<()> {
        self.write(|cursor| cursor.rel_put(relation, source, target))
    }

    /// Unlinks `source` from `target`; false if they were not linked.
    ///
    /// # Errors
    ///
    /// Returns an error for a relation that does not start at this entity.
    pub fn rel_remove(&self, relation: SchemaId, source: u64, target: u64) -> CoreResult<bool> {
        self.write(|cursor| cursor.rel_remove(relation, source, target))
    }

    /// Targets linked from `source`.
    ///
    /// # Errors
    ///
    /// Returns an error for a relation that does not start at this entity.
    pub fn rel_get_ids(&self, relation: SchemaId, source: u64) -> CoreResult<Vec<u64>> {
        self.read(|cursor| cursor.rel_ids(relation, source))
    }

    /// Sources linking to `target`.
    ///
    /// # Errors
    ///
    /// Returns an error for a relation that does not start at this entity.
    pub fn rel_get_backlink_ids(&self, relation: SchemaId, target: u64) -> CoreResult<Vec<u64>> {
        self.read(|cursor| cursor.rel_backlink_ids(relation, target))
    }

    /// Starts a query over this entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed.
    pub fn query(&self) -> CoreResult<QueryBuilder> {
        QueryBuilder::new(Arc::clone(&self.store), self.entity)
    }

    /// Handle for queued background writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or read-only.
    pub fn async_box(&self) -> CoreResult<AsyncBox> {
        self.async_box_with_timeout(self.store.async_options.enqueue_timeout)
    }

    /// Like [`EntityBox::async_box`], waiting up to `timeout` for room in a
    /// full queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or read-only.
    pub fn async_box_with_timeout(&self, timeout: Duration) -> CoreResult<AsyncBox> {
        AsyncBox::new(&self.store, self.entity, timeout)
    }
}

impl std::fmt::Debug for EntityBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityBox")
            .field("entity", &self.entity)
            .finish_non_exhaustive()
    }
}

/// Lazy iterator over the objects of a box.
pub struct BoxIter {
    txn: Transaction,
    entity: SchemaId,
    next_from: Option<u64>,
}

impl BoxIter {
    fn step(&self, from: u64) -> CoreResult<Option<(u64, Bytes)>> {
        let ctx = self.txn.context()?;
        let end = RecordKey::table_end(TableId::Objects(self.entity));
        let Some(key) = ctx.first_key(RecordKey::object(self.entity, from), end)? else {
            return Ok(None);
        };
        let Some(bytes) = ctx.read(&key)? else {
            return Ok(None);
        };
        ctx.store.stats.record_read(bytes.len());
        Ok(Some((key.primary, bytes)))
    }
}

impl Iterator for BoxIter {
    type Item = CoreResult<(u64, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        let from = self.next_from?;
        match self.step(from) {
            Ok(Some((id, bytes))) => {
                self.next_from = id.checked_add(1);
                Some(Ok((id, bytes)))
            }
            Ok(None) => {
                self.next_from = None;
                None
            }
            Err(err) => {
                self.next_from = None;
                Some(Err(err))
            }
        }
    }
}

impl std::fmt::Debug for BoxIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxIter")
            .field("entity", &self.entity)
            .field("next_from", &self.next_from)
            .finish()
    }
}
