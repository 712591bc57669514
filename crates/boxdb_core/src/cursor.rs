//! Low-level object access inside a transaction.

use std::cell::RefCell;

use boxdb_codec::{ObjectRecord, Value};
use bytes::Bytes;

use crate::error::{CoreError, CoreResult};
use crate::index::IndexKey;
use crate::model::{Entity, PropertyFlags, PropertyType, Relation, SchemaId};
use crate::object;
use crate::options::PutMode;
use crate::transaction::{Transaction, TxnContext, WriteSet};
use crate::types::{RecordKey, TableId};

/// Reads and writes objects of one entity within a transaction.
///
/// A cursor borrows its transaction, so it cannot outlive it or leave its
/// thread. Bytes returned by reads are reference counted and stay valid
/// after the transaction ends.
///
/// Write operations need a write transaction and fail with
/// [`CoreError::IllegalState`] otherwise. A failing put or remove leaves
/// the transaction unchanged.
pub struct Cursor<'tx> {
    txn: &'tx Transaction,
    entity: &'tx Entity,
    position: Option<u64>,
}

impl<'tx> Cursor<'tx> {
    /// Opens a cursor for `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaObjectNotFound`] for an unknown entity.
    pub fn new(txn: &'tx Transaction, entity: SchemaId) -> CoreResult<Self> {
        let entity = txn
            .store()
            .model
            .entity(entity)
            .ok_or_else(|| CoreError::not_in_schema(format!("entity {entity}")))?;
        Ok(Self {
            txn,
            entity,
            position: None,
        })
    }

    /// Entity this cursor works on.
    #[must_use]
    pub fn entity(&self) -> &'tx Entity {
        self.entity
    }

    fn ctx(&self) -> CoreResult<&'tx TxnContext> {
        self.txn.context()
    }

    fn write_ctx(&self) -> CoreResult<(&'tx TxnContext, &'tx RefCell<WriteSet>)> {
        if !self.txn.is_write() {
            return Err(CoreError::illegal_state(
                "operation requires a write transaction",
            ));
        }
        let ctx = self.ctx()?;
        Ok((ctx, ctx.writes()?))
    }

    fn key(&self, id: u64) -> RecordKey {
        RecordKey::object(self.entity.id, id)
    }

    fn table(&self) -> TableId {
        TableId::Objects(self.entity.id)
    }

    /// Reads an object.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is closed or the data is corrupt.
    pub fn get(&self, id: u64) -> CoreResult<Option<Bytes>> {
        let data = self.ctx()?.read(&self.key(id))?;
        if let Some(bytes) = &data {
            self.txn.store().stats.record_read(bytes.len());
        }
        Ok(data)
    }

    /// Reads and decodes an object.
    pub(crate) fn record(&self, id: u64) -> CoreResult<Option<ObjectRecord>> {
        self.get(id)?
            .map(|bytes| object::decode_stored(&bytes))
            .transpose()
    }

    /// Returns whether an object exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is closed.
    pub fn contains(&self, id: u64) -> CoreResult<bool> {
        self.ctx()?.exists(&self.key(id))
    }

    /// Moves to the object with the lowest ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is closed or the data is corrupt.
    pub fn first(&mut self) -> CoreResult<Option<(u64, Bytes)>> {
        self.position = None;
        self.advance(RecordKey::table_start(self.table()))
    }

    /// Moves to the object after the current one.
    ///
    /// Without a current position this behaves like [`Cursor::first`].
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is closed or the data is corrupt.
    pub fn next(&mut self) -> CoreResult<Option<(u64, Bytes)>> {
        match self.position {
            None => self.first(),
            Some(u64::MAX) => Ok(None),
            Some(id) => self.advance(self.key(id + 1)),
        }
    }

    fn advance(&mut self, from: RecordKey) -> CoreResult<Option<(u64, Bytes)>> {
        let ctx = self.ctx()?;
        let Some(key) = ctx.first_key(from, RecordKey::table_end(self.table()))? else {
            return Ok(None);
        };
        self.position = Some(key.primary);
        Ok(self.get(key.primary)?.map(|bytes| (key.primary, bytes)))
    }

    /// Moves to `id` if the object exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is closed.
    pub fn seek(&mut self, id: u64) -> CoreResult<bool> {
        let found = self.contains(id)?;
        if found {
            self.position = Some(id);
        }
        Ok(found)
    }

    /// The object at the current position.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is closed or the data is corrupt.
    pub fn current(&self) -> CoreResult<Option<(u64, Bytes)>> {
        let Some(id) = self.position else {
            return Ok(None);
        };
        Ok(self.get(id)?.map(|bytes| (id, bytes)))
    }

    /// IDs of all objects, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is closed.
    pub fn ids(&self) -> CoreResult<Vec<u64>> {
        let table = self.table();
        Ok(self
            .ctx()?
            .keys(RecordKey::table_start(table), RecordKey::table_end(table))?
            .into_iter()
            .map(|key| key.primary)
            .collect())
    }

    /// Number of objects, stopping at `limit` unless it is zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is closed.
    pub fn count(&self, limit: u64) -> CoreResult<u64> {
        let count = self.ids()?.len() as u64;
        Ok(if limit == 0 { count } else { count.min(limit) })
    }

    /// Returns true if the entity has no objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is closed.
    pub fn is_empty(&self) -> CoreResult<bool> {
        let table = self.table();
        Ok(self
            .ctx()?
            .first_key(RecordKey::table_start(table), RecordKey::table_end(table))?
            .is_none())
    }

    fn self_assignable(&self) -> bool {
        self.entity
            .id_property()
            .is_some_and(|p| p.flags.contains(PropertyFlags::ID_SELF_ASSIGNABLE))
    }

    /// Checks an explicit ID against the ID sequence.
    ///
    /// Returns the new sequence value if the ID moves it.
    fn check_explicit_id(&self, ctx: &TxnContext, id: u64) -> CoreResult<Option<u64>> {
        let last = ctx.id_sequence(self.entity.id);
        if id <= last {
            return Ok(None);
        }
        if self.self_assignable() {
            return Ok(Some(id));
        }
        Err(CoreError::illegal_argument(format!(
            "ID {id} of {} is above the ID sequence ({last}); use 0 to assign a new ID",
            self.entity.name
        )))
    }

    fn next_id(&self, ctx: &TxnContext) -> CoreResult<u64> {
        ctx.id_sequence(self.entity.id)
            .checked_add(1)
            .ok_or_else(|| CoreError::numeric_overflow("object ID sequence exhausted"))
    }

    /// Returns the ID a put of `id` would use, reserving a new one for 0.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] for an explicit ID above the
    /// ID sequence when the entity does not allow self-assigned IDs.
    pub fn id_for_put(&mut self, id: u64) -> CoreResult<u64> {
        let (ctx, writes) = self.write_ctx()?;
        let (id, sequence) = if id == 0 {
            let id = self.next_id(ctx)?;
            (id, Some(id))
        } else {
            (id, self.check_explicit_id(ctx, id)?)
        };
        if let Some(last) = sequence {
            writes.borrow_mut().set_id_sequence(self.entity.id, last);
        }
        Ok(id)
    }

    /// Reserves `count` consecutive new IDs and returns the first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] for a zero count.
    pub fn ids_for_put(&mut self, count: u64) -> CoreResult<u64> {
        if count == 0 {
            return Err(CoreError::illegal_argument("cannot reserve zero IDs"));
        }
        let (ctx, writes) = self.write_ctx()?;
        let first = self.next_id(ctx)?;
        let last = first
            .checked_add(count - 1)
            .ok_or_else(|| CoreError::numeric_overflow("object ID sequence exhausted"))?;
        writes.borrow_mut().set_id_sequence(self.entity.id, last);
        Ok(first)
    }

    /// Inserts or replaces an object; 0 assigns a new ID.
    ///
    /// # Errors
    ///
    /// See [`Cursor::put_with_mode`].
    pub fn put(&mut self, id: u64, data: Vec<u8>) -> CoreResult<u64> {
        self.put_with_mode(id, data, PutMode::Put)
    }

    /// Puts an object using the ID stored in its ID field (0 if absent).
    ///
    /// # Errors
    ///
    /// See [`Cursor::put_with_mode`].
    pub fn put_object(&mut self, data: Vec<u8>) -> CoreResult<u64> {
        let record = object::decode(&data)?;
        let id = object::stored_id(self.entity, &record).unwrap_or(0);
        self.put_with_mode(id, data, PutMode::Put)
    }

    /// Stores an object and returns its ID.
    ///
    /// `data` is an object record; its ID field is rewritten to the ID
    /// used. Padding follows the store's padding mode.
    ///
    /// # Errors
    ///
    /// - [`CoreError::IdAlreadyExists`] for an insert of an existing ID
    /// - [`CoreError::IdNotFound`] for an update of a missing ID
    /// - [`CoreError::UniqueViolated`] if a unique value is taken
    /// - [`CoreError::PropertyTypeMismatch`] or
    ///   [`CoreError::ConstraintViolated`] for invalid fields
    /// - [`CoreError::IllegalArgument`] for malformed or badly padded data
    pub fn put_with_mode(&mut self, id: u64, data: Vec<u8>, mode: PutMode) -> CoreResult<u64> {
        let (ctx, writes) = self.write_ctx()?;
        let data = object::apply_padding(data, self.txn.store().padding)?;
        let mut record = object::decode(&data)?;
        object::validate(self.entity, &record)?;

        let exists = id != 0 && ctx.exists(&self.key(id))?;
        let (id, sequence) = match mode {
            PutMode::Update if !exists => return Err(CoreError::IdNotFound { id }),
            PutMode::Insert if exists => return Err(CoreError::IdAlreadyExists { id }),
            _ if id == 0 => {
                let id = self.next_id(ctx)?;
                (id, Some(id))
            }
            _ if exists => (id, None),
            _ => (id, self.check_explicit_id(ctx, id)?),
        };

        let bytes = if object::stored_id(self.entity, &record) == Some(id) {
            Bytes::from(data)
        } else {
            object::set_id(self.entity, &mut record, id);
            Bytes::from(record.encode_padded())
        };

        let mut replaced = Vec::new();
        for property in self.entity.unique_properties() {
            let Some(value) = record.get(property.id).filter(|v| !v.is_null()) else {
                continue;
            };
            let Some(other) = self.unique_conflict(ctx, property.id, value, id)? else {
                continue;
            };
            if property.flags.contains(PropertyFlags::UNIQUE_ON_CONFLICT_REPLACE) {
                replaced.push(other);
            } else {
                return Err(CoreError::UniqueViolated {
                    entity: self.entity.id,
                    property: property.id,
                });
            }
        }
        for other in replaced {
            self.remove_inner(ctx, writes, other)?;
        }

        let old = if exists { self.record(id)? } else { None };
        let mut ws = writes.borrow_mut();
        if let Some(old) = &old {
            self.release_unique(&mut ws, old, id);
        }
        for (property, key) in self.unique_keys(&record) {
            ws.claim_unique(self.entity.id, property, key, id);
        }
        if let Some(last) = sequence {
            ws.set_id_sequence(self.entity.id, last);
        }
        self.txn.store().stats.record_put(bytes.len());
        ws.stage(self.key(id), Some(bytes), self.entity.id);
        Ok(id)
    }

    fn unique_keys(&self, record: &ObjectRecord) -> Vec<(SchemaId, IndexKey)> {
        self.entity
            .unique_properties()
            .filter_map(|p| {
                let value = record.get(p.id)?;
                Some((p.id, IndexKey::for_field(p, value)?))
            })
            .collect()
    }

    fn release_unique(&self, ws: &mut WriteSet, record: &ObjectRecord, id: u64) {
        for (property, key) in self.unique_keys(record) {
            ws.release_unique(self.entity.id, property, key, id);
        }
    }

    /// Another object holding `value` in a unique property, if any.
    fn unique_conflict(
        &self,
        ctx: &TxnContext,
        property: SchemaId,
        value: &Value,
        id: u64,
    ) -> CoreResult<Option<u64>> {
        let Some(prop) = self.entity.property(property) else {
            return Ok(None);
        };
        let Some(key) = IndexKey::for_field(prop, value) else {
            return Ok(None);
        };
        let pending = ctx
            .writes()?
            .borrow()
            .unique_owner(self.entity.id, property, &key);
        let committed = self
            .txn
            .store()
            .indexes
            .read()
            .lookup(self.entity.id, property, &key)
            .unwrap_or_default();
        for other in pending.into_iter().chain(committed) {
            if other == id {
                continue;
            }
            let holds = self
                .record(other)?
                .is_some_and(|r| r.get(property) == Some(value));
            if holds {
                return Ok(Some(other));
            }
        }
        Ok(None)
    }

    /// Removes an object. Returns false if it did not exist.
    ///
    /// Standalone relation rows of the object are kept; see
    /// [`Cursor::remove_with_relations`].
    ///
    /// # Errors
    ///
    /// Returns an error without a write transaction.
    pub fn remove(&mut self, id: u64) -> CoreResult<bool> {
        let (ctx, writes) = self.write_ctx()?;
        self.remove_inner(ctx, writes, id)
    }

    fn remove_inner(
        &self,
        _ctx: &TxnContext,
        writes: &RefCell<WriteSet>,
        id: u64,
    ) -> CoreResult<bool> {
        let Some(old) = self.record(id)? else {
            return Ok(false);
        };
        let mut ws = writes.borrow_mut();
        self.release_unique(&mut ws, &old, id);
        ws.stage(self.key(id), None, self.entity.id);
        self.txn.store().stats.record_remove();
        Ok(true)
    }

    /// Removes every object and returns how many there were.
    ///
    /// # Errors
    ///
    /// Returns an error without a write transaction.
    pub fn remove_all(&mut self) -> CoreResult<u64> {
        let (ctx, writes) = self.write_ctx()?;
        let mut removed = 0;
        for id in self.ids()? {
            if self.remove_inner(ctx, writes, id)? {
                removed += 1;
            }
        }
        self.position = None;
        Ok(removed)
    }

    /// Removes an object together with the standalone relation rows that
    /// start or end at it.
    ///
    /// # Errors
    ///
    /// Returns an error without a write transaction.
    pub fn remove_with_relations(&mut self, id: u64) -> CoreResult<bool> {
        let (ctx, writes) = self.write_ctx()?;
        if !self.remove_inner(ctx, writes, id)? {
            return Ok(false);
        }
        let model = &self.txn.store().model;
        for relation in &self.entity.relations {
            for target in self.rel_ids(relation.id, id)? {
                self.stage_relation(writes, relation.id, id, target, false);
            }
        }
        for source_entity in &model.entities {
            for relation in &source_entity.relations {
                if relation.target.id != self.entity.id {
                    continue;
                }
                for source in self.scan_relation(TableId::Backlink(relation.id), id)? {
                    let mut ws = writes.borrow_mut();
                    ws.stage(RecordKey::relation(relation.id, source, id), None, source_entity.id);
                    ws.stage(RecordKey::backlink(relation.id, id, source), None, source_entity.id);
                }
            }
        }
        Ok(true)
    }

    /// Source objects whose to-one relation `property` points at `target`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] if `property` is not a
    /// relation property of this entity.
    pub fn backlink_ids(&self, property: SchemaId, target: u64) -> CoreResult<Vec<u64>> {
        let prop = self
            .entity
            .property(property)
            .ok_or_else(|| CoreError::not_in_schema(format!("property {property}")))?;
        if prop.ptype != PropertyType::Relation {
            return Err(CoreError::illegal_argument(format!(
                "property {}.{} is not a relation",
                self.entity.name, prop.name
            )));
        }
        let ctx = self.ctx()?;
        let key = IndexKey::Int(i64::from_ne_bytes(target.to_ne_bytes()));
        let indexed = self
            .txn
            .store()
            .indexes
            .read()
            .lookup(self.entity.id, property, &key);
        let mut candidates = match indexed {
            Some(ids) => {
                let mut ids = ids;
                if ctx.is_write() {
                    ids.extend(ctx.writes()?.borrow().changed_ids(self.entity.id));
                }
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            None => self.ids()?,
        };
        let wanted = Value::from(target);
        let mut sources = Vec::new();
        for id in candidates.drain(..) {
            if self
                .record(id)?
                .is_some_and(|r| r.get(property) == Some(&wanted))
            {
                sources.push(id);
            }
        }
        Ok(sources)
    }

    fn relation(&self, relation: SchemaId) -> CoreResult<&'tx Relation> {
        let (owner, rel) = self
            .txn
            .store()
            .model
            .relation(relation)
            .ok_or_else(|| CoreError::not_in_schema(format!("relation {relation}")))?;
        if owner.id != self.entity.id {
            return Err(CoreError::illegal_argument(format!(
                "relation {relation} does not start at entity {}",
                self.entity.name
            )));
        }
        Ok(rel)
    }

    fn stage_relation(
        &self,
        writes: &RefCell<WriteSet>,
        relation: SchemaId,
        source: u64,
        target: u64,
        present: bool,
    ) {
        let value = present.then(Bytes::new);
        let mut ws = writes.borrow_mut();
        ws.stage(
            RecordKey::relation(relation, source, target),
            value.clone(),
            self.entity.id,
        );
        ws.stage(RecordKey::backlink(relation, target, source), value, self.entity.id);
    }

    /// Links `source` (of this entity) to `target` in a standalone relation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IdNotFound`] if either object does not exist.
    pub fn rel_put(&mut self, relation: SchemaId, source: u64, target: u64) -> CoreResult<()> {
        let rel = self.relation(relation)?;
        let (ctx, writes) = self.write_ctx()?;
        if !ctx.exists(&self.key(source))? {
            return Err(CoreError::IdNotFound { id: source });
        }
        if !ctx.exists(&RecordKey::object(rel.target.id, target))? {
            return Err(CoreError::IdNotFound { id: target });
        }
        self.stage_relation(writes, relation, source, target, true);
        Ok(())
    }

    /// Unlinks `source` from `target`. Returns false if they were not linked.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown relation or without a write
    /// transaction.
    pub fn rel_remove(&mut self, relation: SchemaId, source: u64, target: u64) -> CoreResult<bool> {
        self.relation(relation)?;
        let (ctx, writes) = self.write_ctx()?;
        if !ctx.exists(&RecordKey::relation(relation, source, target))? {
            return Ok(false);
        }
        self.stage_relation(writes, relation, source, target, false);
        Ok(true)
    }

    /// Targets linked from `source`, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown relation.
    pub fn rel_ids(&self, relation: SchemaId, source: u64) -> CoreResult<Vec<u64>> {
        self.relation(relation)?;
        self.scan_relation(TableId::Relation(relation), source)
    }

    /// Sources linking to `target`, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown relation.
    pub fn rel_backlink_ids(&self, relation: SchemaId, target: u64) -> CoreResult<Vec<u64>> {
        self.relation(relation)?;
        self.scan_relation(TableId::Backlink(relation), target)
    }

    fn scan_relation(&self, table: TableId, primary: u64) -> CoreResult<Vec<u64>> {
        let from = RecordKey {
            table,
            primary,
            secondary: 0,
        };
        let to = RecordKey {
            table,
            primary,
            secondary: u64::MAX,
        };
        Ok(self
            .ctx()?
            .keys(from, to)?
            .into_iter()
            .map(|key| key.secondary)
            .collect())
    }
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("entity", &self.entity.name)
            .field("position", &self.position)
            .finish()
    }
}
