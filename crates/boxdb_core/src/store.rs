//! Store facade, open-time recovery and the commit path.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use boxdb_codec::ObjectRecord;
use boxdb_storage::{InMemoryBackend, StorageBackend};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::async_queue::AsyncQueue;
use crate::change_feed::{ChangeEvent, ChangeFeed};
use crate::dir::StoreDir;
use crate::engine::{Engine, EngineOptions, RecoveryReport};
use crate::entity_box::EntityBox;
use crate::error::{CoreError, CoreResult};
use crate::index::IndexSet;
use crate::manifest::Manifest;
use crate::model::{plan_migration, Entity, MigrationPlan, Model, SchemaId};
use crate::object;
use crate::options::{AsyncOptions, DebugFlags, PaddingMode, StoreOptions};
use crate::stats::{StatsSnapshot, StoreStats};
use crate::transaction::{Transaction, TransactionManager, TxnContext, WriteSet};
use crate::types::{RecordKey, SequenceNumber, TableId};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by a store handle, its boxes, transactions and the async
/// worker.
pub(crate) struct StoreShared {
    pub(crate) id: u64,
    pub(crate) model: Model,
    pub(crate) engine: Engine,
    pub(crate) indexes: RwLock<IndexSet>,
    pub(crate) txns: TransactionManager,
    pub(crate) stats: StoreStats,
    pub(crate) feed: ChangeFeed,
    pub(crate) padding: PaddingMode,
    pub(crate) read_only: bool,
    pub(crate) async_options: AsyncOptions,
    id_sequences: Mutex<HashMap<SchemaId, u64>>,
    debug: AtomicU32,
    max_db_size: u64,
    max_data_size: Option<u64>,
    checkpoint_threshold: u64,
    dir: Option<StoreDir>,
    manifest: Mutex<Manifest>,
    recovery: RecoveryReport,
    closed: AtomicBool,
    async_queue: Mutex<Option<Arc<AsyncQueue>>>,
}

impl StoreShared {
    pub(crate) fn check_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::StoreClosed);
        }
        Ok(())
    }

    pub(crate) fn debug_enabled(&self, flag: DebugFlags) -> bool {
        DebugFlags::from_bits(self.debug.load(Ordering::Relaxed)).contains(flag)
    }

    /// Last committed ID of `entity`.
    pub(crate) fn id_sequence(&self, entity: SchemaId) -> u64 {
        self.id_sequences.lock().get(&entity).copied().unwrap_or(0)
    }

    fn merge_id_sequences(&self, sequences: HashMap<SchemaId, u64>) {
        let mut current = self.id_sequences.lock();
        for (entity, last) in sequences {
            let slot = current.entry(entity).or_insert(0);
            *slot = (*slot).max(last);
        }
    }

    /// Background queue, started on first use.
    pub(crate) fn async_queue(self: &Arc<Self>) -> CoreResult<Arc<AsyncQueue>> {
        self.check_open()?;
        let mut slot = self.async_queue.lock();
        if let Some(queue) = slot.as_ref() {
            return Ok(Arc::clone(queue));
        }
        let queue = AsyncQueue::start(Arc::downgrade(self), self.async_options.clone())?;
        *slot = Some(Arc::clone(&queue));
        Ok(queue)
    }

    fn running_async_queue(&self) -> Option<Arc<AsyncQueue>> {
        self.async_queue.lock().clone()
    }

    /// Applies a write set as commit `snapshot + 1`.
    ///
    /// Runs with the writer lock held.
    pub(crate) fn commit(&self, writes: WriteSet, snapshot: u64) -> CoreResult<u64> {
        self.check_open()?;
        let (changes, touched, sequences) = writes.into_parts();
        if changes.is_empty() {
            self.merge_id_sequences(sequences);
            return Ok(snapshot);
        }

        let size = self.engine.file_bytes()? + Engine::commit_footprint(&changes);
        if size > self.max_db_size {
            return Err(CoreError::DbFull {
                size,
                limit: self.max_db_size,
            });
        }
        if let Some(limit) = self.max_data_size {
            let after = self.engine.data_bytes_after(&changes);
            // commits that shrink the data are always allowed
            if after > limit && after > self.engine.data_bytes() {
                return Err(CoreError::MaxDataSizeExceeded { size: after, limit });
            }
        }

        let updates = self.index_updates(&changes, snapshot)?;
        let seq = snapshot + 1;
        self.engine.commit(SequenceNumber::new(seq), &changes)?;
        if !updates.is_empty() {
            let mut indexes = self.indexes.write();
            for (entity, id, old, new) in &updates {
                indexes.apply(entity, *id, old.as_ref(), new.as_ref(), seq);
            }
        }
        self.merge_id_sequences(sequences);

        let watermark = self.txns.publish(seq);
        self.engine.prune(watermark);
        self.indexes.write().prune(watermark);
        self.stats.record_commit();
        if self.debug_enabled(DebugFlags::LOG_TRANSACTIONS_WRITE) {
            tracing::debug!(seq, changes = changes.len(), "write transaction committed");
        }
        self.feed.emit(&ChangeEvent {
            sequence: seq,
            entity_ids: touched,
        });

        if self.checkpoint_threshold > 0 && self.engine.wal_bytes()? >= self.checkpoint_threshold {
            if let Err(err) = self.checkpoint_locked() {
                tracing::warn!(error = %err, "automatic checkpoint failed");
            }
        }
        Ok(seq)
    }

    /// Old and new records of every changed object with an index.
    #[allow(clippy::type_complexity)]
    fn index_updates<'m>(
        &'m self,
        changes: &[(RecordKey, Option<Bytes>)],
        snapshot: u64,
    ) -> CoreResult<Vec<(&'m Entity, u64, Option<ObjectRecord>, Option<ObjectRecord>)>> {
        let mut updates = Vec::new();
        for (key, bytes) in changes {
            let TableId::Objects(entity_id) = key.table else {
                continue;
            };
            let Some(entity) = self.model.entity(entity_id) else {
                continue;
            };
            if !entity.properties.iter().any(|p| p.flags.is_indexed()) {
                continue;
            }
            let old = self
                .engine
                .read(key, snapshot)?
                .map(|b| object::decode_stored(&b))
                .transpose()?;
            let new = bytes
                .as_ref()
                .map(|b| object::decode_stored(b))
                .transpose()?;
            updates.push((entity, key.primary, old, new));
        }
        Ok(updates)
    }

    /// Moves everything into the data file and empties the WAL.
    ///
    /// The caller holds the writer lock.
    fn checkpoint_locked(&self) -> CoreResult<()> {
        let seq = self.txns.committed();
        self.engine.sync_data()?;
        if let Some(dir) = &self.dir {
            let mut manifest = self.manifest.lock();
            manifest.id_sequences = self
                .id_sequences
                .lock()
                .iter()
                .map(|(&entity, &last)| (entity, last))
                .collect();
            manifest.last_checkpoint = Some(SequenceNumber::new(seq));
            dir.save_manifest(&manifest)?;
        }
        self.engine.clear_wal()?;
        self.stats.record_checkpoint();
        tracing::info!(seq, "checkpoint complete");
        Ok(())
    }

    /// Deletes the data the new model no longer declares.
    fn migrate(self: &Arc<Self>, plan: &MigrationPlan) -> CoreResult<()> {
        if plan.is_noop() {
            return Ok(());
        }
        if self.read_only {
            return Err(CoreError::schema(
                "the model drops stored data, which a read-only store cannot do",
            ));
        }
        let mut txn = Transaction::begin(self, true)?;
        {
            let ctx = txn.context()?;
            let writes = ctx.writes()?;
            for &entity in &plan.removed_entities {
                let table = TableId::Objects(entity);
                for key in ctx.keys(RecordKey::table_start(table), RecordKey::table_end(table))? {
                    writes.borrow_mut().stage(key, None, entity);
                }
            }
            for &relation in &plan.removed_relations {
                for table in [TableId::Relation(relation), TableId::Backlink(relation)] {
                    for key in ctx.keys(RecordKey::table_start(table), RecordKey::table_end(table))? {
                        writes.borrow_mut().stage(key, None, relation);
                    }
                }
            }
            for &(entity, property) in &plan.removed_properties {
                let table = TableId::Objects(entity);
                for key in ctx.keys(RecordKey::table_start(table), RecordKey::table_end(table))? {
                    let Some(bytes) = ctx.read(&key)? else {
                        continue;
                    };
                    let mut record = object::decode_stored(&bytes)?;
                    if record.remove(property).is_some() {
                        let stripped = Bytes::from(record.encode_padded());
                        writes.borrow_mut().stage(key, Some(stripped), entity);
                    }
                }
            }
        }
        txn.success()?;
        tracing::info!(
            removed_entities = plan.removed_entities.len(),
            removed_properties = plan.removed_properties.len(),
            removed_relations = plan.removed_relations.len(),
            "schema migration applied"
        );
        Ok(())
    }

    /// Reads every entity from several threads at once and checks that they
    /// all see the same counts.
    fn run_threading_self_test(self: &Arc<Self>) -> CoreResult<()> {
        const THREADS: usize = 4;
        let count_all = |store: &Arc<Self>| -> CoreResult<Vec<usize>> {
            let txn = Transaction::begin(store, false)?;
            let ctx = txn.context()?;
            let mut counts = Vec::with_capacity(store.model.entities.len());
            for entity in &store.model.entities {
                let table = TableId::Objects(entity.id);
                counts.push(
                    ctx.keys(RecordKey::table_start(table), RecordKey::table_end(table))?
                        .len(),
                );
            }
            Ok(counts)
        };
        let results: Vec<CoreResult<Vec<usize>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| scope.spawn(|| count_all(self)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(CoreError::general("self-test thread panicked")))
                })
                .collect()
        });
        let mut first: Option<Vec<usize>> = None;
        for result in results {
            let counts = result?;
            match &first {
                Some(expected) if *expected != counts => {
                    return Err(CoreError::general(
                        "threading self-test: readers disagree on object counts",
                    ));
                }
                Some(_) => {}
                None => first = Some(counts),
            }
        }
        tracing::info!(threads = THREADS, "threading self-test passed");
        Ok(())
    }
}

impl std::fmt::Debug for StoreShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreShared")
            .field("id", &self.id)
            .field("read_only", &self.read_only)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

/// An open object store.
///
/// `Store` is the entry point: it owns the model, recovers the files at
/// open, and hands out transactions and per-entity [`EntityBox`]es. It is
/// `Send + Sync`; share it by reference or inside an `Arc`.
///
/// ```
/// use boxdb_core::{ModelBuilder, PropertyFlags, PropertyType, Store, StoreOptions};
///
/// let model = ModelBuilder::new()
///     .entity("Note", 1, 1001)
///     .property("id", PropertyType::Long, 1, 1002)
///     .property_flags(PropertyFlags::ID)
///     .property("text", PropertyType::String, 2, 1003)
///     .build()?;
/// let store = Store::open(StoreOptions::new().directory("memory:doc").model(model))?;
/// assert_eq!(store.entity_id("Note"), Some(1));
/// store.close()?;
/// # Ok::<(), boxdb_core::CoreError>(())
/// ```
///
/// Dropping the store closes it. Boxes and queries that outlive it fail
/// with [`CoreError::StoreClosed`].
pub struct Store {
    shared: Arc<StoreShared>,
}

impl Store {
    /// Opens or creates a store.
    ///
    /// Recovery runs first: an incomplete data file tail is cut off and
    /// committed WAL transactions missing from the data file are replayed.
    /// The model is then checked against the persisted schema and data of
    /// removed entities, properties and relations is deleted.
    ///
    /// # Errors
    ///
    /// - [`CoreError::IllegalArgument`] without a model and `read_schema`
    /// - [`CoreError::Schema`] for a model incompatible with the stored one
    /// - [`CoreError::DatabaseLocked`] if another process has the store open
    /// - [`CoreError::FileCorrupt`] / [`CoreError::FilePagesCorrupt`] for
    ///   damaged files
    pub fn open(options: StoreOptions) -> CoreResult<Self> {
        if options.model.is_none() && !options.read_schema {
            return Err(CoreError::illegal_argument(
                "a model is required unless read_schema is set",
            ));
        }
        let max_db_size = options.max_db_size_bytes();
        let max_data_size = options.max_data_size_bytes();
        let memory = options.memory_name().is_some();

        let (dir, manifest, wal_backend, data_backend) = if memory {
            (
                None,
                None,
                Box::new(InMemoryBackend::new()) as Box<dyn StorageBackend>,
                Box::new(InMemoryBackend::new()) as Box<dyn StorageBackend>,
            )
        } else {
            let dir = StoreDir::open(&options.directory, options.read_only, options.file_mode)?;
            let manifest = dir.load_manifest()?;
            let wal = dir.wal_backend()?;
            let data = dir.data_backend()?;
            (Some(dir), manifest, wal, data)
        };

        let stored = manifest.as_ref().and_then(|m| m.model.clone());
        let (model, plan) = match (options.model, stored) {
            (Some(model), Some(stored)) => {
                let plan = plan_migration(&stored, &model)?;
                (model, plan)
            }
            (Some(model), None) => (model, MigrationPlan::default()),
            (None, Some(stored)) => (stored, MigrationPlan::default()),
            (None, None) => {
                return Err(CoreError::schema(
                    "the store has no persisted schema; open it with a model",
                ))
            }
        };

        let (engine, recovery) = Engine::open(
            wal_backend,
            data_backend,
            EngineOptions {
                sync_on_commit: options.sync_on_commit,
                read_only: options.read_only,
                use_previous_commit: options.use_previous_commit,
            },
        )?;

        let mut manifest = manifest.unwrap_or_else(|| Manifest::new(model.clone()));
        manifest.model = Some(model.clone());
        let mut id_sequences: HashMap<SchemaId, u64> =
            manifest.id_sequences.iter().map(|(&e, &id)| (e, id)).collect();
        for (&entity, &max) in &recovery.max_ids {
            let slot = id_sequences.entry(entity).or_insert(0);
            *slot = (*slot).max(max);
        }

        let mut indexes = IndexSet::for_model(&model);
        if !indexes.is_empty() {
            for (key, location) in engine.latest_locations() {
                let TableId::Objects(entity_id) = key.table else {
                    continue;
                };
                let Some(entity) = model.entity(entity_id) else {
                    continue;
                };
                if !entity.properties.iter().any(|p| p.flags.is_indexed()) {
                    continue;
                }
                let record = object::decode_stored(&engine.read_at(location)?)?;
                indexes.apply(entity, key.primary, None, Some(&record), recovery.last_seq);
            }
        }

        let shared = Arc::new(StoreShared {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            txns: TransactionManager::new(recovery.last_seq, options.max_readers),
            model,
            engine,
            indexes: RwLock::new(indexes),
            stats: StoreStats::new(),
            feed: ChangeFeed::new(),
            padding: options.put_padding_mode,
            read_only: options.read_only,
            async_options: options.async_options,
            id_sequences: Mutex::new(id_sequences),
            debug: AtomicU32::new(options.debug_flags.bits()),
            max_db_size,
            max_data_size,
            checkpoint_threshold: options.checkpoint_threshold,
            dir,
            manifest: Mutex::new(manifest),
            recovery,
            closed: AtomicBool::new(false),
            async_queue: Mutex::new(None),
        });

        shared.migrate(&plan)?;
        if !shared.read_only {
            shared.txns.acquire_writer();
            let result = shared.checkpoint_locked();
            shared.txns.release_writer();
            result?;
        }
        if shared.debug_enabled(DebugFlags::RUN_THREADING_SELF_TEST) {
            shared.run_threading_self_test()?;
        }

        tracing::info!(
            directory = %options.directory.display(),
            entities = shared.model.entities.len(),
            last_seq = shared.recovery.last_seq,
            replayed = shared.recovery.replayed_transactions,
            read_only = shared.read_only,
            "store opened"
        );
        Ok(Self { shared })
    }

    pub(crate) fn shared(&self) -> &Arc<StoreShared> {
        &self.shared
    }

    /// Closes the store.
    ///
    /// Pending async operations are drained, a final checkpoint runs and
    /// every later operation fails with [`CoreError::StoreClosed`]. Closing
    /// twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalState`] if this thread still has a
    /// transaction open, or the error of the final checkpoint.
    pub fn close(&self) -> CoreResult<()> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if TxnContext::current(shared).is_some() {
            return Err(CoreError::illegal_state(
                "cannot close the store while this thread has a transaction open",
            ));
        }
        if let Some(queue) = shared.async_queue.lock().take() {
            queue.shutdown();
        }

        shared.txns.acquire_writer();
        let result = if shared.read_only {
            Ok(())
        } else {
            shared.checkpoint_locked()
        };
        shared.closed.store(true, Ordering::Release);
        shared.txns.release_writer();
        tracing::info!(store = shared.id, "store closed");
        result
    }

    /// Returns false once the store is closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    /// The model the store was opened with.
    #[must_use]
    pub fn model(&self) -> &Model {
        &self.shared.model
    }

    /// Directory of an on-disk store.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.shared.dir.as_ref().map(StoreDir::path)
    }

    /// Bytes the store occupies: its files, or its buffers in memory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a file size cannot be read.
    pub fn size_on_disk(&self) -> CoreResult<u64> {
        match &self.shared.dir {
            Some(dir) => dir.size_on_disk(),
            None => self.shared.engine.file_bytes(),
        }
    }

    /// Bytes of live object data.
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.shared.engine.data_bytes()
    }

    /// ID of the entity called `name`.
    #[must_use]
    pub fn entity_id(&self, name: &str) -> Option<SchemaId> {
        self.shared.model.entity_id(name)
    }

    /// ID of property `name` of `entity`.
    #[must_use]
    pub fn property_id(&self, entity: SchemaId, name: &str) -> Option<SchemaId> {
        self.shared.model.property_id(entity, name)
    }

    /// Newest committed sequence.
    #[must_use]
    pub fn committed_sequence(&self) -> u64 {
        self.shared.txns.committed()
    }

    /// What recovery did when the store opened.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.shared.recovery
    }

    /// Returns true if the newest commit was discarded at open.
    #[must_use]
    pub fn opened_with_previous_commit(&self) -> bool {
        self.shared.recovery.discarded_seq.is_some()
    }

    /// Syncs the data file and empties the WAL.
    ///
    /// Waits for a running write transaction to finish.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalState`] on a read-only store or when
    /// this thread has a write transaction open.
    pub fn checkpoint(&self) -> CoreResult<()> {
        let shared = &self.shared;
        shared.check_open()?;
        if shared.read_only {
            return Err(CoreError::illegal_state("cannot checkpoint a read-only store"));
        }
        if TxnContext::current(shared).is_some_and(|ctx| ctx.is_write()) {
            return Err(CoreError::illegal_state(
                "cannot checkpoint while this thread has a write transaction open",
            ));
        }
        shared.txns.acquire_writer();
        let result = shared.checkpoint_locked();
        shared.txns.release_writer();
        result
    }

    /// Current operation counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Replaces the debug flags.
    pub fn set_debug_flags(&self, flags: DebugFlags) {
        self.shared.debug.store(flags.bits(), Ordering::Relaxed);
    }

    /// Current debug flags.
    #[must_use]
    pub fn debug_flags(&self) -> DebugFlags {
        DebugFlags::from_bits(self.shared.debug.load(Ordering::Relaxed))
    }

    /// Begins a read transaction, or joins the one open on this thread.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MaxReadersExceeded`] if every reader slot is
    /// taken.
    pub fn begin_read(&self) -> CoreResult<Transaction> {
        Transaction::begin(&self.shared, false)
    }

    /// Begins a write transaction, or joins the one open on this thread.
    ///
    /// Blocks while another thread holds the write transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalState`] inside a read transaction or on a
    /// read-only store.
    pub fn begin_write(&self) -> CoreResult<Transaction> {
        Transaction::begin(&self.shared, true)
    }

    /// Runs `f` in a read transaction.
    ///
    /// # Errors
    ///
    /// Returns the error of `f` or of beginning the transaction.
    pub fn run_in_read_tx<T>(&self, f: impl FnOnce(&Transaction) -> CoreResult<T>) -> CoreResult<T> {
        let mut txn = self.begin_read()?;
        let result = f(&txn);
        txn.close()?;
        result
    }

    /// Runs `f` in a write transaction that commits if `f` succeeds.
    ///
    /// When `f` fails the transaction is rolled back; inside an outer write
    /// transaction the outer one will abort too.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or the commit failure.
    pub fn run_in_write_tx<T>(
        &self,
        f: impl FnOnce(&Transaction) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut txn = self.begin_write()?;
        match f(&txn) {
            Ok(value) => {
                txn.success()?;
                Ok(value)
            }
            Err(err) => {
                txn.abort()?;
                Err(err)
            }
        }
    }

    /// Box of `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaObjectNotFound`] for an unknown entity.
    pub fn entity_box(&self, entity: SchemaId) -> CoreResult<EntityBox> {
        EntityBox::new(Arc::clone(&self.shared), entity)
    }

    /// Box of the entity called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaObjectNotFound`] for an unknown entity.
    pub fn box_for(&self, name: &str) -> CoreResult<EntityBox> {
        let entity = self
            .entity_id(name)
            .ok_or_else(|| CoreError::not_in_schema(format!("entity {name}")))?;
        self.entity_box(entity)
    }

    /// Receives one event per commit, naming every entity it changed.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        self.shared.feed.subscribe()
    }

    /// Receives an event for each commit that changed `entity`.
    #[must_use]
    pub fn subscribe_entity(&self, entity: SchemaId) -> Receiver<ChangeEvent> {
        self.shared.feed.subscribe_entity(entity)
    }

    /// Blocks until the async queue is empty.
    ///
    /// Returns false if the store started shutting down first, or if a
    /// background operation failed since the last call.
    #[must_use]
    pub fn await_async_completion(&self) -> bool {
        self.shared
            .running_async_queue()
            .map_or(true, |queue| queue.await_completion())
    }

    /// Blocks until every async operation submitted before this call has
    /// been processed.
    ///
    /// Returns false if the store started shutting down first.
    #[must_use]
    pub fn await_async_submitted(&self) -> bool {
        self.shared
            .running_async_queue()
            .map_or(true, |queue| queue.await_submitted())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "closing a dropped store failed");
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("shared", &self.shared).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;
    use crate::model::{ModelBuilder, PropertyFlags, PropertyType};
    use crate::transaction::TransactionState;
    use boxdb_codec::Value;
    use tempfile::tempdir;

    fn model() -> Model {
        ModelBuilder::new()
            .entity("Note", 1, 100)
            .property("id", PropertyType::Long, 1, 101)
            .property_flags(PropertyFlags::ID)
            .property("text", PropertyType::String, 2, 102)
            .property_flags(PropertyFlags::INDEXED)
            .property_index_id(1, 103)
            .build()
            .unwrap()
    }

    fn note(text: &str) -> Vec<u8> {
        ObjectRecord::new().with(2, Value::from(text)).encode_padded()
    }

    fn memory(name: &str) -> Store {
        Store::open(StoreOptions::new().directory(format!("memory:{name}")).model(model())).unwrap()
    }

    fn put(store: &Store, text: &str) -> u64 {
        store
            .run_in_write_tx(|txn| Cursor::new(txn, 1)?.put(0, note(text)))
            .unwrap()
    }

    fn count(store: &Store) -> u64 {
        store.run_in_read_tx(|txn| Cursor::new(txn, 1)?.count(0)).unwrap()
    }

    #[test]
    fn open_requires_model_or_read_schema() {
        let err = Store::open(StoreOptions::new().directory("memory:x")).unwrap_err();
        assert!(matches!(err, CoreError::IllegalArgument { .. }));
        let err = Store::open(StoreOptions::new().directory("memory:x").read_schema(true)).unwrap_err();
        assert!(matches!(err, CoreError::Schema { .. }));
    }

    #[test]
    fn write_commit_and_abort() {
        let store = memory("commit");
        assert_eq!(put(&store, "a"), 1);
        assert_eq!(put(&store, "b"), 2);

        let mut txn = store.begin_write().unwrap();
        Cursor::new(&txn, 1).unwrap().put(0, note("c")).unwrap();
        txn.abort().unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert_eq!(count(&store), 2);
        assert_eq!(store.stats().aborts, 1);
    }

    #[test]
    fn reader_keeps_its_snapshot() {
        let store = Arc::new(memory("iso"));
        put(&store, "a");
        let reader = store.begin_read().unwrap();
        let before = Cursor::new(&reader, 1).unwrap().count(0).unwrap();

        let writer = Arc::clone(&store);
        std::thread::spawn(move || {
            put(&writer, "b");
        })
        .join()
        .unwrap();

        assert_eq!(Cursor::new(&reader, 1).unwrap().count(0).unwrap(), before);
        drop(reader);
        assert_eq!(count(&store), 2);
    }

    #[test]
    fn nested_failure_aborts_outer() {
        let store = memory("nested");
        let mut outer = store.begin_write().unwrap();
        Cursor::new(&outer, 1).unwrap().put(0, note("a")).unwrap();
        {
            let mut inner = store.begin_write().unwrap();
            assert!(inner.is_recycled_snapshot());
            inner.close().unwrap();
        }
        let result = outer.success();
        assert!(matches!(result, Err(CoreError::IllegalState { .. })));
        assert_eq!(outer.state(), TransactionState::Aborted);
        assert_eq!(count(&store), 0);
    }

    #[test]
    fn write_inside_read_is_illegal() {
        let store = memory("rw");
        let _read = store.begin_read().unwrap();
        assert!(matches!(store.begin_write(), Err(CoreError::IllegalState { .. })));
    }

    #[test]
    fn reader_slots_are_bounded() {
        let store = Arc::new(
            Store::open(StoreOptions::new().directory("memory:slots").model(model()).max_readers(1))
                .unwrap(),
        );
        let _held = store.begin_read().unwrap();
        let other = Arc::clone(&store);
        let result = std::thread::spawn(move || other.begin_read().map(drop)).join().unwrap();
        assert!(matches!(result, Err(CoreError::MaxReadersExceeded { max: 1 })));
    }

    #[test]
    fn data_size_limit_rejects_growth() {
        let store = Store::open(
            StoreOptions::new()
                .directory("memory:limit")
                .model(model())
                .max_data_size_kb(1),
        )
        .unwrap();
        let big = "x".repeat(2000);
        let err = store
            .run_in_write_tx(|txn| Cursor::new(txn, 1)?.put(0, note(&big)))
            .unwrap_err();
        assert!(matches!(err, CoreError::MaxDataSizeExceeded { .. }));
        assert_eq!(count(&store), 0);
        assert_eq!(put(&store, "small"), 1);
    }

    #[test]
    fn reopen_keeps_data_and_sequences() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = Store::open(StoreOptions::new().directory(&path).model(model())).unwrap();
            put(&store, "a");
            put(&store, "b");
            store
                .run_in_write_tx(|txn| Cursor::new(txn, 1)?.remove(2))
                .unwrap();
        }
        let store = Store::open(StoreOptions::new().directory(&path).read_schema(true)).unwrap();
        assert_eq!(count(&store), 1);
        assert_eq!(put(&store, "c"), 3);
        assert!(store.size_on_disk().unwrap() > 0);
    }

    #[test]
    fn second_writer_process_is_locked_out() {
        let dir = tempdir().unwrap();
        let _store = Store::open(StoreOptions::new().directory(dir.path()).model(model())).unwrap();
        let err = Store::open(StoreOptions::new().directory(dir.path()).model(model())).unwrap_err();
        assert!(matches!(err, CoreError::DatabaseLocked));
    }

    #[test]
    fn closed_store_rejects_work() {
        let store = memory("closed");
        let entity_box = store.entity_box(1).unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(!store.is_open());
        assert!(matches!(store.begin_read(), Err(CoreError::StoreClosed)));
        assert!(matches!(entity_box.count(0), Err(CoreError::StoreClosed)));
    }

    #[test]
    fn observers_see_commits_only() {
        let store = memory("feed");
        let events = store.subscribe();
        put(&store, "a");
        let mut txn = store.begin_write().unwrap();
        Cursor::new(&txn, 1).unwrap().put(0, note("b")).unwrap();
        txn.abort().unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.entity_ids, vec![1]);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn migration_strips_removed_property() {
        let dir = tempdir().unwrap();
        {
            let store = Store::open(StoreOptions::new().directory(dir.path()).model(model())).unwrap();
            put(&store, "gone");
        }
        let slim = ModelBuilder::new()
            .entity("Note", 1, 100)
            .property("id", PropertyType::Long, 1, 101)
            .property_flags(PropertyFlags::ID)
            .entity_last_property_id(2, 102)
            .last_index_id(1, 103)
            .build()
            .unwrap();
        let store = Store::open(StoreOptions::new().directory(dir.path()).model(slim)).unwrap();
        let data = store
            .run_in_read_tx(|txn| Cursor::new(txn, 1)?.get(1))
            .unwrap()
            .unwrap();
        let record = ObjectRecord::decode(&data).unwrap();
        assert_eq!(record.get(2), None);
        assert_eq!(record.get(1), Some(&Value::Integer(1)));
    }

    #[test]
    fn threading_self_test_runs_at_open() {
        let store = Store::open(
            StoreOptions::new()
                .directory("memory:selftest")
                .model(model())
                .debug_flags(DebugFlags::RUN_THREADING_SELF_TEST),
        )
        .unwrap();
        assert!(store.debug_flags().contains(DebugFlags::RUN_THREADING_SELF_TEST));
        store.set_debug_flags(DebugFlags::NONE);
        assert_eq!(store.debug_flags(), DebugFlags::NONE);
    }
}
