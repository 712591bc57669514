//! Background write queue.
//!
//! Each store owns at most one queue, started on first use. Producers
//! enqueue puts and removes through an [`AsyncBox`]; a single worker thread
//! drains the queue into write transactions bounded by operation count and
//! duration. A failing operation is logged and rolled back on its own; the
//! rest of its batch still commits. Failures reach callers only through
//! [`Store::await_async_completion`](crate::Store::await_async_completion)
//! and the store stats.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::entity_box::EntityBox;
use crate::error::{CoreError, CoreResult};
use crate::model::SchemaId;
use crate::object;
use crate::options::{AsyncOptions, DebugFlags, PutMode};
use crate::store::StoreShared;
use crate::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Put(PutMode),
    Remove,
}

#[derive(Debug)]
struct AsyncOp {
    entity: SchemaId,
    id: u64,
    kind: OpKind,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct QueueState {
    ops: VecDeque<AsyncOp>,
    /// Operations ever enqueued.
    submitted: u64,
    /// Operations the worker finished, in enqueue order.
    processed: u64,
    in_flight: usize,
    /// Set by a failed operation or commit; cleared by `await_completion`.
    failed: bool,
    shutting_down: bool,
}

/// Recycled object buffers.
#[derive(Debug)]
struct BufferCache {
    buffers: Vec<Vec<u8>>,
    bytes: usize,
    max_total: usize,
    max_single: usize,
}

impl BufferCache {
    fn new(options: &AsyncOptions) -> Self {
        Self {
            buffers: Vec::new(),
            bytes: 0,
            max_total: options.object_bytes_max_cache_size,
            max_single: options.object_bytes_max_size_to_cache,
        }
    }

    /// A cleared buffer of at least `len` capacity and whether it was reused.
    fn take(&mut self, len: usize) -> (Vec<u8>, bool) {
        match self.buffers.iter().position(|b| b.capacity() >= len) {
            Some(pos) => {
                let buffer = self.buffers.swap_remove(pos);
                self.bytes -= buffer.capacity();
                (buffer, true)
            }
            None => (Vec::with_capacity(len), false),
        }
    }

    fn give(&mut self, mut buffer: Vec<u8>) {
        let capacity = buffer.capacity();
        if capacity == 0 || capacity > self.max_single || self.bytes + capacity > self.max_total {
            return;
        }
        buffer.clear();
        self.bytes += capacity;
        self.buffers.push(buffer);
    }
}

/// Queue state shared by producers and the worker.
pub(crate) struct AsyncQueue {
    state: Mutex<QueueState>,
    work: Condvar,
    room: Condvar,
    done: Condvar,
    cache: Mutex<BufferCache>,
    options: AsyncOptions,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncQueue {
    /// Starts the worker thread for `store`.
    pub(crate) fn start(store: Weak<StoreShared>, options: AsyncOptions) -> CoreResult<Arc<Self>> {
        let queue = Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            work: Condvar::new(),
            room: Condvar::new(),
            done: Condvar::new(),
            cache: Mutex::new(BufferCache::new(&options)),
            options,
            worker: Mutex::new(None),
        });
        let worker = Arc::clone(&queue);
        let handle = std::thread::Builder::new()
            .name("boxdb-async".into())
            .spawn(move || worker.run(&store))?;
        *queue.worker.lock() = Some(handle);
        tracing::debug!("async queue started");
        Ok(queue)
    }

    fn buffer(&self, store: &StoreShared, data: &[u8]) -> Vec<u8> {
        let (mut buffer, hit) = self.cache.lock().take(data.len());
        store.stats.record_cache(hit);
        if hit && store.debug_enabled(DebugFlags::LOG_CACHE_HITS) {
            tracing::debug!(len = data.len(), "async buffer reused");
        }
        buffer.extend_from_slice(data);
        buffer
    }

    fn enqueue(&self, store: &StoreShared, op: AsyncOp, timeout: Duration) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(CoreError::ShuttingDown);
        }
        let throttle_at = self.options.throttle_at_queue_length;
        if throttle_at > 0 && state.ops.len() >= throttle_at {
            let pause = Duration::from_micros(self.options.throttle_micros);
            MutexGuard::unlocked(&mut state, || std::thread::sleep(pause));
        }
        if state.ops.len() >= self.options.max_queue_length {
            let deadline = Instant::now() + timeout;
            while state.ops.len() >= self.options.max_queue_length && !state.shutting_down {
                if self.room.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            if state.shutting_down {
                return Err(CoreError::ShuttingDown);
            }
            if state.ops.len() >= self.options.max_queue_length {
                drop(state);
                self.cache.lock().give(op.data);
                return Err(CoreError::Allocation {
                    message: format!(
                        "async queue is full ({} operations)",
                        self.options.max_queue_length
                    ),
                });
            }
        }
        state.ops.push_back(op);
        state.submitted += 1;
        store.stats.record_async_submitted();
        self.work.notify_one();
        Ok(())
    }

    /// Blocks until the queue is empty and the worker is idle.
    ///
    /// Returns false if shutdown began first or an operation failed since
    /// the previous call.
    pub(crate) fn await_completion(&self) -> bool {
        let mut state = self.state.lock();
        while (!state.ops.is_empty() || state.in_flight > 0) && !state.shutting_down {
            self.done.wait(&mut state);
        }
        let drained = state.ops.is_empty() && state.in_flight == 0;
        let failed = std::mem::take(&mut state.failed);
        drained && !state.shutting_down && !failed
    }

    /// Blocks until every operation enqueued before the call is processed.
    pub(crate) fn await_submitted(&self) -> bool {
        let mut state = self.state.lock();
        let target = state.submitted;
        while state.processed < target && !state.shutting_down {
            self.done.wait(&mut state);
        }
        state.processed >= target
    }

    /// Stops accepting operations, drains what is queued and joins the
    /// worker.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.shutting_down = true;
        }
        self.work.notify_all();
        self.room.notify_all();
        self.done.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("async worker panicked");
            }
        }
    }

    fn run(&self, store: &Weak<StoreShared>) {
        loop {
            {
                let mut state = self.state.lock();
                while state.ops.is_empty() && !state.shutting_down {
                    self.work.wait(&mut state);
                }
                if state.ops.is_empty() {
                    break;
                }
            }
            if !self.options.pre_txn_delay.is_zero() {
                std::thread::sleep(self.options.pre_txn_delay);
            }
            let Some(store) = store.upgrade() else {
                break;
            };
            self.run_batch(&store);
            drop(store);
            if !self.options.post_txn_delay.is_zero() {
                std::thread::sleep(self.options.post_txn_delay);
            }
        }
        let mut state = self.state.lock();
        state.ops.clear();
        self.done.notify_all();
        tracing::debug!("async worker stopped");
    }

    fn next_op(&self, taken: usize) -> Option<AsyncOp> {
        let mut state = self.state.lock();
        let op = state.ops.pop_front()?;
        state.in_flight = taken + 1;
        self.room.notify_one();
        Some(op)
    }

    fn run_batch(&self, store: &Arc<StoreShared>) {
        let started = Instant::now();
        let mut txn = match Transaction::begin(store, true) {
            Ok(txn) => txn,
            Err(err) => {
                let dropped = {
                    let mut state = self.state.lock();
                    let dropped = state.ops.len();
                    state.ops.clear();
                    state.in_flight = dropped;
                    dropped
                };
                self.room.notify_all();
                tracing::error!(error = %err, operations = dropped, "async queue could not begin a transaction");
                self.finish_batch(store, dropped, dropped, true);
                return;
            }
        };
        let max_ops = self.options.max_in_tx_operations.max(1);
        let (mut taken, mut failed) = (0, 0);
        while taken < max_ops && started.elapsed() < self.options.max_in_tx_duration {
            let Some(op) = self.next_op(taken) else {
                break;
            };
            taken += 1;
            if let Err(err) = self.apply(store, &op) {
                failed += 1;
                tracing::warn!(entity = op.entity, id = op.id, error = %err, "async operation dropped");
            }
            self.cache.lock().give(op.data);
        }
        let commit_failed = match txn.success() {
            Ok(()) => false,
            Err(err) => {
                tracing::error!(error = %err, operations = taken, "async batch commit failed");
                true
            }
        };
        if store.debug_enabled(DebugFlags::LOG_ASYNC_QUEUE) {
            tracing::debug!(
                operations = taken,
                failed,
                elapsed_us = started.elapsed().as_micros() as u64,
                "async batch finished"
            );
        }
        let failed = if commit_failed { taken } else { failed };
        self.finish_batch(store, taken, failed, commit_failed);
    }

    fn apply(&self, store: &Arc<StoreShared>, op: &AsyncOp) -> CoreResult<()> {
        let target = EntityBox::new(Arc::clone(store), op.entity)?;
        match op.kind {
            OpKind::Put(mode) => target.put_with_mode(op.id, op.data.clone(), mode).map(drop),
            OpKind::Remove => target.remove(op.id).map(drop),
        }
    }

    fn finish_batch(&self, store: &StoreShared, taken: usize, failed: usize, commit_failed: bool) {
        store.stats.record_async_done(taken - failed, failed);
        let mut state = self.state.lock();
        state.processed += taken as u64;
        state.in_flight = 0;
        if failed > 0 || commit_failed {
            state.failed = true;
        }
        self.done.notify_all();
    }
}

impl std::fmt::Debug for AsyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AsyncQueue")
            .field("queued", &state.ops.len())
            .field("submitted", &state.submitted)
            .field("processed", &state.processed)
            .finish()
    }
}

/// Enqueues writes to one entity for the background worker.
///
/// Objects are copied on enqueue, so callers may reuse their buffers. New
/// IDs are reserved synchronously and returned right away; the object
/// itself becomes visible once its batch commits.
#[derive(Debug, Clone)]
pub struct AsyncBox {
    store: Arc<StoreShared>,
    queue: Arc<AsyncQueue>,
    entity: SchemaId,
    timeout: Duration,
}

impl AsyncBox {
    pub(crate) fn new(store: &Arc<StoreShared>, entity: SchemaId, timeout: Duration) -> CoreResult<Self> {
        store.check_open()?;
        if store.read_only {
            return Err(CoreError::illegal_state("the store is read-only"));
        }
        if store.model.entity(entity).is_none() {
            return Err(CoreError::not_in_schema(format!("entity {entity}")));
        }
        Ok(Self {
            store: Arc::clone(store),
            queue: store.async_queue()?,
            entity,
            timeout,
        })
    }

    /// Entity this box writes.
    #[must_use]
    pub fn entity_id(&self) -> SchemaId {
        self.entity
    }

    fn reserve(&self, id: u64) -> CoreResult<u64> {
        EntityBox::new(Arc::clone(&self.store), self.entity)?.id_for_put(id)
    }

    fn submit(&self, id: u64, kind: OpKind, data: &[u8]) -> CoreResult<()> {
        self.store.check_open()?;
        let data = if data.is_empty() {
            Vec::new()
        } else {
            self.queue.buffer(&self.store, data)
        };
        let op = AsyncOp {
            entity: self.entity,
            id,
            kind,
            data,
        };
        self.queue.enqueue(&self.store, op, self.timeout)
    }

    /// Queues an insert-or-replace; 0 reserves a new ID.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Allocation`] if the queue stays full past the
    /// enqueue timeout, [`CoreError::ShuttingDown`] while the store closes,
    /// or the failure of reserving the ID.
    pub fn put(&self, id: u64, data: &[u8]) -> CoreResult<u64> {
        let id = self.reserve(id)?;
        self.submit(id, OpKind::Put(PutMode::Put), data)?;
        Ok(id)
    }

    /// Queues an insert; the worker drops it if the ID is taken by then.
    ///
    /// # Errors
    ///
    /// See [`AsyncBox::put`].
    pub fn insert(&self, id: u64, data: &[u8]) -> CoreResult<u64> {
        let id = self.reserve(id)?;
        self.submit(id, OpKind::Put(PutMode::Insert), data)?;
        Ok(id)
    }

    /// Queues a replacement of an existing object.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalArgument`] for ID 0, otherwise see
    /// [`AsyncBox::put`].
    pub fn update(&self, id: u64, data: &[u8]) -> CoreResult<()> {
        if id == 0 {
            return Err(CoreError::illegal_argument("update needs an object ID"));
        }
        self.submit(id, OpKind::Put(PutMode::Update), data)
    }

    /// Queues a removal; removing a missing object is not a failure.
    ///
    /// # Errors
    ///
    /// See [`AsyncBox::put`].
    pub fn remove(&self, id: u64) -> CoreResult<()> {
        self.submit(id, OpKind::Remove, &[])
    }

    /// Queues a put that takes the ID from the object's ID field.
    ///
    /// # Errors
    ///
    /// Returns the decoding failure of `data`, otherwise see
    /// [`AsyncBox::put`].
    pub fn put_object(&self, data: &[u8]) -> CoreResult<u64> {
        let entity = self
            .store
            .model
            .entity(self.entity)
            .ok_or_else(|| CoreError::not_in_schema(format!("entity {}", self.entity)))?;
        let record = object::decode(data)?;
        let id = object::stored_id(entity, &record).unwrap_or(0);
        self.put(id, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, ModelBuilder, PropertyFlags, PropertyType};
    use crate::options::StoreOptions;
    use crate::store::Store;
    use boxdb_codec::{ObjectRecord, Value};

    fn model() -> Model {
        ModelBuilder::new()
            .entity("Note", 1, 100)
            .property("id", PropertyType::Long, 1, 101)
            .property_flags(PropertyFlags::ID)
            .property("text", PropertyType::String, 2, 102)
            .build()
            .unwrap()
    }

    fn open(name: &str, options: AsyncOptions) -> Store {
        Store::open(
            StoreOptions::new()
                .directory(format!("memory:{name}"))
                .model(model())
                .async_options(options),
        )
        .unwrap()
    }

    fn note(text: &str) -> Vec<u8> {
        ObjectRecord::new().with(2, text).encode_padded()
    }

    #[test]
    fn queued_puts_become_visible() {
        let store = open("visible", AsyncOptions::new());
        let notes = store.entity_box(1).unwrap();
        let queue = notes.async_box().unwrap();
        let ids: Vec<u64> = ["a", "b", "c"]
            .iter()
            .map(|t| queue.put(0, &note(t)).unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(store.await_async_completion());
        assert_eq!(notes.count(0).unwrap(), 3);

        queue.remove(2).unwrap();
        queue.update(3, &note("z")).unwrap();
        assert!(store.await_async_submitted());
        assert!(!notes.contains(2).unwrap());
        let stored = ObjectRecord::decode(&notes.get(3).unwrap().unwrap()).unwrap();
        assert_eq!(stored.get(2), Some(&Value::from("z")));

        let stats = store.stats();
        assert_eq!(stats.async_submitted, 5);
        assert_eq!(stats.async_completed, 5);
    }

    #[test]
    fn put_object_uses_id_field() {
        let store = open("object", AsyncOptions::new());
        let notes = store.entity_box(1).unwrap();
        let queue = notes.async_box().unwrap();
        let fresh = queue.put_object(&note("new")).unwrap();
        assert_eq!(fresh, 1);
        let explicit = ObjectRecord::new().with(1, Value::from(1_u64)).with(2, "again");
        assert_eq!(queue.put_object(&explicit.encode_padded()).unwrap(), 1);
        assert!(store.await_async_completion());
        assert_eq!(notes.count(0).unwrap(), 1);
    }

    #[test]
    fn failures_surface_once() {
        let store = open("failure", AsyncOptions::new());
        let notes = store.entity_box(1).unwrap();
        let queue = notes.async_box().unwrap();
        queue.update(42, &note("missing")).unwrap();
        queue.put(0, &note("fine")).unwrap();
        assert!(!store.await_async_completion());
        assert!(store.await_async_completion());
        assert_eq!(notes.count(0).unwrap(), 1);
        assert_eq!(store.stats().async_failed, 1);
        assert!(queue.update(0, &note("x")).is_err());
    }

    #[test]
    fn full_queue_rejects() {
        let options = AsyncOptions::new()
            .max_queue_length(1)
            .txn_delays(Duration::from_millis(300), Duration::ZERO);
        let store = open("full", options);
        let queue = store.entity_box(1).unwrap().async_box().unwrap();
        queue.put(0, &note("first")).unwrap();
        let err = queue.put(0, &note("second")).unwrap_err();
        assert!(matches!(err, CoreError::Allocation { .. }));
        assert!(store.await_async_completion());

        let patient = store
            .entity_box(1)
            .unwrap()
            .async_box_with_timeout(Duration::from_secs(5))
            .unwrap();
        patient.put(0, &note("third")).unwrap();
        patient.put(0, &note("fourth")).unwrap();
        assert!(store.await_async_completion());
        assert_eq!(store.entity_box(1).unwrap().count(0).unwrap(), 3);
    }

    #[test]
    fn buffers_are_recycled() {
        let store = open("cache", AsyncOptions::new());
        let queue = store.entity_box(1).unwrap().async_box().unwrap();
        for text in ["one", "two", "six"] {
            queue.put(0, &note(text)).unwrap();
            assert!(store.await_async_completion());
        }
        let stats = store.stats();
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 2);
    }

    #[test]
    fn small_batches_commit_separately() {
        let options = AsyncOptions::new().max_in_tx_operations(2);
        let store = open("batches", options);
        let queue = store.entity_box(1).unwrap().async_box().unwrap();
        let before = store.stats().commits;
        for i in 0..5 {
            queue.put(0, &note(&i.to_string())).unwrap();
        }
        assert!(store.await_async_completion());
        assert!(store.stats().commits >= before + 3);
        assert_eq!(store.entity_box(1).unwrap().count(0).unwrap(), 5);
    }

    #[test]
    fn close_drains_queue() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(StoreOptions::new().directory(dir.path()).model(model())).unwrap();
            let queue = store.entity_box(1).unwrap().async_box().unwrap();
            for i in 0..20 {
                queue.put(0, &note(&format!("n{i}"))).unwrap();
            }
            store.close().unwrap();
            assert!(queue.put(0, &note("late")).is_err());
        }
        let store = Store::open(StoreOptions::new().directory(dir.path()).model(model())).unwrap();
        assert_eq!(store.entity_box(1).unwrap().count(0).unwrap(), 20);
    }

    #[test]
    fn closed_store_has_no_async_box() {
        let store = open("closed", AsyncOptions::new());
        let notes = store.entity_box(1).unwrap();
        store.close().unwrap();
        assert!(notes.async_box().is_err());
        assert!(store.await_async_completion());
    }
}
