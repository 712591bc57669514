//! Per-thread transaction context.
//!
//! A top-level transaction owns a [`TxnContext`]: its snapshot, its reader
//! slot or the writer lock, and for writers the buffered [`WriteSet`].
//! Transactions begun on the same thread while one is open join its
//! context instead of taking a new snapshot. The context is reference
//! counted with `Rc`, which keeps every transaction on its thread.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{CoreError, CoreResult};
use crate::options::DebugFlags;
use crate::store::StoreShared;
use crate::transaction::manager::ReaderSlot;
use crate::transaction::write_set::WriteSet;
use crate::types::RecordKey;

thread_local! {
    static OPEN: RefCell<HashMap<u64, Weak<TxnContext>>> = RefCell::new(HashMap::new());
}

enum Lease {
    Reader(ReaderSlot),
    Writer,
}

/// State shared by a top-level transaction and the ones nested in it.
pub(crate) struct TxnContext {
    pub(crate) store: Arc<StoreShared>,
    snapshot: u64,
    lease: Lease,
    writes: Option<RefCell<WriteSet>>,
    failed: Cell<bool>,
    finished: Cell<bool>,
}

impl TxnContext {
    /// Returns the open context of `store` on this thread.
    pub(crate) fn current(store: &Arc<StoreShared>) -> Option<Rc<Self>> {
        OPEN.with(|open| {
            open.borrow()
                .get(&store.id)
                .and_then(Weak::upgrade)
                .filter(|ctx| !ctx.finished.get())
        })
    }

    /// Starts a top-level transaction and registers it for this thread.
    pub(crate) fn begin(store: &Arc<StoreShared>, write: bool) -> CoreResult<Rc<Self>> {
        store.check_open()?;
        let (snapshot, lease, writes) = if write {
            if store.read_only {
                return Err(CoreError::illegal_state(
                    "cannot begin a write transaction on a read-only store",
                ));
            }
            let snapshot = store.txns.acquire_writer();
            (snapshot, Lease::Writer, Some(RefCell::new(WriteSet::new())))
        } else {
            let slot = store.txns.acquire_reader()?;
            store.stats.record_read_transaction();
            (slot.snapshot, Lease::Reader(slot), None)
        };
        if store.debug_enabled(if write {
            DebugFlags::LOG_TRANSACTIONS_WRITE
        } else {
            DebugFlags::LOG_TRANSACTIONS_READ
        }) {
            tracing::debug!(write, snapshot, "transaction begin");
        }
        let ctx = Rc::new(Self {
            store: Arc::clone(store),
            snapshot,
            lease,
            writes,
            failed: Cell::new(false),
            finished: Cell::new(false),
        });
        OPEN.with(|open| {
            open.borrow_mut().insert(store.id, Rc::downgrade(&ctx));
        });
        Ok(ctx)
    }

    /// Commit sequence this transaction reads.
    pub(crate) fn snapshot(&self) -> u64 {
        self.snapshot
    }

    pub(crate) fn is_write(&self) -> bool {
        self.writes.is_some()
    }

    /// Makes the outermost transaction abort when it closes.
    pub(crate) fn mark_failed(&self) {
        self.failed.set(true);
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed.get()
    }

    pub(crate) fn ensure_usable(&self) -> CoreResult<()> {
        if self.finished.get() {
            return Err(CoreError::illegal_state("transaction is already closed"));
        }
        self.store.check_open()
    }

    /// Write set of a write transaction.
    pub(crate) fn writes(&self) -> CoreResult<&RefCell<WriteSet>> {
        self.ensure_usable()?;
        self.writes
            .as_ref()
            .ok_or_else(|| CoreError::illegal_state("operation requires a write transaction"))
    }

    /// Reads a record as this transaction sees it.
    pub(crate) fn read(&self, key: &RecordKey) -> CoreResult<Option<Bytes>> {
        self.ensure_usable()?;
        if let Some(writes) = &self.writes {
            if let Some(pending) = writes.borrow().get(key) {
                return Ok(pending.clone());
            }
        }
        self.store.engine.read(key, self.snapshot)
    }

    /// Returns whether a record is visible to this transaction.
    pub(crate) fn exists(&self, key: &RecordKey) -> CoreResult<bool> {
        self.ensure_usable()?;
        if let Some(writes) = &self.writes {
            if let Some(pending) = writes.borrow().get(key) {
                return Ok(pending.is_some());
            }
        }
        Ok(self.store.engine.exists(key, self.snapshot))
    }

    /// First visible key in `from..=to`.
    pub(crate) fn first_key(&self, from: RecordKey, to: RecordKey) -> CoreResult<Option<RecordKey>> {
        self.ensure_usable()?;
        let engine = &self.store.engine;
        let Some(writes) = &self.writes else {
            return Ok(engine.first_key(from, to, self.snapshot));
        };
        let writes = writes.borrow();
        let mut from = from;
        loop {
            if from > to {
                return Ok(None);
            }
            let committed = engine.first_key(from, to, self.snapshot);
            let pending = writes.range(from..=to).next();
            match (committed, pending) {
                (committed, None) => return Ok(committed),
                (Some(committed), Some((key, _))) if committed < *key => return Ok(Some(committed)),
                (_, Some((key, Some(_)))) => return Ok(Some(*key)),
                (_, Some((key, None))) => match successor(*key) {
                    Some(next) => from = next,
                    None => return Ok(None),
                },
            }
        }
    }

    /// All visible keys in `from..=to`, ascending.
    pub(crate) fn keys(&self, from: RecordKey, to: RecordKey) -> CoreResult<Vec<RecordKey>> {
        self.ensure_usable()?;
        if from > to {
            return Ok(Vec::new());
        }
        let committed = self.store.engine.keys(from, to, self.snapshot);
        let Some(writes) = &self.writes else {
            return Ok(committed);
        };
        let writes = writes.borrow();
        if writes.range(from..=to).next().is_none() {
            return Ok(committed);
        }
        let mut keys: BTreeSet<RecordKey> = committed.into_iter().collect();
        for (key, value) in writes.range(from..=to) {
            if value.is_some() {
                keys.insert(*key);
            } else {
                keys.remove(key);
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Last ID handed out for `entity`.
    pub(crate) fn id_sequence(&self, entity: u32) -> u64 {
        self.writes
            .as_ref()
            .and_then(|w| w.borrow().id_sequence(entity))
            .unwrap_or_else(|| self.store.id_sequence(entity))
    }

    /// Ends the transaction, committing the write set if `commit` is set.
    ///
    /// Returns the commit sequence when something was committed.
    pub(crate) fn finish(&self, commit: bool) -> CoreResult<Option<u64>> {
        if self.finished.replace(true) {
            return Ok(None);
        }
        // the registry is gone when this runs during thread exit
        let _ = OPEN.try_with(|open| {
            let mut open = open.borrow_mut();
            let ours = open
                .get(&self.store.id)
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), self));
            if ours {
                open.remove(&self.store.id);
            }
        });

        let result = match (&self.lease, &self.writes) {
            (Lease::Writer, Some(writes)) => {
                let writes = writes.take();
                let result = if commit && !self.failed.get() {
                    self.store.commit(writes, self.snapshot).map(Some)
                } else {
                    self.store.stats.record_abort();
                    if self.store.debug_enabled(DebugFlags::LOG_TRANSACTIONS_WRITE) {
                        tracing::debug!(snapshot = self.snapshot, "write transaction aborted");
                    }
                    Ok(None)
                };
                self.store.txns.release_writer();
                result
            }
            _ => Ok(None),
        };
        if let Lease::Reader(slot) = self.lease {
            self.store.txns.release_reader(slot);
        }
        result
    }
}

impl Drop for TxnContext {
    fn drop(&mut self) {
        if !self.finished.get() {
            if let Err(err) = self.finish(false) {
                tracing::warn!(error = %err, "failed to release transaction");
            }
        }
    }
}

/// Next possible key after `key`.
pub(crate) fn successor(key: RecordKey) -> Option<RecordKey> {
    if key.secondary < u64::MAX {
        return Some(RecordKey {
            secondary: key.secondary + 1,
            ..key
        });
    }
    (key.primary < u64::MAX).then(|| RecordKey {
        primary: key.primary + 1,
        secondary: 0,
        ..key
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_carries_into_primary() {
        let key = RecordKey::relation(1, 4, u64::MAX);
        assert_eq!(successor(key), Some(RecordKey::relation(1, 5, 0)));
        assert_eq!(successor(RecordKey::object(1, 3)), Some(RecordKey {
            secondary: 1,
            ..RecordKey::object(1, 3)
        }));
        assert_eq!(successor(RecordKey::relation(1, u64::MAX, u64::MAX)), None);
    }
}
