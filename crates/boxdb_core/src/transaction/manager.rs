//! Transaction manager.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A reader slot held by a top-level read transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderSlot {
    /// Slot number.
    pub index: usize,
    /// Commit sequence the reader observes.
    pub snapshot: u64,
}

/// Hands out snapshots, reader slots and the writer lock.
///
/// ## Concurrency
///
/// - any number of readers up to `max_readers`, each pinned to the commit
///   that was newest when it started
/// - one writer at a time; later writers block until it finishes
/// - readers never wait for the writer
///
/// The oldest pinned snapshot is the watermark: versions that no snapshot
/// at or above it can see may be dropped.
pub struct TransactionManager {
    committed_seq: AtomicU64,
    slots: Mutex<Vec<Option<u64>>>,
    writer: Mutex<bool>,
    writer_released: Condvar,
}

impl TransactionManager {
    /// Creates a manager whose newest commit is `committed_seq`.
    #[must_use]
    pub fn new(committed_seq: u64, max_readers: u32) -> Self {
        Self {
            committed_seq: AtomicU64::new(committed_seq),
            slots: Mutex::new(vec![None; max_readers.max(1) as usize]),
            writer: Mutex::new(false),
            writer_released: Condvar::new(),
        }
    }

    /// Newest committed sequence.
    #[must_use]
    pub fn committed(&self) -> u64 {
        self.committed_seq.load(Ordering::Acquire)
    }

    /// Pins the newest commit in a free reader slot.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MaxReadersExceeded`] if every slot is taken.
    pub fn acquire_reader(&self) -> CoreResult<ReaderSlot> {
        let mut slots = self.slots.lock();
        // read under the slot lock so `publish` cannot compute a watermark
        // above a snapshot that is about to be registered
        let snapshot = self.committed();
        let Some(index) = slots.iter().position(Option::is_none) else {
            return Err(CoreError::MaxReadersExceeded {
                max: u32::try_from(slots.len()).unwrap_or(u32::MAX),
            });
        };
        slots[index] = Some(snapshot);
        Ok(ReaderSlot { index, snapshot })
    }

    /// Frees a reader slot.
    pub fn release_reader(&self, slot: ReaderSlot) {
        if let Some(entry) = self.slots.lock().get_mut(slot.index) {
            *entry = None;
        }
    }

    /// Number of reader slots in use.
    #[must_use]
    pub fn active_readers(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Blocks until the writer lock is free, then takes it.
    ///
    /// Returns the snapshot the writer builds on.
    pub fn acquire_writer(&self) -> u64 {
        let mut busy = self.writer.lock();
        while *busy {
            self.writer_released.wait(&mut busy);
        }
        *busy = true;
        self.committed()
    }

    /// Takes the writer lock if it frees up within `timeout`.
    pub fn try_acquire_writer(&self, timeout: Duration) -> Option<u64> {
        let mut busy = self.writer.lock();
        if *busy {
            let _ = self
                .writer_released
                .wait_while_for(&mut busy, |busy| *busy, timeout);
        }
        if *busy {
            return None;
        }
        *busy = true;
        Some(self.committed())
    }

    /// Gives the writer lock back.
    pub fn release_writer(&self) {
        *self.writer.lock() = false;
        self.writer_released.notify_one();
    }

    /// Returns true while a write transaction is open.
    #[must_use]
    pub fn writer_active(&self) -> bool {
        *self.writer.lock()
    }

    /// Makes commit `seq` the newest and returns the new watermark.
    pub fn publish(&self, seq: u64) -> u64 {
        self.committed_seq.store(seq, Ordering::Release);
        self.watermark()
    }

    /// Oldest snapshot still pinned, or the newest commit if none is.
    #[must_use]
    pub fn watermark(&self) -> u64 {
        let slots = self.slots.lock();
        let committed = self.committed();
        slots.iter().flatten().copied().min().unwrap_or(committed).min(committed)
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("committed_seq", &self.committed())
            .field("active_readers", &self.active_readers())
            .finish_non_exhaustive()
    }
}
