//! Transaction handles.

use std::rc::Rc;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::store::StoreShared;
use crate::transaction::context::TxnContext;

/// Lifecycle of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Allocated, not yet holding a snapshot.
    Created,
    /// Open; reads and (for writers) writes are allowed.
    Active,
    /// A write transaction that closed successfully.
    Committed,
    /// A write transaction that was rolled back.
    Aborted,
    /// A read transaction that released its snapshot.
    Closed,
}

/// A read or write transaction on a store.
///
/// A transaction begun while another one is open on the same thread joins
/// it: it reads the same snapshot and buffers into the same write set, and
/// only the outermost transaction commits. If any nested write transaction
/// closes without success, the outermost one aborts.
///
/// Dropping an open transaction closes it; an unsuccessful write is rolled
/// back. Transactions are bound to the thread that began them.
pub struct Transaction {
    ctx: Rc<TxnContext>,
    write: bool,
    top_level: bool,
    state: TransactionState,
    success: bool,
}

impl Transaction {
    pub(crate) fn begin(store: &Arc<StoreShared>, write: bool) -> CoreResult<Self> {
        let mut txn = match TxnContext::current(store) {
            Some(ctx) => {
                if write && !ctx.is_write() {
                    return Err(CoreError::illegal_state(
                        "cannot begin a write transaction inside a read transaction",
                    ));
                }
                Self::with_context(ctx, write, false)
            }
            None => Self::with_context(TxnContext::begin(store, write)?, write, true),
        };
        txn.state = TransactionState::Active;
        Ok(txn)
    }

    fn with_context(ctx: Rc<TxnContext>, write: bool, top_level: bool) -> Self {
        Self {
            ctx,
            write,
            top_level,
            state: TransactionState::Created,
            success: false,
        }
    }

    pub(crate) fn context(&self) -> CoreResult<&TxnContext> {
        if self.state != TransactionState::Active {
            return Err(CoreError::illegal_state(format!(
                "transaction is {:?}",
                self.state
            )));
        }
        self.ctx.ensure_usable()?;
        Ok(&self.ctx)
    }

    pub(crate) fn store(&self) -> &Arc<StoreShared> {
        &self.ctx.store
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Returns true for write transactions.
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Returns true if this transaction joined one already open on this
    /// thread instead of taking its own snapshot.
    #[must_use]
    pub fn is_recycled_snapshot(&self) -> bool {
        !self.top_level
    }

    /// Commit sequence this transaction reads.
    #[must_use]
    pub fn snapshot(&self) -> u64 {
        self.ctx.snapshot()
    }

    /// Sets whether closing should commit.
    ///
    /// Has no effect on read transactions.
    pub fn mark_success(&mut self, success: bool) {
        self.success = success;
    }

    /// Marks the transaction successful and closes it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalState`] for read transactions and when a
    /// nested transaction failed, and any commit failure. In both failure
    /// cases the transaction is left aborted.
    pub fn success(&mut self) -> CoreResult<()> {
        if !self.write {
            return Err(CoreError::illegal_state(
                "read transactions cannot be marked successful",
            ));
        }
        self.success = true;
        self.close()
    }

    /// Rolls back the buffered changes and closes.
    ///
    /// Aborting a nested transaction makes the outermost one abort as well.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalState`] for read transactions.
    pub fn abort(&mut self) -> CoreResult<()> {
        if !self.write {
            return Err(CoreError::illegal_state("read transactions cannot be aborted"));
        }
        self.success = false;
        self.close()
    }

    /// Closes the transaction.
    ///
    /// A write transaction commits if it was marked successful, and no
    /// nested one failed; otherwise it aborts. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the commit failure of an outermost write transaction, or
    /// [`CoreError::IllegalState`] if it was marked successful but a nested
    /// one failed.
    pub fn close(&mut self) -> CoreResult<()> {
        if self.state != TransactionState::Active {
            return Ok(());
        }
        if !self.write {
            self.state = TransactionState::Closed;
            if self.top_level {
                self.ctx.finish(false)?;
            }
            return Ok(());
        }
        if !self.top_level {
            if !self.success {
                self.ctx.mark_failed();
            }
            self.state = if self.success {
                TransactionState::Committed
            } else {
                TransactionState::Aborted
            };
            return Ok(());
        }
        let nested_failed = self.ctx.has_failed();
        let commit = self.success && !nested_failed;
        match self.ctx.finish(commit) {
            Ok(_) if commit => {
                self.state = TransactionState::Committed;
                Ok(())
            }
            Ok(_) => {
                self.state = TransactionState::Aborted;
                if self.success && nested_failed {
                    return Err(CoreError::illegal_state(
                        "a nested transaction failed, the transaction was aborted",
                    ));
                }
                Ok(())
            }
            Err(err) => {
                self.state = TransactionState::Aborted;
                Err(err)
            }
        }
    }

    /// Fails the surrounding transaction if this one is nested.
    pub(crate) fn fail_outer(&self) {
        if !self.top_level {
            self.ctx.mark_failed();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "closing a dropped transaction failed");
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("write", &self.write)
            .field("top_level", &self.top_level)
            .field("state", &self.state)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
