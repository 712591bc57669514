//! Transactions with snapshot isolation.
//!
//! - **Atomicity**: a write transaction commits all of its changes or none
//! - **Isolation**: readers see the commit that was newest when they began
//! - **Durability**: a commit returns once its WAL transaction is flushed
//!
//! There is at most one write transaction per store; readers run beside it
//! and are limited by the number of reader slots.

mod context;
mod manager;
mod state;
mod write_set;

pub(crate) use context::TxnContext;
pub use manager::TransactionManager;
pub use state::{Transaction, TransactionState};
pub use write_set::WriteSet;
