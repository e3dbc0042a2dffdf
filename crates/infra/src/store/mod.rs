//! Ledger storage boundary.
//!
//! A store hands out units of work ([`LedgerTx`]) that lock rows, stage
//! writes and commit them atomically. Two implementations: in-memory
//! (tests/dev) and Postgres.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{DEFAULT_LOCK_TIMEOUT, InMemoryLedgerStore, InMemoryLedgerTx};
pub use postgres::{PostgresLedgerStore, PostgresLedgerTx};
pub use r#trait::{LedgerStore, LedgerTx, StoreError, TransactionFilter};
