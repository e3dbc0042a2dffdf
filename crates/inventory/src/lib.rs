//! Inventory domain module.
//!
//! Items, warehouses, stock balances and the immutable ledger records
//! (transactions and movements) that explain every balance change. Pure
//! domain logic: no IO, no locking, no storage.

pub mod balance;
pub mod event;
pub mod item;
pub mod transaction;

pub use balance::{BalanceKey, MovementRejection, Shortfall, StockBalance};
pub use event::StockChanged;
pub use item::{Item, Warehouse};
pub use transaction::{
    Direction, Movement, MovementDetail, MovementId, NewMovement, NewTransaction, ReasonCode,
    Transaction, TransactionId, TransactionKind, replay,
};
