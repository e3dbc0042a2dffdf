//! Infrastructure layer: stores, the ledger and its orchestrators, event
//! publication and configuration.
//!
//! Domain crates stay pure; everything that locks, persists, retries or
//! publishes lives here.

pub mod config;
pub mod event_bus;
pub mod ledger;
pub mod store;
pub mod workflows;

pub use ledger::{Ledger, LedgerError, LedgerResult};

#[cfg(test)]
mod integration_tests;
