//! `stockledger-core`: domain foundation building blocks.
//!
//! Identifiers, the domain error model and aggregate versioning shared by the
//! inventory, purchasing, sales and production crates. No IO lives here.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{
    AggregateId, BatchId, ItemId, PurchaseOrderId, RecipeId, SaleOrderId, TenantId, UserId,
    WarehouseId,
};
