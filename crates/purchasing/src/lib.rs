//! Purchasing domain module (purchase orders and goods receipts).
//!
//! Pure domain logic: line-level receipt tracking and the purchase order
//! status lifecycle. Stock itself is moved by the ledger in `stockledger-infra`.

pub mod order;

pub use order::{
    NewPurchaseLine, PurchaseOrder, PurchaseOrderLine, PurchaseOrderStatus, ReceiptRejection,
    ReceivedLine,
};
