//! Sales domain module (sale orders and shipments).
//!
//! Tracks what has been shipped against each order line and the order's
//! fulfillment status. Stock is decremented by the ledger in `stockledger-infra`.

pub mod order;

pub use order::{
    NewSaleLine, SaleOrder, SaleOrderLine, SaleOrderStatus, ShipmentRejection, ShippedLine,
};
