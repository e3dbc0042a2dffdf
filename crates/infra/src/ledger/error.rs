use rust_decimal::Decimal;
use thiserror::Error;

use stockledger_core::{DomainError, ItemId, PurchaseOrderId, SaleOrderId, WarehouseId};
use stockledger_purchasing::ReceiptRejection;
use stockledger_sales::ShipmentRejection;

use crate::store::StoreError;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// One ingredient a production run is short of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngredientShortfall {
    pub item_id: ItemId,
    pub required: Decimal,
    pub available: Decimal,
}

/// Error returned by every ledger operation.
///
/// Every variant means the unit of work was rolled back: the store is exactly
/// as it was before the call. Only [`LedgerError::ConcurrencyConflict`] is
/// worth retrying.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed request (zero quantity, identical warehouses, empty receipt…).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(
        "insufficient stock of item {item_id} in warehouse {warehouse_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        item_id: ItemId,
        warehouse_id: WarehouseId,
        requested: Decimal,
        available: Decimal,
    },

    /// Every ingredient the batch is short of, not just the first.
    #[error("ingredient shortage ({} ingredient(s) short)", .shortages.len())]
    IngredientShortage { shortages: Vec<IngredientShortfall> },

    #[error(
        "over-receipt on purchase order {purchase_order_id} line {line_no}: ordered {ordered}, received {received}, requested {requested}"
    )]
    OverReceipt {
        purchase_order_id: PurchaseOrderId,
        line_no: u32,
        item_id: ItemId,
        ordered: Decimal,
        received: Decimal,
        requested: Decimal,
    },

    #[error(
        "over-fulfillment on sale order {sale_order_id} line {line_no}: ordered {ordered}, shipped {shipped}, requested {requested}"
    )]
    OverFulfillment {
        sale_order_id: SaleOrderId,
        line_no: u32,
        item_id: ItemId,
        ordered: Decimal,
        shipped: Decimal,
        requested: Decimal,
    },

    /// Lock timeout, stale version, serialization failure or deadlock.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("cross-tenant reference: {0}")]
    CrossTenantViolation(String),

    /// No balance row and no such item or warehouse to create one for.
    #[error("unknown stock target: item {item_id} in warehouse {warehouse_id}")]
    UnknownStockTarget {
        item_id: ItemId,
        warehouse_id: WarehouseId,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// Status change not allowed by the order or batch transition table.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("store failure: {0}")]
    Store(StoreError),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::ConcurrencyConflict(_))
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn cross_tenant(msg: impl Into<String>) -> Self {
        Self::CrossTenantViolation(msg.into())
    }

    /// Map a purchase order's refusal of a receipt line.
    pub fn from_receipt(purchase_order_id: PurchaseOrderId, rejection: ReceiptRejection) -> Self {
        match rejection {
            ReceiptRejection::Closed { status } => Self::InvalidTransition(format!(
                "purchase order {purchase_order_id} is {} and accepts no receipts",
                status.as_str()
            )),
            ReceiptRejection::UnknownItem { item_id } => Self::InvalidInput(format!(
                "purchase order {purchase_order_id} has no line for item {item_id}"
            )),
            ReceiptRejection::InvalidQuantity { item_id, quantity } => Self::InvalidInput(
                format!("receipt quantity for item {item_id} must be positive, got {quantity}"),
            ),
            ReceiptRejection::OverReceipt {
                line_no,
                item_id,
                ordered,
                received,
                requested,
            } => Self::OverReceipt {
                purchase_order_id,
                line_no,
                item_id,
                ordered,
                received,
                requested,
            },
        }
    }

    /// Map a sale order's refusal of a shipment line.
    pub fn from_shipment(sale_order_id: SaleOrderId, rejection: ShipmentRejection) -> Self {
        match rejection {
            ShipmentRejection::Closed { status } => Self::InvalidTransition(format!(
                "sale order {sale_order_id} is {} and accepts no shipments",
                status.as_str()
            )),
            ShipmentRejection::UnknownItem { item_id } => Self::InvalidInput(format!(
                "sale order {sale_order_id} has no line for item {item_id}"
            )),
            ShipmentRejection::InvalidQuantity { item_id, quantity } => Self::InvalidInput(
                format!("shipment quantity for item {item_id} must be positive, got {quantity}"),
            ),
            ShipmentRejection::OverFulfillment {
                line_no,
                item_id,
                ordered,
                shipped,
                requested,
            } => Self::OverFulfillment {
                sale_order_id,
                line_no,
                item_id,
                ordered,
                shipped,
                requested,
            },
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::LockTimeout(msg) | StoreError::Conflict(msg) => {
                LedgerError::ConcurrencyConflict(msg)
            }
            StoreError::NotFound(msg) => LedgerError::NotFound(msg),
            other => LedgerError::Store(other),
        }
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                LedgerError::InvalidInput(msg)
            }
            DomainError::InvariantViolation(msg) => LedgerError::InvalidTransition(msg),
            DomainError::Conflict(msg) => LedgerError::ConcurrencyConflict(msg),
        }
    }
}
