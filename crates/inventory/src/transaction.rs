//! Immutable ledger records: transactions and their directional movements.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    BatchId, ItemId, PurchaseOrderId, SaleOrderId, TenantId, UserId, WarehouseId,
};

/// Business category of a stock movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Purchase,
    Sale,
    Transfer,
    Adjustment,
    /// Ingredient consumption by a production batch.
    Usage,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Purchase => "PURCHASE",
            TransactionKind::Sale => "SALE",
            TransactionKind::Transfer => "TRANSFER",
            TransactionKind::Adjustment => "ADJUSTMENT",
            TransactionKind::Usage => "USAGE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PURCHASE" => Some(TransactionKind::Purchase),
            "SALE" => Some(TransactionKind::Sale),
            "TRANSFER" => Some(TransactionKind::Transfer),
            "ADJUSTMENT" => Some(TransactionKind::Adjustment),
            "USAGE" => Some(TransactionKind::Usage),
            _ => None,
        }
    }
}

impl core::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a movement relative to the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    /// Apply this direction's sign to a magnitude.
    pub fn signed(&self, magnitude: Decimal) -> Decimal {
        match self {
            Direction::In => magnitude.abs(),
            Direction::Out => -magnitude.abs(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "IN" => Some(Direction::In),
            "OUT" => Some(Direction::Out),
            _ => None,
        }
    }
}

/// Why a manual adjustment was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    CycleCount,
    Damage,
    Loss,
    Found,
    Correction,
    Opening,
}

/// Kind-specific payload of a transaction.
///
/// Each variant carries exactly the links that make sense for it, and fixes
/// the direction of the movement: callers never choose the sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MovementDetail {
    PurchaseReceipt {
        purchase_order_id: PurchaseOrderId,
        line_no: u32,
    },
    ProductionOutput {
        batch_id: BatchId,
    },
    SaleShipment {
        sale_order_id: SaleOrderId,
        line_no: u32,
    },
    TransferOut {
        reference: String,
        counterpart: WarehouseId,
    },
    TransferIn {
        reference: String,
        counterpart: WarehouseId,
    },
    AdjustmentIncrease {
        reason: ReasonCode,
    },
    AdjustmentDecrease {
        reason: ReasonCode,
    },
    Usage {
        batch_id: BatchId,
    },
}

impl MovementDetail {
    pub fn kind(&self) -> TransactionKind {
        match self {
            MovementDetail::PurchaseReceipt { .. } | MovementDetail::ProductionOutput { .. } => {
                TransactionKind::Purchase
            }
            MovementDetail::SaleShipment { .. } => TransactionKind::Sale,
            MovementDetail::TransferOut { .. } | MovementDetail::TransferIn { .. } => {
                TransactionKind::Transfer
            }
            MovementDetail::AdjustmentIncrease { .. } | MovementDetail::AdjustmentDecrease { .. } => {
                TransactionKind::Adjustment
            }
            MovementDetail::Usage { .. } => TransactionKind::Usage,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            MovementDetail::PurchaseReceipt { .. }
            | MovementDetail::ProductionOutput { .. }
            | MovementDetail::TransferIn { .. }
            | MovementDetail::AdjustmentIncrease { .. } => Direction::In,
            MovementDetail::SaleShipment { .. }
            | MovementDetail::TransferOut { .. }
            | MovementDetail::AdjustmentDecrease { .. }
            | MovementDetail::Usage { .. } => Direction::Out,
        }
    }

    /// Shared reference carried by the variant itself (transfer legs).
    pub fn reference(&self) -> Option<&str> {
        match self {
            MovementDetail::TransferOut { reference, .. }
            | MovementDetail::TransferIn { reference, .. } => Some(reference),
            _ => None,
        }
    }

    pub fn purchase_order_id(&self) -> Option<PurchaseOrderId> {
        match self {
            MovementDetail::PurchaseReceipt {
                purchase_order_id, ..
            } => Some(*purchase_order_id),
            _ => None,
        }
    }

    pub fn sale_order_id(&self) -> Option<SaleOrderId> {
        match self {
            MovementDetail::SaleShipment { sale_order_id, .. } => Some(*sale_order_id),
            _ => None,
        }
    }

    pub fn batch_id(&self) -> Option<BatchId> {
        match self {
            MovementDetail::ProductionOutput { batch_id } | MovementDetail::Usage { batch_id } => {
                Some(*batch_id)
            }
            _ => None,
        }
    }
}

/// Store-assigned identity of a transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub i64);

impl core::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Store-assigned identity of a movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MovementId(pub i64);

/// A transaction ready to be appended (identity not yet assigned).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub tenant_id: TenantId,
    pub item_id: ItemId,
    pub warehouse_id: WarehouseId,
    /// Signed: positive for IN, negative for OUT.
    pub quantity: Decimal,
    pub unit_cost: Option<Decimal>,
    pub reference: Option<String>,
    pub detail: MovementDetail,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
    pub note: Option<String>,
}

impl NewTransaction {
    pub fn kind(&self) -> TransactionKind {
        self.detail.kind()
    }

    /// Attach the identity assigned by the store.
    pub fn into_committed(self, id: TransactionId) -> Transaction {
        Transaction {
            id,
            tenant_id: self.tenant_id,
            kind: self.detail.kind(),
            item_id: self.item_id,
            warehouse_id: self.warehouse_id,
            quantity: self.quantity,
            unit_cost: self.unit_cost,
            reference: self.reference,
            detail: self.detail,
            actor: self.actor,
            occurred_at: self.occurred_at,
            note: self.note,
        }
    }
}

/// Immutable record of one stock movement. Never updated, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub tenant_id: TenantId,
    pub kind: TransactionKind,
    pub item_id: ItemId,
    pub warehouse_id: WarehouseId,
    /// Signed: positive for IN, negative for OUT.
    pub quantity: Decimal,
    pub unit_cost: Option<Decimal>,
    pub reference: Option<String>,
    pub detail: MovementDetail,
    pub actor: UserId,
    pub occurred_at: DateTime<Utc>,
    pub note: Option<String>,
}

impl Transaction {
    pub fn direction(&self) -> Direction {
        self.detail.direction()
    }
}

/// A movement ready to be appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMovement {
    pub transaction_id: TransactionId,
    pub tenant_id: TenantId,
    pub item_id: ItemId,
    pub warehouse_id: WarehouseId,
    pub direction: Direction,
    pub quantity: Decimal,
    pub occurred_at: DateTime<Utc>,
}

impl NewMovement {
    /// The directional view of a committed transaction.
    pub fn for_transaction(transaction: &Transaction) -> Self {
        Self {
            transaction_id: transaction.id,
            tenant_id: transaction.tenant_id,
            item_id: transaction.item_id,
            warehouse_id: transaction.warehouse_id,
            direction: transaction.direction(),
            quantity: transaction.quantity.abs(),
            occurred_at: transaction.occurred_at,
        }
    }

    pub fn into_committed(self, id: MovementId) -> Movement {
        Movement {
            id,
            transaction_id: self.transaction_id,
            tenant_id: self.tenant_id,
            item_id: self.item_id,
            warehouse_id: self.warehouse_id,
            direction: self.direction,
            quantity: self.quantity,
            occurred_at: self.occurred_at,
        }
    }
}

/// Directional audit row derived from a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub id: MovementId,
    pub transaction_id: TransactionId,
    pub tenant_id: TenantId,
    pub item_id: ItemId,
    pub warehouse_id: WarehouseId,
    pub direction: Direction,
    /// Magnitude (always positive).
    pub quantity: Decimal,
    pub occurred_at: DateTime<Utc>,
}

impl Movement {
    pub fn signed_quantity(&self) -> Decimal {
        self.direction.signed(self.quantity)
    }
}

/// Rebuild an on-hand quantity from zero by summing signed transactions.
pub fn replay<'a>(transactions: impl IntoIterator<Item = &'a Transaction>) -> Decimal {
    transactions
        .into_iter()
        .fold(Decimal::ZERO, |acc, t| acc + t.quantity)
}
