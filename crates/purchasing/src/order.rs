use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    AggregateRoot, DomainError, DomainResult, ItemId, PurchaseOrderId, TenantId,
};

/// Purchase order status lifecycle.
///
/// ```text
/// PENDING ──► PARTIALLY_RECEIVED ──► RECEIVED
///    │               │
///    └──► CANCELLED ◄┘
/// PENDING ──► RECEIVED (single complete receipt)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseOrderStatus {
    Pending,
    PartiallyReceived,
    Received,
    Cancelled,
}

impl PurchaseOrderStatus {
    /// The transition table. Anything not listed is rejected.
    pub fn can_transition_to(self, next: PurchaseOrderStatus) -> bool {
        use PurchaseOrderStatus::*;
        matches!(
            (self, next),
            (Pending, PartiallyReceived)
                | (Pending, Received)
                | (Pending, Cancelled)
                | (PartiallyReceived, Received)
                | (PartiallyReceived, Cancelled)
        )
    }

    pub fn is_open(self) -> bool {
        matches!(
            self,
            PurchaseOrderStatus::Pending | PurchaseOrderStatus::PartiallyReceived
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseOrderStatus::Pending => "PENDING",
            PurchaseOrderStatus::PartiallyReceived => "PARTIALLY_RECEIVED",
            PurchaseOrderStatus::Received => "RECEIVED",
            PurchaseOrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(PurchaseOrderStatus::Pending),
            "PARTIALLY_RECEIVED" => Some(PurchaseOrderStatus::PartiallyReceived),
            "RECEIVED" => Some(PurchaseOrderStatus::Received),
            "CANCELLED" => Some(PurchaseOrderStatus::Cancelled),
            _ => None,
        }
    }
}

/// Line requested when creating an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPurchaseLine {
    pub item_id: ItemId,
    pub ordered_qty: Decimal,
    pub unit_cost: Decimal,
}

/// Purchase order line with its cumulative receipts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderLine {
    pub line_no: u32,
    pub item_id: ItemId,
    pub ordered_qty: Decimal,
    /// Agreed cost per unit; receipts are posted at this cost.
    pub unit_cost: Decimal,
    /// Monotonically non-decreasing, never above `ordered_qty`.
    pub received_qty: Decimal,
}

impl PurchaseOrderLine {
    pub fn remaining(&self) -> Decimal {
        self.ordered_qty - self.received_qty
    }

    pub fn is_complete(&self) -> bool {
        self.received_qty == self.ordered_qty
    }
}

/// What a receipt line resolved to on the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedLine {
    pub line_no: u32,
    pub unit_cost: Decimal,
}

/// Why a receipt line was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptRejection {
    /// Order no longer accepts receipts.
    Closed { status: PurchaseOrderStatus },
    /// No line on the order for this item.
    UnknownItem { item_id: ItemId },
    /// Quantity must be strictly positive.
    InvalidQuantity { item_id: ItemId, quantity: Decimal },
    /// `received + requested` would exceed `ordered`.
    OverReceipt {
        line_no: u32,
        item_id: ItemId,
        ordered: Decimal,
        received: Decimal,
        requested: Decimal,
    },
}

/// Aggregate root: PurchaseOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    id: PurchaseOrderId,
    tenant_id: TenantId,
    status: PurchaseOrderStatus,
    lines: Vec<PurchaseOrderLine>,
    version: u64,
    created_at: DateTime<Utc>,
}

impl PurchaseOrder {
    /// Create a new pending order. Items must be unique across lines.
    pub fn new(
        id: PurchaseOrderId,
        tenant_id: TenantId,
        lines: Vec<NewPurchaseLine>,
        created_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if lines.is_empty() {
            return Err(DomainError::validation(
                "purchase order needs at least one line",
            ));
        }

        let mut built: Vec<PurchaseOrderLine> = Vec::with_capacity(lines.len());
        for (idx, line) in lines.into_iter().enumerate() {
            if line.ordered_qty <= Decimal::ZERO {
                return Err(DomainError::validation(format!(
                    "line {}: ordered quantity must be positive",
                    idx + 1
                )));
            }
            if line.unit_cost < Decimal::ZERO {
                return Err(DomainError::validation(format!(
                    "line {}: unit cost cannot be negative",
                    idx + 1
                )));
            }
            if built.iter().any(|l| l.item_id == line.item_id) {
                return Err(DomainError::validation(format!(
                    "line {}: item {} already on the order",
                    idx + 1,
                    line.item_id
                )));
            }
            built.push(PurchaseOrderLine {
                line_no: (idx as u32) + 1,
                item_id: line.item_id,
                ordered_qty: line.ordered_qty,
                unit_cost: line.unit_cost,
                received_qty: Decimal::ZERO,
            });
        }

        Ok(Self {
            id,
            tenant_id,
            status: PurchaseOrderStatus::Pending,
            lines: built,
            version: 0,
            created_at,
        })
    }

    /// Rebuild an order loaded from storage.
    pub fn restore(
        id: PurchaseOrderId,
        tenant_id: TenantId,
        status: PurchaseOrderStatus,
        lines: Vec<PurchaseOrderLine>,
        version: u64,
        created_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        for line in &lines {
            if line.received_qty < Decimal::ZERO || line.received_qty > line.ordered_qty {
                return Err(DomainError::invariant(format!(
                    "line {} received {} of {}",
                    line.line_no, line.received_qty, line.ordered_qty
                )));
            }
        }
        Ok(Self {
            id,
            tenant_id,
            status,
            lines,
            version,
            created_at,
        })
    }

    pub fn order_id(&self) -> PurchaseOrderId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn status(&self) -> PurchaseOrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[PurchaseOrderLine] {
        &self.lines
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn line_for_item(&self, item_id: ItemId) -> Option<&PurchaseOrderLine> {
        self.lines.iter().find(|l| l.item_id == item_id)
    }

    /// Record a receipt of `quantity` units of `item_id`.
    ///
    /// Over-receipt is rejected, never clamped. Status is not touched here;
    /// call [`PurchaseOrder::settle_status`] once the whole receipt is applied.
    pub fn receive(
        &mut self,
        item_id: ItemId,
        quantity: Decimal,
    ) -> Result<ReceivedLine, ReceiptRejection> {
        if !self.status.is_open() {
            return Err(ReceiptRejection::Closed {
                status: self.status,
            });
        }
        if quantity <= Decimal::ZERO {
            return Err(ReceiptRejection::InvalidQuantity { item_id, quantity });
        }

        let line = self
            .lines
            .iter_mut()
            .find(|l| l.item_id == item_id)
            .ok_or(ReceiptRejection::UnknownItem { item_id })?;

        let total = line
            .received_qty
            .checked_add(quantity)
            .filter(|total| *total <= line.ordered_qty);
        let Some(total) = total else {
            return Err(ReceiptRejection::OverReceipt {
                line_no: line.line_no,
                item_id,
                ordered: line.ordered_qty,
                received: line.received_qty,
                requested: quantity,
            });
        };

        line.received_qty = total;
        Ok(ReceivedLine {
            line_no: line.line_no,
            unit_cost: line.unit_cost,
        })
    }

    /// Status implied by the lines: RECEIVED when every line is complete,
    /// PARTIALLY_RECEIVED when anything was received, otherwise unchanged.
    pub fn derived_status(&self) -> PurchaseOrderStatus {
        if !self.status.is_open() {
            return self.status;
        }
        if self.lines.iter().all(PurchaseOrderLine::is_complete) {
            PurchaseOrderStatus::Received
        } else if self.lines.iter().any(|l| l.received_qty > Decimal::ZERO) {
            PurchaseOrderStatus::PartiallyReceived
        } else {
            self.status
        }
    }

    /// Move to the derived status through the transition table.
    pub fn settle_status(&mut self) -> DomainResult<PurchaseOrderStatus> {
        let next = self.derived_status();
        if next != self.status {
            self.transition(next)?;
        }
        Ok(self.status)
    }

    pub fn cancel(&mut self) -> DomainResult<()> {
        self.transition(PurchaseOrderStatus::Cancelled)
    }

    fn transition(&mut self, next: PurchaseOrderStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invariant(format!(
                "purchase order cannot move from {} to {}",
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }
}

impl AggregateRoot for PurchaseOrder {
    type Id = PurchaseOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
