use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{AggregateRoot, DomainError, DomainResult, ItemId, SaleOrderId, TenantId};

/// Sale order status lifecycle.
///
/// ```text
/// PENDING ──► PARTIALLY_FULFILLED ──► COMPLETED
///    │               │
///    └──► CANCELLED ◄┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaleOrderStatus {
    Pending,
    PartiallyFulfilled,
    Completed,
    Cancelled,
}

impl SaleOrderStatus {
    pub fn can_transition_to(self, next: SaleOrderStatus) -> bool {
        use SaleOrderStatus::*;
        matches!(
            (self, next),
            (Pending, PartiallyFulfilled)
                | (Pending, Completed)
                | (Pending, Cancelled)
                | (PartiallyFulfilled, Completed)
                | (PartiallyFulfilled, Cancelled)
        )
    }

    pub fn is_open(self) -> bool {
        matches!(
            self,
            SaleOrderStatus::Pending | SaleOrderStatus::PartiallyFulfilled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SaleOrderStatus::Pending => "PENDING",
            SaleOrderStatus::PartiallyFulfilled => "PARTIALLY_FULFILLED",
            SaleOrderStatus::Completed => "COMPLETED",
            SaleOrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(SaleOrderStatus::Pending),
            "PARTIALLY_FULFILLED" => Some(SaleOrderStatus::PartiallyFulfilled),
            "COMPLETED" => Some(SaleOrderStatus::Completed),
            "CANCELLED" => Some(SaleOrderStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSaleLine {
    pub item_id: ItemId,
    pub ordered_qty: Decimal,
    pub unit_price: Decimal,
}

/// Order line with cumulative shipments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleOrderLine {
    pub line_no: u32,
    pub item_id: ItemId,
    pub ordered_qty: Decimal,
    pub unit_price: Decimal,
    pub shipped_qty: Decimal,
}

impl SaleOrderLine {
    pub fn remaining(&self) -> Decimal {
        self.ordered_qty - self.shipped_qty
    }

    pub fn is_complete(&self) -> bool {
        self.shipped_qty == self.ordered_qty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShippedLine {
    pub line_no: u32,
    pub unit_price: Decimal,
}

/// Why a shipment line was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShipmentRejection {
    Closed { status: SaleOrderStatus },
    UnknownItem { item_id: ItemId },
    InvalidQuantity { item_id: ItemId, quantity: Decimal },
    /// `shipped + requested` would exceed `ordered`.
    OverFulfillment {
        line_no: u32,
        item_id: ItemId,
        ordered: Decimal,
        shipped: Decimal,
        requested: Decimal,
    },
}

/// Aggregate root: SaleOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaleOrder {
    id: SaleOrderId,
    tenant_id: TenantId,
    status: SaleOrderStatus,
    lines: Vec<SaleOrderLine>,
    version: u64,
    created_at: DateTime<Utc>,
}

impl SaleOrder {
    pub fn new(
        id: SaleOrderId,
        tenant_id: TenantId,
        lines: Vec<NewSaleLine>,
        created_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if lines.is_empty() {
            return Err(DomainError::validation("sale order needs at least one line"));
        }

        let mut built: Vec<SaleOrderLine> = Vec::with_capacity(lines.len());
        for (idx, line) in lines.into_iter().enumerate() {
            if line.ordered_qty <= Decimal::ZERO {
                return Err(DomainError::validation(format!(
                    "line {}: ordered quantity must be positive",
                    idx + 1
                )));
            }
            if line.unit_price < Decimal::ZERO {
                return Err(DomainError::validation(format!(
                    "line {}: unit price cannot be negative",
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
            built.push(SaleOrderLine {
                line_no: (idx as u32) + 1,
                item_id: line.item_id,
                ordered_qty: line.ordered_qty,
                unit_price: line.unit_price,
                shipped_qty: Decimal::ZERO,
            });
        }

        Ok(Self {
            id,
            tenant_id,
            status: SaleOrderStatus::Pending,
            lines: built,
            version: 0,
            created_at,
        })
    }

    pub fn restore(
        id: SaleOrderId,
        tenant_id: TenantId,
        status: SaleOrderStatus,
        lines: Vec<SaleOrderLine>,
        version: u64,
        created_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        for line in &lines {
            if line.shipped_qty < Decimal::ZERO || line.shipped_qty > line.ordered_qty {
                return Err(DomainError::invariant(format!(
                    "line {} shipped {} of {}",
                    line.line_no, line.shipped_qty, line.ordered_qty
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

    pub fn order_id(&self) -> SaleOrderId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn status(&self) -> SaleOrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[SaleOrderLine] {
        &self.lines
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn line_for_item(&self, item_id: ItemId) -> Option<&SaleOrderLine> {
        self.lines.iter().find(|l| l.item_id == item_id)
    }

    /// Record a shipment of `quantity` units of `item_id` against its line.
    pub fn ship(
        &mut self,
        item_id: ItemId,
        quantity: Decimal,
    ) -> Result<ShippedLine, ShipmentRejection> {
        if !self.status.is_open() {
            return Err(ShipmentRejection::Closed {
                status: self.status,
            });
        }
        if quantity <= Decimal::ZERO {
            return Err(ShipmentRejection::InvalidQuantity { item_id, quantity });
        }

        let line = self
            .lines
            .iter_mut()
            .find(|l| l.item_id == item_id)
            .ok_or(ShipmentRejection::UnknownItem { item_id })?;

        let total = line
            .shipped_qty
            .checked_add(quantity)
            .filter(|total| *total <= line.ordered_qty);
        let Some(total) = total else {
            return Err(ShipmentRejection::OverFulfillment {
                line_no: line.line_no,
                item_id,
                ordered: line.ordered_qty,
                shipped: line.shipped_qty,
                requested: quantity,
            });
        };

        line.shipped_qty = total;
        Ok(ShippedLine {
            line_no: line.line_no,
            unit_price: line.unit_price,
        })
    }

    pub fn derived_status(&self) -> SaleOrderStatus {
        if !self.status.is_open() {
            return self.status;
        }
        if self.lines.iter().all(SaleOrderLine::is_complete) {
            SaleOrderStatus::Completed
        } else if self.lines.iter().any(|l| l.shipped_qty > Decimal::ZERO) {
            SaleOrderStatus::PartiallyFulfilled
        } else {
            self.status
        }
    }

    pub fn settle_status(&mut self) -> DomainResult<SaleOrderStatus> {
        let next = self.derived_status();
        if next != self.status {
            self.transition(next)?;
        }
        Ok(self.status)
    }

    pub fn cancel(&mut self) -> DomainResult<()> {
        self.transition(SaleOrderStatus::Cancelled)
    }

    fn transition(&mut self, next: SaleOrderStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invariant(format!(
                "sale order cannot move from {} to {}",
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }
}

impl AggregateRoot for SaleOrder {
    type Id = SaleOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
