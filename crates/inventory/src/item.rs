use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, ItemId, TenantId, WarehouseId};

/// Stock-keeping item (master data, read-only to the ledger).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub tenant_id: TenantId,
    pub sku: String,
    pub name: String,
    pub unit_of_measure: String,
    /// Standard cost per unit, used for usage and sale postings.
    pub unit_cost: Decimal,
    pub unit_price: Decimal,
}

impl Item {
    pub fn new(
        id: ItemId,
        tenant_id: TenantId,
        sku: impl Into<String>,
        name: impl Into<String>,
        unit_of_measure: impl Into<String>,
        unit_cost: Decimal,
        unit_price: Decimal,
    ) -> Result<Self, DomainError> {
        let sku = sku.into();
        let name = name.into();
        if sku.trim().is_empty() {
            return Err(DomainError::validation("sku cannot be empty"));
        }
        if name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if unit_cost < Decimal::ZERO || unit_price < Decimal::ZERO {
            return Err(DomainError::validation("cost and price cannot be negative"));
        }
        Ok(Self {
            id,
            tenant_id,
            sku,
            name,
            unit_of_measure: unit_of_measure.into(),
            unit_cost,
            unit_price,
        })
    }
}

/// Physical stock location owned by one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: WarehouseId,
    pub tenant_id: TenantId,
    pub name: String,
}

impl Warehouse {
    pub fn new(id: WarehouseId, tenant_id: TenantId, name: impl Into<String>) -> Self {
        Self {
            id,
            tenant_id,
            name: name.into(),
        }
    }
}
