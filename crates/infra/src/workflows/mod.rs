//! Orchestrators: multi-row stock operations, each one unit of work.
//!
//! Every orchestrator follows the same shape: reject malformed input before
//! touching the store, lock order rows, check tenant ownership of everything
//! referenced, lock balance rows in key order, post through the
//! [`LedgerEngine`](crate::ledger::LedgerEngine), save the order, commit.

mod adjustment;
mod orders;
mod production;
mod purchase_receipt;
mod reservation;
mod sale_fulfillment;
mod transfer;

pub use adjustment::Adjust;
pub use orders::{CancelPurchaseOrder, CancelSaleOrder, OpenPurchaseOrder, OpenSaleOrder};
pub use production::{Produce, ProductionRun};
pub use purchase_receipt::{ReceiptLine, ReceivePurchase};
pub use reservation::{ReleaseStock, ReserveStock};
pub use sale_fulfillment::{FulfillSale, ShipmentLine};
pub use transfer::{Transfer, TransferResult};

use rust_decimal::Decimal;

use stockledger_core::{ItemId, TenantId, WarehouseId};
use stockledger_inventory::{Item, Warehouse};

use crate::ledger::{LedgerError, LedgerResult};
use crate::store::LedgerTx;

/// Load an item and make sure it belongs to `tenant_id`.
pub(crate) async fn owned_item(
    tx: &mut dyn LedgerTx,
    tenant_id: TenantId,
    item_id: ItemId,
) -> LedgerResult<Item> {
    let item = tx
        .item(item_id)
        .await?
        .ok_or_else(|| LedgerError::not_found(format!("item {item_id}")))?;
    if item.tenant_id != tenant_id {
        return Err(LedgerError::cross_tenant(format!(
            "item {item_id} does not belong to tenant {tenant_id}"
        )));
    }
    Ok(item)
}

/// Load a warehouse and make sure it belongs to `tenant_id`.
pub(crate) async fn owned_warehouse(
    tx: &mut dyn LedgerTx,
    tenant_id: TenantId,
    warehouse_id: WarehouseId,
) -> LedgerResult<Warehouse> {
    let warehouse = tx
        .warehouse(warehouse_id)
        .await?
        .ok_or_else(|| LedgerError::not_found(format!("warehouse {warehouse_id}")))?;
    if warehouse.tenant_id != tenant_id {
        return Err(LedgerError::cross_tenant(format!(
            "warehouse {warehouse_id} does not belong to tenant {tenant_id}"
        )));
    }
    Ok(warehouse)
}

pub(crate) fn require_positive(what: &str, quantity: Decimal) -> LedgerResult<()> {
    if quantity <= Decimal::ZERO {
        return Err(LedgerError::invalid_input(format!(
            "{what} quantity must be positive, got {quantity}"
        )));
    }
    Ok(())
}
