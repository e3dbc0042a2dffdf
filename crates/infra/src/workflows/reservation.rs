use rust_decimal::Decimal;
use tracing::{info, instrument};

use stockledger_core::{ItemId, TenantId, UserId, WarehouseId};
use stockledger_inventory::{BalanceKey, StockBalance};

use super::{owned_item, owned_warehouse, require_positive};
use crate::ledger::{Ledger, LedgerResult};
use crate::store::LedgerTx;

/// Set aside available stock. On-hand quantity does not change and no
/// transaction is written.
///
/// A reservation belongs to the balance, not to an order. Any shipment from
/// the same warehouse and item releases reserved stock by the amount it
/// ships, even when another order made the reservation, and shipments are
/// checked against on-hand stock. Reservations therefore limit further
/// reservations but never block a sale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveStock {
    pub tenant_id: TenantId,
    pub warehouse_id: WarehouseId,
    pub item_id: ItemId,
    pub quantity: Decimal,
    pub actor: UserId,
}

/// Give back reserved stock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseStock {
    pub tenant_id: TenantId,
    pub warehouse_id: WarehouseId,
    pub item_id: ItemId,
    pub quantity: Decimal,
    pub actor: UserId,
}

#[derive(Debug, Clone, Copy)]
enum ReservationChange {
    Reserve,
    Release,
}

impl Ledger {
    #[instrument(
        skip(self, cmd),
        fields(tenant_id = %cmd.tenant_id, item_id = %cmd.item_id, warehouse_id = %cmd.warehouse_id, quantity = %cmd.quantity),
        err
    )]
    pub async fn reserve(&self, cmd: ReserveStock) -> LedgerResult<StockBalance> {
        require_positive("reservation", cmd.quantity)?;
        let key = BalanceKey::new(cmd.warehouse_id, cmd.item_id);
        let balance = self
            .retry
            .run("reserve", || {
                self.reservation_once(cmd.tenant_id, key, cmd.quantity, ReservationChange::Reserve)
            })
            .await?;
        info!(actor = %cmd.actor, reserved = %balance.reserved(), "stock reserved");
        Ok(balance)
    }

    #[instrument(
        skip(self, cmd),
        fields(tenant_id = %cmd.tenant_id, item_id = %cmd.item_id, warehouse_id = %cmd.warehouse_id, quantity = %cmd.quantity),
        err
    )]
    pub async fn release(&self, cmd: ReleaseStock) -> LedgerResult<StockBalance> {
        require_positive("release", cmd.quantity)?;
        let key = BalanceKey::new(cmd.warehouse_id, cmd.item_id);
        let balance = self
            .retry
            .run("release", || {
                self.reservation_once(cmd.tenant_id, key, cmd.quantity, ReservationChange::Release)
            })
            .await?;
        info!(actor = %cmd.actor, reserved = %balance.reserved(), "reservation released");
        Ok(balance)
    }

    async fn reservation_once(
        &self,
        tenant_id: TenantId,
        key: BalanceKey,
        quantity: Decimal,
        change: ReservationChange,
    ) -> LedgerResult<StockBalance> {
        let mut tx = self.store.begin().await?;
        let result = self
            .reservation_in(tx.as_mut(), tenant_id, key, quantity, change)
            .await;
        self.finish(tx, result).await
    }

    async fn reservation_in(
        &self,
        tx: &mut dyn LedgerTx,
        tenant_id: TenantId,
        key: BalanceKey,
        quantity: Decimal,
        change: ReservationChange,
    ) -> LedgerResult<StockBalance> {
        owned_warehouse(tx, tenant_id, key.warehouse_id).await?;
        owned_item(tx, tenant_id, key.item_id).await?;
        match change {
            ReservationChange::Reserve => self.engine.reserve(tx, tenant_id, key, quantity).await,
            ReservationChange::Release => self.engine.release(tx, tenant_id, key, quantity).await,
        }
    }
}
