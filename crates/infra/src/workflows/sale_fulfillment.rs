use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use tracing::instrument;

use stockledger_core::{ExpectedVersion, ItemId, SaleOrderId, TenantId, UserId, WarehouseId};
use stockledger_inventory::{BalanceKey, Item, MovementDetail, Transaction};

use super::{owned_item, owned_warehouse, require_positive};
use crate::ledger::{Ledger, LedgerError, LedgerResult, MovementRequest, Posting};
use crate::store::LedgerTx;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipmentLine {
    pub item_id: ItemId,
    pub warehouse_id: WarehouseId,
    pub quantity: Decimal,
    /// Cost booked on the transaction; the item's standard cost when unset.
    pub unit_cost: Option<Decimal>,
}

/// Goods shipped against a sale order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillSale {
    pub tenant_id: TenantId,
    pub sale_order_id: SaleOrderId,
    pub lines: Vec<ShipmentLine>,
    pub actor: UserId,
    pub note: Option<String>,
}

impl Ledger {
    /// Ship a whole fulfillment: every line or none.
    ///
    /// Lines are checked against the order (never more than ordered) and
    /// against the locked balances before anything is posted. Reserved stock
    /// is released by what ships.
    #[instrument(
        skip(self, cmd),
        fields(tenant_id = %cmd.tenant_id, sale_order_id = %cmd.sale_order_id, lines = cmd.lines.len()),
        err
    )]
    pub async fn fulfill_sale(&self, cmd: FulfillSale) -> LedgerResult<Vec<Transaction>> {
        if cmd.lines.is_empty() {
            return Err(LedgerError::invalid_input("shipment has no lines"));
        }
        for line in &cmd.lines {
            require_positive("shipment", line.quantity)?;
            if line.unit_cost.is_some_and(|cost| cost < Decimal::ZERO) {
                return Err(LedgerError::invalid_input(format!(
                    "unit cost for item {} cannot be negative",
                    line.item_id
                )));
            }
        }

        let cmd = &cmd;
        let postings = self
            .retry
            .run("fulfill_sale", move || self.fulfill_sale_once(cmd))
            .await?;
        self.after_commit("fulfill_sale", &postings);
        Ok(postings.into_iter().map(|p| p.transaction).collect())
    }

    async fn fulfill_sale_once(&self, cmd: &FulfillSale) -> LedgerResult<Vec<Posting>> {
        let mut tx = self.store.begin().await?;
        let result = self.fulfill_sale_in(tx.as_mut(), cmd).await;
        self.finish(tx, result).await
    }

    async fn fulfill_sale_in(
        &self,
        tx: &mut dyn LedgerTx,
        cmd: &FulfillSale,
    ) -> LedgerResult<Vec<Posting>> {
        let so_id = cmd.sale_order_id;
        let mut order = tx
            .lock_sale_order(so_id)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("sale order {so_id}")))?;
        if order.tenant_id() != cmd.tenant_id {
            return Err(LedgerError::cross_tenant(format!(
                "sale order {so_id} does not belong to tenant {}",
                cmd.tenant_id
            )));
        }

        let mut items: HashMap<ItemId, Item> = HashMap::new();
        for line in &cmd.lines {
            if !items.contains_key(&line.item_id) {
                let item = owned_item(tx, cmd.tenant_id, line.item_id).await?;
                items.insert(line.item_id, item);
            }
            owned_warehouse(tx, cmd.tenant_id, line.warehouse_id).await?;
        }

        let mut shipped = Vec::with_capacity(cmd.lines.len());
        for line in &cmd.lines {
            let accepted = order
                .ship(line.item_id, line.quantity)
                .map_err(|rejection| LedgerError::from_shipment(so_id, rejection))?;
            shipped.push(accepted);
        }

        // Fast fail on the locked balances; the engine re-checks every posting.
        // On-hand rather than available: reservations are not tied to an
        // order, so a shipment may draw on reserved stock.
        let mut requested: BTreeMap<BalanceKey, Decimal> = BTreeMap::new();
        for line in &cmd.lines {
            let total = requested
                .entry(BalanceKey::new(line.warehouse_id, line.item_id))
                .or_default();
            *total = total.checked_add(line.quantity).ok_or_else(|| {
                LedgerError::invalid_input(format!(
                    "shipment of item {} from warehouse {} is out of range",
                    line.item_id, line.warehouse_id
                ))
            })?;
        }
        let balances = self
            .engine
            .lock_balances(tx, cmd.tenant_id, requested.keys().copied())
            .await?;
        for (key, quantity) in &requested {
            let on_hand = balances
                .get(key)
                .map(|b| b.quantity())
                .unwrap_or_default();
            if on_hand < *quantity {
                return Err(LedgerError::InsufficientStock {
                    item_id: key.item_id,
                    warehouse_id: key.warehouse_id,
                    requested: *quantity,
                    available: on_hand,
                });
            }
        }

        let mut postings = Vec::with_capacity(cmd.lines.len());
        for (line, accepted) in cmd.lines.iter().zip(shipped) {
            let key = BalanceKey::new(line.warehouse_id, line.item_id);
            self.engine
                .release_up_to(tx, cmd.tenant_id, key, line.quantity)
                .await?;

            let unit_cost = line
                .unit_cost
                .or_else(|| items.get(&line.item_id).map(|item| item.unit_cost));
            let posting = self
                .engine
                .apply_movement(
                    tx,
                    MovementRequest {
                        tenant_id: cmd.tenant_id,
                        item_id: line.item_id,
                        warehouse_id: line.warehouse_id,
                        quantity: line.quantity,
                        unit_cost,
                        reference: Some(so_id.to_string()),
                        detail: MovementDetail::SaleShipment {
                            sale_order_id: so_id,
                            line_no: accepted.line_no,
                        },
                        actor: cmd.actor,
                        note: cmd.note.clone(),
                    },
                )
                .await?;
            postings.push(posting);
        }

        order.settle_status()?;
        tx.save_sale_order(&order, ExpectedVersion::read_at(&order))
            .await?;
        Ok(postings)
    }
}
