//! The single place that changes stock balances.
//!
//! Every posting writes three rows inside the caller's unit of work: the
//! updated balance, the transaction and its movement. The engine never commits,
//! never publishes and never looks at tenant ownership; orchestrators do.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::debug;

use stockledger_core::{ExpectedVersion, ItemId, TenantId, UserId, WarehouseId};
use stockledger_inventory::{
    BalanceKey, Movement, MovementDetail, MovementRejection, NewMovement, NewTransaction,
    StockBalance, StockChanged, Transaction,
};

use super::error::{LedgerError, LedgerResult};
use crate::store::LedgerTx;

/// One stock movement to post.
///
/// `quantity` is a magnitude: its sign is ignored and the direction comes from
/// `detail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementRequest {
    pub tenant_id: TenantId,
    pub item_id: ItemId,
    pub warehouse_id: WarehouseId,
    pub quantity: Decimal,
    pub unit_cost: Option<Decimal>,
    /// Defaults to the reference carried by `detail` (transfer legs).
    pub reference: Option<String>,
    pub detail: MovementDetail,
    pub actor: UserId,
    pub note: Option<String>,
}

/// A transaction with its movement and the balance it moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posting {
    pub transaction: Transaction,
    pub movement: Movement,
    pub old_quantity: Decimal,
    pub new_quantity: Decimal,
}

impl Posting {
    /// Integration event announcing this posting once committed.
    pub fn stock_changed(&self) -> StockChanged {
        StockChanged {
            tenant_id: self.transaction.tenant_id,
            item_id: self.transaction.item_id,
            warehouse_id: self.transaction.warehouse_id,
            old_quantity: self.old_quantity,
            new_quantity: self.new_quantity,
            transaction_kind: self.transaction.kind,
            transaction_id: self.transaction.id,
            occurred_at: self.transaction.occurred_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerEngine;

impl LedgerEngine {
    pub fn new() -> Self {
        Self
    }

    /// Post one movement: lock the balance, check it, write balance,
    /// transaction and movement.
    ///
    /// On error nothing was written by this call; the caller rolls the unit of
    /// work back anyway.
    pub async fn apply_movement(
        &self,
        tx: &mut dyn LedgerTx,
        request: MovementRequest,
    ) -> LedgerResult<Posting> {
        if request.quantity.is_zero() {
            return Err(LedgerError::invalid_input(format!(
                "movement of item {} in warehouse {} has zero quantity",
                request.item_id, request.warehouse_id
            )));
        }

        let magnitude = request.quantity.abs();
        let direction = request.detail.direction();
        let key = BalanceKey::new(request.warehouse_id, request.item_id);
        let current = self.lock_balance(tx, request.tenant_id, key).await?;

        let now = Utc::now();
        let next = current
            .after_movement(direction, magnitude, now)
            .map_err(|rejection| match rejection {
                MovementRejection::Shortfall(shortfall) => LedgerError::InsufficientStock {
                    item_id: request.item_id,
                    warehouse_id: request.warehouse_id,
                    requested: shortfall.requested,
                    available: shortfall.available,
                },
                MovementRejection::Overflow { on_hand, incoming } => {
                    LedgerError::invalid_input(format!(
                        "adding {incoming} to {on_hand} of item {} in warehouse {} is out of range",
                        request.item_id, request.warehouse_id
                    ))
                }
            })?;
        let saved = tx
            .save_balance(&next, ExpectedVersion::read_at(&current))
            .await?;

        let reference = request
            .reference
            .or_else(|| request.detail.reference().map(str::to_string));
        let transaction = tx
            .append_transaction(NewTransaction {
                tenant_id: request.tenant_id,
                item_id: request.item_id,
                warehouse_id: request.warehouse_id,
                quantity: direction.signed(magnitude),
                unit_cost: request.unit_cost,
                reference,
                detail: request.detail,
                actor: request.actor,
                occurred_at: now,
                note: request.note,
            })
            .await?;
        let movement = tx
            .append_movement(NewMovement::for_transaction(&transaction))
            .await?;

        debug!(
            tenant_id = %transaction.tenant_id,
            transaction_id = %transaction.id,
            kind = %transaction.kind,
            item_id = %transaction.item_id,
            warehouse_id = %transaction.warehouse_id,
            old_quantity = %current.quantity(),
            new_quantity = %saved.quantity(),
            "posted stock movement"
        );

        Ok(Posting {
            transaction,
            movement,
            old_quantity: current.quantity(),
            new_quantity: saved.quantity(),
        })
    }

    /// Lock a balance row, or an empty unsaved one when the pair has never
    /// moved. A missing row is only accepted for an existing item and
    /// warehouse.
    pub async fn lock_balance(
        &self,
        tx: &mut dyn LedgerTx,
        tenant_id: TenantId,
        key: BalanceKey,
    ) -> LedgerResult<StockBalance> {
        if let Some(balance) = tx.lock_balance(tenant_id, key).await? {
            return Ok(balance);
        }

        let item = tx.item(key.item_id).await?;
        let warehouse = tx.warehouse(key.warehouse_id).await?;
        if item.is_none() || warehouse.is_none() {
            return Err(LedgerError::UnknownStockTarget {
                item_id: key.item_id,
                warehouse_id: key.warehouse_id,
            });
        }
        Ok(StockBalance::empty(tenant_id, key))
    }

    /// Lock several balance rows in ascending key order.
    pub async fn lock_balances(
        &self,
        tx: &mut dyn LedgerTx,
        tenant_id: TenantId,
        keys: impl IntoIterator<Item = BalanceKey>,
    ) -> LedgerResult<BTreeMap<BalanceKey, StockBalance>> {
        let ordered: BTreeSet<BalanceKey> = keys.into_iter().collect();
        let mut locked = BTreeMap::new();
        for key in ordered {
            let balance = self.lock_balance(tx, tenant_id, key).await?;
            locked.insert(key, balance);
        }
        Ok(locked)
    }

    /// Allocate `quantity` of the available stock. On-hand is unchanged and no
    /// transaction is written.
    pub async fn reserve(
        &self,
        tx: &mut dyn LedgerTx,
        tenant_id: TenantId,
        key: BalanceKey,
        quantity: Decimal,
    ) -> LedgerResult<StockBalance> {
        if quantity <= Decimal::ZERO {
            return Err(LedgerError::invalid_input(format!(
                "reservation quantity must be positive, got {quantity}"
            )));
        }
        let current = self.lock_balance(tx, tenant_id, key).await?;
        let next = current
            .reserve(quantity, Utc::now())
            .map_err(|shortfall| LedgerError::InsufficientStock {
                item_id: key.item_id,
                warehouse_id: key.warehouse_id,
                requested: shortfall.requested,
                available: shortfall.available,
            })?;
        Ok(tx
            .save_balance(&next, ExpectedVersion::read_at(&current))
            .await?)
    }

    /// Give back exactly `quantity` of a reservation.
    pub async fn release(
        &self,
        tx: &mut dyn LedgerTx,
        tenant_id: TenantId,
        key: BalanceKey,
        quantity: Decimal,
    ) -> LedgerResult<StockBalance> {
        if quantity <= Decimal::ZERO {
            return Err(LedgerError::invalid_input(format!(
                "release quantity must be positive, got {quantity}"
            )));
        }
        let current = self.lock_balance(tx, tenant_id, key).await?;
        if quantity > current.reserved() {
            return Err(LedgerError::invalid_input(format!(
                "cannot release {quantity} of {key}: only {} reserved",
                current.reserved()
            )));
        }
        let (next, _) = current.release(quantity, Utc::now());
        Ok(tx
            .save_balance(&next, ExpectedVersion::read_at(&current))
            .await?)
    }

    /// Release up to `quantity` of a reservation, e.g. when reserved stock
    /// ships. Returns the amount released; nothing is written when there is
    /// nothing to release.
    pub async fn release_up_to(
        &self,
        tx: &mut dyn LedgerTx,
        tenant_id: TenantId,
        key: BalanceKey,
        quantity: Decimal,
    ) -> LedgerResult<Decimal> {
        let current = self.lock_balance(tx, tenant_id, key).await?;
        if current.reserved().is_zero() || quantity <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        let (next, released) = current.release(quantity, Utc::now());
        tx.save_balance(&next, ExpectedVersion::read_at(&current))
            .await?;
        Ok(released)
    }
}
