use rust_decimal::Decimal;
use tracing::instrument;

use stockledger_core::{ItemId, TenantId, UserId, WarehouseId};
use stockledger_inventory::{MovementDetail, ReasonCode, Transaction};

use super::{owned_item, owned_warehouse};
use crate::ledger::{Ledger, LedgerError, LedgerResult, MovementRequest, Posting};
use crate::store::LedgerTx;

/// Manual correction of one balance. The sign of `quantity` picks the
/// direction: positive adds stock, negative removes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adjust {
    pub tenant_id: TenantId,
    pub warehouse_id: WarehouseId,
    pub item_id: ItemId,
    pub quantity: Decimal,
    pub reason: ReasonCode,
    pub actor: UserId,
    pub note: Option<String>,
}

impl Adjust {
    fn detail(&self) -> MovementDetail {
        if self.quantity.is_sign_negative() {
            MovementDetail::AdjustmentDecrease {
                reason: self.reason,
            }
        } else {
            MovementDetail::AdjustmentIncrease {
                reason: self.reason,
            }
        }
    }
}

impl Ledger {
    #[instrument(
        skip(self, cmd),
        fields(tenant_id = %cmd.tenant_id, item_id = %cmd.item_id, warehouse_id = %cmd.warehouse_id, quantity = %cmd.quantity),
        err
    )]
    pub async fn adjust(&self, cmd: Adjust) -> LedgerResult<Transaction> {
        if cmd.quantity.is_zero() {
            return Err(LedgerError::invalid_input("adjustment quantity cannot be zero"));
        }

        let cmd = &cmd;
        let posting = self
            .retry
            .run("adjust", move || self.adjust_once(cmd))
            .await?;
        self.after_commit("adjust", std::slice::from_ref(&posting));
        Ok(posting.transaction)
    }

    async fn adjust_once(&self, cmd: &Adjust) -> LedgerResult<Posting> {
        let mut tx = self.store.begin().await?;
        let result = self.adjust_in(tx.as_mut(), cmd).await;
        self.finish(tx, result).await
    }

    async fn adjust_in(&self, tx: &mut dyn LedgerTx, cmd: &Adjust) -> LedgerResult<Posting> {
        owned_warehouse(tx, cmd.tenant_id, cmd.warehouse_id).await?;
        owned_item(tx, cmd.tenant_id, cmd.item_id).await?;

        self.engine
            .apply_movement(
                tx,
                MovementRequest {
                    tenant_id: cmd.tenant_id,
                    item_id: cmd.item_id,
                    warehouse_id: cmd.warehouse_id,
                    quantity: cmd.quantity,
                    unit_cost: None,
                    reference: None,
                    detail: cmd.detail(),
                    actor: cmd.actor,
                    note: cmd.note.clone(),
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn adjust(quantity: Decimal) -> Adjust {
        Adjust {
            tenant_id: TenantId::new(),
            warehouse_id: WarehouseId::generate(),
            item_id: ItemId::generate(),
            quantity,
            reason: ReasonCode::CycleCount,
            actor: UserId::new(),
            note: None,
        }
    }

    #[test]
    fn sign_picks_the_direction() {
        assert_eq!(
            adjust(dec!(-2)).detail(),
            MovementDetail::AdjustmentDecrease {
                reason: ReasonCode::CycleCount
            }
        );
        assert_eq!(
            adjust(dec!(2)).detail(),
            MovementDetail::AdjustmentIncrease {
                reason: ReasonCode::CycleCount
            }
        );
    }
}
