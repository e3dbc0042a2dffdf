use rust_decimal::Decimal;
use tracing::instrument;
use uuid::Uuid;

use stockledger_core::{ItemId, TenantId, UserId, WarehouseId};
use stockledger_inventory::{BalanceKey, MovementDetail, Transaction};

use super::{owned_item, owned_warehouse, require_positive};
use crate::ledger::{Ledger, LedgerError, LedgerResult, MovementRequest, Posting};
use crate::store::LedgerTx;

/// Move stock of one item between two warehouses of the same tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub tenant_id: TenantId,
    pub from_warehouse_id: WarehouseId,
    pub to_warehouse_id: WarehouseId,
    pub item_id: ItemId,
    pub quantity: Decimal,
    pub actor: UserId,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    /// Shared by both legs.
    pub reference: String,
    /// `[out, in]`.
    pub transactions: Vec<Transaction>,
}

fn transfer_reference() -> String {
    format!("TRF-{}", Uuid::now_v7())
}

impl Ledger {
    /// Post both legs of a transfer in one unit of work.
    #[instrument(
        skip(self, cmd),
        fields(tenant_id = %cmd.tenant_id, item_id = %cmd.item_id, from = %cmd.from_warehouse_id, to = %cmd.to_warehouse_id),
        err
    )]
    pub async fn transfer(&self, cmd: Transfer) -> LedgerResult<TransferResult> {
        require_positive("transfer", cmd.quantity)?;
        if cmd.from_warehouse_id == cmd.to_warehouse_id {
            return Err(LedgerError::invalid_input(format!(
                "transfer source and destination are both warehouse {}",
                cmd.from_warehouse_id
            )));
        }

        let cmd = &cmd;
        let postings = self
            .retry
            .run("transfer", move || self.transfer_once(cmd, transfer_reference()))
            .await?;
        self.after_commit("transfer", &postings);

        let reference = postings
            .first()
            .and_then(|p| p.transaction.reference.clone())
            .unwrap_or_default();
        Ok(TransferResult {
            reference,
            transactions: postings.into_iter().map(|p| p.transaction).collect(),
        })
    }

    async fn transfer_once(&self, cmd: &Transfer, reference: String) -> LedgerResult<Vec<Posting>> {
        let mut tx = self.store.begin().await?;
        let result = self.transfer_in(tx.as_mut(), cmd, reference).await;
        self.finish(tx, result).await
    }

    async fn transfer_in(
        &self,
        tx: &mut dyn LedgerTx,
        cmd: &Transfer,
        reference: String,
    ) -> LedgerResult<Vec<Posting>> {
        owned_warehouse(tx, cmd.tenant_id, cmd.from_warehouse_id).await?;
        owned_warehouse(tx, cmd.tenant_id, cmd.to_warehouse_id).await?;
        owned_item(tx, cmd.tenant_id, cmd.item_id).await?;

        let source = BalanceKey::new(cmd.from_warehouse_id, cmd.item_id);
        let destination = BalanceKey::new(cmd.to_warehouse_id, cmd.item_id);
        self.engine
            .lock_balances(tx, cmd.tenant_id, [source, destination])
            .await?;

        let out = self
            .engine
            .apply_movement(
                tx,
                MovementRequest {
                    tenant_id: cmd.tenant_id,
                    item_id: cmd.item_id,
                    warehouse_id: cmd.from_warehouse_id,
                    quantity: cmd.quantity,
                    unit_cost: None,
                    reference: None,
                    detail: MovementDetail::TransferOut {
                        reference: reference.clone(),
                        counterpart: cmd.to_warehouse_id,
                    },
                    actor: cmd.actor,
                    note: cmd.note.clone(),
                },
            )
            .await?;
        let inbound = self
            .engine
            .apply_movement(
                tx,
                MovementRequest {
                    tenant_id: cmd.tenant_id,
                    item_id: cmd.item_id,
                    warehouse_id: cmd.to_warehouse_id,
                    quantity: cmd.quantity,
                    unit_cost: None,
                    reference: None,
                    detail: MovementDetail::TransferIn {
                        reference,
                        counterpart: cmd.from_warehouse_id,
                    },
                    actor: cmd.actor,
                    note: cmd.note.clone(),
                },
            )
            .await?;
        Ok(vec![out, inbound])
    }
}
