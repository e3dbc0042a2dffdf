use rust_decimal::Decimal;
use tracing::instrument;

use stockledger_core::{ExpectedVersion, ItemId, PurchaseOrderId, TenantId, UserId, WarehouseId};
use stockledger_inventory::{BalanceKey, MovementDetail, Transaction};

use super::{owned_item, owned_warehouse, require_positive};
use crate::ledger::{Ledger, LedgerError, LedgerResult, MovementRequest, Posting};
use crate::store::LedgerTx;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptLine {
    pub item_id: ItemId,
    pub warehouse_id: WarehouseId,
    pub quantity: Decimal,
}

/// Goods received against a purchase order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivePurchase {
    pub tenant_id: TenantId,
    pub purchase_order_id: PurchaseOrderId,
    pub lines: Vec<ReceiptLine>,
    pub actor: UserId,
    pub note: Option<String>,
}

impl Ledger {
    /// Post a whole receipt: every line or none.
    ///
    /// Each line is booked at the order line's agreed unit cost. The order's
    /// received quantities and status are updated in the same unit of work.
    #[instrument(
        skip(self, cmd),
        fields(tenant_id = %cmd.tenant_id, purchase_order_id = %cmd.purchase_order_id, lines = cmd.lines.len()),
        err
    )]
    pub async fn receive_purchase(&self, cmd: ReceivePurchase) -> LedgerResult<Vec<Transaction>> {
        if cmd.lines.is_empty() {
            return Err(LedgerError::invalid_input("receipt has no lines"));
        }
        for line in &cmd.lines {
            require_positive("receipt", line.quantity)?;
        }

        let cmd = &cmd;
        let postings = self
            .retry
            .run("receive_purchase", move || self.receive_purchase_once(cmd))
            .await?;
        self.after_commit("receive_purchase", &postings);
        Ok(postings.into_iter().map(|p| p.transaction).collect())
    }

    async fn receive_purchase_once(&self, cmd: &ReceivePurchase) -> LedgerResult<Vec<Posting>> {
        let mut tx = self.store.begin().await?;
        let result = self.receive_purchase_in(tx.as_mut(), cmd).await;
        self.finish(tx, result).await
    }

    async fn receive_purchase_in(
        &self,
        tx: &mut dyn LedgerTx,
        cmd: &ReceivePurchase,
    ) -> LedgerResult<Vec<Posting>> {
        let po_id = cmd.purchase_order_id;
        let mut order = tx
            .lock_purchase_order(po_id)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("purchase order {po_id}")))?;
        if order.tenant_id() != cmd.tenant_id {
            return Err(LedgerError::cross_tenant(format!(
                "purchase order {po_id} does not belong to tenant {}",
                cmd.tenant_id
            )));
        }

        for line in &cmd.lines {
            owned_item(tx, cmd.tenant_id, line.item_id).await?;
            owned_warehouse(tx, cmd.tenant_id, line.warehouse_id).await?;
        }

        let mut received = Vec::with_capacity(cmd.lines.len());
        for line in &cmd.lines {
            let accepted = order
                .receive(line.item_id, line.quantity)
                .map_err(|rejection| LedgerError::from_receipt(po_id, rejection))?;
            received.push(accepted);
        }

        self.engine
            .lock_balances(
                tx,
                cmd.tenant_id,
                cmd.lines
                    .iter()
                    .map(|l| BalanceKey::new(l.warehouse_id, l.item_id)),
            )
            .await?;

        let mut postings = Vec::with_capacity(cmd.lines.len());
        for (line, accepted) in cmd.lines.iter().zip(received) {
            let posting = self
                .engine
                .apply_movement(
                    tx,
                    MovementRequest {
                        tenant_id: cmd.tenant_id,
                        item_id: line.item_id,
                        warehouse_id: line.warehouse_id,
                        quantity: line.quantity,
                        unit_cost: Some(accepted.unit_cost),
                        reference: Some(po_id.to_string()),
                        detail: MovementDetail::PurchaseReceipt {
                            purchase_order_id: po_id,
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
        tx.save_purchase_order(&order, ExpectedVersion::read_at(&order))
            .await?;
        Ok(postings)
    }
}
