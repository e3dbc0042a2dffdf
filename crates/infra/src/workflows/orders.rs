//! Order lifecycle outside of receipts and shipments. No stock moves here.

use chrono::Utc;
use tracing::{info, instrument};

use stockledger_core::{AggregateRoot, ExpectedVersion, PurchaseOrderId, SaleOrderId, TenantId, UserId};
use stockledger_purchasing::{NewPurchaseLine, PurchaseOrder};
use stockledger_sales::{NewSaleLine, SaleOrder};

use super::owned_item;
use crate::ledger::{Ledger, LedgerError, LedgerResult};
use crate::store::LedgerTx;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPurchaseOrder {
    pub tenant_id: TenantId,
    pub lines: Vec<NewPurchaseLine>,
    pub actor: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSaleOrder {
    pub tenant_id: TenantId,
    pub lines: Vec<NewSaleLine>,
    pub actor: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelPurchaseOrder {
    pub tenant_id: TenantId,
    pub purchase_order_id: PurchaseOrderId,
    pub actor: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelSaleOrder {
    pub tenant_id: TenantId,
    pub sale_order_id: SaleOrderId,
    pub actor: UserId,
}

impl Ledger {
    /// Create a PENDING purchase order. Returns it as stored.
    #[instrument(skip(self, cmd), fields(tenant_id = %cmd.tenant_id, lines = cmd.lines.len()), err)]
    pub async fn open_purchase_order(&self, cmd: OpenPurchaseOrder) -> LedgerResult<PurchaseOrder> {
        let order = PurchaseOrder::new(
            PurchaseOrderId::generate(),
            cmd.tenant_id,
            cmd.lines.clone(),
            Utc::now(),
        )?;
        let order = &order;
        let stored = self
            .retry
            .run("open_purchase_order", move || async move {
                let mut tx = self.store.begin().await?;
                let result = self.open_purchase_order_in(tx.as_mut(), order).await;
                self.finish(tx, result).await
            })
            .await?;
        info!(purchase_order_id = %stored.order_id(), actor = %cmd.actor, "purchase order opened");
        Ok(stored)
    }

    async fn open_purchase_order_in(
        &self,
        tx: &mut dyn LedgerTx,
        order: &PurchaseOrder,
    ) -> LedgerResult<PurchaseOrder> {
        for line in order.lines() {
            owned_item(tx, order.tenant_id(), line.item_id).await?;
        }
        Ok(tx.insert_purchase_order(order).await?)
    }

    /// Create a PENDING sale order. Returns it as stored.
    #[instrument(skip(self, cmd), fields(tenant_id = %cmd.tenant_id, lines = cmd.lines.len()), err)]
    pub async fn open_sale_order(&self, cmd: OpenSaleOrder) -> LedgerResult<SaleOrder> {
        let order = SaleOrder::new(
            SaleOrderId::generate(),
            cmd.tenant_id,
            cmd.lines.clone(),
            Utc::now(),
        )?;
        let order = &order;
        let stored = self
            .retry
            .run("open_sale_order", move || async move {
                let mut tx = self.store.begin().await?;
                let result = self.open_sale_order_in(tx.as_mut(), order).await;
                self.finish(tx, result).await
            })
            .await?;
        info!(sale_order_id = %stored.order_id(), actor = %cmd.actor, "sale order opened");
        Ok(stored)
    }

    async fn open_sale_order_in(
        &self,
        tx: &mut dyn LedgerTx,
        order: &SaleOrder,
    ) -> LedgerResult<SaleOrder> {
        for line in order.lines() {
            owned_item(tx, order.tenant_id(), line.item_id).await?;
        }
        Ok(tx.insert_sale_order(order).await?)
    }

    /// Move an open purchase order to CANCELLED. Received stock stays.
    #[instrument(skip(self, cmd), fields(tenant_id = %cmd.tenant_id, purchase_order_id = %cmd.purchase_order_id), err)]
    pub async fn cancel_purchase_order(&self, cmd: CancelPurchaseOrder) -> LedgerResult<PurchaseOrder> {
        let cmd = &cmd;
        let cancelled = self
            .retry
            .run("cancel_purchase_order", move || async move {
                let mut tx = self.store.begin().await?;
                let result = self.cancel_purchase_order_in(tx.as_mut(), cmd).await;
                self.finish(tx, result).await
            })
            .await?;
        info!(actor = %cmd.actor, "purchase order cancelled");
        Ok(cancelled)
    }

    async fn cancel_purchase_order_in(
        &self,
        tx: &mut dyn LedgerTx,
        cmd: &CancelPurchaseOrder,
    ) -> LedgerResult<PurchaseOrder> {
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
        let read_version = order.version();
        order.cancel()?;
        tx.save_purchase_order(&order, ExpectedVersion::Exact(read_version))
            .await?;
        Ok(PurchaseOrder::restore(
            po_id,
            order.tenant_id(),
            order.status(),
            order.lines().to_vec(),
            read_version + 1,
            order.created_at(),
        )?)
    }

    /// Move an open sale order to CANCELLED. Shipped stock stays shipped.
    #[instrument(skip(self, cmd), fields(tenant_id = %cmd.tenant_id, sale_order_id = %cmd.sale_order_id), err)]
    pub async fn cancel_sale_order(&self, cmd: CancelSaleOrder) -> LedgerResult<SaleOrder> {
        let cmd = &cmd;
        let cancelled = self
            .retry
            .run("cancel_sale_order", move || async move {
                let mut tx = self.store.begin().await?;
                let result = self.cancel_sale_order_in(tx.as_mut(), cmd).await;
                self.finish(tx, result).await
            })
            .await?;
        info!(actor = %cmd.actor, "sale order cancelled");
        Ok(cancelled)
    }

    async fn cancel_sale_order_in(
        &self,
        tx: &mut dyn LedgerTx,
        cmd: &CancelSaleOrder,
    ) -> LedgerResult<SaleOrder> {
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
        let read_version = order.version();
        order.cancel()?;
        tx.save_sale_order(&order, ExpectedVersion::Exact(read_version))
            .await?;
        Ok(SaleOrder::restore(
            so_id,
            order.tenant_id(),
            order.status(),
            order.lines().to_vec(),
            read_version + 1,
            order.created_at(),
        )?)
    }
}
