//! The stock ledger: engine, unit-of-work handling, retry and publication.
//!
//! [`Ledger`] is the entry point. Each public operation runs as one unit of
//! work against the injected [`LedgerStore`]:
//!
//! ```text
//! begin → lock rows (orders first, then balances in key order) → post
//!       → commit ──→ publish StockChanged (fire-and-forget)
//!       ↘ rollback on any error; retry whole unit on ConcurrencyConflict
//! ```
//!
//! The orchestrators themselves live in [`crate::workflows`].

pub mod engine;
pub mod error;
pub mod publish;
pub mod reconcile;
pub mod retry;

use std::sync::Arc;

use tracing::{info, instrument, warn};

use stockledger_core::TenantId;
use stockledger_inventory::BalanceKey;

use crate::store::{LedgerStore, LedgerTx, TransactionFilter};

pub use crate::workflows::{
    Adjust, CancelPurchaseOrder, CancelSaleOrder, FulfillSale, OpenPurchaseOrder, OpenSaleOrder,
    Produce, ProductionRun, ReceiptLine, ReceivePurchase, ReleaseStock, ReserveStock,
    ShipmentLine, Transfer, TransferResult,
};
pub use engine::{LedgerEngine, MovementRequest, Posting};
pub use error::{IngredientShortfall, LedgerError, LedgerResult};
pub use publish::{BusSink, NoopSink, PublishError, RecordingSink, StockEventSink};
pub use reconcile::Reconciliation;
pub use retry::{BackoffStrategy, RetryPolicy};

/// Ledger facade: store handle, event sink and retry policy.
///
/// Cheap to clone; clones share the store and the sink.
#[derive(Clone)]
pub struct Ledger {
    pub(crate) store: Arc<dyn LedgerStore>,
    pub(crate) sink: Arc<dyn StockEventSink>,
    pub(crate) engine: LedgerEngine,
    pub(crate) retry: RetryPolicy,
}

impl core::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ledger")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, sink: Arc<dyn StockEventSink>) -> Self {
        Self {
            store,
            sink,
            engine: LedgerEngine::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Post a single movement in its own unit of work.
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, kind = %request.detail.kind()), err)]
    pub async fn post(&self, request: MovementRequest) -> LedgerResult<Posting> {
        let request = &request;
        let posting = self
            .retry
            .run("post", move || self.post_once(request))
            .await?;
        self.after_commit("post", std::slice::from_ref(&posting));
        Ok(posting)
    }

    async fn post_once(&self, request: &MovementRequest) -> LedgerResult<Posting> {
        let mut tx = self.store.begin().await?;
        let result = self.engine.apply_movement(tx.as_mut(), request.clone()).await;
        self.finish(tx, result).await
    }

    /// Compare the stored balance of `key` against its transaction and
    /// movement logs.
    pub async fn reconcile(
        &self,
        tenant_id: TenantId,
        key: BalanceKey,
    ) -> LedgerResult<Reconciliation> {
        let balance = self
            .store
            .balance(tenant_id, key)
            .await?
            .map(|b| b.quantity())
            .unwrap_or_default();
        let transactions = self
            .store
            .transactions(tenant_id, &TransactionFilter::for_key(key))
            .await?;
        let movements = self.store.movements(tenant_id, key).await?;
        Ok(reconcile::reconcile_key(
            tenant_id,
            key,
            balance,
            &transactions,
            &movements,
        ))
    }

    /// Reconcile every balance row of a tenant.
    #[instrument(skip(self), err)]
    pub async fn reconcile_tenant(&self, tenant_id: TenantId) -> LedgerResult<Vec<Reconciliation>> {
        let balances = self.store.balances(tenant_id).await?;
        let mut report = Vec::with_capacity(balances.len());
        for balance in balances {
            let rec = self.reconcile(tenant_id, balance.key()).await?;
            if !rec.is_consistent() {
                warn!(
                    key = %rec.key,
                    balance = %rec.balance,
                    transaction_sum = %rec.transaction_sum,
                    movement_sum = %rec.movement_sum,
                    "balance does not match its ledger"
                );
            }
            report.push(rec);
        }
        Ok(report)
    }

    /// Commit on success, roll back on failure.
    pub(crate) async fn finish<T>(
        &self,
        mut tx: Box<dyn LedgerTx>,
        result: LedgerResult<T>,
    ) -> LedgerResult<T> {
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Log the commit, then hand its postings to the sink. Sink failures are
    /// logged and dropped.
    pub(crate) fn after_commit(&self, operation: &'static str, postings: &[Posting]) {
        info!(operation, postings = postings.len(), "unit of work committed");
        for posting in postings {
            let event = posting.stock_changed();
            if let Err(err) = self.sink.publish(&event) {
                warn!(
                    tenant_id = %event.tenant_id,
                    transaction_id = %event.transaction_id,
                    error = %err,
                    "dropping stock-changed event"
                );
            }
        }
    }
}
