use async_trait::async_trait;
use thiserror::Error;

use stockledger_core::{
    BatchId, ExpectedVersion, ItemId, PurchaseOrderId, RecipeId, SaleOrderId, TenantId,
    WarehouseId,
};
use stockledger_inventory::{
    BalanceKey, Item, Movement, NewMovement, NewTransaction, StockBalance, Transaction,
    TransactionKind, Warehouse,
};
use stockledger_production::{ProductionBatch, Recipe};
use stockledger_purchasing::PurchaseOrder;
use stockledger_sales::SaleOrder;

/// Store operation error.
///
/// These are **infrastructure errors** (locking, storage, decoding) as opposed
/// to domain errors. The ledger turns `LockTimeout` and `Conflict` into a
/// retryable concurrency conflict.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A row lock could not be acquired within the lock timeout.
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    /// Version mismatch, concurrent insert, serialization failure or deadlock.
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("storage backend failure: {0}")]
    Backend(String),

    /// A stored row could not be turned back into a domain value.
    #[error("failed to decode stored row: {0}")]
    Decode(String),
}

/// Filter over the append-only transaction log of one tenant.
///
/// Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub item_id: Option<ItemId>,
    pub warehouse_id: Option<WarehouseId>,
    pub kind: Option<TransactionKind>,
    pub reference: Option<String>,
}

impl TransactionFilter {
    pub fn for_key(key: BalanceKey) -> Self {
        Self {
            item_id: Some(key.item_id),
            warehouse_id: Some(key.warehouse_id),
            ..Self::default()
        }
    }

    pub fn with_reference(reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, transaction: &Transaction) -> bool {
        self.item_id.is_none_or(|id| id == transaction.item_id)
            && self.warehouse_id.is_none_or(|id| id == transaction.warehouse_id)
            && self.kind.is_none_or(|kind| kind == transaction.kind)
            && self
                .reference
                .as_deref()
                .is_none_or(|r| transaction.reference.as_deref() == Some(r))
    }
}

/// Ledger storage boundary.
///
/// The handle is injected into the ledger (no process-wide store). Every
/// stock-affecting operation runs inside one [`LedgerTx`] obtained from
/// [`LedgerStore::begin`]. The remaining methods are lock-free reads of
/// committed state for audit and reconciliation.
///
/// ## Implementation Requirements
///
/// - all rows are scoped by tenant; lookups by id return the row whatever its
///   tenant, so callers can detect cross-tenant references
/// - transactions and movements are append-only
/// - nothing written through a `LedgerTx` is visible before it commits
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a unit of work.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError>;

    /// Committed balance of one key, without locking.
    async fn balance(
        &self,
        tenant_id: TenantId,
        key: BalanceKey,
    ) -> Result<Option<StockBalance>, StoreError>;

    /// Every committed balance row of a tenant, ordered by key.
    async fn balances(&self, tenant_id: TenantId) -> Result<Vec<StockBalance>, StoreError>;

    /// Committed transactions of a tenant in id order.
    async fn transactions(
        &self,
        tenant_id: TenantId,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Committed movements of one balance key in id order.
    async fn movements(
        &self,
        tenant_id: TenantId,
        key: BalanceKey,
    ) -> Result<Vec<Movement>, StoreError>;

    async fn purchase_order(
        &self,
        id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError>;

    async fn sale_order(&self, id: SaleOrderId) -> Result<Option<SaleOrder>, StoreError>;

    async fn batch(&self, id: BatchId) -> Result<Option<ProductionBatch>, StoreError>;
}

/// One unit of work: every write is committed or discarded together.
///
/// `lock_*` reads take a row lock that is held until commit or rollback,
/// waiting at most the store's lock timeout (`StoreError::LockTimeout`).
/// Locking an already-locked row again within the same unit is a no-op.
/// `save_*` writes require the row lock and check the expected version; a
/// successful save bumps the stored version by one.
///
/// Dropping an unfinished unit of work discards it.
#[async_trait]
pub trait LedgerTx: Send {
    /// Master data, read-only to the ledger.
    async fn item(&mut self, id: ItemId) -> Result<Option<Item>, StoreError>;

    async fn warehouse(&mut self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError>;

    async fn recipe(&mut self, id: RecipeId) -> Result<Option<Recipe>, StoreError>;

    /// Lock-read a balance row. `None` when the row does not exist yet; the
    /// lock is held anyway so a lazy insert cannot race.
    async fn lock_balance(
        &mut self,
        tenant_id: TenantId,
        key: BalanceKey,
    ) -> Result<Option<StockBalance>, StoreError>;

    /// Insert (expected version 0) or update a balance row. Returns the row as
    /// stored, with its new version.
    async fn save_balance(
        &mut self,
        balance: &StockBalance,
        expected: ExpectedVersion,
    ) -> Result<StockBalance, StoreError>;

    /// Append a transaction; the store assigns its id.
    async fn append_transaction(
        &mut self,
        transaction: NewTransaction,
    ) -> Result<Transaction, StoreError>;

    async fn append_movement(&mut self, movement: NewMovement) -> Result<Movement, StoreError>;

    async fn insert_purchase_order(
        &mut self,
        order: &PurchaseOrder,
    ) -> Result<PurchaseOrder, StoreError>;

    async fn lock_purchase_order(
        &mut self,
        id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError>;

    async fn save_purchase_order(
        &mut self,
        order: &PurchaseOrder,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    async fn insert_sale_order(&mut self, order: &SaleOrder) -> Result<SaleOrder, StoreError>;

    async fn lock_sale_order(&mut self, id: SaleOrderId) -> Result<Option<SaleOrder>, StoreError>;

    async fn save_sale_order(
        &mut self,
        order: &SaleOrder,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    /// Insert a new batch. Returns it as stored (version 1, row locked).
    async fn insert_batch(
        &mut self,
        batch: &ProductionBatch,
    ) -> Result<ProductionBatch, StoreError>;

    async fn save_batch(
        &mut self,
        batch: &ProductionBatch,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}
