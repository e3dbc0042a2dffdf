use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use stockledger_core::{
    AggregateRoot, BatchId, ExpectedVersion, ItemId, PurchaseOrderId, RecipeId, SaleOrderId,
    TenantId, WarehouseId,
};
use stockledger_inventory::{
    BalanceKey, Item, Movement, MovementId, NewMovement, NewTransaction, StockBalance,
    Transaction, TransactionId, Warehouse,
};
use stockledger_production::{ProductionBatch, Recipe};
use stockledger_purchasing::PurchaseOrder;
use stockledger_sales::SaleOrder;

use super::r#trait::{LedgerStore, LedgerTx, StoreError, TransactionFilter};

/// Lock timeout used when none is configured.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(2000);

/// Lockable row identity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Balance(TenantId, BalanceKey),
    PurchaseOrder(PurchaseOrderId),
    SaleOrder(SaleOrderId),
    Batch(BatchId),
}

#[derive(Debug, Default)]
struct State {
    items: HashMap<ItemId, Item>,
    warehouses: HashMap<WarehouseId, Warehouse>,
    recipes: HashMap<RecipeId, Recipe>,
    balances: BTreeMap<(TenantId, BalanceKey), StockBalance>,
    transactions: Vec<Transaction>,
    movements: Vec<Movement>,
    purchase_orders: HashMap<PurchaseOrderId, PurchaseOrder>,
    sale_orders: HashMap<SaleOrderId, SaleOrder>,
    batches: HashMap<BatchId, ProductionBatch>,
}

#[derive(Debug)]
struct Shared {
    state: RwLock<State>,
    row_locks: Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>,
    next_transaction_id: AtomicI64,
    next_movement_id: AtomicI64,
    lock_timeout: Duration,
}

impl Shared {
    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn row_mutex(&self, row: RowKey) -> Result<Arc<tokio::sync::Mutex<()>>, StoreError> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        Ok(locks.entry(row).or_default().clone())
    }

    /// Drop `guards` and forget every released row nobody else is waiting on.
    fn release(&self, guards: &mut HashMap<RowKey, OwnedMutexGuard<()>>) {
        if guards.is_empty() {
            return;
        }
        let rows: Vec<RowKey> = guards.drain().map(|(row, _)| row).collect();
        let Ok(mut locks) = self.row_locks.lock() else {
            return;
        };
        for row in rows {
            // Waiters and holders keep their own clone of the mutex.
            let idle = locks.get(&row).is_some_and(|m| Arc::strong_count(m) == 1);
            if idle {
                locks.remove(&row);
            }
        }
    }
}

/// In-memory ledger store.
///
/// Intended for tests/dev. Row locks are per-row async mutexes held by the
/// unit of work until it finishes; writes are staged in the unit of work and
/// applied under one write lock on commit.
///
/// Cloning is cheap and shares the underlying state.
#[derive(Debug, Clone)]
pub struct InMemoryLedgerStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    #[cfg(test)]
    pub(crate) fn tracked_row_locks(&self) -> usize {
        self.shared.row_locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State::default()),
                row_locks: Mutex::new(HashMap::new()),
                next_transaction_id: AtomicI64::new(1),
                next_movement_id: AtomicI64::new(1),
                lock_timeout,
            }),
        }
    }

    pub fn insert_item(&self, item: Item) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.items.insert(item.id, item);
        Ok(())
    }

    pub fn insert_warehouse(&self, warehouse: Warehouse) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.warehouses.insert(warehouse.id, warehouse);
        Ok(())
    }

    pub fn insert_recipe(&self, recipe: Recipe) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.recipes.insert(recipe.id, recipe);
        Ok(())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.shared
            .state
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        Ok(Box::new(InMemoryLedgerTx {
            shared: Arc::clone(&self.shared),
            guards: HashMap::new(),
            staged: State::default(),
            finished: false,
        }))
    }

    async fn balance(
        &self,
        tenant_id: TenantId,
        key: BalanceKey,
    ) -> Result<Option<StockBalance>, StoreError> {
        Ok(self.shared.read()?.balances.get(&(tenant_id, key)).cloned())
    }

    async fn balances(&self, tenant_id: TenantId) -> Result<Vec<StockBalance>, StoreError> {
        Ok(self
            .shared
            .read()?
            .balances
            .iter()
            .filter(|((tenant, _), _)| *tenant == tenant_id)
            .map(|(_, balance)| balance.clone())
            .collect())
    }

    async fn transactions(
        &self,
        tenant_id: TenantId,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>, StoreError> {
        let mut found: Vec<Transaction> = self
            .shared
            .read()?
            .transactions
            .iter()
            .filter(|t| t.tenant_id == tenant_id && filter.matches(t))
            .cloned()
            .collect();
        found.sort_by_key(|t| t.id);
        Ok(found)
    }

    async fn movements(
        &self,
        tenant_id: TenantId,
        key: BalanceKey,
    ) -> Result<Vec<Movement>, StoreError> {
        let mut found: Vec<Movement> = self
            .shared
            .read()?
            .movements
            .iter()
            .filter(|m| {
                m.tenant_id == tenant_id
                    && m.item_id == key.item_id
                    && m.warehouse_id == key.warehouse_id
            })
            .cloned()
            .collect();
        found.sort_by_key(|m| m.id);
        Ok(found)
    }

    async fn purchase_order(
        &self,
        id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        Ok(self.shared.read()?.purchase_orders.get(&id).cloned())
    }

    async fn sale_order(&self, id: SaleOrderId) -> Result<Option<SaleOrder>, StoreError> {
        Ok(self.shared.read()?.sale_orders.get(&id).cloned())
    }

    async fn batch(&self, id: BatchId) -> Result<Option<ProductionBatch>, StoreError> {
        Ok(self.shared.read()?.batches.get(&id).cloned())
    }
}

/// Unit of work over [`InMemoryLedgerStore`].
pub struct InMemoryLedgerTx {
    shared: Arc<Shared>,
    guards: HashMap<RowKey, OwnedMutexGuard<()>>,
    staged: State,
    finished: bool,
}

impl InMemoryLedgerTx {
    async fn lock_row(&mut self, row: RowKey) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.guards.contains_key(&row) {
            return Ok(());
        }
        let mutex = self.shared.row_mutex(row)?;
        let guard = tokio::time::timeout(self.shared.lock_timeout, mutex.lock_owned())
            .await
            .map_err(|_| {
                StoreError::LockTimeout(format!(
                    "{row:?} not acquired within {:?}",
                    self.shared.lock_timeout
                ))
            })?;
        self.guards.insert(row, guard);
        Ok(())
    }

    fn ensure_locked(&self, row: RowKey) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.guards.contains_key(&row) {
            Ok(())
        } else {
            Err(StoreError::Conflict(format!("{row:?} written without its lock")))
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            Err(StoreError::Backend("unit of work already finished".to_string()))
        } else {
            Ok(())
        }
    }

    fn current_balance(
        &self,
        tenant_id: TenantId,
        key: BalanceKey,
    ) -> Result<Option<StockBalance>, StoreError> {
        if let Some(staged) = self.staged.balances.get(&(tenant_id, key)) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.shared.read()?.balances.get(&(tenant_id, key)).cloned())
    }

    fn current_purchase_order(
        &self,
        id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        if let Some(staged) = self.staged.purchase_orders.get(&id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.shared.read()?.purchase_orders.get(&id).cloned())
    }

    fn current_sale_order(&self, id: SaleOrderId) -> Result<Option<SaleOrder>, StoreError> {
        if let Some(staged) = self.staged.sale_orders.get(&id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.shared.read()?.sale_orders.get(&id).cloned())
    }

    fn current_batch(&self, id: BatchId) -> Result<Option<ProductionBatch>, StoreError> {
        if let Some(staged) = self.staged.batches.get(&id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.shared.read()?.batches.get(&id).cloned())
    }
}

fn check_version(
    row: &str,
    expected: ExpectedVersion,
    current: u64,
) -> Result<(), StoreError> {
    if expected.matches(current) {
        Ok(())
    } else {
        Err(StoreError::Conflict(format!(
            "{row}: expected {expected:?}, found {current}"
        )))
    }
}

fn decode(err: stockledger_core::DomainError) -> StoreError {
    StoreError::Decode(err.to_string())
}

#[async_trait]
impl LedgerTx for InMemoryLedgerTx {
    async fn item(&mut self, id: ItemId) -> Result<Option<Item>, StoreError> {
        Ok(self.shared.read()?.items.get(&id).cloned())
    }

    async fn warehouse(&mut self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError> {
        Ok(self.shared.read()?.warehouses.get(&id).cloned())
    }

    async fn recipe(&mut self, id: RecipeId) -> Result<Option<Recipe>, StoreError> {
        Ok(self.shared.read()?.recipes.get(&id).cloned())
    }

    async fn lock_balance(
        &mut self,
        tenant_id: TenantId,
        key: BalanceKey,
    ) -> Result<Option<StockBalance>, StoreError> {
        self.lock_row(RowKey::Balance(tenant_id, key)).await?;
        self.current_balance(tenant_id, key)
    }

    async fn save_balance(
        &mut self,
        balance: &StockBalance,
        expected: ExpectedVersion,
    ) -> Result<StockBalance, StoreError> {
        let (tenant_id, key) = (balance.tenant_id(), balance.key());
        self.ensure_locked(RowKey::Balance(tenant_id, key))?;

        let current = self
            .current_balance(tenant_id, key)?
            .map(|b| b.version())
            .unwrap_or(0);
        check_version(&format!("balance {key}"), expected, current)?;

        let stored = StockBalance::restore(
            tenant_id,
            key,
            balance.quantity(),
            balance.reserved(),
            current + 1,
            balance.updated_at(),
        )
        .map_err(decode)?;
        self.staged
            .balances
            .insert((tenant_id, key), stored.clone());
        Ok(stored)
    }

    async fn append_transaction(
        &mut self,
        transaction: NewTransaction,
    ) -> Result<Transaction, StoreError> {
        self.ensure_open()?;
        let id = self
            .shared
            .next_transaction_id
            .fetch_add(1, Ordering::SeqCst);
        let committed = transaction.into_committed(TransactionId(id));
        self.staged.transactions.push(committed.clone());
        Ok(committed)
    }

    async fn append_movement(&mut self, movement: NewMovement) -> Result<Movement, StoreError> {
        self.ensure_open()?;
        let id = self.shared.next_movement_id.fetch_add(1, Ordering::SeqCst);
        let committed = movement.into_committed(MovementId(id));
        self.staged.movements.push(committed.clone());
        Ok(committed)
    }

    async fn insert_purchase_order(
        &mut self,
        order: &PurchaseOrder,
    ) -> Result<PurchaseOrder, StoreError> {
        let id = *order.id();
        self.lock_row(RowKey::PurchaseOrder(id)).await?;
        if self.current_purchase_order(id)?.is_some() {
            return Err(StoreError::Conflict(format!("purchase order {id} already exists")));
        }
        let stored = PurchaseOrder::restore(
            id,
            order.tenant_id(),
            order.status(),
            order.lines().to_vec(),
            1,
            order.created_at(),
        )
        .map_err(decode)?;
        self.staged.purchase_orders.insert(id, stored.clone());
        Ok(stored)
    }

    async fn lock_purchase_order(
        &mut self,
        id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        self.lock_row(RowKey::PurchaseOrder(id)).await?;
        self.current_purchase_order(id)
    }

    async fn save_purchase_order(
        &mut self,
        order: &PurchaseOrder,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let id = *order.id();
        self.ensure_locked(RowKey::PurchaseOrder(id))?;
        let current = self
            .current_purchase_order(id)?
            .ok_or_else(|| StoreError::NotFound(format!("purchase order {id}")))?
            .version();
        check_version(&format!("purchase order {id}"), expected, current)?;

        let stored = PurchaseOrder::restore(
            id,
            order.tenant_id(),
            order.status(),
            order.lines().to_vec(),
            current + 1,
            order.created_at(),
        )
        .map_err(decode)?;
        self.staged.purchase_orders.insert(id, stored);
        Ok(())
    }

    async fn insert_sale_order(&mut self, order: &SaleOrder) -> Result<SaleOrder, StoreError> {
        let id = *order.id();
        self.lock_row(RowKey::SaleOrder(id)).await?;
        if self.current_sale_order(id)?.is_some() {
            return Err(StoreError::Conflict(format!("sale order {id} already exists")));
        }
        let stored = SaleOrder::restore(
            id,
            order.tenant_id(),
            order.status(),
            order.lines().to_vec(),
            1,
            order.created_at(),
        )
        .map_err(decode)?;
        self.staged.sale_orders.insert(id, stored.clone());
        Ok(stored)
    }

    async fn lock_sale_order(&mut self, id: SaleOrderId) -> Result<Option<SaleOrder>, StoreError> {
        self.lock_row(RowKey::SaleOrder(id)).await?;
        self.current_sale_order(id)
    }

    async fn save_sale_order(
        &mut self,
        order: &SaleOrder,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let id = *order.id();
        self.ensure_locked(RowKey::SaleOrder(id))?;
        let current = self
            .current_sale_order(id)?
            .ok_or_else(|| StoreError::NotFound(format!("sale order {id}")))?
            .version();
        check_version(&format!("sale order {id}"), expected, current)?;

        let stored = SaleOrder::restore(
            id,
            order.tenant_id(),
            order.status(),
            order.lines().to_vec(),
            current + 1,
            order.created_at(),
        )
        .map_err(decode)?;
        self.staged.sale_orders.insert(id, stored);
        Ok(())
    }

    async fn insert_batch(
        &mut self,
        batch: &ProductionBatch,
    ) -> Result<ProductionBatch, StoreError> {
        let id = batch.batch_id();
        self.lock_row(RowKey::Batch(id)).await?;
        if self.current_batch(id)?.is_some() {
            return Err(StoreError::Conflict(format!("batch {id} already exists")));
        }
        let stored = with_batch_version(batch, 1);
        self.staged.batches.insert(id, stored.clone());
        Ok(stored)
    }

    async fn save_batch(
        &mut self,
        batch: &ProductionBatch,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let id = batch.batch_id();
        self.ensure_locked(RowKey::Batch(id))?;
        let current = self
            .current_batch(id)?
            .ok_or_else(|| StoreError::NotFound(format!("batch {id}")))?
            .version();
        check_version(&format!("batch {id}"), expected, current)?;
        self.staged
            .batches
            .insert(id, with_batch_version(batch, current + 1));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let staged = std::mem::take(&mut self.staged);
        {
            let mut state = self
                .shared
                .state
                .write()
                .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
            state.balances.extend(staged.balances);
            state.transactions.extend(staged.transactions);
            state.movements.extend(staged.movements);
            state.purchase_orders.extend(staged.purchase_orders);
            state.sale_orders.extend(staged.sale_orders);
            state.batches.extend(staged.batches);
        }
        self.finished = true;
        self.shared.release(&mut self.guards);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.staged = State::default();
        self.finished = true;
        self.shared.release(&mut self.guards);
        Ok(())
    }
}

impl Drop for InMemoryLedgerTx {
    fn drop(&mut self) {
        self.shared.release(&mut self.guards);
    }
}

fn with_batch_version(batch: &ProductionBatch, version: u64) -> ProductionBatch {
    ProductionBatch::restore(
        batch.batch_id(),
        batch.tenant_id(),
        batch.recipe_id(),
        batch.warehouse_id(),
        batch.quantity(),
        batch.status(),
        batch.unit_cost(),
        batch.started_at(),
        batch.finished_at(),
        version,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn test_key() -> BalanceKey {
        BalanceKey::new(WarehouseId::generate(), ItemId::generate())
    }

    fn balance(tenant: TenantId, key: BalanceKey, quantity: Decimal) -> StockBalance {
        StockBalance::restore(tenant, key, quantity, Decimal::ZERO, 0, Some(Utc::now())).unwrap()
    }

    #[tokio::test]
    async fn staged_writes_are_invisible_until_commit() {
        let store = InMemoryLedgerStore::new();
        let tenant = test_tenant_id();
        let key = test_key();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.lock_balance(tenant, key).await.unwrap().is_none());
        let saved = tx
            .save_balance(&balance(tenant, key, dec!(5)), ExpectedVersion::Exact(0))
            .await
            .unwrap();
        assert_eq!(saved.version(), 1);

        // Reads its own writes.
        let again = tx.lock_balance(tenant, key).await.unwrap().unwrap();
        assert_eq!(again.quantity(), dec!(5));
        assert!(store.balance(tenant, key).await.unwrap().is_none());

        tx.commit().await.unwrap();
        let committed = store.balance(tenant, key).await.unwrap().unwrap();
        assert_eq!(committed.quantity(), dec!(5));
        assert_eq!(committed.version(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_everything() {
        let store = InMemoryLedgerStore::new();
        let tenant = test_tenant_id();
        let key = test_key();

        let mut tx = store.begin().await.unwrap();
        tx.lock_balance(tenant, key).await.unwrap();
        tx.save_balance(&balance(tenant, key, dec!(5)), ExpectedVersion::Exact(0))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(store.balance(tenant, key).await.unwrap().is_none());
        assert!(tx.commit().await.is_err());
    }

    #[tokio::test]
    async fn second_unit_of_work_times_out_on_held_row() {
        let store = InMemoryLedgerStore::with_lock_timeout(Duration::from_millis(20));
        let tenant = test_tenant_id();
        let key = test_key();

        let mut first = store.begin().await.unwrap();
        first.lock_balance(tenant, key).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let err = second.lock_balance(tenant, key).await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));

        first.rollback().await.unwrap();
        assert!(second.lock_balance(tenant, key).await.is_ok());
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let store = InMemoryLedgerStore::new();
        let tenant = test_tenant_id();
        let key = test_key();

        let mut tx = store.begin().await.unwrap();
        tx.lock_balance(tenant, key).await.unwrap();
        tx.save_balance(&balance(tenant, key, dec!(1)), ExpectedVersion::Exact(0))
            .await
            .unwrap();
        let err = tx
            .save_balance(&balance(tenant, key, dec!(2)), ExpectedVersion::Exact(0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn writes_without_lock_are_rejected() {
        let store = InMemoryLedgerStore::new();
        let tenant = test_tenant_id();
        let key = test_key();

        let mut tx = store.begin().await.unwrap();
        let err = tx
            .save_balance(&balance(tenant, key, dec!(1)), ExpectedVersion::Any)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(msg) if msg.contains("without its lock")));
    }

    #[tokio::test]
    async fn balances_are_tenant_scoped() {
        let store = InMemoryLedgerStore::new();
        let (a, b) = (test_tenant_id(), test_tenant_id());
        let key = test_key();

        let mut tx = store.begin().await.unwrap();
        tx.lock_balance(a, key).await.unwrap();
        tx.save_balance(&balance(a, key, dec!(3)), ExpectedVersion::Exact(0))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.balances(a).await.unwrap().len(), 1);
        assert!(store.balances(b).await.unwrap().is_empty());
        assert!(store.balance(b, key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn row_locks_are_forgotten_once_released() {
        let store = InMemoryLedgerStore::with_lock_timeout(Duration::from_millis(20));
        let tenant = test_tenant_id();

        for _ in 0..10 {
            let key = test_key();
            let mut tx = store.begin().await.unwrap();
            tx.lock_balance(tenant, key).await.unwrap();
            tx.save_balance(&balance(tenant, key, dec!(1)), ExpectedVersion::Exact(0))
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }
        assert_eq!(store.tracked_row_locks(), 0);

        let key = test_key();
        let mut first = store.begin().await.unwrap();
        first.lock_balance(tenant, key).await.unwrap();
        let mut second = store.begin().await.unwrap();
        assert!(second.lock_balance(tenant, key).await.is_err());
        assert_eq!(store.tracked_row_locks(), 1);
        first.rollback().await.unwrap();
        assert_eq!(store.tracked_row_locks(), 0);

        let mut abandoned = store.begin().await.unwrap();
        abandoned.lock_balance(tenant, test_key()).await.unwrap();
        drop(abandoned);
        drop(second);
        assert_eq!(store.tracked_row_locks(), 0);
    }
}
