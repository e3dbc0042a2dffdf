//! Postgres-backed ledger store.
//!
//! Every unit of work is one database transaction. Row locks are taken with
//! `SELECT … FOR UPDATE` and bounded by `SET LOCAL lock_timeout`; versioned
//! rows are additionally checked on write.
//!
//! ## Error Mapping
//!
//! | SQLSTATE | Meaning | StoreError |
//! |----------|---------|------------|
//! | `55P03` | lock not available (lock_timeout hit) | `LockTimeout` |
//! | `40001` | serialization failure | `Conflict` |
//! | `40P01` | deadlock detected | `Conflict` |
//! | `23505` | unique violation (concurrent lazy insert) | `Conflict` |
//! | other | | `Backend` |
//!
//! A balance row that does not exist yet cannot be locked. Two units of work
//! creating the same row race on the primary key; the loser gets `Conflict`
//! and is retried by the ledger, at which point the row exists.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use tracing::instrument;
use uuid::Uuid;

use stockledger_core::{
    AggregateRoot, BatchId, DomainError, ExpectedVersion, ItemId, PurchaseOrderId, RecipeId,
    SaleOrderId, TenantId, UserId, WarehouseId,
};
use stockledger_inventory::{
    BalanceKey, Direction, Item, Movement, MovementDetail, MovementId, NewMovement,
    NewTransaction, StockBalance, Transaction, TransactionId, TransactionKind, Warehouse,
};
use stockledger_production::{BatchStatus, ProductionBatch, Recipe, RecipeLine};
use stockledger_purchasing::{PurchaseOrder, PurchaseOrderLine, PurchaseOrderStatus};
use stockledger_sales::{SaleOrder, SaleOrderLine, SaleOrderStatus};

use super::r#trait::{LedgerStore, LedgerTx, StoreError, TransactionFilter};

const SCHEMA: &str = include_str!("../../migrations/0001_stock_ledger.sql");

/// Postgres-backed ledger store.
///
/// `Send + Sync`; the SQLx pool handles connection sharing.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool, lock_timeout))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Master data import (fixtures, back-office sync).
    pub async fn insert_item(&self, item: &Item) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO items (id, tenant_id, sku, name, unit_of_measure, unit_cost, unit_price)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(item.id.as_uuid())
        .bind(item.tenant_id.as_uuid())
        .bind(&item.sku)
        .bind(&item.name)
        .bind(&item.unit_of_measure)
        .bind(item.unit_cost)
        .bind(item.unit_price)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_item", e))?;
        Ok(())
    }

    pub async fn insert_warehouse(&self, warehouse: &Warehouse) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO warehouses (id, tenant_id, name) VALUES ($1, $2, $3)")
            .bind(warehouse.id.as_uuid())
            .bind(warehouse.tenant_id.as_uuid())
            .bind(&warehouse.name)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_warehouse", e))?;
        Ok(())
    }

    pub async fn insert_recipe(&self, recipe: &Recipe) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            "INSERT INTO recipes (id, tenant_id, product_item_id, name) VALUES ($1, $2, $3, $4)",
        )
        .bind(recipe.id.as_uuid())
        .bind(recipe.tenant_id.as_uuid())
        .bind(recipe.product_item_id.as_uuid())
        .bind(&recipe.name)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_recipe", e))?;

        for (position, line) in recipe.lines.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO recipe_lines (recipe_id, position, ingredient_item_id, quantity)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(recipe.id.as_uuid())
            .bind(position as i32)
            .bind(line.ingredient_item_id.as_uuid())
            .bind(line.quantity)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_recipe_line", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self), err)]
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // SET does not take bind parameters; the value is an integer we format.
        let set_timeout = format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        );
        sqlx::query(&set_timeout)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        Ok(Box::new(PostgresLedgerTx { tx: Some(tx) }))
    }

    async fn balance(
        &self,
        tenant_id: TenantId,
        key: BalanceKey,
    ) -> Result<Option<StockBalance>, StoreError> {
        let row = sqlx::query(&format!(
            "{SELECT_BALANCE} WHERE tenant_id = $1 AND warehouse_id = $2 AND item_id = $3"
        ))
        .bind(tenant_id.as_uuid())
        .bind(key.warehouse_id.as_uuid())
        .bind(key.item_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("balance", e))?;
        row.as_ref().map(balance_from_row).transpose()
    }

    async fn balances(&self, tenant_id: TenantId) -> Result<Vec<StockBalance>, StoreError> {
        let rows = sqlx::query(&format!(
            "{SELECT_BALANCE} WHERE tenant_id = $1 ORDER BY warehouse_id, item_id"
        ))
        .bind(tenant_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("balances", e))?;
        rows.iter().map(balance_from_row).collect()
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id), err)]
    async fn transactions(
        &self,
        tenant_id: TenantId,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, kind, item_id, warehouse_id, quantity, unit_cost,
                   reference, detail, actor, occurred_at, note
            FROM stock_transactions
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR item_id = $2)
              AND ($3::uuid IS NULL OR warehouse_id = $3)
              AND ($4::text IS NULL OR kind = $4)
              AND ($5::text IS NULL OR reference = $5)
            ORDER BY id ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(filter.item_id.map(|id| *id.as_uuid()))
        .bind(filter.warehouse_id.map(|id| *id.as_uuid()))
        .bind(filter.kind.map(|kind| kind.as_str()))
        .bind(filter.reference.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("transactions", e))?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn movements(
        &self,
        tenant_id: TenantId,
        key: BalanceKey,
    ) -> Result<Vec<Movement>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, transaction_id, tenant_id, item_id, warehouse_id, direction, quantity, occurred_at
            FROM stock_movements
            WHERE tenant_id = $1 AND warehouse_id = $2 AND item_id = $3
            ORDER BY id ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(key.warehouse_id.as_uuid())
        .bind(key.item_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("movements", e))?;
        rows.iter().map(movement_from_row).collect()
    }

    async fn purchase_order(
        &self,
        id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        fetch_purchase_order(&mut conn, id, false).await
    }

    async fn sale_order(&self, id: SaleOrderId) -> Result<Option<SaleOrder>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        fetch_sale_order(&mut conn, id, false).await
    }

    async fn batch(&self, id: BatchId) -> Result<Option<ProductionBatch>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        fetch_batch(&mut conn, id).await
    }
}

/// Unit of work over one Postgres transaction.
///
/// Dropping it without commit rolls the transaction back (SQLx semantics).
pub struct PostgresLedgerTx {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresLedgerTx {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| StoreError::Backend("unit of work already finished".to_string()))
    }
}

#[async_trait]
impl LedgerTx for PostgresLedgerTx {
    async fn item(&mut self, id: ItemId) -> Result<Option<Item>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, sku, name, unit_of_measure, unit_cost, unit_price
            FROM items WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(self.conn()?)
        .await
        .map_err(|e| map_sqlx_error("item", e))?;

        row.map(|row| {
            Ok(Item {
                id: ItemId::from(get::<Uuid>(&row, "id")?),
                tenant_id: TenantId::from_uuid(get(&row, "tenant_id")?),
                sku: get(&row, "sku")?,
                name: get(&row, "name")?,
                unit_of_measure: get(&row, "unit_of_measure")?,
                unit_cost: get(&row, "unit_cost")?,
                unit_price: get(&row, "unit_price")?,
            })
        })
        .transpose()
    }

    async fn warehouse(&mut self, id: WarehouseId) -> Result<Option<Warehouse>, StoreError> {
        let row = sqlx::query("SELECT id, tenant_id, name FROM warehouses WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("warehouse", e))?;

        row.map(|row| {
            Ok(Warehouse {
                id: WarehouseId::from(get::<Uuid>(&row, "id")?),
                tenant_id: TenantId::from_uuid(get(&row, "tenant_id")?),
                name: get(&row, "name")?,
            })
        })
        .transpose()
    }

    async fn recipe(&mut self, id: RecipeId) -> Result<Option<Recipe>, StoreError> {
        let conn = self.conn()?;
        let Some(head) = sqlx::query(
            "SELECT id, tenant_id, product_item_id, name FROM recipes WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("recipe", e))?
        else {
            return Ok(None);
        };

        let rows = sqlx::query(
            r#"
            SELECT ingredient_item_id, quantity
            FROM recipe_lines WHERE recipe_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("recipe_lines", e))?;

        let lines = rows
            .iter()
            .map(|row| {
                Ok(RecipeLine {
                    ingredient_item_id: ItemId::from(get::<Uuid>(row, "ingredient_item_id")?),
                    quantity: get(row, "quantity")?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Some(Recipe {
            id,
            tenant_id: TenantId::from_uuid(get(&head, "tenant_id")?),
            product_item_id: ItemId::from(get::<Uuid>(&head, "product_item_id")?),
            name: get(&head, "name")?,
            lines,
        }))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, key = %key), err)]
    async fn lock_balance(
        &mut self,
        tenant_id: TenantId,
        key: BalanceKey,
    ) -> Result<Option<StockBalance>, StoreError> {
        let row = sqlx::query(&format!(
            "{SELECT_BALANCE} WHERE tenant_id = $1 AND warehouse_id = $2 AND item_id = $3 FOR UPDATE"
        ))
        .bind(tenant_id.as_uuid())
        .bind(key.warehouse_id.as_uuid())
        .bind(key.item_id.as_uuid())
        .fetch_optional(self.conn()?)
        .await
        .map_err(|e| map_sqlx_error("lock_balance", e))?;
        row.as_ref().map(balance_from_row).transpose()
    }

    #[instrument(
        skip(self, balance),
        fields(tenant_id = %balance.tenant_id(), key = %balance.key(), expected = ?expected),
        err
    )]
    async fn save_balance(
        &mut self,
        balance: &StockBalance,
        expected: ExpectedVersion,
    ) -> Result<StockBalance, StoreError> {
        let key = balance.key();
        let row = match expected {
            ExpectedVersion::Exact(0) => sqlx::query(
                r#"
                INSERT INTO stock_balances
                    (tenant_id, warehouse_id, item_id, quantity, reserved, version, updated_at)
                VALUES ($1, $2, $3, $4, $5, 1, $6)
                RETURNING version
                "#,
            )
            .bind(balance.tenant_id().as_uuid())
            .bind(key.warehouse_id.as_uuid())
            .bind(key.item_id.as_uuid())
            .bind(balance.quantity())
            .bind(balance.reserved())
            .bind(balance.updated_at())
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("insert_balance", e))?,
            ExpectedVersion::Exact(version) => sqlx::query(
                r#"
                UPDATE stock_balances
                SET quantity = $4, reserved = $5, updated_at = $6, version = version + 1
                WHERE tenant_id = $1 AND warehouse_id = $2 AND item_id = $3 AND version = $7
                RETURNING version
                "#,
            )
            .bind(balance.tenant_id().as_uuid())
            .bind(key.warehouse_id.as_uuid())
            .bind(key.item_id.as_uuid())
            .bind(balance.quantity())
            .bind(balance.reserved())
            .bind(balance.updated_at())
            .bind(version as i64)
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("update_balance", e))?,
            ExpectedVersion::Any => sqlx::query(
                r#"
                INSERT INTO stock_balances
                    (tenant_id, warehouse_id, item_id, quantity, reserved, version, updated_at)
                VALUES ($1, $2, $3, $4, $5, 1, $6)
                ON CONFLICT (tenant_id, warehouse_id, item_id) DO UPDATE
                SET quantity = EXCLUDED.quantity,
                    reserved = EXCLUDED.reserved,
                    updated_at = EXCLUDED.updated_at,
                    version = stock_balances.version + 1
                RETURNING version
                "#,
            )
            .bind(balance.tenant_id().as_uuid())
            .bind(key.warehouse_id.as_uuid())
            .bind(key.item_id.as_uuid())
            .bind(balance.quantity())
            .bind(balance.reserved())
            .bind(balance.updated_at())
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| map_sqlx_error("upsert_balance", e))?,
        };

        let row = row.ok_or_else(|| {
            StoreError::Conflict(format!("balance {key}: expected {expected:?}, row moved on"))
        })?;
        let version: i64 = get(&row, "version")?;

        StockBalance::restore(
            balance.tenant_id(),
            key,
            balance.quantity(),
            balance.reserved(),
            version as u64,
            balance.updated_at(),
        )
        .map_err(decode)
    }

    #[instrument(
        skip(self, transaction),
        fields(tenant_id = %transaction.tenant_id, kind = %transaction.kind()),
        err
    )]
    async fn append_transaction(
        &mut self,
        transaction: NewTransaction,
    ) -> Result<Transaction, StoreError> {
        let detail = serde_json::to_value(&transaction.detail)
            .map_err(|e| StoreError::Backend(format!("detail serialization failed: {e}")))?;

        let row = sqlx::query(
            r#"
            INSERT INTO stock_transactions (
                tenant_id, kind, item_id, warehouse_id, quantity, unit_cost,
                reference, detail, actor, occurred_at, note
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(transaction.tenant_id.as_uuid())
        .bind(transaction.kind().as_str())
        .bind(transaction.item_id.as_uuid())
        .bind(transaction.warehouse_id.as_uuid())
        .bind(transaction.quantity)
        .bind(transaction.unit_cost)
        .bind(transaction.reference.as_deref())
        .bind(&detail)
        .bind(transaction.actor.as_uuid())
        .bind(transaction.occurred_at)
        .bind(transaction.note.as_deref())
        .fetch_one(self.conn()?)
        .await
        .map_err(|e| map_sqlx_error("append_transaction", e))?;

        let id: i64 = get(&row, "id")?;
        Ok(transaction.into_committed(TransactionId(id)))
    }

    async fn append_movement(&mut self, movement: NewMovement) -> Result<Movement, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO stock_movements (
                transaction_id, tenant_id, item_id, warehouse_id, direction, quantity, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(movement.transaction_id.0)
        .bind(movement.tenant_id.as_uuid())
        .bind(movement.item_id.as_uuid())
        .bind(movement.warehouse_id.as_uuid())
        .bind(movement.direction.as_str())
        .bind(movement.quantity)
        .bind(movement.occurred_at)
        .fetch_one(self.conn()?)
        .await
        .map_err(|e| map_sqlx_error("append_movement", e))?;

        let id: i64 = get(&row, "id")?;
        Ok(movement.into_committed(MovementId(id)))
    }

    async fn insert_purchase_order(
        &mut self,
        order: &PurchaseOrder,
    ) -> Result<PurchaseOrder, StoreError> {
        let conn = self.conn()?;
        sqlx::query(
            r#"
            INSERT INTO purchase_orders (id, tenant_id, status, version, created_at)
            VALUES ($1, $2, $3, 1, $4)
            "#,
        )
        .bind(order.id().as_uuid())
        .bind(order.tenant_id().as_uuid())
        .bind(order.status().as_str())
        .bind(order.created_at())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_purchase_order", e))?;

        for line in order.lines() {
            sqlx::query(
                r#"
                INSERT INTO purchase_order_lines
                    (order_id, line_no, item_id, ordered_qty, unit_cost, received_qty)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(order.id().as_uuid())
            .bind(line.line_no as i32)
            .bind(line.item_id.as_uuid())
            .bind(line.ordered_qty)
            .bind(line.unit_cost)
            .bind(line.received_qty)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("insert_purchase_order_line", e))?;
        }

        PurchaseOrder::restore(
            *order.id(),
            order.tenant_id(),
            order.status(),
            order.lines().to_vec(),
            1,
            order.created_at(),
        )
        .map_err(decode)
    }

    async fn lock_purchase_order(
        &mut self,
        id: PurchaseOrderId,
    ) -> Result<Option<PurchaseOrder>, StoreError> {
        fetch_purchase_order(self.conn()?, id, true).await
    }

    async fn save_purchase_order(
        &mut self,
        order: &PurchaseOrder,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        bump_order_version(
            conn,
            "purchase_orders",
            *order.id().as_uuid(),
            order.status().as_str(),
            expected,
        )
        .await?;

        for line in order.lines() {
            sqlx::query(
                "UPDATE purchase_order_lines SET received_qty = $3 WHERE order_id = $1 AND line_no = $2",
            )
            .bind(order.id().as_uuid())
            .bind(line.line_no as i32)
            .bind(line.received_qty)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("save_purchase_order_line", e))?;
        }
        Ok(())
    }

    async fn insert_sale_order(&mut self, order: &SaleOrder) -> Result<SaleOrder, StoreError> {
        let conn = self.conn()?;
        sqlx::query(
            r#"
            INSERT INTO sale_orders (id, tenant_id, status, version, created_at)
            VALUES ($1, $2, $3, 1, $4)
            "#,
        )
        .bind(order.id().as_uuid())
        .bind(order.tenant_id().as_uuid())
        .bind(order.status().as_str())
        .bind(order.created_at())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_sale_order", e))?;

        for line in order.lines() {
            sqlx::query(
                r#"
                INSERT INTO sale_order_lines
                    (order_id, line_no, item_id, ordered_qty, unit_price, shipped_qty)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(order.id().as_uuid())
            .bind(line.line_no as i32)
            .bind(line.item_id.as_uuid())
            .bind(line.ordered_qty)
            .bind(line.unit_price)
            .bind(line.shipped_qty)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("insert_sale_order_line", e))?;
        }

        SaleOrder::restore(
            *order.id(),
            order.tenant_id(),
            order.status(),
            order.lines().to_vec(),
            1,
            order.created_at(),
        )
        .map_err(decode)
    }

    async fn lock_sale_order(&mut self, id: SaleOrderId) -> Result<Option<SaleOrder>, StoreError> {
        fetch_sale_order(self.conn()?, id, true).await
    }

    async fn save_sale_order(
        &mut self,
        order: &SaleOrder,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        bump_order_version(
            conn,
            "sale_orders",
            *order.id().as_uuid(),
            order.status().as_str(),
            expected,
        )
        .await?;

        for line in order.lines() {
            sqlx::query(
                "UPDATE sale_order_lines SET shipped_qty = $3 WHERE order_id = $1 AND line_no = $2",
            )
            .bind(order.id().as_uuid())
            .bind(line.line_no as i32)
            .bind(line.shipped_qty)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("save_sale_order_line", e))?;
        }
        Ok(())
    }

    async fn insert_batch(
        &mut self,
        batch: &ProductionBatch,
    ) -> Result<ProductionBatch, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO production_batches (
                id, tenant_id, recipe_id, warehouse_id, quantity, status,
                unit_cost, started_at, finished_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 1)
            "#,
        )
        .bind(batch.batch_id().as_uuid())
        .bind(batch.tenant_id().as_uuid())
        .bind(batch.recipe_id().as_uuid())
        .bind(batch.warehouse_id().as_uuid())
        .bind(batch.quantity())
        .bind(batch.status().as_str())
        .bind(batch.unit_cost())
        .bind(batch.started_at())
        .bind(batch.finished_at())
        .execute(self.conn()?)
        .await
        .map_err(|e| map_sqlx_error("insert_batch", e))?;

        Ok(ProductionBatch::restore(
            batch.batch_id(),
            batch.tenant_id(),
            batch.recipe_id(),
            batch.warehouse_id(),
            batch.quantity(),
            batch.status(),
            batch.unit_cost(),
            batch.started_at(),
            batch.finished_at(),
            1,
        ))
    }

    async fn save_batch(
        &mut self,
        batch: &ProductionBatch,
        expected: ExpectedVersion,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE production_batches
            SET status = $2, unit_cost = $3, finished_at = $4, version = version + 1
            WHERE id = $1 AND ($5::bigint IS NULL OR version = $5)
            "#,
        )
        .bind(batch.batch_id().as_uuid())
        .bind(batch.status().as_str())
        .bind(batch.unit_cost())
        .bind(batch.finished_at())
        .bind(expected_param(expected))
        .execute(self.conn()?)
        .await
        .map_err(|e| map_sqlx_error("save_batch", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "batch {}: expected {expected:?}, row moved on",
                batch.batch_id()
            )));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::Backend("unit of work already finished".to_string()))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => tx
                .rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e)),
            None => Ok(()),
        }
    }
}

const SELECT_BALANCE: &str = r#"
    SELECT tenant_id, warehouse_id, item_id, quantity, reserved, version, updated_at
    FROM stock_balances
"#;

fn expected_param(expected: ExpectedVersion) -> Option<i64> {
    match expected {
        ExpectedVersion::Any => None,
        ExpectedVersion::Exact(v) => Some(v as i64),
    }
}

async fn bump_order_version(
    conn: &mut PgConnection,
    table: &'static str,
    id: Uuid,
    status: &str,
    expected: ExpectedVersion,
) -> Result<(), StoreError> {
    let result = sqlx::query(&format!(
        "UPDATE {table} SET status = $2, version = version + 1 \
         WHERE id = $1 AND ($3::bigint IS NULL OR version = $3)"
    ))
    .bind(id)
    .bind(status)
    .bind(expected_param(expected))
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("save_order", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "{table} {id}: expected {expected:?}, row moved on"
        )));
    }
    Ok(())
}

async fn fetch_purchase_order(
    conn: &mut PgConnection,
    id: PurchaseOrderId,
    for_update: bool,
) -> Result<Option<PurchaseOrder>, StoreError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let Some(head) = sqlx::query(&format!(
        "SELECT id, tenant_id, status, version, created_at FROM purchase_orders WHERE id = $1{lock}"
    ))
    .bind(id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("purchase_order", e))?
    else {
        return Ok(None);
    };

    let rows = sqlx::query(
        r#"
        SELECT line_no, item_id, ordered_qty, unit_cost, received_qty
        FROM purchase_order_lines WHERE order_id = $1
        ORDER BY line_no ASC
        "#,
    )
    .bind(id.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("purchase_order_lines", e))?;

    let lines = rows
        .iter()
        .map(|row| {
            Ok(PurchaseOrderLine {
                line_no: get::<i32>(row, "line_no")? as u32,
                item_id: ItemId::from(get::<Uuid>(row, "item_id")?),
                ordered_qty: get(row, "ordered_qty")?,
                unit_cost: get(row, "unit_cost")?,
                received_qty: get(row, "received_qty")?,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

    let status: String = get(&head, "status")?;
    let status = PurchaseOrderStatus::parse(&status)
        .ok_or_else(|| StoreError::Decode(format!("unknown purchase order status '{status}'")))?;

    PurchaseOrder::restore(
        id,
        TenantId::from_uuid(get(&head, "tenant_id")?),
        status,
        lines,
        get::<i64>(&head, "version")? as u64,
        get(&head, "created_at")?,
    )
    .map(Some)
    .map_err(decode)
}

async fn fetch_sale_order(
    conn: &mut PgConnection,
    id: SaleOrderId,
    for_update: bool,
) -> Result<Option<SaleOrder>, StoreError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let Some(head) = sqlx::query(&format!(
        "SELECT id, tenant_id, status, version, created_at FROM sale_orders WHERE id = $1{lock}"
    ))
    .bind(id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("sale_order", e))?
    else {
        return Ok(None);
    };

    let rows = sqlx::query(
        r#"
        SELECT line_no, item_id, ordered_qty, unit_price, shipped_qty
        FROM sale_order_lines WHERE order_id = $1
        ORDER BY line_no ASC
        "#,
    )
    .bind(id.as_uuid())
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("sale_order_lines", e))?;

    let lines = rows
        .iter()
        .map(|row| {
            Ok(SaleOrderLine {
                line_no: get::<i32>(row, "line_no")? as u32,
                item_id: ItemId::from(get::<Uuid>(row, "item_id")?),
                ordered_qty: get(row, "ordered_qty")?,
                unit_price: get(row, "unit_price")?,
                shipped_qty: get(row, "shipped_qty")?,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

    let status: String = get(&head, "status")?;
    let status = SaleOrderStatus::parse(&status)
        .ok_or_else(|| StoreError::Decode(format!("unknown sale order status '{status}'")))?;

    SaleOrder::restore(
        id,
        TenantId::from_uuid(get(&head, "tenant_id")?),
        status,
        lines,
        get::<i64>(&head, "version")? as u64,
        get(&head, "created_at")?,
    )
    .map(Some)
    .map_err(decode)
}

async fn fetch_batch(
    conn: &mut PgConnection,
    id: BatchId,
) -> Result<Option<ProductionBatch>, StoreError> {
    let Some(row) = sqlx::query(
        r#"
        SELECT id, tenant_id, recipe_id, warehouse_id, quantity, status,
               unit_cost, started_at, finished_at, version
        FROM production_batches WHERE id = $1
        "#,
    )
    .bind(id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("batch", e))?
    else {
        return Ok(None);
    };

    let status: String = get(&row, "status")?;
    let status = BatchStatus::parse(&status)
        .ok_or_else(|| StoreError::Decode(format!("unknown batch status '{status}'")))?;

    Ok(Some(ProductionBatch::restore(
        id,
        TenantId::from_uuid(get(&row, "tenant_id")?),
        RecipeId::from(get::<Uuid>(&row, "recipe_id")?),
        WarehouseId::from(get::<Uuid>(&row, "warehouse_id")?),
        get(&row, "quantity")?,
        status,
        get(&row, "unit_cost")?,
        get(&row, "started_at")?,
        get(&row, "finished_at")?,
        get::<i64>(&row, "version")? as u64,
    )))
}

fn balance_from_row(row: &PgRow) -> Result<StockBalance, StoreError> {
    let key = BalanceKey::new(
        WarehouseId::from(get::<Uuid>(row, "warehouse_id")?),
        ItemId::from(get::<Uuid>(row, "item_id")?),
    );
    StockBalance::restore(
        TenantId::from_uuid(get(row, "tenant_id")?),
        key,
        get(row, "quantity")?,
        get(row, "reserved")?,
        get::<i64>(row, "version")? as u64,
        get::<Option<DateTime<Utc>>>(row, "updated_at")?,
    )
    .map_err(decode)
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    let kind: String = get(row, "kind")?;
    let kind = TransactionKind::parse(&kind)
        .ok_or_else(|| StoreError::Decode(format!("unknown transaction kind '{kind}'")))?;
    let detail: MovementDetail = serde_json::from_value(get::<JsonValue>(row, "detail")?)
        .map_err(|e| StoreError::Decode(format!("detail: {e}")))?;
    if detail.kind() != kind {
        return Err(StoreError::Decode(format!(
            "detail of kind {} stored on a {kind} transaction",
            detail.kind()
        )));
    }

    Ok(Transaction {
        id: TransactionId(get(row, "id")?),
        tenant_id: TenantId::from_uuid(get(row, "tenant_id")?),
        kind,
        item_id: ItemId::from(get::<Uuid>(row, "item_id")?),
        warehouse_id: WarehouseId::from(get::<Uuid>(row, "warehouse_id")?),
        quantity: get::<Decimal>(row, "quantity")?,
        unit_cost: get(row, "unit_cost")?,
        reference: get(row, "reference")?,
        detail,
        actor: UserId::from_uuid(get(row, "actor")?),
        occurred_at: get(row, "occurred_at")?,
        note: get(row, "note")?,
    })
}

fn movement_from_row(row: &PgRow) -> Result<Movement, StoreError> {
    let direction: String = get(row, "direction")?;
    let direction = Direction::parse(&direction)
        .ok_or_else(|| StoreError::Decode(format!("unknown direction '{direction}'")))?;

    Ok(Movement {
        id: MovementId(get(row, "id")?),
        transaction_id: TransactionId(get(row, "transaction_id")?),
        tenant_id: TenantId::from_uuid(get(row, "tenant_id")?),
        item_id: ItemId::from(get::<Uuid>(row, "item_id")?),
        warehouse_id: WarehouseId::from(get::<Uuid>(row, "warehouse_id")?),
        direction,
        quantity: get(row, "quantity")?,
        occurred_at: get(row, "occurred_at")?,
    })
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Decode(format!("{column}: {e}")))
}

fn decode(err: DomainError) -> StoreError {
    StoreError::Decode(err.to_string())
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("55P03") => StoreError::LockTimeout(msg),
                Some("40001") | Some("40P01") | Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Backend(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("{} in {}", err, operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
