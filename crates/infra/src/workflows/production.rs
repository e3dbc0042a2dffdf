use chrono::Utc;
use rust_decimal::Decimal;
use tracing::instrument;

use stockledger_core::{AggregateRoot, BatchId, ExpectedVersion, RecipeId, TenantId, UserId, WarehouseId};
use stockledger_inventory::{BalanceKey, MovementDetail, Transaction};
use stockledger_production::{ProductionBatch, unit_cost};

use super::{owned_item, owned_warehouse, require_positive};
use crate::ledger::{
    IngredientShortfall, Ledger, LedgerError, LedgerResult, MovementRequest, Posting,
};
use crate::store::LedgerTx;

/// Run one batch of a recipe in one warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Produce {
    pub tenant_id: TenantId,
    pub recipe_id: RecipeId,
    pub batch_quantity: Decimal,
    pub warehouse_id: WarehouseId,
    pub actor: UserId,
    pub note: Option<String>,
}

/// A completed production batch with everything it posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionRun {
    pub batch: ProductionBatch,
    /// USAGE transactions in recipe order, then the output transaction.
    pub transactions: Vec<Transaction>,
    pub unit_cost: Decimal,
}

impl Ledger {
    /// Consume the recipe's ingredients and book the output, all or nothing.
    ///
    /// Every ingredient is checked before anything is written; a shortage
    /// reports each short ingredient and leaves no batch behind.
    #[instrument(
        skip(self, cmd),
        fields(tenant_id = %cmd.tenant_id, recipe_id = %cmd.recipe_id, batch_quantity = %cmd.batch_quantity),
        err
    )]
    pub async fn produce(&self, cmd: Produce) -> LedgerResult<ProductionRun> {
        require_positive("batch", cmd.batch_quantity)?;

        let cmd = &cmd;
        let (run, postings) = self
            .retry
            .run("produce", move || self.produce_once(cmd))
            .await?;
        self.after_commit("produce", &postings);
        Ok(run)
    }

    async fn produce_once(&self, cmd: &Produce) -> LedgerResult<(ProductionRun, Vec<Posting>)> {
        let mut tx = self.store.begin().await?;
        let result = self.produce_in(tx.as_mut(), cmd).await;
        self.finish(tx, result).await
    }

    async fn produce_in(
        &self,
        tx: &mut dyn LedgerTx,
        cmd: &Produce,
    ) -> LedgerResult<(ProductionRun, Vec<Posting>)> {
        let recipe = tx
            .recipe(cmd.recipe_id)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("recipe {}", cmd.recipe_id)))?;
        if recipe.tenant_id != cmd.tenant_id {
            return Err(LedgerError::cross_tenant(format!(
                "recipe {} does not belong to tenant {}",
                recipe.id, cmd.tenant_id
            )));
        }
        owned_warehouse(tx, cmd.tenant_id, cmd.warehouse_id).await?;
        owned_item(tx, cmd.tenant_id, recipe.product_item_id).await?;

        let requirements = recipe.requirements(cmd.batch_quantity)?;
        let mut ingredient_costs = Vec::with_capacity(requirements.len());
        for requirement in &requirements {
            let item = owned_item(tx, cmd.tenant_id, requirement.item_id).await?;
            ingredient_costs.push(item.unit_cost);
        }

        let output_key = BalanceKey::new(cmd.warehouse_id, recipe.product_item_id);
        let balances = self
            .engine
            .lock_balances(
                tx,
                cmd.tenant_id,
                requirements
                    .iter()
                    .map(|r| BalanceKey::new(cmd.warehouse_id, r.item_id))
                    .chain(std::iter::once(output_key)),
            )
            .await?;

        let shortages: Vec<IngredientShortfall> = requirements
            .iter()
            .filter_map(|r| {
                let available = balances
                    .get(&BalanceKey::new(cmd.warehouse_id, r.item_id))
                    .map(|b| b.quantity())
                    .unwrap_or_default();
                (available < r.quantity).then_some(IngredientShortfall {
                    item_id: r.item_id,
                    required: r.quantity,
                    available,
                })
            })
            .collect();
        if !shortages.is_empty() {
            return Err(LedgerError::IngredientShortage { shortages });
        }

        let batch = ProductionBatch::start(
            BatchId::generate(),
            cmd.tenant_id,
            recipe.id,
            cmd.warehouse_id,
            cmd.batch_quantity,
            Utc::now(),
        )?;
        let mut batch = tx.insert_batch(&batch).await?;
        let batch_id = batch.batch_id();
        let reference = batch_id.to_string();

        let mut postings = Vec::with_capacity(requirements.len() + 1);
        for (requirement, cost) in requirements.iter().zip(&ingredient_costs) {
            let posting = self
                .engine
                .apply_movement(
                    tx,
                    MovementRequest {
                        tenant_id: cmd.tenant_id,
                        item_id: requirement.item_id,
                        warehouse_id: cmd.warehouse_id,
                        quantity: requirement.quantity,
                        unit_cost: Some(*cost),
                        reference: Some(reference.clone()),
                        detail: MovementDetail::Usage { batch_id },
                        actor: cmd.actor,
                        note: cmd.note.clone(),
                    },
                )
                .await?;
            postings.push(posting);
        }

        let output_cost = unit_cost(
            ingredient_costs
                .iter()
                .copied()
                .zip(requirements.iter().map(|r| r.quantity)),
            cmd.batch_quantity,
        )?;
        let output = self
            .engine
            .apply_movement(
                tx,
                MovementRequest {
                    tenant_id: cmd.tenant_id,
                    item_id: recipe.product_item_id,
                    warehouse_id: cmd.warehouse_id,
                    quantity: cmd.batch_quantity,
                    unit_cost: Some(output_cost),
                    reference: Some(reference),
                    detail: MovementDetail::ProductionOutput { batch_id },
                    actor: cmd.actor,
                    note: cmd.note.clone(),
                },
            )
            .await?;
        postings.push(output);

        let read_version = batch.version();
        batch.complete(output_cost, Utc::now())?;
        tx.save_batch(&batch, ExpectedVersion::Exact(read_version))
            .await?;
        let batch = ProductionBatch::restore(
            batch_id,
            batch.tenant_id(),
            batch.recipe_id(),
            batch.warehouse_id(),
            batch.quantity(),
            batch.status(),
            batch.unit_cost(),
            batch.started_at(),
            batch.finished_at(),
            read_version + 1,
        );

        let run = ProductionRun {
            batch,
            transactions: postings.iter().map(|p| p.transaction.clone()).collect(),
            unit_cost: output_cost,
        };
        Ok((run, postings))
    }
}
