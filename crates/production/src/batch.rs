use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    AggregateRoot, BatchId, DomainError, DomainResult, RecipeId, TenantId, WarehouseId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Running,
    Completed,
}

impl BatchStatus {
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        matches!((self, next), (BatchStatus::Running, BatchStatus::Completed))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "RUNNING",
            BatchStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNING" => Some(BatchStatus::Running),
            "COMPLETED" => Some(BatchStatus::Completed),
            _ => None,
        }
    }
}

/// Aggregate root: ProductionBatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionBatch {
    id: BatchId,
    tenant_id: TenantId,
    recipe_id: RecipeId,
    warehouse_id: WarehouseId,
    quantity: Decimal,
    status: BatchStatus,
    unit_cost: Option<Decimal>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    version: u64,
}

impl ProductionBatch {
    /// Start a batch of `quantity` units.
    pub fn start(
        id: BatchId,
        tenant_id: TenantId,
        recipe_id: RecipeId,
        warehouse_id: WarehouseId,
        quantity: Decimal,
        started_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if quantity <= Decimal::ZERO {
            return Err(DomainError::validation("batch quantity must be positive"));
        }
        Ok(Self {
            id,
            tenant_id,
            recipe_id,
            warehouse_id,
            quantity,
            status: BatchStatus::Running,
            unit_cost: None,
            started_at,
            finished_at: None,
            version: 0,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: BatchId,
        tenant_id: TenantId,
        recipe_id: RecipeId,
        warehouse_id: WarehouseId,
        quantity: Decimal,
        status: BatchStatus,
        unit_cost: Option<Decimal>,
        started_at: DateTime<Utc>,
        finished_at: Option<DateTime<Utc>>,
        version: u64,
    ) -> Self {
        Self {
            id,
            tenant_id,
            recipe_id,
            warehouse_id,
            quantity,
            status,
            unit_cost,
            started_at,
            finished_at,
            version,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn recipe_id(&self) -> RecipeId {
        self.recipe_id
    }

    pub fn warehouse_id(&self) -> WarehouseId {
        self.warehouse_id
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    pub fn unit_cost(&self) -> Option<Decimal> {
        self.unit_cost
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Close the batch with its derived unit cost.
    pub fn complete(&mut self, unit_cost: Decimal, at: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(BatchStatus::Completed) {
            return Err(DomainError::invariant(format!(
                "batch {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = BatchStatus::Completed;
        self.unit_cost = Some(unit_cost);
        self.finished_at = Some(at);
        Ok(())
    }
}

impl AggregateRoot for ProductionBatch {
    type Id = BatchId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Cost per output unit: total ingredient cost divided by batch quantity.
///
/// `consumed` pairs each ingredient's unit cost with the quantity used.
pub fn unit_cost<I>(consumed: I, batch_quantity: Decimal) -> DomainResult<Decimal>
where
    I: IntoIterator<Item = (Decimal, Decimal)>,
{
    if batch_quantity <= Decimal::ZERO {
        return Err(DomainError::validation("batch quantity must be positive"));
    }
    let mut total = Decimal::ZERO;
    for (cost, qty) in consumed {
        total = cost
            .checked_mul(qty)
            .and_then(|line| total.checked_add(line))
            .ok_or_else(|| DomainError::validation("ingredient cost total is out of range"))?;
    }
    total
        .checked_div(batch_quantity)
        .ok_or_else(|| DomainError::invariant("unit cost overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn running_batch(quantity: Decimal) -> ProductionBatch {
        ProductionBatch::start(
            BatchId::generate(),
            TenantId::new(),
            RecipeId::generate(),
            WarehouseId::generate(),
            quantity,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn unit_cost_is_total_over_quantity() {
        // 20 flour at 0.50 + 5 sugar at 1.20 = 16.00 over 10 cakes
        let cost = unit_cost([(dec!(0.50), dec!(20)), (dec!(1.20), dec!(5))], dec!(10)).unwrap();
        assert_eq!(cost, dec!(1.6));
    }

    #[test]
    fn unit_cost_rejects_zero_batch() {
        assert!(unit_cost([(dec!(1), dec!(1))], Decimal::ZERO).is_err());
    }

    #[test]
    fn unit_cost_rejects_totals_out_of_range() {
        let err = unit_cost([(dec!(2), Decimal::MAX)], dec!(1)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    proptest! {
        #[test]
        fn unit_cost_times_batch_recovers_total(
            lines in prop::collection::vec((0u32..10_000, 1u32..10_000), 1..8),
            batch in 1u32..1_000,
        ) {
            let consumed: Vec<(Decimal, Decimal)> = lines
                .iter()
                .map(|(cents, qty)| (Decimal::new(i64::from(*cents), 2), Decimal::from(*qty)))
                .collect();
            let total: Decimal = consumed.iter().map(|(c, q)| c * q).sum();
            let batch = Decimal::from(batch);

            let cost = unit_cost(consumed, batch).unwrap();
            prop_assert!(cost >= Decimal::ZERO);
            // 28 significant digits leave room for a rounding error far below a cent.
            prop_assert!((cost * batch - total).abs() < dec!(0.000001));
        }
    }

    #[test]
    fn complete_sets_cost_and_finish_once() {
        let mut batch = running_batch(dec!(10));
        let at = Utc::now();
        batch.complete(dec!(1.6), at).unwrap();
        assert_eq!(batch.status(), BatchStatus::Completed);
        assert_eq!(batch.unit_cost(), Some(dec!(1.6)));
        assert_eq!(batch.finished_at(), Some(at));
        assert!(batch.complete(dec!(2), Utc::now()).is_err());
    }

    #[test]
    fn zero_quantity_batches_are_rejected() {
        let err = ProductionBatch::start(
            BatchId::generate(),
            TenantId::new(),
            RecipeId::generate(),
            WarehouseId::generate(),
            Decimal::ZERO,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
