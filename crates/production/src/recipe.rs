use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, ItemId, RecipeId, TenantId};

/// One ingredient of a recipe, per unit of output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeLine {
    pub ingredient_item_id: ItemId,
    pub quantity: Decimal,
}

/// Total quantity of one ingredient needed for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub item_id: ItemId,
    pub quantity: Decimal,
}

/// Bill of materials for one product item (read-only to the ledger).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: RecipeId,
    pub tenant_id: TenantId,
    pub product_item_id: ItemId,
    pub name: String,
    pub lines: Vec<RecipeLine>,
}

impl Recipe {
    pub fn new(
        id: RecipeId,
        tenant_id: TenantId,
        product_item_id: ItemId,
        name: impl Into<String>,
        lines: Vec<RecipeLine>,
    ) -> DomainResult<Self> {
        if lines.is_empty() {
            return Err(DomainError::validation("recipe needs at least one ingredient"));
        }
        if let Some(bad) = lines.iter().find(|l| l.quantity <= Decimal::ZERO) {
            return Err(DomainError::validation(format!(
                "ingredient {} quantity must be positive",
                bad.ingredient_item_id
            )));
        }
        if lines.iter().any(|l| l.ingredient_item_id == product_item_id) {
            return Err(DomainError::validation(
                "recipe cannot consume its own product",
            ));
        }
        Ok(Self {
            id,
            tenant_id,
            product_item_id,
            name: name.into(),
            lines,
        })
    }

    /// Expand the recipe for `batch_quantity` units of output.
    ///
    /// Lines naming the same ingredient are merged. Order follows the first
    /// occurrence of each ingredient. A total beyond the decimal range is a
    /// validation error.
    pub fn requirements(&self, batch_quantity: Decimal) -> DomainResult<Vec<Requirement>> {
        let mut merged: Vec<Requirement> = Vec::with_capacity(self.lines.len());
        for line in &self.lines {
            let needed = line
                .quantity
                .checked_mul(batch_quantity)
                .ok_or_else(|| too_large(line.ingredient_item_id, batch_quantity))?;
            match merged.iter_mut().find(|r| r.item_id == line.ingredient_item_id) {
                Some(existing) => {
                    existing.quantity = existing
                        .quantity
                        .checked_add(needed)
                        .ok_or_else(|| too_large(line.ingredient_item_id, batch_quantity))?;
                }
                None => merged.push(Requirement {
                    item_id: line.ingredient_item_id,
                    quantity: needed,
                }),
            }
        }
        Ok(merged)
    }
}

fn too_large(item_id: ItemId, batch_quantity: Decimal) -> DomainError {
    DomainError::validation(format!(
        "ingredient {item_id} requirement for a batch of {batch_quantity} is out of range"
    ))
}
