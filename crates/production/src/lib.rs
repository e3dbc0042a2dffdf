//! Production domain module (recipes and production batches).

pub mod batch;
pub mod recipe;

pub use batch::{BatchStatus, ProductionBatch, unit_cost};
pub use recipe::{Recipe, RecipeLine, Requirement};
