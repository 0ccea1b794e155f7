//! Weight optimization.
//!
//! Two interchangeable strategies behind [`WeightOptimizer`]:
//! - Grid/random search maximizing a portfolio objective
//! - Closed-form ridge regression on a target return

pub mod grid;
pub mod ridge;

pub use grid::{
    GridSearchConfig, GridSearchOptimizer, SearchConstraints, SearchMode, SearchObjective,
    SearchOutcome, WeightSpace, DEFAULT_TRIALS, EXHAUSTIVE_MAX_DIMS,
};
pub use ridge::{ridge_solve, CrossSectionalFit, RidgeFit, RidgeOptimizer};

use crate::data::{FeatureTable, TargetColumn};
use crate::error::Result;
use crate::scoring::WeightVector;

/// Produces a weight vector from a training table.
pub trait WeightOptimizer {
    fn name(&self) -> &'static str;

    /// Fit weights on the records of `table` that have a `target` value.
    fn fit(&self, table: &FeatureTable, target: TargetColumn) -> Result<WeightVector>;
}
