//! Grid and random search over weight candidates.
//!
//! Candidates are enumerated in a fixed order (last feature varies fastest)
//! and evaluated in parallel. Exhaustive candidates are built from their
//! index on demand, never collected. The reduction breaks objective ties
//! toward the lower candidate index, so the first maximum wins regardless
//! of thread scheduling.

use std::collections::BTreeMap;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::WeightOptimizer;
use crate::data::{Feature, FeatureTable, TargetColumn};
use crate::error::{ResearchError, Result};
use crate::metrics::{EvaluationFrame, PortfolioMetrics};
use crate::scoring::{FeatureMatrix, WeightVector};

/// Largest space searched exhaustively in [`SearchMode::Auto`].
pub const EXHAUSTIVE_MAX_DIMS: usize = 5;
/// Random trials in [`SearchMode::Auto`] beyond that.
pub const DEFAULT_TRIALS: usize = 1000;

/// Quantity the search maximizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchObjective {
    #[default]
    Sharpe,
    HitRate,
    AnnualReturn,
}

impl SearchObjective {
    pub fn value(&self, metrics: &PortfolioMetrics) -> f64 {
        match self {
            Self::Sharpe => metrics.sharpe,
            Self::HitRate => metrics.hit_rate,
            Self::AnnualReturn => metrics.annual_return,
        }
    }
}

impl FromStr for SearchObjective {
    type Err = ResearchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sharpe" => Ok(Self::Sharpe),
            "hit_rate" => Ok(Self::HitRate),
            "annual_return" => Ok(Self::AnnualReturn),
            other => Err(ResearchError::config(format!("unknown objective: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Exhaustive up to [`EXHAUSTIVE_MAX_DIMS`] features, random beyond.
    #[default]
    Auto,
    Exhaustive,
    Random,
}

impl FromStr for SearchMode {
    type Err = ResearchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "exhaustive" => Ok(Self::Exhaustive),
            "random" => Ok(Self::Random),
            other => Err(ResearchError::config(format!("unknown search mode: {}", other))),
        }
    }
}

/// Candidate weights per feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSpace {
    dims: Vec<(Feature, Vec<f64>)>,
}

impl WeightSpace {
    pub fn new(dims: Vec<(Feature, Vec<f64>)>) -> Result<Self> {
        if dims.is_empty() {
            return Err(ResearchError::config("weight space has no features"));
        }
        let mut seen = Vec::with_capacity(dims.len());
        for (feature, candidates) in &dims {
            if seen.contains(feature) {
                return Err(ResearchError::config(format!("duplicate feature {}", feature)));
            }
            seen.push(*feature);
            if candidates.is_empty() {
                return Err(ResearchError::config(format!("no candidates for {}", feature)));
            }
            if candidates.iter().any(|c| !c.is_finite()) {
                return Err(ResearchError::config(format!("non-finite candidate for {}", feature)));
            }
        }
        Ok(Self { dims })
    }

    /// Every feature draws from the same grid.
    pub fn shared(features: &[Feature], grid: &[f64]) -> Result<Self> {
        Self::new(features.iter().map(|f| (*f, grid.to_vec())).collect())
    }

    /// Every feature draws from `min, min + step, ..., max` (inclusive).
    pub fn from_range(features: &[Feature], min: f64, max: f64, step: f64) -> Result<Self> {
        if !(step > 0.0 && step.is_finite()) {
            return Err(ResearchError::config(format!("grid step must be positive, got {}", step)));
        }
        if !(min.is_finite() && max.is_finite() && min <= max) {
            return Err(ResearchError::config(format!("invalid grid range [{}, {}]", min, max)));
        }
        let steps = ((max - min) / step + 1e-9).floor() as usize;
        let grid: Vec<f64> = (0..=steps).map(|i| min + i as f64 * step).collect();
        Self::shared(features, &grid)
    }

    pub fn features(&self) -> Vec<Feature> {
        self.dims.iter().map(|(f, _)| *f).collect()
    }

    pub fn dims(&self) -> &[(Feature, Vec<f64>)] {
        &self.dims
    }

    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// Number of combinations, or `None` if it overflows `usize`.
    pub fn combinations(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, (_, c)| acc.checked_mul(c.len()))
    }

    /// The `index`-th combination in enumeration order (last feature fastest).
    pub fn combination(&self, mut index: usize) -> Vec<f64> {
        let mut weights = vec![0.0; self.dims.len()];
        for (slot, (_, candidates)) in weights.iter_mut().zip(&self.dims).rev() {
            *slot = candidates[index % candidates.len()];
            index /= candidates.len();
        }
        weights
    }

    /// A uniformly drawn combination.
    fn sample<R: Rng>(&self, rng: &mut R) -> Vec<f64> {
        self.dims
            .iter()
            .map(|(_, candidates)| candidates[rng.gen_range(0..candidates.len())])
            .collect()
    }

    fn to_weights(&self, values: &[f64]) -> WeightVector {
        self.dims
            .iter()
            .zip(values)
            .map(|((feature, _), value)| (*feature, *value))
            .collect()
    }
}

/// Filters applied to every candidate before evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConstraints {
    /// When positive, skip candidates where any weight is smaller in magnitude.
    pub min_abs_weight: f64,
    /// Skip candidates where a feature's weight exceeds its cap.
    pub caps: BTreeMap<Feature, f64>,
}

impl SearchConstraints {
    pub fn validate(&self, space: &WeightSpace) -> Result<()> {
        if !(self.min_abs_weight >= 0.0 && self.min_abs_weight.is_finite()) {
            return Err(ResearchError::config(format!(
                "min_abs_weight must be non-negative, got {}",
                self.min_abs_weight
            )));
        }
        let features = space.features();
        for feature in self.caps.keys() {
            if !features.contains(feature) {
                return Err(ResearchError::config(format!(
                    "cap on {} which is not searched",
                    feature
                )));
            }
        }
        Ok(())
    }

    /// Whether `values` (aligned with `features`) may be evaluated.
    ///
    /// All-zero candidates are never admitted.
    pub fn admits(&self, features: &[Feature], values: &[f64]) -> bool {
        if values.iter().all(|v| *v == 0.0) {
            return false;
        }
        if self.min_abs_weight > 0.0 && values.iter().any(|v| v.abs() < self.min_abs_weight) {
            return false;
        }
        features
            .iter()
            .zip(values)
            .all(|(f, v)| self.caps.get(f).map_or(true, |cap| v <= cap))
    }
}

/// Grid search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSearchConfig {
    pub mode: SearchMode,
    /// Random trials when the search is random.
    pub trials: usize,
    pub seed: u64,
    pub objective: SearchObjective,
    /// Portfolio size used to evaluate candidates.
    pub top_k: usize,
    pub constraints: SearchConstraints,
}

impl Default for GridSearchConfig {
    fn default() -> Self {
        Self {
            mode: SearchMode::Auto,
            trials: DEFAULT_TRIALS,
            seed: 42,
            objective: SearchObjective::Sharpe,
            top_k: 30,
            constraints: SearchConstraints::default(),
        }
    }
}

/// Best candidate of a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub weights: WeightVector,
    pub objective: SearchObjective,
    pub objective_value: f64,
    pub metrics: PortfolioMetrics,
    /// Mode actually used (never `Auto`).
    pub mode: SearchMode,
    /// Candidates evaluated after constraints.
    pub evaluated: usize,
}

/// Searches a [`WeightSpace`] for the weights maximizing a portfolio objective.
#[derive(Debug, Clone)]
pub struct GridSearchOptimizer {
    space: WeightSpace,
    config: GridSearchConfig,
}

impl GridSearchOptimizer {
    pub fn new(space: WeightSpace, config: GridSearchConfig) -> Result<Self> {
        config.constraints.validate(&space)?;
        if config.top_k == 0 {
            return Err(ResearchError::config("top_k must be positive"));
        }
        Ok(Self { space, config })
    }

    pub fn space(&self) -> &WeightSpace {
        &self.space
    }

    pub fn config(&self) -> &GridSearchConfig {
        &self.config
    }

    fn resolved_mode(&self) -> SearchMode {
        match self.config.mode {
            SearchMode::Auto if self.space.len() <= EXHAUSTIVE_MAX_DIMS => SearchMode::Exhaustive,
            SearchMode::Auto => SearchMode::Random,
            mode => mode,
        }
    }

    /// Seeded random draws in evaluation order, constraints applied.
    fn random_candidates(&self) -> Result<Vec<Vec<f64>>> {
        if self.config.trials == 0 {
            return Err(ResearchError::config("random search needs at least one trial"));
        }
        let features = self.space.features();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        Ok((0..self.config.trials)
            .map(|_| self.space.sample(&mut rng))
            .filter(|values| self.config.constraints.admits(&features, values))
            .collect())
    }

    /// Run the search on records with a defined target.
    pub fn search(&self, table: &FeatureTable, target: TargetColumn) -> Result<SearchOutcome> {
        let features = self.space.features();
        table.require_columns(&features)?;

        let usable = table.filter(|r| r.target(target).is_some());
        if usable.is_empty() {
            return Err(ResearchError::insufficient(format!(
                "no records with {} to search on",
                target
            )));
        }

        let matrix = FeatureMatrix::from_table(&usable, &features)?;
        let frame = EvaluationFrame::from_table(&usable, target);
        let top_k = self.config.top_k;
        let objective = self.config.objective;
        let constraints = &self.config.constraints;
        let evaluate = |values: &[f64]| {
            let value = objective.value(&frame.metrics(&matrix.dot(values), top_k));
            if value.is_nan() {
                f64::NEG_INFINITY
            } else {
                value
            }
        };

        let mode = self.resolved_mode();
        let (leader, best_values) = match mode {
            SearchMode::Random => {
                let candidates = self.random_candidates()?;
                info!(
                    "Searching {} random candidates over {} features on {} records",
                    candidates.len(),
                    features.len(),
                    usable.len()
                );
                let leader = candidates
                    .par_iter()
                    .enumerate()
                    .map(|(idx, values)| Leader::single(idx, evaluate(values)))
                    .reduce_with(Leader::merge);
                let best = leader.map(|l| candidates[l.index].clone());
                (leader, best)
            }
            _ => {
                let total = self.space.combinations().ok_or_else(|| {
                    ResearchError::config("weight space too large for exhaustive search")
                })?;
                info!(
                    "Searching {} combinations over {} features on {} records",
                    total,
                    features.len(),
                    usable.len()
                );
                let leader = (0..total)
                    .into_par_iter()
                    .filter_map(|idx| {
                        let values = self.space.combination(idx);
                        constraints
                            .admits(&features, &values)
                            .then(|| Leader::single(idx, evaluate(&values)))
                    })
                    .reduce_with(Leader::merge);
                let best = leader.map(|l| self.space.combination(l.index));
                (leader, best)
            }
        };

        let (Some(leader), Some(best_values)) = (leader, best_values) else {
            return Err(ResearchError::config(
                "no weight combination satisfies the search constraints",
            ));
        };

        let metrics = frame.metrics(&matrix.dot(&best_values), top_k);
        let weights = self.space.to_weights(&best_values);
        debug!("Best weights: {}", weights);
        info!(
            "Best {:?} = {:.4} after {} candidates",
            objective, leader.value, leader.evaluated
        );

        Ok(SearchOutcome {
            weights,
            objective,
            objective_value: leader.value,
            metrics,
            mode,
            evaluated: leader.evaluated,
        })
    }
}

/// Running best of the parallel reduction.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Leader {
    index: usize,
    value: f64,
    evaluated: usize,
}

impl Leader {
    fn single(index: usize, value: f64) -> Self {
        Self {
            index,
            value,
            evaluated: 1,
        }
    }

    /// Higher value wins; equal values keep the lower index.
    fn merge(self, other: Self) -> Self {
        let winner = if self.value > other.value
            || (self.value == other.value && self.index < other.index)
        {
            self
        } else {
            other
        };
        Self {
            evaluated: self.evaluated + other.evaluated,
            ..winner
        }
    }
}

impl WeightOptimizer for GridSearchOptimizer {
    fn name(&self) -> &'static str {
        "grid_search"
    }

    fn fit(&self, table: &FeatureTable, target: TargetColumn) -> Result<WeightVector> {
        Ok(self.search(table, target)?.weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FeatureRecord;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    const TARGET: TargetColumn = TargetColumn::Current(Feature::Ret1m);

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// ret_3m equals the target; mdd_36m is noise.
    fn table() -> FeatureTable {
        let rows = [
            ("A", date(2020, 1, 31), 0.05, -0.1),
            ("B", date(2020, 1, 31), -0.01, -0.3),
            ("A", date(2020, 2, 29), -0.02, -0.2),
            ("B", date(2020, 2, 29), 0.04, -0.1),
            ("A", date(2020, 3, 31), 0.03, -0.3),
            ("B", date(2020, 3, 31), 0.01, -0.2),
        ];
        FeatureTable::from_records(
            rows.iter()
                .map(|(id, d, ret, mdd)| {
                    FeatureRecord::new(*id, *d)
                        .with_value(Feature::Ret1m, *ret)
                        .with_value(Feature::Ret3m, *ret)
                        .with_value(Feature::Mdd36m, *mdd)
                })
                .collect(),
        )
    }

    fn config(top_k: usize) -> GridSearchConfig {
        GridSearchConfig {
            top_k,
            ..GridSearchConfig::default()
        }
    }

    #[test]
    fn test_enumeration_order() {
        let space = WeightSpace::shared(&[Feature::Ret3m, Feature::Ret6m], &[0.0, 1.0, 2.0]).unwrap();
        assert_eq!(space.combinations(), Some(9));
        assert_eq!(space.combination(0), vec![0.0, 0.0]);
        assert_eq!(space.combination(1), vec![0.0, 1.0]);
        assert_eq!(space.combination(3), vec![1.0, 0.0]);
        assert_eq!(space.combination(8), vec![2.0, 2.0]);
    }

    #[test]
    fn test_from_range_is_inclusive() {
        let space = WeightSpace::from_range(&[Feature::Ret3m], 0.0, 0.2, 0.1).unwrap();
        let grid = &space.dims()[0].1;
        assert_eq!(grid.len(), 3);
        assert_relative_eq!(grid[2], 0.2, epsilon = 1e-12);
        assert!(WeightSpace::from_range(&[Feature::Ret3m], 0.0, 0.2, 0.0).is_err());
        assert!(WeightSpace::from_range(&[Feature::Ret3m], 0.3, 0.2, 0.1).is_err());
    }

    #[test]
    fn test_finds_predictive_direction() {
        let space = WeightSpace::shared(&[Feature::Ret3m], &[-1.0, 1.0]).unwrap();
        let outcome = GridSearchOptimizer::new(space, config(1))
            .unwrap()
            .search(&table(), TARGET)
            .unwrap();

        assert_eq!(outcome.weights.get(Feature::Ret3m), 1.0);
        assert_eq!(outcome.mode, SearchMode::Exhaustive);
        assert_eq!(outcome.evaluated, 2);
        assert!(outcome.metrics.sharpe > 0.0);
        assert_eq!(outcome.metrics.hit_rate, 1.0);
    }

    #[test]
    fn test_zero_vector_never_selected_and_first_max_wins() {
        // A single instrument per snapshot makes every candidate tie.
        let table = table().filter(|r| r.instrument_id == "A");
        let space = WeightSpace::shared(&[Feature::Ret3m], &[0.0, 1.0, 2.0]).unwrap();
        let outcome = GridSearchOptimizer::new(space, config(1))
            .unwrap()
            .search(&table, TARGET)
            .unwrap();

        assert_eq!(outcome.evaluated, 2);
        assert_eq!(outcome.weights.get(Feature::Ret3m), 1.0);
    }

    #[test]
    fn test_leader_merge_keeps_first_max() {
        let tie = Leader::single(3, 1.0).merge(Leader::single(1, 1.0));
        assert_eq!((tie.index, tie.evaluated), (1, 2));

        let higher = Leader::single(0, f64::NEG_INFINITY).merge(Leader::single(2, 0.5));
        assert_eq!(higher.index, 2);

        // Merge order does not change the winner.
        let parts = [Leader::single(4, 0.2), Leader::single(0, 0.7), Leader::single(2, 0.7)];
        let left = parts[0].merge(parts[1]).merge(parts[2]);
        let right = parts[2].merge(parts[0].merge(parts[1]));
        assert_eq!(left, right);
        assert_eq!((left.index, left.evaluated), (0, 3));
    }

    #[test]
    fn test_exhaustive_matches_sequential_scan() {
        let features = [Feature::Ret1m, Feature::Ret3m, Feature::Mdd36m];
        let space = WeightSpace::shared(&features, &[-1.0, 0.0, 1.0]).unwrap();
        let config = GridSearchConfig {
            mode: SearchMode::Exhaustive,
            ..config(1)
        };
        let outcome = GridSearchOptimizer::new(space.clone(), config)
            .unwrap()
            .search(&table(), TARGET)
            .unwrap();
        assert_eq!(outcome.evaluated, 26);

        let table = table();
        let matrix = FeatureMatrix::from_table(&table, &features).unwrap();
        let frame = EvaluationFrame::from_table(&table, TARGET);
        let mut best: Option<(Vec<f64>, f64)> = None;
        for idx in 0..space.combinations().unwrap() {
            let values = space.combination(idx);
            if values.iter().all(|v| *v == 0.0) {
                continue;
            }
            let sharpe = frame.metrics(&matrix.dot(&values), 1).sharpe;
            let value = if sharpe.is_nan() { f64::NEG_INFINITY } else { sharpe };
            if best.as_ref().map_or(true, |(_, b)| value > *b) {
                best = Some((values, value));
            }
        }
        let (values, value) = best.unwrap();
        assert_eq!(outcome.objective_value, value);
        assert_eq!(outcome.weights, space.to_weights(&values));
    }

    #[test]
    fn test_constraints() {
        let features = [Feature::Ret3m, Feature::Mdd36m];
        let constraints = SearchConstraints {
            min_abs_weight: 0.5,
            caps: BTreeMap::from([(Feature::Mdd36m, 0.5)]),
        };
        assert!(constraints.admits(&features, &[1.0, 0.5]));
        assert!(!constraints.admits(&features, &[1.0, 0.0]));
        assert!(!constraints.admits(&features, &[1.0, 1.0]));
        assert!(!constraints.admits(&features, &[0.0, 0.0]));

        let space = WeightSpace::shared(&features, &[0.0, 0.5, 1.0]).unwrap();
        let config = GridSearchConfig {
            constraints,
            top_k: 1,
            ..GridSearchConfig::default()
        };
        let outcome = GridSearchOptimizer::new(space, config)
            .unwrap()
            .search(&table(), TARGET)
            .unwrap();
        // (0.5|1.0) x (0.5) survive.
        assert_eq!(outcome.evaluated, 2);
        assert_eq!(outcome.weights.get(Feature::Mdd36m), 0.5);
    }

    #[test]
    fn test_configuration_errors() {
        let space = WeightSpace::shared(&[Feature::Ret3m], &[0.0, 1.0]).unwrap();
        let stray_cap = GridSearchConfig {
            constraints: SearchConstraints {
                min_abs_weight: 0.0,
                caps: BTreeMap::from([(Feature::Ret6m, 0.1)]),
            },
            ..GridSearchConfig::default()
        };
        assert!(GridSearchOptimizer::new(space.clone(), stray_cap).is_err());
        assert!(GridSearchOptimizer::new(space, config(0)).is_err());

        let only_zero = WeightSpace::shared(&[Feature::Ret3m], &[0.0]).unwrap();
        let err = GridSearchOptimizer::new(only_zero, config(1))
            .unwrap()
            .search(&table(), TARGET)
            .unwrap_err();
        assert!(matches!(err, ResearchError::Configuration(_)));

        let missing = WeightSpace::shared(&[Feature::Ret12m], &[1.0]).unwrap();
        let err = GridSearchOptimizer::new(missing, config(1))
            .unwrap()
            .search(&table(), TARGET)
            .unwrap_err();
        assert!(matches!(err, ResearchError::Configuration(_)));
    }

    #[test]
    fn test_missing_targets_are_insufficient() {
        let space = WeightSpace::shared(&[Feature::Ret3m], &[1.0]).unwrap();
        let err = GridSearchOptimizer::new(space, config(1))
            .unwrap()
            .search(&table(), TargetColumn::Forward(Feature::Ret1m))
            .unwrap_err();
        assert!(err.is_insufficient_data());
    }

    #[test]
    fn test_random_search_is_seeded() {
        let features = [
            Feature::Ret1m,
            Feature::Ret3m,
            Feature::Ret6m,
            Feature::Ret12m,
            Feature::Ret24m,
            Feature::Mdd36m,
        ];
        let mut records = Vec::new();
        for record in table().into_records() {
            let mut record = record;
            for f in [Feature::Ret6m, Feature::Ret12m, Feature::Ret24m] {
                record.values.insert(f, 0.0);
            }
            records.push(record);
        }
        let table = FeatureTable::from_records(records);

        let space = WeightSpace::shared(&features, &[-1.0, 0.0, 1.0]).unwrap();
        let config = GridSearchConfig {
            trials: 50,
            seed: 7,
            top_k: 1,
            ..GridSearchConfig::default()
        };
        let optimizer = GridSearchOptimizer::new(space, config).unwrap();

        let first = optimizer.search(&table, TARGET).unwrap();
        let second = optimizer.search(&table, TARGET).unwrap();
        assert_eq!(first.mode, SearchMode::Random);
        assert_eq!(first, second);
        assert!(!first.weights.is_zero());
    }
}
