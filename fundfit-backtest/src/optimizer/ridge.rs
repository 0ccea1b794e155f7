//! Closed-form ridge regression of a target return on features.

use std::collections::HashMap;

use chrono::NaiveDate;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::WeightOptimizer;
use crate::data::{Feature, FeatureRecord, FeatureTable, TargetColumn};
use crate::error::{ResearchError, Result};
use crate::scoring::{rank_by_score, FeatureMatrix, WeightVector};

/// Solve `(X'X + lambda I) w = X'y`.
pub fn ridge_solve(x: &DMatrix<f64>, y: &DVector<f64>, lambda: f64) -> Result<DVector<f64>> {
    if x.nrows() == 0 || x.ncols() == 0 {
        return Err(ResearchError::insufficient("empty design matrix"));
    }
    let xt = x.transpose();
    let mut gram = &xt * x;
    for i in 0..gram.ncols() {
        gram[(i, i)] += lambda;
    }
    let rhs = &xt * y;

    gram.lu()
        .solve(&rhs)
        .filter(|w| w.iter().all(|v| v.is_finite()))
        .ok_or_else(|| ResearchError::insufficient("normal equations are singular"))
}

/// Fitted coefficients and in-sample fit quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeFit {
    pub weights: WeightVector,
    pub lambda: f64,
    pub observations: usize,
    pub r_squared: f64,
}

/// Ridge regression over a fixed feature list.
#[derive(Debug, Clone)]
pub struct RidgeOptimizer {
    features: Vec<Feature>,
    lambda: f64,
}

impl RidgeOptimizer {
    pub fn new(features: Vec<Feature>, lambda: f64) -> Result<Self> {
        if features.is_empty() {
            return Err(ResearchError::config("ridge regression needs at least one feature"));
        }
        if !(lambda >= 0.0 && lambda.is_finite()) {
            return Err(ResearchError::config(format!(
                "ridge lambda must be non-negative, got {}",
                lambda
            )));
        }
        Ok(Self { features, lambda })
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    /// Fit on every record of `table` with a defined target.
    pub fn fit_detailed(&self, table: &FeatureTable, target: TargetColumn) -> Result<RidgeFit> {
        table.require_columns(&self.features)?;
        let usable = table.filter(|r| r.target(target).is_some());
        let y: Vec<f64> = usable.records().iter().filter_map(|r| r.target(target)).collect();
        self.fit_rows(&usable, y)
    }

    fn fit_rows(&self, rows: &FeatureTable, y: Vec<f64>) -> Result<RidgeFit> {
        if rows.is_empty() {
            return Err(ResearchError::insufficient("no rows with a target to fit"));
        }
        let matrix = FeatureMatrix::from_table(rows, &self.features)?;
        let x = DMatrix::from_row_slice(matrix.rows(), matrix.cols(), matrix.values());
        let y = DVector::from_vec(y);

        let w = ridge_solve(&x, &y, self.lambda)?;
        let r_squared = r_squared(&(&x * &w), &y);

        Ok(RidgeFit {
            weights: self.features.iter().copied().zip(w.iter().copied()).collect(),
            lambda: self.lambda,
            observations: rows.len(),
            r_squared,
        })
    }
}

impl WeightOptimizer for RidgeOptimizer {
    fn name(&self) -> &'static str {
        "ridge"
    }

    fn fit(&self, table: &FeatureTable, target: TargetColumn) -> Result<WeightVector> {
        Ok(self.fit_detailed(table, target)?.weights)
    }
}

fn r_squared(fitted: &DVector<f64>, y: &DVector<f64>) -> f64 {
    let mean = y.mean();
    let total: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let residual: f64 = y.iter().zip(fitted.iter()).map(|(a, b)| (a - b).powi(2)).sum();
    1.0 - residual / total
}

/// Ridge fit from one snapshot's features to a later snapshot's realized return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossSectionalFit {
    pub train_snapshot: NaiveDate,
    pub target_snapshot: NaiveDate,
    pub horizon_months: u32,
    pub top_k: usize,
    #[serde(flatten)]
    pub fit: RidgeFit,
    /// Instruments in both the predicted and the realized top-K.
    pub overlap_count: usize,
    /// `overlap_count / top_k`.
    pub overlap_rate: f64,
    pub actual_top_avg_return: f64,
    pub predicted_top_avg_return: f64,
}

impl RidgeOptimizer {
    /// Fit features at `train_snapshot` against `ret_{h}m` at `target_snapshot`.
    ///
    /// Instruments missing from either snapshot are dropped.
    pub fn fit_cross_section(
        &self,
        table: &FeatureTable,
        train_snapshot: NaiveDate,
        target_snapshot: NaiveDate,
        horizon_months: u32,
        top_k: usize,
    ) -> Result<CrossSectionalFit> {
        if top_k == 0 {
            return Err(ResearchError::config("top_k must be positive"));
        }
        if target_snapshot <= train_snapshot {
            return Err(ResearchError::config(format!(
                "target snapshot {} must follow train snapshot {}",
                target_snapshot, train_snapshot
            )));
        }
        let realized = Feature::return_for_months(horizon_months).ok_or_else(|| {
            ResearchError::config(format!("no return feature for {} months", horizon_months))
        })?;
        table.require_columns(&self.features)?;
        table.require_columns(&[realized])?;

        let future: HashMap<&str, f64> = table
            .records()
            .iter()
            .filter(|r| r.snapshot_date == target_snapshot)
            .filter_map(|r| Some((r.instrument_id.as_str(), r.get(realized)?)))
            .collect();

        let joined: Vec<(FeatureRecord, f64)> = table
            .records()
            .iter()
            .filter(|r| r.snapshot_date == train_snapshot)
            .filter_map(|r| Some((r.clone(), *future.get(r.instrument_id.as_str())?)))
            .collect();
        if joined.is_empty() {
            return Err(ResearchError::insufficient(format!(
                "no instruments shared by {} and {}",
                train_snapshot, target_snapshot
            )));
        }

        let (records, y): (Vec<FeatureRecord>, Vec<f64>) = joined.into_iter().unzip();
        let rows = FeatureTable::new(table.columns().clone(), records);
        let fit = self.fit_rows(&rows, y.clone())?;

        let predicted = FeatureMatrix::from_table(&rows, &self.features)?.score(&fit.weights);
        let predicted_top: Vec<usize> = rank_by_score(&predicted).into_iter().take(top_k).collect();
        let actual_top: Vec<usize> = rank_by_score(&y).into_iter().take(top_k).collect();
        let overlap_count = predicted_top.iter().filter(|i| actual_top.contains(i)).count();
        let mean_of = |idx: &[usize]| idx.iter().map(|i| y[*i]).sum::<f64>() / idx.len() as f64;

        info!(
            "Cross-sectional fit {} -> {}: {} instruments, top {} overlap {}",
            train_snapshot,
            target_snapshot,
            rows.len(),
            top_k,
            overlap_count
        );

        Ok(CrossSectionalFit {
            train_snapshot,
            target_snapshot,
            horizon_months,
            top_k,
            overlap_count,
            overlap_rate: overlap_count as f64 / top_k as f64,
            actual_top_avg_return: mean_of(&actual_top),
            predicted_top_avg_return: mean_of(&predicted_top),
            fit,
        })
    }
}
