//! Cross-sectional linear scorer.

use std::cmp::Ordering;

use chrono::NaiveDate;

use super::weights::WeightVector;
use crate::data::{Feature, FeatureRecord, FeatureTable};
use crate::error::{ResearchError, Result};

/// Dense row-major feature values for a fixed feature order.
///
/// Missing values are stored as 0 so every row contributes to a dot product.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMatrix {
    features: Vec<Feature>,
    data: Vec<f64>,
    rows: usize,
}

impl FeatureMatrix {
    /// Extract `features` from every record, failing if any is not a column.
    pub fn from_table(table: &FeatureTable, features: &[Feature]) -> Result<Self> {
        table.require_columns(features)?;

        let mut data = Vec::with_capacity(table.len() * features.len());
        for record in table.records() {
            data.extend(features.iter().map(|f| record.get(*f).unwrap_or(0.0)));
        }

        Ok(Self {
            features: features.to_vec(),
            data,
            rows: table.len(),
        })
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.features.len()
    }

    /// All values, row-major.
    pub fn values(&self) -> &[f64] {
        &self.data
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        let cols = self.cols();
        &self.data[idx * cols..(idx + 1) * cols]
    }

    /// Row-wise dot product with `coefficients` (one per feature).
    pub fn dot(&self, coefficients: &[f64]) -> Vec<f64> {
        (0..self.rows)
            .map(|i| {
                self.row(i)
                    .iter()
                    .zip(coefficients)
                    .map(|(x, w)| x * w)
                    .sum()
            })
            .collect()
    }

    /// Dot product with a weight vector keyed by feature.
    pub fn score(&self, weights: &WeightVector) -> Vec<f64> {
        let coefficients: Vec<f64> = self.features.iter().map(|f| weights.get(*f)).collect();
        self.dot(&coefficients)
    }
}

/// Indices ordered by score descending; ties keep input order, NaN sorts last.
pub fn rank_by_score(scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| compare_desc(scores[*a], scores[*b]));
    order
}

fn compare_desc(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

/// A feature record with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: FeatureRecord,
    pub score: f64,
}

/// Scored records in the order of the source table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoredTable {
    records: Vec<ScoredRecord>,
}

impl ScoredTable {
    pub fn from_records(records: Vec<ScoredRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[ScoredRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ScoredRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn scores(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.score).collect()
    }
}

/// Applies a fixed weight vector to feature tables.
#[derive(Debug, Clone)]
pub struct Scorer {
    weights: WeightVector,
}

impl Scorer {
    pub fn new(weights: WeightVector) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &WeightVector {
        &self.weights
    }

    /// Score every record as the exact dot product with the weights.
    ///
    /// Weighted features that are not table columns are a configuration
    /// error; missing values inside a present column count as 0.
    pub fn score(&self, table: &FeatureTable) -> Result<ScoredTable> {
        let matrix = FeatureMatrix::from_table(table, &self.weights.features())?;
        let scores = matrix.score(&self.weights);

        let records = table
            .records()
            .iter()
            .zip(scores)
            .map(|(record, score)| ScoredRecord {
                record: record.clone(),
                score,
            })
            .collect();
        Ok(ScoredTable { records })
    }

    /// The `top_k` highest-scored instruments at one snapshot date.
    pub fn rank_snapshot(
        &self,
        table: &FeatureTable,
        snapshot_date: NaiveDate,
        top_k: usize,
    ) -> Result<Vec<ScoredRecord>> {
        if top_k == 0 {
            return Err(ResearchError::config("top_k must be positive"));
        }
        let snapshot = table.snapshot(snapshot_date);
        if snapshot.is_empty() {
            return Err(ResearchError::insufficient(format!(
                "no feature records at {}",
                snapshot_date
            )));
        }

        let scored = self.score(&snapshot)?;
        Ok(rank_by_score(&scored.scores())
            .into_iter()
            .take(top_k)
            .map(|idx| scored.records()[idx].clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn table() -> FeatureTable {
        let d = date(2024, 6, 28);
        FeatureTable::from_records(vec![
            FeatureRecord::new("A", d)
                .with_value(Feature::Ret6m, 0.10)
                .with_value(Feature::Mdd36m, -0.20),
            FeatureRecord::new("B", d)
                .with_value(Feature::Ret6m, 0.05)
                .with_value(Feature::Mdd36m, -0.05),
            FeatureRecord::new("C", d).with_value(Feature::Ret6m, 0.08),
        ])
    }

    #[test]
    fn test_score_is_dot_product() {
        let weights = WeightVector::new()
            .with(Feature::Ret6m, 2.0)
            .with(Feature::Mdd36m, 1.0);
        let scored = Scorer::new(weights).score(&table()).unwrap();

        let scores = scored.scores();
        assert_relative_eq!(scores[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(scores[1], 0.05, epsilon = 1e-12);
        // C has no mdd_36m value, which counts as 0.
        assert_relative_eq!(scores[2], 0.16, epsilon = 1e-12);
    }

    #[test]
    fn test_unknown_column_is_config_error() {
        let weights = WeightVector::new().with(Feature::Ret12m, 1.0);
        let err = Scorer::new(weights).score(&table()).unwrap_err();
        assert!(matches!(err, ResearchError::Configuration(_)));
    }

    #[test]
    fn test_rank_by_score_is_stable() {
        let order = rank_by_score(&[1.0, f64::NAN, 3.0, 1.0, 3.0]);
        assert_eq!(order, vec![2, 4, 0, 3, 1]);
    }

    #[test]
    fn test_rank_snapshot() {
        let scorer = Scorer::new(WeightVector::new().with(Feature::Ret6m, 1.0));
        let top = scorer.rank_snapshot(&table(), date(2024, 6, 28), 2).unwrap();
        let ids: Vec<&str> = top.iter().map(|r| r.record.instrument_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);

        assert!(scorer.rank_snapshot(&table(), date(2024, 6, 28), 0).is_err());
        let err = scorer.rank_snapshot(&table(), date(2024, 7, 31), 2).unwrap_err();
        assert!(err.is_insufficient_data());
    }

    #[test]
    fn test_matrix_rows() {
        let matrix = FeatureMatrix::from_table(&table(), &[Feature::Mdd36m, Feature::Ret6m]).unwrap();
        assert_eq!(matrix.rows(), 3);
        assert_eq!(matrix.row(2), &[0.0, 0.08]);
        assert_eq!(matrix.dot(&[1.0, 0.0]), vec![-0.20, -0.05, 0.0]);
    }
}
