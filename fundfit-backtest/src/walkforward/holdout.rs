//! Hold-out check of a fixed weight vector against realized prices.
//!
//! For each prediction date the snapshot at that date is scored and the top-K
//! is held until `prediction_date + horizon`. The holding is compared with the
//! instruments that actually led on `ret_{h}m` at the evaluation snapshot.
//! Agreement is reported as `overlap_rate`, which is not the median-based hit
//! rate of the portfolio evaluator.

use std::collections::BTreeSet;

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::validator::MetricSummary;
use crate::data::{Feature, FeatureStore, PriceStore, SnapshotFilter};
use crate::error::{ResearchError, Result};
use crate::scoring::{rank_by_score, Scorer, WeightVector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoldoutConfig {
    pub horizon_months: u32,
    pub top_k: usize,
}

impl Default for HoldoutConfig {
    fn default() -> Self {
        Self {
            horizon_months: 6,
            top_k: 30,
        }
    }
}

/// Outcome of one prediction date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldoutResult {
    pub prediction_date: NaiveDate,
    pub evaluation_date: NaiveDate,
    pub top_k: usize,
    pub predicted: Vec<String>,
    pub actual_top: Vec<String>,
    /// Instruments in both lists, sorted.
    pub hits: Vec<String>,
    pub overlap_count: usize,
    /// `overlap_count / top_k`.
    pub overlap_rate: f64,
    /// Mean realized price return of the predicted holding.
    pub predicted_avg_return: f64,
    /// Mean `ret_{h}m` of the actual leaders.
    pub actual_top_avg_return: f64,
    pub return_gap: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HoldoutSummary {
    pub predictions: usize,
    pub skipped: usize,
    pub overlap_rate: MetricSummary,
    pub predicted_avg_return: f64,
    pub actual_top_avg_return: f64,
    pub return_gap: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldoutReport {
    pub summary: HoldoutSummary,
    pub results: Vec<HoldoutResult>,
    /// Prediction dates without data.
    pub skipped: Vec<NaiveDate>,
}

impl HoldoutReport {
    pub fn report(&self) -> String {
        let rule = "=".repeat(80);
        let thin = "-".repeat(80);
        let mut out = format!("{}\nHOLD-OUT VALIDATION REPORT\n{}\n", rule, rule);

        if self.results.is_empty() {
            out.push_str("\nNo validation results available.\n");
            return out;
        }

        let s = &self.summary;
        out.push_str(&format!(
            "\nSUMMARY:\n  \
             Total Predictions: {} ({} skipped)\n  \
             Average Overlap Rate: {:.2}%\n  \
             Median Overlap Rate: {:.2}%\n  \
             Best Overlap Rate: {:.2}%\n  \
             Worst Overlap Rate: {:.2}%\n\n  \
             Predicted Portfolio Avg Return: {:.2}%\n  \
             Actual Top Avg Return: {:.2}%\n  \
             Average Return Gap: {:.2}%\n",
            s.predictions,
            s.skipped,
            s.overlap_rate.mean * 100.0,
            s.overlap_rate.median * 100.0,
            s.overlap_rate.max * 100.0,
            s.overlap_rate.min * 100.0,
            s.predicted_avg_return * 100.0,
            s.actual_top_avg_return * 100.0,
            s.return_gap * 100.0,
        ));

        out.push_str(&format!("\n{}\nDETAILED RESULTS:\n{}\n", thin, thin));
        for r in &self.results {
            out.push_str(&format!(
                "\nPrediction: {} -> {}\n  \
                 Overlap Rate: {:.2}% ({}/{})\n  \
                 Predicted Avg Return: {:.2}%\n  \
                 Actual Top Avg Return: {:.2}%\n  \
                 Return Gap: {:.2}%\n",
                r.prediction_date,
                r.evaluation_date,
                r.overlap_rate * 100.0,
                r.overlap_count,
                r.top_k,
                r.predicted_avg_return * 100.0,
                r.actual_top_avg_return * 100.0,
                r.return_gap * 100.0,
            ));
        }
        out.push_str(&format!("\n{}\n", rule));
        out
    }
}

/// Checks a weight vector's picks against what happened afterwards.
pub struct HoldoutValidator {
    scorer: Scorer,
    config: HoldoutConfig,
    realized: Feature,
}

impl HoldoutValidator {
    pub fn new(weights: WeightVector, config: HoldoutConfig) -> Result<Self> {
        if config.top_k == 0 {
            return Err(ResearchError::config("top_k must be positive"));
        }
        let realized = Feature::return_for_months(config.horizon_months).ok_or_else(|| {
            ResearchError::config(format!(
                "no return feature for a {}-month horizon",
                config.horizon_months
            ))
        })?;
        Ok(Self {
            scorer: Scorer::new(weights),
            config,
            realized,
        })
    }

    /// Validate a single prediction date.
    pub fn validate_prediction<F, P>(
        &self,
        features: &F,
        source: &str,
        prices: &P,
        prediction_date: NaiveDate,
    ) -> Result<HoldoutResult>
    where
        F: FeatureStore + ?Sized,
        P: PriceStore + ?Sized,
    {
        let top_k = self.config.top_k;
        let evaluation_date = prediction_date
            .checked_add_months(Months::new(self.config.horizon_months))
            .ok_or_else(|| ResearchError::config(format!("date overflow after {}", prediction_date)))?;

        let at_prediction = features.load_features(source, &SnapshotFilter::on(prediction_date))?;
        let predicted: Vec<String> = self
            .scorer
            .rank_snapshot(&at_prediction, prediction_date, top_k)?
            .into_iter()
            .map(|r| r.record.instrument_id)
            .collect();

        let at_evaluation = features.load_features(source, &SnapshotFilter::on(evaluation_date))?;
        let leaders: Vec<(String, f64)> = at_evaluation
            .records()
            .iter()
            .filter_map(|r| Some((r.instrument_id.clone(), r.get(self.realized)?)))
            .collect();
        if leaders.is_empty() {
            return Err(ResearchError::insufficient(format!(
                "no {} values at {}",
                self.realized, evaluation_date
            )));
        }
        let values: Vec<f64> = leaders.iter().map(|(_, v)| *v).collect();
        let top: Vec<usize> = rank_by_score(&values).into_iter().take(top_k).collect();
        let actual_top: Vec<String> = top.iter().map(|i| leaders[*i].0.clone()).collect();
        let actual_top_avg_return = top.iter().map(|i| values[*i]).sum::<f64>() / top.len() as f64;

        // Instruments with fewer than two prices in range count as flat.
        let mut realized = Vec::with_capacity(predicted.len());
        for id in &predicted {
            let series = prices.load_prices(id, prediction_date, evaluation_date)?;
            realized.push(series.total_return().unwrap_or(0.0));
        }
        let predicted_avg_return = realized.iter().sum::<f64>() / realized.len() as f64;

        let actual_set: BTreeSet<&String> = actual_top.iter().collect();
        let hits: Vec<String> = predicted
            .iter()
            .filter(|id| actual_set.contains(id))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let overlap_count = hits.len();

        Ok(HoldoutResult {
            prediction_date,
            evaluation_date,
            top_k,
            predicted,
            actual_top,
            hits,
            overlap_count,
            overlap_rate: overlap_count as f64 / top_k as f64,
            predicted_avg_return,
            actual_top_avg_return,
            return_gap: predicted_avg_return - actual_top_avg_return,
        })
    }

    /// Validate every prediction date, skipping those without data.
    pub fn run<F, P>(
        &self,
        features: &F,
        source: &str,
        prices: &P,
        prediction_dates: &[NaiveDate],
    ) -> Result<HoldoutReport>
    where
        F: FeatureStore + ?Sized,
        P: PriceStore + ?Sized,
    {
        let mut results = Vec::new();
        let mut skipped = Vec::new();
        for date in prediction_dates {
            match self.validate_prediction(features, source, prices, *date) {
                Ok(result) => {
                    info!(
                        "{} -> {}: overlap {}/{}, predicted {:.2}%, actual top {:.2}%",
                        result.prediction_date,
                        result.evaluation_date,
                        result.overlap_count,
                        result.top_k,
                        result.predicted_avg_return * 100.0,
                        result.actual_top_avg_return * 100.0
                    );
                    results.push(result);
                }
                Err(e) if e.is_insufficient_data() => {
                    warn!("Skipping prediction date {}: {}", date, e);
                    skipped.push(*date);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(HoldoutReport {
            summary: summarize(&results, skipped.len()),
            results,
            skipped,
        })
    }
}

fn summarize(results: &[HoldoutResult], skipped: usize) -> HoldoutSummary {
    let mean = |f: fn(&HoldoutResult) -> f64| {
        if results.is_empty() {
            0.0
        } else {
            results.iter().map(f).sum::<f64>() / results.len() as f64
        }
    };
    let overlaps: Vec<f64> = results.iter().map(|r| r.overlap_rate).collect();
    HoldoutSummary {
        predictions: results.len(),
        skipped,
        overlap_rate: MetricSummary::from_values(&overlaps),
        predicted_avg_return: mean(|r| r.predicted_avg_return),
        actual_top_avg_return: mean(|r| r.actual_top_avg_return),
        return_gap: mean(|r| r.return_gap),
    }
}
