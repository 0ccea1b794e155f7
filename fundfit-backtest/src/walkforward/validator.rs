//! Walk-forward validation of weight optimizers.
//!
//! Every window fits weights on its training slice only, then scores and
//! evaluates the following test slice with those weights. Slices are cut to
//! their half-open date range before forward targets are attached, so no
//! training target reaches into the test period.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics, Statistics};
use tracing::{info, warn};

use super::periods::{ValidationWindow, WindowConfig, WindowGenerator};
use crate::data::{prepare_targets, FeatureStore, FeatureTable, SnapshotFilter, TargetColumn};
use crate::error::{ResearchError, Result};
use crate::metrics::{PortfolioEvaluator, PortfolioResult};
use crate::optimizer::WeightOptimizer;
use crate::scoring::{Scorer, WeightVector};

/// Walk-forward run configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkForwardConfig {
    #[serde(flatten)]
    pub windows: WindowConfig,
    /// Forward return horizon used as the target (`future_ret_{h}m`).
    pub horizon_months: u32,
    /// Instruments held per snapshot in the test portfolio.
    pub top_k: usize,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            windows: WindowConfig::default(),
            horizon_months: 6,
            top_k: 30,
        }
    }
}

impl WalkForwardConfig {
    pub fn validate(&self) -> Result<()> {
        self.windows.validate()?;
        if self.top_k == 0 {
            return Err(ResearchError::config("top_k must be positive"));
        }
        TargetColumn::forward_return(self.horizon_months)?;
        Ok(())
    }

    pub fn target(&self) -> Result<TargetColumn> {
        TargetColumn::forward_return(self.horizon_months)
    }
}

/// Outcome of one evaluated window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    #[serde(flatten)]
    pub window: ValidationWindow,
    pub weights: WeightVector,
    pub train_records: usize,
    pub test_records: usize,
    pub portfolio: PortfolioResult,
}

/// A window dropped for lack of data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedWindow {
    pub window_id: usize,
    pub reason: String,
}

/// Distribution of one metric across windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation.
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl MetricSummary {
    /// Summary of `values`; all zeros when empty.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let mut data = Data::new(values.to_vec());
        Self {
            mean: values.iter().mean(),
            median: data.median(),
            std: values.iter().population_std_dev(),
            min: Statistics::min(values.iter()),
            max: Statistics::max(values.iter()),
        }
    }
}

/// Cross-window aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total_windows: usize,
    pub evaluated_windows: usize,
    pub skipped_windows: usize,
    pub hit_rate: MetricSummary,
    pub sharpe: MetricSummary,
    pub annual_return: MetricSummary,
    pub max_drawdown: MetricSummary,
}

impl ValidationSummary {
    pub fn from_results(results: &[WindowResult], skipped: usize) -> Self {
        let collect = |f: fn(&WindowResult) -> f64| -> Vec<f64> { results.iter().map(f).collect() };
        Self {
            total_windows: results.len() + skipped,
            evaluated_windows: results.len(),
            skipped_windows: skipped,
            hit_rate: MetricSummary::from_values(&collect(|r| r.portfolio.metrics.hit_rate)),
            sharpe: MetricSummary::from_values(&collect(|r| r.portfolio.metrics.sharpe)),
            annual_return: MetricSummary::from_values(&collect(|r| {
                r.portfolio.metrics.annual_return
            })),
            max_drawdown: MetricSummary::from_values(&collect(|r| {
                r.portfolio.metrics.max_drawdown
            })),
        }
    }
}

/// Result of a full walk-forward run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub optimizer: String,
    pub target: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub summary: ValidationSummary,
    pub windows: Vec<WindowResult>,
    pub skipped: Vec<SkippedWindow>,
}

impl ValidationReport {
    /// Human-readable report.
    pub fn report(&self) -> String {
        let rule = "=".repeat(80);
        let thin = "-".repeat(80);
        let s = &self.summary;

        let mut out = String::new();
        out.push_str(&format!("{}\nWALK-FORWARD VALIDATION REPORT\n{}\n\n", rule, rule));
        out.push_str(&format!(
            "Optimizer: {}\n\
             Target: {}\n\
             Range: {} to {}\n\n",
            self.optimizer, self.target, self.start_date, self.end_date
        ));
        out.push_str(&format!(
            "OVERALL SUMMARY:\n  \
             Total Windows: {} ({} evaluated, {} skipped)\n  \
             Average Hit Rate: {:.2}% (±{:.2}%)\n  \
             Average Sharpe: {:.2} (±{:.2})\n  \
             Average Annual Return: {:.2}% (±{:.2}%)\n  \
             Average Max Drawdown: {:.2}% (±{:.2}%)\n",
            s.total_windows,
            s.evaluated_windows,
            s.skipped_windows,
            s.hit_rate.mean * 100.0,
            s.hit_rate.std * 100.0,
            s.sharpe.mean,
            s.sharpe.std,
            s.annual_return.mean * 100.0,
            s.annual_return.std * 100.0,
            s.max_drawdown.mean * 100.0,
            s.max_drawdown.std * 100.0,
        ));

        out.push_str(&format!("\n{}\nWINDOW-BY-WINDOW RESULTS:\n{}\n", thin, thin));
        for result in &self.windows {
            let m = &result.portfolio.metrics;
            out.push_str(&format!(
                "\n{}\n  \
                 Hit Rate: {:.2}%\n  \
                 Sharpe: {:.2}\n  \
                 Annual Return: {:.2}%\n  \
                 Max Drawdown: {:.2}%\n  \
                 Weights: {}\n",
                result.window,
                m.hit_rate * 100.0,
                m.sharpe,
                m.annual_return * 100.0,
                m.max_drawdown * 100.0,
                result.weights,
            ));
        }
        for skipped in &self.skipped {
            out.push_str(&format!("\nWindow {}: skipped ({})\n", skipped.window_id, skipped.reason));
        }
        out.push_str(&format!("\n{}\n", rule));
        out
    }
}

/// Runs an optimizer through rolling train/test windows.
pub struct WalkForwardValidator {
    config: WalkForwardConfig,
}

impl WalkForwardValidator {
    pub fn new(config: WalkForwardConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &WalkForwardConfig {
        &self.config
    }

    /// Run every window between `start` and `end`, sequentially.
    ///
    /// Windows without enough data are skipped and listed in the report;
    /// any other error aborts the run.
    pub fn run<S, O>(
        &self,
        store: &S,
        source: &str,
        optimizer: &O,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ValidationReport>
    where
        S: FeatureStore + ?Sized,
        O: WeightOptimizer + ?Sized,
    {
        let target = self.config.target()?;
        let windows = WindowGenerator::new(self.config.windows, start, end)?.generate();
        info!(
            "Walk-forward: {} windows, optimizer {}, target {}",
            windows.len(),
            optimizer.name(),
            target
        );

        let mut results = Vec::with_capacity(windows.len());
        let mut skipped = Vec::new();
        for window in &windows {
            match self.run_window(store, source, optimizer, target, window) {
                Ok(result) => {
                    info!(
                        "Window {}: hit rate {:.2}%, Sharpe {:.2}",
                        window.window_id,
                        result.portfolio.metrics.hit_rate * 100.0,
                        result.portfolio.metrics.sharpe
                    );
                    results.push(result);
                }
                Err(e) if e.is_insufficient_data() => {
                    warn!("Skipping window {}: {}", window.window_id, e);
                    skipped.push(SkippedWindow {
                        window_id: window.window_id,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(ValidationReport {
            optimizer: optimizer.name().to_string(),
            target: target.name(),
            start_date: start,
            end_date: end,
            summary: ValidationSummary::from_results(&results, skipped.len()),
            windows: results,
            skipped,
        })
    }

    fn run_window<S, O>(
        &self,
        store: &S,
        source: &str,
        optimizer: &O,
        target: TargetColumn,
        window: &ValidationWindow,
    ) -> Result<WindowResult>
    where
        S: FeatureStore + ?Sized,
        O: WeightOptimizer + ?Sized,
    {
        let train = load_slice(store, source, window.train_start, window.train_end, target)?;
        let weights = optimizer.fit(&train, target)?;

        let test = load_slice(store, source, window.test_start, window.test_end, target)?;
        let scored = Scorer::new(weights.clone()).score(&test)?;
        let portfolio = PortfolioEvaluator::new(self.config.top_k)?
            .evaluate(&scored, target)?
            .with_label(format!("window_{}", window.window_id));

        Ok(WindowResult {
            window: *window,
            weights,
            train_records: train.len(),
            test_records: test.len(),
            portfolio,
        })
    }
}

/// Records with `start <= snapshot < end` that have a target inside the slice.
fn load_slice<S>(
    store: &S,
    source: &str,
    start: NaiveDate,
    end: NaiveDate,
    target: TargetColumn,
) -> Result<FeatureTable>
where
    S: FeatureStore + ?Sized,
{
    let filter = SnapshotFilter::between(start, end)?;
    let table = store.load_features(source, &filter)?.between(start, end);
    let prepared = prepare_targets(&table, target);
    if prepared.is_empty() {
        return Err(ResearchError::insufficient(format!(
            "no records with {} between {} and {}",
            target, start, end
        )));
    }
    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Feature, FeatureRecord, InMemoryStore};
    use crate::optimizer::{GridSearchConfig, GridSearchOptimizer, WeightSpace};
    use approx::assert_relative_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Six instruments with monthly snapshots; higher ret_3m means a higher
    /// next-month ret_1m.
    fn table(skip: impl Fn(NaiveDate) -> bool) -> FeatureTable {
        let mut records = Vec::new();
        for year in 2018..=2020 {
            for month in 1..=12 {
                let d = date(year, month, 28);
                if skip(d) {
                    continue;
                }
                for i in 0..6 {
                    let ret_1m = 0.005 * i as f64 + 0.001 * (month % 3) as f64;
                    records.push(
                        FeatureRecord::new(format!("F{}", i), d)
                            .with_value(Feature::Ret1m, ret_1m)
                            .with_value(Feature::Ret3m, 0.01 * i as f64),
                    );
                }
            }
        }
        FeatureTable::from_records(records)
    }

    struct FixedWeights(WeightVector);

    impl WeightOptimizer for FixedWeights {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn fit(&self, _table: &FeatureTable, _target: TargetColumn) -> Result<WeightVector> {
            Ok(self.0.clone())
        }
    }

    /// Fails unless every training record lies inside one half-open range.
    struct RangeCheck;

    impl WeightOptimizer for RangeCheck {
        fn name(&self) -> &'static str {
            "range_check"
        }

        fn fit(&self, table: &FeatureTable, _target: TargetColumn) -> Result<WeightVector> {
            let dates = table.snapshot_dates();
            let first = dates.first().copied().unwrap();
            let last = dates.last().copied().unwrap();
            assert!(last < first + chrono::Duration::days(366));
            Ok(WeightVector::new().with(Feature::Ret3m, 1.0))
        }
    }

    fn config() -> WalkForwardConfig {
        WalkForwardConfig {
            windows: WindowConfig {
                train_months: 12,
                test_months: 6,
                step_months: 6,
            },
            horizon_months: 1,
            top_k: 2,
        }
    }

    #[test]
    fn test_fixed_weights_run() {
        let store = InMemoryStore::new().with_table("features", table(|_| false));
        let optimizer = FixedWeights(WeightVector::new().with(Feature::Ret3m, 1.0));
        let report = WalkForwardValidator::new(config())
            .unwrap()
            .run(&store, "features", &optimizer, date(2018, 1, 1), date(2020, 12, 31))
            .unwrap();

        assert_eq!(report.summary.total_windows, 3);
        assert_eq!(report.summary.evaluated_windows, 3);
        assert!(report.skipped.is_empty());
        assert_eq!(report.target, "future_ret_1m");

        for result in &report.windows {
            // Six test snapshots, the last has no successor inside the slice.
            assert_eq!(result.portfolio.metrics.periods, 5);
            assert_eq!(result.test_records, 30);
            assert_eq!(result.portfolio.selected_instrument_ids, vec!["F5", "F4"]);
            assert_relative_eq!(result.portfolio.metrics.hit_rate, 1.0);
        }
        assert_relative_eq!(report.summary.hit_rate.mean, 1.0);
        assert_relative_eq!(report.summary.hit_rate.std, 0.0);
    }

    #[test]
    fn test_window_without_data_is_skipped() {
        let gap = |d: NaiveDate| d >= date(2019, 7, 1) && d < date(2020, 1, 1);
        let store = InMemoryStore::new().with_table("features", table(gap));
        let optimizer = FixedWeights(WeightVector::new().with(Feature::Ret3m, 1.0));
        let report = WalkForwardValidator::new(config())
            .unwrap()
            .run(&store, "features", &optimizer, date(2018, 1, 1), date(2020, 12, 31))
            .unwrap();

        assert_eq!(report.summary.total_windows, 3);
        assert_eq!(report.summary.evaluated_windows, 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].window_id, 2);
        assert!(report.report().contains("Window 2: skipped"));
    }

    #[test]
    fn test_training_slice_stays_in_window() {
        let store = InMemoryStore::new().with_table("features", table(|_| false));
        let report = WalkForwardValidator::new(config())
            .unwrap()
            .run(&store, "features", &RangeCheck, date(2018, 1, 1), date(2020, 12, 31))
            .unwrap();
        // Twelve training snapshots, the last of which has no target.
        assert!(report.windows.iter().all(|w| w.train_records == 66));
    }

    #[test]
    fn test_grid_search_picks_informative_sign() {
        let store = InMemoryStore::new().with_table("features", table(|_| false));
        let space = WeightSpace::shared(&[Feature::Ret3m], &[-1.0, 1.0]).unwrap();
        let optimizer = GridSearchOptimizer::new(
            space,
            GridSearchConfig {
                top_k: 2,
                ..GridSearchConfig::default()
            },
        )
        .unwrap();
        let report = WalkForwardValidator::new(config())
            .unwrap()
            .run(&store, "features", &optimizer, date(2018, 1, 1), date(2020, 12, 31))
            .unwrap();

        assert_eq!(report.optimizer, "grid_search");
        for result in &report.windows {
            assert_eq!(result.weights.get(Feature::Ret3m), 1.0);
        }
    }

    #[test]
    fn test_configuration_errors_abort() {
        let store = InMemoryStore::new().with_table("features", table(|_| false));
        let optimizer = FixedWeights(WeightVector::new().with(Feature::Ret12m, 1.0));
        let err = WalkForwardValidator::new(config())
            .unwrap()
            .run(&store, "features", &optimizer, date(2018, 1, 1), date(2020, 12, 31))
            .unwrap_err();
        assert!(matches!(err, ResearchError::Configuration(_)));

        let bad = WalkForwardConfig {
            horizon_months: 5,
            ..config()
        };
        assert!(WalkForwardValidator::new(bad).is_err());
        let zero = WalkForwardConfig { top_k: 0, ..config() };
        assert!(WalkForwardValidator::new(zero).is_err());
    }

    #[test]
    fn test_zero_windows_give_empty_report() {
        let store = InMemoryStore::new().with_table("features", table(|_| false));
        let optimizer = FixedWeights(WeightVector::new().with(Feature::Ret3m, 1.0));
        let report = WalkForwardValidator::new(config())
            .unwrap()
            .run(&store, "features", &optimizer, date(2018, 1, 1), date(2018, 12, 31))
            .unwrap();

        assert_eq!(report.summary.total_windows, 0);
        assert_eq!(report.summary.sharpe, MetricSummary::default());
        assert!(report.windows.is_empty());
    }

    #[test]
    fn test_metric_summary() {
        let summary = MetricSummary::from_values(&[1.0, 3.0, 2.0, 6.0]);
        assert_relative_eq!(summary.mean, 3.0);
        assert_relative_eq!(summary.median, 2.5);
        assert_relative_eq!(summary.std, 3.5f64.sqrt());
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 6.0);
    }

    #[test]
    fn test_report_serializes() {
        let store = InMemoryStore::new().with_table("features", table(|_| false));
        let optimizer = FixedWeights(WeightVector::new().with(Feature::Ret3m, 1.0));
        let report = WalkForwardValidator::new(config())
            .unwrap()
            .run(&store, "features", &optimizer, date(2018, 1, 1), date(2020, 12, 31))
            .unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["summary"]["total_windows"], 3);
        assert_eq!(json["windows"][0]["window_id"], 1);
        assert_eq!(json["windows"][0]["weights"]["ret_3m"], 1.0);
    }
}
