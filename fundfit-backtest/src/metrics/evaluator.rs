//! Top-K portfolio evaluation.
//!
//! Each snapshot date is one holding period: the `top_k` best-scored
//! instruments are held with equal weight and earn the mean of their target
//! returns. Periods are assumed monthly for annualization.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::data::{FeatureRecord, FeatureTable, TargetColumn};
use crate::error::{ResearchError, Result};
use crate::scoring::{rank_by_score, ScoredTable};

/// Periods per year.
pub const PERIODS_PER_YEAR: f64 = 12.0;

/// Aggregate metrics of a period-return series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    pub annual_return: f64,
    pub volatility: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub hit_rate: f64,
    pub periods: usize,
}

impl PortfolioMetrics {
    /// Metrics of `returns` (ordered by date) with a precomputed hit rate.
    ///
    /// Fewer than two periods give zero Sharpe, volatility and drawdown.
    pub fn from_returns(returns: &[f64], hit_rate: f64) -> Self {
        let n = returns.len();
        if n == 0 {
            return Self::default();
        }

        let mean = returns.iter().sum::<f64>() / n as f64;
        let annual_return = (1.0 + mean).powf(PERIODS_PER_YEAR) - 1.0;
        if n < 2 {
            return Self {
                annual_return,
                hit_rate,
                periods: n,
                ..Self::default()
            };
        }

        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        let volatility = variance.sqrt() * PERIODS_PER_YEAR.sqrt();
        let sharpe = if volatility > 0.0 {
            annual_return / volatility
        } else {
            0.0
        };

        Self {
            annual_return,
            volatility,
            sharpe,
            max_drawdown: compounded_drawdown(returns),
            hit_rate,
            periods: n,
        }
    }
}

/// Worst peak-to-trough decline of the compounded return path.
pub fn compounded_drawdown(returns: &[f64]) -> f64 {
    let mut wealth = 1.0;
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0_f64;
    for r in returns {
        wealth *= 1.0 + r;
        peak = peak.max(wealth);
        worst = worst.min(wealth / peak - 1.0);
    }
    worst
}

/// Holding of one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodReturn {
    pub snapshot_date: NaiveDate,
    pub selected: Vec<String>,
    pub period_return: f64,
    /// Share of the selection beating the whole group's median target.
    pub hit_fraction: f64,
    pub group_size: usize,
}

/// Result of evaluating one scored table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioResult {
    /// Window or snapshot this result belongs to, if any.
    pub label: Option<String>,
    pub top_k: usize,
    /// Selection at the last snapshot only.
    ///
    /// Earlier selections are in each entry of `period_returns`.
    pub selected_instrument_ids: Vec<String>,
    #[serde(flatten)]
    pub metrics: PortfolioMetrics,
    pub period_returns: Vec<PeriodReturn>,
}

impl PortfolioResult {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn returns(&self) -> Vec<f64> {
        self.period_returns.iter().map(|p| p.period_return).collect()
    }

    /// Generate a summary report.
    pub fn summary(&self) -> String {
        format!(
            "Portfolio Summary{}\n\
             ====================\n\
             Periods: {} (top {})\n\
             Annual Return: {:.2}%\n\
             Volatility: {:.2}%\n\
             Sharpe Ratio: {:.2}\n\
             Max Drawdown: {:.2}%\n\
             Hit Rate: {:.1}%",
            self.label
                .as_ref()
                .map(|l| format!(" ({})", l))
                .unwrap_or_default(),
            self.metrics.periods,
            self.top_k,
            self.metrics.annual_return * 100.0,
            self.metrics.volatility * 100.0,
            self.metrics.sharpe,
            self.metrics.max_drawdown * 100.0,
            self.metrics.hit_rate * 100.0,
        )
    }
}

struct SnapshotGroup {
    date: NaiveDate,
    /// Row indices into the frame, in input order.
    rows: Vec<usize>,
    median: Option<f64>,
}

/// Records grouped by snapshot with targets resolved once.
///
/// Score vectors passed to [`EvaluationFrame::metrics`] and
/// [`EvaluationFrame::evaluate`] are aligned with the records the frame was
/// built from, which lets a weight search reuse one frame for every candidate.
pub struct EvaluationFrame {
    ids: Vec<String>,
    targets: Vec<Option<f64>>,
    groups: Vec<SnapshotGroup>,
}

impl EvaluationFrame {
    pub fn new<'a, I>(records: I, target: TargetColumn) -> Self
    where
        I: IntoIterator<Item = &'a FeatureRecord>,
    {
        let mut ids = Vec::new();
        let mut targets = Vec::new();
        let mut by_date: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
        for (idx, record) in records.into_iter().enumerate() {
            ids.push(record.instrument_id.clone());
            targets.push(record.target(target));
            by_date.entry(record.snapshot_date).or_default().push(idx);
        }

        let groups = by_date
            .into_iter()
            .map(|(date, rows)| {
                let present: Vec<f64> = rows.iter().filter_map(|i| targets[*i]).collect();
                SnapshotGroup {
                    date,
                    median: median(present),
                    rows,
                }
            })
            .collect();

        Self {
            ids,
            targets,
            groups,
        }
    }

    pub fn from_table(table: &FeatureTable, target: TargetColumn) -> Self {
        Self::new(table.records(), target)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn snapshots(&self) -> usize {
        self.groups.len()
    }

    /// Period returns and hit fractions of every snapshot, in date order.
    fn periods<'s>(
        &'s self,
        scores: &'s [f64],
        top_k: usize,
    ) -> impl Iterator<Item = (&'s SnapshotGroup, Vec<usize>, f64, f64)> + 's {
        self.groups.iter().map(move |group| {
            let group_scores: Vec<f64> = group.rows.iter().map(|i| scores[*i]).collect();
            let selected: Vec<usize> = rank_by_score(&group_scores)
                .into_iter()
                .take(top_k)
                .map(|local| group.rows[local])
                .collect();

            let realized: Vec<f64> = selected.iter().filter_map(|i| self.targets[*i]).collect();
            let period_return = if realized.is_empty() {
                0.0
            } else {
                realized.iter().sum::<f64>() / realized.len() as f64
            };

            // Missing targets count as misses.
            let hit_fraction = match group.median {
                Some(median) if !selected.is_empty() => {
                    let hits = selected
                        .iter()
                        .filter(|i| self.targets[**i].map_or(false, |t| t > median))
                        .count();
                    hits as f64 / selected.len() as f64
                }
                _ => 0.0,
            };

            (group, selected, period_return, hit_fraction)
        })
    }

    /// Aggregate metrics only.
    pub fn metrics(&self, scores: &[f64], top_k: usize) -> PortfolioMetrics {
        let mut returns = Vec::with_capacity(self.groups.len());
        let mut hits = 0.0;
        for (_, _, period_return, hit_fraction) in self.periods(scores, top_k) {
            returns.push(period_return);
            hits += hit_fraction;
        }
        let hit_rate = if returns.is_empty() {
            0.0
        } else {
            hits / returns.len() as f64
        };
        PortfolioMetrics::from_returns(&returns, hit_rate)
    }

    /// Metrics plus per-period detail.
    pub fn evaluate(&self, scores: &[f64], top_k: usize) -> PortfolioResult {
        let period_returns: Vec<PeriodReturn> = self
            .periods(scores, top_k)
            .map(|(group, selected, period_return, hit_fraction)| PeriodReturn {
                snapshot_date: group.date,
                selected: selected.iter().map(|i| self.ids[*i].clone()).collect(),
                period_return,
                hit_fraction,
                group_size: group.rows.len(),
            })
            .collect();

        let returns: Vec<f64> = period_returns.iter().map(|p| p.period_return).collect();
        let hit_rate = if period_returns.is_empty() {
            0.0
        } else {
            period_returns.iter().map(|p| p.hit_fraction).sum::<f64>() / period_returns.len() as f64
        };

        PortfolioResult {
            label: None,
            top_k,
            selected_instrument_ids: period_returns
                .last()
                .map(|p| p.selected.clone())
                .unwrap_or_default(),
            metrics: PortfolioMetrics::from_returns(&returns, hit_rate),
            period_returns,
        }
    }
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Evaluates scored tables as equal-weight top-K portfolios.
#[derive(Debug, Clone, Copy)]
pub struct PortfolioEvaluator {
    top_k: usize,
}

impl PortfolioEvaluator {
    pub fn new(top_k: usize) -> Result<Self> {
        if top_k == 0 {
            return Err(ResearchError::config("top_k must be positive"));
        }
        Ok(Self { top_k })
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Evaluate `scored` against `target`.
    ///
    /// Groups smaller than `top_k` hold every member.
    pub fn evaluate(&self, scored: &ScoredTable, target: TargetColumn) -> Result<PortfolioResult> {
        if scored.is_empty() {
            return Err(ResearchError::insufficient("scored table is empty"));
        }
        let frame = EvaluationFrame::new(scored.records().iter().map(|r| &r.record), target);
        Ok(frame.evaluate(&scored.scores(), self.top_k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Feature, FeatureRecord};
    use crate::scoring::ScoredRecord;
    use approx::assert_relative_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    const TARGET: TargetColumn = TargetColumn::Current(Feature::Ret1m);

    fn scored(rows: &[(&str, NaiveDate, f64, Option<f64>)]) -> ScoredTable {
        ScoredTable::from_records(
            rows.iter()
                .map(|(id, d, score, target)| {
                    let mut record = FeatureRecord::new(*id, *d);
                    if let Some(t) = target {
                        record.values.insert(Feature::Ret1m, *t);
                    }
                    ScoredRecord {
                        record,
                        score: *score,
                    }
                })
                .collect(),
        )
    }

    fn two_snapshots() -> ScoredTable {
        let jan = date(2020, 1, 31);
        let feb = date(2020, 2, 29);
        scored(&[
            ("A", jan, 4.0, Some(0.10)),
            ("B", jan, 3.0, Some(-0.02)),
            ("C", jan, 2.0, Some(0.05)),
            ("D", jan, 1.0, Some(0.01)),
            ("A", feb, 1.0, Some(0.0)),
            ("B", feb, 4.0, Some(0.02)),
            ("C", feb, 3.0, None),
            ("D", feb, 2.0, Some(0.04)),
        ])
    }

    #[test]
    fn test_evaluate_known_portfolio() {
        let result = PortfolioEvaluator::new(2)
            .unwrap()
            .evaluate(&two_snapshots(), TARGET)
            .unwrap();

        let returns = result.returns();
        assert_relative_eq!(returns[0], 0.04, epsilon = 1e-12);
        // C has no target, so February earns B's return alone.
        assert_relative_eq!(returns[1], 0.02, epsilon = 1e-12);

        assert_eq!(result.period_returns[0].selected, vec!["A", "B"]);
        assert_eq!(result.period_returns[0].hit_fraction, 0.5);
        assert_eq!(result.period_returns[1].hit_fraction, 0.0);
        assert_relative_eq!(result.metrics.hit_rate, 0.25);
        assert_eq!(result.selected_instrument_ids, vec!["B", "C"]);

        let ann = 1.03f64.powi(12) - 1.0;
        let vol = 0.02f64.sqrt() * 0.1 * 12f64.sqrt();
        assert_relative_eq!(result.metrics.annual_return, ann, epsilon = 1e-12);
        assert_relative_eq!(result.metrics.volatility, vol, epsilon = 1e-12);
        assert_relative_eq!(result.metrics.sharpe, ann / vol, epsilon = 1e-9);
        assert_eq!(result.metrics.max_drawdown, 0.0);
    }

    #[test]
    fn test_ties_keep_input_order() {
        let d = date(2020, 1, 31);
        let table = scored(&[
            ("A", d, 1.0, Some(0.01)),
            ("B", d, 2.0, Some(0.02)),
            ("C", d, 2.0, Some(0.03)),
        ]);
        let result = PortfolioEvaluator::new(2).unwrap().evaluate(&table, TARGET).unwrap();
        assert_eq!(result.selected_instrument_ids, vec!["B", "C"]);
    }

    #[test]
    fn test_short_group_and_missing_targets() {
        let d = date(2020, 1, 31);
        let table = scored(&[("A", d, 1.0, None), ("B", d, 2.0, None)]);
        let result = PortfolioEvaluator::new(30).unwrap().evaluate(&table, TARGET).unwrap();

        assert_eq!(result.period_returns[0].selected.len(), 2);
        assert_eq!(result.period_returns[0].period_return, 0.0);
        assert_eq!(result.metrics.hit_rate, 0.0);
        // A single period has no Sharpe or drawdown.
        assert_eq!(result.metrics.sharpe, 0.0);
        assert_eq!(result.metrics.max_drawdown, 0.0);
    }

    #[test]
    fn test_full_selection_hit_rate() {
        let d = date(2020, 1, 31);
        let table = scored(&[
            ("A", d, 1.0, Some(0.01)),
            ("B", d, 2.0, Some(0.02)),
            ("C", d, 3.0, Some(0.03)),
            ("D", d, 4.0, Some(0.04)),
        ]);
        let result = PortfolioEvaluator::new(10).unwrap().evaluate(&table, TARGET).unwrap();
        assert_eq!(result.metrics.hit_rate, 0.5);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(PortfolioEvaluator::new(0).is_err());
        let err = PortfolioEvaluator::new(5)
            .unwrap()
            .evaluate(&ScoredTable::default(), TARGET)
            .unwrap_err();
        assert!(err.is_insufficient_data());
    }

    #[test]
    fn test_compounded_drawdown() {
        assert_eq!(compounded_drawdown(&[0.01, 0.02, 0.03]), 0.0);
        assert_relative_eq!(compounded_drawdown(&[0.1, -0.5]), -0.5);
        assert_relative_eq!(compounded_drawdown(&[0.1, -0.5, 0.5, 0.1]), -0.5);
    }

    #[test]
    fn test_zero_volatility_sharpe() {
        let metrics = PortfolioMetrics::from_returns(&[0.25, 0.25, 0.25], 0.0);
        assert_eq!(metrics.sharpe, 0.0);
        assert!(metrics.annual_return > 0.0);
    }

    #[test]
    fn test_frame_metrics_match_detail() {
        let table = two_snapshots();
        let frame = EvaluationFrame::new(table.records().iter().map(|r| &r.record), TARGET);
        let scores = table.scores();
        assert_eq!(frame.metrics(&scores, 2), frame.evaluate(&scores, 2).metrics);
        assert_eq!(frame.snapshots(), 2);
    }
}
