//! Rolling feature engine.
//!
//! Each instrument is an independent partition: daily returns are derived
//! from its own prices, trailing windows end at each sampling index, and no
//! value ever looks past the snapshot date. Instruments shorter than the
//! minimum history are skipped whole.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::rolling::{
    annualized_volatility, average_rank_pct, compound_return, daily_returns, downside_volatility,
    max_drawdown, trailing, DAYS_12M, DAYS_1M, DAYS_24M, DAYS_36M, DAYS_3M, DAYS_6M,
};
use crate::data::{Feature, FeatureRecord, FeatureTable, PriceSeries, PriceStore};
use crate::error::{ResearchError, Result};

/// Category used for instruments without metadata.
pub const UNKNOWN_CATEGORY: &str = "UNKNOWN";

/// How often snapshots are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingFrequency {
    Daily,
    Weekly,
    #[default]
    Monthly,
}

impl SamplingFrequency {
    /// Calendar period containing `date`. Weeks are ISO weeks.
    fn period_key(&self, date: NaiveDate) -> (i32, u32) {
        match self {
            Self::Daily => (date.year(), date.ordinal()),
            Self::Weekly => {
                let week = date.iso_week();
                (week.year(), week.week())
            }
            Self::Monthly => (date.year(), date.month()),
        }
    }
}

impl FromStr for SamplingFrequency {
    type Err = ResearchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "d" | "daily" => Ok(Self::Daily),
            "w" | "weekly" => Ok(Self::Weekly),
            "m" | "monthly" => Ok(Self::Monthly),
            other => Err(ResearchError::config(format!(
                "unknown sampling frequency: {}",
                other
            ))),
        }
    }
}

/// Sampling frequency plus an optional cutoff applied before computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingCalendar {
    pub frequency: SamplingFrequency,
    pub as_of: Option<NaiveDate>,
}

impl SamplingCalendar {
    pub fn monthly() -> Self {
        Self::default()
    }

    pub fn new(frequency: SamplingFrequency) -> Self {
        Self {
            frequency,
            as_of: None,
        }
    }

    pub fn with_as_of(mut self, as_of: NaiveDate) -> Self {
        self.as_of = Some(as_of);
        self
    }

    /// Index of the last observation in each calendar period.
    pub fn sample_indices(&self, dates: &[NaiveDate]) -> Vec<usize> {
        let mut indices = Vec::new();
        for (idx, date) in dates.iter().enumerate() {
            let closes_period = dates
                .get(idx + 1)
                .map_or(true, |next| {
                    self.frequency.period_key(*next) != self.frequency.period_key(*date)
                });
            if closes_period {
                indices.push(idx);
            }
        }
        indices
    }
}

/// Feature engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureEngineConfig {
    /// Minimum daily observations for an instrument to be included.
    pub min_history: usize,
    /// Downside volatility penalty in `risk_adj_return`.
    pub downside_penalty: f64,
    /// Added to ratio denominators.
    pub epsilon: f64,
    /// Compute `morningstar_percentile` within (snapshot, category) groups.
    pub category_percentile: bool,
}

impl Default for FeatureEngineConfig {
    fn default() -> Self {
        Self {
            min_history: DAYS_36M,
            downside_penalty: 2.0,
            epsilon: 1e-8,
            category_percentile: true,
        }
    }
}

/// Converts price histories into point-in-time feature records.
pub struct FeatureEngine {
    config: FeatureEngineConfig,
}

impl Default for FeatureEngine {
    fn default() -> Self {
        Self::new(FeatureEngineConfig::default())
    }
}

impl FeatureEngine {
    pub fn new(config: FeatureEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FeatureEngineConfig {
        &self.config
    }

    /// Columns every emitted table carries.
    pub fn columns(&self) -> BTreeSet<Feature> {
        Feature::ALL
            .into_iter()
            .filter(|f| self.config.category_percentile || *f != Feature::MorningstarPercentile)
            .collect()
    }

    /// Feature records of one instrument, one per sampled period.
    ///
    /// Returns nothing when the (possibly truncated) history is shorter than
    /// the minimum. Periods closing before the 36-month window is complete
    /// are not emitted.
    pub fn compute_features(
        &self,
        series: &PriceSeries,
        calendar: &SamplingCalendar,
    ) -> Vec<FeatureRecord> {
        let truncated;
        let series = match calendar.as_of {
            Some(as_of) => {
                truncated = series.truncated(as_of);
                &truncated
            }
            None => series,
        };

        if series.is_empty() || series.len() < self.config.min_history {
            debug!(
                "{}: {} observations, below minimum history {}",
                series.instrument_id,
                series.len(),
                self.config.min_history
            );
            return Vec::new();
        }

        let prices = series.prices();
        let returns = daily_returns(prices);

        calendar
            .sample_indices(series.dates())
            .into_iter()
            .filter(|idx| idx + 1 >= DAYS_36M)
            .filter_map(|idx| {
                let values = self.snapshot_values(prices, &returns, idx)?;
                Some(FeatureRecord {
                    instrument_id: series.instrument_id.clone(),
                    snapshot_date: series.dates()[idx],
                    category: series.category.clone(),
                    values,
                    forward: BTreeMap::new(),
                })
            })
            .collect()
    }

    /// Features of a whole universe, with category percentiles when enabled.
    ///
    /// Records are ordered by input series, then by snapshot date.
    pub fn compute_universe(
        &self,
        universe: &[PriceSeries],
        calendar: &SamplingCalendar,
    ) -> FeatureTable {
        let partitions: Vec<Vec<FeatureRecord>> = universe
            .par_iter()
            .map(|series| self.compute_features(series, calendar))
            .collect();

        let qualified = partitions.iter().filter(|p| !p.is_empty()).count();
        let mut records: Vec<FeatureRecord> = partitions.into_iter().flatten().collect();

        if self.config.category_percentile {
            assign_category_percentiles(&mut records);
        }

        info!(
            "Computed {} feature records for {}/{} instruments",
            records.len(),
            qualified,
            universe.len()
        );

        FeatureTable::new(self.columns(), records)
    }

    /// Load every instrument's prices from `store` and compute features.
    pub fn build_from_store<S: PriceStore + ?Sized>(
        &self,
        store: &S,
        start: NaiveDate,
        end: NaiveDate,
        calendar: &SamplingCalendar,
    ) -> Result<FeatureTable> {
        if start > end {
            return Err(ResearchError::config(format!(
                "price range start {} is after end {}",
                start, end
            )));
        }

        let categories = store.categories()?;
        let mut universe = store.load_universe(start, end)?;
        info!("Loaded prices for {} instruments", universe.len());

        for series in universe.iter_mut().filter(|s| s.category.is_none()) {
            series.category = categories.get(&series.instrument_id).cloned();
        }

        Ok(self.compute_universe(&universe, calendar))
    }

    fn snapshot_values(
        &self,
        prices: &[f64],
        returns: &[f64],
        idx: usize,
    ) -> Option<BTreeMap<Feature, f64>> {
        let ret = |window| trailing(returns, idx, window).map(compound_return);
        let vol = |window| trailing(returns, idx, window).and_then(annualized_volatility);
        let mdd = |window| trailing(prices, idx, window).map(max_drawdown);
        let eps = self.config.epsilon;

        let ret_1m = ret(DAYS_1M)?;
        let ret_3m = ret(DAYS_3M)?;
        let ret_6m = ret(DAYS_6M)?;
        let ret_12m = ret(DAYS_12M)?;
        let ret_24m = ret(DAYS_24M)?;
        let ret_36m = ret(DAYS_36M)?;
        let vol_3m = vol(DAYS_3M)?;
        let vol_6m = vol(DAYS_6M)?;
        let mdd_6m = mdd(DAYS_6M)?;
        let mdd_36m = mdd(DAYS_36M)?;
        let downside_36m = trailing(returns, idx, DAYS_36M).map(downside_volatility)?;

        let ret_36m_ann = (1.0 + ret_36m).powf(12.0 / 36.0) - 1.0;
        let risk_adj = ret_36m_ann - self.config.downside_penalty * downside_36m;

        let mut values = BTreeMap::from([
            (Feature::Ret1m, ret_1m),
            (Feature::Ret3m, ret_3m),
            (Feature::Ret6m, ret_6m),
            (Feature::Ret12m, ret_12m),
            (Feature::Ret24m, ret_24m),
            (Feature::Ret36m, ret_36m),
            (Feature::Vol3m, vol_3m),
            (Feature::Vol6m, vol_6m),
            (Feature::MaxDrawdown6m, mdd_6m),
            (Feature::Mdd36m, mdd_36m),
            (Feature::Ret36mAnn, ret_36m_ann),
            (Feature::DownsideVol36m, downside_36m),
            (Feature::RiskAdjReturn, risk_adj),
            (Feature::MorningstarScore, risk_adj / (downside_36m.abs() + eps)),
            (Feature::MomentumRatio3m12m, ret_3m / (ret_12m.abs() + eps)),
            (Feature::VolTrend3m6m, vol_3m / (vol_6m.abs() + eps)),
            (Feature::DrawdownDiff6m36m, mdd_6m - mdd_36m),
        ]);
        if mdd_6m != 0.0 {
            values.insert(Feature::Calmar6m, ret_6m / mdd_6m.abs());
        }
        values.retain(|_, v| v.is_finite());

        Some(values)
    }
}

/// Set `morningstar_percentile` to the average-rank percentile of
/// `morningstar_score` within each (snapshot date, category) group.
///
/// Missing categories fall into [`UNKNOWN_CATEGORY`]; undefined percentiles are 0.
pub fn assign_category_percentiles(records: &mut [FeatureRecord]) {
    let mut groups: BTreeMap<(NaiveDate, String), Vec<usize>> = BTreeMap::new();
    for (idx, record) in records.iter().enumerate() {
        let category = record
            .category
            .clone()
            .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string());
        groups
            .entry((record.snapshot_date, category))
            .or_default()
            .push(idx);
    }

    for members in groups.values() {
        let scores: Vec<f64> = members
            .iter()
            .map(|i| records[*i].get(Feature::MorningstarScore).unwrap_or(f64::NAN))
            .collect();
        for (idx, pct) in members.iter().zip(average_rank_pct(&scores)) {
            records[*idx]
                .values
                .insert(Feature::MorningstarPercentile, pct.unwrap_or(0.0));
        }
    }
}
