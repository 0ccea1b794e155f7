//! Core data types for fund scoring research.
//!
//! Prices come in per instrument, features go out per (instrument, snapshot).
//! The feature vocabulary is closed: every column a weight vector may refer to
//! is a [`Feature`] variant, so unknown names fail when they are parsed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{ResearchError, Result};

/// Feature columns produced by the feature engine or served by a feature store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Feature {
    #[serde(rename = "ret_1m")]
    Ret1m,
    #[serde(rename = "ret_3m")]
    Ret3m,
    #[serde(rename = "ret_6m")]
    Ret6m,
    #[serde(rename = "ret_12m")]
    Ret12m,
    #[serde(rename = "ret_24m")]
    Ret24m,
    #[serde(rename = "ret_36m")]
    Ret36m,
    #[serde(rename = "risk_adj_return")]
    RiskAdjReturn,
    #[serde(rename = "downside_vol_36m")]
    DownsideVol36m,
    #[serde(rename = "mdd_36m")]
    Mdd36m,
    #[serde(rename = "morningstar_score")]
    MorningstarScore,
    #[serde(rename = "momentum_ratio_3m_12m")]
    MomentumRatio3m12m,
    #[serde(rename = "vol_trend_3m_6m")]
    VolTrend3m6m,
    #[serde(rename = "drawdown_diff_6m_36m")]
    DrawdownDiff6m36m,
    #[serde(rename = "vol_3m")]
    Vol3m,
    #[serde(rename = "vol_6m")]
    Vol6m,
    #[serde(rename = "max_drawdown_6m")]
    MaxDrawdown6m,
    #[serde(rename = "calmar_6m")]
    Calmar6m,
    #[serde(rename = "ret_36m_ann")]
    Ret36mAnn,
    #[serde(rename = "morningstar_percentile")]
    MorningstarPercentile,
}

impl Feature {
    /// Every known feature, in column order.
    pub const ALL: [Feature; 19] = [
        Feature::Ret1m,
        Feature::Ret3m,
        Feature::Ret6m,
        Feature::Ret12m,
        Feature::Ret24m,
        Feature::Ret36m,
        Feature::RiskAdjReturn,
        Feature::DownsideVol36m,
        Feature::Mdd36m,
        Feature::MorningstarScore,
        Feature::MomentumRatio3m12m,
        Feature::VolTrend3m6m,
        Feature::DrawdownDiff6m36m,
        Feature::Vol3m,
        Feature::Vol6m,
        Feature::MaxDrawdown6m,
        Feature::Calmar6m,
        Feature::Ret36mAnn,
        Feature::MorningstarPercentile,
    ];

    /// The standard scoring vocabulary served by feature stores.
    pub const SCORING: [Feature; 13] = [
        Feature::Ret1m,
        Feature::Ret3m,
        Feature::Ret6m,
        Feature::Ret12m,
        Feature::Ret24m,
        Feature::Ret36m,
        Feature::RiskAdjReturn,
        Feature::DownsideVol36m,
        Feature::Mdd36m,
        Feature::MorningstarScore,
        Feature::MomentumRatio3m12m,
        Feature::VolTrend3m6m,
        Feature::DrawdownDiff6m36m,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ret1m => "ret_1m",
            Self::Ret3m => "ret_3m",
            Self::Ret6m => "ret_6m",
            Self::Ret12m => "ret_12m",
            Self::Ret24m => "ret_24m",
            Self::Ret36m => "ret_36m",
            Self::RiskAdjReturn => "risk_adj_return",
            Self::DownsideVol36m => "downside_vol_36m",
            Self::Mdd36m => "mdd_36m",
            Self::MorningstarScore => "morningstar_score",
            Self::MomentumRatio3m12m => "momentum_ratio_3m_12m",
            Self::VolTrend3m6m => "vol_trend_3m_6m",
            Self::DrawdownDiff6m36m => "drawdown_diff_6m_36m",
            Self::Vol3m => "vol_3m",
            Self::Vol6m => "vol_6m",
            Self::MaxDrawdown6m => "max_drawdown_6m",
            Self::Calmar6m => "calmar_6m",
            Self::Ret36mAnn => "ret_36m_ann",
            Self::MorningstarPercentile => "morningstar_percentile",
        }
    }

    /// The compounded-return feature covering `months`, if one exists.
    pub fn return_for_months(months: u32) -> Option<Feature> {
        match months {
            1 => Some(Self::Ret1m),
            3 => Some(Self::Ret3m),
            6 => Some(Self::Ret6m),
            12 => Some(Self::Ret12m),
            24 => Some(Self::Ret24m),
            36 => Some(Self::Ret36m),
            _ => None,
        }
    }

    /// Parse a comma-separated feature list such as `"ret_3m, ret_6m"`.
    pub fn parse_list(raw: &str) -> Result<Vec<Feature>> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for Feature {
    type Err = ResearchError;

    fn from_str(s: &str) -> Result<Self> {
        Feature::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| ResearchError::config(format!("unknown feature: {}", s)))
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single price observation as delivered by a price store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub instrument_id: String,
    pub date: NaiveDate,
    /// Net asset value per unit.
    pub price: f64,
}

/// Time-ordered price history of one instrument.
///
/// Dates are strictly increasing and every price is finite and positive.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceSeries {
    pub instrument_id: String,
    /// Fund category used for cross-sectional percentiles.
    pub category: Option<String>,
    dates: Vec<NaiveDate>,
    prices: Vec<f64>,
}

impl PriceSeries {
    /// Build a series from (date, price) pairs that are already in order.
    pub fn new(instrument_id: impl Into<String>, points: Vec<(NaiveDate, f64)>) -> Result<Self> {
        let instrument_id = instrument_id.into();
        let mut dates = Vec::with_capacity(points.len());
        let mut prices = Vec::with_capacity(points.len());

        for (date, price) in points {
            if !(price.is_finite() && price > 0.0) {
                return Err(ResearchError::config(format!(
                    "{}: non-positive price {} on {}",
                    instrument_id, price, date
                )));
            }
            if let Some(last) = dates.last() {
                if date <= *last {
                    return Err(ResearchError::config(format!(
                        "{}: dates not strictly increasing at {}",
                        instrument_id, date
                    )));
                }
            }
            dates.push(date);
            prices.push(price);
        }

        Ok(Self {
            instrument_id,
            category: None,
            dates,
            prices,
        })
    }

    /// Group loose records into one series per instrument, sorted by date.
    pub fn from_records(records: Vec<PriceRecord>) -> Result<Vec<PriceSeries>> {
        let mut grouped: BTreeMap<String, Vec<(NaiveDate, f64)>> = BTreeMap::new();
        for record in records {
            grouped
                .entry(record.instrument_id)
                .or_default()
                .push((record.date, record.price));
        }

        grouped
            .into_iter()
            .map(|(id, mut points)| {
                points.sort_by_key(|(date, _)| *date);
                PriceSeries::new(id, points)
            })
            .collect()
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn prices(&self) -> &[f64] {
        &self.prices
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn first(&self) -> Option<(NaiveDate, f64)> {
        Some((*self.dates.first()?, *self.prices.first()?))
    }

    pub fn last(&self) -> Option<(NaiveDate, f64)> {
        Some((*self.dates.last()?, *self.prices.last()?))
    }

    /// Copy of the series keeping only observations on or before `as_of`.
    pub fn truncated(&self, as_of: NaiveDate) -> PriceSeries {
        let keep = self.dates.partition_point(|d| *d <= as_of);
        PriceSeries {
            instrument_id: self.instrument_id.clone(),
            category: self.category.clone(),
            dates: self.dates[..keep].to_vec(),
            prices: self.prices[..keep].to_vec(),
        }
    }

    /// Copy of the series restricted to `start <= date <= end`.
    pub fn window(&self, start: NaiveDate, end: NaiveDate) -> PriceSeries {
        let from = self.dates.partition_point(|d| *d < start);
        let to = self.dates.partition_point(|d| *d <= end).max(from);
        PriceSeries {
            instrument_id: self.instrument_id.clone(),
            category: self.category.clone(),
            dates: self.dates[from..to].to_vec(),
            prices: self.prices[from..to].to_vec(),
        }
    }

    /// Simple return between the first and last observation.
    pub fn total_return(&self) -> Option<f64> {
        if self.len() < 2 {
            return None;
        }
        let (_, start) = self.first()?;
        let (_, end) = self.last()?;
        Some(end / start - 1.0)
    }
}

/// Feature values of one instrument at one snapshot date.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    pub instrument_id: String,
    pub snapshot_date: NaiveDate,
    pub category: Option<String>,
    /// Point-in-time feature values. Undefined values are absent.
    pub values: BTreeMap<Feature, f64>,
    /// Values of the next snapshot of the same instrument, when attached.
    pub forward: BTreeMap<Feature, f64>,
}

impl FeatureRecord {
    pub fn new(instrument_id: impl Into<String>, snapshot_date: NaiveDate) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            snapshot_date,
            category: None,
            values: BTreeMap::new(),
            forward: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, feature: Feature, value: f64) -> Self {
        self.values.insert(feature, value);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn get(&self, feature: Feature) -> Option<f64> {
        self.values.get(&feature).copied().filter(|v| v.is_finite())
    }

    /// Read a target column; missing or non-finite values are `None`.
    pub fn target(&self, column: TargetColumn) -> Option<f64> {
        match column {
            TargetColumn::Current(feature) => self.get(feature),
            TargetColumn::Forward(feature) => {
                self.forward.get(&feature).copied().filter(|v| v.is_finite())
            }
        }
    }
}

/// Which column the portfolio evaluator treats as the realized return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetColumn {
    /// The feature value at the snapshot itself.
    Current(Feature),
    /// The feature value at the next snapshot of the same instrument.
    Forward(Feature),
}

impl TargetColumn {
    /// Forward return target for a horizon in months (`future_ret_{h}m`).
    pub fn forward_return(months: u32) -> Result<Self> {
        Feature::return_for_months(months)
            .map(TargetColumn::Forward)
            .ok_or_else(|| {
                ResearchError::config(format!("no return feature for a {}-month horizon", months))
            })
    }

    pub fn feature(&self) -> Feature {
        match self {
            Self::Current(f) | Self::Forward(f) => *f,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Current(f) => f.as_str().to_string(),
            Self::Forward(f) => format!("future_{}", f.as_str()),
        }
    }
}

impl fmt::Display for TargetColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Inclusive snapshot-date filter; either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFilter {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl SnapshotFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(ResearchError::config(format!(
                "snapshot filter start {} is after end {}",
                start, end
            )));
        }
        Ok(Self {
            start: Some(start),
            end: Some(end),
        })
    }

    pub fn on(date: NaiveDate) -> Self {
        Self {
            start: Some(date),
            end: Some(date),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

/// A set of feature records sharing one column schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    columns: BTreeSet<Feature>,
    records: Vec<FeatureRecord>,
}

impl FeatureTable {
    pub fn new(columns: BTreeSet<Feature>, records: Vec<FeatureRecord>) -> Self {
        Self { columns, records }
    }

    /// Build a table whose schema is the union of the records' columns.
    pub fn from_records(records: Vec<FeatureRecord>) -> Self {
        let columns = records
            .iter()
            .flat_map(|r| r.values.keys().copied())
            .collect();
        Self { columns, records }
    }

    pub fn columns(&self) -> &BTreeSet<Feature> {
        &self.columns
    }

    pub fn has_column(&self, feature: Feature) -> bool {
        self.columns.contains(&feature)
    }

    pub fn records(&self) -> &[FeatureRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<FeatureRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct snapshot dates in ascending order.
    pub fn snapshot_dates(&self) -> Vec<NaiveDate> {
        let dates: BTreeSet<NaiveDate> = self.records.iter().map(|r| r.snapshot_date).collect();
        dates.into_iter().collect()
    }

    /// Distinct instrument ids in ascending order.
    pub fn instruments(&self) -> Vec<String> {
        let ids: BTreeSet<&str> = self.records.iter().map(|r| r.instrument_id.as_str()).collect();
        ids.into_iter().map(str::to_string).collect()
    }

    /// Keep records matching `predicate`, preserving order and schema.
    pub fn filter<F>(&self, predicate: F) -> FeatureTable
    where
        F: Fn(&FeatureRecord) -> bool,
    {
        FeatureTable {
            columns: self.columns.clone(),
            records: self.records.iter().filter(|r| predicate(r)).cloned().collect(),
        }
    }

    /// Records with `start <= snapshot_date < end`.
    pub fn between(&self, start: NaiveDate, end: NaiveDate) -> FeatureTable {
        self.filter(|r| r.snapshot_date >= start && r.snapshot_date < end)
    }

    /// Records of a single snapshot date.
    pub fn snapshot(&self, date: NaiveDate) -> FeatureTable {
        self.filter(|r| r.snapshot_date == date)
    }

    /// Fail with a configuration error if any feature is not a column.
    pub fn require_columns(&self, features: &[Feature]) -> Result<()> {
        let missing: Vec<&str> = features
            .iter()
            .filter(|f| !self.has_column(**f))
            .map(|f| f.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ResearchError::config(format!(
                "features not present in table: {}",
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_feature_parsing() {
        assert_eq!("ret_6m".parse::<Feature>().unwrap(), Feature::Ret6m);
        assert_eq!(
            "drawdown_diff_6m_36m".parse::<Feature>().unwrap(),
            Feature::DrawdownDiff6m36m
        );
        assert!("ret_7m".parse::<Feature>().unwrap_err().to_string().contains("ret_7m"));
    }

    #[test]
    fn test_feature_names_round_trip() {
        for feature in Feature::ALL {
            assert_eq!(feature.as_str().parse::<Feature>().unwrap(), feature);
        }
    }

    #[test]
    fn test_parse_list() {
        let features = Feature::parse_list("ret_3m, ret_12m,,mdd_36m").unwrap();
        assert_eq!(features, vec![Feature::Ret3m, Feature::Ret12m, Feature::Mdd36m]);
        assert!(Feature::parse_list("ret_3m,bogus").is_err());
    }

    #[test]
    fn test_target_column_names() {
        assert_eq!(TargetColumn::forward_return(6).unwrap().name(), "future_ret_6m");
        assert_eq!(TargetColumn::Current(Feature::Ret3m).name(), "ret_3m");
        assert!(TargetColumn::forward_return(5).is_err());
    }

    #[test]
    fn test_price_series_rejects_bad_input() {
        let unordered = vec![(date(2020, 1, 2), 1.0), (date(2020, 1, 1), 1.0)];
        assert!(PriceSeries::new("000001", unordered).is_err());

        let zero = vec![(date(2020, 1, 1), 0.0)];
        assert!(PriceSeries::new("000001", zero).is_err());
    }

    #[test]
    fn test_price_series_truncation() {
        let series = PriceSeries::new(
            "000001",
            vec![
                (date(2020, 1, 1), 1.0),
                (date(2020, 1, 2), 1.1),
                (date(2020, 1, 3), 1.2),
            ],
        )
        .unwrap();

        let cut = series.truncated(date(2020, 1, 2));
        assert_eq!(cut.len(), 2);
        assert_eq!(cut.last(), Some((date(2020, 1, 2), 1.1)));
        assert!((series.total_return().unwrap() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_from_records_groups_and_sorts() {
        let records = vec![
            PriceRecord { instrument_id: "B".into(), date: date(2020, 1, 2), price: 2.0 },
            PriceRecord { instrument_id: "A".into(), date: date(2020, 1, 2), price: 1.1 },
            PriceRecord { instrument_id: "A".into(), date: date(2020, 1, 1), price: 1.0 },
        ];
        let series = PriceSeries::from_records(records).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].instrument_id, "A");
        assert_eq!(series[0].dates(), &[date(2020, 1, 1), date(2020, 1, 2)]);
    }

    #[test]
    fn test_snapshot_filter() {
        let filter = SnapshotFilter::between(date(2020, 1, 1), date(2020, 12, 31)).unwrap();
        assert!(filter.contains(date(2020, 12, 31)));
        assert!(!filter.contains(date(2021, 1, 1)));
        assert!(SnapshotFilter::all().contains(date(1990, 1, 1)));
        assert!(SnapshotFilter::between(date(2021, 1, 1), date(2020, 1, 1)).is_err());
    }

    #[test]
    fn test_table_between_is_half_open() {
        let table = FeatureTable::from_records(vec![
            FeatureRecord::new("A", date(2020, 1, 31)).with_value(Feature::Ret1m, 0.1),
            FeatureRecord::new("A", date(2020, 2, 29)).with_value(Feature::Ret1m, 0.2),
        ]);
        let slice = table.between(date(2020, 1, 1), date(2020, 2, 29));
        assert_eq!(slice.len(), 1);
        assert!(slice.has_column(Feature::Ret1m));
        assert!(table.require_columns(&[Feature::Ret3m]).is_err());
    }
}
