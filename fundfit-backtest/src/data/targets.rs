//! Forward return targets.
//!
//! The target at snapshot `t` is the value of a return column at the next
//! snapshot of the same instrument. The last snapshot of every instrument has
//! no target and is dropped rather than imputed.

use std::collections::BTreeMap;

use super::types::{Feature, FeatureRecord, FeatureTable, TargetColumn};

/// Attach `forward[feature]` to every record that has a successor.
///
/// Records are returned sorted by (instrument, snapshot date). Records whose
/// successor lacks the feature are dropped as well.
pub fn attach_forward_returns(table: &FeatureTable, feature: Feature) -> FeatureTable {
    let mut partitions: BTreeMap<&str, Vec<&FeatureRecord>> = BTreeMap::new();
    for record in table.records() {
        partitions
            .entry(record.instrument_id.as_str())
            .or_default()
            .push(record);
    }

    let mut records = Vec::with_capacity(table.len());
    for (_, mut rows) in partitions {
        rows.sort_by_key(|r| r.snapshot_date);
        for pair in rows.windows(2) {
            if let Some(next_value) = pair[1].get(feature) {
                let mut record = pair[0].clone();
                record.forward.insert(feature, next_value);
                records.push(record);
            }
        }
    }

    FeatureTable::new(table.columns().clone(), records)
}

/// Attach the forward values a target column needs; current targets pass through.
pub fn prepare_targets(table: &FeatureTable, target: TargetColumn) -> FeatureTable {
    match target {
        TargetColumn::Forward(feature) => attach_forward_returns(table, feature),
        TargetColumn::Current(feature) => table.filter(|r| r.get(feature).is_some()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn table() -> FeatureTable {
        FeatureTable::from_records(vec![
            FeatureRecord::new("B", date(2020, 2, 28)).with_value(Feature::Ret6m, 0.20),
            FeatureRecord::new("A", date(2020, 2, 28)).with_value(Feature::Ret6m, 0.02),
            FeatureRecord::new("A", date(2020, 1, 31)).with_value(Feature::Ret6m, 0.01),
            FeatureRecord::new("B", date(2020, 1, 31)).with_value(Feature::Ret6m, 0.10),
            FeatureRecord::new("A", date(2020, 3, 31)).with_value(Feature::Ret6m, 0.03),
        ])
    }

    #[test]
    fn test_forward_shift_within_instrument() {
        let shifted = attach_forward_returns(&table(), Feature::Ret6m);
        let target = TargetColumn::Forward(Feature::Ret6m);

        // A has three snapshots (two targets), B has two (one target).
        assert_eq!(shifted.len(), 3);
        let rows: Vec<(&str, NaiveDate, Option<f64>)> = shifted
            .records()
            .iter()
            .map(|r| (r.instrument_id.as_str(), r.snapshot_date, r.target(target)))
            .collect();
        assert_eq!(rows[0], ("A", date(2020, 1, 31), Some(0.02)));
        assert_eq!(rows[1], ("A", date(2020, 2, 28), Some(0.03)));
        assert_eq!(rows[2], ("B", date(2020, 1, 31), Some(0.20)));
    }

    #[test]
    fn test_missing_successor_value_is_dropped() {
        let table = FeatureTable::from_records(vec![
            FeatureRecord::new("A", date(2020, 1, 31)).with_value(Feature::Ret6m, 0.01),
            FeatureRecord::new("A", date(2020, 2, 28)).with_value(Feature::Ret3m, 0.02),
        ]);
        let shifted = attach_forward_returns(&table, Feature::Ret6m);
        assert!(shifted.is_empty());
    }

    #[test]
    fn test_current_target_filters_missing() {
        let prepared = prepare_targets(&table(), TargetColumn::Current(Feature::Ret6m));
        assert_eq!(prepared.len(), 5);
    }
}
