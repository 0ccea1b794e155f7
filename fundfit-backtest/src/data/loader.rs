//! Feature and price stores.
//!
//! The research core only sees two contracts: a [`FeatureStore`] that serves
//! feature tables by snapshot range, and a [`PriceStore`] that serves NAV
//! histories per fund. Callers own the store handle and pass it in.
//!
//! [`ParquetStore`] reads parquet files from a data directory:
//! - `{table}.parquet`: fund_code, snapshot_date, fund_type (optional), feature columns
//! - `nav_prices.parquet`: fund_code, date, unit_nav
//! - `fund_meta.parquet` (optional): fund_code, fund_type

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use polars::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::types::{Feature, FeatureRecord, FeatureTable, PriceSeries, SnapshotFilter};
use crate::error::Result;

/// Fund identifier column shared by every table.
pub const INSTRUMENT_COLUMN: &str = "fund_code";
/// Snapshot timestamp column of feature tables.
pub const SNAPSHOT_COLUMN: &str = "snapshot_date";
/// Optional fund category column.
pub const CATEGORY_COLUMN: &str = "fund_type";
/// Table holding daily NAV observations.
pub const NAV_TABLE: &str = "nav_prices";
/// Table holding fund metadata.
pub const META_TABLE: &str = "fund_meta";

/// Required columns in a feature table; feature columns are optional.
pub const EXPECTED_COLUMNS: &[&str] = &[INSTRUMENT_COLUMN, SNAPSHOT_COLUMN];

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of point-in-time feature tables.
pub trait FeatureStore {
    /// One record per (fund, snapshot) in `source` whose snapshot passes `filter`.
    fn load_features(&self, source: &str, filter: &SnapshotFilter) -> Result<FeatureTable>;
}

/// Source of daily NAV histories.
pub trait PriceStore {
    /// Prices of one fund with `start <= date <= end`, ascending.
    ///
    /// Unknown funds yield an empty series.
    fn load_prices(&self, instrument_id: &str, start: NaiveDate, end: NaiveDate)
        -> Result<PriceSeries>;

    /// All fund identifiers with at least one price.
    fn instruments(&self) -> Result<Vec<String>>;

    /// Every fund's prices with `start <= date <= end`, ordered by identifier.
    ///
    /// Funds without a price in range are omitted.
    fn load_universe(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceSeries>> {
        let mut universe = Vec::new();
        for id in self.instruments()? {
            let series = self.load_prices(&id, start, end)?;
            if !series.is_empty() {
                universe.push(series);
            }
        }
        Ok(universe)
    }

    /// Fund category by identifier. Funds without metadata are absent.
    fn categories(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

/// Zero-pad purely numeric fund codes to six digits.
pub fn normalize_fund_code(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.len() < 6 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        format!("{:0>6}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Parse `YYYY-MM-DD`, ignoring any time-of-day suffix.
pub fn parse_snapshot_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.trim().get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// Parquet-backed feature and price store.
pub struct ParquetStore {
    data_dir: PathBuf,
}

impl ParquetStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.data_dir.join(format!("{}.parquet", table))
    }

    /// Scan a table lazily.
    pub fn load_lazy(&self, table: &str) -> std::result::Result<LazyFrame, LoaderError> {
        let path = self.table_path(table);
        if !path.exists() {
            return Err(LoaderError::FileNotFound(path.display().to_string()));
        }
        Ok(LazyFrame::scan_parquet(&path, ScanArgsParquet::default())?)
    }

    /// Write `table` to `{data_dir}/{name}.parquet`, replacing any existing file.
    ///
    /// Snapshot dates are stored as `YYYY-MM-DD` strings so the file reads
    /// back through [`FeatureStore::load_features`].
    pub fn write_features(&self, name: &str, table: &FeatureTable) -> Result<PathBuf> {
        let records = table.records();
        let mut columns = vec![
            Column::new(
                INSTRUMENT_COLUMN.into(),
                records.iter().map(|r| r.instrument_id.clone()).collect::<Vec<String>>(),
            ),
            Column::new(
                SNAPSHOT_COLUMN.into(),
                records
                    .iter()
                    .map(|r| r.snapshot_date.format("%Y-%m-%d").to_string())
                    .collect::<Vec<String>>(),
            ),
            Column::new(
                CATEGORY_COLUMN.into(),
                records.iter().map(|r| r.category.clone()).collect::<Vec<Option<String>>>(),
            ),
        ];
        for feature in table.columns() {
            let values: Vec<Option<f64>> = records.iter().map(|r| r.get(*feature)).collect();
            columns.push(Column::new(feature.as_str().into(), values));
        }
        let mut df = DataFrame::new(columns).map_err(LoaderError::from)?;

        fs::create_dir_all(&self.data_dir).map_err(LoaderError::from)?;
        let path = self.table_path(name);
        let file = fs::File::create(&path).map_err(LoaderError::from)?;
        ParquetWriter::new(file)
            .with_compression(ParquetCompression::Zstd(None))
            .finish(&mut df)
            .map_err(LoaderError::from)?;

        info!("Wrote {} feature rows to {}", df.height(), path.display());
        Ok(path)
    }

    fn read_feature_frame(
        df: &DataFrame,
        filter: &SnapshotFilter,
    ) -> std::result::Result<FeatureTable, LoaderError> {
        let ids = df.column(INSTRUMENT_COLUMN)?.cast(&DataType::String)?;
        let ids = ids.str()?;
        let dates = df.column(SNAPSHOT_COLUMN)?.cast(&DataType::String)?;
        let dates = dates.str()?;
        let categories = match df.column(CATEGORY_COLUMN) {
            Ok(column) => Some(column.cast(&DataType::String)?),
            Err(_) => None,
        };
        let categories = categories.as_ref().map(|c| c.str()).transpose()?;

        let mut casted = Vec::new();
        for feature in Feature::ALL {
            if let Ok(column) = df.column(feature.as_str()) {
                casted.push((feature, column.cast(&DataType::Float64)?));
            }
        }
        let mut feature_columns = Vec::with_capacity(casted.len());
        for (feature, column) in &casted {
            feature_columns.push((*feature, column.f64()?));
        }
        let schema: BTreeSet<Feature> = feature_columns.iter().map(|(f, _)| *f).collect();

        let mut records = Vec::with_capacity(df.height());
        let mut unparsed = 0usize;
        for idx in 0..df.height() {
            let (Some(id), Some(raw_date)) = (ids.get(idx), dates.get(idx)) else {
                unparsed += 1;
                continue;
            };
            let Some(snapshot_date) = parse_snapshot_date(raw_date) else {
                unparsed += 1;
                continue;
            };
            if !filter.contains(snapshot_date) {
                continue;
            }

            let mut record = FeatureRecord::new(normalize_fund_code(id), snapshot_date);
            record.category = categories
                .and_then(|c| c.get(idx))
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            for (feature, values) in &feature_columns {
                if let Some(value) = values.get(idx).filter(|v| v.is_finite()) {
                    record.values.insert(*feature, value);
                }
            }
            records.push(record);
        }

        if unparsed > 0 {
            warn!("Skipped {} feature rows without fund code or snapshot date", unparsed);
        }

        Ok(FeatureTable::new(schema, records))
    }
}

/// NAV points grouped by normalized fund code.
type NavPartitions = BTreeMap<String, BTreeMap<NaiveDate, f64>>;

impl ParquetStore {
    /// Split a `nav_prices` frame into per-fund points within `[start, end]`.
    ///
    /// Invalid NAVs are dropped, duplicate dates keep the last row.
    fn partition_navs(
        df: &DataFrame,
        start: NaiveDate,
        end: NaiveDate,
    ) -> std::result::Result<NavPartitions, LoaderError> {
        let codes = df.column(INSTRUMENT_COLUMN)?.cast(&DataType::String)?;
        let codes = codes.str()?;
        let dates = df.column("date")?.cast(&DataType::String)?;
        let dates = dates.str()?;
        let navs = df.column("unit_nav")?.cast(&DataType::Float64)?;
        let navs = navs.f64()?;

        let mut partitions = NavPartitions::new();
        for idx in 0..df.height() {
            let code = codes.get(idx);
            let date = dates.get(idx).and_then(parse_snapshot_date);
            let nav = navs.get(idx).filter(|v| v.is_finite() && *v > 0.0);
            if let (Some(code), Some(date), Some(nav)) = (code, date, nav) {
                if date >= start && date <= end {
                    partitions
                        .entry(normalize_fund_code(code))
                        .or_default()
                        .insert(date, nav);
                }
            }
        }
        Ok(partitions)
    }

    fn nav_frame(&self) -> std::result::Result<LazyFrame, LoaderError> {
        Ok(self
            .load_lazy(NAV_TABLE)?
            .select([col(INSTRUMENT_COLUMN), col("date"), col("unit_nav")]))
    }
}

impl FeatureStore for ParquetStore {
    fn load_features(&self, source: &str, filter: &SnapshotFilter) -> Result<FeatureTable> {
        let df = self.load_lazy(source)?.collect().map_err(LoaderError::from)?;
        for column in EXPECTED_COLUMNS {
            if df.column(column).is_err() {
                return Err(LoaderError::InvalidData(format!(
                    "table {} is missing column {}",
                    source, column
                ))
                .into());
            }
        }
        let table = Self::read_feature_frame(&df, filter)?;
        debug!("Loaded {} feature rows from {}", table.len(), source);
        Ok(table)
    }
}

impl PriceStore for ParquetStore {
    fn load_prices(
        &self,
        instrument_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PriceSeries> {
        let code = normalize_fund_code(instrument_id);
        let unpadded = code.trim_start_matches('0').to_string();
        let df = self
            .nav_frame()?
            .filter(
                col(INSTRUMENT_COLUMN)
                    .cast(DataType::String)
                    .eq(lit(code.clone()))
                    .or(col(INSTRUMENT_COLUMN).cast(DataType::String).eq(lit(unpadded))),
            )
            .collect()
            .map_err(LoaderError::from)?;

        let points = Self::partition_navs(&df, start, end)?
            .remove(&code)
            .unwrap_or_default();
        PriceSeries::new(code, points.into_iter().collect())
    }

    fn load_universe(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceSeries>> {
        let df = self.nav_frame()?.collect().map_err(LoaderError::from)?;
        let partitions = Self::partition_navs(&df, start, end)?;
        debug!("Partitioned {} NAV rows into {} funds", df.height(), partitions.len());

        partitions
            .into_iter()
            .map(|(code, points)| PriceSeries::new(code, points.into_iter().collect()))
            .collect()
    }

    fn instruments(&self) -> Result<Vec<String>> {
        let df = self
            .load_lazy(NAV_TABLE)?
            .select([col(INSTRUMENT_COLUMN).cast(DataType::String).unique()])
            .collect()
            .map_err(LoaderError::from)?;
        let codes = df.column(INSTRUMENT_COLUMN).map_err(LoaderError::from)?;
        let codes = codes.str().map_err(LoaderError::from)?;

        let ids: BTreeSet<String> = codes.into_iter().flatten().map(normalize_fund_code).collect();
        Ok(ids.into_iter().collect())
    }

    fn categories(&self) -> Result<HashMap<String, String>> {
        let lf = match self.load_lazy(META_TABLE) {
            Ok(lf) => lf,
            Err(LoaderError::FileNotFound(_)) => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        let df = lf.collect().map_err(LoaderError::from)?;
        let codes = df.column(INSTRUMENT_COLUMN).map_err(LoaderError::from)?;
        let codes = codes.cast(&DataType::String).map_err(LoaderError::from)?;
        let codes = codes.str().map_err(LoaderError::from)?;
        let kinds = df.column(CATEGORY_COLUMN).map_err(LoaderError::from)?;
        let kinds = kinds.cast(&DataType::String).map_err(LoaderError::from)?;
        let kinds = kinds.str().map_err(LoaderError::from)?;

        let mut categories = HashMap::new();
        for idx in 0..df.height() {
            if let (Some(code), Some(kind)) = (codes.get(idx), kinds.get(idx)) {
                if !kind.is_empty() {
                    categories.insert(normalize_fund_code(code), kind.to_string());
                }
            }
        }
        Ok(categories)
    }
}

/// Store over tables and series the caller already holds in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: HashMap<String, FeatureTable>,
    prices: BTreeMap<String, PriceSeries>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: impl Into<String>, table: FeatureTable) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    pub fn with_series(mut self, series: PriceSeries) -> Self {
        self.prices.insert(series.instrument_id.clone(), series);
        self
    }
}

impl FeatureStore for InMemoryStore {
    fn load_features(&self, source: &str, filter: &SnapshotFilter) -> Result<FeatureTable> {
        let table = self
            .tables
            .get(source)
            .ok_or_else(|| LoaderError::TableNotFound(source.to_string()))?;
        Ok(table.filter(|r| filter.contains(r.snapshot_date)))
    }
}

impl PriceStore for InMemoryStore {
    fn load_prices(
        &self,
        instrument_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PriceSeries> {
        match self.prices.get(instrument_id) {
            Some(series) => Ok(series.window(start, end)),
            None => PriceSeries::new(instrument_id, Vec::new()),
        }
    }

    fn instruments(&self) -> Result<Vec<String>> {
        Ok(self.prices.keys().cloned().collect())
    }

    fn categories(&self) -> Result<HashMap<String, String>> {
        Ok(self
            .prices
            .values()
            .filter_map(|s| Some((s.instrument_id.clone(), s.category.clone()?)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_normalize_fund_code() {
        assert_eq!(normalize_fund_code("1"), "000001");
        assert_eq!(normalize_fund_code(" 161725 "), "161725");
        assert_eq!(normalize_fund_code("ABC"), "ABC");
    }

    #[test]
    fn test_parse_snapshot_date() {
        assert_eq!(parse_snapshot_date("2024-06-30"), Some(date(2024, 6, 30)));
        assert_eq!(
            parse_snapshot_date("2024-06-30 00:00:00"),
            Some(date(2024, 6, 30))
        );
        assert_eq!(parse_snapshot_date("2024/06/30"), None);
        assert_eq!(parse_snapshot_date("2024"), None);
    }

    #[test]
    fn test_table_path() {
        let store = ParquetStore::new("data");
        assert_eq!(store.table_path("features_M_star"), Path::new("data/features_M_star.parquet"));
    }

    #[test]
    fn test_feature_parquet_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let table = FeatureTable::from_records(vec![
            FeatureRecord::new("000001", date(2020, 1, 31))
                .with_value(Feature::Ret1m, 0.1)
                .with_value(Feature::Mdd36m, -0.2)
                .with_category("equity"),
            FeatureRecord::new("000002", date(2020, 2, 29)).with_value(Feature::Ret1m, 0.2),
        ]);

        let path = store.write_features("features", &table).unwrap();
        assert!(path.ends_with("features.parquet"));

        let loaded = store.load_features("features", &SnapshotFilter::all()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.has_column(Feature::Mdd36m));
        let first = &loaded.records()[0];
        assert_eq!(first.instrument_id, "000001");
        assert_eq!(first.category.as_deref(), Some("equity"));
        assert_eq!(first.get(Feature::Mdd36m), Some(-0.2));
        assert_eq!(loaded.records()[1].get(Feature::Mdd36m), None);

        let feb = store
            .load_features("features", &SnapshotFilter::on(date(2020, 2, 29)))
            .unwrap();
        assert_eq!(feb.instruments(), vec!["000002"]);
    }

    fn write_frame(dir: &Path, name: &str, mut df: DataFrame) {
        let file = fs::File::create(dir.join(format!("{}.parquet", name))).unwrap();
        ParquetWriter::new(file).finish(&mut df).unwrap();
    }

    /// Integer fund codes, a duplicated date, two invalid NAVs and one late row.
    fn nav_store() -> (tempfile::TempDir, ParquetStore) {
        let dir = tempfile::tempdir().unwrap();
        let df = DataFrame::new(vec![
            Column::new(INSTRUMENT_COLUMN.into(), vec![1i64, 1, 1, 1, 1, 2, 2]),
            Column::new(
                "date".into(),
                vec![
                    "2020-01-02",
                    "2020-01-03",
                    "2020-01-03",
                    "2020-01-06",
                    "2020-01-07",
                    "2020-01-02",
                    "2021-01-04",
                ],
            ),
            Column::new("unit_nav".into(), vec![1.0, 1.1, 1.2, 0.0, -1.0, 2.0, 2.5]),
        ])
        .unwrap();
        write_frame(dir.path(), NAV_TABLE, df);
        let store = ParquetStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_parquet_prices() {
        let (_dir, store) = nav_store();

        let series = store.load_prices("000001", date(2020, 1, 1), date(2020, 12, 31)).unwrap();
        assert_eq!(series.instrument_id, "000001");
        assert_eq!(series.dates(), &[date(2020, 1, 2), date(2020, 1, 3)]);
        assert_eq!(series.prices(), &[1.0, 1.2]);

        let unpadded = store.load_prices("1", date(2020, 1, 3), date(2020, 12, 31)).unwrap();
        assert_eq!(unpadded.instrument_id, "000001");
        assert_eq!(unpadded.prices(), &[1.2]);

        assert!(store.load_prices("999999", date(2020, 1, 1), date(2020, 12, 31)).unwrap().is_empty());
    }

    #[test]
    fn test_parquet_instruments() {
        let (_dir, store) = nav_store();
        assert_eq!(store.instruments().unwrap(), vec!["000001", "000002"]);
    }

    #[test]
    fn test_parquet_universe_single_pass() {
        let (_dir, store) = nav_store();

        let universe = store.load_universe(date(2020, 1, 1), date(2020, 12, 31)).unwrap();
        let ids: Vec<&str> = universe.iter().map(|s| s.instrument_id.as_str()).collect();
        assert_eq!(ids, vec!["000001", "000002"]);
        assert_eq!(universe[0].prices(), &[1.0, 1.2]);
        assert_eq!(universe[1].prices(), &[2.0]);

        let late = store.load_universe(date(2021, 1, 1), date(2021, 12, 31)).unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].instrument_id, "000002");
        assert_eq!(late[0].prices(), &[2.5]);
    }

    #[test]
    fn test_parquet_categories() {
        let (dir, store) = nav_store();
        assert!(store.categories().unwrap().is_empty());

        let meta = DataFrame::new(vec![
            Column::new(INSTRUMENT_COLUMN.into(), vec![1i64, 2]),
            Column::new(CATEGORY_COLUMN.into(), vec!["equity", ""]),
        ])
        .unwrap();
        write_frame(dir.path(), META_TABLE, meta);

        let categories = store.categories().unwrap();
        assert_eq!(categories.len(), 1);
        assert_eq!(categories.get("000001").map(String::as_str), Some("equity"));
    }

    #[test]
    fn test_missing_parquet_file() {
        let store = ParquetStore::new("/nonexistent/fundfit");
        let err = store.load_features("features", &SnapshotFilter::all()).unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[test]
    fn test_in_memory_feature_filter() {
        let table = FeatureTable::from_records(vec![
            FeatureRecord::new("A", date(2020, 1, 31)).with_value(Feature::Ret1m, 0.1),
            FeatureRecord::new("A", date(2020, 2, 29)).with_value(Feature::Ret1m, 0.2),
        ]);
        let store = InMemoryStore::new().with_table("features", table);

        let filter = SnapshotFilter::on(date(2020, 2, 29));
        let loaded = store.load_features("features", &filter).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(store.load_features("other", &filter).is_err());
    }

    #[test]
    fn test_in_memory_prices() {
        let series = PriceSeries::new(
            "000001",
            vec![(date(2020, 1, 1), 1.0), (date(2020, 1, 2), 1.1), (date(2020, 1, 3), 1.2)],
        )
        .unwrap()
        .with_category("equity");
        let store = InMemoryStore::new().with_series(series);

        let window = store.load_prices("000001", date(2020, 1, 2), date(2020, 1, 5)).unwrap();
        assert_eq!(window.len(), 2);
        assert!(store.load_prices("999999", date(2020, 1, 1), date(2020, 1, 5)).unwrap().is_empty());
        assert_eq!(store.categories().unwrap().get("000001").map(String::as_str), Some("equity"));

        assert_eq!(store.load_universe(date(2020, 1, 2), date(2020, 1, 5)).unwrap(), vec![window]);
        assert!(store.load_universe(date(2021, 1, 1), date(2021, 1, 5)).unwrap().is_empty());
    }
}
