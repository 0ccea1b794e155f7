pub mod loader;
pub mod targets;
pub mod types;

pub use loader::{
    normalize_fund_code, parse_snapshot_date, FeatureStore, InMemoryStore, LoaderError,
    ParquetStore, PriceStore,
};
pub use targets::{attach_forward_returns, prepare_targets};
pub use types::{
    Feature, FeatureRecord, FeatureTable, PriceRecord, PriceSeries, SnapshotFilter, TargetColumn,
};
