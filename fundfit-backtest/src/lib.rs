pub mod config;
pub mod data;
pub mod error;
pub mod features;
pub mod metrics;
pub mod optimizer;
pub mod scoring;
pub mod walkforward;

// Re-export commonly used types
pub use config::ResearchConfig;
pub use data::{
    Feature, FeatureRecord, FeatureStore, FeatureTable, InMemoryStore, ParquetStore, PriceSeries,
    PriceStore, SnapshotFilter, TargetColumn,
};
pub use error::{ResearchError, Result};
pub use features::{FeatureEngine, FeatureEngineConfig, SamplingCalendar, SamplingFrequency};
pub use metrics::{PortfolioEvaluator, PortfolioMetrics, PortfolioResult};
pub use optimizer::{GridSearchOptimizer, RidgeOptimizer, WeightOptimizer, WeightSpace};
pub use scoring::{ScoredTable, Scorer, WeightFile, WeightVector};
pub use walkforward::{HoldoutValidator, ValidationReport, WalkForwardConfig, WalkForwardValidator};
