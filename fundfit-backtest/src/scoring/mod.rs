//! Linear scoring of feature snapshots.

pub mod scorer;
pub mod weights;

pub use scorer::{rank_by_score, FeatureMatrix, ScoredRecord, ScoredTable, Scorer};
pub use weights::{parse_grid, parse_weight_caps, WeightFile, WeightVector};
