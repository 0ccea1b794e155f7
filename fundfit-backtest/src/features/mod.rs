//! Rolling feature computation.
//!
//! Turns daily NAV histories into monthly (or weekly/daily) snapshots:
//! - Compounded returns over 1/3/6/12/24/36 months
//! - Annualized and downside volatility
//! - Maximum drawdown over 6 and 36 months
//! - Risk-adjusted composites and category percentiles

pub mod engine;
pub mod rolling;

pub use engine::{
    assign_category_percentiles, FeatureEngine, FeatureEngineConfig, SamplingCalendar,
    SamplingFrequency, UNKNOWN_CATEGORY,
};
