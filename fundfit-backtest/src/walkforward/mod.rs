//! Walk-forward validation module.
//!
//! Out-of-sample checks of weight vectors:
//! - Rolling train/test windows (default 24 months train, 6 months test, 6 month step)
//! - Per-window optimization, scoring and top-K evaluation
//! - Hold-out comparison of predicted picks with realized prices

pub mod holdout;
pub mod periods;
pub mod validator;

pub use holdout::{HoldoutConfig, HoldoutReport, HoldoutResult, HoldoutSummary, HoldoutValidator};
pub use periods::{ValidationWindow, WindowConfig, WindowGenerator};
pub use validator::{
    MetricSummary, SkippedWindow, ValidationReport, ValidationSummary, WalkForwardConfig,
    WalkForwardValidator, WindowResult,
};
