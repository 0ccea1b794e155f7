//! Portfolio performance metrics.
//!
//! Evaluates score-ranked top-K selections per snapshot:
//! - Equal-weight period returns
//! - Annualized return and volatility, Sharpe ratio
//! - Maximum drawdown of the compounded path
//! - Hit rate against the cross-sectional median

pub mod evaluator;

pub use evaluator::{
    compounded_drawdown, EvaluationFrame, PeriodReturn, PortfolioEvaluator, PortfolioMetrics,
    PortfolioResult,
};
