//! Trailing-window statistics over daily prices and returns.
//!
//! Windows are counted in observations, not calendar days. Callers slice the
//! trailing window ending at the sampling index and pass it in.

/// Trading days per year used for annualization.
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Observations per lookback month.
pub const DAYS_1M: usize = 21;
pub const DAYS_3M: usize = 63;
pub const DAYS_6M: usize = 126;
pub const DAYS_12M: usize = 252;
pub const DAYS_24M: usize = 504;
pub const DAYS_36M: usize = 756;

/// Simple daily returns; the first observation has a return of 0.
pub fn daily_returns(prices: &[f64]) -> Vec<f64> {
    let mut returns = Vec::with_capacity(prices.len());
    if prices.is_empty() {
        return returns;
    }
    returns.push(0.0);
    returns.extend(prices.windows(2).map(|w| w[1] / w[0] - 1.0));
    returns
}

/// Product of (1 + r) over the window, minus 1.
pub fn compound_return(returns: &[f64]) -> f64 {
    returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0
}

/// Sample standard deviation of returns scaled by sqrt(252).
///
/// Undefined for fewer than two observations.
pub fn annualized_volatility(returns: &[f64]) -> Option<f64> {
    let n = returns.len();
    if n < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / n as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    Some(variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt())
}

/// Minimum of price / running max - 1 over the path. Never positive.
pub fn max_drawdown(prices: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0_f64;
    for &price in prices {
        peak = peak.max(price);
        worst = worst.min(price / peak - 1.0);
    }
    worst
}

/// Root-mean-square of the negative returns scaled by sqrt(252); 0 without losses.
pub fn downside_volatility(returns: &[f64]) -> f64 {
    let (sum_sq, count) = returns
        .iter()
        .filter(|r| **r < 0.0)
        .fold((0.0, 0usize), |(s, n), r| (s + r * r, n + 1));
    if count == 0 {
        return 0.0;
    }
    (sum_sq / count as f64).sqrt() * TRADING_DAYS_PER_YEAR.sqrt()
}

/// The `window` observations ending at `end` (inclusive), if that many exist.
pub fn trailing(values: &[f64], end: usize, window: usize) -> Option<&[f64]> {
    if window == 0 || end >= values.len() || end + 1 < window {
        return None;
    }
    Some(&values[end + 1 - window..=end])
}

/// Average-rank percentiles (rank / n, ties share the mean rank).
///
/// Non-finite inputs get `None` and are excluded from the ranking.
pub fn average_rank_pct(values: &[f64]) -> Vec<Option<f64>> {
    let mut order: Vec<usize> = (0..values.len()).filter(|i| values[*i].is_finite()).collect();
    order.sort_by(|a, b| values[*a].total_cmp(&values[*b]));

    let n = order.len() as f64;
    let mut pct = vec![None; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start;
        while end + 1 < order.len() && values[order[end + 1]] == values[order[start]] {
            end += 1;
        }
        // 1-based ranks start+1..=end+1 share their mean.
        let rank = (start + end) as f64 / 2.0 + 1.0;
        for idx in &order[start..=end] {
            pct[*idx] = Some(rank / n);
        }
        start = end + 1;
    }
    pct
}
