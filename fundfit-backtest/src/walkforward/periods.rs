//! Walk-forward window generation.
//!
//! Generates back-to-back train/test windows rolled forward by a fixed step.

use std::fmt;

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ResearchError, Result};

/// A single train/test split. Both ranges are half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWindow {
    /// Window number (1-indexed).
    pub window_id: usize,
    /// Training start date (inclusive).
    pub train_start: NaiveDate,
    /// Training end date, equal to the test start (exclusive).
    pub train_end: NaiveDate,
    /// Test start date (inclusive).
    pub test_start: NaiveDate,
    /// Test end date (exclusive).
    pub test_end: NaiveDate,
}

impl ValidationWindow {
    /// Get training period length in days.
    pub fn train_days(&self) -> i64 {
        (self.train_end - self.train_start).num_days()
    }

    /// Get test period length in days.
    pub fn test_days(&self) -> i64 {
        (self.test_end - self.test_start).num_days()
    }

    pub fn train_period(&self) -> String {
        format!("{} to {}", self.train_start, self.train_end)
    }

    pub fn test_period(&self) -> String {
        format!("{} to {}", self.test_start, self.test_end)
    }
}

impl fmt::Display for ValidationWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Window {}: Train[{}] -> Test[{}]",
            self.window_id,
            self.train_period(),
            self.test_period()
        )
    }
}

/// Configuration for walk-forward windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Training window length in months.
    pub train_months: u32,
    /// Test window length in months.
    pub test_months: u32,
    /// Roll forward by this many months.
    pub step_months: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            train_months: 24,
            test_months: 6,
            step_months: 6,
        }
    }
}

impl WindowConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, months) in [
            ("train_months", self.train_months),
            ("test_months", self.test_months),
            ("step_months", self.step_months),
        ] {
            if months == 0 {
                return Err(ResearchError::config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

/// Generator for walk-forward windows.
pub struct WindowGenerator {
    config: WindowConfig,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

impl WindowGenerator {
    pub fn new(config: WindowConfig, start_date: NaiveDate, end_date: NaiveDate) -> Result<Self> {
        config.validate()?;
        if start_date >= end_date {
            return Err(ResearchError::config(format!(
                "start date {} must precede end date {}",
                start_date, end_date
            )));
        }
        Ok(Self {
            config,
            start_date,
            end_date,
        })
    }

    /// All windows whose test end does not pass the end date.
    ///
    /// The train start advances by `step_months` from the previous train
    /// start, so month-end clamping carries over between windows.
    pub fn generate(&self) -> Vec<ValidationWindow> {
        let mut windows = Vec::new();
        let mut train_start = self.start_date;

        loop {
            let Some(train_end) = add_months(train_start, self.config.train_months) else {
                break;
            };
            let Some(test_end) = add_months(train_end, self.config.test_months) else {
                break;
            };
            if test_end > self.end_date {
                break;
            }

            windows.push(ValidationWindow {
                window_id: windows.len() + 1,
                train_start,
                train_end,
                test_start: train_end,
                test_end,
            });

            match add_months(train_start, self.config.step_months) {
                Some(next) => train_start = next,
                None => break,
            }
        }

        debug!(
            "Generated {} windows between {} and {}",
            windows.len(),
            self.start_date,
            self.end_date
        );
        windows
    }
}

/// Add months to a date, clamping the day to the target month's length.
fn add_months(date: NaiveDate, months: u32) -> Option<NaiveDate> {
    date.checked_add_months(Months::new(months))
}
