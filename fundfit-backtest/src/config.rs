//! Research configuration.
//!
//! One TOML file drives every command. Sections may be omitted; missing keys
//! take the defaults below.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::Feature;
use crate::error::{ResearchError, Result};
use crate::features::{FeatureEngineConfig, SamplingCalendar, SamplingFrequency};
use crate::optimizer::{GridSearchConfig, GridSearchOptimizer, RidgeOptimizer, WeightSpace};
use crate::walkforward::{HoldoutConfig, WalkForwardConfig};

/// Complete configuration loaded from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub data: DataSettings,
    pub features: FeatureSettings,
    pub search: SearchSettings,
    pub walk_forward: WalkForwardSettings,
    pub ridge: RidgeSettings,
}

/// Where tables live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    /// Directory holding `{table}.parquet` files.
    pub data_dir: PathBuf,
    /// Feature table read by search, evaluation and validation.
    pub feature_table: String,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            feature_table: "fund_features".to_string(),
        }
    }
}

/// Feature engine settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    pub frequency: SamplingFrequency,
    #[serde(flatten)]
    pub engine: FeatureEngineConfig,
}

impl FeatureSettings {
    pub fn calendar(&self) -> SamplingCalendar {
        SamplingCalendar::new(self.frequency)
    }
}

/// Weight search settings.
///
/// An explicit `grid` wins over the `range_*` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub features: Vec<Feature>,
    pub grid: Option<Vec<f64>>,
    pub range_min: f64,
    pub range_max: f64,
    pub range_step: f64,
    #[serde(flatten)]
    pub optimizer: GridSearchConfig,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            features: Feature::SCORING.to_vec(),
            grid: None,
            range_min: 0.0,
            range_max: 0.2,
            range_step: 0.1,
            optimizer: GridSearchConfig::default(),
        }
    }
}

impl SearchSettings {
    pub fn weight_space(&self) -> Result<WeightSpace> {
        match &self.grid {
            Some(grid) if grid.is_empty() => Err(ResearchError::config("search grid is empty")),
            Some(grid) => WeightSpace::shared(&self.features, grid),
            None => WeightSpace::from_range(
                &self.features,
                self.range_min,
                self.range_max,
                self.range_step,
            ),
        }
    }

    pub fn optimizer(&self) -> Result<GridSearchOptimizer> {
        GridSearchOptimizer::new(self.weight_space()?, self.optimizer.clone())
    }
}

/// Walk-forward settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkForwardSettings {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[serde(flatten)]
    pub run: WalkForwardConfig,
}

impl WalkForwardSettings {
    /// The configured date range, if both ends are set.
    pub fn range(&self) -> Result<Option<(NaiveDate, NaiveDate)>> {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) if start >= end => Err(ResearchError::config(format!(
                "walk-forward start {} must precede end {}",
                start, end
            ))),
            (Some(start), Some(end)) => Ok(Some((start, end))),
            _ => Ok(None),
        }
    }

    pub fn holdout(&self) -> HoldoutConfig {
        HoldoutConfig {
            horizon_months: self.run.horizon_months,
            top_k: self.run.top_k,
        }
    }
}

/// Ridge regression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RidgeSettings {
    pub lambda: f64,
    /// Regressors; the search features when empty.
    pub features: Vec<Feature>,
}

impl Default for RidgeSettings {
    fn default() -> Self {
        Self {
            lambda: 0.1,
            features: Vec::new(),
        }
    }
}

impl ResearchConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: toml::Table = toml::from_str(content)?;
        check_feature_names(&raw)?;
        let config: ResearchConfig = toml::Value::Table(raw).try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section; the first problem is returned.
    pub fn validate(&self) -> Result<()> {
        if self.data.feature_table.is_empty() {
            return Err(ResearchError::config("feature_table must not be empty"));
        }
        if self.features.engine.min_history == 0 {
            return Err(ResearchError::config("min_history must be positive"));
        }
        self.search.optimizer()?;
        self.ridge_optimizer()?;
        self.walk_forward.run.validate()?;
        self.walk_forward.range()?;
        Ok(())
    }

    pub fn ridge_optimizer(&self) -> Result<RidgeOptimizer> {
        let features = if self.ridge.features.is_empty() {
            self.search.features.clone()
        } else {
            self.ridge.features.clone()
        };
        RidgeOptimizer::new(features, self.ridge.lambda)
    }

    /// Example configuration file content.
    pub fn example() -> String {
        r#"# Fund scoring research configuration

[data]
data_dir = "data"
feature_table = "fund_features"

[features]
frequency = "monthly"    # daily, weekly or monthly
min_history = 756        # trading days
category_percentile = true

[search]
features = ["ret_3m", "ret_6m", "ret_12m", "mdd_36m", "risk_adj_return"]
range_min = 0.0
range_max = 0.2
range_step = 0.1
# grid = [-0.5, 0.0, 0.5]
mode = "auto"            # exhaustive up to 5 features, random beyond
trials = 1000
seed = 42
objective = "sharpe"
top_k = 30

[search.constraints]
min_abs_weight = 0.0
# caps = { ret_3m = 0.1 }

[walk_forward]
start_date = "2015-01-01"
end_date = "2025-06-30"
train_months = 24
test_months = 6
step_months = 6
horizon_months = 6
top_k = 30

[ridge]
lambda = 0.1
"#
        .to_string()
    }
}

/// Feature names in `search.features`, `search.constraints.caps` and
/// `ridge.features` must belong to the vocabulary.
fn check_feature_names(raw: &toml::Table) -> Result<()> {
    let section = |name: &str| raw.get(name).and_then(toml::Value::as_table);

    let mut names: Vec<&str> = Vec::new();
    for table in [section("search"), section("ridge")].into_iter().flatten() {
        if let Some(list) = table.get("features").and_then(toml::Value::as_array) {
            names.extend(list.iter().filter_map(toml::Value::as_str));
        }
    }
    let caps = section("search")
        .and_then(|s| s.get("constraints"))
        .and_then(toml::Value::as_table)
        .and_then(|c| c.get("caps"))
        .and_then(toml::Value::as_table);
    if let Some(caps) = caps {
        names.extend(caps.keys().map(String::as_str));
    }

    for name in names {
        name.parse::<Feature>()?;
    }
    Ok(())
}
