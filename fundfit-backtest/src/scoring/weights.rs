//! Weight vectors and their on-disk form.
//!
//! A weight file is a JSON object, either the bare `{feature: weight}`
//! mapping or the nested form `{"weights": {...}, "method": ..., ...}` with
//! arbitrary metadata next to the weights. Both load the same way.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::data::Feature;
use crate::error::{ResearchError, Result};

/// Linear scoring coefficients. Features not present weigh zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightVector(BTreeMap<Feature, f64>);

impl WeightVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, feature: Feature, weight: f64) -> Self {
        self.0.insert(feature, weight);
        self
    }

    /// Build from string keys, failing on any unknown feature name.
    pub fn from_string_map(raw: BTreeMap<String, f64>) -> Result<Self> {
        let mut weights = BTreeMap::new();
        for (name, weight) in raw {
            let feature: Feature = name.parse()?;
            if !weight.is_finite() {
                return Err(ResearchError::config(format!(
                    "weight for {} is not finite",
                    feature
                )));
            }
            weights.insert(feature, weight);
        }
        Ok(Self(weights))
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.0.get(&feature).copied().unwrap_or(0.0)
    }

    pub fn features(&self) -> Vec<Feature> {
        self.0.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Feature, f64)> + '_ {
        self.0.iter().map(|(f, w)| (*f, *w))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every coefficient is exactly zero.
    pub fn is_zero(&self) -> bool {
        self.0.values().all(|w| *w == 0.0)
    }

    pub fn scaled(&self, factor: f64) -> WeightVector {
        Self(self.0.iter().map(|(f, w)| (*f, w * factor)).collect())
    }

    /// Euclidean norm of the coefficients.
    pub fn norm(&self) -> f64 {
        self.0.values().map(|w| w * w).sum::<f64>().sqrt()
    }
}

impl FromIterator<(Feature, f64)> for WeightVector {
    fn from_iter<I: IntoIterator<Item = (Feature, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for WeightVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(feature, weight)| format!("{}={:.4}", feature, weight))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

impl Serialize for WeightVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (feature, weight) in &self.0 {
            map.serialize_entry(feature.as_str(), weight)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for WeightVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = BTreeMap::<String, f64>::deserialize(deserializer)?;
        WeightVector::from_string_map(raw).map_err(D::Error::custom)
    }
}

/// Weights plus whatever metadata the producer stored next to them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WeightFile {
    pub weights: WeightVector,
    #[serde(flatten)]
    pub metadata: BTreeMap<String, Value>,
}

impl WeightFile {
    pub fn new(weights: WeightVector) -> Self {
        Self {
            weights,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Parse either the bare or the nested JSON form.
    pub fn parse(text: &str) -> Result<Self> {
        let Value::Object(mut map) = serde_json::from_str::<Value>(text)? else {
            return Err(ResearchError::config("weight file must be a JSON object"));
        };

        match map.remove("weights") {
            Some(weights) => Ok(Self {
                weights: weights_from_value(weights)?,
                metadata: map.into_iter().collect(),
            }),
            None => Ok(Self::new(weights_from_value(Value::Object(map))?)),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Write the nested form.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

fn weights_from_value(value: Value) -> Result<WeightVector> {
    let raw: BTreeMap<String, f64> = serde_json::from_value(value)
        .map_err(|e| ResearchError::config(format!("invalid weight mapping: {}", e)))?;
    WeightVector::from_string_map(raw)
}

/// Parse per-feature caps from `feature=value,feature2=value`.
///
/// An empty string means no caps.
pub fn parse_weight_caps(raw: &str) -> Result<BTreeMap<Feature, f64>> {
    let mut caps = BTreeMap::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, value) = item.split_once('=').ok_or_else(|| {
            ResearchError::config(format!("weight cap must be feature=value, got: {}", item))
        })?;
        let feature: Feature = name.trim().parse()?;
        let cap: f64 = value.trim().parse().map_err(|_| {
            ResearchError::config(format!("invalid cap for {}: {}", feature, value.trim()))
        })?;
        caps.insert(feature, cap);
    }
    Ok(caps)
}

/// Parse a comma-separated candidate grid such as `"-0.5,0,0.5"`.
pub fn parse_grid(raw: &str) -> Result<Vec<f64>> {
    let grid = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ResearchError::config(format!("invalid grid value: {}", s)))
        })
        .collect::<Result<Vec<f64>>>()?;

    if grid.is_empty() {
        return Err(ResearchError::config("weight grid is empty"));
    }
    Ok(grid)
}
