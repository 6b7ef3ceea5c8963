//! Feature Extraction - Raw sensor readings to fixed-shape feature vectors
//!
//! ## Architecture
//!
//! - `Feature` / `FEATURE_NAMES`: the compile-time feature schema (11 features)
//! - `FeatureVector`: a fixed-size, schema-ordered array of feature values
//! - `RollingWindow`: time-bounded, sample-capped window with mean/std-dev
//! - `FeaturePreprocessor`: per-location state turning readings into vectors
//!
//! ## Usage
//!
//! ```ignore
//! let mut pre = FeaturePreprocessor::new(config.preprocessor.clone());
//! match pre.process_reading(&reading)? {
//!     Some(vector) => detector.predict(&vector)?,
//!     None => { /* location still warming up */ }
//! }
//! ```

mod preprocessor;
mod window;

pub use preprocessor::FeaturePreprocessor;
pub use window::RollingWindow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

// ============================================================================
// Feature Schema
// ============================================================================

/// Number of features in every vector.
pub const FEATURE_COUNT: usize = 11;

/// Feature names in schema order. Persisted models record this ordering.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "pressure",
    "flow",
    "pressure_rate_of_change",
    "flow_rate_of_change",
    "pressure_ma_30s",
    "flow_ma_30s",
    "pressure_stddev_60s",
    "flow_stddev_60s",
    "pressure_flow_ratio",
    "hour_of_day",
    "is_weekend",
];

/// Index into a `FeatureVector`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Pressure,
    Flow,
    PressureRateOfChange,
    FlowRateOfChange,
    PressureMa30s,
    FlowMa30s,
    PressureStddev60s,
    FlowStddev60s,
    PressureFlowRatio,
    HourOfDay,
    IsWeekend,
}

impl Feature {
    pub const ALL: [Feature; FEATURE_COUNT] = [
        Feature::Pressure,
        Feature::Flow,
        Feature::PressureRateOfChange,
        Feature::FlowRateOfChange,
        Feature::PressureMa30s,
        Feature::FlowMa30s,
        Feature::PressureStddev60s,
        Feature::FlowStddev60s,
        Feature::PressureFlowRatio,
        Feature::HourOfDay,
        Feature::IsWeekend,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        FEATURE_NAMES[self as usize]
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeatureError {
    #[error("missing feature '{0}'")]
    Missing(String),

    #[error("unknown feature '{0}'")]
    Unknown(String),

    #[error("non-finite value for '{name}': {value}")]
    NonFinite { name: String, value: f64 },

    #[error("out-of-order reading for '{location}': {received} is earlier than {last}")]
    OutOfOrder {
        location: String,
        last: DateTime<Utc>,
        received: DateTime<Utc>,
    },
}

// ============================================================================
// Feature Vector
// ============================================================================

/// Fixed-size feature vector in `FEATURE_NAMES` order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    values: [f64; FEATURE_COUNT],
    /// A rate-of-change component was carried over because Δt was zero.
    #[serde(default)]
    stale: bool,
}

impl FeatureVector {
    pub const fn new(values: [f64; FEATURE_COUNT]) -> Self {
        Self { values, stale: false }
    }

    pub(crate) const fn with_stale(mut self, stale: bool) -> Self {
        self.stale = stale;
        self
    }

    /// Build a vector from a string-keyed map, checking the schema.
    ///
    /// Every schema feature must be present and no other keys are accepted.
    pub fn from_named(map: &HashMap<String, f64>) -> Result<Self, FeatureError> {
        if let Some(unknown) = map.keys().find(|k| Feature::from_name(k).is_none()) {
            return Err(FeatureError::Unknown(unknown.clone()));
        }
        let mut values = [0.0; FEATURE_COUNT];
        for feature in Feature::ALL {
            values[feature.index()] = *map
                .get(feature.name())
                .ok_or_else(|| FeatureError::Missing(feature.name().to_string()))?;
        }
        Ok(Self::new(values))
    }

    /// Name → value view, in schema order.
    pub fn to_named(&self) -> BTreeMap<&'static str, f64> {
        Feature::ALL.iter().map(|f| (f.name(), self.get(*f))).collect()
    }

    pub const fn get(&self, feature: Feature) -> f64 {
        self.values[feature.index()]
    }

    pub const fn values(&self) -> &[f64; FEATURE_COUNT] {
        &self.values
    }

    pub const fn is_stale(&self) -> bool {
        self.stale
    }

    /// Reject NaN or infinite components.
    pub fn ensure_finite(&self) -> Result<(), FeatureError> {
        match Feature::ALL.iter().find(|f| !self.get(**f).is_finite()) {
            Some(f) => Err(FeatureError::NonFinite {
                name: f.name().to_string(),
                value: self.get(*f),
            }),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
