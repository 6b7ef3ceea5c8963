//! Per-location streaming feature preprocessor

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use std::collections::HashMap;
use tracing::debug;

use super::{Feature, FeatureError, FeatureVector, RollingWindow, FEATURE_COUNT};
use crate::config::PreprocessorConfig;
use crate::types::SensorReading;

/// Rolling state for one location.
#[derive(Debug, Clone)]
struct LocationState {
    last_timestamp: DateTime<Utc>,
    last_pressure: f64,
    last_flow: f64,
    pressure_rate: f64,
    flow_rate: f64,
    readings_seen: usize,
    pressure_ma: RollingWindow,
    flow_ma: RollingWindow,
    pressure_sd: RollingWindow,
    flow_sd: RollingWindow,
}

impl LocationState {
    fn new(config: &PreprocessorConfig, reading: &SensorReading) -> Self {
        let ma = RollingWindow::new(config.moving_average_window_secs, config.max_window_samples);
        let sd = RollingWindow::new(config.stddev_window_secs, config.max_window_samples);
        Self {
            last_timestamp: reading.timestamp,
            last_pressure: reading.pressure,
            last_flow: reading.flow,
            pressure_rate: 0.0,
            flow_rate: 0.0,
            readings_seen: 0,
            pressure_ma: ma.clone(),
            flow_ma: ma,
            pressure_sd: sd.clone(),
            flow_sd: sd,
        }
    }
}

/// Turns raw readings into feature vectors, one rolling state per location.
///
/// Windows are bounded both by time and by `max_window_samples`, so memory per
/// location stays constant regardless of reading cadence.
#[derive(Debug)]
pub struct FeaturePreprocessor {
    config: PreprocessorConfig,
    locations: HashMap<String, LocationState>,
}

impl FeaturePreprocessor {
    pub fn new(config: PreprocessorConfig) -> Self {
        Self {
            config,
            locations: HashMap::new(),
        }
    }

    /// Ingest one reading.
    ///
    /// Returns `Ok(None)` while the location has seen fewer than
    /// `warmup_readings` readings. Rejected readings leave state untouched.
    pub fn process_reading(&mut self, reading: &SensorReading) -> Result<Option<FeatureVector>, FeatureError> {
        for (name, value) in [("pressure", reading.pressure), ("flow", reading.flow)] {
            if !value.is_finite() {
                return Err(FeatureError::NonFinite {
                    name: name.to_string(),
                    value,
                });
            }
        }

        let config = &self.config;
        let state = self
            .locations
            .entry(reading.location.clone())
            .or_insert_with(|| LocationState::new(config, reading));

        if reading.timestamp < state.last_timestamp {
            return Err(FeatureError::OutOfOrder {
                location: reading.location.clone(),
                last: state.last_timestamp,
                received: reading.timestamp,
            });
        }

        let mut stale = false;
        if state.readings_seen > 0 {
            let delta = reading.timestamp - state.last_timestamp;
            // Only an exact zero is stale; sub-millisecond gaps still yield a rate
            let dt = match delta.num_nanoseconds() {
                Some(0) => None,
                Some(ns) => Some(ns as f64 / 1e9),
                None => Some(delta.num_milliseconds() as f64 / 1e3),
            };
            match dt {
                Some(dt) => {
                    state.pressure_rate = (reading.pressure - state.last_pressure) / dt;
                    state.flow_rate = (reading.flow - state.last_flow) / dt;
                }
                None => {
                    stale = true;
                    debug!(location = %reading.location, "Zero Δt, carrying previous rate of change");
                }
            }
        }

        state.pressure_ma.push(reading.timestamp, reading.pressure);
        state.flow_ma.push(reading.timestamp, reading.flow);
        state.pressure_sd.push(reading.timestamp, reading.pressure);
        state.flow_sd.push(reading.timestamp, reading.flow);
        state.last_timestamp = reading.timestamp;
        state.last_pressure = reading.pressure;
        state.last_flow = reading.flow;
        state.readings_seen = state.readings_seen.saturating_add(1);

        if state.readings_seen < config.warmup_readings {
            return Ok(None);
        }

        let mut values = [0.0; FEATURE_COUNT];
        values[Feature::Pressure.index()] = reading.pressure;
        values[Feature::Flow.index()] = reading.flow;
        values[Feature::PressureRateOfChange.index()] = state.pressure_rate;
        values[Feature::FlowRateOfChange.index()] = state.flow_rate;
        values[Feature::PressureMa30s.index()] = state.pressure_ma.mean();
        values[Feature::FlowMa30s.index()] = state.flow_ma.mean();
        values[Feature::PressureStddev60s.index()] = state.pressure_sd.std_dev();
        values[Feature::FlowStddev60s.index()] = state.flow_sd.std_dev();
        values[Feature::PressureFlowRatio.index()] = reading.pressure / reading.flow.max(config.flow_epsilon);
        values[Feature::HourOfDay.index()] = f64::from(reading.timestamp.hour());
        values[Feature::IsWeekend.index()] =
            if matches!(reading.timestamp.weekday(), Weekday::Sat | Weekday::Sun) { 1.0 } else { 0.0 };

        Ok(Some(FeatureVector::new(values).with_stale(stale)))
    }

    /// Clear all per-location history.
    pub fn reset(&mut self) {
        self.locations.clear();
    }

    /// Clear one location's history. Returns whether the location was known.
    pub fn reset_location(&mut self, location: &str) -> bool {
        self.locations.remove(location).is_some()
    }

    /// Number of locations with live state.
    pub fn location_count(&self) -> usize {
        self.locations.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
