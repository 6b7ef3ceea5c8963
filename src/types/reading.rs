//! Sensor reading types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Valve position as reported by the field device.
///
/// Informational only; the engine's own valve state machine is authoritative.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FieldValvePosition {
    Open,
    Closed,
    #[default]
    Unknown,
}

/// Ground-truth label attached to a reading in training or calibration data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Normal,
    Anomaly,
}

impl Label {
    pub fn is_anomaly(self) -> bool {
        self == Self::Anomaly
    }
}

/// One observation from a monitored location.
///
/// Streaming inputs carry one JSON object per line:
///
/// ```json
/// {"location":"main-3","timestamp":"2026-03-02T10:15:00Z","pressure":60.2,"flow":40.1,"temperature":12.5,"conductivity":480.0,"valveState":"open"}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    /// Monitored location (one valve per location)
    pub location: String,
    pub timestamp: DateTime<Utc>,
    /// Line pressure (PSI)
    pub pressure: f64,
    /// Flow rate (L/min)
    pub flow: f64,
    /// Fluid temperature (°C)
    #[serde(default)]
    pub temperature: f64,
    /// Conductivity (µS/cm)
    #[serde(default)]
    pub conductivity: f64,
    #[serde(default)]
    pub valve_state: FieldValvePosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<Label>,
}

impl SensorReading {
    pub fn new(location: impl Into<String>, timestamp: DateTime<Utc>, pressure: f64, flow: f64) -> Self {
        Self {
            location: location.into(),
            timestamp,
            pressure,
            flow,
            temperature: 0.0,
            conductivity: 0.0,
            valve_state: FieldValvePosition::Unknown,
            label: None,
        }
    }

    pub fn with_label(mut self, label: Label) -> Self {
        self.label = Some(label);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_reading_parses() {
        let line = r#"{"location":"main-3","timestamp":"2026-03-02T10:15:00Z","pressure":60.2,"flow":40.1}"#;
        let reading: SensorReading = serde_json::from_str(line).unwrap();
        assert_eq!(reading.location, "main-3");
        assert_eq!(reading.valve_state, FieldValvePosition::Unknown);
        assert!(reading.label.is_none());
    }

    #[test]
    fn test_labeled_reading_parses() {
        let line = r#"{"location":"a","timestamp":"2026-03-02T10:15:00Z","pressure":5.0,"flow":80.0,"valveState":"open","label":"anomaly"}"#;
        let reading: SensorReading = serde_json::from_str(line).unwrap();
        assert_eq!(reading.valve_state, FieldValvePosition::Open);
        assert!(reading.label.is_some_and(Label::is_anomaly));
    }
}
