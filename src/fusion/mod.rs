//! Detection Fusion - ML anomaly score + rule score → leak decision
//!
//! ## Architecture
//!
//! - Rule score: percentage deviation of pressure or flow from the location's
//!   nominal operating point, once it exceeds the location threshold
//! - Leak probability: weighted sum of ML and rule scores, clipped to [0, 100]
//! - Severity: fixed bands over the leak probability (see `Severity`)
//! - Confidence: high when both scores vote the same way and sit close
//!   together; cut back on disagreement and on wide divergence
//!
//! Without a trained model the engine fuses on the rule score alone.

use tracing::debug;

use crate::config::defaults::{DISAGREEMENT_PENALTY, VOTE_THRESHOLD};
use crate::config::{FusionConfig, LocationBaseline};
use crate::types::{DetectionDecision, SensorReading, Severity};

#[derive(Debug, Clone)]
pub struct FusionEngine {
    config: FusionConfig,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn baseline_for(&self, location: &str) -> &LocationBaseline {
        self.config.baseline_for(location)
    }

    /// Override the detection threshold, e.g. from a calibration sweep.
    pub fn set_detection_threshold(&mut self, threshold: f64) {
        let threshold = threshold.clamp(0.0, 100.0);
        debug!(previous = self.config.detection_threshold, threshold, "Detection threshold updated");
        self.config.detection_threshold = threshold;
    }

    /// Largest percentage deviation of pressure/flow from nominal, if it
    /// exceeds the location threshold; 0 otherwise.
    pub fn rule_score(&self, reading: &SensorReading) -> f64 {
        let baseline = self.baseline_for(&reading.location);
        let pressure_dev = percent_deviation(reading.pressure, baseline.nominal_pressure_psi);
        let flow_dev = percent_deviation(reading.flow, baseline.nominal_flow_lpm);
        let deviation = pressure_dev.max(flow_dev);
        if deviation > baseline.deviation_threshold_pct {
            deviation.clamp(0.0, 100.0)
        } else {
            0.0
        }
    }

    /// Fuse a reading. `ml_score` is `None` when no model is available.
    pub fn fuse(&self, reading: &SensorReading, ml_score: Option<f64>) -> DetectionDecision {
        let rule = self.rule_score(reading);
        match ml_score {
            Some(ml) => self.combine(ml, rule),
            None => self.rule_only(rule),
        }
    }

    /// Weighted combination of two scores already on the [0, 100] scale.
    pub fn combine(&self, ml_score: f64, rule_score: f64) -> DetectionDecision {
        let ml = ml_score.clamp(0.0, 100.0);
        let rule = rule_score.clamp(0.0, 100.0);
        let leak_probability = (self.config.ml_weight * ml + self.config.rule_weight * rule).clamp(0.0, 100.0);
        DetectionDecision {
            leak_probability,
            severity: Severity::from_probability(leak_probability),
            rule_score: rule,
            ml_score: ml,
            confidence: self.confidence(ml, rule),
            detected: leak_probability > self.config.detection_threshold,
        }
    }

    fn rule_only(&self, rule: f64) -> DetectionDecision {
        DetectionDecision {
            leak_probability: rule,
            severity: Severity::from_probability(rule),
            rule_score: rule,
            ml_score: 0.0,
            // Single uncorroborated source
            confidence: 100.0 * DISAGREEMENT_PENALTY,
            detected: rule > self.config.detection_threshold,
        }
    }

    fn confidence(&self, ml: f64, rule: f64) -> f64 {
        let divergence = (ml - rule).abs();
        let mut confidence = 100.0 - divergence / 2.0;
        if (ml >= VOTE_THRESHOLD) != (rule >= VOTE_THRESHOLD) {
            confidence *= DISAGREEMENT_PENALTY;
        }
        if divergence > self.config.agreement_spread {
            confidence *= self.config.agreement_spread / divergence;
        }
        confidence.clamp(0.0, 100.0)
    }
}

fn percent_deviation(value: f64, nominal: f64) -> f64 {
    if nominal <= 0.0 {
        return 0.0;
    }
    (value - nominal).abs() / nominal * 100.0
}

// ============================================================================
// Tests
// ============================================================================
