//! Detection Engine - per-reading wiring of preprocessor, detector, fusion and valves
//!
//! ## Per-Reading Flow
//!
//! ```text
//! SensorReading
//!   → FeaturePreprocessor (per-location windows; None during warm-up)
//!   → AnomalyDetector      (ML score, skipped without a trained model)
//!   → FusionEngine         (rule score + ML score → DetectionDecision)
//!   → ValveController      (Tick, then Decision, for the reading's location)
//!   → DecisionRecord
//! ```
//!
//! Every valid reading yields exactly one record. Valve activity that happens
//! between readings (idle ticks, confirmations, manual resets) yields a record
//! carrying the location's most recent decision.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ValveConfig};
use crate::detector::{AnomalyDetector, DetectorError, TrainingSample};
use crate::features::{FeatureError, FeaturePreprocessor, FeatureVector};
use crate::fusion::FusionEngine;
use crate::types::{DecisionRecord, DetectionDecision, SensorReading, Severity};
use crate::valve::{Actuator, ValveController, ValveError, ValveEvent, ValveState, ValveTransition};

/// Per-location valve and decision state.
#[derive(Debug)]
struct LocationChannel {
    valve: ValveController,
    last_decision: DetectionDecision,
    rule_only_warned: bool,
}

impl LocationChannel {
    fn new(location: &str, config: &ValveConfig) -> Self {
        Self {
            valve: ValveController::new(location, config.clone()),
            last_decision: quiet_decision(),
            rule_only_warned: false,
        }
    }
}

/// Feature vectors gathered for training a first model in place.
#[derive(Debug)]
struct Bootstrap {
    target: usize,
    samples: Vec<TrainingSample>,
}

pub struct DetectionEngine {
    preprocessor: FeaturePreprocessor,
    detector: Arc<AnomalyDetector>,
    fusion: FusionEngine,
    valve_config: ValveConfig,
    channels: HashMap<String, LocationChannel>,
    actuator: Box<dyn Actuator>,
    bootstrap: Option<Bootstrap>,
}

impl std::fmt::Debug for DetectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionEngine")
            .field("detector", &self.detector)
            .field("locations", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl DetectionEngine {
    pub fn new(config: &EngineConfig, detector: Arc<AnomalyDetector>, actuator: Box<dyn Actuator>) -> Self {
        Self {
            preprocessor: FeaturePreprocessor::new(config.preprocessor.clone()),
            detector,
            fusion: FusionEngine::new(config.fusion.clone()),
            valve_config: config.valve.clone(),
            channels: HashMap::new(),
            actuator,
            bootstrap: None,
        }
    }

    /// Collect the first `target` feature vectors while no model is loaded.
    /// A target of zero disables collection.
    pub fn with_bootstrap(mut self, target: usize) -> Self {
        self.bootstrap = (target > 0).then(|| Bootstrap {
            target,
            samples: Vec::with_capacity(target),
        });
        self
    }

    pub fn detector(&self) -> &Arc<AnomalyDetector> {
        &self.detector
    }

    pub fn fusion(&self) -> &FusionEngine {
        &self.fusion
    }

    pub fn set_detection_threshold(&mut self, threshold: f64) {
        self.fusion.set_detection_threshold(threshold);
    }

    /// Process one reading to a decision record.
    ///
    /// Rejected readings (out of order, non-finite) leave all state untouched.
    pub fn process_reading(&mut self, reading: &SensorReading) -> Result<DecisionRecord, FeatureError> {
        let features = self.preprocessor.process_reading(reading)?;
        let ml_score = match features {
            Some(vector) => {
                self.collect_bootstrap(&vector, reading);
                self.ml_score(&vector, &reading.location)
            }
            None => None,
        };

        let decision = self.fusion.fuse(reading, ml_score);
        let at = reading.timestamp;
        let config = &self.valve_config;
        let channel = self
            .channels
            .entry(reading.location.clone())
            .or_insert_with(|| LocationChannel::new(&reading.location, config));
        channel.last_decision = decision;

        // Timeouts are checked before the new decision is applied
        let timed_out = channel.valve.handle(ValveEvent::Tick { at }, self.actuator.as_mut());
        let decided = channel.valve.handle(
            ValveEvent::Decision {
                severity: decision.severity,
                at,
            },
            self.actuator.as_mut(),
        );
        let action = decided.or(timed_out).map(|t| t.action).unwrap_or_default();

        if decision.detected {
            debug!(
                location = %reading.location,
                leak_probability = decision.leak_probability,
                severity = %decision.severity,
                confidence = decision.confidence,
                "Leak threshold exceeded"
            );
        }

        Ok(DecisionRecord::new(&reading.location, at, &decision, action))
    }

    /// Advance every valve's clock. Returns records for valves that faulted.
    pub fn tick(&mut self, at: DateTime<Utc>) -> Vec<DecisionRecord> {
        self.locations()
            .into_iter()
            .filter_map(|location| self.apply(&location, ValveEvent::Tick { at }))
            .collect()
    }

    /// The actuator at `location` reports the valve fully closed.
    pub fn confirm_closed(&mut self, location: &str, at: DateTime<Utc>) -> Option<DecisionRecord> {
        self.apply(location, ValveEvent::ActuatorConfirmed { at })
    }

    /// The actuator at `location` reports a failure.
    pub fn report_actuator_error(
        &mut self,
        location: &str,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Option<DecisionRecord> {
        self.apply(
            location,
            ValveEvent::ActuatorError {
                message: message.into(),
                at,
            },
        )
    }

    /// Operator reset of a CLOSED or FAULT valve back to OPEN.
    pub fn manual_reset(&mut self, location: &str, at: DateTime<Utc>) -> Option<DecisionRecord> {
        let record = self.apply(location, ValveEvent::ManualReset { at });
        if record.is_some() {
            info!(location, "Valve reset by operator");
        }
        record
    }

    pub fn valve_state(&self, location: &str) -> Option<ValveState> {
        self.channels.get(location).map(|c| c.valve.state())
    }

    pub fn valve_fault(&self, location: &str) -> Option<&ValveError> {
        self.channels.get(location).and_then(|c| c.valve.last_fault())
    }

    /// Monitored locations, sorted.
    pub fn locations(&self) -> Vec<String> {
        let mut locations: Vec<String> = self.channels.keys().cloned().collect();
        locations.sort();
        locations
    }

    /// Hand over the bootstrap batch once it is full.
    pub fn take_bootstrap_batch(&mut self) -> Option<Vec<TrainingSample>> {
        let bootstrap = self.bootstrap.as_mut()?;
        if bootstrap.samples.len() < bootstrap.target {
            return None;
        }
        Some(std::mem::replace(&mut bootstrap.samples, Vec::with_capacity(bootstrap.target)))
    }

    /// Samples gathered toward the bootstrap target.
    pub fn bootstrap_progress(&self) -> Option<(usize, usize)> {
        self.bootstrap.as_ref().map(|b| (b.samples.len(), b.target))
    }

    fn apply(&mut self, location: &str, event: ValveEvent) -> Option<DecisionRecord> {
        let channel = self.channels.get_mut(location)?;
        let transition: ValveTransition = channel.valve.handle(event, self.actuator.as_mut())?;
        Some(DecisionRecord::new(
            location,
            transition.at,
            &channel.last_decision,
            transition.action,
        ))
    }

    fn collect_bootstrap(&mut self, vector: &FeatureVector, reading: &SensorReading) {
        let Some(bootstrap) = self.bootstrap.as_mut() else {
            return;
        };
        if self.detector.is_trained() || self.detector.is_training() || bootstrap.samples.len() >= bootstrap.target {
            return;
        }
        bootstrap.samples.push(TrainingSample {
            features: *vector,
            label: reading.label,
        });
        if bootstrap.samples.len() == bootstrap.target {
            info!(samples = bootstrap.target, "Bootstrap training set complete");
        }
    }

    fn ml_score(&mut self, vector: &FeatureVector, location: &str) -> Option<f64> {
        match self.detector.predict(vector) {
            Ok(prediction) => Some(prediction.anomaly_score),
            Err(DetectorError::ModelNotTrained) => {
                if let Some(channel) = self.channels.get_mut(location) {
                    if !channel.rule_only_warned {
                        channel.rule_only_warned = true;
                        warn!(location, "No trained model, fusing on rule score alone");
                    }
                }
                None
            }
            Err(e) => {
                warn!(location, error = %e, "ML scoring failed, fusing on rule score alone");
                None
            }
        }
    }
}

fn quiet_decision() -> DetectionDecision {
    DetectionDecision {
        leak_probability: 0.0,
        severity: Severity::None,
        rule_score: 0.0,
        ml_score: 0.0,
        confidence: 0.0,
        detected: false,
    }
}

// ============================================================================
// Tests
// ============================================================================
