//! End-to-End Detection Tests
//!
//! Streams synthetic readings for one location through the full engine:
//! rule-only warm-up, model training on the collected feature vectors,
//! steady-state monitoring, then a burst that must close the valve.

use chrono::{DateTime, Duration, TimeZone, Utc};
use leakwatch::config::EngineConfig;
use leakwatch::detector::AnomalyDetector;
use leakwatch::pipeline::DetectionEngine;
use leakwatch::types::{DecisionRecord, SensorReading, Severity, ValveAction};
use leakwatch::valve::{CommandKind, SimulatedActuator, ValveState};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::sync::Arc;

const LOCATION: &str = "main-3";
const TRAINING_VECTORS: usize = 500;

/// Seeded 1 Hz reading generator around 60 PSI / 40 L/min.
struct Feed {
    rng: StdRng,
    pressure: Normal<f64>,
    flow: Normal<f64>,
    t: DateTime<Utc>,
}

impl Feed {
    fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            pressure: Normal::new(60.0, 2.0).unwrap(),
            flow: Normal::new(40.0, 1.0).unwrap(),
            t: Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
        }
    }

    fn next_normal(&mut self) -> SensorReading {
        self.t += Duration::seconds(1);
        let p = self.pressure.sample(&mut self.rng);
        let f = self.flow.sample(&mut self.rng);
        SensorReading::new(LOCATION, self.t, p, f)
    }

    /// Line rupture: pressure collapses to 5 PSI, flow surges to ~80 L/min.
    fn next_burst(&mut self) -> SensorReading {
        self.t += Duration::seconds(1);
        let surge = Normal::new(80.0, 1.0).unwrap().sample(&mut self.rng);
        SensorReading::new(LOCATION, self.t, 5.0, surge)
    }
}

/// Engine with a model trained on the first 500 feature vectors of the feed.
fn trained_engine(feed: &mut Feed, actuator: &SimulatedActuator) -> DetectionEngine {
    let config = EngineConfig::default();
    let detector = Arc::new(AnomalyDetector::new(config.forest.clone(), config.detector.clone()));
    let mut engine =
        DetectionEngine::new(&config, Arc::clone(&detector), Box::new(actuator.clone())).with_bootstrap(TRAINING_VECTORS);

    let batch = loop {
        let record = engine.process_reading(&feed.next_normal()).unwrap();
        assert_eq!(record.ml_score, 0.0, "no model yet, ML score must be absent");
        if let Some(batch) = engine.take_bootstrap_batch() {
            break batch;
        }
    };
    assert_eq!(batch.len(), TRAINING_VECTORS);
    detector.train(&batch).unwrap();
    assert!(detector.is_trained());
    engine
}

#[test]
fn normal_operation_rarely_flags() {
    let actuator = SimulatedActuator::new();
    let mut feed = Feed::new(7);
    let mut engine = trained_engine(&mut feed, &actuator);

    let records: Vec<DecisionRecord> = (0..100)
        .map(|_| engine.process_reading(&feed.next_normal()).unwrap())
        .collect();

    let ml_flagged = records.iter().filter(|r| r.ml_score > 50.0).count();
    let detected = records.iter().filter(|r| r.detected).count();
    assert!(ml_flagged < 5, "{ml_flagged} of 100 normal readings flagged by the model");
    assert!(detected < 5, "{detected} of 100 normal readings detected as leaks");
    assert!(records.iter().all(|r| r.severity < Severity::Critical));
    assert!(records.iter().all(|r| r.valve_action == ValveAction::None));
    assert_eq!(engine.valve_state(LOCATION), Some(ValveState::Open));
    assert!(actuator.commands().is_empty());
}

#[test]
fn burst_is_critical_and_closes_after_dwell() {
    let actuator = SimulatedActuator::new();
    let mut feed = Feed::new(11);
    let mut engine = trained_engine(&mut feed, &actuator);
    for _ in 0..30 {
        engine.process_reading(&feed.next_normal()).unwrap();
    }

    let first = engine.process_reading(&feed.next_burst()).unwrap();
    assert_eq!(first.severity, Severity::Critical, "burst record: {first:?}");
    assert!(first.detected);
    assert!(first.ml_score > 50.0, "model should see the burst, got {}", first.ml_score);
    assert_eq!(first.valve_action, ValveAction::None, "one critical is not enough");
    assert_eq!(engine.valve_state(LOCATION), Some(ValveState::Open));

    let second = engine.process_reading(&feed.next_burst()).unwrap();
    assert_eq!(second.severity, Severity::Critical, "burst record: {second:?}");
    assert_eq!(second.valve_action, ValveAction::CloseCommanded);
    assert_eq!(engine.valve_state(LOCATION), Some(ValveState::Closing));

    let commands = actuator.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].kind, CommandKind::Close);
    assert_eq!(commands[0].location, LOCATION);

    let closed = engine.confirm_closed(LOCATION, second.timestamp + Duration::seconds(2)).unwrap();
    assert_eq!(closed.valve_action, ValveAction::Closed);
    assert_eq!(engine.valve_state(LOCATION), Some(ValveState::Closed));
}

#[test]
fn rule_only_mode_still_protects_the_line() {
    let actuator = SimulatedActuator::new();
    let config = EngineConfig::default();
    let detector = Arc::new(AnomalyDetector::new(config.forest.clone(), config.detector.clone()));
    let mut engine = DetectionEngine::new(&config, detector, Box::new(actuator.clone()));
    let mut feed = Feed::new(3);

    for _ in 0..20 {
        let r = engine.process_reading(&feed.next_normal()).unwrap();
        assert_eq!(r.ml_score, 0.0);
    }
    let first = engine.process_reading(&feed.next_burst()).unwrap();
    let second = engine.process_reading(&feed.next_burst()).unwrap();
    assert_eq!(first.severity, Severity::Critical);
    // Rule-only leak probability is the rule score itself
    assert_eq!(first.leak_probability, first.rule_score);
    assert_eq!(second.valve_action, ValveAction::CloseCommanded);
}
