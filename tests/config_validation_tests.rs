//! Config Validation Tests
//!
//! Exercises TOML loading, typo detection and range validation through the
//! public API, and checks that loaded settings reach the engine.

use chrono::{Duration, TimeZone, Utc};
use leakwatch::config::validation::{validate_operating_ranges, validate_unknown_keys};
use leakwatch::config::{ConfigError, EngineConfig};
use leakwatch::detector::AnomalyDetector;
use leakwatch::pipeline::DetectionEngine;
use leakwatch::types::{SensorReading, ValveAction};
use leakwatch::valve::SimulatedActuator;
use std::sync::Arc;

const SITE_TOML: &str = r#"
[site]
name = "Riverside District"
operator = "Water Utility"

[valve]
dwell_decisions = 3
confirmation_timeout_ms = 8000

[fusion.locations.high-zone]
nominal_pressure_psi = 120.0
nominal_flow_lpm = 40.0
deviation_threshold_pct = 10.0
"#;

#[test]
fn site_file_loads_and_validates() {
    let config = EngineConfig::from_toml_str(SITE_TOML).unwrap();
    assert_eq!(config.site.name, "Riverside District");
    assert_eq!(config.valve.dwell_decisions, 3);
    // Unspecified sections keep their defaults
    assert_eq!(config.forest.n_trees, 100);
    assert!(config.validate().is_ok());
    assert!(validate_unknown_keys(SITE_TOML).is_empty());
    assert!(validate_operating_ranges(&config).is_empty());
}

#[test]
fn typo_warns_but_loads() {
    let toml_str = "[valve]\ndwell_decisons = 4\n";
    let warnings = validate_unknown_keys(toml_str);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].suggestion.as_deref(), Some("valve.dwell_decisions"));
    assert!(warnings[0].to_string().contains("did you mean"));

    let config = EngineConfig::from_toml_str(toml_str).unwrap();
    assert_eq!(config.valve.dwell_decisions, 2);
}

#[test]
fn invalid_values_are_all_reported() {
    let toml_str = r#"
[fusion]
ml_weight = 0.9
rule_weight = 0.4

[valve]
dwell_decisions = 0
"#;
    match EngineConfig::from_toml_str(toml_str) {
        Err(ConfigError::Validation(errors)) => {
            assert!(errors.len() >= 2, "expected every violation, got {errors:?}");
            assert!(errors.iter().any(|e| e.contains("fusion weights")));
            assert!(errors.iter().any(|e| e.contains("dwell_decisions")));
        }
        other => panic!("expected validation errors, got {other:?}"),
    }

    // Deserializing alone succeeds; validate() reports the same problems
    let parsed: EngineConfig = toml::from_str(toml_str).unwrap();
    assert!(matches!(parsed.validate(), Err(ConfigError::Validation(e)) if e.len() >= 2));
}

#[test]
fn file_roundtrip_preserves_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leakwatch.toml");
    let config = EngineConfig::from_toml_str(SITE_TOML).unwrap();
    config.save_to_file(&path).unwrap();
    let loaded = EngineConfig::load_from_file(&path).unwrap();
    assert_eq!(loaded.fusion.baseline_for("high-zone").nominal_pressure_psi, 120.0);
    assert_eq!(loaded.valve.confirmation_timeout_ms, 8000);
}

#[test]
fn engine_honours_loaded_dwell_and_location_baseline() {
    let config = EngineConfig::from_toml_str(SITE_TOML).unwrap();
    let detector = Arc::new(AnomalyDetector::new(config.forest.clone(), config.detector.clone()));
    let actuator = SimulatedActuator::new();
    let mut engine = DetectionEngine::new(&config, detector, Box::new(actuator.clone()));
    let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();

    // 120 PSI is nominal for high-zone
    let r = engine
        .process_reading(&SensorReading::new("high-zone", t0, 120.0, 40.0))
        .unwrap();
    assert_eq!(r.rule_score, 0.0);

    // Three criticals are needed with dwell_decisions = 3
    let actions: Vec<ValveAction> = (1..=3)
        .map(|s| {
            engine
                .process_reading(&SensorReading::new("high-zone", t0 + Duration::seconds(s), 5.0, 40.0))
                .unwrap()
                .valve_action
        })
        .collect();
    assert_eq!(actions, vec![ValveAction::None, ValveAction::None, ValveAction::CloseCommanded]);
}
