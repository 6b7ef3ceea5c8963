//! Model Persistence Tests
//!
//! A model saved by one detector must load into a fresh detector (as after a
//! restart) and score identically. Tampered or mismatched documents must be
//! rejected without disturbing the model already in memory.

use chrono::{Duration, TimeZone, Utc};
use leakwatch::config::EngineConfig;
use leakwatch::detector::{AnomalyDetector, DetectorError, PersistenceError, TrainingSample};
use leakwatch::features::{FeaturePreprocessor, FeatureVector};
use leakwatch::types::SensorReading;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::path::Path;
use std::sync::Arc;

fn vectors(n: usize, seed: u64) -> Vec<FeatureVector> {
    let config = EngineConfig::default();
    let mut pre = FeaturePreprocessor::new(config.preprocessor);
    let mut rng = StdRng::seed_from_u64(seed);
    let pressure = Normal::new(60.0, 2.0).unwrap();
    let flow = Normal::new(40.0, 1.0).unwrap();
    let t0 = Utc.with_ymd_and_hms(2026, 3, 7, 22, 0, 0).unwrap();
    let mut out = Vec::with_capacity(n);
    let mut i = 0;
    while out.len() < n {
        let reading = SensorReading::new(
            "segment-7",
            t0 + Duration::seconds(i),
            pressure.sample(&mut rng),
            flow.sample(&mut rng),
        );
        if let Some(v) = pre.process_reading(&reading).unwrap() {
            out.push(v);
        }
        i += 1;
    }
    out
}

fn detector() -> AnomalyDetector {
    let config = EngineConfig::default();
    AnomalyDetector::new(config.forest, config.detector)
}

fn trained(seed: u64) -> AnomalyDetector {
    let d = detector();
    let samples: Vec<TrainingSample> = vectors(400, seed).into_iter().map(TrainingSample::from).collect();
    d.train_with_seed(&samples, seed).unwrap();
    d
}

fn edit_document(path: &Path, edit: impl FnOnce(&mut serde_json::Value)) {
    let raw = std::fs::read_to_string(path).unwrap();
    let mut doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
    edit(&mut doc);
    std::fs::write(path, serde_json::to_string(&doc).unwrap()).unwrap();
}

#[test]
fn fresh_detector_scores_identically_after_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    let original = trained(21);
    original.save_model(&path).unwrap();

    let restarted = detector();
    restarted.load_model(&path).unwrap();

    let inputs = vectors(50, 99);
    for v in &inputs {
        assert_eq!(original.predict(v).unwrap(), restarted.predict(v).unwrap());
    }

    let a = original.get_model_info();
    let b = restarted.get_model_info();
    assert_eq!(a.feature_means, b.feature_means);
    assert_eq!(a.feature_std_devs, b.feature_std_devs);
    assert_eq!(a.score_calibration, b.score_calibration);
    assert_eq!(b.tree_count, 100);
    assert_eq!(b.seed, Some(21));
}

#[test]
fn document_uses_the_published_field_names() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    trained(22).save_model(&path).unwrap();

    let doc: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    for key in [
        "schemaVersion",
        "treeCount",
        "trees",
        "featureOrder",
        "featureMeans",
        "featureStdDevs",
        "isTrained",
        "metadata",
    ] {
        assert!(doc.get(key).is_some(), "missing top-level key {key}");
    }
    let metadata = &doc["metadata"];
    for key in ["createdAt", "seed", "subsampleSize", "trainingSamples", "trainingTimeMs", "scoreCalibration", "checksum"] {
        assert!(metadata.get(key).is_some(), "missing metadata key {key}");
    }
    assert_eq!(doc["featureOrder"][0], "pressure");
    assert_eq!(doc["featureOrder"][10], "is_weekend");
}

#[test]
fn tampered_trees_fail_the_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    trained(23).save_model(&path).unwrap();
    edit_document(&path, |doc| {
        let trees = doc["trees"].as_array_mut().unwrap();
        trees.pop();
        doc["treeCount"] = serde_json::json!(trees.len());
    });

    let d = detector();
    let err = d.load_model(&path).unwrap_err();
    assert!(
        matches!(err, DetectorError::Persistence(PersistenceError::Checksum { .. })),
        "unexpected error: {err}"
    );
    assert!(!d.is_trained());
}

#[test]
fn mismatched_feature_order_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    trained(24).save_model(&path).unwrap();
    edit_document(&path, |doc| {
        let order = doc["featureOrder"].as_array_mut().unwrap();
        order.swap(0, 1);
    });

    let d = detector();
    let err = d.load_model(&path).unwrap_err();
    assert!(matches!(err, DetectorError::Persistence(PersistenceError::FeatureOrder { .. })));
}

#[test]
fn future_schema_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    trained(25).save_model(&path).unwrap();
    edit_document(&path, |doc| doc["schemaVersion"] = serde_json::json!(99));

    let d = detector();
    let err = d.load_model(&path).unwrap_err();
    assert!(matches!(
        err,
        DetectorError::Persistence(PersistenceError::SchemaVersion { found: 99, .. })
    ));
}

#[test]
fn failed_load_keeps_the_running_model() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.json");
    let bad = dir.path().join("bad.json");
    let running = Arc::new(trained(26));
    running.save_model(&good).unwrap();
    std::fs::copy(&good, &bad).unwrap();
    edit_document(&bad, |doc| doc["metadata"]["checksum"] = serde_json::json!("0000"));

    let before = running.snapshot().unwrap();
    assert!(running.load_model(&bad).is_err());
    assert!(Arc::ptr_eq(&before, &running.snapshot().unwrap()));
    assert!(running.load_model(Path::new("/nonexistent/leakwatch/model.json")).is_err());
    assert!(Arc::ptr_eq(&before, &running.snapshot().unwrap()));
}

#[test]
fn save_without_model_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    let err = detector().save_model(&path).unwrap_err();
    assert!(matches!(err, DetectorError::ModelNotTrained));
    assert!(!path.exists());
}
