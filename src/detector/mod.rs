//! Anomaly Detector - Training, inference, evaluation and persistence
//!
//! Owns the trained isolation forest snapshot together with its
//! standardization statistics and score calibration.
//!
//! ## Architecture
//!
//! - The trained model is an `Arc` snapshot behind `ArcSwapOption`. Training
//!   builds a new forest off to the side and swaps it in with a single store,
//!   so readers never observe a partially-built model.
//! - An `AtomicBool` gate rejects a second `train` while one is running.
//! - Prediction is lock-free and may run from any number of threads.
//!
//! ## Usage
//!
//! ```ignore
//! let detector = AnomalyDetector::new(config.forest.clone(), config.detector.clone());
//! detector.train(&samples)?;
//! let prediction = detector.predict(&vector)?;
//! if prediction.is_anomaly { /* ... */ }
//! detector.save_model(Path::new("data/model.json"))?;
//! ```

mod metrics;
mod persistence;

pub use metrics::{ConfusionMatrix, ModelMetrics};
pub use persistence::{load_document, save_document, ModelDocument, ModelMetadata, PersistenceError};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{DetectorConfig, ForestConfig};
use crate::features::{FeatureError, FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
use crate::forest::{ForestModel, ScoreCalibration};
use crate::types::Label;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("model has not been trained or loaded")]
    ModelNotTrained,

    #[error("invalid feature vector: {0}")]
    InvalidFeature(#[from] FeatureError),

    #[error("unusable training data: {0}")]
    TrainingData(String),

    #[error("training already in progress")]
    TrainingInProgress,

    #[error("{labels} labels supplied for {samples} samples")]
    LabelMismatch { samples: usize, labels: usize },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

// ============================================================================
// Data Types
// ============================================================================

/// Feature vector with an optional ground-truth label.
///
/// Labels feed evaluation only; they never influence tree construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingSample {
    pub features: FeatureVector,
    pub label: Option<Label>,
}

impl From<FeatureVector> for TrainingSample {
    fn from(features: FeatureVector) -> Self {
        Self { features, label: None }
    }
}

/// Provenance of a trained model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingMetadata {
    pub created_at: DateTime<Utc>,
    pub seed: u64,
    pub training_samples: usize,
    pub training_time_ms: u64,
}

/// Immutable trained model snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedModel {
    pub model: ForestModel,
    pub metadata: TrainingMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingReport {
    pub training_time_ms: u64,
    pub tree_count: usize,
    pub features: Vec<String>,
    pub sample_count: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyPrediction {
    /// Calibrated anomaly score, [0, 100]
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    /// Distance from the cutoff, scaled to [0, 100]
    pub confidence: f64,
    /// Mean isolation depth across the ensemble
    pub path_length: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPrediction {
    pub predictions: Vec<AnomalyPrediction>,
    /// Present only when labels were supplied
    pub confusion: Option<ConfusionMatrix>,
}

/// Read-only summary of the current model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub is_trained: bool,
    pub tree_count: usize,
    pub subsample_size: usize,
    pub anomaly_cutoff: f64,
    pub feature_means: BTreeMap<String, f64>,
    pub feature_std_devs: BTreeMap<String, f64>,
    pub score_calibration: Option<ScoreCalibration>,
    pub created_at: Option<DateTime<Utc>>,
    pub seed: Option<u64>,
    pub training_samples: usize,
    pub training_time_ms: u64,
}

// ============================================================================
// Training Gate
// ============================================================================

/// Holds the training flag for the duration of one `train` call.
struct TrainingGate<'a>(&'a AtomicBool);

impl<'a> TrainingGate<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TrainingGate<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Detector
// ============================================================================

pub struct AnomalyDetector {
    forest_config: ForestConfig,
    detector_config: DetectorConfig,
    model: ArcSwapOption<TrainedModel>,
    evaluation: ArcSwapOption<ModelMetrics>,
    training: AtomicBool,
}

impl std::fmt::Debug for AnomalyDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyDetector")
            .field("is_trained", &self.is_trained())
            .field("training", &self.training.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AnomalyDetector {
    pub fn new(forest_config: ForestConfig, detector_config: DetectorConfig) -> Self {
        Self {
            forest_config,
            detector_config,
            model: ArcSwapOption::empty(),
            evaluation: ArcSwapOption::empty(),
            training: AtomicBool::new(false),
        }
    }

    pub fn is_trained(&self) -> bool {
        self.model.load().is_some()
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Acquire)
    }

    /// Current snapshot, if any.
    pub fn snapshot(&self) -> Option<Arc<TrainedModel>> {
        self.model.load_full()
    }

    /// Train with the configured seed.
    pub fn train(&self, samples: &[TrainingSample]) -> Result<TrainingReport, DetectorError> {
        self.train_with_seed(samples, self.forest_config.seed)
    }

    /// Train a new forest and swap it in. On any error the previous model stays.
    pub fn train_with_seed(&self, samples: &[TrainingSample], seed: u64) -> Result<TrainingReport, DetectorError> {
        let _gate = TrainingGate::acquire(&self.training).ok_or(DetectorError::TrainingInProgress)?;

        let vectors: Vec<FeatureVector> = samples.iter().map(|s| s.features).collect();
        check_training_data(&vectors)?;

        let started = Instant::now();
        let model = ForestModel::train(&vectors, &self.forest_config, seed)
            .ok_or_else(|| DetectorError::TrainingData("at least two samples are required".to_string()))?;
        if !model.calibration.is_valid() {
            return Err(DetectorError::TrainingData(
                "training scores produced an unusable calibration".to_string(),
            ));
        }
        let training_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let report = TrainingReport {
            training_time_ms,
            tree_count: model.forest.tree_count(),
            features: FEATURE_NAMES.iter().map(|s| (*s).to_string()).collect(),
            sample_count: vectors.len(),
            seed,
        };
        let trained = TrainedModel {
            metadata: TrainingMetadata {
                created_at: Utc::now(),
                seed,
                training_samples: vectors.len(),
                training_time_ms,
            },
            model,
        };

        info!(
            trees = report.tree_count,
            samples = report.sample_count,
            subsample = trained.model.forest.subsample_size(),
            seed,
            training_time_ms,
            offset = trained.model.calibration.offset,
            spread = trained.model.calibration.spread,
            "Isolation forest trained"
        );
        self.model.store(Some(Arc::new(trained)));
        Ok(report)
    }

    pub fn predict(&self, vector: &FeatureVector) -> Result<AnomalyPrediction, DetectorError> {
        let guard = self.model.load();
        let trained = guard.as_ref().ok_or(DetectorError::ModelNotTrained)?;
        vector.ensure_finite()?;
        Ok(self.score_with(&trained.model, vector))
    }

    /// Predict from a string-keyed map, checking it against the schema first.
    pub fn predict_named(&self, features: &HashMap<String, f64>) -> Result<AnomalyPrediction, DetectorError> {
        let vector = FeatureVector::from_named(features)?;
        self.predict(&vector)
    }

    /// Score many vectors against one snapshot.
    ///
    /// With labels, the confusion matrix is computed and retained for
    /// `calculate_metrics`.
    pub fn predict_batch(
        &self,
        samples: &[FeatureVector],
        labels: Option<&[Label]>,
    ) -> Result<BatchPrediction, DetectorError> {
        if let Some(labels) = labels {
            if labels.len() != samples.len() {
                return Err(DetectorError::LabelMismatch {
                    samples: samples.len(),
                    labels: labels.len(),
                });
            }
        }
        let trained = self.model.load_full().ok_or(DetectorError::ModelNotTrained)?;
        for v in samples {
            v.ensure_finite()?;
        }

        let predictions: Vec<AnomalyPrediction> = samples
            .par_iter()
            .map(|v| self.score_with(&trained.model, v))
            .collect();

        let confusion = labels.map(|labels| {
            let confusion = ConfusionMatrix::tally(predictions.iter().map(|p| p.is_anomaly), labels);
            let metrics = ModelMetrics::from(confusion);
            debug!(
                samples = samples.len(),
                precision = metrics.precision,
                recall = metrics.recall,
                f1 = metrics.f1_score,
                "Labeled batch evaluated"
            );
            self.evaluation.store(Some(Arc::new(metrics)));
            confusion
        });

        Ok(BatchPrediction { predictions, confusion })
    }

    fn score_with(&self, model: &ForestModel, vector: &FeatureVector) -> AnomalyPrediction {
        let cutoff = self.detector_config.anomaly_cutoff;
        let scored = model.score(vector);
        let margin = cutoff.max(100.0 - cutoff);
        AnomalyPrediction {
            anomaly_score: scored.score,
            is_anomaly: scored.score > cutoff,
            confidence: ((scored.score - cutoff).abs() / margin * 100.0).clamp(0.0, 100.0),
            path_length: scored.path_length,
        }
    }

    /// Metrics from the most recent labeled batch.
    pub fn calculate_metrics(&self) -> Option<ModelMetrics> {
        self.evaluation.load_full().map(|m| (*m).clone())
    }

    pub fn get_model_info(&self) -> ModelInfo {
        let snapshot = self.model.load_full();
        let Some(trained) = snapshot.as_deref() else {
            return ModelInfo {
                is_trained: false,
                tree_count: 0,
                subsample_size: 0,
                anomaly_cutoff: self.detector_config.anomaly_cutoff,
                feature_means: BTreeMap::new(),
                feature_std_devs: BTreeMap::new(),
                score_calibration: None,
                created_at: None,
                seed: None,
                training_samples: 0,
                training_time_ms: 0,
            };
        };
        let named = |row: &[f64; FEATURE_COUNT]| -> BTreeMap<String, f64> {
            FEATURE_NAMES.iter().map(|n| (*n).to_string()).zip(row.iter().copied()).collect()
        };
        ModelInfo {
            is_trained: true,
            tree_count: trained.model.forest.tree_count(),
            subsample_size: trained.model.forest.subsample_size(),
            anomaly_cutoff: self.detector_config.anomaly_cutoff,
            feature_means: named(&trained.model.means),
            feature_std_devs: named(&trained.model.std_devs),
            score_calibration: Some(trained.model.calibration),
            created_at: Some(trained.metadata.created_at),
            seed: Some(trained.metadata.seed),
            training_samples: trained.metadata.training_samples,
            training_time_ms: trained.metadata.training_time_ms,
        }
    }

    /// Write the current model atomically.
    pub fn save_model(&self, path: &Path) -> Result<(), DetectorError> {
        let trained = self.model.load_full().ok_or(DetectorError::ModelNotTrained)?;
        let doc = ModelDocument::from_trained(&trained)?;
        save_document(&doc, path)?;
        info!(path = %path.display(), trees = doc.tree_count, "Model saved");
        Ok(())
    }

    /// Load, validate, and swap in a model. The current model is kept on failure.
    pub fn load_model(&self, path: &Path) -> Result<(), DetectorError> {
        let result = load_document(path).and_then(ModelDocument::into_trained);
        match result {
            Ok(trained) => {
                info!(
                    path = %path.display(),
                    trees = trained.model.forest.tree_count(),
                    seed = trained.metadata.seed,
                    "Model loaded"
                );
                self.model.store(Some(Arc::new(trained)));
                Ok(())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Model load failed, keeping current model");
                Err(e.into())
            }
        }
    }

    /// Discard the model and the last evaluation.
    pub fn reset(&self) {
        self.model.store(None);
        self.evaluation.store(None);
    }
}

/// Reject empty, non-finite, or fully constant training data.
fn check_training_data(vectors: &[FeatureVector]) -> Result<(), DetectorError> {
    if vectors.is_empty() {
        return Err(DetectorError::TrainingData("no training samples".to_string()));
    }
    for (i, v) in vectors.iter().enumerate() {
        v.ensure_finite()
            .map_err(|e| DetectorError::TrainingData(format!("sample {i}: {e}")))?;
    }
    let first = vectors[0].values();
    let any_varying = vectors.iter().any(|v| v.values() != first);
    if !any_varying {
        return Err(DetectorError::TrainingData("every feature is constant".to_string()));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
