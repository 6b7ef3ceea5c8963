//! Threshold Calibration - Offline sweep over labeled scores
//!
//! Sweeps decision thresholds 0.00..=1.00 in steps of 0.01 over
//! `(score, label)` pairs with scores on the unit interval, and picks:
//!
//! - `best_by_f1`: maximum F1; ties resolve to the median tied threshold
//! - `best_precision_at_recall`: maximum precision with recall ≥ `min_recall`
//! - `recommended`: the precision pick when attainable, else the F1 pick
//!
//! A score counts as a positive prediction when it is strictly greater than
//! the threshold.
//!
//! The swept score is the fused leak probability (see [`leak_probability_scores`]),
//! so the recommendation maps directly onto `fusion.detection_threshold`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::defaults::CALIBRATION_STEPS;
use crate::config::EngineConfig;
use crate::detector::{AnomalyDetector, ConfusionMatrix, DetectorError};
use crate::features::FeaturePreprocessor;
use crate::fusion::FusionEngine;
use crate::types::{Label, SensorReading};

/// F1 values closer than this are treated as tied.
const F1_TIE_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CalibrationError {
    #[error("no scores to calibrate on")]
    Empty,

    #[error("{labels} labels supplied for {scores} scores")]
    LengthMismatch { scores: usize, labels: usize },

    #[error("score {score} at index {index} is outside [0, 1]")]
    ScoreOutOfRange { index: usize, score: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdPoint {
    pub threshold: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub confusion: ConfusionMatrix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationResult {
    pub points: Vec<ThresholdPoint>,
    pub best_by_f1: ThresholdPoint,
    pub best_precision_at_recall: Option<ThresholdPoint>,
    pub recommended: ThresholdPoint,
    pub min_recall: f64,
}

impl CalibrationResult {
    /// The recommended threshold on the leak-probability scale, [0, 100].
    pub fn detection_threshold(&self) -> f64 {
        self.recommended.threshold * 100.0
    }
}

/// Leak probabilities on [0, 1] for every labeled reading, fused the way the
/// live engine fuses them: rule score alone during warm-up or without a
/// model, weighted ML + rule score otherwise.
///
/// Unlabeled readings still advance the rolling windows but yield no pair.
/// Rejected readings are logged and skipped.
pub fn leak_probability_scores(
    config: &EngineConfig,
    detector: &AnomalyDetector,
    readings: &[SensorReading],
) -> Result<(Vec<f64>, Vec<Label>), DetectorError> {
    let mut preprocessor = FeaturePreprocessor::new(config.preprocessor.clone());
    let fusion = FusionEngine::new(config.fusion.clone());
    let mut scores = Vec::with_capacity(readings.len());
    let mut labels = Vec::with_capacity(readings.len());

    for reading in readings {
        let features = match preprocessor.process_reading(reading) {
            Ok(f) => f,
            Err(e) => {
                warn!(location = %reading.location, error = %e, "Skipping reading");
                continue;
            }
        };
        let ml_score = match features {
            Some(vector) if detector.is_trained() => Some(detector.predict(&vector)?.anomaly_score),
            _ => None,
        };
        if let Some(label) = reading.label {
            let decision = fusion.fuse(reading, ml_score);
            scores.push(decision.leak_probability / 100.0);
            labels.push(label);
        }
    }
    Ok((scores, labels))
}

/// Run the full threshold sweep.
pub fn calibrate(scores: &[f64], labels: &[Label], min_recall: f64) -> Result<CalibrationResult, CalibrationError> {
    if scores.is_empty() {
        return Err(CalibrationError::Empty);
    }
    if scores.len() != labels.len() {
        return Err(CalibrationError::LengthMismatch {
            scores: scores.len(),
            labels: labels.len(),
        });
    }
    if let Some((index, &score)) = scores
        .iter()
        .enumerate()
        .find(|(_, s)| !(0.0..=1.0).contains(*s))
    {
        return Err(CalibrationError::ScoreOutOfRange { index, score });
    }

    let points: Vec<ThresholdPoint> = (0..=CALIBRATION_STEPS)
        .map(|step| {
            let threshold = step as f64 / CALIBRATION_STEPS as f64;
            let confusion = ConfusionMatrix::tally(scores.iter().map(|s| *s > threshold), labels);
            ThresholdPoint {
                threshold,
                precision: confusion.precision(),
                recall: confusion.recall(),
                f1: confusion.f1(),
                confusion,
            }
        })
        .collect();

    let best_by_f1 = best_by_f1(&points);
    let best_precision_at_recall = best_precision_at_recall(&points, min_recall);
    let recommended = best_precision_at_recall.unwrap_or(best_by_f1);

    info!(
        samples = scores.len(),
        best_f1_threshold = best_by_f1.threshold,
        best_f1 = best_by_f1.f1,
        recommended = recommended.threshold,
        min_recall,
        "Threshold calibration complete"
    );

    Ok(CalibrationResult {
        points,
        best_by_f1,
        best_precision_at_recall,
        recommended,
        min_recall,
    })
}

/// Maximum F1; among tied thresholds, the median one.
fn best_by_f1(points: &[ThresholdPoint]) -> ThresholdPoint {
    let max_f1 = points.iter().map(|p| p.f1).fold(0.0_f64, f64::max);
    let tied: Vec<&ThresholdPoint> = points
        .iter()
        .filter(|p| (p.f1 - max_f1).abs() <= F1_TIE_TOLERANCE)
        .collect();
    // Points are in ascending threshold order, so the middle element is the median
    *tied[(tied.len() - 1) / 2]
}

/// Maximum precision among points meeting the recall floor; the highest
/// threshold wins a precision tie.
fn best_precision_at_recall(points: &[ThresholdPoint], min_recall: f64) -> Option<ThresholdPoint> {
    points
        .iter()
        .filter(|p| p.recall >= min_recall && p.confusion.true_positives > 0)
        .fold(None, |best: Option<ThresholdPoint>, p| match best {
            Some(b) if b.precision > p.precision => Some(b),
            _ => Some(*p),
        })
}

// ============================================================================
// Tests
// ============================================================================
