//! Model document persistence
//!
//! The trained forest is stored as a single JSON document. Saves are atomic
//! (write temp file, then rename) and loads parse and validate the whole
//! document before anything is handed back to the detector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::{TrainedModel, TrainingMetadata};
use crate::config::defaults::MODEL_SCHEMA_VERSION;
use crate::features::{FEATURE_COUNT, FEATURE_NAMES};
use crate::forest::{ForestModel, IsolationForest, IsolationTree, Row, ScoreCalibration};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("model file I/O error ({}): {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed model document: {0}")]
    Format(#[from] serde_json::Error),

    #[error("unsupported model schema version {found} (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },

    #[error("model feature order {found:?} does not match the compiled schema")]
    FeatureOrder { found: Vec<String> },

    #[error("model checksum mismatch: stored {stored}, computed {computed}")]
    Checksum { stored: String, computed: String },

    #[error("invalid model document: {0}")]
    Invalid(String),
}

// ============================================================================
// Document Format
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    pub created_at: DateTime<Utc>,
    pub seed: u64,
    pub subsample_size: usize,
    pub training_samples: usize,
    pub training_time_ms: u64,
    pub score_calibration: ScoreCalibration,
    /// MD5 (hex) of the serialized `trees` array
    pub checksum: String,
}

/// On-disk representation of a trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDocument {
    pub schema_version: u32,
    pub tree_count: usize,
    pub trees: Vec<IsolationTree>,
    pub feature_order: Vec<String>,
    pub feature_means: BTreeMap<String, f64>,
    pub feature_std_devs: BTreeMap<String, f64>,
    pub is_trained: bool,
    pub metadata: ModelMetadata,
}

impl ModelDocument {
    pub fn from_trained(trained: &TrainedModel) -> Result<Self, PersistenceError> {
        let model = &trained.model;
        let trees = model.forest.trees().to_vec();
        let checksum = trees_checksum(&trees)?;
        Ok(Self {
            schema_version: MODEL_SCHEMA_VERSION,
            tree_count: trees.len(),
            trees,
            feature_order: FEATURE_NAMES.iter().map(|s| (*s).to_string()).collect(),
            feature_means: named(&model.means),
            feature_std_devs: named(&model.std_devs),
            is_trained: true,
            metadata: ModelMetadata {
                created_at: trained.metadata.created_at,
                seed: trained.metadata.seed,
                subsample_size: model.forest.subsample_size(),
                training_samples: trained.metadata.training_samples,
                training_time_ms: trained.metadata.training_time_ms,
                score_calibration: model.calibration,
                checksum,
            },
        })
    }

    /// Validate every part of the document and rebuild the model.
    pub fn into_trained(self) -> Result<TrainedModel, PersistenceError> {
        if self.schema_version != MODEL_SCHEMA_VERSION {
            return Err(PersistenceError::SchemaVersion {
                found: self.schema_version,
                expected: MODEL_SCHEMA_VERSION,
            });
        }
        if self.feature_order.iter().map(String::as_str).ne(FEATURE_NAMES) {
            return Err(PersistenceError::FeatureOrder {
                found: self.feature_order,
            });
        }
        if !self.is_trained {
            return Err(PersistenceError::Invalid("document is marked untrained".to_string()));
        }
        if self.trees.is_empty() || self.tree_count != self.trees.len() {
            return Err(PersistenceError::Invalid(format!(
                "treeCount {} does not match {} stored trees",
                self.tree_count,
                self.trees.len()
            )));
        }

        let computed = trees_checksum(&self.trees)?;
        if !computed.eq_ignore_ascii_case(&self.metadata.checksum) {
            return Err(PersistenceError::Checksum {
                stored: self.metadata.checksum,
                computed,
            });
        }

        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate()
                .map_err(|e| PersistenceError::Invalid(format!("tree {i}: {e}")))?;
        }
        if self.metadata.subsample_size < 2 {
            return Err(PersistenceError::Invalid("subsampleSize must be >= 2".to_string()));
        }
        if !self.metadata.score_calibration.is_valid() {
            return Err(PersistenceError::Invalid("scoreCalibration is not finite and positive".to_string()));
        }

        let means = unnamed(&self.feature_means, "featureMeans")?;
        let std_devs = unnamed(&self.feature_std_devs, "featureStdDevs")?;
        if std_devs.iter().any(|s| *s < 0.0) {
            return Err(PersistenceError::Invalid("featureStdDevs must be non-negative".to_string()));
        }

        Ok(TrainedModel {
            model: ForestModel {
                forest: IsolationForest::from_parts(self.trees, self.metadata.subsample_size),
                means,
                std_devs,
                calibration: self.metadata.score_calibration,
            },
            metadata: TrainingMetadata {
                created_at: self.metadata.created_at,
                seed: self.metadata.seed,
                training_samples: self.metadata.training_samples,
                training_time_ms: self.metadata.training_time_ms,
            },
        })
    }
}

fn trees_checksum(trees: &[IsolationTree]) -> Result<String, PersistenceError> {
    let bytes = serde_json::to_vec(trees)?;
    Ok(format!("{:x}", md5::compute(bytes)))
}

fn named(values: &Row) -> BTreeMap<String, f64> {
    FEATURE_NAMES
        .iter()
        .zip(values)
        .map(|(name, v)| ((*name).to_string(), *v))
        .collect()
}

fn unnamed(map: &BTreeMap<String, f64>, field: &str) -> Result<Row, PersistenceError> {
    if map.len() != FEATURE_COUNT {
        return Err(PersistenceError::Invalid(format!(
            "{field} has {} entries, expected {FEATURE_COUNT}",
            map.len()
        )));
    }
    let mut row = [0.0; FEATURE_COUNT];
    for (slot, name) in row.iter_mut().zip(FEATURE_NAMES) {
        let value = *map
            .get(name)
            .ok_or_else(|| PersistenceError::Invalid(format!("{field} is missing '{name}'")))?;
        if !value.is_finite() {
            return Err(PersistenceError::Invalid(format!("{field}.{name} is not finite")));
        }
        *slot = value;
    }
    Ok(row)
}

// ============================================================================
// Disk I/O
// ============================================================================

/// Save a document atomically (write temp file alongside, then rename).
pub fn save_document(doc: &ModelDocument, path: &Path) -> Result<(), PersistenceError> {
    let io_err = |source: io::Error| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(doc)?;

    let tmp_path = path.with_extension("json.tmp");
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(&tmp_path, &json).map_err(io_err)?;
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(io_err(e));
    }
    Ok(())
}

/// Read and parse a document. Validation happens in `into_trained`.
pub fn load_document(path: &Path) -> Result<ModelDocument, PersistenceError> {
    let data = std::fs::read(path).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&data)?)
}
