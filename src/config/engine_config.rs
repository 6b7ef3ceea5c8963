//! Engine Configuration - All detection constants as operator-tunable TOML values
//!
//! Every tunable of the detection engine lives in this module. Each struct
//! implements `Default` with the commissioning defaults, so a missing file or a
//! partial file behaves exactly like the built-in configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "LEAKWATCH_CONFIG";

/// Config file picked up from the working directory when the env var is unset.
pub const LOCAL_CONFIG_FILE: &str = "leakwatch.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one detection engine deployment.
///
/// Load with `EngineConfig::load()` which searches:
/// 1. `$LEAKWATCH_CONFIG` env var
/// 2. `./leakwatch.toml`
/// 3. Built-in defaults
///
/// The config is passed explicitly to each component at construction; there
/// is no process-wide instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Site identification
    #[serde(default)]
    pub site: SiteInfo,

    /// Rolling-window feature extraction
    #[serde(default)]
    pub preprocessor: PreprocessorConfig,

    /// Isolation forest hyperparameters
    #[serde(default)]
    pub forest: ForestConfig,

    /// Anomaly detector decision cutoff
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Rule/ML fusion weights and baselines
    #[serde(default)]
    pub fusion: FusionConfig,

    /// Valve state machine timing
    #[serde(default)]
    pub valve: ValveConfig,

    /// Offline threshold calibration
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Model file location and retraining policy
    #[serde(default)]
    pub model: ModelConfig,
}

impl EngineConfig {
    /// Load configuration using the standard search order:
    /// 1. `$LEAKWATCH_CONFIG` environment variable
    /// 2. `./leakwatch.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), site = %config.site.name, "Loaded engine config from LEAKWATCH_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from LEAKWATCH_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "LEAKWATCH_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(site = %config.site.name, "Loaded engine config from ./leakwatch.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./leakwatch.toml, using defaults");
                }
            }
        }

        info!("No leakwatch.toml found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    ///
    /// Unknown keys produce warnings only; values that fail validation are
    /// returned as a single `ConfigError::Validation` listing every problem.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self = toml::from_str(contents)
            .map_err(|e| ConfigError::Parse(PathBuf::from("<inline>"), e))?;
        config.validate()?;
        for w in super::validation::validate_operating_ranges(&config) {
            warn!(field = %w.field, "{}", w);
        }
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Save config to a file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        std::fs::write(path, contents).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        info!(path = %path.display(), "Engine config saved");
        Ok(())
    }

    /// Validate all values for internal consistency.
    ///
    /// Rules:
    /// - Fusion weights must sum to approximately 1.0
    /// - Windows, timeouts, and tree counts must be positive
    /// - Percent-scale thresholds must lie in [0, 100]
    /// - Every value must be finite
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        let p = &self.preprocessor;
        if p.moving_average_window_secs == 0 {
            errors.push("preprocessor.moving_average_window_secs must be > 0".to_string());
        }
        if p.stddev_window_secs == 0 {
            errors.push("preprocessor.stddev_window_secs must be > 0".to_string());
        }
        if p.warmup_readings < 2 {
            errors.push(format!(
                "preprocessor.warmup_readings ({}) must be >= 2 (rate of change needs a prior reading)",
                p.warmup_readings
            ));
        }
        if p.max_window_samples < 2 {
            errors.push("preprocessor.max_window_samples must be >= 2".to_string());
        }
        if p.flow_epsilon <= 0.0 {
            errors.push("preprocessor.flow_epsilon must be > 0 (used as divisor floor)".to_string());
        }

        let f = &self.forest;
        if f.n_trees == 0 {
            errors.push("forest.n_trees must be > 0".to_string());
        }
        if f.subsample_size < 2 {
            errors.push("forest.subsample_size must be >= 2".to_string());
        }
        if !(f.contamination > 0.0 && f.contamination < 0.5) {
            errors.push(format!(
                "forest.contamination ({:.4}) must be in (0, 0.5)",
                f.contamination
            ));
        }
        if f.score_steepness <= 0.0 {
            errors.push("forest.score_steepness must be > 0".to_string());
        }

        let d = &self.detector;
        if !(d.anomaly_cutoff > 0.0 && d.anomaly_cutoff < 100.0) {
            errors.push(format!(
                "detector.anomaly_cutoff ({:.1}) must be in (0, 100)",
                d.anomaly_cutoff
            ));
        }

        let fu = &self.fusion;
        if fu.ml_weight < 0.0 || fu.rule_weight < 0.0 {
            errors.push("fusion weights must be non-negative".to_string());
        }
        let weight_sum = fu.ml_weight + fu.rule_weight;
        if !(0.95..=1.05).contains(&weight_sum) {
            errors.push(format!("fusion weights must sum to ~1.0, got {weight_sum:.2}"));
        }
        if !(0.0..=100.0).contains(&fu.detection_threshold) {
            errors.push(format!(
                "fusion.detection_threshold ({:.1}) must be in [0, 100]",
                fu.detection_threshold
            ));
        }
        if !(fu.agreement_spread > 0.0 && fu.agreement_spread <= 100.0) {
            errors.push(format!(
                "fusion.agreement_spread ({:.1}) must be in (0, 100]",
                fu.agreement_spread
            ));
        }
        Self::check_baseline(&fu.baseline, "fusion.baseline", &mut errors);
        for (location, baseline) in &fu.locations {
            Self::check_baseline(baseline, &format!("fusion.locations.{location}"), &mut errors);
        }

        let v = &self.valve;
        if v.dwell_decisions == 0 {
            errors.push("valve.dwell_decisions must be >= 1".to_string());
        }
        if v.confirmation_timeout_ms == 0 {
            errors.push("valve.confirmation_timeout_ms must be > 0".to_string());
        }

        let c = &self.calibration;
        if !(c.min_recall > 0.0 && c.min_recall <= 1.0) {
            errors.push(format!(
                "calibration.min_recall ({:.2}) must be in (0, 1]",
                c.min_recall
            ));
        }

        // NaN slips through every range comparison above
        let non_finite: Vec<&str> = self
            .float_fields()
            .into_iter()
            .filter(|(_, v)| !v.is_finite())
            .map(|(name, _)| name)
            .collect();
        if !non_finite.is_empty() {
            errors.push(format!(
                "Non-finite values in: {}, all values must be finite numbers",
                non_finite.join(", ")
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn float_fields(&self) -> Vec<(&'static str, f64)> {
        let mut fields = vec![
            ("preprocessor.flow_epsilon", self.preprocessor.flow_epsilon),
            ("forest.contamination", self.forest.contamination),
            ("forest.score_steepness", self.forest.score_steepness),
            ("detector.anomaly_cutoff", self.detector.anomaly_cutoff),
            ("fusion.ml_weight", self.fusion.ml_weight),
            ("fusion.rule_weight", self.fusion.rule_weight),
            ("fusion.detection_threshold", self.fusion.detection_threshold),
            ("fusion.agreement_spread", self.fusion.agreement_spread),
            ("calibration.min_recall", self.calibration.min_recall),
        ];
        for baseline in std::iter::once(&self.fusion.baseline).chain(self.fusion.locations.values()) {
            fields.push(("nominal_pressure_psi", baseline.nominal_pressure_psi));
            fields.push(("nominal_flow_lpm", baseline.nominal_flow_lpm));
            fields.push(("deviation_threshold_pct", baseline.deviation_threshold_pct));
        }
        fields
    }

    fn check_baseline(baseline: &LocationBaseline, name: &str, errors: &mut Vec<String>) {
        if baseline.nominal_pressure_psi <= 0.0 {
            errors.push(format!("{name}.nominal_pressure_psi must be > 0"));
        }
        if baseline.nominal_flow_lpm <= 0.0 {
            errors.push(format!("{name}.nominal_flow_lpm must be > 0"));
        }
        if !(baseline.deviation_threshold_pct > 0.0 && baseline.deviation_threshold_pct < 100.0) {
            errors.push(format!(
                "{name}.deviation_threshold_pct ({:.1}) must be in (0, 100)",
                baseline.deviation_threshold_pct
            ));
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {1}", .0.display())]
    Io(PathBuf, std::io::Error),

    #[error("Config parse error ({}): {1}", .0.display())]
    Parse(PathBuf, toml::de::Error),

    #[error("Config serialization error: {0}")]
    Serialize(toml::ser::Error),

    #[error("Config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

// ============================================================================
// Site Info
// ============================================================================

/// Identification metadata; appears in logs and model metadata only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteInfo {
    /// Site / pipeline network name
    #[serde(default = "default_site_name")]
    pub name: String,

    /// Operating company
    #[serde(default)]
    pub operator: String,
}

fn default_site_name() -> String {
    "DEFAULT".to_string()
}

impl Default for SiteInfo {
    fn default() -> Self {
        Self {
            name: default_site_name(),
            operator: String::new(),
        }
    }
}

// ============================================================================
// Preprocessor Config
// ============================================================================

/// Rolling-window sizes and numeric guards for feature extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessorConfig {
    /// Moving-average window (seconds).
    #[serde(default = "default_ma_window")]
    pub moving_average_window_secs: u64,

    /// Standard-deviation window (seconds).
    #[serde(default = "default_stddev_window")]
    pub stddev_window_secs: u64,

    /// Readings a location must see before the first vector is produced.
    #[serde(default = "default_warmup_readings")]
    pub warmup_readings: usize,

    /// Hard cap on samples held per window, independent of cadence.
    #[serde(default = "default_max_window_samples")]
    pub max_window_samples: usize,

    /// Floor applied to flow in the pressure/flow ratio.
    #[serde(default = "default_flow_epsilon")]
    pub flow_epsilon: f64,
}

fn default_ma_window() -> u64 { 30 }
fn default_stddev_window() -> u64 { 60 }
fn default_warmup_readings() -> usize { 5 }
fn default_max_window_samples() -> usize { 600 }
fn default_flow_epsilon() -> f64 { 1e-3 }

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            moving_average_window_secs: default_ma_window(),
            stddev_window_secs: default_stddev_window(),
            warmup_readings: default_warmup_readings(),
            max_window_samples: default_max_window_samples(),
            flow_epsilon: default_flow_epsilon(),
        }
    }
}

// ============================================================================
// Forest Config
// ============================================================================

/// Isolation forest hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestConfig {
    /// Number of trees in the ensemble.
    #[serde(default = "default_n_trees")]
    pub n_trees: usize,

    /// Subsample drawn (without replacement) per tree.
    #[serde(default = "default_subsample_size")]
    pub subsample_size: usize,

    /// Seed for tree construction. Same seed + same data = same forest.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Expected fraction of anomalies in training data. Anchors the
    /// score mapping: the (1 - contamination) quantile of training scores
    /// maps to 50.
    #[serde(default = "default_contamination")]
    pub contamination: f64,

    /// Slope of the logistic raw-score mapping, in training-score spreads.
    #[serde(default = "default_score_steepness")]
    pub score_steepness: f64,
}

fn default_n_trees() -> usize { 100 }
fn default_subsample_size() -> usize { 256 }
fn default_seed() -> u64 { 42 }
fn default_contamination() -> f64 { 0.005 }
fn default_score_steepness() -> f64 { 1.5 }

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: default_n_trees(),
            subsample_size: default_subsample_size(),
            seed: default_seed(),
            contamination: default_contamination(),
            score_steepness: default_score_steepness(),
        }
    }
}

// ============================================================================
// Detector Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Anomaly score above which a prediction is flagged.
    #[serde(default = "default_anomaly_cutoff")]
    pub anomaly_cutoff: f64,
}

fn default_anomaly_cutoff() -> f64 { 50.0 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            anomaly_cutoff: default_anomaly_cutoff(),
        }
    }
}

// ============================================================================
// Fusion Config
// ============================================================================

/// Nominal operating point and rule trigger for one monitored location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationBaseline {
    /// Nominal line pressure (PSI).
    #[serde(default = "default_nominal_pressure")]
    pub nominal_pressure_psi: f64,

    /// Nominal flow (L/min).
    #[serde(default = "default_nominal_flow")]
    pub nominal_flow_lpm: f64,

    /// Percentage deviation from nominal that triggers the rule score.
    #[serde(default = "default_deviation_threshold")]
    pub deviation_threshold_pct: f64,
}

fn default_nominal_pressure() -> f64 { 60.0 }
fn default_nominal_flow() -> f64 { 40.0 }
fn default_deviation_threshold() -> f64 { 10.0 }

impl Default for LocationBaseline {
    fn default() -> Self {
        Self {
            nominal_pressure_psi: default_nominal_pressure(),
            nominal_flow_lpm: default_nominal_flow(),
            deviation_threshold_pct: default_deviation_threshold(),
        }
    }
}

/// Weights and thresholds for combining the ML and rule scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Weight of the ML anomaly score.
    #[serde(default = "default_ml_weight")]
    pub ml_weight: f64,

    /// Weight of the rule score.
    #[serde(default = "default_rule_weight")]
    pub rule_weight: f64,

    /// Leak probability above which a leak is reported as detected.
    #[serde(default = "default_detection_threshold")]
    pub detection_threshold: f64,

    /// Score divergence beyond which confidence is cut back.
    #[serde(default = "default_agreement_spread")]
    pub agreement_spread: f64,

    /// Baseline used for locations without an override.
    #[serde(default)]
    pub baseline: LocationBaseline,

    /// Per-location overrides, keyed by location name.
    #[serde(default)]
    pub locations: BTreeMap<String, LocationBaseline>,
}

fn default_ml_weight() -> f64 { 0.6 }
fn default_rule_weight() -> f64 { 0.4 }
fn default_detection_threshold() -> f64 { 50.0 }
fn default_agreement_spread() -> f64 { 30.0 }

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            ml_weight: default_ml_weight(),
            rule_weight: default_rule_weight(),
            detection_threshold: default_detection_threshold(),
            agreement_spread: default_agreement_spread(),
            baseline: LocationBaseline::default(),
            locations: BTreeMap::new(),
        }
    }
}

impl FusionConfig {
    /// Baseline for a location, falling back to the default baseline.
    pub fn baseline_for(&self, location: &str) -> &LocationBaseline {
        self.locations.get(location).unwrap_or(&self.baseline)
    }
}

// ============================================================================
// Valve Config
// ============================================================================

/// Hysteresis and actuator timing for the shutoff valve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValveConfig {
    /// Consecutive critical decisions required before closing.
    #[serde(default = "default_dwell_decisions")]
    pub dwell_decisions: u32,

    /// Time allowed for actuator confirmation after a close command (ms).
    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,
}

fn default_dwell_decisions() -> u32 { 2 }
fn default_confirmation_timeout_ms() -> u64 { 5_000 }

impl Default for ValveConfig {
    fn default() -> Self {
        Self {
            dwell_decisions: default_dwell_decisions(),
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
        }
    }
}

// ============================================================================
// Calibration Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Recall floor for the precision-maximizing recommendation.
    #[serde(default = "default_min_recall")]
    pub min_recall: f64,
}

fn default_min_recall() -> f64 { 0.95 }

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_recall: default_min_recall(),
        }
    }
}

// ============================================================================
// Model Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Where the trained model document is stored.
    #[serde(default = "default_model_path")]
    pub path: PathBuf,

    /// Feature vectors collected before an untrained engine trains itself.
    #[serde(default = "default_bootstrap_samples")]
    pub bootstrap_samples: usize,
}

fn default_model_path() -> PathBuf {
    PathBuf::from(super::defaults::DEFAULT_MODEL_PATH)
}
fn default_bootstrap_samples() -> usize { 500 }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: default_model_path(),
            bootstrap_samples: default_bootstrap_samples(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
