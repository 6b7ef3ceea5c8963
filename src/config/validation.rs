//! Config validation: unknown-key detection with Levenshtein suggestions
//! and plausibility checks on operating baselines.
//!
//! Two-pass parse approach: first deserialize raw TOML into `toml::Value`,
//! walk the key tree, compare against known field names, and emit warnings
//! with "did you mean?" suggestions. Then proceed with normal serde
//! deserialization. Warnings never break existing configs.

use std::collections::HashSet;

use super::{EngineConfig, LocationBaseline};

/// A non-fatal config warning (typo, suspicious value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, ", did you mean '{s}'?")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Table under which operators name their own locations.
const LOCATIONS_PREFIX: &str = "fusion.locations";

/// Fields accepted inside `[fusion.baseline]` and each `[fusion.locations.<name>]`.
const BASELINE_FIELDS: &[&str] = &[
    "nominal_pressure_psi",
    "nominal_flow_lpm",
    "deviation_threshold_pct",
];

/// Returns the complete set of valid dotted key paths for EngineConfig.
///
/// Maintained by hand to match the struct hierarchy in engine_config.rs.
/// Location override tables are matched separately since their names are
/// operator-chosen.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [site]
        "site",
        "site.name",
        "site.operator",
        // [preprocessor]
        "preprocessor",
        "preprocessor.moving_average_window_secs",
        "preprocessor.stddev_window_secs",
        "preprocessor.warmup_readings",
        "preprocessor.max_window_samples",
        "preprocessor.flow_epsilon",
        // [forest]
        "forest",
        "forest.n_trees",
        "forest.subsample_size",
        "forest.seed",
        "forest.contamination",
        "forest.score_steepness",
        // [detector]
        "detector",
        "detector.anomaly_cutoff",
        // [fusion]
        "fusion",
        "fusion.ml_weight",
        "fusion.rule_weight",
        "fusion.detection_threshold",
        "fusion.agreement_spread",
        "fusion.baseline",
        "fusion.baseline.nominal_pressure_psi",
        "fusion.baseline.nominal_flow_lpm",
        "fusion.baseline.deviation_threshold_pct",
        "fusion.locations",
        // [valve]
        "valve",
        "valve.dwell_decisions",
        "valve.confirmation_timeout_ms",
        // [calibration]
        "calibration",
        "calibration.min_recall",
        // [model]
        "model",
        "model.path",
        "model.bootstrap_samples",
    ];
    keys.iter().copied().collect()
}

/// Whether `key` is a location table or a baseline field inside one.
fn is_location_key(key: &str) -> bool {
    let Some(rest) = key.strip_prefix(LOCATIONS_PREFIX).and_then(|r| r.strip_prefix('.')) else {
        return false;
    };
    match rest.split_once('.') {
        None => true,
        Some((_, field)) => BASELINE_FIELDS.contains(&field),
    }
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walks a `toml::Value` tree and collects all dotted key paths.
///
/// For example, a table `{ a = { b = 1, c = 2 } }` yields:
/// `["a", "a.b", "a.c"]`
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            if v.is_table() {
                keys.extend(walk_toml_keys(v, &path));
            }
        }
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|&k| (k, levenshtein(unknown, k)))
        .filter(|&(_, dist)| dist <= 3)
        // Tie-break on the key itself so suggestions do not depend on hash order
        .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(k, _)| k.to_string())
}

/// Suggest a baseline field for a misspelled field inside a location table.
fn suggest_location_field(key: &str) -> Option<String> {
    let (table, field) = key.rsplit_once('.')?;
    BASELINE_FIELDS
        .iter()
        .map(|&f| (f, levenshtein(field, f)))
        .filter(|&(_, dist)| dist <= 3)
        .min_by_key(|&(_, dist)| dist)
        .map(|(f, _)| format!("{table}.{f}"))
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse a raw TOML string and return warnings for any unknown config keys.
///
/// Never fails on unknown keys, it only warns.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let value: toml::Value = match raw_toml.parse() {
        Ok(v) => v,
        Err(_) => return Vec::new(), // parse errors are reported by serde later
    };

    let known = known_config_keys();
    let mut warnings = Vec::new();

    for key in walk_toml_keys(&value, "") {
        if known.contains(key.as_str()) || is_location_key(&key) {
            continue;
        }
        let suggestion = if key.starts_with(LOCATIONS_PREFIX) {
            suggest_location_field(&key)
        } else {
            suggest_correction(&key, &known)
        };
        warnings.push(ValidationWarning {
            message: format!("Unknown config key '{key}'"),
            field: key,
            suggestion,
        });
    }

    warnings
}

// ============================================================================
// Operating Range Validation
// ============================================================================

/// Plausibility checks that are suspicious but not impossible.
///
/// Hard errors are raised by `EngineConfig::validate`; these are surfaced as
/// warnings at startup.
pub fn validate_operating_ranges(config: &EngineConfig) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    check_baseline_range(&config.fusion.baseline, "fusion.baseline", &mut warnings);
    for (name, baseline) in &config.fusion.locations {
        check_baseline_range(baseline, &format!("{LOCATIONS_PREFIX}.{name}"), &mut warnings);
    }

    let p = &config.preprocessor;
    if p.stddev_window_secs < p.moving_average_window_secs {
        warnings.push(ValidationWarning {
            field: "preprocessor.stddev_window_secs".to_string(),
            message: format!(
                "stddev window ({}s) is shorter than the moving-average window ({}s)",
                p.stddev_window_secs, p.moving_average_window_secs
            ),
            suggestion: None,
        });
    }

    if config.forest.n_trees < 10 {
        warnings.push(ValidationWarning {
            field: "forest.n_trees".to_string(),
            message: format!(
                "forest.n_trees = {} gives noisy scores, 50+ trees recommended",
                config.forest.n_trees
            ),
            suggestion: None,
        });
    }

    warnings
}

fn check_baseline_range(baseline: &LocationBaseline, name: &str, warnings: &mut Vec<ValidationWarning>) {
    // Distribution mains rarely run above ~1500 PSI
    if baseline.nominal_pressure_psi > 1_500.0 {
        warnings.push(ValidationWarning {
            field: format!("{name}.nominal_pressure_psi"),
            message: format!(
                "{name}.nominal_pressure_psi = {:.1} is outside typical range (0-1500 PSI)",
                baseline.nominal_pressure_psi
            ),
            suggestion: None,
        });
    }
    if baseline.deviation_threshold_pct < 2.0 {
        warnings.push(ValidationWarning {
            field: format!("{name}.deviation_threshold_pct"),
            message: format!(
                "{name}.deviation_threshold_pct = {:.1} is within normal sensor noise",
                baseline.deviation_threshold_pct
            ),
            suggestion: None,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("dwell", "dwell"), 0);
        assert_eq!(levenshtein("contamnation", "contamination"), 1);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
    }

    #[test]
    fn test_walk_toml_keys_nested() {
        let toml: toml::Value = r#"
            [fusion.baseline]
            nominal_flow_lpm = 40.0
        "#
        .parse()
        .unwrap();
        let keys = walk_toml_keys(&toml, "");
        assert!(keys.contains(&"fusion".to_string()));
        assert!(keys.contains(&"fusion.baseline".to_string()));
        assert!(keys.contains(&"fusion.baseline.nominal_flow_lpm".to_string()));
    }

    #[test]
    fn test_typo_key_produces_warning_with_suggestion() {
        let toml_str = r#"
[forest]
contamnation = 0.01
"#;
        let warnings = validate_unknown_keys(toml_str);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "forest.contamnation");
        assert_eq!(warnings[0].suggestion.as_deref(), Some("forest.contamination"));
    }

    #[test]
    fn test_location_tables_are_accepted() {
        let toml_str = r#"
[fusion.locations.pump-station-3]
nominal_pressure_psi = 85.0
deviation_threshold_pct = 12.0

[fusion.locations."Main St"]
nominal_flow_lpm = 55.0
"#;
        let warnings = validate_unknown_keys(toml_str);
        assert!(warnings.is_empty(), "Expected 0 warnings, got: {warnings:?}");
    }

    #[test]
    fn test_location_field_typo_is_flagged() {
        let toml_str = r#"
[fusion.locations.segment-7]
nominal_presure_psi = 85.0
"#;
        let warnings = validate_unknown_keys(toml_str);
        assert_eq!(warnings.len(), 1);
        assert_eq!(
            warnings[0].suggestion.as_deref(),
            Some("fusion.locations.segment-7.nominal_pressure_psi")
        );
    }

    #[test]
    fn test_unknown_section_produces_warning() {
        let warnings = validate_unknown_keys("[telemetry]\nendpoint = \"x\"\n");
        assert!(warnings.iter().any(|w| w.field == "telemetry"));
    }

    #[test]
    fn test_suggest_correction_no_match_for_garbage() {
        let known = known_config_keys();
        assert!(suggest_correction("completely_unrelated_garbage_key_xyz", &known).is_none());
    }

    #[test]
    fn test_every_serialized_key_is_known() {
        let toml_str = EngineConfig::default().to_toml().unwrap();
        let warnings = validate_unknown_keys(&toml_str);
        assert!(warnings.is_empty(), "Serialized defaults produced warnings: {warnings:?}");
    }

    #[test]
    fn test_operating_ranges_defaults_clean() {
        let warnings = validate_operating_ranges(&EngineConfig::default());
        assert!(warnings.is_empty(), "Defaults should produce no warnings: {warnings:?}");
    }

    #[test]
    fn test_operating_ranges_flag_noise_level_threshold() {
        let mut config = EngineConfig::default();
        config.fusion.locations.insert(
            "valve-12".to_string(),
            LocationBaseline {
                deviation_threshold_pct: 0.5,
                ..LocationBaseline::default()
            },
        );
        let warnings = validate_operating_ranges(&config);
        assert!(warnings
            .iter()
            .any(|w| w.field == "fusion.locations.valve-12.deviation_threshold_pct"));
    }
}
