//! Detection decision and output record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Severity
// ============================================================================

/// Severity tier of a fused leak probability.
///
/// Bands are half-open with each boundary belonging to the higher tier:
/// `[0,20) none`, `[20,40) low`, `[40,60) medium`, `[60,85) high`, `[85,100] critical`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const LOW_FLOOR: f64 = 20.0;
    pub const MEDIUM_FLOOR: f64 = 40.0;
    pub const HIGH_FLOOR: f64 = 60.0;
    pub const CRITICAL_FLOOR: f64 = 85.0;

    /// Map a leak probability in [0, 100] to its tier.
    pub fn from_probability(p: f64) -> Self {
        if p >= Self::CRITICAL_FLOOR {
            Self::Critical
        } else if p >= Self::HIGH_FLOOR {
            Self::High
        } else if p >= Self::MEDIUM_FLOOR {
            Self::Medium
        } else if p >= Self::LOW_FLOOR {
            Self::Low
        } else {
            Self::None
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::None => write!(f, "none"),
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

// ============================================================================
// Detection Decision
// ============================================================================

/// Fused decision for one reading.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetectionDecision {
    /// Weighted combination of ML and rule scores, [0, 100]
    pub leak_probability: f64,
    pub severity: Severity,
    /// Baseline-deviation score, [0, 100]
    pub rule_score: f64,
    /// Isolation forest anomaly score, [0, 100]
    pub ml_score: f64,
    /// Agreement-based confidence, [0, 100]
    pub confidence: f64,
    pub detected: bool,
}

// ============================================================================
// Decision Record (output contract)
// ============================================================================

/// What the valve controller did in response to a decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ValveAction {
    #[default]
    None,
    CloseCommanded,
    Closed,
    Fault,
    Reset,
}

/// One line of decision output, serialized as camelCase JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub location: String,
    pub leak_probability: f64,
    pub severity: Severity,
    pub rule_score: f64,
    pub ml_score: f64,
    pub detected: bool,
    pub valve_action: ValveAction,
}

impl DecisionRecord {
    pub fn new(
        location: impl Into<String>,
        timestamp: DateTime<Utc>,
        decision: &DetectionDecision,
        valve_action: ValveAction,
    ) -> Self {
        Self {
            timestamp,
            location: location.into(),
            leak_probability: decision.leak_probability,
            severity: decision.severity,
            rule_score: decision.rule_score,
            ml_score: decision.ml_score,
            detected: decision.detected,
            valve_action,
        }
    }
}
