//! System-wide default constants.
//!
//! Values here are structural rather than operator-tunable; anything an
//! operator may reasonably want to change lives in `EngineConfig`.

// ============================================================================
// Model
// ============================================================================

/// Default location of the persisted model document.
pub const DEFAULT_MODEL_PATH: &str = "data/model.json";

/// Version written to, and required from, persisted model documents.
pub const MODEL_SCHEMA_VERSION: u32 = 1;

/// Floor applied to the spread of raw training scores.
///
/// A forest trained on near-identical data can produce a spread of zero,
/// which would make the logistic score mapping a step function.
pub const SCORE_SPREAD_FLOOR: f64 = 1e-3;

/// Euler-Mascheroni constant used by the harmonic-number approximation.
pub const EULER_GAMMA: f64 = 0.577_215_664_9;

// ============================================================================
// Fusion
// ============================================================================

/// Score at or above which the ML or rule score counts as a leak vote.
pub const VOTE_THRESHOLD: f64 = 50.0;

/// Confidence multiplier applied when the two scores vote differently.
pub const DISAGREEMENT_PENALTY: f64 = 0.5;

// ============================================================================
// Calibration
// ============================================================================

/// Number of threshold steps in the 0.00..=1.00 sweep (step 0.01).
pub const CALIBRATION_STEPS: usize = 100;

// ============================================================================
// Pipeline
// ============================================================================

/// Capacity of the in-memory decision ring buffer.
pub const MEMORY_SINK_CAPACITY: usize = 10_000;

/// Cadence of valve timeout checks while the source is idle (ms).
pub const VALVE_TICK_INTERVAL_MS: u64 = 500;
