//! LeakWatch: Real-time pipeline leak detection
//!
//! Streaming leak detection for monitored pipeline locations.
//!
//! ## Architecture
//!
//! - **Features**: per-location rolling windows turn readings into fixed-shape vectors
//! - **Forest**: isolation forest ensemble scoring vectors by isolation depth
//! - **Detector**: training, inference, evaluation and model persistence
//! - **Fusion**: ML score + baseline-deviation rule score → leak decision
//! - **Valve**: hysteresis-protected shutoff valve state machine
//! - **Pipeline**: sources, sinks and the async processing loop
//! - **Calibration**: offline threshold sweep over labeled scores

pub mod calibration;
pub mod config;
pub mod detector;
pub mod features;
pub mod forest;
pub mod fusion;
pub mod pipeline;
pub mod types;
pub mod valve;

// Re-export engine configuration
pub use config::{ConfigError, EngineConfig};

// Re-export commonly used types
pub use types::{
    DecisionRecord, DetectionDecision, FieldValvePosition, Label, SensorReading, Severity, ValveAction,
};

// Re-export feature extraction
pub use features::{Feature, FeatureError, FeaturePreprocessor, FeatureVector, FEATURE_COUNT, FEATURE_NAMES};

// Re-export detection components
pub use detector::{AnomalyDetector, AnomalyPrediction, DetectorError, TrainingSample};
pub use fusion::FusionEngine;
pub use valve::{Actuator, SimulatedActuator, ValveController, ValveError, ValveEvent, ValveState};

// Re-export pipeline components
pub use pipeline::{DecisionSink, DetectionEngine, ProcessingLoop, ReadingSource};
