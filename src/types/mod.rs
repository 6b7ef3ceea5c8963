//! Shared data structures for the leak detection pipeline
//!
//! This module defines the types that cross module boundaries:
//! - SensorReading: one field observation for a monitored location
//! - Label: optional ground truth carried by training/calibration files
//! - DetectionDecision: fused output of the rule and ML scores
//! - DecisionRecord: the serialized per-reading output contract

mod reading;
mod decision;

pub use reading::*;
pub use decision::*;
