//! Engine Configuration Module
//!
//! Provides the engine configuration loaded from TOML files. Every detection
//! constant (window sizes, forest hyperparameters, fusion weights, valve
//! timing) is an operator-tunable value with a built-in default.
//!
//! ## Loading Order
//!
//! 1. `LEAKWATCH_CONFIG` environment variable (path to TOML file)
//! 2. `leakwatch.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! The config is loaded once by the binary and handed to each component:
//!
//! ```ignore
//! let config = EngineConfig::load();
//! let detector = AnomalyDetector::new(config.forest.clone(), config.detector.clone());
//! let fusion = FusionEngine::new(config.fusion.clone());
//! ```

mod engine_config;
pub mod defaults;
pub mod validation;

pub use engine_config::*;
