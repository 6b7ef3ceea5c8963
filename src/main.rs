//! LeakWatch - Real-time pipeline leak detection
//!
//! # Usage
//!
//! ```bash
//! # Stream readings (JSON lines) from stdin, decision records to stdout
//! sensor-feed | leakwatch run --model data/model.json
//!
//! # Replay a file and train a first model from its first 500 feature vectors
//! leakwatch run --input readings.jsonl --train-after 500
//!
//! # Offline training, threshold calibration, model summary
//! leakwatch train --input normal.jsonl --output data/model.json --seed 7
//! leakwatch calibrate --input labeled.jsonl --model data/model.json > calibration.json
//! leakwatch info --model data/model.json
//!
//! # Apply the recommended detection threshold
//! leakwatch run --model data/model.json --calibration calibration.json
//! ```
//!
//! # Environment Variables
//!
//! - `LEAKWATCH_CONFIG`: Path to the engine configuration TOML
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use leakwatch::calibration::{calibrate, leak_probability_scores, CalibrationResult};
use leakwatch::config::EngineConfig;
use leakwatch::detector::{AnomalyDetector, TrainingSample};
use leakwatch::features::FeaturePreprocessor;
use leakwatch::pipeline::{
    read_all, DetectionEngine, JsonLinesSink, JsonLinesSource, ProcessingLoop, ReadingSource, TracingSink,
};
use leakwatch::types::{Label, SensorReading};
use leakwatch::valve::SimulatedActuator;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "leakwatch")]
#[command(about = "LeakWatch pipeline leak detection engine")]
#[command(version)]
struct CliArgs {
    /// Engine configuration file (overrides LEAKWATCH_CONFIG and ./leakwatch.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream readings through the detection engine
    Run {
        /// JSON lines reading file (default: stdin)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Model to load (default: [model].path from the config)
        #[arg(long)]
        model: Option<PathBuf>,

        /// Train in the background on the first N feature vectors when no model
        /// is loaded (N defaults to [model].bootstrap_samples)
        #[arg(long, value_name = "N")]
        train_after: Option<Option<usize>>,

        /// Detection threshold on the leak-probability scale, 0-100
        /// (overrides [fusion].detection_threshold)
        #[arg(long, conflicts_with = "calibration")]
        threshold: Option<f64>,

        /// Apply the recommended threshold from a `calibrate` result file
        #[arg(long, value_name = "FILE")]
        calibration: Option<PathBuf>,
    },

    /// Train a model from a JSON lines reading file
    Train {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        output: PathBuf,

        /// Override [forest].seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Sweep detection thresholds over labeled readings
    Calibrate {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        model: Option<PathBuf>,
    },

    /// Print a summary of a persisted model
    Info {
        #[arg(long)]
        model: PathBuf,
    },
}

// ============================================================================
// Helpers
// ============================================================================

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries decision records, so logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(p) => EngineConfig::load_from_file(p)
            .with_context(|| format!("Failed to load configuration from {}", p.display()))?,
        None => EngineConfig::load(),
    };
    config.validate().context("Invalid engine configuration")?;
    Ok(config)
}

fn new_detector(config: &EngineConfig) -> Arc<AnomalyDetector> {
    Arc::new(AnomalyDetector::new(config.forest.clone(), config.detector.clone()))
}

async fn read_readings(path: &Path) -> Result<Vec<SensorReading>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let name = path.display().to_string();
    read_all(tokio::io::BufReader::new(file), &name)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))
}

/// Run readings through a fresh preprocessor, keeping every completed vector.
fn featurize(config: &EngineConfig, readings: &[SensorReading]) -> Vec<TrainingSample> {
    let mut pre = FeaturePreprocessor::new(config.preprocessor.clone());
    let mut samples = Vec::with_capacity(readings.len());
    for reading in readings {
        match pre.process_reading(reading) {
            Ok(Some(features)) => samples.push(TrainingSample {
                features,
                label: reading.label,
            }),
            Ok(None) => {}
            Err(e) => warn!(location = %reading.location, error = %e, "Skipping reading"),
        }
    }
    samples
}

/// Detection threshold from the command line, if one was given.
fn threshold_override(threshold: Option<f64>, calibration: Option<&Path>) -> Result<Option<f64>> {
    if let Some(path) = calibration {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read calibration {}", path.display()))?;
        let result: CalibrationResult = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid calibration file {}", path.display()))?;
        return Ok(Some(result.detection_threshold()));
    }
    if let Some(t) = threshold {
        if !(0.0..=100.0).contains(&t) {
            anyhow::bail!("--threshold must be within 0-100, got {t}");
        }
    }
    Ok(threshold)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{out}");
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

async fn run_stream(
    config: EngineConfig,
    input: Option<PathBuf>,
    model: Option<PathBuf>,
    train_after: Option<Option<usize>>,
    threshold: Option<f64>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let train_after = train_after.map(|n| n.unwrap_or(config.model.bootstrap_samples));
    let detector = new_detector(&config);
    let model_path = model.unwrap_or_else(|| config.model.path.clone());
    if model_path.exists() {
        detector
            .load_model(&model_path)
            .with_context(|| format!("Failed to load model {}", model_path.display()))?;
    } else if train_after.is_none() {
        warn!(path = %model_path.display(), "No model found, decisions use the rule score only");
    }

    let mut engine = DetectionEngine::new(&config, Arc::clone(&detector), Box::new(SimulatedActuator::new()));
    if let Some(t) = threshold {
        info!(threshold = t, "Using detection threshold override");
        engine.set_detection_threshold(t);
    }
    if !detector.is_trained() {
        if let Some(n) = train_after {
            engine = engine.with_bootstrap(n);
        }
    }

    let mut processing = ProcessingLoop::new(engine, cancel_token)
        .with_sink(JsonLinesSink::stdout())
        .with_sink(TracingSink);
    if train_after.is_some() {
        processing = processing.with_model_path(&model_path);
    }

    let mut source: Box<dyn ReadingSource> = match input {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Box::new(JsonLinesSource::new(
                tokio::io::BufReader::new(file),
                path.display().to_string(),
            ))
        }
        None => Box::new(JsonLinesSource::stdin()),
    };

    let (_, stats) = processing.run(source.as_mut()).await;
    if stats.sink_errors > 0 {
        warn!(errors = stats.sink_errors, "Some decision records could not be written");
    }
    Ok(())
}

fn run_train(config: &EngineConfig, readings: &[SensorReading], output: &Path, seed: Option<u64>) -> Result<()> {
    let samples = featurize(config, readings);
    info!(readings = readings.len(), vectors = samples.len(), "Training set prepared");

    let detector = new_detector(config);
    let seed = seed.unwrap_or(config.forest.seed);
    let report = detector.train_with_seed(&samples, seed).context("Training failed")?;

    // Labels, when present, only feed evaluation
    if samples.iter().all(|s| s.label.is_some()) {
        let vectors: Vec<_> = samples.iter().map(|s| s.features).collect();
        let labels: Vec<Label> = samples.iter().filter_map(|s| s.label).collect();
        detector
            .predict_batch(&vectors, Some(&labels))
            .context("Evaluation failed")?;
        if let Some(metrics) = detector.calculate_metrics() {
            info!(
                accuracy = metrics.accuracy,
                precision = metrics.precision,
                recall = metrics.recall,
                f1 = metrics.f1_score,
                "Training set evaluation"
            );
        }
    }

    detector
        .save_model(output)
        .with_context(|| format!("Failed to save model to {}", output.display()))?;
    print_json(&report)
}

fn run_calibrate(config: &EngineConfig, readings: &[SensorReading], model: &Path) -> Result<()> {
    let detector = new_detector(config);
    detector
        .load_model(model)
        .with_context(|| format!("Failed to load model {}", model.display()))?;

    let (scores, labels) = leak_probability_scores(config, &detector, readings).context("Scoring failed")?;
    if scores.is_empty() {
        anyhow::bail!("No labeled readings in input");
    }

    let result = calibrate(&scores, &labels, config.calibration.min_recall)?;
    info!(
        threshold = result.recommended.threshold,
        detection_threshold = result.detection_threshold(),
        precision = result.recommended.precision,
        recall = result.recommended.recall,
        "Recommended threshold"
    );
    print_json(&result)
}

fn run_info(config: &EngineConfig, model: &Path) -> Result<()> {
    let detector = new_detector(config);
    detector
        .load_model(model)
        .with_context(|| format!("Failed to load model {}", model.display()))?;
    print_json(&detector.get_model_info())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.log_json);

    let config = load_config(args.config.as_deref())?;
    info!(site = %config.site.name, "LeakWatch starting");

    match args.command {
        Command::Run {
            input,
            model,
            train_after,
            threshold,
            calibration,
        } => {
            let threshold = threshold_override(threshold, calibration.as_deref())?;
            // Graceful shutdown via Ctrl+C
            let cancel_token = CancellationToken::new();
            let shutdown_token = cancel_token.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Received Ctrl+C, shutting down");
                shutdown_token.cancel();
            });
            run_stream(config, input, model, train_after, threshold, cancel_token).await
        }
        Command::Train { input, output, seed } => {
            let readings = read_readings(&input).await?;
            tokio::task::spawn_blocking(move || run_train(&config, &readings, &output, seed))
                .await
                .context("Training task failed")?
        }
        Command::Calibrate { input, model } => {
            let readings = read_readings(&input).await?;
            let model = model.unwrap_or_else(|| config.model.path.clone());
            run_calibrate(&config, &readings, &model)
        }
        Command::Info { model } => run_info(&config, &model),
    }
}
