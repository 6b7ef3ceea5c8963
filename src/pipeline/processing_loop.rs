//! Async reading processing loop shared by every input mode.
//!
//! Pulls readings from a [`ReadingSource`], runs them through the
//! [`DetectionEngine`], and fans decision records out to the sinks. Between
//! readings an idle tick keeps valve confirmation timeouts running, and a
//! bootstrap model can be trained in the background while ingestion goes on
//! against rule-only decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::engine::DetectionEngine;
use super::sink::DecisionSink;
use super::source::{ReadingEvent, ReadingSource};
use crate::config::defaults::VALVE_TICK_INTERVAL_MS;
use crate::detector::{AnomalyDetector, DetectorError, TrainingReport, TrainingSample};
use crate::types::{DecisionRecord, ValveAction};

type TrainingTask = JoinHandle<Result<TrainingReport, DetectorError>>;

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub readings_received: u64,
    pub readings_rejected: u64,
    pub records_emitted: u64,
    pub detections: u64,
    pub valve_actions: u64,
    pub sink_errors: u64,
    pub models_trained: u64,
}

// ============================================================================
// Processing Loop
// ============================================================================

/// Owns the engine and sinks for one run.
///
/// Built with [`new()`](ProcessingLoop::new), enriched with sinks and options,
/// then consumed by [`run()`](ProcessingLoop::run).
pub struct ProcessingLoop {
    engine: DetectionEngine,
    sinks: Vec<Box<dyn DecisionSink>>,
    cancel_token: CancellationToken,
    model_path: Option<PathBuf>,
    tick_interval: Duration,
    stats: PipelineStats,
    /// Last event timestamp and the instant it was observed.
    clock: Option<(DateTime<Utc>, Instant)>,
}

impl ProcessingLoop {
    pub fn new(engine: DetectionEngine, cancel_token: CancellationToken) -> Self {
        Self {
            engine,
            sinks: Vec::new(),
            cancel_token,
            model_path: None,
            tick_interval: Duration::from_millis(VALVE_TICK_INTERVAL_MS),
            stats: PipelineStats::default(),
            clock: None,
        }
    }

    pub fn with_sink(mut self, sink: impl DecisionSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Save bootstrap-trained models here.
    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Run until the source is exhausted or cancellation.
    ///
    /// A background training task still running at that point is awaited so
    /// its model is not lost. Returns the engine and the final statistics.
    pub async fn run<S: ReadingSource + ?Sized>(mut self, source: &mut S) -> (DetectionEngine, PipelineStats) {
        info!(source = source.source_name(), sinks = self.sinks.len(), "Processing readings");

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut training: Option<TrainingTask> = None;

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
                result = join_training(&mut training), if training.is_some() => {
                    training = None;
                    self.finish_training(result);
                }
                _ = ticker.tick() => {
                    if let Some(now) = self.event_clock() {
                        let records = self.engine.tick(now);
                        self.emit_all(&records);
                    }
                }
                result = source.next_reading() => {
                    let event = match result {
                        Ok(ev) => ev,
                        Err(e) => {
                            warn!(error = %e, "Source error");
                            break;
                        }
                    };
                    match event {
                        ReadingEvent::Reading(reading) => {
                            self.stats.readings_received += 1;
                            self.clock = Some((reading.timestamp, Instant::now()));
                            match self.engine.process_reading(&reading) {
                                Ok(record) => self.emit_all(std::slice::from_ref(&record)),
                                Err(e) => {
                                    self.stats.readings_rejected += 1;
                                    warn!(location = %reading.location, error = %e, "Reading rejected");
                                }
                            }
                            if training.is_none() {
                                if let Some(batch) = self.engine.take_bootstrap_batch() {
                                    training = Some(spawn_training(Arc::clone(self.engine.detector()), batch));
                                }
                            }
                        }
                        ReadingEvent::Eof => {
                            info!(readings = self.stats.readings_received, "Source reached end");
                            break;
                        }
                    }
                }
            }
        }

        if let Some(task) = training.take() {
            info!("Waiting for background training to finish");
            let result = task.await;
            self.finish_training(result);
        }

        for sink in &mut self.sinks {
            if let Err(e) = sink.flush() {
                warn!(sink = sink.sink_name(), error = %e, "Sink flush failed");
            }
        }

        let s = &self.stats;
        info!(
            readings = s.readings_received,
            rejected = s.readings_rejected,
            records = s.records_emitted,
            detections = s.detections,
            valve_actions = s.valve_actions,
            models_trained = s.models_trained,
            "Processing finished"
        );
        (self.engine, self.stats)
    }

    /// Event time advanced by the wall-clock time since the last reading,
    /// so replayed data times out the same way live data does.
    fn event_clock(&self) -> Option<DateTime<Utc>> {
        let (last, seen) = self.clock?;
        let elapsed = chrono::Duration::from_std(seen.elapsed()).ok()?;
        Some(last + elapsed)
    }

    fn emit_all(&mut self, records: &[DecisionRecord]) {
        for record in records {
            self.stats.records_emitted += 1;
            if record.detected {
                self.stats.detections += 1;
            }
            if record.valve_action != ValveAction::None {
                self.stats.valve_actions += 1;
            }
            for sink in &mut self.sinks {
                if let Err(e) = sink.emit(record) {
                    self.stats.sink_errors += 1;
                    warn!(sink = sink.sink_name(), error = %e, "Sink rejected decision record");
                }
            }
        }
    }

    fn finish_training(&mut self, result: Result<Result<TrainingReport, DetectorError>, tokio::task::JoinError>) {
        match result {
            Ok(Ok(report)) => {
                self.stats.models_trained += 1;
                info!(
                    samples = report.sample_count,
                    trees = report.tree_count,
                    training_time_ms = report.training_time_ms,
                    "Bootstrap model active"
                );
                if let Some(path) = &self.model_path {
                    if let Err(e) = self.engine.detector().save_model(path) {
                        warn!(path = %path.display(), error = %e, "Failed to save bootstrap model");
                    }
                }
            }
            Ok(Err(e)) => warn!(error = %e, "Bootstrap training failed, collecting a new batch"),
            Err(e) => error!(error = %e, "Bootstrap training task panicked"),
        }
    }
}

fn spawn_training(detector: Arc<AnomalyDetector>, batch: Vec<TrainingSample>) -> TrainingTask {
    info!(samples = batch.len(), "Starting background training");
    tokio::task::spawn_blocking(move || detector.train(&batch))
}

async fn join_training(
    task: &mut Option<TrainingTask>,
) -> Result<Result<TrainingReport, DetectorError>, tokio::task::JoinError> {
    match task.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
