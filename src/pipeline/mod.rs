//! Processing Pipeline Module
//!
//! ## Architecture
//!
//! ```text
//! ReadingSource ──▶ ProcessingLoop ──▶ DetectionEngine ──▶ DecisionSink(s)
//!  (JSON lines,      (select! over       (features → ML →      (JSON lines,
//!   replay)           source, ticks,      fusion → valve)       memory, tracing)
//!                     training, cancel)
//! ```
//!
//! Each reading is processed to completion before the next one is read.
//! Bootstrap training runs on the blocking pool while ingestion continues
//! against the previous model snapshot (or rule-only fusion).

mod engine;
mod sink;
pub mod processing_loop;
pub mod source;

pub use engine::DetectionEngine;
pub use processing_loop::{PipelineStats, ProcessingLoop};
pub use sink::{DecisionSink, JsonLinesSink, MemorySink, SinkError, TracingSink};
pub use source::{read_all, JsonLinesSource, ReadingEvent, ReadingSource, ReplaySource};
