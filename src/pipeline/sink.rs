//! Decision sinks: where decision records go once emitted.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{DecisionRecord, Severity, ValveAction};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write decision record: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode decision record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Consumer of decision records.
pub trait DecisionSink: Send {
    fn emit(&mut self, record: &DecisionRecord) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn sink_name(&self) -> &str;
}

// ============================================================================
// JSON Lines Sink
// ============================================================================

/// Writes one camelCase JSON record per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> DecisionSink for JsonLinesSink<W> {
    fn emit(&mut self, record: &DecisionRecord) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "json-lines"
    }
}

// ============================================================================
// Memory Sink
// ============================================================================

/// Bounded ring buffer of the most recent records.
///
/// Clones share the buffer, so a handle kept by the caller sees records
/// emitted through a clone owned by the processing loop.
#[derive(Debug, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<VecDeque<DecisionRecord>>>,
    capacity: usize,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the buffered records, oldest first.
    pub fn records(&self) -> Vec<DecisionRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<DecisionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(crate::config::defaults::MEMORY_SINK_CAPACITY)
    }
}

impl DecisionSink for MemorySink {
    fn emit(&mut self, record: &DecisionRecord) -> Result<(), SinkError> {
        let mut records = self.lock();
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record.clone());
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// Tracing Sink
// ============================================================================

/// Logs records as structured events.
///
/// Detections and valve actions log at `info`/`warn`; quiet readings at `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DecisionSink for TracingSink {
    fn emit(&mut self, r: &DecisionRecord) -> Result<(), SinkError> {
        if r.valve_action != ValveAction::None {
            warn!(
                location = %r.location,
                action = ?r.valve_action,
                severity = %r.severity,
                leak_probability = r.leak_probability,
                "Valve action"
            );
        } else if r.detected || r.severity >= Severity::High {
            info!(
                location = %r.location,
                severity = %r.severity,
                leak_probability = r.leak_probability,
                ml_score = r.ml_score,
                rule_score = r.rule_score,
                "Leak detected"
            );
        } else {
            debug!(location = %r.location, leak_probability = r.leak_probability, "Decision");
        }
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "tracing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DetectionDecision;
    use chrono::Utc;

    fn record(p: f64) -> DecisionRecord {
        let decision = DetectionDecision {
            leak_probability: p,
            severity: Severity::from_probability(p),
            rule_score: p,
            ml_score: 0.0,
            confidence: 50.0,
            detected: p > 50.0,
        };
        DecisionRecord::new("a", Utc::now(), &decision, ValveAction::None)
    }

    #[test]
    fn test_json_lines_one_record_per_line() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.emit(&record(10.0)).unwrap();
        sink.emit(&record(90.0)).unwrap();
        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: DecisionRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.leak_probability, 90.0);
        assert!(lines[0].contains("\"leakProbability\""));
        assert!(lines[0].contains("\"valveAction\":\"none\""));
    }

    #[test]
    fn test_memory_sink_is_bounded() {
        let handle = MemorySink::new(3);
        let mut sink = handle.clone();
        for i in 0..5 {
            sink.emit(&record(f64::from(i))).unwrap();
        }
        let records = handle.records();
        assert_eq!(records.len(), 3);
        // Oldest evicted first
        assert_eq!(records[0].leak_probability, 2.0);
        assert_eq!(records[2].leak_probability, 4.0);
    }
}
