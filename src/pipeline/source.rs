//! Reading source abstraction for sensor ingestion.
//!
//! Provides a unified trait for reading sensor readings from different
//! sources: JSON lines over any async reader (stdin, files) and in-memory
//! replay with optional pacing.

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::warn;

use crate::types::SensorReading;

/// Events produced by a reading source.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadingEvent {
    /// A well-formed reading was read.
    Reading(SensorReading),
    /// Source reached end of data.
    Eof,
}

/// Trait abstracting where sensor readings come from.
///
/// Implementations handle format parsing and pacing internally.
/// The processing loop calls [`next_reading`](ReadingSource::next_reading)
/// in a `select!` with cancellation and the valve ticker, so implementations
/// must be cancel-safe: dropping the future must not lose buffered input.
#[async_trait]
pub trait ReadingSource: Send {
    /// Read the next reading from the source.
    ///
    /// Returns `ReadingEvent::Eof` when no more data is available and
    /// `Err` on unrecoverable I/O errors.
    async fn next_reading(&mut self) -> Result<ReadingEvent>;

    /// Human-readable name for logging (e.g. "stdin", "replay").
    fn source_name(&self) -> &str;
}

// ============================================================================
// JSON Lines Source (stdin / file)
// ============================================================================

/// Reads one JSON-encoded [`SensorReading`] per line.
///
/// Blank lines are ignored; malformed lines are logged and skipped.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    name: String,
    line_number: u64,
    skipped: u64,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            lines: reader.lines(),
            name: name.into(),
            line_number: 0,
            skipped: 0,
        }
    }

    /// Lines rejected as malformed so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl JsonLinesSource<tokio::io::BufReader<tokio::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(tokio::io::BufReader::new(tokio::io::stdin()), "stdin")
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> ReadingSource for JsonLinesSource<R> {
    async fn next_reading(&mut self) -> Result<ReadingEvent> {
        loop {
            // next_line keeps partial input across cancellation
            let Some(raw) = self.lines.next_line().await? else {
                return Ok(ReadingEvent::Eof);
            };
            self.line_number += 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<SensorReading>(line) {
                Ok(reading) => return Ok(ReadingEvent::Reading(reading)),
                Err(e) => {
                    self.skipped += 1;
                    warn!(source = %self.name, line = self.line_number, error = %e, "Skipping malformed reading");
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Replay Source (in-memory)
// ============================================================================

/// Replays pre-loaded readings with optional inter-reading delay.
pub struct ReplaySource {
    readings: std::vec::IntoIter<SensorReading>,
    delay_ms: u64,
    yielded_first: bool,
}

impl ReplaySource {
    pub fn new(readings: Vec<SensorReading>, delay_ms: u64) -> Self {
        Self {
            readings: readings.into_iter(),
            delay_ms,
            yielded_first: false,
        }
    }

    /// Readings not yet yielded.
    pub fn remaining(&self) -> usize {
        self.readings.len()
    }
}

#[async_trait]
impl ReadingSource for ReplaySource {
    async fn next_reading(&mut self) -> Result<ReadingEvent> {
        // No delay before the first reading
        if self.yielded_first && self.delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.delay_ms)).await;
        }
        match self.readings.next() {
            Some(r) => {
                self.yielded_first = true;
                Ok(ReadingEvent::Reading(r))
            }
            None => Ok(ReadingEvent::Eof),
        }
    }

    fn source_name(&self) -> &str {
        "replay"
    }
}

/// Read every well-formed reading from a JSON lines reader.
///
/// Used by the offline `train` and `calibrate` commands.
pub async fn read_all<R: AsyncBufRead + Unpin + Send>(reader: R, name: &str) -> Result<Vec<SensorReading>> {
    let mut source = JsonLinesSource::new(reader, name);
    let mut readings = Vec::new();
    while let ReadingEvent::Reading(r) = source.next_reading().await? {
        readings.push(r);
    }
    if source.skipped() > 0 {
        warn!(source = name, skipped = source.skipped(), "Some lines could not be parsed");
    }
    Ok(readings)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUT: &str = concat!(
        r#"{"location":"a","timestamp":"2026-03-02T10:15:00Z","pressure":60.0,"flow":40.0}"#,
        "\n",
        "\n",
        "not json\n",
        r#"{"location":"a","timestamp":"2026-03-02T10:15:01Z","pressure":59.5,"flow":40.2,"label":"normal"}"#,
        "\n",
    );

    #[tokio::test]
    async fn test_json_lines_skip_malformed() {
        let mut source = JsonLinesSource::new(INPUT.as_bytes(), "test");
        let mut readings = Vec::new();
        loop {
            match source.next_reading().await.unwrap() {
                ReadingEvent::Reading(r) => readings.push(r),
                ReadingEvent::Eof => break,
            }
        }
        assert_eq!(readings.len(), 2);
        assert_eq!(source.skipped(), 1);
        assert_eq!(readings[1].pressure, 59.5);
        assert!(readings[1].label.is_some());
        // Eof is sticky
        assert_eq!(source.next_reading().await.unwrap(), ReadingEvent::Eof);
    }

    #[tokio::test]
    async fn test_read_all() {
        let readings = read_all(INPUT.as_bytes(), "test").await.unwrap();
        assert_eq!(readings.len(), 2);
    }

    #[tokio::test]
    async fn test_replay_yields_in_order() {
        let t = chrono::Utc::now();
        let mut source = ReplaySource::new(
            vec![
                SensorReading::new("a", t, 1.0, 1.0),
                SensorReading::new("a", t, 2.0, 1.0),
            ],
            0,
        );
        assert_eq!(source.remaining(), 2);
        let ReadingEvent::Reading(first) = source.next_reading().await.unwrap() else {
            panic!("expected a reading");
        };
        assert_eq!(first.pressure, 1.0);
        assert!(matches!(source.next_reading().await.unwrap(), ReadingEvent::Reading(_)));
        assert_eq!(source.next_reading().await.unwrap(), ReadingEvent::Eof);
    }
}
