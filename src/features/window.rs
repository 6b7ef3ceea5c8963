//! Time-bounded rolling window

use chrono::{DateTime, TimeDelta, Utc};
use statrs::statistics::Statistics;
use std::collections::VecDeque;

/// Samples from the last `span` of time, capped at `max_samples`.
///
/// A sample is evicted once it is `span` or more older than the newest one.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    span: TimeDelta,
    max_samples: usize,
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl RollingWindow {
    pub fn new(span_secs: u64, max_samples: usize) -> Self {
        let span = i64::try_from(span_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        Self {
            span,
            max_samples: max_samples.max(1),
            samples: VecDeque::with_capacity(max_samples.min(1024)),
        }
    }

    pub fn push(&mut self, at: DateTime<Utc>, value: f64) {
        self.samples.push_back((at, value));
        while let Some(&(oldest, _)) = self.samples.front() {
            if at - oldest >= self.span {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Arithmetic mean, 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|(_, v)| *v).mean()
    }

    /// Sample standard deviation (n − 1), 0 with fewer than two samples.
    pub fn std_dev(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        self.samples.iter().map(|(_, v)| *v).std_dev()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
