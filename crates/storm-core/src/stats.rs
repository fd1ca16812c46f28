use crate::transport::{FailureClass, Outcome};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Highest latency tracked at full precision: one hour in microseconds.
/// Larger samples saturate into the top bucket.
const MAX_TRACKED_MICROS: u64 = 3_600_000_000;
const SIGNIFICANT_FIGURES: u8 = 3;

/// Latency distribution in microseconds. Bounded memory regardless of run
/// length; min, max and mean are tracked exactly next to the hdr buckets.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
    sum_micros: u128,
    min_micros: u64,
    max_micros: u64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            histogram: Histogram::new_with_bounds(1, MAX_TRACKED_MICROS, SIGNIFICANT_FIGURES)
                .expect("static histogram bounds are valid"),
            sum_micros: 0,
            min_micros: u64::MAX,
            max_micros: 0,
        }
    }

    pub fn record(&mut self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.histogram.saturating_record(micros);
        self.sum_micros += micros as u128;
        self.min_micros = self.min_micros.min(micros);
        self.max_micros = self.max_micros.max(micros);
    }

    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    /// Estimated latency at percentile `p` (0..=100), in microseconds.
    pub fn percentile(&self, p: f64) -> u64 {
        if self.histogram.is_empty() {
            return 0;
        }
        let quantile = p.clamp(0.0, 100.0) / 100.0;
        self.histogram
            .value_at_quantile(quantile)
            .clamp(self.min_micros, self.max_micros)
    }

    pub fn summary(&self) -> LatencySummary {
        let count = self.count();
        if count == 0 {
            return LatencySummary::default();
        }
        LatencySummary {
            count,
            mean_micros: (self.sum_micros / count as u128) as u64,
            min_micros: self.min_micros,
            max_micros: self.max_micros,
            p50_micros: self.percentile(50.0),
            p90_micros: self.percentile(90.0),
            p95_micros: self.percentile(95.0),
            p99_micros: self.percentile(99.0),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounts {
    pub timeout: u64,
    pub connection: u64,
    pub request: u64,
    pub redirect: u64,
    pub body: u64,
    pub http_status: u64,
    pub other: u64,
    pub aborted: u64,
}

impl FailureCounts {
    pub fn total(&self) -> u64 {
        self.timeout
            + self.connection
            + self.request
            + self.redirect
            + self.body
            + self.http_status
            + self.other
            + self.aborted
    }

    fn slot(&mut self, class: FailureClass) -> &mut u64 {
        match class {
            FailureClass::Timeout => &mut self.timeout,
            FailureClass::Connection => &mut self.connection,
            FailureClass::Request => &mut self.request,
            FailureClass::Redirect => &mut self.redirect,
            FailureClass::Body => &mut self.body,
            FailureClass::HttpStatus => &mut self.http_status,
            FailureClass::Other => &mut self.other,
            FailureClass::Aborted => &mut self.aborted,
        }
    }

    fn bump(&mut self, class: FailureClass) {
        *self.slot(class) += 1;
    }

    pub fn get(&self, class: FailureClass) -> u64 {
        let mut counts = *self;
        *counts.slot(class)
    }

    /// Non-zero classes, most frequent first.
    pub fn breakdown(&self) -> Vec<(FailureClass, u64)> {
        let mut classes: Vec<_> = FailureClass::ALL
            .iter()
            .map(|&class| (class, self.get(class)))
            .filter(|&(_, count)| count > 0)
            .collect();
        classes.sort_by(|a, b| b.1.cmp(&a.1));
        classes
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_micros: u64,
    pub min_micros: u64,
    pub max_micros: u64,
    pub p50_micros: u64,
    pub p90_micros: u64,
    pub p95_micros: u64,
    pub p99_micros: u64,
}

/// Plain, single-owner accumulator. [`StatsAggregator`] wraps it for
/// concurrent use.
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    pub attempts: u64,
    pub successes: u64,
    pub failures: FailureCounts,
    pub status_codes: BTreeMap<u16, u64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    latency: LatencyHistogram,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one outcome in. Latency is only sampled for attempts that got a
    /// response; transport failures would skew it toward the timeout.
    pub fn record(&mut self, outcome: &Outcome) {
        self.attempts += 1;
        match outcome.failure_class() {
            None => self.successes += 1,
            Some(class) => self.failures.bump(class),
        }

        if let Some(status) = outcome.status {
            *self.status_codes.entry(status).or_insert(0) += 1;
            self.latency.record(outcome.latency);
        }

        self.bytes_sent += outcome.bytes_sent;
        self.bytes_received += outcome.bytes_received;
    }

    pub fn summary(&self, elapsed: Duration) -> StatsSnapshot {
        StatsSnapshot {
            elapsed_ms: elapsed.as_millis() as u64,
            attempts: self.attempts,
            successes: self.successes,
            failures: self.failures,
            status_codes: self.status_codes.clone(),
            latency: self.latency.summary(),
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
        }
    }
}

/// Thread-safe statistics sink shared by all workers.
///
/// Each `record` is a single short critical section, so a `snapshot` sees
/// either all or none of any given outcome.
pub struct StatsAggregator {
    inner: Mutex<StatsCollector>,
    start_time: Instant,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsCollector::new()),
            start_time: Instant::now(),
        }
    }

    pub fn record(&self, outcome: &Outcome) {
        self.lock().record(outcome);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        // Percentiles are derived after the lock is released.
        let (collector, elapsed) = {
            let guard = self.lock();
            (guard.clone(), self.start_time.elapsed())
        };
        collector.summary(elapsed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsCollector> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable point-in-time copy of the run's statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub elapsed_ms: u64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: FailureCounts,
    pub status_codes: BTreeMap<u16, u64>,
    pub latency: LatencySummary,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl StatsSnapshot {
    pub fn failed(&self) -> u64 {
        self.failures.total()
    }

    /// `attempts == successes + failures`; holds for every snapshot taken.
    pub fn is_consistent(&self) -> bool {
        self.attempts == self.successes + self.failed()
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 * 100.0 / self.attempts as f64
    }

    /// Attempts per second over the whole run.
    pub fn average_rps(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        self.attempts as f64 * 1000.0 / self.elapsed_ms as f64
    }

    /// Attempts per second between `previous` and this snapshot.
    pub fn rate_since(&self, previous: &StatsSnapshot) -> f64 {
        let window_ms = self.elapsed_ms.saturating_sub(previous.elapsed_ms);
        if window_ms == 0 {
            return 0.0;
        }
        self.attempts.saturating_sub(previous.attempts) as f64 * 1000.0 / window_ms as f64
    }
}
