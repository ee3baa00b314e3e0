// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Counters describing the telemetry pipeline itself.
//!
//! Lightweight and lock-free apart from the export latency histogram.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::lock;

/// Simple histogram with fixed buckets for latency tracking.
#[derive(Debug, Clone)]
pub struct Histogram {
    /// Bucket boundaries in microseconds.
    buckets: Vec<u64>,

    /// Count per bucket, plus one overflow bucket.
    counts: Vec<u64>,
}

impl Histogram {
    /// Create a histogram with custom bucket boundaries (in microseconds).
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = vec![0; buckets.len() + 1];
        Self { buckets, counts }
    }

    pub fn record(&mut self, duration: Duration) {
        let micros = duration.as_micros() as u64;
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| micros <= b)
            .unwrap_or(self.buckets.len());
        self.counts[bucket_idx] += 1;
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Approximate percentile, reported as the upper bound of its bucket.
    pub fn percentile(&self, p: f64) -> Duration {
        let total = self.total();
        if total == 0 {
            return Duration::ZERO;
        }

        let target = (total as f64 * p / 100.0).ceil() as u64;
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                let micros = if i < self.buckets.len() {
                    self.buckets[i]
                } else {
                    self.buckets.last().copied().unwrap_or(0) * 10
                };
                return Duration::from_micros(micros);
            }
        }

        Duration::ZERO
    }

    pub fn p50(&self) -> Duration {
        self.percentile(50.0)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(99.0)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // 1ms, 10ms, 100ms, 1s, 10s
        Self::with_buckets(vec![1_000, 10_000, 100_000, 1_000_000, 10_000_000])
    }
}

/// Pipeline counters owned by one telemetry system.
#[derive(Debug)]
pub struct TelemetryStats {
    spans_started: AtomicU64,
    spans_unsampled: AtomicU64,
    spans_finished: AtomicU64,
    spans_evicted: AtomicU64,
    spans_abandoned: AtomicU64,
    spans_exported: AtomicU64,
    export_batches: AtomicU64,
    export_failures: AtomicU64,
    export_latency: Mutex<Histogram>,
    start_time: Instant,
}

impl TelemetryStats {
    pub fn new() -> Self {
        Self {
            spans_started: AtomicU64::new(0),
            spans_unsampled: AtomicU64::new(0),
            spans_finished: AtomicU64::new(0),
            spans_evicted: AtomicU64::new(0),
            spans_abandoned: AtomicU64::new(0),
            spans_exported: AtomicU64::new(0),
            export_batches: AtomicU64::new(0),
            export_failures: AtomicU64::new(0),
            export_latency: Mutex::new(Histogram::default()),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn span_started(&self, sampled: bool) {
        self.spans_started.fetch_add(1, Ordering::Relaxed);
        if !sampled {
            self.spans_unsampled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn span_finished(&self) {
        self.spans_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn spans_evicted(&self, count: u64) {
        self.spans_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn span_abandoned(&self) {
        self.spans_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn export_attempted(&self, spans: u64, elapsed: Duration, success: bool) {
        self.export_batches.fetch_add(1, Ordering::Relaxed);
        if success {
            self.spans_exported.fetch_add(spans, Ordering::Relaxed);
        } else {
            self.export_failures.fetch_add(1, Ordering::Relaxed);
        }
        lock(&self.export_latency).record(elapsed);
    }

    pub fn snapshot(&self) -> TelemetryStatsSnapshot {
        TelemetryStatsSnapshot {
            spans_started: self.spans_started.load(Ordering::Relaxed),
            spans_unsampled: self.spans_unsampled.load(Ordering::Relaxed),
            spans_finished: self.spans_finished.load(Ordering::Relaxed),
            spans_evicted: self.spans_evicted.load(Ordering::Relaxed),
            spans_abandoned: self.spans_abandoned.load(Ordering::Relaxed),
            spans_exported: self.spans_exported.load(Ordering::Relaxed),
            export_batches: self.export_batches.load(Ordering::Relaxed),
            export_failures: self.export_failures.load(Ordering::Relaxed),
            export_latency: lock(&self.export_latency).clone(),
            uptime: self.start_time.elapsed(),
        }
    }
}

impl Default for TelemetryStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`TelemetryStats`].
#[derive(Debug, Clone)]
pub struct TelemetryStatsSnapshot {
    pub spans_started: u64,
    pub spans_unsampled: u64,
    pub spans_finished: u64,
    pub spans_evicted: u64,
    pub spans_abandoned: u64,
    /// Spans in batches the sink accepted
    pub spans_exported: u64,
    pub export_batches: u64,
    pub export_failures: u64,
    pub export_latency: Histogram,
    pub uptime: Duration,
}

impl TelemetryStatsSnapshot {
    /// Format as a human-readable report.
    pub fn format_report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Telemetry Report ===\n\n");
        report.push_str(&format!("Uptime: {:.2?}\n", self.uptime));
        report.push_str(&format!(
            "Spans: {} started, {} not sampled, {} finished\n",
            self.spans_started, self.spans_unsampled, self.spans_finished
        ));
        report.push_str(&format!(
            "Dropped: {} evicted, {} abandoned\n",
            self.spans_evicted, self.spans_abandoned
        ));
        report.push_str(&format!(
            "Export: {} spans in {} batches, {} failures\n",
            self.spans_exported, self.export_batches, self.export_failures
        ));
        if self.export_latency.total() > 0 {
            report.push_str(&format!(
                "Export latency: p50 {:.2?}, p99 {:.2?}\n",
                self.export_latency.p50(),
                self.export_latency.p99()
            ));
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let mut hist = Histogram::default();
        hist.record(Duration::from_micros(500)); // <=1ms
        hist.record(Duration::from_millis(5)); // <=10ms
        hist.record(Duration::from_secs(60)); // overflow

        assert_eq!(hist.counts()[0], 1);
        assert_eq!(hist.counts()[1], 1);
        assert_eq!(hist.counts()[5], 1);
        assert_eq!(hist.total(), 3);
    }

    #[test]
    fn test_histogram_percentiles() {
        let mut hist = Histogram::default();
        for _ in 0..100 {
            hist.record(Duration::from_micros(500));
        }

        assert_eq!(hist.p50(), Duration::from_millis(1));
        assert_eq!(hist.p99(), Duration::from_millis(1));
        assert_eq!(Histogram::default().p50(), Duration::ZERO);
    }

    #[test]
    fn test_stats_counters() {
        let stats = TelemetryStats::new();
        stats.span_started(true);
        stats.span_started(false);
        stats.span_finished();
        stats.spans_evicted(2);
        stats.export_attempted(5, Duration::from_millis(3), true);
        stats.export_attempted(4, Duration::from_millis(3), false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.spans_started, 2);
        assert_eq!(snapshot.spans_unsampled, 1);
        assert_eq!(snapshot.spans_finished, 1);
        assert_eq!(snapshot.spans_evicted, 2);
        assert_eq!(snapshot.spans_exported, 5);
        assert_eq!(snapshot.export_batches, 2);
        assert_eq!(snapshot.export_failures, 1);
    }

    #[test]
    fn test_format_report() {
        let stats = TelemetryStats::new();
        stats.span_started(true);
        stats.export_attempted(1, Duration::from_millis(2), true);

        let report = stats.snapshot().format_report();
        assert!(report.contains("1 started"));
        assert!(report.contains("Export latency"));
    }
}
