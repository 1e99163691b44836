//! Latency recording with HdrHistogram
//!
//! Used by the demo binary and benchmarks to summarize end-to-end message
//! latencies. Not part of the hot path.

use hdrhistogram::Histogram;

/// Nanosecond latency histogram with three significant digits
pub struct LatencyRecorder {
    histogram: Histogram<u64>,
}

impl LatencyRecorder {
    /// Create a recorder
    pub fn new() -> Self {
        Self {
            histogram: Histogram::new(3).expect("histogram with 3 significant digits"),
        }
    }

    /// Record one latency sample in nanoseconds
    #[inline]
    pub fn record(&mut self, nanos: u64) {
        let _ = self.histogram.record(nanos);
    }

    /// Latency at the given percentile (0.0 - 100.0)
    pub fn value_at_percentile(&self, percentile: f64) -> u64 {
        self.histogram.value_at_quantile(percentile / 100.0)
    }

    /// Median latency
    pub fn p50(&self) -> u64 {
        self.value_at_percentile(50.0)
    }

    /// P99 latency
    pub fn p99(&self) -> u64 {
        self.value_at_percentile(99.0)
    }

    /// P99.9 latency
    pub fn p999(&self) -> u64 {
        self.value_at_percentile(99.9)
    }

    /// Maximum recorded latency
    pub fn max(&self) -> u64 {
        self.histogram.max()
    }

    /// Mean latency
    pub fn mean(&self) -> f64 {
        self.histogram.mean()
    }

    /// Number of recorded samples
    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    /// Multi-line percentile summary for console output
    pub fn summary(&self, prefix: &str) -> String {
        format!(
            "{prefix} p50: {} ns | p99: {} ns | p99.9: {} ns | max: {} ns | mean: {:.0} ns",
            self.p50(),
            self.p99(),
            self.p999(),
            self.max(),
            self.mean()
        )
    }
}

impl Default for LatencyRecorder {
    fn default() -> Self {
        Self::new()
    }
}
