//! In-memory latency histogram for sync instrumentation.
//! Records full markets-read durations, request sent to body parsed.

use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct LatencyPercentiles {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Shared fetch-latency stats. The fetch runner records, API reads.
/// Values stored in microseconds.
pub struct SyncLatency {
    inner: Mutex<hdrhistogram::Histogram<u64>>,
}

impl SyncLatency {
    /// Tracks 1us to 120s, 3 significant figures.
    pub fn new() -> Self {
        let histogram = hdrhistogram::Histogram::new_with_bounds(1, 120_000_000, 3)
            .expect("valid histogram bounds");
        Self {
            inner: Mutex::new(histogram),
        }
    }

    pub fn record(&self, d: Duration) {
        let us = d.as_micros().min(u128::from(u64::MAX)) as u64;
        if let Ok(mut h) = self.inner.lock() {
            let _ = h.record(us.max(1));
        }
    }

    /// None until at least one fetch has been recorded.
    pub fn percentiles(&self) -> Option<LatencyPercentiles> {
        let h = self.inner.lock().ok()?;
        if h.len() == 0 {
            return None;
        }
        Some(LatencyPercentiles {
            p50_ms: h.value_at_quantile(0.5) as f64 / 1000.0,
            p95_ms: h.value_at_quantile(0.95) as f64 / 1000.0,
            p99_ms: h.value_at_quantile(0.99) as f64 / 1000.0,
        })
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SyncLatency {
    fn default() -> Self {
        Self::new()
    }
}
