//! Rolling performance samples.
//!
//! Each tier records `(operation, duration, k)` samples into a bounded
//! ring; the adaptive selector reads the rolling average to decide whether
//! to emit upgrade advice after slow searches.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Ring capacity per tracker.
const WINDOW: usize = 128;

/// One timed operation.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceSample {
    /// Duration of the operation in milliseconds.
    pub duration_ms: f64,
    /// Requested `k` (0 for non-search operations).
    pub k: usize,
    /// Wall-clock timestamp in milliseconds since the Unix epoch.
    pub ts_ms: u64,
}

/// Aggregated view over the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    /// Number of samples in the window.
    pub count: usize,
    /// Mean duration in milliseconds.
    pub avg_ms: f64,
    /// 95th percentile duration in milliseconds.
    pub p95_ms: f64,
}

/// Bounded rolling sample window for one operation kind.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    samples: Mutex<VecDeque<PerformanceSample>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample, evicting the oldest when the window is full.
    pub fn record(&self, duration_ms: f64, k: usize, ts_ms: u64) {
        let mut samples = self.samples.lock();
        if samples.len() == WINDOW {
            samples.pop_front();
        }
        samples.push_back(PerformanceSample {
            duration_ms,
            k,
            ts_ms,
        });
    }

    /// Aggregate the current window.
    pub fn stats(&self) -> LatencyStats {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return LatencyStats::default();
        }
        let mut durations: Vec<f64> = samples.iter().map(|s| s.duration_ms).collect();
        durations.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let sum: f64 = durations.iter().sum();
        let p95_idx = ((durations.len() as f64) * 0.95).ceil() as usize;
        let p95_idx = p95_idx.clamp(1, durations.len()) - 1;
        LatencyStats {
            count: durations.len(),
            avg_ms: sum / durations.len() as f64,
            p95_ms: durations[p95_idx],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stats() {
        let t = LatencyTracker::new();
        assert_eq!(t.stats(), LatencyStats::default());
    }

    #[test]
    fn test_average() {
        let t = LatencyTracker::new();
        t.record(10.0, 5, 0);
        t.record(20.0, 5, 1);
        t.record(30.0, 5, 2);
        let s = t.stats();
        assert_eq!(s.count, 3);
        assert!((s.avg_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_eviction() {
        let t = LatencyTracker::new();
        for i in 0..(WINDOW + 10) {
            t.record(i as f64, 1, i as u64);
        }
        let s = t.stats();
        assert_eq!(s.count, WINDOW);
        // Oldest 10 samples evicted: minimum duration in window is 10.0
        assert!(s.avg_ms > 10.0);
    }

    #[test]
    fn test_p95_dominated_by_tail() {
        let t = LatencyTracker::new();
        for _ in 0..95 {
            t.record(1.0, 1, 0);
        }
        for _ in 0..5 {
            t.record(100.0, 1, 0);
        }
        let s = t.stats();
        assert!(s.p95_ms >= 1.0);
        assert!(s.p95_ms <= 100.0);
        assert!(s.avg_ms > 1.0);
    }
}
