//! Query counters and response-time tracking.
//!
//! Counters are relaxed atomics; no ordering between them matters. Response
//! times go into a bounded reservoir behind its own lock, compacted by
//! dropping the oldest half-cap whenever it fills. Quantiles come from a
//! sorted copy at snapshot time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub const DEFAULT_RESERVOIR_CAP: usize = 10_000;
pub const DEFAULT_RESERVOIR_TRIM: usize = 5_000;

pub struct ServerStats {
    total_queries: AtomicU64,
    cache_hits: AtomicU64,
    local_domain_hits: AtomicU64,
    response_times: Mutex<Vec<f64>>,
    reservoir_cap: usize,
    reservoir_trim: usize,
}

/// Point-in-time view of the server counters. Response times are in
/// milliseconds; local-domain hits are not part of the samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceStats {
    pub total_queries: u64,
    pub cache_hits: u64,
    pub local_domain_hits: u64,
    pub hit_ratio: f64,
    pub avg_response_ms: f64,
    pub p95_response_ms: f64,
    pub p99_response_ms: f64,
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVOIR_CAP, DEFAULT_RESERVOIR_TRIM)
    }
}

impl ServerStats {
    pub fn new(reservoir_cap: usize, reservoir_trim: usize) -> Self {
        Self {
            total_queries: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            local_domain_hits: AtomicU64::new(0),
            response_times: Mutex::new(Vec::new()),
            reservoir_cap,
            reservoir_trim,
        }
    }

    pub fn record_query(&self) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_hit(&self) {
        self.local_domain_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Append one served-query latency. When the reservoir exceeds its cap,
    /// the oldest `reservoir_trim` samples go in a single compaction.
    pub fn record_response_time(&self, elapsed_ms: f64) {
        let mut times = self
            .response_times
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        times.push(elapsed_ms);
        if times.len() > self.reservoir_cap {
            times.drain(..self.reservoir_trim);
        }
    }

    pub fn snapshot(&self) -> PerformanceStats {
        let total_queries = self.total_queries.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let local_domain_hits = self.local_domain_hits.load(Ordering::Relaxed);

        let hit_ratio = if total_queries > 0 {
            (cache_hits + local_domain_hits) as f64 / total_queries as f64
        } else {
            0.0
        };

        let mut stats = PerformanceStats {
            total_queries,
            cache_hits,
            local_domain_hits,
            hit_ratio,
            ..PerformanceStats::default()
        };

        let times = self
            .response_times
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !times.is_empty() {
            let mut sorted = times.clone();
            drop(times);
            sorted.sort_unstable_by(|a, b| a.total_cmp(b));

            let n = sorted.len();
            stats.avg_response_ms = sorted.iter().sum::<f64>() / n as f64;
            stats.p95_response_ms = sorted[((n as f64 * 0.95) as usize).min(n - 1)];
            stats.p99_response_ms = sorted[((n as f64 * 0.99) as usize).min(n - 1)];
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio_counts_both_fast_paths() {
        let stats = ServerStats::default();
        for _ in 0..4 {
            stats.record_query();
        }
        stats.record_cache_hit();
        stats.record_local_hit();

        let snap = stats.snapshot();
        assert_eq!(snap.total_queries, 4);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.local_domain_hits, 1);
        assert!((snap.hit_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn hit_ratio_is_zero_safe() {
        let snap = ServerStats::default().snapshot();
        assert_eq!(snap.hit_ratio, 0.0);
        assert_eq!(snap.avg_response_ms, 0.0);
    }

    #[test]
    fn quantiles_come_from_the_sorted_samples() {
        let stats = ServerStats::default();
        for v in 1..=100 {
            stats.record_response_time(v as f64);
        }
        let snap = stats.snapshot();
        assert!((snap.avg_response_ms - 50.5).abs() < 1e-9);
        // floor(0.95 * 100) = index 95 -> value 96, same shape for p99.
        assert_eq!(snap.p95_response_ms, 96.0);
        assert_eq!(snap.p99_response_ms, 100.0);
    }

    #[test]
    fn single_sample_clamps_both_quantiles() {
        let stats = ServerStats::default();
        stats.record_response_time(7.5);
        let snap = stats.snapshot();
        assert_eq!(snap.p95_response_ms, 7.5);
        assert_eq!(snap.p99_response_ms, 7.5);
    }

    #[test]
    fn reservoir_compacts_by_dropping_the_oldest_half() {
        let stats = ServerStats::new(10, 5);
        for v in 0..11 {
            stats.record_response_time(v as f64);
        }
        let times = stats.response_times.lock().unwrap();
        // Pushing the 11th sample trimmed 0..=4, leaving 5..=10.
        assert_eq!(times.as_slice(), &[5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
    }
}
