//! Per-connection fetch-rate estimation.
//!
//! Each connection keeps a short circular history of `(count, elapsed)`
//! samples. The estimate is a weighted average of the samples' instantaneous
//! rates, newest first. Buckets that have never been filled count at the
//! default rate, so early estimates move toward observed rates gradually.

use std::collections::HashMap;
use std::sync::Mutex;

use super::lock;

/// Default weights, most recent sample first.
pub const DEFAULT_WEIGHTS: [f64; 5] = [0.5, 0.25, 0.125, 0.0625, 0.0625];

/// Default rate (docs/minute) for connections with no history.
pub const DEFAULT_FETCH_RATE: f64 = 900.0;

#[derive(Debug, Clone)]
struct RateHistory {
    /// Instantaneous rates; `None` for buckets never written.
    samples: Vec<Option<f64>>,
    /// Slot the next sample lands in.
    next: usize,
}

impl RateHistory {
    fn new(size: usize) -> Self {
        Self {
            samples: vec![None; size],
            next: 0,
        }
    }

    fn push(&mut self, rate: f64) {
        let len = self.samples.len();
        self.samples[self.next] = Some(rate);
        self.next = (self.next + 1) % len;
    }

    fn weighted_rate(&self, weights: &[f64], default_rate: f64) -> f64 {
        let len = self.samples.len();
        let mut total = 0.0;
        let mut weight_sum = 0.0;
        for (age, weight) in weights.iter().enumerate() {
            // Newest sample sits just behind `next`.
            let slot = (self.next + len - 1 - age) % len;
            let rate = self.samples[slot].unwrap_or(default_rate);
            total += rate * weight;
            weight_sum += weight;
        }
        if weight_sum > 0.0 {
            total / weight_sum
        } else {
            default_rate
        }
    }
}

/// Weighted moving average of documents per minute, per connection.
#[derive(Debug)]
pub struct PerformanceStatistics {
    weights: Vec<f64>,
    default_rate: f64,
    histories: Mutex<HashMap<String, RateHistory>>,
}

impl PerformanceStatistics {
    pub fn new() -> Self {
        Self::with_weights(DEFAULT_WEIGHTS.to_vec(), DEFAULT_FETCH_RATE)
    }

    /// Build with a custom weight schedule; the history holds one bucket per weight.
    pub fn with_weights(weights: Vec<f64>, default_rate: f64) -> Self {
        let weights = if weights.is_empty() {
            DEFAULT_WEIGHTS.to_vec()
        } else {
            weights
        };
        Self {
            weights,
            default_rate,
            histories: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `doc_count` documents took `elapsed_ms` to fetch.
    pub fn record_completion(&self, connection_name: &str, doc_count: usize, elapsed_ms: u64) {
        // Zero-length samples carry no timing information.
        let elapsed = elapsed_ms.max(1) as f64;
        let rate = 60_000.0 * doc_count as f64 / elapsed;

        let mut histories = lock(&self.histories);
        let size = self.weights.len();
        histories
            .entry(connection_name.to_string())
            .or_insert_with(|| RateHistory::new(size))
            .push(rate);
    }

    /// Estimated documents per minute for a connection.
    pub fn fetch_rate(&self, connection_name: &str) -> f64 {
        let histories = lock(&self.histories);
        match histories.get(connection_name) {
            Some(history) => history.weighted_rate(&self.weights, self.default_rate),
            None => self.default_rate,
        }
    }

    /// Forget all history for a connection.
    pub fn reset(&self, connection_name: &str) {
        lock(&self.histories).remove(connection_name);
    }
}

impl Default for PerformanceStatistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unseen_connection_uses_default() {
        let stats = PerformanceStatistics::new();
        assert_eq!(stats.fetch_rate("web"), 900.0);
    }

    #[test]
    fn test_single_sample_moves_toward_observed_rate() {
        let stats = PerformanceStatistics::new();
        stats.record_completion("web", 10, 1000);
        let rate = stats.fetch_rate("web");
        // 0.5 * 600 + 0.5 * 900
        assert!((rate - 750.0).abs() < 1e-9);
        assert!(rate < 900.0);
        assert!(rate > 600.0);
    }

    #[test]
    fn test_full_history_converges() {
        let stats = PerformanceStatistics::new();
        for _ in 0..5 {
            stats.record_completion("web", 10, 1000);
        }
        assert!((stats.fetch_rate("web") - 600.0).abs() < 1e-9);
    }

    #[test]
    fn test_newest_sample_weighs_most() {
        let stats = PerformanceStatistics::new();
        for _ in 0..5 {
            stats.record_completion("web", 10, 1000); // 600/min
        }
        stats.record_completion("web", 20, 1000); // 1200/min
        let rate = stats.fetch_rate("web");
        assert!((rate - (0.5 * 1200.0 + 0.5 * 600.0)).abs() < 1e-9);
    }

    #[test]
    fn test_circular_history_drops_oldest() {
        let stats = PerformanceStatistics::new();
        stats.record_completion("web", 100, 1000);
        for _ in 0..5 {
            stats.record_completion("web", 1, 1000);
        }
        assert!((stats.fetch_rate("web") - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_connections_are_independent() {
        let stats = PerformanceStatistics::new();
        stats.record_completion("a", 10, 1000);
        assert_eq!(stats.fetch_rate("b"), 900.0);
        stats.reset("a");
        assert_eq!(stats.fetch_rate("a"), 900.0);
    }

    #[test]
    fn test_zero_elapsed_does_not_divide_by_zero() {
        let stats = PerformanceStatistics::new();
        stats.record_completion("web", 1, 0);
        assert!(stats.fetch_rate("web").is_finite());
    }
}
