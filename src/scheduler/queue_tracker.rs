//! Priority engine and per-bin occupancy tracking.
//!
//! Priorities are logarithmic: each bin carries a counter that advances by one
//! for every document admitted into it, scaled by how throttled the bin is.
//! A document's priority is `ln(1 + max(count * k))` over its bins, where
//! `k = 1 + 1 / (min_ms_per_fetch * max_rate)`. Heavily throttled bins grow
//! their adjusted count fastest, so their documents sink in the queue.
//!
//! The minimum-depth watermark keeps newly discovered documents from being
//! scheduled above the depth the stuffer is already draining: a bin whose
//! adjusted count lags the watermark is pulled up to it first.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use super::lock;
use super::throttle::BinThrottleLimits;
use crate::error::SchedulerResult;

/// Default fetch interval constant (ms) used to scale throttled bins.
pub const DEFAULT_MIN_MS_PER_FETCH: f64 = 50.0;

/// Source of bin counter values.
///
/// `next_value` returns the bin's counter raised to at least `floor`, and
/// advances the stored counter to that value plus one.
pub trait BinCounter {
    fn next_value(&mut self, bin: &str, floor: f64) -> SchedulerResult<f64>;
}

/// In-process bin counters.
#[derive(Debug, Default)]
pub struct LocalBinCounts {
    counts: HashMap<String, f64>,
}

impl LocalBinCounts {
    pub fn get(&self, bin: &str) -> f64 {
        self.counts.get(bin).copied().unwrap_or(0.0)
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }

    fn advance(&mut self, bin: &str, floor: f64) -> f64 {
        let count = self.counts.entry(bin.to_string()).or_insert(0.0);
        let value = count.max(floor);
        *count = value + 1.0;
        value
    }
}

impl BinCounter for LocalBinCounts {
    fn next_value(&mut self, bin: &str, floor: f64) -> SchedulerResult<f64> {
        Ok(self.advance(bin, floor))
    }
}

#[derive(Debug, Default)]
struct PriorityState {
    bin_counts: LocalBinCounts,
    current_minimum_depth: f64,
    reset_in_progress: bool,
}

#[derive(Debug, Default)]
struct Occupancy {
    queued: HashMap<String, u64>,
    active: HashMap<String, u64>,
}

fn increment(map: &mut HashMap<String, u64>, bin: &str) {
    *map.entry(bin.to_string()).or_insert(0) += 1;
}

fn decrement(map: &mut HashMap<String, u64>, bin: &str) {
    if let Some(count) = map.get_mut(bin) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            map.remove(bin);
        }
    }
}

/// Per-process priority engine.
#[derive(Debug)]
pub struct QueueTracker {
    min_ms_per_fetch: f64,
    priorities: Mutex<PriorityState>,
    occupancy: Mutex<Occupancy>,
}

impl QueueTracker {
    pub fn new() -> Self {
        Self::with_min_ms_per_fetch(DEFAULT_MIN_MS_PER_FETCH)
    }

    pub fn with_min_ms_per_fetch(min_ms_per_fetch: f64) -> Self {
        Self {
            min_ms_per_fetch,
            priorities: Mutex::new(PriorityState::default()),
            occupancy: Mutex::new(Occupancy::default()),
        }
    }

    /// Throttle scale factor for a bin with the given max rate (fetches/ms).
    pub fn scale_factor(&self, max_rate: f64) -> f64 {
        if max_rate <= 0.0 {
            return f64::INFINITY;
        }
        1.0 + 1.0 / (self.min_ms_per_fetch * max_rate)
    }

    /// Priority for a new document using this process's own bin counters.
    pub fn calculate_priority(&self, bins: &[String], limits: &BinThrottleLimits) -> f64 {
        let mut state = lock(&self.priorities);
        let depth = state.current_minimum_depth;
        let factors: Vec<f64> = bins
            .iter()
            .map(|bin| self.scale_factor(limits.max_fetch_rate(bin)))
            .collect();
        let values: Vec<f64> = bins
            .iter()
            .zip(&factors)
            .map(|(bin, k)| state.bin_counts.advance(bin, depth / k))
            .collect();
        priority_from_counts(&values, &factors)
    }

    /// Priority for a new document using an external counter source, such as
    /// the cluster-shared counters of the store.
    pub fn calculate_priority_with(
        &self,
        bins: &[String],
        limits: &BinThrottleLimits,
        counter: &mut dyn BinCounter,
    ) -> SchedulerResult<f64> {
        let depth = self.current_minimum_depth();
        let mut factors = Vec::with_capacity(bins.len());
        let mut values = Vec::with_capacity(bins.len());
        for bin in bins {
            let k = self.scale_factor(limits.max_fetch_rate(bin));
            values.push(counter.next_value(bin, depth / k)?);
            factors.push(k);
        }
        Ok(priority_from_counts(&values, &factors))
    }

    /// Raise the minimum depth from the priorities the stuffer is draining.
    pub fn assess_minimum_depth(&self, priorities: &[f64]) {
        let mut state = lock(&self.priorities);
        if state.reset_in_progress {
            return;
        }
        let Some(depth) = minimum_depth_of(priorities) else {
            return;
        };
        if depth > state.current_minimum_depth {
            state.current_minimum_depth = depth;
        } else if depth < state.current_minimum_depth {
            debug!(
                "Minimum depth {} below watermark {}; possible ordering anomaly",
                depth, state.current_minimum_depth
            );
        }
    }

    /// Adopt a watermark observed elsewhere (e.g. the cluster's) if it is higher.
    pub fn observe_minimum_depth(&self, depth: f64) {
        let mut state = lock(&self.priorities);
        if !state.reset_in_progress && depth.is_finite() && depth > state.current_minimum_depth {
            state.current_minimum_depth = depth;
        }
    }

    pub fn current_minimum_depth(&self) -> f64 {
        lock(&self.priorities).current_minimum_depth
    }

    /// Start a reprioritization sweep: counters and watermark restart from zero.
    pub fn begin_reset(&self) {
        let mut state = lock(&self.priorities);
        state.reset_in_progress = true;
        state.bin_counts.clear();
        state.current_minimum_depth = 0.0;
    }

    pub fn end_reset(&self) {
        lock(&self.priorities).reset_in_progress = false;
    }

    pub fn is_resetting(&self) -> bool {
        lock(&self.priorities).reset_in_progress
    }

    /// Current local counter for a bin.
    pub fn bin_count(&self, bin: &str) -> f64 {
        lock(&self.priorities).bin_counts.get(bin)
    }

    /// A document was admitted to this process's queue.
    pub fn add_record(&self, bins: &[String]) {
        let mut occupancy = lock(&self.occupancy);
        for bin in bins {
            increment(&mut occupancy.queued, bin);
        }
    }

    /// A queued document left without being processed.
    pub fn remove_record(&self, bins: &[String]) {
        let mut occupancy = lock(&self.occupancy);
        for bin in bins {
            decrement(&mut occupancy.queued, bin);
        }
    }

    /// A queued document was handed to a worker.
    pub fn begin_processing(&self, bins: &[String]) {
        let mut occupancy = lock(&self.occupancy);
        for bin in bins {
            decrement(&mut occupancy.queued, bin);
            increment(&mut occupancy.active, bin);
        }
    }

    /// A worker finished with a document.
    pub fn end_processing(&self, bins: &[String]) {
        let mut occupancy = lock(&self.occupancy);
        for bin in bins {
            decrement(&mut occupancy.active, bin);
        }
    }

    pub fn queued_count(&self, bin: &str) -> u64 {
        lock(&self.occupancy).queued.get(bin).copied().unwrap_or(0)
    }

    pub fn active_count(&self, bin: &str) -> u64 {
        lock(&self.occupancy).active.get(bin).copied().unwrap_or(0)
    }

    /// Rating of a ready document for a free worker; higher is better.
    ///
    /// This is the log of the geometric mean of `1 / (1 + active(bin))`.
    pub fn calculate_assignment_rating(&self, bins: &[String]) -> f64 {
        let occupancy = lock(&self.occupancy);
        assignment_rating(bins, |bin| {
            occupancy.active.get(bin).copied().unwrap_or(0)
        })
    }
}

impl Default for QueueTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// `ln(1 + max(value * k))`, infinite when any bin is fully blocked.
pub fn priority_from_counts(values: &[f64], factors: &[f64]) -> f64 {
    if factors.iter().any(|k| k.is_infinite()) {
        return f64::INFINITY;
    }
    let highest = values
        .iter()
        .zip(factors)
        .map(|(value, k)| value * k)
        .fold(0.0, f64::max);
    (1.0 + highest).ln()
}

/// Depth represented by the most urgent finite priority in the list.
pub fn minimum_depth_of(priorities: &[f64]) -> Option<f64> {
    priorities
        .iter()
        .copied()
        .filter(|p| p.is_finite())
        .reduce(f64::min)
        .map(|p| p.exp() - 1.0)
}

/// Assignment rating given an active-count lookup.
pub fn assignment_rating(bins: &[String], active: impl Fn(&str) -> u64) -> f64 {
    if bins.is_empty() {
        return 0.0;
    }
    let log_sum: f64 = bins
        .iter()
        .map(|bin| (1.0 + active(bin) as f64).ln())
        .sum();
    -log_sum / bins.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ThrottleSpec;

    fn bins(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_priorities_strictly_increase_in_one_bin() {
        let tracker = QueueTracker::new();
        let limits = BinThrottleLimits::new(&[ThrottleSpec::new("host", 30.0)]);
        let doc_bins = bins(&["host-a"]);

        let mut last = -1.0;
        for _ in 0..50 {
            let priority = tracker.calculate_priority(&doc_bins, &limits);
            assert!(priority > last);
            last = priority;
        }
    }

    #[test]
    fn test_first_document_is_most_urgent() {
        let tracker = QueueTracker::new();
        let priority = tracker.calculate_priority(&bins(&["host-a"]), &BinThrottleLimits::unlimited());
        assert_eq!(priority, 0.0);
    }

    #[test]
    fn test_blocked_bin_is_infinite() {
        let tracker = QueueTracker::new();
        let limits = BinThrottleLimits::new(&[ThrottleSpec::new("host-a", 0.0)]);
        for _ in 0..3 {
            assert_eq!(
                tracker.calculate_priority(&bins(&["host-a"]), &limits),
                f64::INFINITY
            );
        }
        // Partially blocked documents are blocked too.
        assert_eq!(
            tracker.calculate_priority(&bins(&["host-a", "host-b"]), &limits),
            f64::INFINITY
        );
    }

    #[test]
    fn test_every_bin_is_incremented() {
        let tracker = QueueTracker::new();
        let limits = BinThrottleLimits::unlimited();
        tracker.calculate_priority(&bins(&["a", "b"]), &limits);
        assert_eq!(tracker.bin_count("a"), 1.0);
        assert_eq!(tracker.bin_count("b"), 1.0);
        tracker.calculate_priority(&bins(&["b"]), &limits);
        assert_eq!(tracker.bin_count("a"), 1.0);
        assert_eq!(tracker.bin_count("b"), 2.0);
    }

    #[test]
    fn test_throttled_bin_sinks_faster() {
        let tracker = QueueTracker::new();
        let limits = BinThrottleLimits::new(&[ThrottleSpec::new("^host-a$", 1.0)]);
        let a = bins(&["host-a"]);
        let b = bins(&["host-b"]);

        let mut sum_a = 0.0;
        let mut sum_b = 0.0;
        for _ in 0..50 {
            sum_a += tracker.calculate_priority(&a, &limits);
            sum_b += tracker.calculate_priority(&b, &limits);
        }
        assert!(sum_a / 50.0 > sum_b / 50.0);
    }

    #[test]
    fn test_minimum_depth_pulls_new_bins_up() {
        let tracker = QueueTracker::new();
        let limits = BinThrottleLimits::unlimited();
        // Drain level corresponds to a depth of 99.
        tracker.assess_minimum_depth(&[(100.0_f64).ln()]);
        assert!((tracker.current_minimum_depth() - 99.0).abs() < 1e-9);

        let priority = tracker.calculate_priority(&bins(&["fresh"]), &limits);
        assert!((priority - (100.0_f64).ln()).abs() < 1e-9);
    }

    #[test]
    fn test_minimum_depth_is_monotonic() {
        let tracker = QueueTracker::new();
        let observations = [2.0, 0.5, 3.0, 1.0, 3.0, 0.1];
        let mut last = tracker.current_minimum_depth();
        for p in observations {
            tracker.assess_minimum_depth(&[p, p + 1.0]);
            let depth = tracker.current_minimum_depth();
            assert!(depth >= last);
            last = depth;
        }
        assert!((last - (3.0_f64.exp() - 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_minimum_depth_ignores_infinite_and_empty() {
        let tracker = QueueTracker::new();
        tracker.assess_minimum_depth(&[]);
        tracker.assess_minimum_depth(&[f64::INFINITY]);
        assert_eq!(tracker.current_minimum_depth(), 0.0);
    }

    #[test]
    fn test_reset_clears_and_suppresses() {
        let tracker = QueueTracker::new();
        let limits = BinThrottleLimits::unlimited();
        tracker.calculate_priority(&bins(&["a"]), &limits);
        tracker.assess_minimum_depth(&[1.0]);

        tracker.begin_reset();
        assert!(tracker.is_resetting());
        assert_eq!(tracker.bin_count("a"), 0.0);
        assert_eq!(tracker.current_minimum_depth(), 0.0);

        tracker.assess_minimum_depth(&[2.0]);
        assert_eq!(tracker.current_minimum_depth(), 0.0);

        tracker.end_reset();
        tracker.assess_minimum_depth(&[2.0]);
        assert!(tracker.current_minimum_depth() > 0.0);
    }

    #[test]
    fn test_external_counter_matches_local() {
        let tracker = QueueTracker::new();
        let other = QueueTracker::new();
        let limits = BinThrottleLimits::new(&[ThrottleSpec::new("a", 60.0)]);
        let mut counter = LocalBinCounts::default();
        for _ in 0..5 {
            let local = tracker.calculate_priority(&bins(&["a", "b"]), &limits);
            let external = other
                .calculate_priority_with(&bins(&["a", "b"]), &limits, &mut counter)
                .unwrap();
            assert!((local - external).abs() < 1e-12);
        }
    }

    #[test]
    fn test_occupancy_lifecycle() {
        let tracker = QueueTracker::new();
        let doc = bins(&["a", "b"]);
        tracker.add_record(&doc);
        assert_eq!(tracker.queued_count("a"), 1);

        tracker.begin_processing(&doc);
        assert_eq!(tracker.queued_count("a"), 0);
        assert_eq!(tracker.active_count("b"), 1);

        tracker.end_processing(&doc);
        assert_eq!(tracker.active_count("b"), 0);

        // Underflow is clamped.
        tracker.end_processing(&doc);
        assert_eq!(tracker.active_count("a"), 0);
    }

    #[test]
    fn test_assignment_rating_prefers_idle_bins() {
        let tracker = QueueTracker::new();
        let busy = bins(&["busy"]);
        for _ in 0..3 {
            tracker.add_record(&busy);
            tracker.begin_processing(&busy);
        }
        let busy_rating = tracker.calculate_assignment_rating(&busy);
        let idle_rating = tracker.calculate_assignment_rating(&bins(&["idle"]));
        assert!(idle_rating > busy_rating);
        assert_eq!(idle_rating, 0.0);
        assert!((busy_rating + (4.0_f64).ln()).abs() < 1e-12);
    }

    #[test]
    fn test_assignment_rating_normalizes_by_bin_count() {
        let rating = assignment_rating(&bins(&["x", "y"]), |bin| if bin == "x" { 3 } else { 0 });
        assert!((rating + (4.0_f64).ln() / 2.0).abs() < 1e-12);
        assert_eq!(assignment_rating(&[], |_| 5), 0.0);
    }
}
