//! Regex-keyed per-bin fetch-rate limits.
//!
//! A connection declares throttle rules as `(bin regex, fetches per minute)`.
//! A bin's limit is the smallest rate among the rules whose regex matches
//! anywhere in the bin name; bins matching no rule are unlimited.

mod bin_state;

pub use bin_state::{BinBudget, BinState};

use regex::Regex;
use tracing::warn;

use crate::models::ThrottleSpec;

#[derive(Debug, Clone)]
struct CompiledThrottle {
    pattern: Regex,
    /// Fetches per millisecond.
    max_rate: f64,
}

/// Compiled throttle rules of one connection.
#[derive(Debug, Clone, Default)]
pub struct BinThrottleLimits {
    rules: Vec<CompiledThrottle>,
}

impl BinThrottleLimits {
    /// Compile the rules; rules whose regex does not compile are skipped.
    pub fn new(specs: &[ThrottleSpec]) -> Self {
        let rules = specs
            .iter()
            .filter_map(|spec| match Regex::new(&spec.bin_regex) {
                Ok(pattern) => Some(CompiledThrottle {
                    pattern,
                    max_rate: spec.max_rate_per_ms().max(0.0),
                }),
                Err(e) => {
                    warn!(
                        "Ignoring throttle rule '{}': invalid bin regex: {}",
                        spec.bin_regex, e
                    );
                    None
                }
            })
            .collect();
        Self { rules }
    }

    /// No limits at all.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Maximum fetch rate (fetches/ms) for a bin; infinite when unthrottled.
    pub fn max_fetch_rate(&self, bin_name: &str) -> f64 {
        self.rules
            .iter()
            .filter(|rule| rule.pattern.is_match(bin_name))
            .map(|rule| rule.max_rate)
            .fold(f64::INFINITY, f64::min)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
