//! Per-bin stuffing credit.
//!
//! Throttling is applied by limiting how many documents of a bin a single
//! stuffing call may claim, never by blocking a worker. Each bin accrues
//! credit at its maximum rate and a call may spend whatever it holds.

use std::collections::HashMap;

/// Credit state for a single bin.
#[derive(Debug, Clone)]
pub struct BinState {
    /// Fractional documents that may still be claimed.
    pub credit: f64,
    /// Last time credit was accrued (epoch ms).
    pub last_refill_ms: Option<i64>,
    /// Total documents granted.
    pub total_granted: u64,
}

impl BinState {
    pub fn new() -> Self {
        Self {
            credit: 0.0,
            last_refill_ms: None,
            total_granted: 0,
        }
    }

    /// Accrue credit for the time since the last refill.
    ///
    /// Credit never exceeds one interval's worth, and at least one document
    /// is always affordable per interval for any nonzero rate.
    pub fn refill(&mut self, max_rate: f64, interval_ms: u64, now_ms: i64) {
        let cap = (max_rate * interval_ms as f64).max(1.0);
        match self.last_refill_ms {
            None => self.credit = cap,
            Some(last) => {
                let elapsed = (now_ms - last).max(0) as f64;
                self.credit = (self.credit + max_rate * elapsed).min(cap);
            }
        }
        self.last_refill_ms = Some(now_ms);
    }

    /// Documents that can be claimed right now.
    pub fn available(&self) -> u64 {
        self.credit.max(0.0).floor() as u64
    }

    /// Spend credit for one claimed document.
    pub fn spend(&mut self) {
        self.credit -= 1.0;
        self.total_granted += 1;
    }
}

impl Default for BinState {
    fn default() -> Self {
        Self::new()
    }
}

/// Credit budgets for every bin one process stuffs from.
#[derive(Debug, Default)]
pub struct BinBudget {
    bins: HashMap<String, BinState>,
}

impl BinBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refill and report how many documents of `bin` may be claimed now.
    ///
    /// Unthrottled bins are unlimited; blocked bins (rate 0) allow nothing.
    pub fn allowance(&mut self, bin: &str, max_rate: f64, interval_ms: u64, now_ms: i64) -> u64 {
        if max_rate.is_infinite() {
            return u64::MAX;
        }
        if max_rate <= 0.0 {
            return 0;
        }
        let state = self.bins.entry(bin.to_string()).or_default();
        state.refill(max_rate, interval_ms, now_ms);
        state.available()
    }

    /// Record a claimed document against each throttled bin.
    pub fn spend(&mut self, bin: &str) {
        if let Some(state) = self.bins.get_mut(bin) {
            state.spend();
        }
    }

    pub fn state(&self, bin: &str) -> Option<&BinState> {
        self.bins.get(bin)
    }
}
