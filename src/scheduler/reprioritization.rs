//! Cluster-wide ownership of reprioritization sweeps.
//!
//! One process at a time may run a sweep that resets the shared bin
//! counters and recomputes every pending priority. Ownership is a lease in
//! the shared store: the owner renews it with [`heartbeat`], and once it
//! lapses any process may take the sweep over. The cluster minimum-depth
//! watermark lives next to the lease and is only advanced while no sweep
//! is running.
//!
//! [`heartbeat`]: ReprioritizationTracker::heartbeat

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use super::lock;
use super::queue_tracker::{minimum_depth_of, BinCounter};
use crate::error::SchedulerResult;
use crate::store::{LeaseRecord, QueueStore, StoreTxn};

/// Lease name of the sweep owner.
pub const REPRIORITIZATION_LEASE: &str = "reprioritization";
/// Shared value key of the cluster minimum depth.
pub const MINIMUM_DEPTH_KEY: &str = "reprioritization.minimum_depth";
/// Default lease length.
pub const DEFAULT_LEASE_MS: i64 = 300_000;

type PreloadKey = (String, String);

#[derive(Debug, Clone)]
struct PreloadRequest {
    weighted_minimum_depth: f64,
    count: usize,
}

#[derive(Debug, Default)]
struct PreloadState {
    requests: HashMap<PreloadKey, PreloadRequest>,
    values: HashMap<PreloadKey, VecDeque<f64>>,
}

/// Per-process handle on the cluster's reprioritization state.
#[derive(Debug)]
pub struct ReprioritizationTracker {
    lease_ms: i64,
    preload: Mutex<PreloadState>,
}

impl ReprioritizationTracker {
    pub fn new(lease_ms: i64) -> Self {
        Self {
            lease_ms,
            preload: Mutex::new(PreloadState::default()),
        }
    }

    pub fn lease_ms(&self) -> i64 {
        self.lease_ms
    }

    /// Claim the sweep for `process_id`. Returns `false` without side effects
    /// when another live sweep holds the lease.
    ///
    /// A successful start resets the shared bin counters and the watermark.
    pub fn start_reprioritization(
        &self,
        txn: &mut dyn StoreTxn,
        process_id: &str,
        sweep_id: &str,
        now_ms: i64,
    ) -> SchedulerResult<bool> {
        if let Some(current) = txn.load_lease(REPRIORITIZATION_LEASE)? {
            if !current.is_expired(now_ms) {
                debug!(
                    "Reprioritization already owned by {} (sweep {})",
                    current.process_id, current.holder_id
                );
                return Ok(false);
            }
            warn!(
                "Reprioritization lease of {} (sweep {}) expired; taking over as {}",
                current.process_id, current.holder_id, process_id
            );
        }

        txn.save_lease(&LeaseRecord {
            name: REPRIORITIZATION_LEASE.to_string(),
            process_id: process_id.to_string(),
            holder_id: sweep_id.to_string(),
            acquired_ms: now_ms,
            heartbeat_ms: now_ms,
            expires_ms: now_ms + self.lease_ms,
        })?;
        txn.reset_bin_values()?;
        txn.save_value(MINIMUM_DEPTH_KEY, 0.0)?;
        info!("Process {} started reprioritization sweep {}", process_id, sweep_id);
        Ok(true)
    }

    /// Renew the lease. Returns `false` if the caller no longer owns it.
    pub fn heartbeat(
        &self,
        txn: &mut dyn StoreTxn,
        process_id: &str,
        sweep_id: &str,
        now_ms: i64,
    ) -> SchedulerResult<bool> {
        match txn.load_lease(REPRIORITIZATION_LEASE)? {
            Some(mut lease) if lease.process_id == process_id && lease.holder_id == sweep_id => {
                lease.heartbeat_ms = now_ms;
                lease.expires_ms = now_ms + self.lease_ms;
                txn.save_lease(&lease)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Release the sweep only if `sweep_id` is the one recorded.
    pub fn done_reprioritization(
        &self,
        txn: &mut dyn StoreTxn,
        sweep_id: &str,
    ) -> SchedulerResult<bool> {
        match txn.load_lease(REPRIORITIZATION_LEASE)? {
            Some(lease) if lease.holder_id == sweep_id => {
                txn.delete_lease(REPRIORITIZATION_LEASE)?;
                debug!("Reprioritization sweep {} finished", sweep_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Sweep id owned by `process_id`, if it owns one.
    pub fn is_owned_by(
        &self,
        txn: &mut dyn StoreTxn,
        process_id: &str,
    ) -> SchedulerResult<Option<String>> {
        Ok(txn
            .load_lease(REPRIORITIZATION_LEASE)?
            .filter(|lease| lease.process_id == process_id)
            .map(|lease| lease.holder_id))
    }

    /// Drop whatever sweep a dead process held.
    pub fn release_process(&self, txn: &mut dyn StoreTxn, process_id: &str) -> SchedulerResult<bool> {
        match self.is_owned_by(txn, process_id)? {
            Some(sweep_id) => {
                warn!(
                    "Releasing reprioritization sweep {} held by dead process {}",
                    sweep_id, process_id
                );
                txn.delete_lease(REPRIORITIZATION_LEASE)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether any live sweep holds the lease.
    pub fn sweep_in_progress(&self, txn: &mut dyn StoreTxn, now_ms: i64) -> SchedulerResult<bool> {
        Ok(txn
            .load_lease(REPRIORITIZATION_LEASE)?
            .is_some_and(|lease| !lease.is_expired(now_ms)))
    }

    /// Raise the cluster watermark from priorities being drained; ignored while a sweep runs.
    pub fn assess_minimum_depth(
        &self,
        txn: &mut dyn StoreTxn,
        priorities: &[f64],
        now_ms: i64,
    ) -> SchedulerResult<()> {
        let Some(depth) = minimum_depth_of(priorities) else {
            return Ok(());
        };
        if self.sweep_in_progress(txn, now_ms)? {
            return Ok(());
        }
        let current = self.get_minimum_depth(txn)?;
        if depth > current {
            txn.save_value(MINIMUM_DEPTH_KEY, depth)?;
            debug!("Cluster minimum depth raised to {}", depth);
        } else if depth < current {
            debug!(
                "Cluster minimum depth {} below watermark {}; possible ordering anomaly",
                depth, current
            );
        }
        Ok(())
    }

    pub fn get_minimum_depth(&self, txn: &mut dyn StoreTxn) -> SchedulerResult<f64> {
        Ok(txn.load_value(MINIMUM_DEPTH_KEY)?.unwrap_or(0.0))
    }

    /// Note that a bin value will be needed by an upcoming transaction.
    pub fn add_preload_request(&self, connector_id: &str, bin: &str, weighted_minimum_depth: f64) {
        let mut preload = lock(&self.preload);
        preload
            .requests
            .entry((connector_id.to_string(), bin.to_string()))
            .and_modify(|request| {
                request.count += 1;
                request.weighted_minimum_depth =
                    request.weighted_minimum_depth.max(weighted_minimum_depth);
            })
            .or_insert(PreloadRequest {
                weighted_minimum_depth,
                count: 1,
            });
    }

    /// Fetch every requested bin value in its own short transaction.
    pub fn preload_bin_values<S: QueueStore>(&self, store: &S) -> SchedulerResult<()> {
        let requests: Vec<(PreloadKey, PreloadRequest)> =
            lock(&self.preload).requests.drain().collect();
        for ((connector_id, bin), request) in requests {
            let values = store.transaction(&mut |txn| {
                txn.increment_bin_values(
                    &connector_id,
                    &bin,
                    request.weighted_minimum_depth,
                    request.count,
                )
            })?;
            lock(&self.preload)
                .values
                .entry((connector_id.clone(), bin.clone()))
                .or_default()
                .extend(values);
        }
        Ok(())
    }

    pub fn clear_preload_requests(&self) {
        lock(&self.preload).requests.clear();
    }

    pub fn clear_preloaded_values(&self) {
        lock(&self.preload).values.clear();
    }

    /// Next counter value of a bin: a preloaded one if available, otherwise
    /// read-and-advance inside the caller's transaction.
    pub fn get_increment_bin_value(
        &self,
        txn: &mut dyn StoreTxn,
        connector_id: &str,
        bin: &str,
        weighted_minimum_depth: f64,
    ) -> SchedulerResult<f64> {
        let preloaded = lock(&self.preload)
            .values
            .get_mut(&(connector_id.to_string(), bin.to_string()))
            .and_then(|values| values.pop_front());
        if let Some(value) = preloaded {
            // Preloaded values may predate a watermark raise.
            if value >= weighted_minimum_depth {
                return Ok(value);
            }
        }
        let values = txn.increment_bin_values(connector_id, bin, weighted_minimum_depth, 1)?;
        Ok(values.first().copied().unwrap_or(weighted_minimum_depth))
    }
}

impl Default for ReprioritizationTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_MS)
    }
}

/// Bin counters shared by the cluster, read through the tracker's preload cache.
pub struct SharedBinCounter<'a> {
    pub tracker: &'a ReprioritizationTracker,
    pub txn: &'a mut dyn StoreTxn,
    pub connector_id: &'a str,
}

impl BinCounter for SharedBinCounter<'_> {
    fn next_value(&mut self, bin: &str, floor: f64) -> SchedulerResult<f64> {
        self.tracker
            .get_increment_bin_value(self.txn, self.connector_id, bin, floor)
    }
}
