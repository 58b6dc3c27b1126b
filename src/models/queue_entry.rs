//! Queue entry model and its lifecycle states.

use serde::{Deserialize, Serialize};

use super::JobId;

/// Materialized lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueueStatus {
    /// Waiting to be fetched; ready once `check_time` has passed.
    Pending,
    /// Claimed by a worker.
    Active,
    /// Claimed by a worker and rediscovered with changes while in flight.
    ActiveNeedRescan,
    /// Processed in an earlier run, not yet reconfirmed in this one.
    Purgatory,
    /// Processed during the current run of a specified job.
    Complete,
    /// Processed by a continuous job; refetched at `check_time`.
    CompletedContinuous,
    /// Too far from the seeds; retained in case a shorter path appears.
    HopcountExceeded,
    /// Waiting for a delete worker.
    EligibleForDelete,
    /// Claimed by a delete worker.
    BeingDeleted,
    /// Waiting for a cleanup worker.
    EligibleForExpire,
    /// Claimed by a cleanup worker.
    BeingCleaned,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 11] = [
        QueueStatus::Pending,
        QueueStatus::Active,
        QueueStatus::ActiveNeedRescan,
        QueueStatus::Purgatory,
        QueueStatus::Complete,
        QueueStatus::CompletedContinuous,
        QueueStatus::HopcountExceeded,
        QueueStatus::EligibleForDelete,
        QueueStatus::BeingDeleted,
        QueueStatus::EligibleForExpire,
        QueueStatus::BeingCleaned,
    ];

    /// Storage code for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "P",
            QueueStatus::Active => "A",
            QueueStatus::ActiveNeedRescan => "R",
            QueueStatus::Purgatory => "G",
            QueueStatus::Complete => "C",
            QueueStatus::CompletedContinuous => "N",
            QueueStatus::HopcountExceeded => "H",
            QueueStatus::EligibleForDelete => "D",
            QueueStatus::BeingDeleted => "E",
            QueueStatus::EligibleForExpire => "X",
            QueueStatus::BeingCleaned => "Q",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        QueueStatus::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// States a worker currently holds.
    pub fn is_active(&self) -> bool {
        matches!(self, QueueStatus::Active | QueueStatus::ActiveNeedRescan)
    }

    /// States that keep a specified job from finishing its run.
    pub fn blocks_completion(&self) -> bool {
        matches!(
            self,
            QueueStatus::Pending
                | QueueStatus::Active
                | QueueStatus::ActiveNeedRescan
                | QueueStatus::BeingDeleted
                | QueueStatus::BeingCleaned
        )
    }

    /// Human-readable label used by status reports.
    pub fn label(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Active => "active",
            QueueStatus::ActiveNeedRescan => "active (rescan)",
            QueueStatus::Purgatory => "purgatory",
            QueueStatus::Complete => "complete",
            QueueStatus::CompletedContinuous => "completed (continuous)",
            QueueStatus::HopcountExceeded => "hopcount exceeded",
            QueueStatus::EligibleForDelete => "eligible for delete",
            QueueStatus::BeingDeleted => "being deleted",
            QueueStatus::EligibleForExpire => "eligible for expire",
            QueueStatus::BeingCleaned => "being cleaned",
        }
    }
}

/// Whether an entry is a seed of its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeedStatus {
    NotSeed,
    /// Confirmed seed from a finished seeding pass.
    Seed,
    /// Registered by a seeding pass still in progress.
    NewSeed,
}

impl SeedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeedStatus::NotSeed => "",
            SeedStatus::Seed => "S",
            SeedStatus::NewSeed => "N",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "" => Some(SeedStatus::NotSeed),
            "S" => Some(SeedStatus::Seed),
            "N" => Some(SeedStatus::NewSeed),
            _ => None,
        }
    }

    pub fn is_seed(&self) -> bool {
        !matches!(self, SeedStatus::NotSeed)
    }
}

/// One queued document of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub doc_hash: String,
    pub doc_id: String,
    pub status: QueueStatus,
    /// Logarithmic priority; lower is more urgent.
    pub priority: Option<f64>,
    /// Set when the entry must be (re)prioritized before it can be claimed.
    pub needs_priority: bool,
    /// Earliest time (epoch ms) the entry may be acted on.
    pub check_time: i64,
    /// Hard-fail deadline (epoch ms) once failures started.
    pub fail_time: Option<i64>,
    pub fail_count: u32,
    /// When the document was first processed.
    pub origination_time: Option<i64>,
    pub processed_before: bool,
    pub seed_status: SeedStatus,
    pub seeding_process_id: Option<String>,
    /// Process that currently holds the entry.
    pub process_id: Option<String>,
    pub last_version: Option<String>,
    pub last_error: Option<String>,
}

impl QueueEntry {
    /// New pending entry for a freshly discovered document.
    pub fn new(job_id: JobId, doc_hash: String, doc_id: String, check_time: i64) -> Self {
        Self {
            job_id,
            doc_hash,
            doc_id,
            status: QueueStatus::Pending,
            priority: None,
            needs_priority: true,
            check_time,
            fail_time: None,
            fail_count: 0,
            origination_time: None,
            processed_before: false,
            seed_status: SeedStatus::NotSeed,
            seeding_process_id: None,
            process_id: None,
            last_version: None,
            last_error: None,
        }
    }

    /// Due for fetching and prioritized.
    pub fn is_ready(&self, now_ms: i64) -> bool {
        matches!(
            self.status,
            QueueStatus::Pending | QueueStatus::CompletedContinuous
        ) && !self.needs_priority
            && self.priority.is_some()
            && self.check_time <= now_ms
    }

    /// Return the entry to the pending bucket, keeping the priority it already has.
    pub fn requeue(&mut self, check_time: i64) {
        self.status = QueueStatus::Pending;
        self.check_time = check_time;
        self.process_id = None;
    }

    /// Assign a freshly computed priority.
    pub fn set_priority(&mut self, priority: f64) {
        self.priority = Some(priority);
        self.needs_priority = false;
    }

    /// Forget failure bookkeeping after a successful or neutral outcome.
    pub fn clear_failures(&mut self) {
        self.fail_time = None;
        self.fail_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in QueueStatus::ALL {
            assert_eq!(QueueStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(QueueStatus::from_str("Z"), None);
    }

    #[test]
    fn test_new_entry_needs_priority() {
        let entry = QueueEntry::new(1, "h".into(), "doc".into(), 0);
        assert_eq!(entry.status, QueueStatus::Pending);
        assert!(!entry.is_ready(10));
    }

    #[test]
    fn test_ready_requires_due_time() {
        let mut entry = QueueEntry::new(1, "h".into(), "doc".into(), 100);
        entry.set_priority(0.5);
        assert!(!entry.is_ready(99));
        assert!(entry.is_ready(100));
    }

    #[test]
    fn test_completion_blockers() {
        assert!(QueueStatus::Pending.blocks_completion());
        assert!(QueueStatus::BeingCleaned.blocks_completion());
        assert!(!QueueStatus::Purgatory.blocks_completion());
        assert!(!QueueStatus::HopcountExceeded.blocks_completion());
    }
}
