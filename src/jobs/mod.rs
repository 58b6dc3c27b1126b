//! Persistent queue state machine.
//!
//! [`QueueManager`] owns every transition of a queue entry. Each public
//! operation runs as one store transaction; callers see either all of its
//! writes or none. Transient conflicts rerun the whole closure, so effects
//! on the in-process trackers are applied only after the commit returns.

pub mod carrydown;
mod completion;
mod deletion;
mod discovery;
pub mod hopcount;
mod lifecycle;
mod recovery;
mod seeding;
mod stuffing;

pub use completion::CompletionSummary;
pub use deletion::DeletionTask;
pub use recovery::RecoverySummary;
pub use stuffing::DocumentBatch;

use std::sync::Arc;

use tracing::warn;

use crate::connectors::JobActivityProbe;
use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{JobId, JobRecord, JobStatus};
use crate::scheduler::{ConnectionLimits, SchedulerContext, SharedBinCounter};
use crate::store::{QueueStore, StoreTxn};

/// Wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Queue operations over a shared store.
pub struct QueueManager<S: QueueStore> {
    store: Arc<S>,
    ctx: Arc<SchedulerContext>,
}

impl<S: QueueStore> Clone for QueueManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ctx: Arc::clone(&self.ctx),
        }
    }
}

impl<S: QueueStore> QueueManager<S> {
    pub fn new(store: Arc<S>, ctx: Arc<SchedulerContext>) -> Self {
        Self { store, ctx }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn context(&self) -> &Arc<SchedulerContext> {
        &self.ctx
    }

    /// Run `f` in a transaction, rerunning it on transient conflicts.
    pub(crate) fn transact<T>(
        &self,
        mut f: impl FnMut(&mut dyn StoreTxn) -> SchedulerResult<T>,
    ) -> SchedulerResult<T> {
        let retries = self.ctx.settings.transaction_retries;
        let mut attempt = 0;
        loop {
            match self.store.transaction(&mut f) {
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    warn!("Transaction conflict ({}), retry {}/{}", e, attempt, retries);
                }
                result => return result,
            }
        }
    }

    /// Priority for a document in `bins`, drawn from the cluster bin counters.
    pub(crate) fn assign_priority(
        &self,
        txn: &mut dyn StoreTxn,
        connection: &ConnectionLimits,
        bins: &[String],
    ) -> SchedulerResult<f64> {
        let mut counter = SharedBinCounter {
            tracker: &self.ctx.reprioritization,
            txn,
            connector_id: &connection.connection.connector_id,
        };
        self.ctx
            .queue_tracker
            .calculate_priority_with(bins, &connection.limits, &mut counter)
    }

    /// Pull the cluster watermark into the local priority engine.
    pub(crate) fn sync_minimum_depth(&self, txn: &mut dyn StoreTxn) -> SchedulerResult<()> {
        let depth = self.ctx.reprioritization.get_minimum_depth(txn)?;
        self.ctx.queue_tracker.observe_minimum_depth(depth);
        Ok(())
    }
}

pub(crate) fn load_job(txn: &mut dyn StoreTxn, job_id: JobId) -> SchedulerResult<JobRecord> {
    txn.load_job(job_id)?.ok_or(SchedulerError::UnknownJob(job_id))
}

pub(crate) fn require_active(job: &JobRecord) -> SchedulerResult<()> {
    if job.status == JobStatus::Active {
        Ok(())
    } else {
        Err(SchedulerError::JobNotActive(job.id()))
    }
}

impl<S: QueueStore> JobActivityProbe for QueueManager<S> {
    fn check_job_still_active(&self, job_id: JobId) -> SchedulerResult<()> {
        QueueManager::check_job_still_active(self, job_id)
    }
}
