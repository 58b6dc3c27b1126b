//! Job runs: creation, start/stop, failure, completion and expiry.

use std::collections::BTreeMap;

use tracing::{debug, error, info};

use super::{load_job, QueueManager};
use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{
    JobDescription, JobError, JobErrorKind, JobId, JobRecord, JobStatus, JobType, QueueStatus,
};
use crate::store::{EdgeQuery, EntryQuery, QueueStore, StoreTxn};

/// Keep the first job-fatal error; later ones are logged and dropped.
pub(crate) fn record_error(txn: &mut dyn StoreTxn, job: &mut JobRecord, err: JobError) -> SchedulerResult<bool> {
    if let Some(existing) = &job.error {
        debug!(
            "Job {} already failed ({}); suppressing: {}",
            job.id(),
            existing.message,
            err.message
        );
        return Ok(false);
    }
    error!("Job {} stopped: {:?}: {}", job.id(), err.kind, err.message);
    job.error = Some(err);
    job.status = JobStatus::Error;
    job.seeding.process_id = None;
    txn.save_job(job)?;
    Ok(true)
}

/// Remove a deleting job once no entry is left.
pub(crate) fn purge_if_empty(txn: &mut dyn StoreTxn, job_id: JobId) -> SchedulerResult<bool> {
    if txn.count_entries(&EntryQuery::for_job(job_id))? > 0 {
        return Ok(false);
    }
    txn.delete_carrydown(&EdgeQuery::for_job(job_id))?;
    txn.delete_links(&EdgeQuery::for_job(job_id))?;
    txn.delete_job_hopcounts(job_id)?;
    txn.delete_job(job_id)?;
    info!("Job {} deleted", job_id);
    Ok(true)
}

impl<S: QueueStore> QueueManager<S> {
    pub fn create_job(&self, description: JobDescription) -> SchedulerResult<JobRecord> {
        self.ctx.connection(&description.connection_name)?;
        let record = self.transact(|txn| {
            if txn.load_job(description.id)?.is_some() {
                return Err(SchedulerError::DuplicateJob(description.id));
            }
            let record = JobRecord::new(description.clone());
            txn.save_job(&record)?;
            Ok(record)
        })?;
        info!(
            "Created job {} '{}' on connection {}",
            record.id(),
            record.description.name,
            record.description.connection_name
        );
        Ok(record)
    }

    /// Create the configured jobs the store does not know yet. Returns how many were created.
    pub fn register_jobs(&self, descriptions: &[JobDescription]) -> SchedulerResult<usize> {
        let mut created = 0usize;
        for description in descriptions {
            match self.create_job(description.clone()) {
                Ok(_) => created += 1,
                Err(SchedulerError::DuplicateJob(id)) => debug!("Job {} already registered", id),
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }

    pub fn job(&self, job_id: JobId) -> SchedulerResult<JobRecord> {
        self.transact(|txn| load_job(txn, job_id))
    }

    pub fn list_jobs(&self) -> SchedulerResult<Vec<JobRecord>> {
        self.transact(|txn| txn.list_jobs())
    }

    /// Begin a run. A specified job moves last run's documents to purgatory
    /// so it can tell which of them are still reachable.
    pub fn start_job(&self, job_id: JobId, now_ms: i64) -> SchedulerResult<()> {
        let moved = self.transact(|txn| {
            let mut job = load_job(txn, job_id)?;
            match job.status {
                JobStatus::Active => return Ok(None),
                JobStatus::Deleting => return Err(SchedulerError::JobNotActive(job_id)),
                _ => {}
            }

            let mut moved = 0usize;
            if job.description.job_type == JobType::Specified {
                let query = EntryQuery::for_job(job_id).with_statuses(&[QueueStatus::Complete]);
                for mut entry in txn.query_entries(&query)? {
                    entry.status = QueueStatus::Purgatory;
                    txn.save_entry(&entry)?;
                    moved += 1;
                }
            }

            job.status = JobStatus::Active;
            job.error = None;
            job.run_started_ms = Some(now_ms);
            job.seeding.process_id = None;
            job.seeding.check_time = Some(now_ms);
            job.seeding.fail_time = None;
            job.seeding.fail_count = 0;
            txn.save_job(&job)?;
            Ok(Some(moved))
        })?;
        match moved {
            Some(moved) => info!("Started job {} ({} documents moved to purgatory)", job_id, moved),
            None => debug!("Job {} is already running", job_id),
        }
        Ok(())
    }

    pub fn pause_job(&self, job_id: JobId) -> SchedulerResult<()> {
        self.set_status(job_id, JobStatus::Active, JobStatus::Paused)
    }

    pub fn resume_job(&self, job_id: JobId) -> SchedulerResult<()> {
        self.set_status(job_id, JobStatus::Paused, JobStatus::Active)
    }

    fn set_status(&self, job_id: JobId, from: JobStatus, to: JobStatus) -> SchedulerResult<()> {
        let changed = self.transact(|txn| {
            let mut job = load_job(txn, job_id)?;
            if job.status != from {
                return Ok(false);
            }
            job.status = to;
            txn.save_job(&job)?;
            Ok(true)
        })?;
        if changed {
            info!("Job {} is now {}", job_id, to.as_str());
        } else {
            debug!("Job {} not {}; left unchanged", job_id, from.as_str());
        }
        Ok(())
    }

    /// Stop a run. In-flight work notices through `check_job_still_active`.
    pub fn abort_job(&self, job_id: JobId) -> SchedulerResult<()> {
        self.transact(|txn| {
            let mut job = load_job(txn, job_id)?;
            if job.status == JobStatus::Deleting {
                return Ok(());
            }
            job.status = JobStatus::Inactive;
            job.seeding.process_id = None;
            job.seeding.check_time = None;
            txn.save_job(&job)
        })?;
        info!("Aborted job {}", job_id);
        Ok(())
    }

    /// Start deleting a job. Documents never handed to the output go away
    /// at once; the rest wait for a delete worker.
    pub fn delete_job(&self, job_id: JobId, now_ms: i64) -> SchedulerResult<()> {
        let (dropped, scheduled) = self.transact(|txn| {
            let mut job = load_job(txn, job_id)?;
            job.status = JobStatus::Deleting;
            job.seeding.process_id = None;
            job.seeding.check_time = None;
            txn.save_job(&job)?;

            let (mut dropped, mut scheduled) = (0usize, 0usize);
            for mut entry in txn.query_entries(&EntryQuery::for_job(job_id))? {
                match entry.status {
                    QueueStatus::EligibleForDelete | QueueStatus::BeingDeleted => {}
                    _ if entry.processed_before || entry.status.is_active() => {
                        entry.status = QueueStatus::EligibleForDelete;
                        entry.check_time = now_ms;
                        entry.process_id = None;
                        txn.save_entry(&entry)?;
                        scheduled += 1;
                    }
                    _ => {
                        txn.delete_entry(job_id, &entry.doc_hash)?;
                        dropped += 1;
                    }
                }
            }
            purge_if_empty(txn, job_id)?;
            Ok((dropped, scheduled))
        })?;
        info!(
            "Deleting job {}: {} documents dropped, {} awaiting removal",
            job_id, dropped, scheduled
        );
        Ok(())
    }

    /// Stop a job with an error. Returns `false` if an earlier error is already recorded.
    pub fn record_job_error(
        &self,
        job_id: JobId,
        kind: JobErrorKind,
        message: &str,
        document: Option<&str>,
        now_ms: i64,
    ) -> SchedulerResult<bool> {
        self.transact(|txn| {
            let mut job = load_job(txn, job_id)?;
            record_error(
                txn,
                &mut job,
                JobError {
                    kind,
                    message: message.to_string(),
                    document: document.map(str::to_string),
                    occurred_at_ms: now_ms,
                },
            )
        })
    }

    /// Fails with [`SchedulerError::JobNotActive`] unless the job is running.
    pub fn check_job_still_active(&self, job_id: JobId) -> SchedulerResult<()> {
        let job = self.job(job_id)?;
        super::require_active(&job)
    }

    /// Complete every specified job with nothing left to do.
    ///
    /// Documents still in purgatory were not reached by this run; they are
    /// handed to cleanup first and the job completes once they are gone.
    /// Returns the jobs that completed.
    pub fn finish_job_runs(&self, now_ms: i64) -> SchedulerResult<Vec<JobDescription>> {
        let finished = self.transact(|txn| {
            let mut finished = Vec::new();
            for mut job in txn.list_jobs()? {
                if job.status == JobStatus::Deleting {
                    purge_if_empty(txn, job.id())?;
                    continue;
                }
                if job.status != JobStatus::Active
                    || job.description.job_type != JobType::Specified
                    || job.seeding_outstanding()
                {
                    continue;
                }
                let blocking: Vec<QueueStatus> = QueueStatus::ALL
                    .into_iter()
                    .filter(QueueStatus::blocks_completion)
                    .collect();
                if txn.count_entries(&EntryQuery::for_job(job.id()).with_statuses(&blocking))? > 0 {
                    continue;
                }

                let stale = txn.query_entries(
                    &EntryQuery::for_job(job.id()).with_statuses(&[QueueStatus::Purgatory]),
                )?;
                if !stale.is_empty() {
                    debug!("Job {}: expiring {} unreached documents", job.id(), stale.len());
                    for mut entry in stale {
                        entry.status = QueueStatus::EligibleForExpire;
                        entry.check_time = now_ms;
                        txn.save_entry(&entry)?;
                    }
                    continue;
                }
                let cleaning = EntryQuery::for_job(job.id()).with_statuses(&[QueueStatus::EligibleForExpire]);
                if txn.count_entries(&cleaning)? > 0 {
                    continue;
                }

                job.status = JobStatus::Completed;
                txn.save_job(&job)?;
                finished.push(job.description);
            }
            Ok(finished)
        })?;
        for job in &finished {
            info!("Job {} '{}' completed", job.id, job.name);
        }
        Ok(finished)
    }

    /// Hand documents of continuous jobs that outlived their expiration interval to cleanup.
    pub fn mark_expired(&self, now_ms: i64) -> SchedulerResult<usize> {
        let expired = self.transact(|txn| {
            let mut expired = 0usize;
            for job in txn.list_jobs()? {
                let Some(interval) = job.description.expiration_interval_ms else {
                    continue;
                };
                if job.status != JobStatus::Active || job.description.job_type != JobType::Continuous {
                    continue;
                }
                let query = EntryQuery::for_job(job.id())
                    .with_statuses(&[QueueStatus::Pending, QueueStatus::CompletedContinuous]);
                for mut entry in txn.query_entries(&query)? {
                    if entry.origination_time.is_some_and(|origin| origin + interval <= now_ms) {
                        entry.status = QueueStatus::EligibleForExpire;
                        entry.check_time = now_ms;
                        txn.save_entry(&entry)?;
                        expired += 1;
                    }
                }
            }
            Ok(expired)
        })?;
        if expired > 0 {
            info!("Marked {} documents expired", expired);
        }
        Ok(expired)
    }

    /// Entry count per status, for one job or all of them.
    pub fn queue_counts(&self, job_id: Option<JobId>) -> SchedulerResult<BTreeMap<QueueStatus, u64>> {
        self.transact(|txn| {
            let base = EntryQuery {
                job_ids: job_id.map(|id| vec![id]),
                ..Default::default()
            };
            let mut counts = BTreeMap::new();
            for status in QueueStatus::ALL {
                let count = txn.count_entries(&base.clone().with_statuses(&[status]))?;
                if count > 0 {
                    counts.insert(status, count);
                }
            }
            Ok(counts)
        })
    }
}
