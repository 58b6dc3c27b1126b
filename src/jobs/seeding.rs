//! Seeding passes: claiming them, registering seeds, and closing them out.

use tracing::{info, warn};

use super::{hopcount, load_job, QueueManager};
use crate::error::SchedulerResult;
use crate::jobs::lifecycle::record_error;
use crate::models::{
    HopcountMode, JobError, JobErrorKind, JobId, JobRecord, JobStatus, JobType, SeedStatus,
    ServiceInterruption,
};
use crate::store::{EntryQuery, QueueStore};

impl<S: QueueStore> QueueManager<S> {
    /// Claim every running job whose seeding pass is due.
    pub fn claim_jobs_for_seeding(&self, now_ms: i64) -> SchedulerResult<Vec<JobRecord>> {
        let process_id = self.ctx.process_id().to_string();
        let claimed = self.transact(|txn| {
            let mut claimed = Vec::new();
            for mut job in txn.list_jobs()? {
                let due = job.seeding.check_time.is_some_and(|t| t <= now_ms);
                if job.status != JobStatus::Active || job.seeding.process_id.is_some() || !due {
                    continue;
                }
                job.seeding.process_id = Some(process_id.clone());
                txn.save_job(&job)?;
                claimed.push(job);
            }
            Ok(claimed)
        })?;
        for job in &claimed {
            info!("Process {} seeding job {}", process_id, job.id());
        }
        Ok(claimed)
    }

    /// Register seed documents found by the current pass.
    pub fn add_seeds(&self, job_id: JobId, identifiers: &[String], now_ms: i64) -> SchedulerResult<usize> {
        self.add_seeds_at(job_id, identifiers, None, now_ms)
    }

    /// Register seeds that should not be fetched before `check_time_ms`.
    ///
    /// Seeds already waiting are moved earlier when the requested time is sooner.
    pub fn add_seeds_at(
        &self,
        job_id: JobId,
        identifiers: &[String],
        check_time_ms: Option<i64>,
        now_ms: i64,
    ) -> SchedulerResult<usize> {
        let process_id = self.ctx.process_id().to_string();
        let added = self.transact(|txn| {
            self.sync_minimum_depth(txn)?;
            let job = load_job(txn, job_id)?;
            let connection = self.ctx.connection(&job.description.connection_name)?;
            let mut added = Vec::new();
            for identifier in identifiers {
                let mut document = self.prepare_document(&job, identifier)?;
                document.check_time = check_time_ms;
                if job.description.tracks_hopcount() {
                    hopcount::add_seed(txn, &job.description, &document.hash)?;
                }
                let (mut entry, queued) = self.discover(txn, &job, &connection, &document, false, now_ms)?;
                entry.seed_status = SeedStatus::NewSeed;
                entry.seeding_process_id = Some(process_id.clone());
                txn.save_entry(&entry)?;
                if queued {
                    added.push(document.bins);
                }
            }
            Ok(added)
        })?;

        for bins in &added {
            self.ctx.queue_tracker.add_record(bins);
        }
        Ok(added.len())
    }

    /// Close a seeding pass.
    ///
    /// A full pass demotes seeds it did not report again; an incremental
    /// pass only confirms the ones it added.
    pub fn finish_seeding(&self, job_id: JobId, full: bool, now_ms: i64) -> SchedulerResult<()> {
        let process_id = self.ctx.process_id().to_string();
        let demoted = self.transact(|txn| {
            let mut job = load_job(txn, job_id)?;
            let mut demoted = 0usize;
            if full {
                let stale = EntryQuery {
                    seed_statuses: vec![SeedStatus::Seed],
                    ..EntryQuery::for_job(job_id)
                };
                for mut entry in txn.query_entries(&stale)? {
                    entry.seed_status = SeedStatus::NotSeed;
                    txn.save_entry(&entry)?;
                    demoted += 1;
                }
            }
            let fresh = EntryQuery {
                seed_statuses: vec![SeedStatus::NewSeed],
                seeding_process_id: Some(process_id.clone()),
                ..EntryQuery::for_job(job_id)
            };
            for mut entry in txn.query_entries(&fresh)? {
                entry.seed_status = SeedStatus::Seed;
                entry.seeding_process_id = None;
                txn.save_entry(&entry)?;
            }

            // Only accurate counting lets a dropped seed lengthen distances.
            if demoted > 0
                && job.description.tracks_hopcount()
                && job.description.hopcount_mode == HopcountMode::Accurate
            {
                hopcount::recompute_job(txn, &job.description)?;
                self.reactivate_reachable(txn, &job, now_ms)?;
            }

            job.seeding.process_id = None;
            job.seeding.fail_time = None;
            job.seeding.fail_count = 0;
            job.seeding.last_seeding_ms = Some(now_ms);
            job.seeding.check_time = match job.description.job_type {
                JobType::Continuous => job.description.reseed_interval_ms.map(|interval| now_ms + interval),
                JobType::Specified => None,
            };
            txn.save_job(&job)?;
            Ok(demoted)
        })?;
        info!(
            "Finished {} seeding of job {} ({} seeds demoted)",
            if full { "full" } else { "incremental" },
            job_id,
            demoted
        );
        Ok(())
    }

    /// Release a seeding pass that hit a service interruption and schedule a retry.
    ///
    /// Returns `false` when the interruption outlived its budget and the job was stopped.
    pub fn seeding_interrupted(
        &self,
        job_id: JobId,
        interruption: &ServiceInterruption,
        now_ms: i64,
    ) -> SchedulerResult<bool> {
        let window = self.ctx.settings.failure_window_ms;
        let retried = self.transact(|txn| {
            let mut job = load_job(txn, job_id)?;
            job.seeding.process_id = None;
            job.seeding.fail_count += 1;
            let fail_time = job
                .seeding
                .fail_time
                .unwrap_or(now_ms + window)
                .min(interruption.deadline_ms.unwrap_or(i64::MAX));
            job.seeding.fail_time = Some(fail_time);

            let exhausted = interruption.deadline_passed(now_ms)
                || now_ms >= fail_time
                || interruption
                    .max_retries
                    .is_some_and(|max| job.seeding.fail_count > max);
            if exhausted {
                let err = JobError {
                    kind: JobErrorKind::SeedingFailed,
                    message: interruption.message.clone(),
                    document: None,
                    occurred_at_ms: now_ms,
                };
                if !record_error(txn, &mut job, err)? {
                    txn.save_job(&job)?;
                }
                return Ok(false);
            }
            job.seeding.check_time = Some(interruption.retry_at_ms);
            txn.save_job(&job)?;
            Ok(true)
        })?;
        if retried {
            warn!(
                "Seeding of job {} interrupted ({}); retrying at {}",
                job_id, interruption.message, interruption.retry_at_ms
            );
        }
        Ok(retried)
    }

    /// Stop a job whose connector cannot seed it at all.
    pub fn seeding_failed(&self, job_id: JobId, message: &str, now_ms: i64) -> SchedulerResult<()> {
        self.transact(|txn| {
            let mut job = load_job(txn, job_id)?;
            job.seeding.process_id = None;
            if !record_error(
                txn,
                &mut job,
                JobError {
                    kind: JobErrorKind::SeedingFailed,
                    message: message.to_string(),
                    document: None,
                    occurred_at_ms: now_ms,
                },
            )? {
                txn.save_job(&job)?;
            }
            Ok(())
        })
    }
}
