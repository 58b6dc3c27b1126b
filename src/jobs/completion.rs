//! Recording what happened to claimed documents.

use tracing::{debug, warn};

use super::lifecycle::record_error;
use super::{carrydown, hopcount, load_job, QueueManager};
use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{
    document_hash, DocumentOutcome, JobError, JobErrorKind, JobId, JobRecord, JobStatus, JobType,
    QueueEntry, QueueStatus, ServiceInterruption,
};
use crate::store::{QueueStore, StoreTxn};

/// Tally of one `complete_documents` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionSummary {
    pub processed: usize,
    pub rejected: usize,
    pub requeued: usize,
    /// The batch stopped the job.
    pub job_failed: bool,
}

impl<S: QueueStore> QueueManager<S> {
    /// Apply the outcome of every claimed document, keyed by document hash.
    ///
    /// Child references recorded for a document are kept when it was
    /// processed or rejected and rolled back otherwise, in the same transaction.
    pub fn complete_documents(
        &self,
        job_id: JobId,
        results: &[(String, DocumentOutcome)],
        now_ms: i64,
    ) -> SchedulerResult<CompletionSummary> {
        let summary = self.transact(|txn| {
            let mut job = load_job(txn, job_id)?;
            let mut summary = CompletionSummary::default();
            let mut keep = Vec::new();
            let mut revert = Vec::new();

            for (doc_hash, outcome) in results {
                let Some(mut entry) = txn.load_entry(job_id, doc_hash)? else {
                    if job.status == JobStatus::Deleting {
                        continue;
                    }
                    return Err(SchedulerError::MissingEntry {
                        job_id,
                        doc_hash: doc_hash.clone(),
                    });
                };
                if !entry.status.is_active() {
                    if job.status == JobStatus::Deleting {
                        continue;
                    }
                    return Err(SchedulerError::InvalidTransition {
                        job_id,
                        doc_hash: doc_hash.clone(),
                        status: entry.status,
                        operation: "complete",
                    });
                }

                let stale = entry.status == QueueStatus::ActiveNeedRescan;
                entry.process_id = None;
                match outcome {
                    DocumentOutcome::Processed { .. } | DocumentOutcome::Rejected { .. } if stale => {
                        // Rediscovered with changes mid-flight; fetch again.
                        entry.requeue(now_ms);
                        entry.needs_priority = true;
                        revert.push(doc_hash.clone());
                        summary.requeued += 1;
                    }
                    DocumentOutcome::Processed { version } => {
                        self.mark_processed(txn, &job, &mut entry, version.clone(), None, now_ms)?;
                        keep.push(doc_hash.clone());
                        summary.processed += 1;
                    }
                    DocumentOutcome::Rejected { message } => {
                        self.mark_processed(txn, &job, &mut entry, None, Some(message.clone()), now_ms)?;
                        keep.push(doc_hash.clone());
                        summary.rejected += 1;
                    }
                    DocumentOutcome::Retryable(interruption) => {
                        revert.push(doc_hash.clone());
                        match self.interrupted(txn, &mut job, &mut entry, interruption, now_ms)? {
                            Interrupted::Retry => summary.requeued += 1,
                            Interrupted::Skipped => summary.rejected += 1,
                            Interrupted::JobFailed => summary.job_failed = true,
                        }
                    }
                    DocumentOutcome::Failed { message } => {
                        revert.push(doc_hash.clone());
                        if self.failed(txn, &mut job, &mut entry, message, now_ms)? {
                            summary.requeued += 1;
                        } else {
                            summary.job_failed = true;
                        }
                    }
                    DocumentOutcome::Fatal { message } => {
                        revert.push(doc_hash.clone());
                        let err = job_error(JobErrorKind::ConnectorFatal, message, &entry, now_ms);
                        record_error(txn, &mut job, err)?;
                        entry.requeue(now_ms);
                        summary.job_failed = true;
                    }
                    DocumentOutcome::Abandoned => {
                        revert.push(doc_hash.clone());
                        entry.requeue(now_ms);
                        summary.requeued += 1;
                    }
                }
                txn.save_entry(&entry)?;
            }

            self.finish_references(txn, &job, &keep, now_ms)?;
            self.revert_references(txn, &job, &revert)?;
            Ok(summary)
        })?;
        debug!("Job {}: completed batch {:?}", job_id, summary);
        Ok(summary)
    }

    fn mark_processed(
        &self,
        txn: &mut dyn StoreTxn,
        job: &JobRecord,
        entry: &mut QueueEntry,
        version: Option<String>,
        error: Option<String>,
        now_ms: i64,
    ) -> SchedulerResult<()> {
        entry.last_version = version;
        entry.last_error = error;
        entry.processed_before = true;
        entry.origination_time.get_or_insert(now_ms);
        entry.clear_failures();

        if hopcount::exceeds_limits(txn, &job.description, &entry.doc_hash)? {
            entry.status = QueueStatus::HopcountExceeded;
            return Ok(());
        }
        match job.description.job_type {
            JobType::Specified => entry.status = QueueStatus::Complete,
            JobType::Continuous => {
                entry.status = QueueStatus::CompletedContinuous;
                entry.check_time = job
                    .description
                    .rescan_interval_ms
                    .map_or(i64::MAX, |interval| now_ms.saturating_add(interval));
                entry.needs_priority = true;
            }
        }
        Ok(())
    }

    fn interrupted(
        &self,
        txn: &mut dyn StoreTxn,
        job: &mut JobRecord,
        entry: &mut QueueEntry,
        interruption: &ServiceInterruption,
        now_ms: i64,
    ) -> SchedulerResult<Interrupted> {
        entry.fail_time = match (entry.fail_time, interruption.deadline_ms) {
            (Some(current), Some(deadline)) => Some(current.min(deadline)),
            (current, deadline) => current.or(deadline),
        };
        if interruption.max_retries.is_some() {
            entry.fail_count += 1;
        }
        let exhausted = interruption.deadline_passed(now_ms)
            || entry.fail_time.is_some_and(|deadline| now_ms >= deadline)
            || interruption
                .max_retries
                .is_some_and(|max| entry.fail_count > max);
        if !exhausted {
            entry.requeue(interruption.retry_at_ms);
            entry.last_error = Some(interruption.message.clone());
            return Ok(Interrupted::Retry);
        }

        if interruption.abort_on_fail {
            let err = job_error(JobErrorKind::DeadlineExceeded, &interruption.message, entry, now_ms);
            record_error(txn, job, err)?;
            entry.requeue(now_ms);
            return Ok(Interrupted::JobFailed);
        }
        warn!(
            "Job {}: giving up on {} after repeated interruptions: {}",
            job.id(),
            entry.doc_id,
            interruption.message
        );
        self.mark_processed(txn, job, entry, None, Some(interruption.message.clone()), now_ms)?;
        Ok(Interrupted::Skipped)
    }

    /// Returns `false` when the failure exhausted the job's budget.
    fn failed(
        &self,
        txn: &mut dyn StoreTxn,
        job: &mut JobRecord,
        entry: &mut QueueEntry,
        message: &str,
        now_ms: i64,
    ) -> SchedulerResult<bool> {
        let settings = &self.ctx.settings;
        entry.fail_count += 1;
        entry.last_error = Some(message.to_string());
        let fail_time = *entry.fail_time.get_or_insert(now_ms + settings.failure_window_ms);

        if entry.fail_count > settings.max_document_failures || now_ms >= fail_time {
            let err = job_error(JobErrorKind::RetriesExhausted, message, entry, now_ms);
            record_error(txn, job, err)?;
            entry.requeue(now_ms);
            return Ok(false);
        }
        let backoff = settings.retry_backoff(entry.fail_count);
        entry.requeue(now_ms + backoff);
        debug!(
            "Job {}: {} failed ({}), retry {} in {}ms",
            job.id(),
            entry.doc_id,
            message,
            entry.fail_count,
            backoff
        );
        Ok(true)
    }

    /// Commit the provisional references of finished parents and requeue
    /// children whose inherited data changed.
    pub(crate) fn finish_references(
        &self,
        txn: &mut dyn StoreTxn,
        job: &JobRecord,
        parent_hashes: &[String],
        now_ms: i64,
    ) -> SchedulerResult<()> {
        if parent_hashes.is_empty() {
            return Ok(());
        }
        let changed: Vec<String> = carrydown::finish(txn, job.id(), parent_hashes)?
            .into_iter()
            .collect();
        if job.description.tracks_hopcount() && hopcount::finish_links(txn, &job.description, parent_hashes)? {
            hopcount::recompute_job(txn, &job.description)?;
            self.reactivate_reachable(txn, job, now_ms)?;
        }
        self.requeue_entries(txn, job, &changed, false, now_ms)?;
        Ok(())
    }

    pub(crate) fn revert_references(
        &self,
        txn: &mut dyn StoreTxn,
        job: &JobRecord,
        parent_hashes: &[String],
    ) -> SchedulerResult<()> {
        if parent_hashes.is_empty() {
            return Ok(());
        }
        carrydown::revert(txn, job.id(), parent_hashes)?;
        if job.description.tracks_hopcount() && hopcount::revert_links(txn, job.id(), parent_hashes)? {
            hopcount::recompute_job(txn, &job.description)?;
        }
        Ok(())
    }

    /// Hand documents this process claimed back to the queue untouched.
    ///
    /// Used when a batch could not be completed. Entries no longer active
    /// under this process are skipped. Returns how many were released.
    pub fn release_documents(&self, job_id: JobId, doc_hashes: &[String], now_ms: i64) -> SchedulerResult<usize> {
        let process_id = self.ctx.process_id().to_string();
        let released = self.transact(|txn| {
            let job = load_job(txn, job_id)?;
            let mut released = Vec::new();
            for hash in doc_hashes {
                let Some(mut entry) = txn.load_entry(job_id, hash)? else {
                    continue;
                };
                if !entry.status.is_active() || entry.process_id.as_deref() != Some(process_id.as_str()) {
                    continue;
                }
                entry.requeue(now_ms);
                txn.save_entry(&entry)?;
                released.push(hash.clone());
            }
            self.revert_references(txn, &job, &released)?;
            Ok(released.len())
        })?;
        if released > 0 {
            warn!("Job {}: released {} unfinished documents", job_id, released);
        }
        Ok(released)
    }

    /// Keep the references recorded for these parents.
    pub fn finish_parents(&self, job_id: JobId, parent_identifiers: &[String], now_ms: i64) -> SchedulerResult<()> {
        let hashes: Vec<String> = parent_identifiers.iter().map(|id| document_hash(id)).collect();
        self.transact(|txn| {
            self.sync_minimum_depth(txn)?;
            let job = load_job(txn, job_id)?;
            self.finish_references(txn, &job, &hashes, now_ms)
        })
    }

    /// Discard the references recorded for these parents.
    pub fn revert_parents(&self, job_id: JobId, parent_identifiers: &[String]) -> SchedulerResult<()> {
        let hashes: Vec<String> = parent_identifiers.iter().map(|id| document_hash(id)).collect();
        self.transact(|txn| {
            let job = load_job(txn, job_id)?;
            self.revert_references(txn, &job, &hashes)
        })
    }
}

enum Interrupted {
    Retry,
    Skipped,
    JobFailed,
}

fn job_error(kind: JobErrorKind, message: &str, entry: &QueueEntry, now_ms: i64) -> JobError {
    JobError {
        kind,
        message: message.to_string(),
        document: Some(entry.doc_id.clone()),
        occurred_at_ms: now_ms,
    }
}
