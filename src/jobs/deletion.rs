//! Removing documents from the output: job deletion and expiry cleanup.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use super::lifecycle::purge_if_empty;
use super::{carrydown, hopcount, load_job, QueueManager};
use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{JobDescription, JobId, JobRecord, JobStatus, QueueStatus};
use crate::store::{EntryQuery, QueueStore};

/// A document claimed for removal from the output.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletionTask {
    pub job: JobDescription,
    pub doc_hash: String,
    pub document_identifier: String,
}

impl<S: QueueStore> QueueManager<S> {
    /// Claim documents of deleting jobs.
    pub fn get_next_deletable(&self, max_documents: usize, now_ms: i64) -> SchedulerResult<Vec<DeletionTask>> {
        self.claim_for_removal(QueueStatus::EligibleForDelete, QueueStatus::BeingDeleted, max_documents, now_ms)
    }

    /// Claim expired or unreached documents of running jobs.
    pub fn get_next_cleanable(&self, max_documents: usize, now_ms: i64) -> SchedulerResult<Vec<DeletionTask>> {
        self.claim_for_removal(QueueStatus::EligibleForExpire, QueueStatus::BeingCleaned, max_documents, now_ms)
    }

    fn claim_for_removal(
        &self,
        from: QueueStatus,
        to: QueueStatus,
        max_documents: usize,
        now_ms: i64,
    ) -> SchedulerResult<Vec<DeletionTask>> {
        if max_documents == 0 {
            return Ok(Vec::new());
        }
        let process_id = self.ctx.process_id().to_string();
        let tasks = self.transact(|txn| {
            let mut jobs: BTreeMap<JobId, JobRecord> = BTreeMap::new();
            let mut tasks = Vec::new();
            let query = EntryQuery {
                statuses: vec![from],
                due_by: Some(now_ms),
                ..Default::default()
            };
            for mut entry in txn.query_entries(&query)? {
                if tasks.len() >= max_documents {
                    break;
                }
                if !jobs.contains_key(&entry.job_id) {
                    let job = load_job(txn, entry.job_id)?;
                    jobs.insert(entry.job_id, job);
                }
                let Some(job) = jobs.get(&entry.job_id) else {
                    continue;
                };
                // Cleanup waits while its job is paused or stopped.
                if to == QueueStatus::BeingCleaned && job.status != JobStatus::Active {
                    continue;
                }
                entry.status = to;
                entry.process_id = Some(process_id.clone());
                txn.save_entry(&entry)?;
                tasks.push(DeletionTask {
                    job: job.description.clone(),
                    doc_hash: entry.doc_hash.clone(),
                    document_identifier: entry.doc_id.clone(),
                });
            }
            Ok(tasks)
        })?;
        if !tasks.is_empty() {
            debug!("Claimed {} documents for {}", tasks.len(), to.label());
        }
        Ok(tasks)
    }

    /// Forget documents the output has dropped.
    ///
    /// Children that inherited data from them are requeued; a deleting job
    /// is purged once its last entry is gone.
    pub fn deletion_done(&self, job_id: JobId, doc_hashes: &[String], now_ms: i64) -> SchedulerResult<()> {
        let purged = self.transact(|txn| {
            self.sync_minimum_depth(txn)?;
            let job = load_job(txn, job_id)?;
            let mut children = BTreeSet::new();
            let mut links_removed = false;

            for hash in doc_hashes {
                let entry = txn
                    .load_entry(job_id, hash)?
                    .ok_or_else(|| SchedulerError::MissingEntry {
                        job_id,
                        doc_hash: hash.clone(),
                    })?;
                if !matches!(entry.status, QueueStatus::BeingDeleted | QueueStatus::BeingCleaned) {
                    return Err(SchedulerError::InvalidTransition {
                        job_id,
                        doc_hash: hash.clone(),
                        status: entry.status,
                        operation: "finish removal",
                    });
                }
                txn.delete_entry(job_id, hash)?;
                children.extend(carrydown::remove_parent(txn, job_id, hash)?);
                if job.description.tracks_hopcount() {
                    links_removed |= hopcount::remove_document(txn, &job.description, hash)?;
                }
            }

            if job.status == JobStatus::Deleting {
                return purge_if_empty(txn, job_id);
            }
            if links_removed {
                hopcount::recompute_job(txn, &job.description)?;
            }
            for hash in doc_hashes {
                children.remove(hash);
            }
            let children: Vec<String> = children.into_iter().collect();
            self.requeue_entries(txn, &job, &children, false, now_ms)?;
            Ok(false)
        })?;
        if !purged {
            info!("Job {}: removed {} documents", job_id, doc_hashes.len());
        }
        Ok(())
    }

    /// Return claimed documents to their eligible state after the output failed.
    pub fn deletion_interrupted(&self, job_id: JobId, doc_hashes: &[String], retry_at_ms: i64) -> SchedulerResult<()> {
        self.transact(|txn| {
            for hash in doc_hashes {
                let Some(mut entry) = txn.load_entry(job_id, hash)? else {
                    continue;
                };
                entry.status = match entry.status {
                    QueueStatus::BeingDeleted => QueueStatus::EligibleForDelete,
                    QueueStatus::BeingCleaned => QueueStatus::EligibleForExpire,
                    status => {
                        return Err(SchedulerError::InvalidTransition {
                            job_id,
                            doc_hash: hash.clone(),
                            status,
                            operation: "interrupt removal",
                        })
                    }
                };
                entry.check_time = retry_at_ms;
                entry.process_id = None;
                txn.save_entry(&entry)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::ChildReference;
    use crate::jobs::testing::{doc, setup_manager, specified_job, web_connection};
    use crate::models::{document_hash, DocumentOutcome, HopcountMode};
    use crate::store::MemoryStore;

    fn process_all(manager: &QueueManager<MemoryStore>, now_ms: i64) -> Vec<String> {
        let mut done = Vec::new();
        for batch in manager.get_next_documents(10, now_ms).unwrap() {
            let results: Vec<(String, DocumentOutcome)> = batch
                .documents
                .iter()
                .map(|d| (d.doc_hash.clone(), DocumentOutcome::processed("v1")))
                .collect();
            manager.complete_documents(batch.job.id, &results, now_ms).unwrap();
            done.extend(results.into_iter().map(|(hash, _)| hash));
        }
        done
    }

    fn run_seeding(manager: &QueueManager<MemoryStore>, seeds: &[String], now_ms: i64) {
        manager.claim_jobs_for_seeding(now_ms).unwrap();
        manager.add_seeds(1, seeds, now_ms).unwrap();
        manager.finish_seeding(1, true, now_ms).unwrap();
    }

    #[test]
    fn test_deleted_job_is_purged_after_output_removal() {
        let (manager, _) = setup_manager(web_connection());
        manager.create_job(specified_job(1)).unwrap();
        manager.start_job(1, 0).unwrap();
        manager
            .add_seeds(1, &[doc("host-a", "1"), doc("host-a", "2")], 0)
            .unwrap();
        let claimed = manager.get_next_documents(1, 0).unwrap();
        let first = claimed[0].documents[0].doc_hash.clone();
        manager
            .complete_documents(1, &[(first.clone(), DocumentOutcome::processed("v1"))], 1)
            .unwrap();

        manager.delete_job(1, 2).unwrap();
        let tasks = manager.get_next_deletable(10, 2).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].doc_hash, first);
        assert!(manager.get_next_deletable(10, 2).unwrap().is_empty());

        manager.deletion_done(1, &[first], 3).unwrap();
        assert!(matches!(manager.job(1), Err(SchedulerError::UnknownJob(1))));
    }

    #[test]
    fn test_interrupted_deletion_waits_for_retry() {
        let (manager, _) = setup_manager(web_connection());
        manager.create_job(specified_job(1)).unwrap();
        manager.start_job(1, 0).unwrap();
        manager.add_seeds(1, &[doc("host-a", "1")], 0).unwrap();
        process_all(&manager, 0);
        manager.delete_job(1, 1).unwrap();

        let tasks = manager.get_next_deletable(10, 1).unwrap();
        manager
            .deletion_interrupted(1, &[tasks[0].doc_hash.clone()], 100)
            .unwrap();
        assert!(manager.get_next_deletable(10, 50).unwrap().is_empty());
        assert_eq!(manager.get_next_deletable(10, 100).unwrap().len(), 1);
    }

    #[test]
    fn test_unreached_documents_are_cleaned_before_completion() {
        let (manager, _) = setup_manager(web_connection());
        manager.create_job(specified_job(1)).unwrap();
        manager.start_job(1, 0).unwrap();
        run_seeding(&manager, &[doc("host-a", "1")], 0);
        process_all(&manager, 0);
        assert_eq!(manager.finish_job_runs(1).unwrap().len(), 1);

        // The second run no longer reports the seed.
        manager.start_job(1, 10).unwrap();
        run_seeding(&manager, &[], 10);
        assert!(manager.finish_job_runs(11).unwrap().is_empty());

        let tasks = manager.get_next_cleanable(10, 11).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].document_identifier, doc("host-a", "1"));
        manager.deletion_done(1, &[tasks[0].doc_hash.clone()], 12).unwrap();

        assert_eq!(manager.finish_job_runs(13).unwrap().len(), 1);
        assert_eq!(manager.job(1).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_removing_parent_requeues_inheriting_child() {
        let (manager, _) = setup_manager(web_connection());
        manager.create_job(specified_job(1)).unwrap();
        manager.start_job(1, 0).unwrap();
        let parent = doc("host-a", "p");
        let child = doc("host-a", "c");
        manager.add_seeds(1, &[parent.clone()], 0).unwrap();
        manager.get_next_documents(10, 0).unwrap();
        manager
            .add_document_references(1, &parent, &[ChildReference::new(&child).with_carrydown("acl", "x")], 1)
            .unwrap();
        manager
            .complete_documents(1, &[(document_hash(&parent), DocumentOutcome::processed("v1"))], 1)
            .unwrap();
        assert_eq!(process_all(&manager, 2), vec![document_hash(&child)]);

        manager
            .transact(|txn| {
                let mut entry = txn.load_entry(1, &document_hash(&parent))?.unwrap();
                entry.status = QueueStatus::EligibleForExpire;
                txn.save_entry(&entry)
            })
            .unwrap();
        let tasks = manager.get_next_cleanable(10, 3).unwrap();
        manager.deletion_done(1, &[tasks[0].doc_hash.clone()], 3).unwrap();

        let entry = manager
            .transact(|txn| txn.load_entry(1, &document_hash(&child)))
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert!(manager.carrydown_values(1, &child).unwrap().is_empty());
    }

    #[test]
    fn test_no_delete_mode_keeps_distances_after_removal() {
        let (manager, _) = setup_manager(web_connection());
        let mut job = specified_job(1);
        job.hopcount_mode = HopcountMode::NoDelete;
        job.hop_limits.insert("link".to_string(), 1);
        manager.create_job(job).unwrap();
        manager.start_job(1, 0).unwrap();

        let seed = doc("host-a", "s");
        let middle = doc("host-a", "m");
        let child = doc("host-a", "c");
        manager.add_seeds(1, &[seed.clone()], 0).unwrap();
        manager.get_next_documents(10, 0).unwrap();
        manager
            .add_document_references(1, &seed, &[ChildReference::new(&middle).with_link_type("redirect")], 1)
            .unwrap();
        manager
            .complete_documents(1, &[(document_hash(&seed), DocumentOutcome::processed("v1"))], 1)
            .unwrap();
        manager.get_next_documents(10, 2).unwrap();
        manager
            .add_document_references(1, &middle, &[ChildReference::new(&child).with_link_type("link")], 2)
            .unwrap();
        manager
            .complete_documents(1, &[(document_hash(&middle), DocumentOutcome::processed("v1"))], 2)
            .unwrap();

        let child_hash = document_hash(&child);
        let before = manager
            .transact(|txn| hopcount::distances(txn, 1, &child_hash))
            .unwrap();
        assert_eq!(before.get("link"), Some(&1));

        manager
            .transact(|txn| {
                let mut entry = txn.load_entry(1, &document_hash(&middle))?.unwrap();
                entry.status = QueueStatus::EligibleForExpire;
                txn.save_entry(&entry)
            })
            .unwrap();
        let tasks = manager.get_next_cleanable(10, 3).unwrap();
        assert_eq!(tasks.len(), 1);
        manager.deletion_done(1, &[tasks[0].doc_hash.clone()], 3).unwrap();

        let (after, exceeded) = manager
            .transact(|txn| {
                let job = load_job(txn, 1)?;
                Ok((
                    hopcount::distances(txn, 1, &child_hash)?,
                    hopcount::exceeds_limits(txn, &job.description, &child_hash)?,
                ))
            })
            .unwrap();
        assert_eq!(after, before);
        assert!(!exceeded);
    }

    #[test]
    fn test_finishing_unclaimed_removal_is_rejected() {
        let (manager, _) = setup_manager(web_connection());
        manager.create_job(specified_job(1)).unwrap();
        manager.start_job(1, 0).unwrap();
        manager.add_seeds(1, &[doc("host-a", "1")], 0).unwrap();
        let err = manager
            .deletion_done(1, &[document_hash(&doc("host-a", "1"))], 1)
            .unwrap_err();
        assert!(err.is_invariant_violation());
    }
}
