//! Reclaiming work left behind by processes that died.

use tracing::{info, warn};

use super::{carrydown, hopcount, QueueManager};
use crate::error::SchedulerResult;
use crate::models::{QueueStatus, SeedStatus};
use crate::scheduler::reprioritization::REPRIORITIZATION_LEASE;
use crate::store::{EntryQuery, QueueStore, StoreTxn};

const CLAIMED: [QueueStatus; 4] = [
    QueueStatus::Active,
    QueueStatus::ActiveNeedRescan,
    QueueStatus::BeingDeleted,
    QueueStatus::BeingCleaned,
];

/// What a recovery pass gave back to the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub entries_reset: usize,
    pub seeds_restored: usize,
    pub seeding_released: usize,
}

impl<S: QueueStore> QueueManager<S> {
    /// Undo everything a dead process had in flight.
    ///
    /// Claimed documents return to their eligible states, its provisional
    /// links and carry-down are rolled back, and any seeding pass or sweep
    /// it owned is released.
    pub fn cleanup_process_data(&self, process_id: &str, now_ms: i64) -> SchedulerResult<RecoverySummary> {
        let summary = self.transact(|txn| {
            let summary = self.recover(txn, Some(process_id), now_ms)?;
            self.ctx.reprioritization.release_process(txn, process_id)?;
            Ok(summary)
        })?;
        info!("Recovered work of process {}: {:?}", process_id, summary);
        Ok(summary)
    }

    /// Reset the whole cluster after every process was stopped.
    pub fn restart_cluster(&self, now_ms: i64) -> SchedulerResult<RecoverySummary> {
        let summary = self.transact(|txn| {
            let summary = self.recover(txn, None, now_ms)?;
            txn.delete_lease(REPRIORITIZATION_LEASE)?;
            for mut entry in txn.query_entries(&EntryQuery::default())? {
                if entry.fail_time.take().is_some() {
                    txn.save_entry(&entry)?;
                }
            }
            Ok(summary)
        })?;
        warn!("Cluster restarted: {:?}", summary);
        Ok(summary)
    }

    fn recover(
        &self,
        txn: &mut dyn StoreTxn,
        process_id: Option<&str>,
        now_ms: i64,
    ) -> SchedulerResult<RecoverySummary> {
        let mut summary = RecoverySummary::default();
        let owned = |pid: Option<&String>| match process_id {
            Some(wanted) => pid.is_some_and(|p| p == wanted),
            None => pid.is_some(),
        };

        for mut job in txn.list_jobs()? {
            let job_id = job.id();
            if owned(job.seeding.process_id.as_ref()) {
                job.seeding.process_id = None;
                job.seeding.check_time = Some(now_ms);
                txn.save_job(&job)?;
                summary.seeding_released += 1;
            }

            let claimed = txn.query_entries(&EntryQuery::for_job(job_id).with_statuses(&CLAIMED))?;
            for mut entry in claimed.into_iter().filter(|e| owned(e.process_id.as_ref())) {
                match entry.status {
                    QueueStatus::BeingDeleted => {
                        entry.status = QueueStatus::EligibleForDelete;
                        entry.check_time = now_ms;
                        entry.process_id = None;
                    }
                    QueueStatus::BeingCleaned => {
                        entry.status = QueueStatus::EligibleForExpire;
                        entry.check_time = now_ms;
                        entry.process_id = None;
                    }
                    _ => {
                        entry.requeue(now_ms);
                        entry.needs_priority = true;
                    }
                }
                txn.save_entry(&entry)?;
                summary.entries_reset += 1;
            }

            let seeds = EntryQuery {
                seed_statuses: vec![SeedStatus::NewSeed],
                ..EntryQuery::for_job(job_id)
            };
            for mut entry in txn.query_entries(&seeds)? {
                if !owned(entry.seeding_process_id.as_ref()) {
                    continue;
                }
                entry.seed_status = SeedStatus::Seed;
                entry.seeding_process_id = None;
                txn.save_entry(&entry)?;
                summary.seeds_restored += 1;
            }

            let links_removed = match process_id {
                Some(pid) => {
                    carrydown::revert_process(txn, job_id, pid)?;
                    hopcount::revert_process_links(txn, job_id, pid)?
                }
                None => {
                    carrydown::revert_all(txn, job_id)?;
                    hopcount::revert_all_links(txn, job_id)?
                }
            };
            if links_removed && job.description.tracks_hopcount() {
                hopcount::recompute_job(txn, &job.description)?;
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::ChildReference;
    use crate::jobs::testing::{doc, setup_manager, specified_job, web_connection};
    use crate::models::{document_hash, DocumentOutcome};
    use crate::store::EdgeQuery;

    #[test]
    fn test_dead_process_claims_are_released() {
        let (manager, _) = setup_manager(web_connection());
        let pid = manager.context().process_id().to_string();
        manager.create_job(specified_job(1)).unwrap();
        manager.start_job(1, 0).unwrap();
        manager.claim_jobs_for_seeding(0).unwrap();
        let parent = doc("host-a", "1");
        manager.add_seeds(1, &[parent.clone()], 0).unwrap();
        manager.get_next_documents(10, 0).unwrap();
        manager
            .add_document_references(1, &parent, &[ChildReference::new(&doc("host-a", "2")).with_carrydown("k", "v")], 1)
            .unwrap();

        let summary = manager.cleanup_process_data(&pid, 5).unwrap();
        assert_eq!(summary.entries_reset, 1);
        assert_eq!(summary.seeds_restored, 1);
        assert_eq!(summary.seeding_released, 1);

        let entry = manager
            .transact(|txn| txn.load_entry(1, &document_hash(&parent)))
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert!(entry.process_id.is_none());
        assert_eq!(entry.seed_status, SeedStatus::Seed);
        let rows = manager
            .transact(|txn| txn.query_carrydown(&EdgeQuery::for_job(1)))
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(manager.job(1).unwrap().seeding.check_time, Some(5));
    }

    #[test]
    fn test_other_process_work_is_untouched() {
        let (manager, _) = setup_manager(web_connection());
        manager.create_job(specified_job(1)).unwrap();
        manager.start_job(1, 0).unwrap();
        manager.add_seeds(1, &[doc("host-a", "1")], 0).unwrap();
        manager.get_next_documents(10, 0).unwrap();

        let summary = manager.cleanup_process_data("someone-else", 5).unwrap();
        assert_eq!(summary, RecoverySummary::default());
        let counts = manager.queue_counts(Some(1)).unwrap();
        assert_eq!(counts.get(&QueueStatus::Active), Some(&1));
    }

    #[test]
    fn test_restart_resets_claims_and_fail_times() {
        let (manager, _) = setup_manager(web_connection());
        manager.create_job(specified_job(1)).unwrap();
        manager.start_job(1, 0).unwrap();
        let failing = doc("host-a", "1");
        manager.add_seeds(1, &[failing.clone(), doc("host-b", "1")], 0).unwrap();
        manager.get_next_documents(10, 0).unwrap();
        manager
            .complete_documents(
                1,
                &[(document_hash(&failing), DocumentOutcome::Failed { message: "x".into() })],
                1,
            )
            .unwrap();

        let summary = manager.restart_cluster(3).unwrap();
        assert_eq!(summary.entries_reset, 1);
        let entries = manager
            .transact(|txn| txn.query_entries(&EntryQuery::for_job(1)))
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.fail_time.is_none()));
        assert!(entries.iter().all(|e| e.status == QueueStatus::Pending));
    }
}
