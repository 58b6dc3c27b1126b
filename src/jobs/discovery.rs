//! Document discovery and rediscovery.
//!
//! A reference to a document either creates its queue entry or nudges an
//! existing one: documents left in purgatory by an earlier run come back,
//! finished documents come back only when their inherited data changed,
//! and in-flight documents are flagged for another pass.

use std::collections::BTreeMap;

use tracing::debug;

use super::{carrydown, hopcount, load_job, QueueManager};
use crate::connectors::ChildReference;
use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{document_hash, JobId, JobRecord, JobStatus, QueueEntry, QueueStatus};
use crate::scheduler::ConnectionLimits;
use crate::store::{EntryQuery, QueueStore, StoreTxn};

/// A document identifier with its derived keys.
#[derive(Debug, Clone)]
pub(crate) struct PreparedDocument {
    pub identifier: String,
    pub hash: String,
    pub bins: Vec<String>,
    /// Earliest fetch time asked for by the caller.
    pub check_time: Option<i64>,
}

impl<S: QueueStore> QueueManager<S> {
    pub(crate) fn prepare_document(&self, job: &JobRecord, identifier: &str) -> SchedulerResult<PreparedDocument> {
        Ok(PreparedDocument {
            identifier: identifier.to_string(),
            hash: document_hash(identifier),
            bins: self.ctx.bins_for(&job.description.connection_name, identifier)?,
            check_time: None,
        })
    }

    /// Create or rediscover the entry of a referenced document.
    ///
    /// Returns the saved entry and whether it became fetchable because of this call.
    pub(crate) fn discover(
        &self,
        txn: &mut dyn StoreTxn,
        job: &JobRecord,
        connection: &ConnectionLimits,
        document: &PreparedDocument,
        changed: bool,
        now_ms: i64,
    ) -> SchedulerResult<(QueueEntry, bool)> {
        let Some(mut entry) = txn.load_entry(job.id(), &document.hash)? else {
            let check_time = document.check_time.unwrap_or(now_ms);
            let mut entry = QueueEntry::new(job.id(), document.hash.clone(), document.identifier.clone(), check_time);
            let queued = if hopcount::exceeds_limits(txn, &job.description, &document.hash)? {
                entry.status = QueueStatus::HopcountExceeded;
                false
            } else {
                let priority = self.assign_priority(txn, connection, &document.bins)?;
                entry.set_priority(priority);
                true
            };
            txn.save_entry(&entry)?;
            return Ok((entry, queued));
        };

        let requeue = match entry.status {
            QueueStatus::Purgatory => true,
            QueueStatus::Complete | QueueStatus::CompletedContinuous => changed,
            QueueStatus::HopcountExceeded => !hopcount::exceeds_limits(txn, &job.description, &document.hash)?,
            QueueStatus::Active if changed => {
                entry.status = QueueStatus::ActiveNeedRescan;
                false
            }
            QueueStatus::Pending => {
                if let Some(earlier) = document.check_time.filter(|t| *t < entry.check_time) {
                    entry.check_time = earlier;
                }
                false
            }
            _ => false,
        };
        if requeue {
            entry.requeue(document.check_time.unwrap_or(now_ms));
            let priority = self.assign_priority(txn, connection, &document.bins)?;
            entry.set_priority(priority);
        }
        txn.save_entry(&entry)?;
        Ok((entry, requeue))
    }

    /// Bring back hop-limited documents that are within limits again.
    pub(crate) fn reactivate_reachable(&self, txn: &mut dyn StoreTxn, job: &JobRecord, now_ms: i64) -> SchedulerResult<usize> {
        let connection = self.ctx.connection(&job.description.connection_name)?;
        let query = EntryQuery::for_job(job.id()).with_statuses(&[QueueStatus::HopcountExceeded]);
        let mut reactivated = 0usize;
        for mut entry in txn.query_entries(&query)? {
            if hopcount::exceeds_limits(txn, &job.description, &entry.doc_hash)? {
                continue;
            }
            let bins = self.ctx.bins_for(&job.description.connection_name, &entry.doc_id)?;
            entry.requeue(now_ms);
            let priority = self.assign_priority(txn, &connection, &bins)?;
            entry.set_priority(priority);
            txn.save_entry(&entry)?;
            reactivated += 1;
        }
        if reactivated > 0 {
            debug!("Job {}: {} documents back within hop limits", job.id(), reactivated);
        }
        Ok(reactivated)
    }

    /// Requeue documents whose inputs changed.
    ///
    /// With `force`, pending and hop-limited documents are also pulled to
    /// the front of the schedule. Documents on their way out are left alone.
    pub(crate) fn requeue_entries(
        &self,
        txn: &mut dyn StoreTxn,
        job: &JobRecord,
        doc_hashes: &[String],
        force: bool,
        now_ms: i64,
    ) -> SchedulerResult<usize> {
        let connection = self.ctx.connection(&job.description.connection_name)?;
        let mut requeued = 0usize;
        for hash in doc_hashes {
            let Some(mut entry) = txn.load_entry(job.id(), hash)? else {
                if force {
                    return Err(SchedulerError::MissingEntry {
                        job_id: job.id(),
                        doc_hash: hash.clone(),
                    });
                }
                continue;
            };
            match entry.status {
                QueueStatus::Active => entry.status = QueueStatus::ActiveNeedRescan,
                QueueStatus::Complete | QueueStatus::CompletedContinuous | QueueStatus::Purgatory => {}
                QueueStatus::Pending | QueueStatus::HopcountExceeded if force => {}
                _ => continue,
            }
            if !entry.status.is_active() {
                let bins = self.ctx.bins_for(&job.description.connection_name, &entry.doc_id)?;
                entry.requeue(now_ms);
                let priority = self.assign_priority(txn, &connection, &bins)?;
                entry.set_priority(priority);
            }
            txn.save_entry(&entry)?;
            requeued += 1;
        }
        Ok(requeued)
    }

    /// Record the children a document references.
    ///
    /// Links and carry-down rows stay provisional until the parent's
    /// processing is completed; a failed parent reverts them.
    pub fn add_document_references(
        &self,
        job_id: JobId,
        parent_identifier: &str,
        children: &[ChildReference],
        now_ms: i64,
    ) -> SchedulerResult<usize> {
        let process_id = self.ctx.process_id().to_string();
        let parent_hash = document_hash(parent_identifier);
        let queued = self.transact(|txn| {
            let job = load_job(txn, job_id)?;
            if !matches!(job.status, JobStatus::Active | JobStatus::Paused) {
                return Err(SchedulerError::JobNotActive(job_id));
            }
            self.sync_minimum_depth(txn)?;
            let connection = self.ctx.connection(&job.description.connection_name)?;

            let mut queued = Vec::new();
            for child in children {
                let mut document = self.prepare_document(&job, &child.document_identifier)?;
                document.check_time = child.check_time;
                if job.description.tracks_hopcount() {
                    let link_type = child.link_type.as_deref().unwrap_or(hopcount::UNTYPED_LINK);
                    hopcount::record_link(txn, job_id, link_type, &parent_hash, &document.hash, &process_id)?;
                    hopcount::add_link(txn, &job.description, link_type, &parent_hash, &document.hash)?;
                }
                let changed = carrydown::record(
                    txn,
                    job_id,
                    &parent_hash,
                    &document.hash,
                    &child.carrydown,
                    &process_id,
                )?;
                let (_, is_queued) = self.discover(txn, &job, &connection, &document, changed, now_ms)?;
                if is_queued {
                    queued.push(document.bins);
                }
            }
            Ok(queued)
        })?;

        for bins in &queued {
            self.ctx.queue_tracker.add_record(bins);
        }
        debug!(
            "Job {}: {} references from {}, {} queued",
            job_id,
            children.len(),
            parent_identifier,
            queued.len()
        );
        Ok(queued.len())
    }

    /// Send documents back to pending right away, whatever they were doing.
    ///
    /// In-flight documents are flagged so their current result is not final.
    pub fn requeue_documents(&self, job_id: JobId, doc_hashes: &[String], now_ms: i64) -> SchedulerResult<usize> {
        self.transact(|txn| {
            self.sync_minimum_depth(txn)?;
            let job = load_job(txn, job_id)?;
            self.requeue_entries(txn, &job, doc_hashes, true, now_ms)
        })
    }

    /// Carry-down values a document currently inherits.
    pub fn carrydown_values(&self, job_id: JobId, document_identifier: &str) -> SchedulerResult<BTreeMap<String, Vec<String>>> {
        let hash = document_hash(document_identifier);
        self.transact(|txn| carrydown::values_for(txn, job_id, &hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::{doc, setup_manager, specified_job, web_connection};
    use crate::store::MemoryStore;

    fn entry(manager: &QueueManager<MemoryStore>, identifier: &str) -> QueueEntry {
        let hash = document_hash(identifier);
        manager
            .transact(|txn| txn.load_entry(1, &hash))
            .unwrap()
            .unwrap()
    }

    fn set_status(manager: &QueueManager<MemoryStore>, identifier: &str, status: QueueStatus) {
        let mut e = entry(manager, identifier);
        e.status = status;
        manager.transact(|txn| txn.save_entry(&e)).unwrap();
    }

    fn started() -> QueueManager<MemoryStore> {
        let (manager, _) = setup_manager(web_connection());
        manager.create_job(specified_job(1)).unwrap();
        manager.start_job(1, 0).unwrap();
        manager
    }

    #[test]
    fn test_new_reference_creates_ready_entry() {
        let manager = started();
        let parent = doc("host-a", "index");
        let child = doc("host-a", "1");
        assert_eq!(
            manager
                .add_document_references(1, &parent, &[ChildReference::new(&child)], 5)
                .unwrap(),
            1
        );
        assert!(entry(&manager, &child).is_ready(5));
    }

    #[test]
    fn test_rediscovery_pulls_waiting_document_earlier() {
        let manager = started();
        let child = doc("host-a", "1");
        manager
            .add_document_references(1, "p", &[ChildReference::new(&child).with_check_time(1_000)], 0)
            .unwrap();
        assert!(!entry(&manager, &child).is_ready(500));

        // A later request never delays it.
        manager
            .add_document_references(1, "q", &[ChildReference::new(&child).with_check_time(5_000)], 1)
            .unwrap();
        assert_eq!(entry(&manager, &child).check_time, 1_000);

        manager
            .add_document_references(1, "r", &[ChildReference::new(&child).with_check_time(400)], 2)
            .unwrap();
        let e = entry(&manager, &child);
        assert_eq!(e.check_time, 400);
        assert!(e.is_ready(500));

        // Without a requested time the schedule stays as it is.
        manager
            .add_document_references(1, "s", &[ChildReference::new(&child)], 3)
            .unwrap();
        assert_eq!(entry(&manager, &child).check_time, 400);
    }

    #[test]
    fn test_purgatory_document_comes_back() {
        let manager = started();
        let child = doc("host-a", "1");
        manager
            .add_document_references(1, "p", &[ChildReference::new(&child)], 0)
            .unwrap();
        set_status(&manager, &child, QueueStatus::Purgatory);

        manager
            .add_document_references(1, "p", &[ChildReference::new(&child)], 10)
            .unwrap();
        let e = entry(&manager, &child);
        assert_eq!(e.status, QueueStatus::Pending);
        assert!(e.is_ready(10));
    }

    #[test]
    fn test_complete_document_needs_changed_carrydown() {
        let manager = started();
        let child = doc("host-a", "1");
        let plain = ChildReference::new(&child);
        manager.add_document_references(1, "p", &[plain.clone()], 0).unwrap();
        set_status(&manager, &child, QueueStatus::Complete);

        manager.add_document_references(1, "p", &[plain], 1).unwrap();
        assert_eq!(entry(&manager, &child).status, QueueStatus::Complete);

        let tagged = ChildReference::new(&child).with_carrydown("acl", "x");
        manager.add_document_references(1, "p", &[tagged], 2).unwrap();
        assert_eq!(entry(&manager, &child).status, QueueStatus::Pending);
        assert_eq!(manager.carrydown_values(1, &child).unwrap()["acl"], vec!["x"]);
    }

    #[test]
    fn test_active_document_flagged_for_rescan() {
        let manager = started();
        let child = doc("host-a", "1");
        manager
            .add_document_references(1, "p", &[ChildReference::new(&child)], 0)
            .unwrap();
        set_status(&manager, &child, QueueStatus::Active);

        let tagged = ChildReference::new(&child).with_carrydown("acl", "y");
        manager.add_document_references(1, "p", &[tagged], 1).unwrap();
        assert_eq!(entry(&manager, &child).status, QueueStatus::ActiveNeedRescan);
    }

    #[test]
    fn test_requeue_documents_forces_pending() {
        let manager = started();
        let child = doc("host-a", "1");
        manager
            .add_document_references(1, "p", &[ChildReference::new(&child)], 0)
            .unwrap();
        set_status(&manager, &child, QueueStatus::Complete);

        let hash = document_hash(&child);
        assert_eq!(manager.requeue_documents(1, &[hash], 50).unwrap(), 1);
        let e = entry(&manager, &child);
        assert_eq!(e.status, QueueStatus::Pending);
        assert_eq!(e.check_time, 50);

        assert!(matches!(
            manager.requeue_documents(1, &["missing".to_string()], 50),
            Err(SchedulerError::MissingEntry { .. })
        ));
    }

    #[test]
    fn test_hop_limited_document_is_not_queued() {
        let (manager, _) = setup_manager(web_connection());
        let mut job = specified_job(1);
        job.hop_limits.insert("link".into(), 1);
        manager.create_job(job).unwrap();
        manager.start_job(1, 0).unwrap();

        let seed = doc("host-a", "seed");
        let a = doc("host-a", "a");
        let b = doc("host-a", "b");
        manager.add_seeds(1, &[seed.clone()], 0).unwrap();
        manager
            .add_document_references(1, &seed, &[ChildReference::new(&a).with_link_type("link")], 0)
            .unwrap();
        manager
            .add_document_references(1, &a, &[ChildReference::new(&b).with_link_type("link")], 0)
            .unwrap();

        assert_eq!(entry(&manager, &a).status, QueueStatus::Pending);
        assert_eq!(entry(&manager, &b).status, QueueStatus::HopcountExceeded);
    }

    #[test]
    fn test_references_rejected_for_aborted_job() {
        let manager = started();
        manager.abort_job(1).unwrap();
        assert!(matches!(
            manager.add_document_references(1, "p", &[ChildReference::new("https://h/x")], 0),
            Err(SchedulerError::JobNotActive(1))
        ));
    }
}
