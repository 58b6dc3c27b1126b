//! Priority assignment, document stuffing and reprioritization sweeps.
//!
//! A stuffing pass reads the most urgent ready documents of every running
//! job and merges them fairly across throttle bins: a document is only
//! eligible once it heads every bin it belongs to, and among eligible
//! documents the one whose bins are least busy goes first. Documents that
//! exceed a bin's budget or their connection's capacity are deferred to
//! the blocking pool rather than claimed.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{carrydown, hopcount, load_job, QueueManager};
use crate::connectors::DocumentDescription;
use crate::error::SchedulerResult;
use crate::models::{JobDescription, JobId, JobRecord, JobStatus, QueueEntry, QueueStatus};
use crate::scheduler::queue_tracker::assignment_rating;
use crate::scheduler::{ConnectionLimits, DepthStatistics};
use crate::store::{EntryQuery, QueueStore, StoreTxn};

/// Documents of one job claimed by a stuffing pass, sized for one connector call.
#[derive(Debug, Clone)]
pub struct DocumentBatch {
    pub job: JobDescription,
    pub documents: Vec<DocumentDescription>,
}

const READY_STATUSES: [QueueStatus; 2] = [QueueStatus::Pending, QueueStatus::CompletedContinuous];

struct Candidate {
    entry: QueueEntry,
    connection: Arc<ConnectionLimits>,
    bins: Vec<String>,
}

struct ClaimedDocument {
    job: JobDescription,
    connection_name: String,
    description: DocumentDescription,
}

#[derive(Default)]
struct StuffPass {
    claimed: Vec<ClaimedDocument>,
    deferred: Vec<(JobId, String)>,
    priorities: Vec<f64>,
}

impl<S: QueueStore> QueueManager<S> {
    /// Give pending documents that lost or never had a priority a fresh one.
    pub fn prioritize_documents(&self, now_ms: i64) -> SchedulerResult<usize> {
        let limit = self.ctx.settings.priority_batch_size;
        let (depth, jobs, candidates) = self.transact(|txn| {
            let depth = self.ctx.reprioritization.get_minimum_depth(txn)?;
            let jobs: HashMap<JobId, JobRecord> =
                txn.list_jobs()?.into_iter().map(|job| (job.id(), job)).collect();
            let candidates = txn.query_entries(&EntryQuery {
                statuses: READY_STATUSES.to_vec(),
                needs_priority: Some(true),
                due_by: Some(now_ms),
                limit: Some(limit),
                ..Default::default()
            })?;
            Ok((depth, jobs, candidates))
        })?;
        if candidates.is_empty() {
            return Ok(0);
        }
        self.ctx.queue_tracker.observe_minimum_depth(depth);

        // Fetch the counter values ahead of time in small transactions.
        let local_depth = self.ctx.queue_tracker.current_minimum_depth();
        let mut planned = Vec::with_capacity(candidates.len());
        for entry in candidates {
            let Some(job) = jobs.get(&entry.job_id) else {
                continue;
            };
            let connection = self.ctx.connection(&job.description.connection_name)?;
            let bins = self.ctx.bins_for(&job.description.connection_name, &entry.doc_id)?;
            for bin in &bins {
                let k = self.ctx.queue_tracker.scale_factor(connection.limits.max_fetch_rate(bin));
                self.ctx.reprioritization.add_preload_request(
                    &connection.connection.connector_id,
                    bin,
                    local_depth / k,
                );
            }
            planned.push((entry, connection, bins));
        }
        self.ctx.reprioritization.preload_bin_values(self.store.as_ref())?;

        let result = self.transact(|txn| {
            let mut assigned = 0usize;
            for (planned_entry, connection, bins) in &planned {
                let Some(mut entry) = txn.load_entry(planned_entry.job_id, &planned_entry.doc_hash)? else {
                    continue;
                };
                if !entry.needs_priority || !READY_STATUSES.contains(&entry.status) {
                    continue;
                }
                let priority = self.assign_priority(txn, connection, bins)?;
                entry.set_priority(priority);
                txn.save_entry(&entry)?;
                assigned += 1;
            }
            Ok(assigned)
        });
        self.ctx.reprioritization.clear_preloaded_values();
        let assigned = result?;
        debug!("Assigned priorities to {} documents", assigned);
        Ok(assigned)
    }

    /// Claim up to `max_documents` ready documents for this process.
    pub fn get_next_documents(&self, max_documents: usize, now_ms: i64) -> SchedulerResult<Vec<DocumentBatch>> {
        if max_documents == 0 {
            return Ok(Vec::new());
        }
        let pass = self.transact(|txn| self.stuff(txn, max_documents, now_ms))?;

        for claimed in &pass.claimed {
            self.ctx.with_budget(&claimed.connection_name, |budget| {
                for bin in &claimed.description.bins {
                    budget.spend(bin);
                }
            });
        }
        for (job_id, doc_hash) in &pass.deferred {
            self.ctx.blocking.add(*job_id, doc_hash);
        }
        self.ctx.queue_tracker.assess_minimum_depth(&pass.priorities);

        if !pass.claimed.is_empty() || !pass.deferred.is_empty() {
            debug!(
                "Stuffing pass claimed {} documents, deferred {}",
                pass.claimed.len(),
                pass.deferred.len()
            );
        }
        self.batch(pass.claimed)
    }

    fn stuff(&self, txn: &mut dyn StoreTxn, max_documents: usize, now_ms: i64) -> SchedulerResult<StuffPass> {
        let jobs: HashMap<JobId, JobRecord> = txn
            .list_jobs()?
            .into_iter()
            .filter(|job| job.status == JobStatus::Active)
            .map(|job| (job.id(), job))
            .collect();
        if jobs.is_empty() {
            return Ok(StuffPass::default());
        }
        self.sync_minimum_depth(txn)?;

        let settings = &self.ctx.settings;
        let ready = txn.query_entries(&EntryQuery {
            job_ids: Some(jobs.keys().copied().collect()),
            statuses: READY_STATUSES.to_vec(),
            due_by: Some(now_ms),
            needs_priority: Some(false),
            order_by_priority: true,
            limit: Some(max_documents.saturating_mul(settings.candidate_multiplier.max(1))),
            ..Default::default()
        })?;

        let mut candidates = Vec::with_capacity(ready.len());
        for mut entry in ready {
            let job = &jobs[&entry.job_id];
            if hopcount::exceeds_limits(txn, &job.description, &entry.doc_hash)? {
                entry.status = QueueStatus::HopcountExceeded;
                txn.save_entry(&entry)?;
                continue;
            }
            let connection = self.ctx.connection(&job.description.connection_name)?;
            let bins = self.ctx.bins_for(&job.description.connection_name, &entry.doc_id)?;
            candidates.push(Candidate { entry, connection, bins });
        }

        // Per-bin queues in priority order, keyed by connection and bin.
        let mut bin_queues: HashMap<(String, String), VecDeque<usize>> = HashMap::new();
        for (index, candidate) in candidates.iter().enumerate() {
            for bin in &candidate.bins {
                bin_queues
                    .entry((candidate.connection.connection.name.clone(), bin.clone()))
                    .or_default()
                    .push_back(index);
            }
        }

        let mut in_flight: HashMap<String, u64> = HashMap::new();
        let mut connection_claims: HashMap<String, u64> = HashMap::new();
        let mut bin_claims: HashMap<(String, String), u64> = HashMap::new();
        let mut alive = vec![true; candidates.len()];
        let mut depth_stats = DepthStatistics::new();
        let mut pass = StuffPass::default();

        while pass.claimed.len() < max_documents {
            let heads_all_bins = |index: usize| {
                let candidate = &candidates[index];
                candidate.bins.iter().all(|bin| {
                    bin_queues
                        .get(&(candidate.connection.connection.name.clone(), bin.clone()))
                        .and_then(|queue| queue.front())
                        == Some(&index)
                })
            };
            let best = (0..candidates.len())
                .filter(|&index| alive[index] && heads_all_bins(index))
                .map(|index| {
                    let rating = assignment_rating(&candidates[index].bins, |bin| {
                        let local: u64 = bin_claims
                            .iter()
                            .filter(|((_, claimed_bin), _)| claimed_bin == bin)
                            .map(|(_, count)| *count)
                            .sum();
                        self.ctx.queue_tracker.active_count(bin) + local
                    });
                    (index, rating)
                })
                .fold(None, |best: Option<(usize, f64)>, (index, rating)| match best {
                    Some((_, best_rating)) if best_rating >= rating => best,
                    _ => Some((index, rating)),
                });
            let Some((index, _)) = best else {
                break;
            };

            alive[index] = false;
            let candidate = &candidates[index];
            let connection_name = candidate.connection.connection.name.clone();
            for bin in &candidate.bins {
                if let Some(queue) = bin_queues.get_mut(&(connection_name.clone(), bin.clone())) {
                    queue.pop_front();
                }
            }

            if !self.admissible(txn, &jobs, candidate, &mut in_flight, &connection_claims, &bin_claims, now_ms)? {
                pass.deferred.push((candidate.entry.job_id, candidate.entry.doc_hash.clone()));
                continue;
            }

            let mut entry = candidate.entry.clone();
            entry.status = QueueStatus::Active;
            entry.process_id = Some(self.ctx.process_id().to_string());
            txn.save_entry(&entry)?;

            *connection_claims.entry(connection_name.clone()).or_insert(0) += 1;
            for bin in &candidate.bins {
                *bin_claims.entry((connection_name.clone(), bin.clone())).or_insert(0) += 1;
            }
            if let Some(priority) = entry.priority {
                depth_stats.add(priority);
            }

            let job = &jobs[&entry.job_id];
            let description = DocumentDescription {
                job_id: entry.job_id,
                doc_hash: entry.doc_hash.clone(),
                document_identifier: entry.doc_id.clone(),
                last_version: entry.last_version.clone(),
                carrydown: carrydown::values_for(txn, entry.job_id, &entry.doc_hash)?,
                bins: candidate.bins.clone(),
                fail_count: entry.fail_count,
            };
            pass.claimed.push(ClaimedDocument {
                job: job.description.clone(),
                connection_name,
                description,
            });
        }

        pass.priorities = depth_stats.take();
        self.ctx
            .reprioritization
            .assess_minimum_depth(txn, &pass.priorities, now_ms)?;
        Ok(pass)
    }

    /// Whether the connection and every bin of a candidate can take one more document.
    #[allow(clippy::too_many_arguments)]
    fn admissible(
        &self,
        txn: &mut dyn StoreTxn,
        jobs: &HashMap<JobId, JobRecord>,
        candidate: &Candidate,
        in_flight: &mut HashMap<String, u64>,
        connection_claims: &HashMap<String, u64>,
        bin_claims: &HashMap<(String, String), u64>,
        now_ms: i64,
    ) -> SchedulerResult<bool> {
        let connection = &candidate.connection;
        let name = &connection.connection.name;

        if !in_flight.contains_key(name) {
            let job_ids = jobs
                .values()
                .filter(|job| &job.description.connection_name == name)
                .map(JobRecord::id)
                .collect();
            let active = txn.count_entries(&EntryQuery {
                job_ids: Some(job_ids),
                statuses: vec![QueueStatus::Active, QueueStatus::ActiveNeedRescan],
                ..Default::default()
            })?;
            in_flight.insert(name.clone(), active);
        }
        let claimed = connection_claims.get(name).copied().unwrap_or(0);
        let active = in_flight.get(name).copied().unwrap_or(0);
        if active + claimed >= connection.connection.max_connections as u64 {
            return Ok(false);
        }

        let interval = self.ctx.settings.stuffer_interval_ms;
        let rate_per_minute = self.ctx.performance.fetch_rate(name);
        let rate_cap = ((rate_per_minute * interval as f64 / 60_000.0).ceil() as u64).max(1);
        if claimed >= rate_cap {
            return Ok(false);
        }

        let within_budget = self.ctx.with_budget(name, |budget| {
            candidate.bins.iter().all(|bin| {
                let allowance = budget.allowance(bin, connection.limits.max_fetch_rate(bin), interval, now_ms);
                let used = bin_claims.get(&(name.clone(), bin.clone())).copied().unwrap_or(0);
                allowance > used
            })
        });
        Ok(within_budget)
    }

    /// Split claimed documents per job into connector-sized batches.
    fn batch(&self, claimed: Vec<ClaimedDocument>) -> SchedulerResult<Vec<DocumentBatch>> {
        let mut by_job: Vec<(JobDescription, Vec<DocumentDescription>)> = Vec::new();
        for document in claimed {
            match by_job.iter_mut().find(|(job, _)| job.id == document.job.id) {
                Some((_, documents)) => documents.push(document.description),
                None => by_job.push((document.job, vec![document.description])),
            }
        }

        let mut batches = Vec::new();
        for (job, documents) in by_job {
            let size = self
                .ctx
                .repository_for(&job.connection_name)?
                .max_documents_per_batch()
                .max(1);
            for chunk in documents.chunks(size) {
                batches.push(DocumentBatch {
                    job: job.clone(),
                    documents: chunk.to_vec(),
                });
            }
        }
        Ok(batches)
    }

    /// Give documents deferred by throttling fresh priorities behind the current queue.
    pub fn reprioritize_blocked(&self) -> SchedulerResult<usize> {
        let blocked = self.ctx.blocking.drain();
        if blocked.is_empty() {
            return Ok(0);
        }
        let reprioritized = self.transact(|txn| {
            self.sync_minimum_depth(txn)?;
            let mut count = 0usize;
            let mut jobs: HashMap<JobId, JobRecord> = HashMap::new();
            for document in &blocked {
                let Some(mut entry) = txn.load_entry(document.job_id, &document.doc_hash)? else {
                    continue;
                };
                if !READY_STATUSES.contains(&entry.status) {
                    continue;
                }
                let job = match jobs.entry(document.job_id) {
                    Entry::Occupied(slot) => slot.into_mut(),
                    Entry::Vacant(slot) => slot.insert(load_job(txn, document.job_id)?),
                };
                let connection_name = &job.description.connection_name;
                let connection = self.ctx.connection(connection_name)?;
                let bins = self.ctx.bins_for(connection_name, &entry.doc_id)?;
                let priority = self.assign_priority(txn, &connection, &bins)?;
                entry.set_priority(priority);
                txn.save_entry(&entry)?;
                count += 1;
            }
            Ok(count)
        })?;
        debug!("Reprioritized {} blocked documents", reprioritized);
        Ok(reprioritized)
    }

    /// Run a cluster-wide reprioritization sweep.
    ///
    /// Returns `false` when another live sweep already owns the lease. The
    /// shared counters restart from zero and every waiting document gets a
    /// new priority, visited in its old priority order.
    pub fn reprioritize(&self, sweep_id: &str, now_ms: i64) -> SchedulerResult<bool> {
        let process_id = self.ctx.process_id().to_string();
        let started = self.transact(|txn| {
            self.ctx
                .reprioritization
                .start_reprioritization(txn, &process_id, sweep_id, now_ms)
        })?;
        if !started {
            return Ok(false);
        }

        let tracker = &self.ctx.queue_tracker;
        tracker.begin_reset();
        self.ctx.reprioritization.clear_preloaded_values();
        let result = self.sweep(&process_id, sweep_id, now_ms);
        tracker.end_reset();

        let count = result?;
        self.transact(|txn| self.ctx.reprioritization.done_reprioritization(txn, sweep_id))?;
        info!("Reprioritization sweep {} reassigned {} documents", sweep_id, count);
        Ok(true)
    }

    fn sweep(&self, process_id: &str, sweep_id: &str, now_ms: i64) -> SchedulerResult<usize> {
        let (jobs, keys) = self.transact(|txn| {
            let jobs: HashMap<JobId, JobRecord> =
                txn.list_jobs()?.into_iter().map(|job| (job.id(), job)).collect();
            let keys: Vec<(JobId, String)> = txn
                .query_entries(&EntryQuery {
                    statuses: READY_STATUSES.to_vec(),
                    order_by_priority: true,
                    ..Default::default()
                })?
                .into_iter()
                .map(|entry| (entry.job_id, entry.doc_hash))
                .collect();
            Ok((jobs, keys))
        })?;

        let mut count = 0usize;
        for chunk in keys.chunks(self.ctx.settings.priority_batch_size.max(1)) {
            let assigned = self.transact(|txn| {
                if !self
                    .ctx
                    .reprioritization
                    .heartbeat(txn, process_id, sweep_id, now_ms)?
                {
                    return Ok(None);
                }
                let mut assigned = 0usize;
                for (job_id, doc_hash) in chunk {
                    let Some(job) = jobs.get(job_id) else {
                        continue;
                    };
                    let Some(mut entry) = txn.load_entry(*job_id, doc_hash)? else {
                        continue;
                    };
                    if !READY_STATUSES.contains(&entry.status) {
                        continue;
                    }
                    let connection = self.ctx.connection(&job.description.connection_name)?;
                    let bins = self.ctx.bins_for(&job.description.connection_name, &entry.doc_id)?;
                    let priority = self.assign_priority(txn, &connection, &bins)?;
                    entry.set_priority(priority);
                    txn.save_entry(&entry)?;
                    assigned += 1;
                }
                Ok(Some(assigned))
            })?;
            match assigned {
                Some(assigned) => count += assigned,
                None => {
                    warn!("Reprioritization sweep {} lost its lease; stopping", sweep_id);
                    break;
                }
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::ChildReference;
    use crate::jobs::testing::{doc, setup_manager, specified_job, web_connection};
    use crate::models::{document_hash, RepositoryConnection};
    use crate::store::MemoryStore;

    fn started(connection: RepositoryConnection) -> QueueManager<MemoryStore> {
        let (manager, _) = setup_manager(connection);
        manager.create_job(specified_job(1)).unwrap();
        manager.start_job(1, 0).unwrap();
        manager
    }

    fn identifiers(batches: &[DocumentBatch]) -> Vec<String> {
        batches
            .iter()
            .flat_map(|batch| batch.documents.iter().map(|d| d.document_identifier.clone()))
            .collect()
    }

    #[test]
    fn test_claims_ready_documents() {
        let manager = started(web_connection());
        let seeds: Vec<String> = (0..3).map(|i| doc("host-a", &i.to_string())).collect();
        manager.add_seeds(1, &seeds, 0).unwrap();

        let batches = manager.get_next_documents(10, 0).unwrap();
        assert_eq!(identifiers(&batches).len(), 3);
        let entry = manager
            .transact(|txn| txn.load_entry(1, &document_hash(&seeds[0])))
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, QueueStatus::Active);
        assert_eq!(entry.process_id.as_deref(), Some(manager.context().process_id()));

        // Claimed documents are not handed out twice.
        assert!(manager.get_next_documents(10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_future_documents_wait() {
        let manager = started(web_connection());
        manager.add_seeds(1, &[doc("host-a", "1")], 100).unwrap();
        assert!(manager.get_next_documents(10, 99).unwrap().is_empty());
        assert_eq!(identifiers(&manager.get_next_documents(10, 100).unwrap()).len(), 1);
    }

    #[test]
    fn test_paused_job_is_not_stuffed() {
        let manager = started(web_connection());
        manager.add_seeds(1, &[doc("host-a", "1")], 0).unwrap();
        manager.pause_job(1).unwrap();
        assert!(manager.get_next_documents(10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_bins_interleave() {
        let manager = started(web_connection());
        let mut seeds = Vec::new();
        for i in 0..3 {
            seeds.push(doc("host-a", &i.to_string()));
        }
        seeds.push(doc("host-b", "0"));
        manager.add_seeds(1, &seeds, 0).unwrap();

        let claimed = identifiers(&manager.get_next_documents(2, 0).unwrap());
        assert_eq!(claimed.len(), 2);
        assert!(claimed.contains(&doc("host-b", "0")));
    }

    #[test]
    fn test_throttled_bin_defers_excess() {
        // 30 fetches/minute over a 2s interval allows one document per pass.
        let manager = started(web_connection().with_throttle("^host-a$", 30.0));
        let seeds: Vec<String> = (0..3).map(|i| doc("host-a", &i.to_string())).collect();
        manager.add_seeds(1, &seeds, 0).unwrap();

        let claimed = identifiers(&manager.get_next_documents(10, 0).unwrap());
        assert_eq!(claimed.len(), 1);
        assert_eq!(manager.context().blocking.len(), 2);

        assert_eq!(manager.reprioritize_blocked().unwrap(), 2);
        assert!(manager.context().blocking.is_empty());
    }

    #[test]
    fn test_blocked_bin_admits_nothing() {
        let manager = started(web_connection().with_throttle("^host-a$", 0.0));
        manager.add_seeds(1, &[doc("host-a", "1")], 0).unwrap();
        assert!(manager.get_next_documents(10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_max_connections_caps_claims() {
        let mut connection = web_connection();
        connection.max_connections = 2;
        let manager = started(connection);
        let seeds: Vec<String> = (0..5).map(|i| doc(&format!("host-{i}"), "x")).collect();
        manager.add_seeds(1, &seeds, 0).unwrap();

        assert_eq!(identifiers(&manager.get_next_documents(10, 0).unwrap()).len(), 2);
        assert!(manager.get_next_documents(10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_prioritize_documents_fills_missing_priorities() {
        let manager = started(web_connection());
        manager.add_seeds(1, &[doc("host-a", "1")], 0).unwrap();
        let hash = document_hash(&doc("host-a", "1"));
        manager
            .transact(|txn| {
                let mut entry = txn.load_entry(1, &hash)?.unwrap();
                entry.needs_priority = true;
                txn.save_entry(&entry)
            })
            .unwrap();

        assert!(manager.get_next_documents(10, 0).unwrap().is_empty());
        assert_eq!(manager.prioritize_documents(0).unwrap(), 1);
        assert_eq!(identifiers(&manager.get_next_documents(10, 0).unwrap()).len(), 1);
    }

    #[test]
    fn test_reprioritize_requires_lease() {
        let manager = started(web_connection());
        manager.add_seeds(1, &[doc("host-a", "1"), doc("host-a", "2")], 0).unwrap();
        manager
            .transact(|txn| {
                manager
                    .context()
                    .reprioritization
                    .start_reprioritization(txn, "other", "s0", 0)
            })
            .unwrap();
        assert!(!manager.reprioritize("s1", 10).unwrap());

        // Once the other sweep's lease lapses, a new sweep may run.
        let later = manager.context().reprioritization.lease_ms() + 10;
        assert!(manager.reprioritize("s1", later).unwrap());
        assert!(!manager.context().queue_tracker.is_resetting());
        assert_eq!(identifiers(&manager.get_next_documents(10, later).unwrap()).len(), 2);
    }

    #[test]
    fn test_carrydown_travels_with_claimed_document() {
        let manager = started(web_connection());
        let child = doc("host-a", "child");
        manager
            .add_document_references(1, "parent", &[ChildReference::new(&child).with_carrydown("acl", "x")], 0)
            .unwrap();
        let batches = manager.get_next_documents(10, 0).unwrap();
        assert_eq!(batches[0].documents[0].carrydown["acl"], vec!["x"]);
    }
}
