//! Single-process store keeping every table in memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{sort_by_priority, EdgeQuery, EntryQuery, LeaseRecord, QueueStore, StoreTxn};
use crate::error::SchedulerResult;
use crate::models::{CarrydownRecord, HopcountRecord, JobId, JobRecord, LinkRecord, QueueEntry};
use crate::scheduler::lock;

type CarrydownKey = (JobId, (String, String, String, String));
type LinkKey = (JobId, (String, String, String));
type HopcountKey = (JobId, String, String);

#[derive(Debug, Clone, Default)]
struct MemoryData {
    jobs: BTreeMap<JobId, JobRecord>,
    entries: BTreeMap<(JobId, String), QueueEntry>,
    carrydown: BTreeMap<CarrydownKey, CarrydownRecord>,
    links: BTreeMap<LinkKey, LinkRecord>,
    hopcounts: BTreeMap<HopcountKey, HopcountRecord>,
    bin_counters: HashMap<(String, String), f64>,
    leases: HashMap<String, LeaseRecord>,
    values: HashMap<String, f64>,
}

/// In-memory [`QueueStore`]. Transactions are serialized and roll back by
/// restoring a snapshot.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<MemoryData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryStore {
    fn transaction<T>(
        &self,
        f: &mut dyn FnMut(&mut dyn StoreTxn) -> SchedulerResult<T>,
    ) -> SchedulerResult<T> {
        let mut data = lock(&self.data);
        let snapshot = data.clone();
        let mut txn = MemoryTxn { data: &mut *data };
        let result = f(&mut txn);
        if result.is_err() {
            *data = snapshot;
        }
        result
    }
}

struct MemoryTxn<'a> {
    data: &'a mut MemoryData,
}

impl StoreTxn for MemoryTxn<'_> {
    fn load_job(&mut self, job_id: JobId) -> SchedulerResult<Option<JobRecord>> {
        Ok(self.data.jobs.get(&job_id).cloned())
    }

    fn list_jobs(&mut self) -> SchedulerResult<Vec<JobRecord>> {
        Ok(self.data.jobs.values().cloned().collect())
    }

    fn save_job(&mut self, job: &JobRecord) -> SchedulerResult<()> {
        self.data.jobs.insert(job.id(), job.clone());
        Ok(())
    }

    fn delete_job(&mut self, job_id: JobId) -> SchedulerResult<bool> {
        Ok(self.data.jobs.remove(&job_id).is_some())
    }

    fn load_entry(&mut self, job_id: JobId, doc_hash: &str) -> SchedulerResult<Option<QueueEntry>> {
        Ok(self
            .data
            .entries
            .get(&(job_id, doc_hash.to_string()))
            .cloned())
    }

    fn query_entries(&mut self, query: &EntryQuery) -> SchedulerResult<Vec<QueueEntry>> {
        let mut entries: Vec<QueueEntry> = self
            .data
            .entries
            .values()
            .filter(|entry| query.matches(entry))
            .cloned()
            .collect();
        if query.order_by_priority {
            sort_by_priority(&mut entries);
        }
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    fn count_entries(&mut self, query: &EntryQuery) -> SchedulerResult<u64> {
        Ok(self
            .data
            .entries
            .values()
            .filter(|entry| query.matches(entry))
            .count() as u64)
    }

    fn save_entry(&mut self, entry: &QueueEntry) -> SchedulerResult<()> {
        self.data
            .entries
            .insert((entry.job_id, entry.doc_hash.clone()), entry.clone());
        Ok(())
    }

    fn delete_entry(&mut self, job_id: JobId, doc_hash: &str) -> SchedulerResult<bool> {
        Ok(self
            .data
            .entries
            .remove(&(job_id, doc_hash.to_string()))
            .is_some())
    }

    fn query_carrydown(&mut self, query: &EdgeQuery) -> SchedulerResult<Vec<CarrydownRecord>> {
        Ok(self
            .data
            .carrydown
            .values()
            .filter(|record| query.matches_carrydown(record))
            .cloned()
            .collect())
    }

    fn save_carrydown(&mut self, record: &CarrydownRecord) -> SchedulerResult<()> {
        self.data
            .carrydown
            .insert((record.job_id, record.key()), record.clone());
        Ok(())
    }

    fn delete_carrydown(&mut self, query: &EdgeQuery) -> SchedulerResult<usize> {
        let before = self.data.carrydown.len();
        self.data
            .carrydown
            .retain(|_, record| !query.matches_carrydown(record));
        Ok(before - self.data.carrydown.len())
    }

    fn query_links(&mut self, query: &EdgeQuery) -> SchedulerResult<Vec<LinkRecord>> {
        Ok(self
            .data
            .links
            .values()
            .filter(|record| query.matches_link(record))
            .cloned()
            .collect())
    }

    fn save_link(&mut self, record: &LinkRecord) -> SchedulerResult<()> {
        self.data
            .links
            .insert((record.job_id, record.key()), record.clone());
        Ok(())
    }

    fn delete_links(&mut self, query: &EdgeQuery) -> SchedulerResult<usize> {
        let before = self.data.links.len();
        self.data.links.retain(|_, record| !query.matches_link(record));
        Ok(before - self.data.links.len())
    }

    fn load_hopcounts(&mut self, job_id: JobId, doc_hash: &str) -> SchedulerResult<Vec<HopcountRecord>> {
        Ok(self
            .data
            .hopcounts
            .values()
            .filter(|record| record.job_id == job_id && record.doc_hash == doc_hash)
            .cloned()
            .collect())
    }

    fn query_hopcounts(&mut self, job_id: JobId) -> SchedulerResult<Vec<HopcountRecord>> {
        Ok(self
            .data
            .hopcounts
            .values()
            .filter(|record| record.job_id == job_id)
            .cloned()
            .collect())
    }

    fn save_hopcount(&mut self, record: &HopcountRecord) -> SchedulerResult<()> {
        self.data.hopcounts.insert(
            (
                record.job_id,
                record.link_type.clone(),
                record.doc_hash.clone(),
            ),
            record.clone(),
        );
        Ok(())
    }

    fn delete_hopcount(&mut self, job_id: JobId, link_type: &str, doc_hash: &str) -> SchedulerResult<()> {
        self.data
            .hopcounts
            .remove(&(job_id, link_type.to_string(), doc_hash.to_string()));
        Ok(())
    }

    fn delete_job_hopcounts(&mut self, job_id: JobId) -> SchedulerResult<usize> {
        let before = self.data.hopcounts.len();
        self.data.hopcounts.retain(|key, _| key.0 != job_id);
        Ok(before - self.data.hopcounts.len())
    }

    fn increment_bin_values(
        &mut self,
        connector_id: &str,
        bin: &str,
        floor: f64,
        count: usize,
    ) -> SchedulerResult<Vec<f64>> {
        let counter = self
            .data
            .bin_counters
            .entry((connector_id.to_string(), bin.to_string()))
            .or_insert(0.0);
        let start = counter.max(floor);
        *counter = start + count as f64;
        Ok((0..count).map(|i| start + i as f64).collect())
    }

    fn reset_bin_values(&mut self) -> SchedulerResult<()> {
        self.data.bin_counters.clear();
        Ok(())
    }

    fn load_lease(&mut self, name: &str) -> SchedulerResult<Option<LeaseRecord>> {
        Ok(self.data.leases.get(name).cloned())
    }

    fn save_lease(&mut self, lease: &LeaseRecord) -> SchedulerResult<()> {
        self.data.leases.insert(lease.name.clone(), lease.clone());
        Ok(())
    }

    fn delete_lease(&mut self, name: &str) -> SchedulerResult<()> {
        self.data.leases.remove(name);
        Ok(())
    }

    fn load_value(&mut self, name: &str) -> SchedulerResult<Option<f64>> {
        Ok(self.data.values.get(name).copied())
    }

    fn save_value(&mut self, name: &str, value: f64) -> SchedulerResult<()> {
        self.data.values.insert(name.to_string(), value);
        Ok(())
    }
}
