//! Storage seam for the scheduler.
//!
//! The scheduler's policy runs on top of a transactional store. Every
//! queue-mutating operation happens inside [`QueueStore::transaction`]; the
//! closure receives a [`StoreTxn`] and either all of its writes commit or
//! none do. Implementations: [`MemoryStore`] for a single process and tests,
//! [`SqliteStore`] for a cluster sharing one database.

mod memory;
mod migrations;
mod models;
mod pool;
mod sqlite;

pub use memory::MemoryStore;
pub use migrations::init_schema;
pub use pool::{apply_queue_pragmas, open_pool, SqlitePool};
pub use sqlite::SqliteStore;

use crate::error::SchedulerResult;
use crate::models::{
    CarrydownRecord, HopcountRecord, JobId, JobRecord, LinkRecord, LinkState, QueueEntry,
    QueueStatus, SeedStatus,
};

/// Filter for queue entry reads.
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    pub job_ids: Option<Vec<JobId>>,
    pub statuses: Vec<QueueStatus>,
    pub doc_hashes: Option<Vec<String>>,
    pub process_id: Option<String>,
    pub seed_statuses: Vec<SeedStatus>,
    pub seeding_process_id: Option<String>,
    /// Only entries with `check_time <= due_by`.
    pub due_by: Option<i64>,
    /// Some(flag) restricts to entries whose `needs_priority` equals flag.
    pub needs_priority: Option<bool>,
    /// Order by priority ascending (unprioritized last), then hash.
    pub order_by_priority: bool,
    pub limit: Option<usize>,
}

impl EntryQuery {
    pub fn for_job(job_id: JobId) -> Self {
        Self {
            job_ids: Some(vec![job_id]),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[QueueStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn with_process(mut self, process_id: &str) -> Self {
        self.process_id = Some(process_id.to_string());
        self
    }

    pub fn with_hashes(mut self, doc_hashes: Vec<String>) -> Self {
        self.doc_hashes = Some(doc_hashes);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an entry satisfies every filter (ordering and limit aside).
    pub fn matches(&self, entry: &QueueEntry) -> bool {
        self.job_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(&entry.job_id))
            && (self.statuses.is_empty() || self.statuses.contains(&entry.status))
            && self
                .doc_hashes
                .as_ref()
                .map_or(true, |hashes| hashes.contains(&entry.doc_hash))
            && self
                .process_id
                .as_ref()
                .map_or(true, |pid| entry.process_id.as_ref() == Some(pid))
            && (self.seed_statuses.is_empty() || self.seed_statuses.contains(&entry.seed_status))
            && self
                .seeding_process_id
                .as_ref()
                .map_or(true, |pid| entry.seeding_process_id.as_ref() == Some(pid))
            && self.due_by.map_or(true, |due| entry.check_time <= due)
            && self
                .needs_priority
                .map_or(true, |flag| entry.needs_priority == flag)
    }
}

/// Filter for carry-down and link reads and deletes within one job.
#[derive(Debug, Clone)]
pub struct EdgeQuery {
    pub job_id: JobId,
    pub parent_hashes: Option<Vec<String>>,
    pub child_hashes: Option<Vec<String>>,
    pub states: Vec<LinkState>,
    pub process_id: Option<String>,
}

impl EdgeQuery {
    pub fn for_job(job_id: JobId) -> Self {
        Self {
            job_id,
            parent_hashes: None,
            child_hashes: None,
            states: Vec::new(),
            process_id: None,
        }
    }

    pub fn parents(mut self, parent_hashes: &[String]) -> Self {
        self.parent_hashes = Some(parent_hashes.to_vec());
        self
    }

    pub fn children(mut self, child_hashes: &[String]) -> Self {
        self.child_hashes = Some(child_hashes.to_vec());
        self
    }

    pub fn states(mut self, states: &[LinkState]) -> Self {
        self.states = states.to_vec();
        self
    }

    pub fn process(mut self, process_id: &str) -> Self {
        self.process_id = Some(process_id.to_string());
        self
    }

    fn matches_edge(
        &self,
        job_id: JobId,
        parent: &str,
        child: &str,
        state: LinkState,
        process_id: Option<&String>,
    ) -> bool {
        job_id == self.job_id
            && self
                .parent_hashes
                .as_ref()
                .map_or(true, |p| p.iter().any(|h| h == parent))
            && self
                .child_hashes
                .as_ref()
                .map_or(true, |c| c.iter().any(|h| h == child))
            && (self.states.is_empty() || self.states.contains(&state))
            && self
                .process_id
                .as_ref()
                .map_or(true, |pid| process_id == Some(pid))
    }

    pub fn matches_carrydown(&self, record: &CarrydownRecord) -> bool {
        self.matches_edge(
            record.job_id,
            &record.parent_hash,
            &record.child_hash,
            record.state,
            record.process_id.as_ref(),
        )
    }

    pub fn matches_link(&self, record: &LinkRecord) -> bool {
        self.matches_edge(
            record.job_id,
            &record.parent_hash,
            &record.child_hash,
            record.state,
            record.process_id.as_ref(),
        )
    }
}

/// Cluster-shared ownership record with heartbeat-based expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseRecord {
    pub name: String,
    pub process_id: String,
    pub holder_id: String,
    pub acquired_ms: i64,
    pub heartbeat_ms: i64,
    pub expires_ms: i64,
}

impl LeaseRecord {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_ms
    }
}

/// Operations available inside one store transaction.
pub trait StoreTxn {
    // Jobs
    fn load_job(&mut self, job_id: JobId) -> SchedulerResult<Option<JobRecord>>;
    fn list_jobs(&mut self) -> SchedulerResult<Vec<JobRecord>>;
    fn save_job(&mut self, job: &JobRecord) -> SchedulerResult<()>;
    fn delete_job(&mut self, job_id: JobId) -> SchedulerResult<bool>;

    // Queue entries
    fn load_entry(&mut self, job_id: JobId, doc_hash: &str) -> SchedulerResult<Option<QueueEntry>>;
    fn query_entries(&mut self, query: &EntryQuery) -> SchedulerResult<Vec<QueueEntry>>;
    fn count_entries(&mut self, query: &EntryQuery) -> SchedulerResult<u64>;
    /// Insert or replace.
    fn save_entry(&mut self, entry: &QueueEntry) -> SchedulerResult<()>;
    fn delete_entry(&mut self, job_id: JobId, doc_hash: &str) -> SchedulerResult<bool>;

    // Carry-down rows
    fn query_carrydown(&mut self, query: &EdgeQuery) -> SchedulerResult<Vec<CarrydownRecord>>;
    /// Insert or replace by (job, parent, child, name, value hash).
    fn save_carrydown(&mut self, record: &CarrydownRecord) -> SchedulerResult<()>;
    fn delete_carrydown(&mut self, query: &EdgeQuery) -> SchedulerResult<usize>;

    // Intrinsic links
    fn query_links(&mut self, query: &EdgeQuery) -> SchedulerResult<Vec<LinkRecord>>;
    /// Insert or replace by (job, link type, parent, child).
    fn save_link(&mut self, record: &LinkRecord) -> SchedulerResult<()>;
    fn delete_links(&mut self, query: &EdgeQuery) -> SchedulerResult<usize>;

    // Hop-count distances
    fn load_hopcounts(&mut self, job_id: JobId, doc_hash: &str) -> SchedulerResult<Vec<HopcountRecord>>;
    fn query_hopcounts(&mut self, job_id: JobId) -> SchedulerResult<Vec<HopcountRecord>>;
    fn save_hopcount(&mut self, record: &HopcountRecord) -> SchedulerResult<()>;
    fn delete_hopcount(&mut self, job_id: JobId, link_type: &str, doc_hash: &str) -> SchedulerResult<()>;
    fn delete_job_hopcounts(&mut self, job_id: JobId) -> SchedulerResult<usize>;

    // Cluster-shared bin counters
    /// Raise the counter to `floor`, hand out `count` consecutive values, advance past them.
    fn increment_bin_values(
        &mut self,
        connector_id: &str,
        bin: &str,
        floor: f64,
        count: usize,
    ) -> SchedulerResult<Vec<f64>>;
    fn reset_bin_values(&mut self) -> SchedulerResult<()>;

    // Shared coordination data
    fn load_lease(&mut self, name: &str) -> SchedulerResult<Option<LeaseRecord>>;
    fn save_lease(&mut self, lease: &LeaseRecord) -> SchedulerResult<()>;
    fn delete_lease(&mut self, name: &str) -> SchedulerResult<()>;
    fn load_value(&mut self, name: &str) -> SchedulerResult<Option<f64>>;
    fn save_value(&mut self, name: &str, value: f64) -> SchedulerResult<()>;
}

/// A transactional store shared by every process of a cluster.
pub trait QueueStore: Send + Sync + 'static {
    /// Run `f` atomically. An `Err` from `f` rolls back every write.
    fn transaction<T>(
        &self,
        f: &mut dyn FnMut(&mut dyn StoreTxn) -> SchedulerResult<T>,
    ) -> SchedulerResult<T>;
}

/// Sort entries the way `EntryQuery::order_by_priority` requires.
pub(crate) fn sort_by_priority(entries: &mut [QueueEntry]) {
    entries.sort_by(|a, b| {
        let pa = a.priority.unwrap_or(f64::INFINITY);
        let pb = b.priority.unwrap_or(f64::INFINITY);
        a.priority
            .is_none()
            .cmp(&b.priority.is_none())
            .then(pa.total_cmp(&pb))
            .then_with(|| a.doc_hash.cmp(&b.doc_hash))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(job_id: JobId, hash: &str, status: QueueStatus) -> QueueEntry {
        let mut entry = QueueEntry::new(job_id, hash.into(), format!("doc-{hash}"), 0);
        entry.status = status;
        entry
    }

    #[test]
    fn test_entry_query_filters() {
        let mut e = entry(1, "a", QueueStatus::Active);
        e.process_id = Some("p1".into());

        assert!(EntryQuery::for_job(1).matches(&e));
        assert!(!EntryQuery::for_job(2).matches(&e));
        assert!(EntryQuery::for_job(1)
            .with_statuses(&[QueueStatus::Active])
            .with_process("p1")
            .matches(&e));
        assert!(!EntryQuery::default().with_process("p2").matches(&e));
        assert!(!EntryQuery::default()
            .with_statuses(&[QueueStatus::Pending])
            .matches(&e));
    }

    #[test]
    fn test_due_by_filter() {
        let mut e = entry(1, "a", QueueStatus::Pending);
        e.check_time = 500;
        let query = EntryQuery {
            due_by: Some(499),
            ..Default::default()
        };
        assert!(!query.matches(&e));
        let query = EntryQuery {
            due_by: Some(500),
            ..Default::default()
        };
        assert!(query.matches(&e));
    }

    #[test]
    fn test_sort_by_priority_puts_unprioritized_last() {
        let mut a = entry(1, "a", QueueStatus::Pending);
        a.priority = Some(2.0);
        let b = entry(1, "b", QueueStatus::Pending);
        let mut c = entry(1, "c", QueueStatus::Pending);
        c.priority = Some(0.5);
        let mut d = entry(1, "d", QueueStatus::Pending);
        d.priority = Some(f64::INFINITY);

        let mut entries = vec![a, b, c, d];
        sort_by_priority(&mut entries);
        let order: Vec<&str> = entries.iter().map(|e| e.doc_hash.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "d", "b"]);
    }

    #[test]
    fn test_lease_expiry() {
        let lease = LeaseRecord {
            name: "sweep".into(),
            process_id: "p1".into(),
            holder_id: "s1".into(),
            acquired_ms: 0,
            heartbeat_ms: 0,
            expires_ms: 100,
        };
        assert!(!lease.is_expired(99));
        assert!(lease.is_expired(100));
    }
}
