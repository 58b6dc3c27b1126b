//! Cluster store backed by a shared SQLite database.
//!
//! Transactions use `BEGIN IMMEDIATE` so that claims take the write lock up
//! front; concurrent processes wait on the busy timeout and a lost race
//! surfaces as a transient error the caller retries.

use std::path::Path;

use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel::sqlite::Sqlite;

use super::migrations::init_schema;
use super::models::{
    CarrydownRow, HopcountRow, JobRow, LeaseRow, LinkRow, NewJob, NewQueueEntry, QueueEntryRow,
};
use super::pool::{open_pool, SqlitePool};
use super::{EdgeQuery, EntryQuery, LeaseRecord, QueueStore, StoreTxn};
use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{
    CarrydownRecord, HopcountRecord, JobId, JobRecord, LinkRecord, QueueEntry,
};
use crate::schema::{
    bin_counters, carrydown, hopcounts, intrinsic_links, jobs, queue_entries, scheduler_leases,
    scheduler_values,
};

/// SQLite-backed [`QueueStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store with an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the schema if needed and open a pool on `db_path`.
    pub fn open(db_path: &Path) -> SchedulerResult<Self> {
        init_schema(db_path)?;
        Ok(Self::new(open_pool(db_path)?))
    }
}

impl QueueStore for SqliteStore {
    fn transaction<T>(
        &self,
        f: &mut dyn FnMut(&mut dyn StoreTxn) -> SchedulerResult<T>,
    ) -> SchedulerResult<T> {
        let mut conn = self.pool.get()?;
        conn.immediate_transaction::<T, SchedulerError, _>(|conn| {
            let mut txn = SqliteTxn { conn };
            f(&mut txn)
        })
    }
}

struct SqliteTxn<'a> {
    conn: &'a mut SqliteConnection,
}

macro_rules! filter_entries {
    ($q:expr, $query:expr) => {{
        let mut q = $q;
        let query: &EntryQuery = $query;
        if let Some(ids) = &query.job_ids {
            q = q.filter(queue_entries::job_id.eq_any(ids.clone()));
        }
        if !query.statuses.is_empty() {
            let codes: Vec<String> = query.statuses.iter().map(|s| s.as_str().to_string()).collect();
            q = q.filter(queue_entries::status.eq_any(codes));
        }
        if let Some(hashes) = &query.doc_hashes {
            q = q.filter(queue_entries::doc_hash.eq_any(hashes.clone()));
        }
        if let Some(pid) = &query.process_id {
            q = q.filter(queue_entries::process_id.eq(pid.clone()));
        }
        if !query.seed_statuses.is_empty() {
            let codes: Vec<String> = query
                .seed_statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect();
            q = q.filter(queue_entries::seed_status.eq_any(codes));
        }
        if let Some(pid) = &query.seeding_process_id {
            q = q.filter(queue_entries::seeding_process_id.eq(pid.clone()));
        }
        if let Some(due) = query.due_by {
            q = q.filter(queue_entries::check_time.le(due));
        }
        if let Some(flag) = query.needs_priority {
            q = q.filter(queue_entries::needs_priority.eq(flag));
        }
        q
    }};
}

macro_rules! filter_edges {
    ($q:expr, $table:ident, $query:expr) => {{
        let mut q = $q;
        let query: &EdgeQuery = $query;
        q = q.filter($table::job_id.eq(query.job_id));
        if let Some(parents) = &query.parent_hashes {
            q = q.filter($table::parent_hash.eq_any(parents.clone()));
        }
        if let Some(children) = &query.child_hashes {
            q = q.filter($table::child_hash.eq_any(children.clone()));
        }
        if !query.states.is_empty() {
            let codes: Vec<String> = query.states.iter().map(|s| s.as_str().to_string()).collect();
            q = q.filter($table::state.eq_any(codes));
        }
        if let Some(pid) = &query.process_id {
            q = q.filter($table::process_id.eq(pid.clone()));
        }
        q
    }};
}

impl StoreTxn for SqliteTxn<'_> {
    fn load_job(&mut self, job_id: JobId) -> SchedulerResult<Option<JobRecord>> {
        jobs::table
            .find(job_id)
            .select(JobRow::as_select())
            .first::<JobRow>(self.conn)
            .optional()?
            .map(JobRow::into_record)
            .transpose()
    }

    fn list_jobs(&mut self) -> SchedulerResult<Vec<JobRecord>> {
        jobs::table
            .order(jobs::id.asc())
            .select(JobRow::as_select())
            .load::<JobRow>(self.conn)?
            .into_iter()
            .map(JobRow::into_record)
            .collect()
    }

    fn save_job(&mut self, job: &JobRecord) -> SchedulerResult<()> {
        let description = serde_json::to_string(&job.description)?;
        let error = job.error.as_ref().map(serde_json::to_string).transpose()?;
        let row = NewJob {
            id: job.id(),
            description: &description,
            status: job.status.as_str(),
            error: error.as_deref(),
            seeding_process_id: job.seeding.process_id.as_deref(),
            seeding_check_time: job.seeding.check_time,
            seeding_fail_time: job.seeding.fail_time,
            seeding_fail_count: job.seeding.fail_count as i32,
            last_seeding_ms: job.seeding.last_seeding_ms,
            run_started_ms: job.run_started_ms,
        };
        // Use replace_into for SQLite upsert
        diesel::replace_into(jobs::table)
            .values(&row)
            .execute(self.conn)?;
        Ok(())
    }

    fn delete_job(&mut self, job_id: JobId) -> SchedulerResult<bool> {
        let rows = diesel::delete(jobs::table.find(job_id)).execute(self.conn)?;
        Ok(rows > 0)
    }

    fn load_entry(&mut self, job_id: JobId, doc_hash: &str) -> SchedulerResult<Option<QueueEntry>> {
        Ok(queue_entries::table
            .find((job_id, doc_hash))
            .select(QueueEntryRow::as_select())
            .first::<QueueEntryRow>(self.conn)
            .optional()?
            .map(QueueEntry::from))
    }

    fn query_entries(&mut self, query: &EntryQuery) -> SchedulerResult<Vec<QueueEntry>> {
        let mut q = filter_entries!(
            queue_entries::table
                .select(QueueEntryRow::as_select())
                .into_boxed::<Sqlite>(),
            query
        );
        if query.order_by_priority {
            q = q.order((
                queue_entries::priority.is_null().asc(),
                queue_entries::priority.asc(),
                queue_entries::doc_hash.asc(),
            ));
        }
        if let Some(limit) = query.limit {
            q = q.limit(limit as i64);
        }
        Ok(q
            .load::<QueueEntryRow>(self.conn)?
            .into_iter()
            .map(QueueEntry::from)
            .collect())
    }

    fn count_entries(&mut self, query: &EntryQuery) -> SchedulerResult<u64> {
        let q = filter_entries!(
            queue_entries::table
                .select(count_star())
                .into_boxed::<Sqlite>(),
            query
        );
        let count: i64 = q.first(self.conn)?;
        Ok(count.max(0) as u64)
    }

    fn save_entry(&mut self, entry: &QueueEntry) -> SchedulerResult<()> {
        diesel::replace_into(queue_entries::table)
            .values(NewQueueEntry::from(entry))
            .execute(self.conn)?;
        Ok(())
    }

    fn delete_entry(&mut self, job_id: JobId, doc_hash: &str) -> SchedulerResult<bool> {
        let rows =
            diesel::delete(queue_entries::table.find((job_id, doc_hash))).execute(self.conn)?;
        Ok(rows > 0)
    }

    fn query_carrydown(&mut self, query: &EdgeQuery) -> SchedulerResult<Vec<CarrydownRecord>> {
        let q = filter_edges!(
            carrydown::table
                .select(CarrydownRow::as_select())
                .into_boxed::<Sqlite>(),
            carrydown,
            query
        );
        Ok(q
            .load::<CarrydownRow>(self.conn)?
            .into_iter()
            .map(CarrydownRecord::from)
            .collect())
    }

    fn save_carrydown(&mut self, record: &CarrydownRecord) -> SchedulerResult<()> {
        diesel::replace_into(carrydown::table)
            .values(CarrydownRow::from(record))
            .execute(self.conn)?;
        Ok(())
    }

    fn delete_carrydown(&mut self, query: &EdgeQuery) -> SchedulerResult<usize> {
        let q = filter_edges!(diesel::delete(carrydown::table).into_boxed::<Sqlite>(), carrydown, query);
        Ok(q.execute(self.conn)?)
    }

    fn query_links(&mut self, query: &EdgeQuery) -> SchedulerResult<Vec<LinkRecord>> {
        let q = filter_edges!(
            intrinsic_links::table
                .select(LinkRow::as_select())
                .into_boxed::<Sqlite>(),
            intrinsic_links,
            query
        );
        Ok(q
            .load::<LinkRow>(self.conn)?
            .into_iter()
            .map(LinkRecord::from)
            .collect())
    }

    fn save_link(&mut self, record: &LinkRecord) -> SchedulerResult<()> {
        diesel::replace_into(intrinsic_links::table)
            .values(LinkRow::from(record))
            .execute(self.conn)?;
        Ok(())
    }

    fn delete_links(&mut self, query: &EdgeQuery) -> SchedulerResult<usize> {
        let q = filter_edges!(
            diesel::delete(intrinsic_links::table).into_boxed::<Sqlite>(),
            intrinsic_links,
            query
        );
        Ok(q.execute(self.conn)?)
    }

    fn load_hopcounts(&mut self, job_id: JobId, doc_hash: &str) -> SchedulerResult<Vec<HopcountRecord>> {
        Ok(hopcounts::table
            .filter(hopcounts::job_id.eq(job_id))
            .filter(hopcounts::doc_hash.eq(doc_hash))
            .select(HopcountRow::as_select())
            .load::<HopcountRow>(self.conn)?
            .into_iter()
            .map(HopcountRecord::from)
            .collect())
    }

    fn query_hopcounts(&mut self, job_id: JobId) -> SchedulerResult<Vec<HopcountRecord>> {
        Ok(hopcounts::table
            .filter(hopcounts::job_id.eq(job_id))
            .select(HopcountRow::as_select())
            .load::<HopcountRow>(self.conn)?
            .into_iter()
            .map(HopcountRecord::from)
            .collect())
    }

    fn save_hopcount(&mut self, record: &HopcountRecord) -> SchedulerResult<()> {
        diesel::replace_into(hopcounts::table)
            .values(HopcountRow {
                job_id: record.job_id,
                link_type: record.link_type.clone(),
                doc_hash: record.doc_hash.clone(),
                distance: record.distance as i32,
            })
            .execute(self.conn)?;
        Ok(())
    }

    fn delete_hopcount(&mut self, job_id: JobId, link_type: &str, doc_hash: &str) -> SchedulerResult<()> {
        diesel::delete(hopcounts::table.find((job_id, link_type, doc_hash))).execute(self.conn)?;
        Ok(())
    }

    fn delete_job_hopcounts(&mut self, job_id: JobId) -> SchedulerResult<usize> {
        Ok(diesel::delete(hopcounts::table.filter(hopcounts::job_id.eq(job_id)))
            .execute(self.conn)?)
    }

    fn increment_bin_values(
        &mut self,
        connector_id: &str,
        bin: &str,
        floor: f64,
        count: usize,
    ) -> SchedulerResult<Vec<f64>> {
        let current: f64 = bin_counters::table
            .find((connector_id, bin))
            .select(bin_counters::counter)
            .first::<f64>(self.conn)
            .optional()?
            .unwrap_or(0.0);
        let start = current.max(floor);
        diesel::replace_into(bin_counters::table)
            .values((
                bin_counters::connector_id.eq(connector_id),
                bin_counters::bin_name.eq(bin),
                bin_counters::counter.eq(start + count as f64),
            ))
            .execute(self.conn)?;
        Ok((0..count).map(|i| start + i as f64).collect())
    }

    fn reset_bin_values(&mut self) -> SchedulerResult<()> {
        diesel::delete(bin_counters::table).execute(self.conn)?;
        Ok(())
    }

    fn load_lease(&mut self, name: &str) -> SchedulerResult<Option<LeaseRecord>> {
        Ok(scheduler_leases::table
            .find(name)
            .select(LeaseRow::as_select())
            .first::<LeaseRow>(self.conn)
            .optional()?
            .map(|row| LeaseRecord {
                name: row.name,
                process_id: row.process_id,
                holder_id: row.holder_id,
                acquired_ms: row.acquired_ms,
                heartbeat_ms: row.heartbeat_ms,
                expires_ms: row.expires_ms,
            }))
    }

    fn save_lease(&mut self, lease: &LeaseRecord) -> SchedulerResult<()> {
        diesel::replace_into(scheduler_leases::table)
            .values(LeaseRow {
                name: lease.name.clone(),
                process_id: lease.process_id.clone(),
                holder_id: lease.holder_id.clone(),
                acquired_ms: lease.acquired_ms,
                heartbeat_ms: lease.heartbeat_ms,
                expires_ms: lease.expires_ms,
            })
            .execute(self.conn)?;
        Ok(())
    }

    fn delete_lease(&mut self, name: &str) -> SchedulerResult<()> {
        diesel::delete(scheduler_leases::table.find(name)).execute(self.conn)?;
        Ok(())
    }

    fn load_value(&mut self, name: &str) -> SchedulerResult<Option<f64>> {
        Ok(scheduler_values::table
            .find(name)
            .select(scheduler_values::value)
            .first::<f64>(self.conn)
            .optional()?)
    }

    fn save_value(&mut self, name: &str, value: f64) -> SchedulerResult<()> {
        diesel::replace_into(scheduler_values::table)
            .values((
                scheduler_values::name.eq(name),
                scheduler_values::value.eq(value),
            ))
            .execute(self.conn)?;
        Ok(())
    }
}
