//! Diesel ORM models for the queue tables.

use diesel::prelude::*;

use crate::error::SchedulerResult;
use crate::models::{
    CarrydownRecord, HopcountRecord, JobError, JobRecord, JobStatus, LinkRecord, LinkState, QueueEntry,
    QueueStatus, SeedStatus, SeedingState,
};
use crate::schema;

/// Job row.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct JobRow {
    pub id: i64,
    pub description: String,
    pub status: String,
    pub error: Option<String>,
    pub seeding_process_id: Option<String>,
    pub seeding_check_time: Option<i64>,
    pub seeding_fail_time: Option<i64>,
    pub seeding_fail_count: i32,
    pub last_seeding_ms: Option<i64>,
    pub run_started_ms: Option<i64>,
}

/// Job row for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::jobs)]
pub struct NewJob<'a> {
    pub id: i64,
    pub description: &'a str,
    pub status: &'a str,
    pub error: Option<&'a str>,
    pub seeding_process_id: Option<&'a str>,
    pub seeding_check_time: Option<i64>,
    pub seeding_fail_time: Option<i64>,
    pub seeding_fail_count: i32,
    pub last_seeding_ms: Option<i64>,
    pub run_started_ms: Option<i64>,
}

impl JobRow {
    pub fn into_record(self) -> SchedulerResult<JobRecord> {
        Ok(JobRecord {
            description: serde_json::from_str(&self.description)?,
            status: JobStatus::from_str(&self.status).unwrap_or(JobStatus::Inactive),
            error: self
                .error
                .as_deref()
                .map(serde_json::from_str::<JobError>)
                .transpose()?,
            seeding: SeedingState {
                process_id: self.seeding_process_id,
                check_time: self.seeding_check_time,
                fail_time: self.seeding_fail_time,
                fail_count: self.seeding_fail_count.max(0) as u32,
                last_seeding_ms: self.last_seeding_ms,
            },
            run_started_ms: self.run_started_ms,
        })
    }
}

/// Queue entry row.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::queue_entries)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct QueueEntryRow {
    pub job_id: i64,
    pub doc_hash: String,
    pub doc_id: String,
    pub status: String,
    pub priority: Option<f64>,
    pub needs_priority: bool,
    pub check_time: i64,
    pub fail_time: Option<i64>,
    pub fail_count: i32,
    pub origination_time: Option<i64>,
    pub processed_before: bool,
    pub seed_status: String,
    pub seeding_process_id: Option<String>,
    pub process_id: Option<String>,
    pub last_version: Option<String>,
    pub last_error: Option<String>,
}

/// Queue entry row for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::queue_entries)]
pub struct NewQueueEntry<'a> {
    pub job_id: i64,
    pub doc_hash: &'a str,
    pub doc_id: &'a str,
    pub status: &'a str,
    pub priority: Option<f64>,
    pub needs_priority: bool,
    pub check_time: i64,
    pub fail_time: Option<i64>,
    pub fail_count: i32,
    pub origination_time: Option<i64>,
    pub processed_before: bool,
    pub seed_status: &'a str,
    pub seeding_process_id: Option<&'a str>,
    pub process_id: Option<&'a str>,
    pub last_version: Option<&'a str>,
    pub last_error: Option<&'a str>,
}

impl From<QueueEntryRow> for QueueEntry {
    fn from(row: QueueEntryRow) -> Self {
        QueueEntry {
            job_id: row.job_id,
            doc_hash: row.doc_hash,
            doc_id: row.doc_id,
            status: QueueStatus::from_str(&row.status).unwrap_or(QueueStatus::Pending),
            priority: row.priority,
            needs_priority: row.needs_priority,
            check_time: row.check_time,
            fail_time: row.fail_time,
            fail_count: row.fail_count.max(0) as u32,
            origination_time: row.origination_time,
            processed_before: row.processed_before,
            seed_status: SeedStatus::from_str(&row.seed_status).unwrap_or(SeedStatus::NotSeed),
            seeding_process_id: row.seeding_process_id,
            process_id: row.process_id,
            last_version: row.last_version,
            last_error: row.last_error,
        }
    }
}

impl<'a> From<&'a QueueEntry> for NewQueueEntry<'a> {
    fn from(entry: &'a QueueEntry) -> Self {
        NewQueueEntry {
            job_id: entry.job_id,
            doc_hash: &entry.doc_hash,
            doc_id: &entry.doc_id,
            status: entry.status.as_str(),
            priority: entry.priority,
            needs_priority: entry.needs_priority,
            check_time: entry.check_time,
            fail_time: entry.fail_time,
            fail_count: entry.fail_count as i32,
            origination_time: entry.origination_time,
            processed_before: entry.processed_before,
            seed_status: entry.seed_status.as_str(),
            seeding_process_id: entry.seeding_process_id.as_deref(),
            process_id: entry.process_id.as_deref(),
            last_version: entry.last_version.as_deref(),
            last_error: entry.last_error.as_deref(),
        }
    }
}

/// Carry-down row.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::carrydown)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CarrydownRow {
    pub job_id: i64,
    pub parent_hash: String,
    pub child_hash: String,
    pub data_name: String,
    pub value_hash: String,
    pub value: String,
    pub state: String,
    pub process_id: Option<String>,
}

impl From<CarrydownRow> for CarrydownRecord {
    fn from(row: CarrydownRow) -> Self {
        CarrydownRecord {
            job_id: row.job_id,
            parent_hash: row.parent_hash,
            child_hash: row.child_hash,
            data_name: row.data_name,
            value_hash: row.value_hash,
            value: row.value,
            state: LinkState::from_str(&row.state).unwrap_or(LinkState::Base),
            process_id: row.process_id,
        }
    }
}

impl From<&CarrydownRecord> for CarrydownRow {
    fn from(record: &CarrydownRecord) -> Self {
        CarrydownRow {
            job_id: record.job_id,
            parent_hash: record.parent_hash.clone(),
            child_hash: record.child_hash.clone(),
            data_name: record.data_name.clone(),
            value_hash: record.value_hash.clone(),
            value: record.value.clone(),
            state: record.state.as_str().to_string(),
            process_id: record.process_id.clone(),
        }
    }
}

/// Intrinsic link row.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::intrinsic_links)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct LinkRow {
    pub job_id: i64,
    pub link_type: String,
    pub parent_hash: String,
    pub child_hash: String,
    pub state: String,
    pub process_id: Option<String>,
}

impl From<LinkRow> for LinkRecord {
    fn from(row: LinkRow) -> Self {
        LinkRecord {
            job_id: row.job_id,
            link_type: row.link_type,
            parent_hash: row.parent_hash,
            child_hash: row.child_hash,
            state: LinkState::from_str(&row.state).unwrap_or(LinkState::Base),
            process_id: row.process_id,
        }
    }
}

impl From<&LinkRecord> for LinkRow {
    fn from(record: &LinkRecord) -> Self {
        LinkRow {
            job_id: record.job_id,
            link_type: record.link_type.clone(),
            parent_hash: record.parent_hash.clone(),
            child_hash: record.child_hash.clone(),
            state: record.state.as_str().to_string(),
            process_id: record.process_id.clone(),
        }
    }
}

/// Hop-count row.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::hopcounts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct HopcountRow {
    pub job_id: i64,
    pub link_type: String,
    pub doc_hash: String,
    pub distance: i32,
}

impl From<HopcountRow> for HopcountRecord {
    fn from(row: HopcountRow) -> Self {
        HopcountRecord {
            job_id: row.job_id,
            link_type: row.link_type,
            doc_hash: row.doc_hash,
            distance: row.distance.max(0) as u32,
        }
    }
}

/// Lease row.
#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = schema::scheduler_leases)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct LeaseRow {
    pub name: String,
    pub process_id: String,
    pub holder_id: String,
    pub acquired_ms: i64,
    pub heartbeat_ms: i64,
    pub expires_ms: i64,
}
