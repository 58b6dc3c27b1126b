//! Schema creation for the SQLite store.

use std::path::Path;

use rusqlite::Connection;
use tracing::debug;

use crate::error::SchedulerResult;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    seeding_process_id TEXT,
    seeding_check_time INTEGER,
    seeding_fail_time INTEGER,
    seeding_fail_count INTEGER NOT NULL DEFAULT 0,
    last_seeding_ms INTEGER,
    run_started_ms INTEGER
);

CREATE TABLE IF NOT EXISTS queue_entries (
    job_id INTEGER NOT NULL,
    doc_hash TEXT NOT NULL,
    doc_id TEXT NOT NULL,
    status TEXT NOT NULL,
    priority REAL,
    needs_priority INTEGER NOT NULL DEFAULT 1,
    check_time INTEGER NOT NULL,
    fail_time INTEGER,
    fail_count INTEGER NOT NULL DEFAULT 0,
    origination_time INTEGER,
    processed_before INTEGER NOT NULL DEFAULT 0,
    seed_status TEXT NOT NULL DEFAULT '',
    seeding_process_id TEXT,
    process_id TEXT,
    last_version TEXT,
    last_error TEXT,
    PRIMARY KEY (job_id, doc_hash)
);

CREATE INDEX IF NOT EXISTS idx_queue_ready
    ON queue_entries(status, check_time, priority);
CREATE INDEX IF NOT EXISTS idx_queue_process
    ON queue_entries(process_id);

CREATE TABLE IF NOT EXISTS carrydown (
    job_id INTEGER NOT NULL,
    parent_hash TEXT NOT NULL,
    child_hash TEXT NOT NULL,
    data_name TEXT NOT NULL,
    value_hash TEXT NOT NULL,
    value TEXT NOT NULL,
    state TEXT NOT NULL,
    process_id TEXT,
    PRIMARY KEY (job_id, parent_hash, child_hash, data_name, value_hash)
);

CREATE INDEX IF NOT EXISTS idx_carrydown_child
    ON carrydown(job_id, child_hash);

CREATE TABLE IF NOT EXISTS intrinsic_links (
    job_id INTEGER NOT NULL,
    link_type TEXT NOT NULL,
    parent_hash TEXT NOT NULL,
    child_hash TEXT NOT NULL,
    state TEXT NOT NULL,
    process_id TEXT,
    PRIMARY KEY (job_id, link_type, parent_hash, child_hash)
);

CREATE INDEX IF NOT EXISTS idx_links_child
    ON intrinsic_links(job_id, child_hash);

CREATE TABLE IF NOT EXISTS hopcounts (
    job_id INTEGER NOT NULL,
    link_type TEXT NOT NULL,
    doc_hash TEXT NOT NULL,
    distance INTEGER NOT NULL,
    PRIMARY KEY (job_id, link_type, doc_hash)
);

CREATE TABLE IF NOT EXISTS bin_counters (
    connector_id TEXT NOT NULL,
    bin_name TEXT NOT NULL,
    counter REAL NOT NULL,
    PRIMARY KEY (connector_id, bin_name)
);

CREATE TABLE IF NOT EXISTS scheduler_leases (
    name TEXT PRIMARY KEY NOT NULL,
    process_id TEXT NOT NULL,
    holder_id TEXT NOT NULL,
    acquired_ms INTEGER NOT NULL,
    heartbeat_ms INTEGER NOT NULL,
    expires_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS scheduler_values (
    name TEXT PRIMARY KEY NOT NULL,
    value REAL NOT NULL
);
"#;

/// Create every table the store uses. Safe to run repeatedly.
pub fn init_schema(db_path: &Path) -> SchedulerResult<()> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(SCHEMA)?;
    debug!("Initialized queue schema at {}", db_path.display());
    Ok(())
}
