//! Pooled SQLite connections for the queue store.
//!
//! Every crawler process sharing a queue database opens its own pool.
//! Store calls are synchronous; async callers wrap them in spawn_blocking.

use std::path::Path;
use std::time::Duration;

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PoolError};

/// Connection pool for the queue database.
pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

/// Connections held by one process. Claims and completions each hold one
/// for the length of a write transaction.
const MAX_CONNECTIONS: u32 = 8;

/// How long a worker waits for a free connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Applied to each connection as it leaves the pool.
///
/// WAL lets readers of the queue proceed while another process holds the
/// write lock; the busy timeout makes writers wait for it instead of failing.
const QUEUE_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
    "PRAGMA cache_size = -16000",
    "PRAGMA temp_store = MEMORY",
];

#[derive(Debug)]
struct QueuePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for QueuePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        apply_queue_pragmas(conn).map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Open a connection pool on the queue database at `db_path`.
pub fn open_pool(db_path: &Path) -> Result<SqlitePool, PoolError> {
    let manager = ConnectionManager::<SqliteConnection>::new(db_path.to_string_lossy());
    Pool::builder()
        .max_size(MAX_CONNECTIONS)
        .connection_timeout(ACQUIRE_TIMEOUT)
        .connection_customizer(Box::new(QueuePragmas))
        .build(manager)
}

/// Set the queue's connection pragmas on `conn`.
pub fn apply_queue_pragmas(conn: &mut SqliteConnection) -> Result<(), diesel::result::Error> {
    for pragma in QUEUE_PRAGMAS {
        diesel::sql_query(*pragma).execute(conn)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::sql_types::BigInt;
    use tempfile::tempdir;

    #[derive(QueryableByName)]
    struct Timeout {
        #[diesel(sql_type = BigInt)]
        timeout: i64,
    }

    #[derive(QueryableByName)]
    struct JournalMode {
        #[diesel(sql_type = diesel::sql_types::Text)]
        journal_mode: String,
    }

    #[test]
    fn test_pooled_connections_wait_on_locks() {
        let dir = tempdir().unwrap();
        let pool = open_pool(&dir.path().join("queue.db")).unwrap();
        let mut conn = pool.get().unwrap();

        let busy: Timeout = diesel::sql_query("PRAGMA busy_timeout")
            .get_result(&mut *conn)
            .unwrap();
        assert_eq!(busy.timeout, 5000);

        let mode: JournalMode = diesel::sql_query("PRAGMA journal_mode")
            .get_result(&mut *conn)
            .unwrap();
        assert_eq!(mode.journal_mode, "wal");
    }
}
