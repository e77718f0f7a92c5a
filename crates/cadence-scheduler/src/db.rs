use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::Result;

/// How long a connection waits on another worker's write before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a store connection on `path` and make sure the schema exists.
///
/// Every worker process (and every loop inside one) opens its own
/// connection to the same file; WAL lets readers proceed while one writer
/// commits, and the busy timeout makes racing writers queue instead of
/// failing with `SQLITE_BUSY`.
pub fn open(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    init_db(&conn)?;
    Ok(conn)
}

/// Initialise the scheduler schema in `conn`. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_jobs_table(conn)?;
    create_executions_table(conn)?;
    Ok(())
}

fn create_jobs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            job_id              TEXT    NOT NULL PRIMARY KEY,
            job_type            TEXT    NOT NULL,
            parameters          TEXT    NOT NULL DEFAULT '{}',  -- JSON object
            priority            INTEGER NOT NULL DEFAULT 1,     -- 0=low .. 3=urgent
            schedule_type       TEXT    NOT NULL,
            schedule_expression TEXT,
            next_run_at         TEXT    NOT NULL,
            status              TEXT    NOT NULL DEFAULT 'pending',
            current_attempt     INTEGER NOT NULL DEFAULT 0,
            max_retries         INTEGER NOT NULL DEFAULT 3,
            retry_delay_seconds INTEGER NOT NULL DEFAULT 60,
            locked_by           TEXT,
            locked_at           TEXT,
            lock_expires_at     TEXT,
            started_at          TEXT,
            completed_at        TEXT,
            result              TEXT,                           -- JSON or NULL
            error_message       TEXT,
            job_group           TEXT,
            created_by          TEXT,
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL
        ) STRICT;

        -- Poll query: status = 'pending' AND next_run_at <= ? AND lock free
        CREATE INDEX IF NOT EXISTS idx_jobs_poll
            ON jobs (status, next_run_at, locked_by, lock_expires_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_locked_by
            ON jobs (locked_by) WHERE locked_by IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_jobs_group
            ON jobs (job_group) WHERE job_group IS NOT NULL;
        ",
    )?;
    Ok(())
}

fn create_executions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job_executions (
            execution_id     TEXT    NOT NULL PRIMARY KEY,
            job_id           TEXT    NOT NULL,
            attempt_number   INTEGER NOT NULL,
            worker_id        TEXT    NOT NULL,
            started_at       TEXT    NOT NULL,
            completed_at     TEXT    NOT NULL,
            duration_ms      INTEGER NOT NULL,
            status           TEXT    NOT NULL,   -- success | failed | retry_scheduled
            error_message    TEXT,
            parameters_used  TEXT    NOT NULL,
            environment_info TEXT    NOT NULL,
            result           TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_executions_job
            ON job_executions (job_id, started_at);
        CREATE INDEX IF NOT EXISTS idx_executions_started
            ON job_executions (started_at);
        ",
    )?;
    Ok(())
}
