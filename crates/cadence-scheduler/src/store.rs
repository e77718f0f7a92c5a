use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{ffi, params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info};

use crate::db;
use crate::error::{Result, SchedulerError};
use crate::schedule::latest_instant;
use crate::types::{ExecutionStatus, Job, JobExecution, JobFilter, JobStatus, Priority};

const JOB_COLUMNS: &str = "job_id, job_type, parameters, priority, schedule_type,
    schedule_expression, next_run_at, status, current_attempt, max_retries,
    retry_delay_seconds, locked_by, locked_at, lock_expires_at, started_at,
    completed_at, result, error_message, job_group, created_by, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "execution_id, job_id, attempt_number, worker_id,
    started_at, completed_at, duration_ms, status, error_message, parameters_used,
    environment_info, result";

/// Format a timestamp for storage.
///
/// Fixed width (millisecond precision, `Z` suffix) so that string comparison
/// in SQL matches chronological order. Instants past year 9999 are clamped.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.min(latest_instant())
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Durable job table plus the conditional updates workers coordinate through.
///
/// Thread-safe: wraps one SQLite connection in a `Mutex`. Each worker loop
/// opens its own `JobStore` against the shared database file; SQLite
/// serialises the writes, so every single-statement primitive below is atomic
/// across processes.
pub struct JobStore {
    db: Mutex<Connection>,
}

impl JobStore {
    /// Wrap an already-open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (and initialise) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: Mutex::new(db::open(path)?),
        })
    }

    /// Private in-memory store, used by tests and single-process tooling.
    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| SchedulerError::Poisoned)
    }

    // --- creation & reads ----------------------------------------------------

    /// Insert a new job. Fails with `DuplicateId` if `job_id` is taken.
    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let db = self.conn()?;
        let params_json = serde_json::to_string(&job.parameters)?;
        let result_json = job.result.as_ref().map(serde_json::to_string).transpose()?;

        let inserted = db.execute(
            "INSERT INTO jobs
             (job_id, job_type, parameters, priority, schedule_type, schedule_expression,
              next_run_at, status, current_attempt, max_retries, retry_delay_seconds,
              locked_by, locked_at, lock_expires_at, started_at, completed_at,
              result, error_message, job_group, created_by, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)",
            params![
                job.job_id,
                job.job_type,
                params_json,
                job.priority.rank(),
                job.schedule_type.to_string(),
                job.schedule_expression,
                ts(job.next_run_at),
                job.status.as_str(),
                job.current_attempt,
                job.max_retries,
                secs_i64(job.retry_delay_seconds),
                job.locked_by,
                job.locked_at.map(ts),
                job.lock_expires_at.map(ts),
                job.started_at.map(ts),
                job.completed_at.map(ts),
                result_json,
                job.error_message,
                job.job_group,
                job.created_by,
                ts(job.created_at),
                ts(job.updated_at),
            ],
        );

        match inserted {
            Ok(_) => {
                debug!(job_id = %job.job_id, job_type = %job.job_type, "job inserted");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                Err(SchedulerError::DuplicateId {
                    id: job.job_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let db = self.conn()?;
        let job = db
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
                [job_id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Jobs matching `filter`, newest first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let db = self.conn()?;
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR job_type = ?2)
               AND (?3 IS NULL OR job_group = ?3)
             ORDER BY created_at DESC
             LIMIT ?4"
        ))?;
        let jobs = stmt
            .query_map(
                params![
                    filter.status.map(JobStatus::as_str),
                    filter.job_type,
                    filter.job_group,
                    limit
                ],
                row_to_job,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Due, claimable jobs in `priority DESC, next_run_at ASC` order.
    ///
    /// The result may be stale by the time the caller acts on it; ownership
    /// is only decided by [`JobStore::try_claim`].
    pub fn select_due_unlocked(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let db = self.conn()?;
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = 'pending'
               AND next_run_at <= ?1
               AND (locked_by IS NULL OR lock_expires_at <= ?1)
             ORDER BY priority DESC, next_run_at ASC
             LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(params![ts(now), limit as i64], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    // --- ownership -------------------------------------------------------------

    /// Atomically take the lock on `job_id` if nobody holds an unexpired one.
    ///
    /// Single conditional UPDATE: of any number of workers racing on the same
    /// row exactly one sees `true`.
    pub fn try_claim(
        &self,
        job_id: &str,
        worker_id: &str,
        lock_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let db = self.conn()?;
        let expires = expiry_after(now, lock_ttl);
        let n = db.execute(
            "UPDATE jobs SET locked_by = ?1, locked_at = ?2, lock_expires_at = ?3, updated_at = ?2
             WHERE job_id = ?4 AND (locked_by IS NULL OR lock_expires_at <= ?2)",
            params![worker_id, ts(now), ts(expires), job_id],
        )?;
        Ok(n == 1)
    }

    /// Move a claimed job from PENDING to RUNNING.
    ///
    /// Re-checks the status (another worker may have advanced the job
    /// between our stale read and the claim) and that `worker_id` still holds
    /// the lock. Returns the new attempt number, or `None` when the
    /// precondition no longer holds.
    pub fn confirm_pending_and_mark_running(
        &self,
        job_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        let db = self.conn()?;
        let attempt = db
            .query_row(
                "UPDATE jobs
                 SET status = 'running', started_at = ?1, updated_at = ?1,
                     current_attempt = current_attempt + 1
                 WHERE job_id = ?2 AND status = 'pending' AND locked_by = ?3
                 RETURNING current_attempt",
                params![ts(now), job_id, worker_id],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;
        Ok(attempt)
    }

    /// Clear the lock if `owner` holds it. A job still RUNNING (finalisation
    /// never happened) goes back to PENDING so it can be picked up again.
    pub fn release_lock(&self, job_id: &str, owner: &str) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE jobs
             SET locked_by = NULL, locked_at = NULL, lock_expires_at = NULL,
                 status = CASE WHEN status = 'running' THEN 'pending' ELSE status END,
                 updated_at = ?1
             WHERE job_id = ?2 AND locked_by = ?3",
            params![ts(Utc::now()), job_id, owner],
        )?;
        Ok(n == 1)
    }

    /// Extend every lock `worker_id` holds on a RUNNING job.
    pub fn refresh_lock(&self, worker_id: &str, new_expiry: DateTime<Utc>) -> Result<usize> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE jobs SET lock_expires_at = ?1
             WHERE status = 'running' AND locked_by = ?2",
            params![ts(new_expiry), worker_id],
        )?;
        Ok(n)
    }

    /// Release every lock held by `worker_id` (shutdown courtesy).
    pub fn release_all(&self, worker_id: &str) -> Result<usize> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE jobs
             SET locked_by = NULL, locked_at = NULL, lock_expires_at = NULL,
                 status = CASE WHEN status = 'running' THEN 'pending' ELSE status END,
                 updated_at = ?1
             WHERE locked_by = ?2",
            params![ts(Utc::now()), worker_id],
        )?;
        if n > 0 {
            info!(worker_id, count = n, "released locks on shutdown");
        }
        Ok(n)
    }

    // --- finalisation -----------------------------------------------------------

    /// Record a successful run.
    ///
    /// `next_run_at = None` completes a ONCE job; `Some` re-arms a recurring
    /// job as PENDING with its attempt counter reset. The lock is left for
    /// [`JobStore::release_lock`]. Returns false if `worker_id` no longer owns
    /// the job.
    pub fn complete(
        &self,
        job_id: &str,
        worker_id: &str,
        outcome: Option<&Value>,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let db = self.conn()?;
        let result_json = outcome.map(serde_json::to_string).transpose()?;
        let n = match next_run_at {
            None => db.execute(
                "UPDATE jobs
                 SET status = 'completed', completed_at = ?1, updated_at = ?1,
                     result = ?2, error_message = NULL
                 WHERE job_id = ?3 AND locked_by = ?4",
                params![ts(now), result_json, job_id, worker_id],
            )?,
            Some(next) => db.execute(
                "UPDATE jobs
                 SET status = 'pending', next_run_at = ?1, current_attempt = 0,
                     result = ?2, error_message = NULL, updated_at = ?3
                 WHERE job_id = ?4 AND locked_by = ?5",
                params![ts(next), result_json, ts(now), job_id, worker_id],
            )?,
        };
        Ok(n == 1)
    }

    /// Record a failed run: `new_status` is PENDING (with `next_run_at` set to
    /// the retry time) or FAILED.
    pub fn fail_or_retry(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
        next_run_at: Option<DateTime<Utc>>,
        new_status: JobStatus,
    ) -> Result<bool> {
        let db = self.conn()?;
        let now = ts(Utc::now());
        let completed_at = new_status.is_terminal().then(|| now.clone());
        let n = db.execute(
            "UPDATE jobs
             SET status = ?1, error_message = ?2,
                 next_run_at = COALESCE(?3, next_run_at),
                 completed_at = COALESCE(?4, completed_at),
                 updated_at = ?5
             WHERE job_id = ?6 AND locked_by = ?7",
            params![
                new_status.as_str(),
                error,
                next_run_at.map(ts),
                completed_at,
                now,
                job_id,
                worker_id
            ],
        )?;
        Ok(n == 1)
    }

    /// Cancel a job that is PENDING or RETRYING and not currently owned.
    /// Returns false for running, terminal, owned or unknown jobs.
    pub fn cancel(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE jobs SET status = 'cancelled', updated_at = ?1
             WHERE job_id = ?2
               AND status IN ('pending', 'retrying')
               AND (locked_by IS NULL OR lock_expires_at <= ?1)",
            params![ts(now), job_id],
        )?;
        Ok(n == 1)
    }

    // --- maintenance ------------------------------------------------------------

    /// Unlock every job whose lock expired without a refresh. RUNNING jobs go
    /// back to PENDING; terminal jobs keep their status. Idempotent.
    pub fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE jobs
             SET locked_by = NULL, locked_at = NULL, lock_expires_at = NULL,
                 status = CASE WHEN status = 'running' THEN 'pending' ELSE status END,
                 updated_at = ?1
             WHERE locked_by IS NOT NULL AND lock_expires_at <= ?1",
            params![ts(now)],
        )?;
        Ok(n)
    }

    // --- execution history ------------------------------------------------------

    pub fn record_execution(&self, execution: &JobExecution) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            &format!(
                "INSERT INTO job_executions ({EXECUTION_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)"
            ),
            params![
                execution.execution_id,
                execution.job_id,
                execution.attempt_number,
                execution.worker_id,
                ts(execution.started_at),
                ts(execution.completed_at),
                execution.duration_ms,
                execution.status.as_str(),
                execution.error_message,
                serde_json::to_string(&execution.parameters_used)?,
                serde_json::to_string(&execution.environment_info)?,
                execution
                    .result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            ],
        )?;
        Ok(())
    }

    /// Attempt history for one job, oldest first.
    pub fn executions_for(&self, job_id: &str) -> Result<Vec<JobExecution>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions
             WHERE job_id = ?1 ORDER BY started_at ASC, attempt_number ASC"
        ))?;
        let rows = stmt
            .query_map([job_id], row_to_execution)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete execution rows that started before `cutoff`.
    pub fn purge_executions_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let db = self.conn()?;
        let n = db.execute(
            "DELETE FROM job_executions WHERE started_at < ?1",
            params![ts(cutoff)],
        )?;
        Ok(n)
    }
}

/// `now + ttl`, saturating at [`latest_instant`] on absurd TTLs.
pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .map_or_else(latest_instant, |dt| dt.min(latest_instant()))
}

fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

fn conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_err(idx: usize, msg: String) -> rusqlite::Error {
    conversion_err(idx, std::io::Error::new(std::io::ErrorKind::InvalidData, msg))
}

fn get_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn get_opt_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| conversion_err(idx, e)),
    }
}

fn get_json(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_err(idx, e))
}

fn get_opt_json(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| conversion_err(idx, e)),
    }
}

fn get_parsed<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| parse_err(idx, e))
}

/// Map a SELECT row (column order from `JOB_COLUMNS`) to a Job.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let rank: i64 = row.get(3)?;
    let priority = Priority::from_rank(rank)
        .ok_or_else(|| parse_err(3, format!("unknown priority rank: {rank}")))?;
    let retry_delay: i64 = row.get(10)?;
    Ok(Job {
        job_id: row.get(0)?,
        job_type: row.get(1)?,
        parameters: get_json(row, 2)?,
        priority,
        schedule_type: get_parsed(row, 4)?,
        schedule_expression: row.get(5)?,
        next_run_at: get_ts(row, 6)?,
        status: get_parsed(row, 7)?,
        current_attempt: row.get(8)?,
        max_retries: row.get(9)?,
        retry_delay_seconds: u64::try_from(retry_delay).unwrap_or(0),
        locked_by: row.get(11)?,
        locked_at: get_opt_ts(row, 12)?,
        lock_expires_at: get_opt_ts(row, 13)?,
        started_at: get_opt_ts(row, 14)?,
        completed_at: get_opt_ts(row, 15)?,
        result: get_opt_json(row, 16)?,
        error_message: row.get(17)?,
        job_group: row.get(18)?,
        created_by: row.get(19)?,
        created_at: get_ts(row, 20)?,
        updated_at: get_ts(row, 21)?,
    })
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobExecution> {
    let status: ExecutionStatus = get_parsed(row, 7)?;
    Ok(JobExecution {
        execution_id: row.get(0)?,
        job_id: row.get(1)?,
        attempt_number: row.get(2)?,
        worker_id: row.get(3)?,
        started_at: get_ts(row, 4)?,
        completed_at: get_ts(row, 5)?,
        duration_ms: row.get(6)?,
        status,
        error_message: row.get(8)?,
        parameters_used: get_json(row, 9)?,
        environment_info: get_json(row, 10)?,
        result: get_opt_json(row, 11)?,
    })
}
