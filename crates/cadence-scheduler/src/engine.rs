use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::SchedulerConfig;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    error::{Result, SchedulerError},
    registry::HandlerRegistry,
    schedule::{add_seconds, next_run_after_success},
    store::JobStore,
    types::{ExecutionStatus, Job, JobExecution, JobStatus},
};

/// Per-worker knobs the engine reads on every poll.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub lock_ttl: Duration,
    pub max_concurrent: usize,
    /// Snapshot stored on every execution record.
    pub environment_info: Value,
}

impl EngineSettings {
    pub fn from_config(worker_id: impl Into<String>, config: &SchedulerConfig) -> Self {
        let worker_id = worker_id.into();
        Self {
            environment_info: crate::worker::environment_info(&worker_id),
            worker_id,
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            lock_ttl: Duration::from_secs(config.lock_ttl_seconds),
            max_concurrent: config.max_concurrent_jobs.max(1),
        }
    }
}

/// Poll, claim, dispatch, record.
///
/// One engine per worker. Each poll claims up to `max_concurrent` due jobs,
/// runs them concurrently and waits for the whole batch before polling again.
#[derive(Clone)]
pub struct ExecutionEngine {
    store: Arc<JobStore>,
    registry: Arc<HandlerRegistry>,
    settings: Arc<EngineSettings>,
}

impl ExecutionEngine {
    pub fn new(store: Arc<JobStore>, registry: Arc<HandlerRegistry>, settings: EngineSettings) -> Self {
        Self {
            store,
            registry,
            settings: Arc::new(settings),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }

    /// Run one poll against the current time. Returns how many jobs were
    /// claimed.
    pub async fn poll_once(&self) -> Result<usize> {
        self.poll_at(Utc::now()).await
    }

    /// Run one poll treating `now` as the current time for due-ness and lock
    /// expiry.
    pub async fn poll_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let max = self.settings.max_concurrent;
        let candidates = self.store.select_due_unlocked(max.saturating_mul(2), now)?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut claimed = Vec::with_capacity(max);
        for job in candidates {
            if claimed.len() >= max {
                break;
            }
            match self
                .store
                .try_claim(&job.job_id, &self.settings.worker_id, self.settings.lock_ttl, now)
            {
                Ok(true) => claimed.push(job),
                Ok(false) => debug!(job_id = %job.job_id, "claim lost to another worker"),
                Err(e) => warn!(job_id = %job.job_id, "claim failed: {e}"),
            }
        }

        let count = claimed.len();
        let mut batch = JoinSet::new();
        for job in claimed {
            let attempt = Attempt {
                store: Arc::clone(&self.store),
                registry: Arc::clone(&self.registry),
                settings: Arc::clone(&self.settings),
            };
            batch.spawn(attempt.run(job));
        }
        while let Some(joined) = batch.join_next().await {
            if let Err(e) = joined {
                error!("job task ended abnormally: {e}");
            }
        }
        Ok(count)
    }

    /// Poll until `shutdown` broadcasts `true`. Sleeps `poll_interval` only
    /// when a poll found nothing to do.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.settings.worker_id, "execution engine started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let claimed = match self.poll_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!("poll failed: {e}");
                    0
                }
            };
            if claimed > 0 {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(worker_id = %self.settings.worker_id, "execution engine stopped");
    }
}

/// Releases the job lock when dropped, whichever way the attempt ended
/// (including the task being aborted).
struct LockGuard {
    store: Arc<JobStore>,
    job_id: String,
    worker_id: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.store.release_lock(&self.job_id, &self.worker_id) {
            Ok(true) => debug!(job_id = %self.job_id, "lock released"),
            Ok(false) => debug!(job_id = %self.job_id, "lock already gone"),
            Err(e) => warn!(job_id = %self.job_id, "lock release failed: {e}"),
        }
    }
}

struct Attempt {
    store: Arc<JobStore>,
    registry: Arc<HandlerRegistry>,
    settings: Arc<EngineSettings>,
}

impl Attempt {
    async fn run(self, job: Job) {
        let _guard = LockGuard {
            store: Arc::clone(&self.store),
            job_id: job.job_id.clone(),
            worker_id: self.settings.worker_id.clone(),
        };

        let started_at = Utc::now();
        let attempt = match self.store.confirm_pending_and_mark_running(
            &job.job_id,
            &self.settings.worker_id,
            started_at,
        ) {
            Ok(Some(n)) => n,
            Ok(None) => {
                debug!(job_id = %job.job_id, "job no longer pending; abandoning claim");
                return;
            }
            Err(e) => {
                warn!(job_id = %job.job_id, "could not mark job running: {e}");
                return;
            }
        };

        let span = info_span!("job", job_id = %job.job_id, job_type = %job.job_type, attempt);
        async {
            info!("running");
            let outcome = self.invoke(&job).await;
            let completed_at = Utc::now();
            if let Err(e) = self.finalize(&job, attempt, started_at, completed_at, outcome) {
                error!("finalization failed: {e}");
            }
        }
        .instrument(span)
        .await;
    }

    async fn invoke(&self, job: &Job) -> Result<Value> {
        let handler = self.registry.get(&job.job_type).ok_or_else(|| {
            SchedulerError::HandlerNotRegistered {
                job_type: job.job_type.clone(),
            }
        })?;

        AssertUnwindSafe(handler.run(job.parameters.clone()))
            .catch_unwind()
            .await
            .map_err(|panic| {
                SchedulerError::Handler(format!("handler panicked: {}", panic_message(&*panic)))
            })?
            .map_err(|e| SchedulerError::Handler(format!("{e:#}")))
    }

    fn finalize(
        &self,
        job: &Job,
        attempt: u32,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        outcome: Result<Value>,
    ) -> Result<()> {
        let worker_id = &self.settings.worker_id;
        let mut record = JobExecution {
            execution_id: Uuid::new_v4().to_string(),
            job_id: job.job_id.clone(),
            attempt_number: attempt,
            worker_id: worker_id.clone(),
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds(),
            status: ExecutionStatus::Success,
            error_message: None,
            parameters_used: job.parameters.clone(),
            environment_info: self.settings.environment_info.clone(),
            result: None,
        };

        let value = match outcome {
            Ok(value) => value,
            Err(err) => return self.fail(job, attempt, &err, record),
        };
        let result = (!value.is_null()).then_some(value);

        let next_run_at = match next_run_after_success(job, completed_at) {
            Ok(next) => next,
            Err(err) => {
                // The run itself succeeded but the job cannot be re-armed.
                record.result = result;
                let message = format!("{}: {err}", err.code());
                record.status = ExecutionStatus::Failed;
                record.error_message = Some(message.clone());
                self.store.record_execution(&record)?;
                self.store
                    .fail_or_retry(&job.job_id, worker_id, &message, None, JobStatus::Failed)?;
                error!(error = %message, "cannot compute next run; job failed");
                return Ok(());
            }
        };

        record.result = result.clone();
        self.store.record_execution(&record)?;
        let owned = self.store.complete(
            &job.job_id,
            worker_id,
            result.as_ref(),
            next_run_at,
            completed_at,
        )?;
        if !owned {
            warn!("lock lost before completion could be recorded");
            return Ok(());
        }
        match next_run_at {
            Some(next) => info!(duration_ms = record.duration_ms, next_run_at = %next, "succeeded; re-armed"),
            None => info!(duration_ms = record.duration_ms, "completed"),
        }
        Ok(())
    }

    fn fail(
        &self,
        job: &Job,
        attempt: u32,
        err: &SchedulerError,
        mut record: JobExecution,
    ) -> Result<()> {
        let worker_id = &self.settings.worker_id;
        let message = format!("{}: {err}", err.code());
        record.error_message = Some(message.clone());

        // Initial attempt plus `max_retries` retries.
        let exhausted = attempt > job.max_retries;
        let (new_status, next_run_at) = if exhausted {
            record.status = ExecutionStatus::Failed;
            (JobStatus::Failed, None)
        } else {
            record.status = ExecutionStatus::RetryScheduled;
            (
                JobStatus::Pending,
                Some(add_seconds(record.completed_at, job.retry_delay_seconds)),
            )
        };

        self.store.record_execution(&record)?;
        let owned =
            self.store
                .fail_or_retry(&job.job_id, worker_id, &message, next_run_at, new_status)?;
        if !owned {
            warn!("lock lost before failure could be recorded");
        } else if exhausted {
            warn!(error = %message, max_retries = job.max_retries, "retries exhausted; job failed");
        } else {
            warn!(error = %message, retry_at = ?next_run_at, "attempt failed; retry scheduled");
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
