use std::sync::Arc;

use cadence_core::SchedulerConfig;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    error::{Result, SchedulerError},
    schedule::{add_seconds, check_delay, next_cron_run},
    store::JobStore,
    types::{Job, JobExecution, JobFilter, JobOptions, JobView, ScheduleType},
};

/// Public entry points for creating, cancelling and inspecting jobs.
///
/// Every call is a synchronous round-trip to the store; nothing here talks to
/// running workers. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<JobStore>,
    default_max_retries: u32,
    default_retry_delay_seconds: u64,
}

impl Scheduler {
    pub fn new(store: Arc<JobStore>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            default_max_retries: config.default_max_retries,
            default_retry_delay_seconds: config.default_retry_delay_seconds,
        }
    }

    /// Job options seeded with the configured retry policy.
    pub fn options(&self) -> JobOptions {
        JobOptions::default()
            .max_retries(self.default_max_retries)
            .retry_delay_seconds(self.default_retry_delay_seconds)
    }

    /// Schedule a ONCE job at `run_at`. A past `run_at` makes the job due on
    /// the next poll.
    #[instrument(skip(self, parameters, options), fields(job_type = %job_type))]
    pub fn schedule_job(
        &self,
        job_type: &str,
        run_at: DateTime<Utc>,
        parameters: Value,
        options: JobOptions,
    ) -> Result<String> {
        self.insert(job_type, parameters, ScheduleType::Once, None, run_at, options)
    }

    /// Schedule a CRON job; the first run is the next firing after now.
    #[instrument(skip(self, parameters, options), fields(job_type = %job_type))]
    pub fn schedule_recurring_job(
        &self,
        job_type: &str,
        cron_expression: &str,
        parameters: Value,
        options: JobOptions,
    ) -> Result<String> {
        let first = next_cron_run(cron_expression, Utc::now())?;
        self.insert(
            job_type,
            parameters,
            ScheduleType::Cron,
            Some(cron_expression.trim().to_string()),
            first,
            options,
        )
    }

    /// Schedule an INTERVAL job; the first run is `now + interval_seconds`.
    #[instrument(skip(self, parameters, options), fields(job_type = %job_type))]
    pub fn schedule_interval_job(
        &self,
        job_type: &str,
        interval_seconds: u64,
        parameters: Value,
        options: JobOptions,
    ) -> Result<String> {
        if interval_seconds == 0 {
            return Err(SchedulerError::InvalidSchedule(
                "interval must be greater than zero".to_string(),
            ));
        }
        check_delay("interval", interval_seconds)?;
        let first = add_seconds(Utc::now(), interval_seconds);
        self.insert(
            job_type,
            parameters,
            ScheduleType::Interval,
            Some(interval_seconds.to_string()),
            first,
            options,
        )
    }

    /// Cancel a job that has not started. Returns false if the job is
    /// running, already finished, or unknown.
    #[instrument(skip(self))]
    pub fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let cancelled = self.store.cancel(job_id, Utc::now())?;
        if cancelled {
            info!(%job_id, "job cancelled");
        }
        Ok(cancelled)
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<Option<JobView>> {
        Ok(self.store.get_job(job_id)?.map(JobView::from))
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobView>> {
        Ok(self
            .store
            .list_jobs(filter)?
            .into_iter()
            .map(JobView::from)
            .collect())
    }

    /// Every recorded attempt of `job_id`, oldest first.
    pub fn job_history(&self, job_id: &str) -> Result<Vec<JobExecution>> {
        self.store.executions_for(job_id)
    }

    fn insert(
        &self,
        job_type: &str,
        parameters: Value,
        schedule_type: ScheduleType,
        schedule_expression: Option<String>,
        next_run_at: DateTime<Utc>,
        options: JobOptions,
    ) -> Result<String> {
        check_delay("retry delay", options.retry_delay_seconds)?;
        let job_id = options
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let job = Job::new_pending(
            job_id,
            job_type,
            parameters,
            schedule_type,
            schedule_expression,
            next_run_at,
            &options,
            Utc::now(),
        );
        self.store.insert_job(&job)?;
        info!(
            job_id = %job.job_id,
            schedule_type = %schedule_type,
            next_run_at = %job.next_run_at,
            priority = %job.priority,
            "job scheduled"
        );
        Ok(job.job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobStatus, Priority};
    use chrono::Duration;
    use serde_json::json;

    fn scheduler() -> Scheduler {
        let store = Arc::new(JobStore::in_memory().unwrap());
        Scheduler::new(store, &SchedulerConfig::default())
    }

    #[test]
    fn schedule_once_job_is_pending() {
        let s = scheduler();
        let run_at = Utc::now() + Duration::minutes(5);
        let id = s
            .schedule_job("email", run_at, json!({"to": "ops"}), s.options())
            .unwrap();
        let view = s.get_job_status(&id).unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.schedule_type, ScheduleType::Once);
        assert_eq!(view.current_attempt, 0);
        assert_eq!(view.max_retries, cadence_core::config::DEFAULT_MAX_RETRIES);
        assert!(view.schedule_expression.is_none());
    }

    #[test]
    fn invalid_cron_fails_fast() {
        let s = scheduler();
        let err = s
            .schedule_recurring_job("report", "every tuesday", json!({}), s.options())
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEDULE");
        assert!(s.list_jobs(&JobFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn cron_first_run_is_in_the_future() {
        let s = scheduler();
        let before = Utc::now();
        let id = s
            .schedule_recurring_job("report", "*/5 * * * *", json!({}), s.options())
            .unwrap();
        let view = s.get_job_status(&id).unwrap().unwrap();
        assert!(view.next_run_at > before);
        assert!(view.next_run_at <= before + Duration::minutes(5));
        assert_eq!(view.schedule_expression.as_deref(), Some("*/5 * * * *"));
    }

    #[test]
    fn zero_interval_rejected() {
        let s = scheduler();
        let err = s
            .schedule_interval_job("tick", 0, json!({}), s.options())
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEDULE");
    }

    #[test]
    fn oversized_delays_rejected_and_polling_unaffected() {
        let s = scheduler();
        let err = s
            .schedule_interval_job("y", 1_000_000_000_000, json!({}), s.options())
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEDULE");
        let err = s
            .schedule_job(
                "y",
                Utc::now(),
                json!({}),
                s.options().retry_delay_seconds(u64::MAX),
            )
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEDULE");

        let id = s
            .schedule_job("due", Utc::now(), json!({}), s.options())
            .unwrap();
        let due = s.store.select_due_unlocked(10, Utc::now()).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].job_id, id);
    }

    #[test]
    fn interval_first_run_is_now_plus_interval() {
        let s = scheduler();
        let before = Utc::now();
        let id = s
            .schedule_interval_job("tick", 60, json!({}), s.options())
            .unwrap();
        let view = s.get_job_status(&id).unwrap().unwrap();
        let delta = view.next_run_at - before;
        // stored timestamps are truncated to milliseconds
        assert!(delta > Duration::milliseconds(59_998) && delta < Duration::seconds(62));
        assert_eq!(view.schedule_expression.as_deref(), Some("60"));
    }

    #[test]
    fn explicit_id_and_duplicate() {
        let s = scheduler();
        let opts = s
            .options()
            .job_id("nightly")
            .priority(Priority::Urgent)
            .job_group("reports");
        let id = s
            .schedule_job("report", Utc::now(), json!({}), opts.clone())
            .unwrap();
        assert_eq!(id, "nightly");
        let err = s
            .schedule_job("report", Utc::now(), json!({}), opts)
            .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_ID");

        let view = s.get_job_status("nightly").unwrap().unwrap();
        assert_eq!(view.priority, Priority::Urgent);
        assert_eq!(view.job_group.as_deref(), Some("reports"));
    }

    #[test]
    fn cancel_pending_then_again() {
        let s = scheduler();
        let id = s
            .schedule_job("email", Utc::now(), json!({}), s.options())
            .unwrap();
        assert!(s.cancel_job(&id).unwrap());
        assert!(!s.cancel_job(&id).unwrap());
        assert!(!s.cancel_job("unknown").unwrap());
        assert_eq!(
            s.get_job_status(&id).unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[test]
    fn options_follow_config() {
        let store = Arc::new(JobStore::in_memory().unwrap());
        let config = SchedulerConfig {
            default_max_retries: 7,
            default_retry_delay_seconds: 5,
            ..SchedulerConfig::default()
        };
        let s = Scheduler::new(store, &config);
        let opts = s.options();
        assert_eq!(opts.max_retries, 7);
        assert_eq!(opts.retry_delay_seconds, 5);
    }
}
