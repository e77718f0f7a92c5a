use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Selection tie-break. Persisted as its integer rank so `ORDER BY priority
/// DESC` works directly in SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn rank(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Priority::Low),
            1 => Some(Priority::Normal),
            2 => Some(Priority::High),
            3 => Some(Priority::Urgent),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Determines how `next_run_at` is recomputed after a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Once,
    Interval,
    Cron,
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleType::Once => "once",
            ScheduleType::Interval => "interval",
            ScheduleType::Cron => "cron",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "once" => Ok(ScheduleType::Once),
            "interval" => Ok(ScheduleType::Interval),
            "cron" => Ok(ScheduleType::Cron),
            other => Err(format!("unknown schedule type: {other}")),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `next_run_at`; the only claimable state.
    Pending,
    /// A worker holds the lock and the handler is executing.
    Running,
    /// A ONCE job finished successfully.
    Completed,
    /// Retries exhausted.
    Failed,
    Cancelled,
    Retrying,
}

impl JobStatus {
    /// Terminal for ONCE jobs: nothing moves a job out of these states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "retrying" => Ok(JobStatus::Retrying),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Outcome of a single attempt as recorded in `job_executions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    RetryScheduled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::RetryScheduled => "retry_scheduled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "retry_scheduled" => Ok(ExecutionStatus::RetryScheduled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// UUID v4 string unless set explicitly. Primary key.
    pub job_id: String,
    /// Key into the handler registry.
    pub job_type: String,
    /// Opaque JSON payload handed to the handler verbatim.
    pub parameters: Value,
    pub priority: Priority,
    pub schedule_type: ScheduleType,
    /// Cron expression for CRON, interval seconds for INTERVAL, `None` for ONCE.
    pub schedule_expression: Option<String>,
    pub next_run_at: DateTime<Utc>,
    pub status: JobStatus,
    pub current_attempt: u32,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub job_group: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh PENDING job with no attempts and no lock.
    #[allow(clippy::too_many_arguments)]
    pub fn new_pending(
        job_id: String,
        job_type: &str,
        parameters: Value,
        schedule_type: ScheduleType,
        schedule_expression: Option<String>,
        next_run_at: DateTime<Utc>,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            job_type: job_type.to_string(),
            parameters,
            priority: options.priority,
            schedule_type,
            schedule_expression,
            next_run_at,
            status: JobStatus::Pending,
            current_attempt: 0,
            max_retries: options.max_retries,
            retry_delay_seconds: options.retry_delay_seconds,
            locked_by: None,
            locked_at: None,
            lock_expires_at: None,
            started_at: None,
            completed_at: None,
            result: None,
            error_message: None,
            job_group: options.job_group.clone(),
            created_by: options.created_by.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Optional arguments shared by the `schedule_*` entry points.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub priority: Priority,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub job_group: Option<String>,
    pub created_by: Option<String>,
    /// Explicit id; a UUID v4 is generated when `None`.
    pub job_id: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            max_retries: cadence_core::config::DEFAULT_MAX_RETRIES,
            retry_delay_seconds: cadence_core::config::DEFAULT_RETRY_DELAY_SECS,
            job_group: None,
            created_by: None,
            job_id: None,
        }
    }
}

impl JobOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay_seconds(mut self, secs: u64) -> Self {
        self.retry_delay_seconds = secs;
        self
    }

    pub fn job_group(mut self, group: impl Into<String>) -> Self {
        self.job_group = Some(group.into());
        self
    }

    pub fn created_by(mut self, who: impl Into<String>) -> Self {
        self.created_by = Some(who.into());
        self
    }

    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }
}

/// One immutable attempt record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub execution_id: String,
    pub job_id: String,
    pub attempt_number: u32,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub parameters_used: Value,
    pub environment_info: Value,
    pub result: Option<Value>,
}

/// Read-only status snapshot returned by `get_job_status`.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: Priority,
    pub schedule_type: ScheduleType,
    pub schedule_expression: Option<String>,
    pub current_attempt: u32,
    pub max_retries: u32,
    pub next_run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub job_group: Option<String>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.job_id,
            job_type: job.job_type,
            status: job.status,
            priority: job.priority,
            schedule_type: job.schedule_type,
            schedule_expression: job.schedule_expression,
            current_attempt: job.current_attempt,
            max_retries: job.max_retries,
            next_run_at: job.next_run_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
            locked_by: job.locked_by,
            last_error: job.error_message,
            result: job.result,
            job_group: job.job_group,
        }
    }
}

/// Filter for bulk job listing. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub job_group: Option<String>,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_low_to_urgent() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Urgent);
        for p in [Priority::Low, Priority::Normal, Priority::High, Priority::Urgent] {
            assert_eq!(Priority::from_rank(p.rank()), Some(p));
        }
        assert_eq!(Priority::from_rank(9), None);
    }

    #[test]
    fn status_string_forms_parse_back() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Retrying,
        ] {
            assert_eq!(s.to_string().parse::<JobStatus>(), Ok(s));
        }
        assert!("exploded".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }

    #[test]
    fn execution_status_serializes_snake_case() {
        let json = serde_json::to_string(&ExecutionStatus::RetryScheduled).unwrap();
        assert_eq!(json, r#""retry_scheduled""#);
    }
}
