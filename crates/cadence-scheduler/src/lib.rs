//! `cadence-scheduler`: persistent job scheduler with SQLite-backed
//! distributed locking.
//!
//! # Overview
//!
//! Jobs live in a SQLite `jobs` table shared by every worker process. The
//! [`api::Scheduler`] writes them; each [`worker::Worker`] runs three loops
//! against the same file:
//!
//! | Loop                              | Every                           | Does                                          |
//! |-----------------------------------|---------------------------------|-----------------------------------------------|
//! | [`engine::ExecutionEngine`]       | `poll_interval_seconds` if idle | claim due jobs, run handlers, record outcome  |
//! | [`maintenance::LockMaintenance`]  | `lock_refresh_interval_seconds` | extend locks on this worker's running jobs    |
//! | [`cleanup::Cleanup`]              | `cleanup_interval_seconds`      | reclaim expired locks, purge old executions   |
//!
//! Workers never talk to each other. Ownership of a job is decided by a
//! single conditional `UPDATE` ([`store::JobStore::try_claim`]), so at most
//! one worker runs a job at a time; a crashed worker's jobs become claimable
//! again once their lock expires. Handlers may therefore run more than once
//! and must be idempotent.
//!
//! # Schedule types
//!
//! | Type       | `schedule_expression`         | After success                       |
//! |------------|-------------------------------|-------------------------------------|
//! | `Once`     | none                          | `completed`                         |
//! | `Interval` | whole seconds                 | `pending`, next run = finish + secs |
//! | `Cron`     | 5-field (or 6/7-field) cron   | `pending`, next firing after finish |

pub mod api;
pub mod cleanup;
pub mod db;
pub mod engine;
pub mod error;
pub mod maintenance;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod types;
pub mod worker;

pub use api::Scheduler;
pub use engine::{EngineSettings, ExecutionEngine};
pub use error::{Result, SchedulerError};
pub use registry::{HandlerRegistry, JobHandler};
pub use store::JobStore;
pub use types::{
    ExecutionStatus, Job, JobExecution, JobFilter, JobOptions, JobStatus, JobView, Priority,
    ScheduleType,
};
pub use worker::{Worker, WorkerHandle};
