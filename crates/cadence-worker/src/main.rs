use std::sync::Arc;

use anyhow::Context;
use cadence_core::CadenceConfig;
use cadence_scheduler::schedule::add_seconds;
use cadence_scheduler::{
    HandlerRegistry, JobFilter, JobOptions, JobStatus, JobStore, Priority, Scheduler, Worker,
};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

mod handlers;

#[derive(Parser, Debug)]
#[command(name = "cadence-worker")]
#[command(about = "Run a Cadence worker or manage scheduled jobs")]
#[command(version)]
struct Cli {
    /// Path to cadence.toml (falls back to CADENCE_CONFIG, then ~/.cadence/cadence.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a worker with the built-in handlers until Ctrl-C
    Run,
    /// Schedule a one-off job
    Schedule {
        #[command(flatten)]
        job: JobArgs,
        /// When to run (RFC 3339); defaults to now
        #[arg(long, conflicts_with = "delay")]
        at: Option<DateTime<Utc>>,
        /// Run this many seconds from now
        #[arg(long)]
        delay: Option<u64>,
    },
    /// Schedule a cron job (5-field Unix syntax, UTC)
    Cron {
        #[command(flatten)]
        job: JobArgs,
        /// Cron expression, e.g. "*/15 * * * *"
        #[arg(long)]
        expr: String,
    },
    /// Schedule a job that repeats every N seconds after each success
    Interval {
        #[command(flatten)]
        job: JobArgs,
        /// Interval in seconds
        #[arg(long)]
        every: u64,
    },
    /// Cancel a job that has not started yet
    Cancel { job_id: String },
    /// Show a job's current state
    Status { job_id: String },
    /// List jobs, newest first
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        job_type: Option<String>,
        #[arg(long)]
        group: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show every recorded attempt of a job
    History { job_id: String },
}

#[derive(Args, Debug)]
struct JobArgs {
    /// Handler key, e.g. "echo"
    job_type: String,
    /// JSON parameters passed to the handler
    #[arg(long, default_value = "{}")]
    params: String,
    #[arg(long)]
    priority: Option<Priority>,
    #[arg(long)]
    max_retries: Option<u32>,
    /// Seconds to wait before retrying a failed attempt
    #[arg(long)]
    retry_delay: Option<u64>,
    #[arg(long)]
    group: Option<String>,
    /// Explicit job id (a UUID is generated otherwise)
    #[arg(long)]
    id: Option<String>,
}

impl JobArgs {
    fn parameters(&self) -> anyhow::Result<Value> {
        serde_json::from_str(&self.params).context("--params must be valid JSON")
    }

    fn options(&self, scheduler: &Scheduler) -> JobOptions {
        let mut opts = scheduler.options().created_by("cadence-worker");
        if let Some(p) = self.priority {
            opts = opts.priority(p);
        }
        if let Some(n) = self.max_retries {
            opts = opts.max_retries(n);
        }
        if let Some(s) = self.retry_delay {
            opts = opts.retry_delay_seconds(s);
        }
        if let Some(g) = &self.group {
            opts = opts.job_group(g.clone());
        }
        if let Some(id) = &self.id {
            opts = opts.job_id(id.clone());
        }
        opts
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_worker=info,cadence_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: explicit path > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref()).context("loading configuration")?;
    ensure_parent_dir(&config.database.path);

    match cli.command {
        Command::Run => run_worker(&config).await,
        command => manage(&config, command),
    }
}

async fn run_worker(config: &CadenceConfig) -> anyhow::Result<()> {
    let mut registry = HandlerRegistry::new();
    handlers::register_builtin(&mut registry);

    let handle = Worker::new(config, registry).start()?;
    info!(worker_id = %handle.worker_id(), "worker running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown requested");

    let released = handle.shutdown().await?;
    info!(released, "worker exited cleanly");
    Ok(())
}

fn manage(config: &CadenceConfig, command: Command) -> anyhow::Result<()> {
    info!(path = %config.database.path, "opening job store");
    let store = Arc::new(JobStore::open(&config.database.path)?);
    let scheduler = Scheduler::new(store, &config.scheduler);

    match command {
        Command::Run => anyhow::bail!("`run` starts a worker and is not a store command"),
        Command::Schedule { job, at, delay } => {
            let run_at = match (at, delay) {
                (Some(at), _) => at,
                (None, Some(secs)) => add_seconds(Utc::now(), secs),
                (None, None) => Utc::now(),
            };
            let id = scheduler.schedule_job(
                &job.job_type,
                run_at,
                job.parameters()?,
                job.options(&scheduler),
            )?;
            println!("{id}");
        }
        Command::Cron { job, expr } => {
            let id = scheduler.schedule_recurring_job(
                &job.job_type,
                &expr,
                job.parameters()?,
                job.options(&scheduler),
            )?;
            println!("{id}");
        }
        Command::Interval { job, every } => {
            let id = scheduler.schedule_interval_job(
                &job.job_type,
                every,
                job.parameters()?,
                job.options(&scheduler),
            )?;
            println!("{id}");
        }
        Command::Cancel { job_id } => {
            if scheduler.cancel_job(&job_id)? {
                println!("cancelled {job_id}");
            } else {
                anyhow::bail!("job {job_id} is running, finished or unknown; not cancelled");
            }
        }
        Command::Status { job_id } => match scheduler.get_job_status(&job_id)? {
            Some(view) => print_json(&view)?,
            None => anyhow::bail!("job {job_id} not found"),
        },
        Command::List {
            status,
            job_type,
            group,
            limit,
        } => {
            let filter = JobFilter {
                status,
                job_type,
                job_group: group,
                limit: Some(limit),
            };
            print_json(&scheduler.list_jobs(&filter)?)?;
        }
        Command::History { job_id } => print_json(&scheduler.job_history(&job_id)?)?,
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
