use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use cadence_core::SchedulerConfig;
use cadence_scheduler::cleanup::Cleanup;
use cadence_scheduler::maintenance::LockMaintenance;
use cadence_scheduler::schedule::next_cron_run;
use cadence_scheduler::{
    EngineSettings, ExecutionEngine, ExecutionStatus, HandlerRegistry, Job, JobOptions, JobStatus,
    JobStore, ScheduleType, Scheduler,
};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Notify;

const WORKER: &str = "worker-a";

fn settings() -> EngineSettings {
    EngineSettings {
        worker_id: WORKER.to_string(),
        poll_interval: Duration::from_millis(10),
        lock_ttl: Duration::from_secs(60),
        max_concurrent: 4,
        environment_info: json!({"worker_id": WORKER}),
    }
}

fn setup(registry: HandlerRegistry) -> (Arc<JobStore>, Scheduler, ExecutionEngine) {
    let store = Arc::new(JobStore::in_memory().unwrap());
    let scheduler = Scheduler::new(Arc::clone(&store), &SchedulerConfig::default());
    let engine = ExecutionEngine::new(Arc::clone(&store), Arc::new(registry), settings());
    (store, scheduler, engine)
}

fn assert_unlocked(job: &Job) {
    assert!(job.locked_by.is_none(), "locked_by still set");
    assert!(job.locked_at.is_none(), "locked_at still set");
    assert!(job.lock_expires_at.is_none(), "lock_expires_at still set");
}

#[tokio::test]
async fn retry_exhaustion_takes_initial_attempt_plus_retries() {
    let store = Arc::new(JobStore::in_memory().unwrap());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut registry = HandlerRegistry::new();
    {
        let store = Arc::clone(&store);
        let seen = Arc::clone(&seen);
        registry.register_fn("flaky", move |_| {
            let status = store.get_job("j").unwrap().map(|j| j.status);
            seen.lock().unwrap().push(status);
            async { Err::<Value, _>(anyhow!("upstream unavailable")) }
        });
    }
    let scheduler = Scheduler::new(Arc::clone(&store), &SchedulerConfig::default());
    let engine = ExecutionEngine::new(Arc::clone(&store), Arc::new(registry), settings());

    let opts = scheduler.options().job_id("j").max_retries(2).retry_delay_seconds(0);
    scheduler.schedule_job("flaky", Utc::now(), json!({}), opts).unwrap();

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let claimed = engine
            .poll_at(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(claimed, 1);
        let job = store.get_job("j").unwrap().unwrap();
        assert_unlocked(&job);
        statuses.push((job.status, job.current_attempt));
    }
    assert_eq!(
        statuses,
        vec![
            (JobStatus::Pending, 1),
            (JobStatus::Pending, 2),
            (JobStatus::Failed, 3)
        ]
    );
    assert_eq!(
        engine
            .poll_at(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap(),
        0
    );

    // the handler always sees its own job as RUNNING
    assert_eq!(*seen.lock().unwrap(), vec![Some(JobStatus::Running); 3]);

    let history = scheduler.job_history("j").unwrap();
    let kinds: Vec<_> = history.iter().map(|e| (e.attempt_number, e.status)).collect();
    assert_eq!(
        kinds,
        vec![
            (1, ExecutionStatus::RetryScheduled),
            (2, ExecutionStatus::RetryScheduled),
            (3, ExecutionStatus::Failed)
        ]
    );
    let job = store.get_job("j").unwrap().unwrap();
    assert_eq!(
        job.error_message.as_deref(),
        Some("HANDLER_ERROR: upstream unavailable")
    );
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn once_job_without_retries_fails_after_one_attempt() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("boom", |_| async { Err::<Value, _>(anyhow!("bad input")) });
    let (store, scheduler, engine) = setup(registry);

    let opts = scheduler.options().max_retries(0);
    let id = scheduler
        .schedule_job("boom", Utc::now(), json!({"n": 1}), opts)
        .unwrap();
    assert_eq!(engine.poll_once().await.unwrap(), 1);

    let job = store.get_job(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.current_attempt, 1);
    assert_unlocked(&job);

    let history = scheduler.job_history(&id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Failed);
    assert_eq!(history[0].worker_id, WORKER);
    assert_eq!(history[0].parameters_used, json!({"n": 1}));
    assert_eq!(history[0].environment_info["worker_id"], WORKER);
}

#[tokio::test]
async fn interval_job_rearms_from_completion_time() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("tick", |_| async { Ok::<_, anyhow::Error>(json!({"ok": true})) });
    let (store, scheduler, engine) = setup(registry);

    let id = scheduler
        .schedule_interval_job("tick", 60, json!({}), scheduler.options())
        .unwrap();

    // not due yet
    assert_eq!(engine.poll_once().await.unwrap(), 0);

    let later = Utc::now() + chrono::Duration::seconds(61);
    assert_eq!(engine.poll_at(later).await.unwrap(), 1);

    let view = scheduler.get_job_status(&id).unwrap().unwrap();
    assert_eq!(view.status, JobStatus::Pending);
    assert_eq!(view.current_attempt, 0);
    assert_eq!(view.result, Some(json!({"ok": true})));

    let history = scheduler.job_history(&id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Success);
    assert_eq!(
        view.next_run_at - history[0].completed_at,
        chrono::Duration::seconds(60)
    );
    assert_unlocked(&store.get_job(&id).unwrap().unwrap());
}

#[tokio::test]
async fn cron_success_resets_attempts_and_uses_next_firing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let calls = Arc::clone(&calls);
        registry.register_fn("report", move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(anyhow!("first run fails"))
                } else {
                    Ok(Value::Null)
                }
            }
        });
    }
    let (store, scheduler, engine) = setup(registry);

    let expr = "*/5 * * * *";
    let now = Utc::now();
    let job = Job::new_pending(
        "cron-1".to_string(),
        "report",
        json!({}),
        ScheduleType::Cron,
        Some(expr.to_string()),
        now - chrono::Duration::days(1),
        &JobOptions::default().retry_delay_seconds(0),
        now,
    );
    store.insert_job(&job).unwrap();

    engine.poll_once().await.unwrap();
    let after_failure = store.get_job("cron-1").unwrap().unwrap();
    assert_eq!(after_failure.status, JobStatus::Pending);
    assert_eq!(after_failure.current_attempt, 1);

    engine.poll_once().await.unwrap();
    let job = store.get_job("cron-1").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.current_attempt, 0);
    assert!(job.error_message.is_none());
    assert!(job.result.is_none());
    assert!(job.next_run_at > Utc::now());

    let history = scheduler.job_history("cron-1").unwrap();
    let success = history.last().unwrap();
    assert_eq!(success.status, ExecutionStatus::Success);
    assert_eq!(
        job.next_run_at,
        next_cron_run(expr, success.completed_at).unwrap()
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn running_job_cannot_be_cancelled() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let mut registry = HandlerRegistry::new();
    {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        registry.register_fn("slow", move |_| {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            async move {
                started.notify_one();
                release.notified().await;
                Ok::<_, anyhow::Error>(json!("finished"))
            }
        });
    }
    let (store, scheduler, engine) = setup(registry);

    let running = scheduler
        .schedule_job("slow", Utc::now(), json!({}), scheduler.options())
        .unwrap();
    let waiting = scheduler
        .schedule_job(
            "slow",
            Utc::now() + chrono::Duration::hours(1),
            json!({}),
            scheduler.options(),
        )
        .unwrap();

    let poll = tokio::spawn(async move { engine.poll_once().await });
    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("handler started");

    assert!(!scheduler.cancel_job(&running).unwrap());
    assert_eq!(
        store.get_job(&running).unwrap().unwrap().status,
        JobStatus::Running
    );

    assert!(scheduler.cancel_job(&waiting).unwrap());
    assert_eq!(
        store.get_job(&waiting).unwrap().unwrap().status,
        JobStatus::Cancelled
    );

    release.notify_one();
    assert_eq!(poll.await.unwrap().unwrap(), 1);
    let job = store.get_job(&running).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_unlocked(&job);
}

#[tokio::test]
async fn lock_refresh_prevents_reclaim() {
    let store = Arc::new(JobStore::in_memory().unwrap());
    let now = Utc::now();
    let ttl = Duration::from_secs(60);
    let job = Job::new_pending(
        "long".to_string(),
        "export",
        json!({}),
        ScheduleType::Once,
        None,
        now,
        &JobOptions::default(),
        now,
    );
    store.insert_job(&job).unwrap();
    assert!(store.try_claim("long", WORKER, ttl, now).unwrap());
    assert_eq!(
        store
            .confirm_pending_and_mark_running("long", WORKER, now)
            .unwrap(),
        Some(1)
    );

    let maintenance = LockMaintenance::new(Arc::clone(&store), WORKER, Duration::from_secs(30), ttl);
    assert_eq!(
        maintenance
            .refresh_at(now + chrono::Duration::seconds(50))
            .unwrap(),
        1
    );

    let past_original_ttl = now + chrono::Duration::seconds(61);
    assert_eq!(store.reclaim_expired(past_original_ttl).unwrap(), 0);
    assert!(store
        .select_due_unlocked(10, past_original_ttl)
        .unwrap()
        .is_empty());
    assert!(!store
        .try_claim("long", "worker-b", ttl, past_original_ttl)
        .unwrap());

    let job = store.get_job("long").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.locked_by.as_deref(), Some(WORKER));

    // once refreshes stop, the lock lapses and the job is recovered
    let past_refreshed_ttl = now + chrono::Duration::seconds(111);
    assert_eq!(store.reclaim_expired(past_refreshed_ttl).unwrap(), 1);
    assert_eq!(
        store.get_job("long").unwrap().unwrap().status,
        JobStatus::Pending
    );
}

#[tokio::test]
async fn crashed_worker_job_is_recovered_and_rerun() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("idempotent", |_| async { Ok::<_, anyhow::Error>(json!("done")) });
    let (store, scheduler, engine) = setup(registry);

    let id = scheduler
        .schedule_job(
            "idempotent",
            Utc::now() - chrono::Duration::minutes(10),
            json!({}),
            scheduler.options(),
        )
        .unwrap();

    // a worker that claimed the job ten minutes ago and died mid-run
    let long_ago = Utc::now() - chrono::Duration::minutes(10);
    assert!(store
        .try_claim(&id, "dead-worker", Duration::from_secs(60), long_ago)
        .unwrap());
    store
        .confirm_pending_and_mark_running(&id, "dead-worker", long_ago)
        .unwrap();
    assert_eq!(engine.poll_once().await.unwrap(), 0);

    let cleanup = Cleanup::new(Arc::clone(&store), Duration::from_secs(60), 30);
    let report = cleanup.sweep_at(Utc::now()).unwrap();
    assert_eq!(report.reclaimed, 1);

    assert_eq!(engine.poll_once().await.unwrap(), 1);
    let job = store.get_job(&id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.current_attempt, 2);
    assert_unlocked(&job);
}

#[tokio::test]
async fn higher_priority_runs_first_when_capacity_is_short() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    {
        let order = Arc::clone(&order);
        registry.register_fn("record", move |p: Value| {
            order
                .lock()
                .unwrap()
                .push(p["name"].as_str().unwrap_or_default().to_string());
            async { Ok::<_, anyhow::Error>(Value::Null) }
        });
    }
    let store = Arc::new(JobStore::in_memory().unwrap());
    let scheduler = Scheduler::new(Arc::clone(&store), &SchedulerConfig::default());
    let engine = ExecutionEngine::new(
        Arc::clone(&store),
        Arc::new(registry),
        EngineSettings {
            max_concurrent: 1,
            ..settings()
        },
    );

    let now = Utc::now();
    for (name, priority) in [
        ("low", cadence_scheduler::Priority::Low),
        ("urgent", cadence_scheduler::Priority::Urgent),
        ("normal", cadence_scheduler::Priority::Normal),
    ] {
        scheduler
            .schedule_job(
                "record",
                now,
                json!({"name": name}),
                scheduler.options().priority(priority),
            )
            .unwrap();
    }
    for _ in 0..3 {
        assert_eq!(engine.poll_once().await.unwrap(), 1);
    }
    assert_eq!(*order.lock().unwrap(), vec!["urgent", "normal", "low"]);
}
