//! A worker process: the engine, lock maintenance and cleanup loops under a
//! supervisor, sharing one process-wide identity.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use cadence_core::{CadenceConfig, SchedulerConfig};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    cleanup::Cleanup,
    engine::{EngineSettings, ExecutionEngine},
    error::Result,
    maintenance::LockMaintenance,
    registry::HandlerRegistry,
    store::JobStore,
};

/// Delay before a crashed loop is started again.
const RESTART_DELAY: Duration = Duration::from_secs(5);

fn host_name() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    })
}

/// `host-pid-random`: unique per process, stable for its lifetime.
pub fn generate_worker_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host_name(), std::process::id(), &suffix[..8])
}

/// Diagnostic snapshot written on every execution record.
pub fn environment_info(worker_id: &str) -> Value {
    json!({
        "worker_id": worker_id,
        "host": host_name(),
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
    })
}

/// Configured worker, not yet running.
pub struct Worker {
    worker_id: String,
    db_path: PathBuf,
    config: SchedulerConfig,
    registry: Arc<HandlerRegistry>,
}

impl Worker {
    pub fn new(config: &CadenceConfig, registry: HandlerRegistry) -> Self {
        let worker_id = config
            .scheduler
            .worker_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_worker_id);
        Self {
            worker_id,
            db_path: PathBuf::from(&config.database.path),
            config: config.scheduler.clone(),
            registry: Arc::new(registry),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Spawn the three loops. Must be called from within a tokio runtime.
    ///
    /// Each loop opens its own store connection every time it (re)starts, so
    /// a loop that died holding a poisoned connection comes back clean.
    pub fn start(self) -> Result<WorkerHandle> {
        // Fail fast on bad settings or an unusable database before anything
        // is spawned.
        self.config.validate()?;
        let store = Arc::new(JobStore::open(&self.db_path)?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let grace = Duration::from_secs(self.config.shutdown_grace_seconds);

        info!(
            worker_id = %self.worker_id,
            db = %self.db_path.display(),
            job_types = ?self.registry.job_types(),
            "worker starting"
        );

        let settings = EngineSettings::from_config(self.worker_id.clone(), &self.config);
        let engine = {
            let db_path = self.db_path.clone();
            let registry = Arc::clone(&self.registry);
            supervise("engine", shutdown_rx.clone(), grace, RESTART_DELAY, move |rx| {
                let db_path = db_path.clone();
                let registry = Arc::clone(&registry);
                let settings = settings.clone();
                async move {
                    match JobStore::open(&db_path) {
                        Ok(store) => {
                            ExecutionEngine::new(Arc::new(store), registry, settings)
                                .run(rx)
                                .await
                        }
                        Err(e) => error!("engine could not open store: {e}"),
                    }
                }
            })
        };

        let maintenance = {
            let db_path = self.db_path.clone();
            let worker_id = self.worker_id.clone();
            let interval = Duration::from_secs(self.config.lock_refresh_interval_seconds);
            let ttl = Duration::from_secs(self.config.lock_ttl_seconds);
            supervise("lock_maintenance", shutdown_rx.clone(), grace, RESTART_DELAY, move |rx| {
                let db_path = db_path.clone();
                let worker_id = worker_id.clone();
                async move {
                    match JobStore::open(&db_path) {
                        Ok(store) => {
                            LockMaintenance::new(Arc::new(store), worker_id, interval, ttl)
                                .run(rx)
                                .await
                        }
                        Err(e) => error!("lock maintenance could not open store: {e}"),
                    }
                }
            })
        };

        let cleanup = {
            let db_path = self.db_path.clone();
            let interval = Duration::from_secs(self.config.cleanup_interval_seconds);
            let retention = self.config.execution_retention_days;
            supervise("cleanup", shutdown_rx, grace, RESTART_DELAY, move |rx| {
                let db_path = db_path.clone();
                async move {
                    match JobStore::open(&db_path) {
                        Ok(store) => Cleanup::new(Arc::new(store), interval, retention).run(rx).await,
                        Err(e) => error!("cleanup could not open store: {e}"),
                    }
                }
            })
        };

        Ok(WorkerHandle {
            worker_id: self.worker_id,
            shutdown_tx,
            tasks: vec![engine, maintenance, cleanup],
            store,
        })
    }
}

/// Running worker. Dropping it without calling [`WorkerHandle::shutdown`]
/// leaves the loops running until the runtime stops.
pub struct WorkerHandle {
    worker_id: String,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    store: Arc<JobStore>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Stop every loop (each gets the configured grace period), then release
    /// any lock this worker still holds. Returns how many were released.
    pub async fn shutdown(self) -> Result<usize> {
        info!(worker_id = %self.worker_id, "worker shutting down");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("supervisor task failed: {e}");
            }
        }
        let released = self.store.release_all(&self.worker_id)?;
        info!(worker_id = %self.worker_id, released, "worker stopped");
        Ok(released)
    }
}

/// Resolve once `shutdown` is `true` (or its sender is gone).
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run `make(shutdown)` in its own task and start it again after
/// `restart_delay` whenever it panics or returns before shutdown. On
/// shutdown the current run gets `grace` to finish, then is aborted.
fn supervise<F, Fut>(
    name: &'static str,
    mut shutdown: watch::Receiver<bool>,
    grace: Duration,
    restart_delay: Duration,
    make: F,
) -> JoinHandle<()>
where
    F: Fn(watch::Receiver<bool>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let mut task = tokio::spawn(make(shutdown.clone()));
            tokio::select! {
                joined = &mut task => {
                    if *shutdown.borrow() {
                        break;
                    }
                    match joined {
                        Err(e) if e.is_panic() => error!(loop_name = name, "loop panicked; restarting"),
                        _ => warn!(loop_name = name, "loop exited unexpectedly; restarting"),
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(restart_delay) => {}
                        _ = shutdown_requested(&mut shutdown) => break,
                    }
                }
                _ = shutdown_requested(&mut shutdown) => {
                    if tokio::time::timeout(grace, &mut task).await.is_err() {
                        warn!(loop_name = name, "loop did not stop within grace period; aborting");
                        task.abort();
                        let _ = task.await;
                    }
                    break;
                }
            }
        }
    })
}
