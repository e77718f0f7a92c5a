//! Handler registry: maps a job-type string to the code that runs it.
//!
//! Nothing here is persisted. A worker builds its registry at startup; a job
//! whose type has no handler fails its attempt with `HANDLER_NOT_FOUND`
//! rather than taking the worker down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Code executed for one job type.
///
/// Receives the job's `parameters` verbatim. `Ok` carries an optional JSON
/// result stored on the job and its execution record; `Err` counts as a
/// failed attempt. Handlers must be idempotent: a job may run again after a
/// worker crash.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, parameters: Value) -> anyhow::Result<Value>;
}

struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for AsyncFnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, parameters: Value) -> anyhow::Result<Value> {
        (self.0)(parameters).await
    }
}

/// Runs a synchronous closure on tokio's blocking pool.
struct BlockingHandler<F>(Arc<F>);

#[async_trait]
impl<F> JobHandler for BlockingHandler<F>
where
    F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    async fn run(&self, parameters: Value) -> anyhow::Result<Value> {
        let f = Arc::clone(&self.0);
        match tokio::task::spawn_blocking(move || f(parameters)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(anyhow::anyhow!("blocking handler cancelled: {e}")),
        }
    }
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`. A later registration for the same
    /// type replaces the earlier one.
    pub fn register_handler(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        if self.handlers.insert(job_type.clone(), handler).is_some() {
            debug!(%job_type, "handler replaced");
        }
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_handler(job_type, Arc::new(AsyncFnHandler(f)));
    }

    /// Register a blocking closure; it is run via `spawn_blocking` so it
    /// never stalls the runtime.
    pub fn register_blocking<F>(&mut self, job_type: impl Into<String>, f: F)
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register_handler(job_type, Arc::new(BlockingHandler(Arc::new(f))));
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
