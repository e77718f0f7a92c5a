//! Built-in handlers registered by `cadence-worker run`.

use std::time::Duration;

use anyhow::Context;
use cadence_scheduler::HandlerRegistry;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Deserialize)]
struct SleepParams {
    seconds: f64,
}

pub fn register_builtin(registry: &mut HandlerRegistry) {
    registry.register_fn("echo", echo);
    registry.register_fn("sleep", sleep);
}

/// Returns its parameters unchanged.
async fn echo(parameters: Value) -> anyhow::Result<Value> {
    info!(%parameters, "echo");
    Ok(parameters)
}

/// `{"seconds": 1.5}`: waits, then reports how long it slept.
async fn sleep(parameters: Value) -> anyhow::Result<Value> {
    let params: SleepParams =
        serde_json::from_value(parameters).context("sleep expects {\"seconds\": <number>}")?;
    let duration = match Duration::try_from_secs_f64(params.seconds) {
        Ok(d) => d,
        Err(e) => anyhow::bail!("invalid seconds {}: {e}", params.seconds),
    };
    tokio::time::sleep(duration).await;
    Ok(json!({ "slept_seconds": params.seconds }))
}
