use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::{
    error::Result,
    store::{expiry_after, JobStore},
};

/// Keeps this worker's locks alive while its handlers run.
///
/// Every `interval` the expiry of each RUNNING job owned by `worker_id` is
/// pushed to `now + lock_ttl`. A worker that stops refreshing (crash, hang)
/// loses its jobs to the cleanup loop once the TTL lapses.
pub struct LockMaintenance {
    store: Arc<JobStore>,
    worker_id: String,
    interval: Duration,
    lock_ttl: Duration,
}

impl LockMaintenance {
    pub fn new(
        store: Arc<JobStore>,
        worker_id: impl Into<String>,
        interval: Duration,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            interval,
            lock_ttl,
        }
    }

    pub fn refresh_at(&self, now: DateTime<Utc>) -> Result<usize> {
        self.store
            .refresh_lock(&self.worker_id, expiry_after(now, self.lock_ttl))
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "lock maintenance started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.refresh_at(Utc::now()) {
                        Ok(0) => {}
                        Ok(n) => debug!(count = n, "locks refreshed"),
                        Err(e) => error!("lock refresh failed: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(worker_id = %self.worker_id, "lock maintenance stopped");
    }
}
