use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::{error::Result, store::JobStore};

/// What one cleanup pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    /// Expired locks cleared (crashed or hung owners).
    pub reclaimed: usize,
    /// Execution rows past retention removed.
    pub purged: usize,
}

/// Reclaims expired locks and purges old execution history.
pub struct Cleanup {
    store: Arc<JobStore>,
    interval: Duration,
    retention: chrono::Duration,
}

impl Cleanup {
    pub fn new(store: Arc<JobStore>, interval: Duration, retention_days: u32) -> Self {
        Self {
            store,
            interval,
            retention: chrono::Duration::days(i64::from(retention_days)),
        }
    }

    /// One pass. Both steps are idempotent, so running it from several
    /// workers at once is harmless.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let reclaimed = self.store.reclaim_expired(now)?;
        // a retention reaching past the earliest date keeps everything
        let purged = match now.checked_sub_signed(self.retention) {
            Some(cutoff) => self.store.purge_executions_older_than(cutoff)?,
            None => 0,
        };
        Ok(CleanupReport { reclaimed, purged })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("cleanup loop started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_at(Utc::now()) {
                        Ok(report) if report == CleanupReport::default() => {}
                        Ok(report) => info!(
                            reclaimed = report.reclaimed,
                            purged = report.purged,
                            "cleanup pass"
                        ),
                        Err(e) => error!("cleanup pass failed: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("cleanup loop stopped");
    }
}
