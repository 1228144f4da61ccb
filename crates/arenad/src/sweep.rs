//! Periodic reconciliation of runs stuck behind lost callbacks.

use std::sync::Arc;
use std::time::Duration;

use arena_core::{SweepReport, METRICS};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::AppState;

/// Run one sweep and log what it did.
pub async fn sweep_once(state: &AppState) -> Option<SweepReport> {
    match state.arena.reconciler.sweep(state.stale_after).await {
        Ok(report) => {
            if !report.repaired.is_empty() {
                info!(
                    repaired = report.repaired.len(),
                    examined = report.examined,
                    "reconciliation sweep repaired stuck runs"
                );
            }
            for failure in &report.failures {
                warn!(
                    run = %failure.code,
                    error_code = failure.error_code,
                    "could not reconcile run: {}",
                    failure.message
                );
            }
            Some(report)
        }
        Err(e) => {
            error!("reconciliation sweep failed: {}", e);
            None
        }
    }
}

/// Sweep every `every`, forever. The first sweep runs immediately.
pub async fn reconcile_loop(state: Arc<AppState>, every: Duration) {
    info!(interval_secs = every.as_secs(), "starting reconciliation loop");

    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        sweep_once(&state).await;
        METRICS.flush();
    }
}
