use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::notify::Notifier;
use crate::scorer::RiskScorer;
use crate::safety::SafetyMonitor;
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    pub recompute_every: Duration,
    pub cleanup_every: Duration,
}

/// Runs batch recomputation and retention cleanup on their own cadences
/// until `shutdown` resolves.
pub async fn run<S, N, F>(
    scorer: Arc<RiskScorer<S>>,
    monitor: Arc<SafetyMonitor<S, N>>,
    cadence: Cadence,
    shutdown: F,
) where
    S: Store,
    N: Notifier,
    F: std::future::Future<Output = ()>,
{
    let mut recompute = tokio::time::interval(cadence.recompute_every);
    recompute.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cleanup = tokio::time::interval(cadence.cleanup_every);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(
        recompute_secs = cadence.recompute_every.as_secs(),
        cleanup_secs = cadence.cleanup_every.as_secs(),
        "scheduler started"
    );

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("scheduler stopping");
                break;
            }
            _ = recompute.tick() => {
                if let Err(err) = scorer.recompute_all().await {
                    warn!(error = %err, "scheduled risk recompute failed");
                }
            }
            _ = cleanup.tick() => {
                if let Err(err) = monitor.cleanup_expired(Utc::now()).await {
                    warn!(error = %err, "scheduled retention cleanup failed");
                }
            }
        }
    }
}
