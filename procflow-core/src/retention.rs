//! Retention loop: prunes terminal runs past the retention horizon,
//! expired leases, and stale worker rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::env::RunnerEnv;

/// How often the sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub async fn retention_loop(env: Arc<RunnerEnv>, mut shutdown: watch::Receiver<bool>) {
    loop {
        sweep(&env).await;
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// One pass of cleanup. Each pruner is independent; a failing one does not
/// block the others.
pub async fn sweep(env: &Arc<RunnerEnv>) {
    let store = &env.store;

    let cutoff = Utc::now()
        - chrono::Duration::from_std(env.settings.retention)
            .unwrap_or_else(|_| chrono::Duration::days(30));
    match store.prune_runs_before(cutoff).await {
        Ok(0) => {}
        Ok(pruned) => info!(pruned, "retention: pruned terminal runs"),
        Err(e) => warn!(error = %e, "retention: run pruning failed"),
    }

    match store.prune_expired_leases().await {
        Ok(0) => {}
        Ok(pruned) => info!(pruned, "retention: dropped orphaned leases"),
        Err(e) => warn!(error = %e, "retention: lease pruning failed"),
    }

    match store
        .prune_stale_workers(env.settings.worker_stale_after)
        .await
    {
        Ok(0) => {}
        Ok(pruned) => info!(pruned, "retention: pruned stale workers"),
        Err(e) => warn!(error = %e, "retention: worker pruning failed"),
    }
}
