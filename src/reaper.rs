use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Expire every hold that is overdue now. Returns how many were expired.
pub async fn sweep_once(engine: &Engine) -> usize {
    let now = engine.now_ms();
    let mut expired = 0;
    for (hold_id, bucket_id) in engine.collect_expired_holds(now) {
        match engine.expire_hold(hold_id, now).await {
            Ok(true) => expired += 1,
            // Released or confirmed in the meantime.
            Ok(false) => debug!(%hold_id, %bucket_id, "sweep skipped settled hold"),
            Err(e) => warn!(%hold_id, %bucket_id, "sweep failed to expire hold: {e}"),
        }
    }
    expired
}

/// Background task that expires overdue holds on a fixed interval.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let expired = sweep_once(&engine).await;
        if expired > 0 {
            info!(expired, "expired overdue holds");
        }
    }
}

/// Compact the WAL if at least `threshold` events were appended since the last compaction.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            warn!(appends, "WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that keeps the WAL bounded.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}
