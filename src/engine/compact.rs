use tokio::sync::{oneshot, OwnedRwLockWriteGuard};
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

/// Snapshot record for one bucket. Terminal holds keep only their id and status.
fn restore_event(bs: &BucketState) -> Event {
    let mut holds: Vec<Hold> = Vec::new();
    let mut retired: Vec<(Ulid, HoldStatus)> = bs.retired.iter().map(|(id, s)| (*id, *s)).collect();
    for hold in bs.holds.values() {
        if hold.status.is_terminal() {
            retired.push((hold.id, hold.status));
        } else {
            holds.push(hold.clone());
        }
    }
    holds.sort_by_key(|h| h.id);
    retired.sort_by_key(|(id, _)| *id);
    Event::BucketRestored {
        bucket: bs.spec.clone(),
        released: bs.released,
        nights: bs.nights.iter().map(|(n, c)| (*n, *c)).collect(),
        holds,
        retired,
    }
}

impl Engine {
    /// Rewrite the WAL with the minimal events that recreate the current state.
    ///
    /// Catalog writes and every bucket are locked for the duration, so the
    /// snapshot and the log swap see no concurrent mutation. Terminal holds
    /// are reduced to their final status once the compacted log is in place.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;

        let mut bucket_ids: Vec<Ulid> = self.buckets.iter().map(|e| *e.key()).collect();
        bucket_ids.sort();
        let mut guards: Vec<OwnedRwLockWriteGuard<BucketState>> = Vec::with_capacity(bucket_ids.len());
        for id in &bucket_ids {
            if let Some(bs) = self.get_bucket(id) {
                guards.push(bs.write_owned().await);
            }
        }

        let mut events: Vec<Event> = Vec::new();
        let mut units: Vec<InventoryUnit> = self.units.iter().map(|e| e.value().clone()).collect();
        units.sort_by_key(|u| u.id);
        events.extend(units.into_iter().map(|u| Event::UnitCreated {
            id: u.id,
            name: u.name,
        }));
        events.extend(guards.iter().map(|g| restore_event(g)));
        let mut pools: Vec<InventoryPool> = self.pools.iter().map(|e| e.value().clone()).collect();
        pools.sort_by_key(|p| p.id);
        events.extend(pools.into_iter().map(|pool| Event::PoolCreated { pool }));
        let mut plans: Vec<RatePlan> = self.rate_plans.iter().map(|e| e.value().clone()).collect();
        plans.sort_by_key(|p| p.id);
        events.extend(plans.into_iter().map(|plan| Event::RatePlanCreated { plan }));

        let event_count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageUnavailable(e.to_string()))?;

        // Terminal holds shrink to a status entry. Their ids stay claimed.
        let mut pruned = 0usize;
        for guard in guards.iter_mut() {
            let terminal: Vec<(Ulid, HoldStatus)> = guard
                .holds
                .values()
                .filter(|h| h.status.is_terminal())
                .map(|h| (h.id, h.status))
                .collect();
            pruned += terminal.len();
            for (id, status) in terminal {
                guard.holds.remove(&id);
                guard.retired.insert(id, status);
            }
        }

        info!(events = event_count, pruned_holds = pruned, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
