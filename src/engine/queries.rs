use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn list_units(&self) -> Vec<InventoryUnit> {
        let mut units: Vec<InventoryUnit> = self.units.iter().map(|e| e.value().clone()).collect();
        units.sort_by_key(|u| u.id);
        units
    }

    pub async fn list_buckets(&self, unit_id: Ulid) -> Vec<BucketInfo> {
        let mut ids = self.buckets_of_unit(&unit_id);
        ids.sort();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(bs) = self.get_bucket(&id) {
                out.push(bs.read().await.info());
            }
        }
        out
    }

    pub async fn get_hold(&self, id: Ulid) -> Result<Hold, EngineError> {
        let bucket_id = self.get_bucket_for_hold(&id).ok_or(EngineError::NotFound(id))?;
        let bs = self
            .get_bucket(&bucket_id)
            .ok_or(EngineError::NotFound(bucket_id))?;
        let guard = bs.read().await;
        guard.holds.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Every hold and booking on the unit's buckets, oldest first.
    pub async fn list_holds(&self, unit_id: Ulid) -> Vec<Hold> {
        let mut holds = Vec::new();
        for id in self.buckets_of_unit(&unit_id) {
            if let Some(bs) = self.get_bucket(&id) {
                holds.extend(bs.read().await.holds.values().cloned());
            }
        }
        holds.sort_by_key(|h| (h.created_at, h.id));
        holds
    }

    pub fn list_pools(&self, unit_id: Ulid) -> Vec<InventoryPool> {
        let mut pools: Vec<InventoryPool> = self
            .pools
            .iter()
            .filter(|p| p.unit_id == unit_id)
            .map(|p| p.value().clone())
            .collect();
        pools.sort_by_key(|p| p.id);
        pools
    }

    pub fn list_rate_plans(&self, unit_id: Ulid) -> Vec<RatePlan> {
        let mut plans: Vec<RatePlan> = self
            .rate_plans
            .iter()
            .filter(|p| p.unit_id == unit_id)
            .map(|p| p.value().clone())
            .collect();
        plans.sort_by_key(|p| p.id);
        plans
    }
}
