use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::ledger::validate_range;
use super::{Engine, EngineError};

fn validate_code(code: &str) -> Result<(), EngineError> {
    if code.is_empty() {
        return Err(EngineError::Invalid("empty code"));
    }
    if code.len() > MAX_CODE_LEN {
        return Err(EngineError::LimitExceeded("code too long"));
    }
    Ok(())
}

fn validate_name(name: Option<&str>) -> Result<(), EngineError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded("name too long")),
        _ => Ok(()),
    }
}

impl Engine {
    /// Apply a catalog event to the in-memory indices. Used by the mutators
    /// after a successful WAL append, and by replay.
    pub(super) fn apply_catalog(&self, event: &Event) {
        match event {
            Event::UnitCreated { id, name } => {
                self.units.insert(
                    *id,
                    InventoryUnit {
                        id: *id,
                        name: name.clone(),
                    },
                );
            }
            Event::PoolCreated { pool } => {
                self.pools.insert(pool.id, pool.clone());
            }
            Event::PoolVariantAdded { pool_id, variant } => {
                if let Some(mut pool) = self.pools.get_mut(pool_id) {
                    pool.variants.retain(|v| v.bucket_id != variant.bucket_id);
                    pool.variants.push(variant.clone());
                }
            }
            Event::RatePlanCreated { plan } => {
                self.rate_plans.insert(plan.id, plan.clone());
            }
            Event::RateSeasonAdded {
                rate_plan_id,
                season,
            } => {
                if let Some(mut plan) = self.rate_plans.get_mut(rate_plan_id) {
                    plan.seasons.push(season.clone());
                    plan.seasons.sort_by_key(|s| s.range.start);
                }
            }
            Event::RateOccupancySet {
                rate_plan_id,
                occupancy,
            } => {
                if let Some(mut plan) = self.rate_plans.get_mut(rate_plan_id) {
                    plan.occupancies.retain(|o| o.occupancy != occupancy.occupancy);
                    plan.occupancies.push(*occupancy);
                }
            }
            Event::RateFeeAdded { rate_plan_id, fee } => {
                if let Some(mut plan) = self.rate_plans.get_mut(rate_plan_id) {
                    plan.fees.push(fee.clone());
                }
            }
            // Bucket events never reach the catalog.
            _ => {}
        }
    }

    async fn persist_catalog(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.apply_catalog(&event);
        Ok(())
    }

    pub async fn create_unit(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        validate_name(name.as_deref())?;
        let _catalog = self.catalog_lock.lock().await;
        if self.units.len() >= MAX_UNITS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many units"));
        }
        if self.units.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.persist_catalog(Event::UnitCreated { id, name }).await
    }

    /// Create a pool. Every variant must point at an existing bucket of the pool's unit.
    pub async fn create_pool(&self, pool: InventoryPool) -> Result<(), EngineError> {
        validate_name(pool.name.as_deref())?;
        if pool.variants.len() > MAX_VARIANTS_PER_POOL {
            return Err(EngineError::LimitExceeded("too many pool variants"));
        }
        let _catalog = self.catalog_lock.lock().await;
        if self.pools.len() >= MAX_POOLS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many pools"));
        }
        if self.pools.contains_key(&pool.id) {
            return Err(EngineError::AlreadyExists(pool.id));
        }
        if !self.units.contains_key(&pool.unit_id) {
            return Err(EngineError::NotFound(pool.unit_id));
        }
        for variant in &pool.variants {
            self.check_variant(pool.unit_id, variant).await?;
        }

        info!(pool_id = %pool.id, unit_id = %pool.unit_id, variants = pool.variants.len(), "pool created");
        self.persist_catalog(Event::PoolCreated { pool }).await
    }

    /// Add a bucket to a pool, replacing its existing entry if any.
    pub async fn add_pool_variant(
        &self,
        pool_id: Ulid,
        variant: PoolVariant,
    ) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let (unit_id, count) = self
            .pools
            .get(&pool_id)
            .map(|p| (p.unit_id, p.variants.len()))
            .ok_or(EngineError::NotFound(pool_id))?;
        if count >= MAX_VARIANTS_PER_POOL {
            return Err(EngineError::LimitExceeded("too many pool variants"));
        }
        self.check_variant(unit_id, &variant).await?;
        self.persist_catalog(Event::PoolVariantAdded { pool_id, variant })
            .await
    }

    async fn check_variant(&self, unit_id: Ulid, variant: &PoolVariant) -> Result<(), EngineError> {
        if variant.cost_per_unit < 0 || variant.sell_price.is_some_and(|p| p < 0) {
            return Err(EngineError::Invalid("variant prices must not be negative"));
        }
        if variant.max_quantity == Some(0) {
            return Err(EngineError::Invalid("variant max quantity must be positive"));
        }
        let bs = self
            .get_bucket(&variant.bucket_id)
            .ok_or(EngineError::NotFound(variant.bucket_id))?;
        if bs.read().await.spec.unit_id != unit_id {
            return Err(EngineError::Invalid("pool variant bucket belongs to another unit"));
        }
        Ok(())
    }

    /// Create a rate plan. Seasons, occupancies and fees are added separately.
    ///
    /// At most one preferred plan may be valid for a unit, channel and market
    /// on any night, whatever its currency or supplier scope.
    pub async fn create_rate_plan(&self, plan: RatePlan) -> Result<(), EngineError> {
        validate_range(&plan.validity, MAX_VALID_NIGHT as u32)?;
        validate_code(&plan.currency)?;
        validate_code(&plan.market)?;
        validate_code(&plan.channel)?;
        if !plan.seasons.is_empty() || !plan.occupancies.is_empty() || !plan.fees.is_empty() {
            return Err(EngineError::Invalid("rate plan must be created empty"));
        }

        let _catalog = self.catalog_lock.lock().await;
        if self.rate_plans.len() >= MAX_RATE_PLANS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rate plans"));
        }
        if self.rate_plans.contains_key(&plan.id) {
            return Err(EngineError::AlreadyExists(plan.id));
        }
        if !self.units.contains_key(&plan.unit_id) {
            return Err(EngineError::NotFound(plan.unit_id));
        }
        if plan.preferred {
            let clash = self.rate_plans.iter().find(|other| {
                other.preferred
                    && other.same_scope(&plan)
                    && other.validity.overlaps(&plan.validity)
            });
            if let Some(other) = clash {
                return Err(EngineError::Conflict(other.id));
            }
        }

        self.persist_catalog(Event::RatePlanCreated { plan }).await
    }

    /// Add a season. It must lie within the plan's validity and overlap no other season.
    pub async fn add_rate_season(
        &self,
        rate_plan_id: Ulid,
        season: RateSeason,
    ) -> Result<(), EngineError> {
        validate_range(&season.range, MAX_VALID_NIGHT as u32)?;
        if season.nightly_rate < 0 {
            return Err(EngineError::Invalid("nightly_rate must not be negative"));
        }

        let _catalog = self.catalog_lock.lock().await;
        {
            let plan = self
                .rate_plans
                .get(&rate_plan_id)
                .ok_or(EngineError::NotFound(rate_plan_id))?;
            if plan.seasons.len() >= MAX_SEASONS_PER_PLAN {
                return Err(EngineError::LimitExceeded("too many seasons"));
            }
            if !plan.validity.contains_range(&season.range) {
                return Err(EngineError::Invalid("season outside rate plan validity"));
            }
            if let Some(other) = plan.seasons.iter().find(|s| s.range.overlaps(&season.range)) {
                return Err(EngineError::Conflict(other.id));
            }
            if plan.seasons.iter().any(|s| s.id == season.id) {
                return Err(EngineError::AlreadyExists(season.id));
            }
        }

        self.persist_catalog(Event::RateSeasonAdded {
            rate_plan_id,
            season,
        })
        .await
    }

    /// Set the multiplier for one occupancy, replacing any previous row.
    pub async fn set_rate_occupancy(
        &self,
        rate_plan_id: Ulid,
        occupancy: RateOccupancy,
    ) -> Result<(), EngineError> {
        if occupancy.occupancy == 0 {
            return Err(EngineError::Invalid("occupancy must be positive"));
        }
        let _catalog = self.catalog_lock.lock().await;
        if !self.rate_plans.contains_key(&rate_plan_id) {
            return Err(EngineError::NotFound(rate_plan_id));
        }
        self.persist_catalog(Event::RateOccupancySet {
            rate_plan_id,
            occupancy,
        })
        .await
    }

    pub async fn add_rate_fee(&self, rate_plan_id: Ulid, fee: RateTaxFee) -> Result<(), EngineError> {
        validate_name(Some(&fee.name))?;
        match fee.kind {
            FeeKind::Percent(bps) if bps > BPS_ONE * 10 => {
                return Err(EngineError::Invalid("percentage fee above 1000%"));
            }
            FeeKind::PerNight(amount) | FeeKind::PerStay(amount) if amount < 0 => {
                return Err(EngineError::Invalid("fee amount must not be negative"));
            }
            _ => {}
        }

        let _catalog = self.catalog_lock.lock().await;
        {
            let plan = self
                .rate_plans
                .get(&rate_plan_id)
                .ok_or(EngineError::NotFound(rate_plan_id))?;
            if plan.fees.len() >= MAX_FEES_PER_PLAN {
                return Err(EngineError::LimitExceeded("too many fees"));
            }
            if plan.fees.iter().any(|f| f.id == fee.id) {
                return Err(EngineError::AlreadyExists(fee.id));
            }
        }
        self.persist_catalog(Event::RateFeeAdded { rate_plan_id, fee })
            .await
    }
}
