use std::collections::{BTreeMap, HashSet};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{NO_AVAILABILITY_TOTAL, RESOLVE_ATTEMPTS};

use super::ledger::validate_range;
use super::pricing::{PriceRequest, Quote};
use super::{Engine, EngineError};

/// A booking request for one unit, to be satisfied from a single bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    pub hold_id: Ulid,
    pub unit_id: Ulid,
    pub range: NightRange,
    pub quantity: u32,
    pub occupancy: u32,
    pub channel: String,
    pub market: String,
    pub currency: String,
    /// Falls back to the engine's default hold TTL.
    pub ttl_ms: Option<Ms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateSource {
    Direct,
    Pool(Ulid),
}

impl CandidateSource {
    pub fn pool_id(&self) -> Option<Ulid> {
        match self {
            CandidateSource::Direct => None,
            CandidateSource::Pool(id) => Some(*id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub bucket_id: Ulid,
    pub supplier_id: Ulid,
    pub source: CandidateSource,
    pub allocation_type: AllocationType,
    pub priority: i32,
    pub cost_per_unit: Money,
    pub sell_price: Option<Money>,
}

impl Candidate {
    fn rank_key(&self) -> (i32, Money, Ulid, u8, Ulid) {
        let (source_rank, pool_id) = match self.source {
            CandidateSource::Direct => (0, Ulid::nil()),
            CandidateSource::Pool(id) => (1, id),
        };
        (self.priority, self.cost_per_unit, self.bucket_id, source_rank, pool_id)
    }
}

/// A placed hold with its price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub hold_id: Ulid,
    pub bucket_id: Ulid,
    pub source: CandidateSource,
    pub requires_confirmation: bool,
    pub expires_at: Ms,
    pub sell_price: Option<Money>,
    pub quote: Quote,
}

/// Order candidates best first: lower priority value, then lower cost, then
/// bucket id. A bucket listed more than once keeps only its best entry.
pub fn rank_candidates(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by_key(Candidate::rank_key);
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.bucket_id));
    candidates
}

/// Whether a bucket could take `quantity` more units on every night of
/// `range`, ignoring holds that are overdue at `now`.
fn is_eligible(bs: &BucketState, range: &NightRange, quantity: u32, now: Ms) -> bool {
    if bs.released || !bs.covers(range) {
        return false;
    }
    if bs.spec.allocation_type != AllocationType::Committed {
        return true;
    }

    let mut overdue: BTreeMap<Night, u32> = BTreeMap::new();
    for hold in bs.active_holds().filter(|h| h.expires_at <= now) {
        for night in hold.range.iter() {
            *overdue.entry(night).or_default() += hold.quantity;
        }
    }

    bs.nights_in(range).all(|(night, counts)| {
        let used = counts
            .used()
            .saturating_sub(overdue.get(night).copied().unwrap_or(0));
        bs.cap(counts)
            .is_none_or(|cap| used.saturating_add(quantity) <= cap)
    })
}

impl Engine {
    /// Eligible buckets for a request, ranked. Direct buckets of the unit and
    /// variants of its auto-allocate pools are both considered.
    pub async fn candidates(&self, req: &ResolveRequest) -> Result<Vec<Candidate>, EngineError> {
        if !self.units.contains_key(&req.unit_id) {
            return Err(EngineError::NotFound(req.unit_id));
        }

        // (bucket, source, priority, cost, sell price) before checking capacity.
        let mut entries: Vec<(Ulid, CandidateSource, Option<(i32, Money, Option<Money>)>)> = self
            .buckets_of_unit(&req.unit_id)
            .into_iter()
            .map(|bucket_id| (bucket_id, CandidateSource::Direct, None))
            .collect();
        for pool in self.pools.iter() {
            if pool.unit_id != req.unit_id || !pool.auto_allocate {
                continue;
            }
            let within_share = |v: &&PoolVariant| v.max_quantity.is_none_or(|max| req.quantity <= max);
            entries.extend(pool.variants.iter().filter(within_share).map(|v| {
                (
                    v.bucket_id,
                    CandidateSource::Pool(pool.id),
                    Some((v.priority, v.cost_per_unit, v.sell_price)),
                )
            }));
        }

        let now = self.now_ms();
        let mut candidates = Vec::with_capacity(entries.len());
        for (bucket_id, source, overrides) in entries {
            let Some(bs) = self.get_bucket(&bucket_id) else {
                continue;
            };
            let guard = bs.read().await;
            if !is_eligible(&guard, &req.range, req.quantity, now) {
                continue;
            }
            let (priority, cost_per_unit, sell_price) =
                overrides.unwrap_or((guard.spec.priority, guard.spec.cost_per_unit, None));
            candidates.push(Candidate {
                bucket_id,
                supplier_id: guard.spec.supplier_id,
                source,
                allocation_type: guard.spec.allocation_type,
                priority,
                cost_per_unit,
                sell_price,
            });
        }
        Ok(rank_candidates(candidates))
    }

    pub async fn resolve(&self, req: &ResolveRequest) -> Result<Allocation, EngineError> {
        self.resolve_with_cancel(req, &CancellationToken::new()).await
    }

    /// Resolve a request to a priced hold on the best bucket that accepts it.
    ///
    /// Candidates are tried in rank order, each priced before its hold is
    /// attempted. Losing a capacity race moves on to the next candidate; a
    /// pricing failure or any other error ends the request.
    pub async fn resolve_with_cancel(
        &self,
        req: &ResolveRequest,
        cancel: &CancellationToken,
    ) -> Result<Allocation, EngineError> {
        validate_range(&req.range, MAX_RANGE_NIGHTS)?;
        if req.quantity == 0 {
            return Err(EngineError::Invalid("quantity must be positive"));
        }
        if req.quantity > MAX_QUANTITY_PER_REQUEST {
            return Err(EngineError::LimitExceeded("quantity too large"));
        }
        let ttl_ms = req.ttl_ms.unwrap_or(self.default_hold_ttl_ms);

        let candidates = self.candidates(req).await?;
        let mut attempts = 0u64;

        for candidate in &candidates {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            attempts += 1;

            let price_req = PriceRequest {
                unit_id: req.unit_id,
                supplier_id: candidate.supplier_id,
                range: req.range,
                quantity: req.quantity,
                occupancy: req.occupancy,
                channel: req.channel.clone(),
                market: req.market.clone(),
                currency: req.currency.clone(),
            };
            let quote = self.quote(&price_req, candidate.cost_per_unit)?;

            let hold = match self
                .acquire_hold(req.hold_id, candidate.bucket_id, req.range, req.quantity, ttl_ms)
                .await
            {
                Ok(hold) => hold,
                Err(EngineError::CapacityExceeded { night, .. }) => {
                    debug!(bucket_id = %candidate.bucket_id, night, "candidate full, trying next");
                    continue;
                }
                Err(EngineError::BucketReleased(bucket_id)) => {
                    debug!(bucket_id = %bucket_id, "candidate released, trying next");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if cancel.is_cancelled() {
                self.release_hold(hold.id).await?;
                return Err(EngineError::Cancelled);
            }

            metrics::histogram!(RESOLVE_ATTEMPTS).record(attempts as f64);
            info!(
                hold_id = %hold.id,
                bucket_id = %hold.bucket_id,
                pool_id = ?candidate.source.pool_id(),
                attempts,
                requires_confirmation = hold.requires_confirmation,
                "request resolved"
            );
            return Ok(Allocation {
                hold_id: hold.id,
                bucket_id: hold.bucket_id,
                source: candidate.source,
                requires_confirmation: hold.requires_confirmation,
                expires_at: hold.expires_at,
                sell_price: candidate.sell_price,
                quote,
            });
        }

        metrics::histogram!(RESOLVE_ATTEMPTS).record(attempts as f64);
        metrics::counter!(NO_AVAILABILITY_TOTAL).increment(1);
        Err(EngineError::NoAvailability(req.unit_id))
    }
}
