use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::ledger::validate_range;
use super::{Engine, EngineError};

/// What to price: a stay for one supplier's inventory of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceRequest {
    pub unit_id: Ulid,
    pub supplier_id: Ulid,
    pub range: NightRange,
    pub quantity: u32,
    pub occupancy: u32,
    pub channel: String,
    pub market: String,
    pub currency: String,
}

/// One night's base price for all requested units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NightPrice {
    pub night: Night,
    pub rate_plan_id: Ulid,
    pub season_id: Ulid,
    pub nightly_rate: Money,
    pub multiplier_bps: Bps,
    pub amount: Money,
}

/// Consecutive nights priced by the same plan and season.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuoteSegment {
    pub rate_plan_id: Ulid,
    pub season_id: Ulid,
    pub range: NightRange,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub currency: String,
    pub nights: Vec<NightPrice>,
    pub segments: Vec<QuoteSegment>,
    pub base_total: Money,
    pub tax_total: Money,
    pub fee_total: Money,
    pub total: Money,
    pub cost_total: Money,
}

fn out_of_range() -> EngineError {
    EngineError::LimitExceeded("amount out of range")
}

fn checked(amount: Option<Money>) -> Result<Money, EngineError> {
    amount.ok_or_else(out_of_range)
}

/// `value * bps / 10_000`, rounded half up. Inputs are non-negative.
fn apply_bps(value: Money, bps: Bps) -> Result<Money, EngineError> {
    let scaled = value as i128 * bps as i128;
    Money::try_from((scaled + BPS_ONE as i128 / 2) / BPS_ONE as i128).map_err(|_| out_of_range())
}

/// The preferred plan for a night in the request's selling scope. At most one
/// exists per unit, channel, market and night; it must also fit the request's
/// currency and supplier.
fn preferred_plan<'p>(
    plans: &[&'p RatePlan],
    req: &PriceRequest,
    night: Night,
) -> Result<Option<&'p RatePlan>, EngineError> {
    let mut valid = plans.iter().filter(|p| p.validity.contains_night(night));
    let Some(plan) = valid.next() else {
        return Ok(None);
    };
    if let Some(other) = valid.next() {
        return Err(EngineError::Conflict(other.id));
    }
    let fits = plan.currency == req.currency && plan.supplier_id.is_none_or(|s| s == req.supplier_id);
    Ok(fits.then_some(*plan))
}

/// Price a stay against a set of rate plans.
///
/// Every night must be covered by the preferred plan of its selling scope,
/// with a season for it; otherwise the whole quote fails with
/// `NoPricingAvailable`. Taxes and fees are applied per plan over the nights
/// that plan priced. Amounts that do not fit a `Money` are `LimitExceeded`.
pub fn price_stay<'a>(
    plans: impl IntoIterator<Item = &'a RatePlan>,
    req: &PriceRequest,
    cost_per_unit: Money,
) -> Result<Quote, EngineError> {
    let plans: Vec<&RatePlan> = plans
        .into_iter()
        .filter(|p| {
            p.preferred
                && p.unit_id == req.unit_id
                && p.channel == req.channel
                && p.market == req.market
        })
        .collect();
    let quantity = req.quantity as Money;
    let no_pricing = |night| EngineError::NoPricingAvailable {
        unit_id: req.unit_id,
        night,
    };

    let mut nights = Vec::with_capacity(req.range.nights() as usize);
    let mut segments: Vec<QuoteSegment> = Vec::new();
    // (plan, nights priced, base subtotal), in order of first use.
    let mut groups: Vec<(&RatePlan, Money, Money)> = Vec::new();

    for night in req.range.iter() {
        let plan = preferred_plan(&plans, req, night)?.ok_or_else(|| no_pricing(night))?;
        let season = plan.season_for(night).ok_or_else(|| no_pricing(night))?;
        let multiplier_bps = plan
            .occupancy_multiplier(req.occupancy)
            .ok_or_else(|| no_pricing(night))?;
        let amount = checked(apply_bps(season.nightly_rate, multiplier_bps)?.checked_mul(quantity))?;

        nights.push(NightPrice {
            night,
            rate_plan_id: plan.id,
            season_id: season.id,
            nightly_rate: season.nightly_rate,
            multiplier_bps,
            amount,
        });

        match segments.last_mut() {
            Some(seg) if seg.rate_plan_id == plan.id && seg.season_id == season.id => {
                seg.range.end = night + 1;
                seg.amount = checked(seg.amount.checked_add(amount))?;
            }
            _ => segments.push(QuoteSegment {
                rate_plan_id: plan.id,
                season_id: season.id,
                range: NightRange::new(night, night + 1),
                amount,
            }),
        }

        match groups.iter_mut().find(|(p, _, _)| p.id == plan.id) {
            Some((_, count, subtotal)) => {
                *count += 1;
                *subtotal = checked(subtotal.checked_add(amount))?;
            }
            None => groups.push((plan, 1, amount)),
        }
    }

    let mut base_total: Money = 0;
    let mut tax_total: Money = 0;
    let mut fee_total: Money = 0;
    for (plan, count, subtotal) in groups {
        let mut fixed: Money = 0;
        for fee in &plan.fees {
            let charge = match fee.kind {
                FeeKind::PerNight(a) => checked(a.checked_mul(count).and_then(|v| v.checked_mul(quantity)))?,
                FeeKind::PerStay(a) => a,
                FeeKind::Percent(_) => 0,
            };
            fixed = checked(fixed.checked_add(charge))?;
        }
        let taxable = if plan.fees_before_taxes {
            checked(subtotal.checked_add(fixed))?
        } else {
            subtotal
        };
        let mut tax: Money = 0;
        for fee in &plan.fees {
            if let FeeKind::Percent(bps) = fee.kind {
                tax = checked(tax.checked_add(apply_bps(taxable, bps)?))?;
            }
        }

        base_total = checked(base_total.checked_add(subtotal))?;
        fee_total = checked(fee_total.checked_add(fixed))?;
        tax_total = checked(tax_total.checked_add(tax))?;
    }

    let total = checked(base_total.checked_add(tax_total).and_then(|v| v.checked_add(fee_total)))?;
    let cost_total = checked(
        cost_per_unit
            .checked_mul(req.range.nights() as Money)
            .and_then(|v| v.checked_mul(quantity)),
    )?;
    Ok(Quote {
        currency: req.currency.clone(),
        nights,
        segments,
        base_total,
        tax_total,
        fee_total,
        total,
        cost_total,
    })
}

impl Engine {
    /// Price a stay from the tenant's rate plans.
    pub fn quote(&self, req: &PriceRequest, cost_per_unit: Money) -> Result<Quote, EngineError> {
        validate_range(&req.range, MAX_RANGE_NIGHTS)?;
        if req.quantity == 0 {
            return Err(EngineError::Invalid("quantity must be positive"));
        }
        let plans: Vec<RatePlan> = self
            .rate_plans
            .iter()
            .filter(|p| p.unit_id == req.unit_id && p.validity.overlaps(&req.range))
            .map(|p| p.value().clone())
            .collect();
        price_stay(&plans, req, cost_per_unit)
    }

    /// Price a stay in one bucket, using its supplier and cost.
    #[allow(clippy::too_many_arguments)]
    pub async fn quote_bucket(
        &self,
        bucket_id: Ulid,
        range: NightRange,
        quantity: u32,
        occupancy: u32,
        channel: String,
        market: String,
        currency: String,
    ) -> Result<Quote, EngineError> {
        let bs = self
            .get_bucket(&bucket_id)
            .ok_or(EngineError::NotFound(bucket_id))?;
        let spec = bs.read().await.spec.clone();
        let req = PriceRequest {
            unit_id: spec.unit_id,
            supplier_id: spec.supplier_id,
            range,
            quantity,
            occupancy,
            channel,
            market,
            currency,
        };
        self.quote(&req, spec.cost_per_unit)
    }
}
