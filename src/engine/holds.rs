use dashmap::mapref::entry::Entry;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    CAPACITY_EXCEEDED_TOTAL, HOLDS_ACQUIRED_TOTAL, HOLDS_CONFIRMED_TOTAL, HOLDS_EXPIRED_TOTAL,
    HOLDS_RELEASED_TOTAL, PARTIAL_HOLD_FAILURES_TOTAL,
};

use super::ledger::validate_range;
use super::{Engine, EngineError};

/// Check that every night of `range` can take `quantity` more held units.
///
/// Nothing is written here. The hold lands as one `HoldPlaced` event that
/// raises every night at once, so a failing night leaves all rows untouched.
/// A failure after earlier nights fitted is a `PartialCapacityFailure`.
fn check_hold(bs: &BucketState, range: &NightRange, quantity: u32) -> Result<(), EngineError> {
    let bucket_id = bs.spec.id;
    let mut nights_fitted = 0usize;
    for night in range.iter() {
        let fits = bs.nights.get(&night).is_some_and(|counts| {
            counts.held.checked_add(quantity).is_some()
                && bs
                    .cap(counts)
                    .is_none_or(|cap| counts.used().saturating_add(quantity) <= cap)
        });
        if !fits {
            if nights_fitted == 0 {
                return Err(EngineError::CapacityExceeded {
                    bucket_id,
                    night,
                    requested: quantity,
                    available: available_on(bs, night),
                });
            }
            return Err(EngineError::PartialCapacityFailure {
                bucket_id,
                night,
                nights_fitted,
            });
        }
        nights_fitted += 1;
    }
    Ok(())
}

fn available_on(bs: &BucketState, night: Night) -> u32 {
    bs.nights
        .get(&night)
        .map(|counts| bs.available(counts).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

impl Engine {
    /// Expire every overdue active hold on a bucket the caller has locked.
    pub(super) async fn expire_overdue_locked(
        &self,
        bs: &mut BucketState,
        now: Ms,
    ) -> Result<usize, EngineError> {
        let overdue: Vec<Ulid> = bs
            .active_holds()
            .filter(|h| h.expires_at <= now)
            .map(|h| h.id)
            .collect();
        for id in &overdue {
            let event = Event::HoldReleased {
                id: *id,
                bucket_id: bs.spec.id,
                expired: true,
            };
            self.persist_and_apply(bs, &event).await?;
            metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(1);
            info!(hold_id = %id, bucket_id = %bs.spec.id, "hold expired");
        }
        Ok(overdue.len())
    }

    /// Place a hold of `quantity` units on every night of `range` in one bucket.
    ///
    /// The hold only becomes `Active` once every night can take the increment.
    /// A failed attempt writes nothing, frees the id and is reported as
    /// `CapacityExceeded`, also when only some nights were short.
    pub async fn acquire_hold(
        &self,
        id: Ulid,
        bucket_id: Ulid,
        range: NightRange,
        quantity: u32,
        ttl_ms: Ms,
    ) -> Result<Hold, EngineError> {
        validate_range(&range, MAX_RANGE_NIGHTS)?;
        if quantity == 0 {
            return Err(EngineError::Invalid("quantity must be positive"));
        }
        if quantity > MAX_QUANTITY_PER_REQUEST {
            return Err(EngineError::LimitExceeded("quantity too large"));
        }
        if ttl_ms <= 0 || ttl_ms > MAX_HOLD_TTL_MS {
            return Err(EngineError::LimitExceeded("hold ttl out of range"));
        }
        let bs = self
            .get_bucket(&bucket_id)
            .ok_or(EngineError::NotFound(bucket_id))?;

        // Claim the id before doing any work so two requests can't share it.
        match self.hold_to_bucket.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(bucket_id);
            }
        }

        let result = self.place_hold_claimed(&bs, id, range, quantity, ttl_ms).await;
        if result.is_err() {
            self.hold_to_bucket.remove(&id);
        }
        result
    }

    async fn place_hold_claimed(
        &self,
        bs: &super::SharedBucketState,
        id: Ulid,
        range: NightRange,
        quantity: u32,
        ttl_ms: Ms,
    ) -> Result<Hold, EngineError> {
        let mut guard = bs.write().await;
        let bucket_id = guard.spec.id;
        if guard.released {
            return Err(EngineError::BucketReleased(bucket_id));
        }

        let now = self.now_ms();
        self.expire_overdue_locked(&mut guard, now).await?;
        if guard.live_hold_count() >= MAX_HOLDS_PER_BUCKET {
            return Err(EngineError::LimitExceeded("too many holds on bucket"));
        }

        match check_hold(&guard, &range, quantity) {
            Ok(()) => {}
            Err(EngineError::PartialCapacityFailure {
                night, nights_fitted, ..
            }) => {
                debug!(
                    hold_id = %id,
                    bucket_id = %bucket_id,
                    night,
                    nights_fitted,
                    "multi-night hold rejected part way"
                );
                metrics::counter!(PARTIAL_HOLD_FAILURES_TOTAL).increment(1);
                metrics::counter!(CAPACITY_EXCEEDED_TOTAL).increment(1);
                return Err(EngineError::CapacityExceeded {
                    bucket_id,
                    night,
                    requested: quantity,
                    available: available_on(&guard, night),
                });
            }
            Err(e) => {
                metrics::counter!(CAPACITY_EXCEEDED_TOTAL).increment(1);
                return Err(e);
            }
        }

        let hold = Hold {
            id,
            bucket_id,
            unit_id: guard.spec.unit_id,
            range,
            quantity,
            created_at: now,
            expires_at: now + ttl_ms,
            requires_confirmation: guard.spec.allocation_type == AllocationType::OnRequest,
            status: HoldStatus::Active,
        };
        let event = Event::HoldPlaced { hold: hold.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(HOLDS_ACQUIRED_TOTAL).increment(1);
        Ok(hold)
    }

    /// Turn an active hold into a booking: `held` moves to `booked` on every
    /// night in one step. An overdue hold is expired instead.
    pub async fn confirm_hold(&self, id: Ulid) -> Result<Hold, EngineError> {
        let (bucket_id, mut guard) = self.resolve_hold_write(&id).await?;
        let status = guard.hold_status(&id).ok_or(EngineError::NotFound(id))?;
        if status != HoldStatus::Active {
            return Err(EngineError::InvalidTransition { hold_id: id, status });
        }
        let hold = guard.holds.get(&id).cloned().ok_or(EngineError::NotFound(id))?;

        if hold.is_overdue(self.now_ms()) {
            let event = Event::HoldReleased {
                id,
                bucket_id,
                expired: true,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(1);
            return Err(EngineError::HoldExpired(id));
        }

        let event = Event::HoldConfirmed { id, bucket_id };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(HOLDS_CONFIRMED_TOTAL).increment(1);
        info!(hold_id = %id, bucket_id = %bucket_id, quantity = hold.quantity, "hold confirmed");
        guard.holds.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Release an active hold. Returns `false` if it was already released or expired.
    pub async fn release_hold(&self, id: Ulid) -> Result<bool, EngineError> {
        let (bucket_id, mut guard) = self.resolve_hold_write(&id).await?;
        let status = guard.hold_status(&id).ok_or(EngineError::NotFound(id))?;
        match status {
            HoldStatus::Active => {
                let event = Event::HoldReleased {
                    id,
                    bucket_id,
                    expired: false,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                metrics::counter!(HOLDS_RELEASED_TOTAL).increment(1);
                Ok(true)
            }
            HoldStatus::Released | HoldStatus::Expired => Ok(false),
            HoldStatus::Confirmed | HoldStatus::Cancelled => Err(EngineError::InvalidTransition {
                hold_id: id,
                status,
            }),
        }
    }

    /// Expire a hold if it is still active and overdue at `now`. Idempotent.
    pub async fn expire_hold(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let (bucket_id, mut guard) = self.resolve_hold_write(&id).await?;
        let overdue = guard.holds.get(&id).is_some_and(|h| h.is_overdue(now));
        if !overdue {
            return Ok(false);
        }
        let event = Event::HoldReleased {
            id,
            bucket_id,
            expired: true,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(1);
        Ok(true)
    }

    /// Cancel a confirmed booking, returning its units to the bucket.
    /// Returns `false` if it was already cancelled.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<bool, EngineError> {
        let (bucket_id, mut guard) = self.resolve_hold_write(&id).await?;
        let status = guard.hold_status(&id).ok_or(EngineError::NotFound(id))?;
        match status {
            HoldStatus::Confirmed => {
                let event = Event::BookingCancelled { id, bucket_id };
                self.persist_and_apply(&mut guard, &event).await?;
                info!(booking_id = %id, bucket_id = %bucket_id, "booking cancelled");
                Ok(true)
            }
            HoldStatus::Cancelled => Ok(false),
            HoldStatus::Active | HoldStatus::Released | HoldStatus::Expired => {
                Err(EngineError::InvalidTransition { hold_id: id, status })
            }
        }
    }

    /// Active holds whose expiry is at or before `now`, as `(hold_id, bucket_id)`.
    /// Buckets locked by a writer are skipped; the next sweep picks them up.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.buckets.iter() {
            let bs = entry.value().clone();
            if let Ok(guard) = bs.try_read() {
                expired.extend(
                    guard
                        .active_holds()
                        .filter(|h| h.expires_at <= now)
                        .map(|h| (h.id, guard.spec.id)),
                );
            }
        }
        expired
    }
}
