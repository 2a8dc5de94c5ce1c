use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

pub(crate) fn validate_range(range: &NightRange, max_nights: u32) -> Result<(), EngineError> {
    if range.start >= range.end {
        return Err(EngineError::InvalidRange);
    }
    if range.start < MIN_VALID_NIGHT || range.end > MAX_VALID_NIGHT {
        return Err(EngineError::LimitExceeded("night out of range"));
    }
    if range.nights() > max_nights {
        return Err(EngineError::LimitExceeded("range too wide"));
    }
    Ok(())
}

/// Check an adjustment of every night in `range` against the bucket invariant
/// without applying it. Decreases are always allowed as long as no counter
/// goes negative, so an over-cap night can still drain. A step no `u32`
/// counter could take is `InvalidAdjustment`.
pub fn check_adjustment(
    bs: &BucketState,
    range: &NightRange,
    delta_booked: i64,
    delta_held: i64,
) -> Result<(), EngineError> {
    let bucket_id = bs.spec.id;
    // Counters are u32, so a larger step can never be valid.
    let step_limit = u32::MAX as i64;
    if delta_booked.unsigned_abs() > u32::MAX as u64 || delta_held.unsigned_abs() > u32::MAX as u64 {
        return Err(EngineError::InvalidAdjustment {
            bucket_id,
            night: range.start,
        });
    }
    let growth = delta_booked + delta_held;
    let requested = growth.clamp(0, step_limit) as u32;
    for night in range.iter() {
        let Some(counts) = bs.nights.get(&night) else {
            if growth > 0 {
                return Err(EngineError::CapacityExceeded {
                    bucket_id,
                    night,
                    requested,
                    available: 0,
                });
            }
            return Err(EngineError::InvalidAdjustment { bucket_id, night });
        };
        let booked = counts.booked as i64 + delta_booked;
        let held = counts.held as i64 + delta_held;
        if booked < 0 || held < 0 || booked > step_limit || held > step_limit {
            return Err(EngineError::InvalidAdjustment { bucket_id, night });
        }
        if growth > 0
            && let Some(cap) = bs.cap(counts)
            && booked + held > cap as i64
        {
            return Err(EngineError::CapacityExceeded {
                bucket_id,
                night,
                requested,
                available: cap.saturating_sub(counts.used()),
            });
        }
    }
    Ok(())
}

fn daily_rows(bs: &BucketState, range: &NightRange) -> Vec<DailyAvailability> {
    bs.nights_in(range)
        .map(|(night, counts)| DailyAvailability {
            bucket_id: bs.spec.id,
            night: *night,
            quantity: counts.quantity,
            booked: counts.booked,
            held: counts.held,
            available: bs.available(counts),
        })
        .collect()
}

impl Engine {
    /// Register a bucket. Serialized with catalog writes and compaction, so a
    /// new bucket is either in the compaction snapshot or appended after it.
    pub async fn create_bucket(&self, spec: BucketSpec) -> Result<(), EngineError> {
        if spec.cost_per_unit < 0 {
            return Err(EngineError::Invalid("cost_per_unit must not be negative"));
        }
        let _catalog = self.catalog_lock.lock().await;
        if self.buckets.len() >= MAX_BUCKETS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many buckets"));
        }
        if !self.units.contains_key(&spec.unit_id) {
            return Err(EngineError::NotFound(spec.unit_id));
        }
        if self.buckets.contains_key(&spec.id) {
            return Err(EngineError::AlreadyExists(spec.id));
        }

        let event = Event::BucketCreated { bucket: spec.clone() };
        self.wal_append(&event).await?;
        self.insert_bucket(BucketState::new(spec));
        Ok(())
    }

    /// Set the nominal quantity on every night of `range`, creating rows as needed.
    /// A capped bucket cannot be shrunk below what is already booked or held.
    pub async fn set_bucket_capacity(
        &self,
        bucket_id: Ulid,
        range: NightRange,
        quantity: u32,
    ) -> Result<(), EngineError> {
        validate_range(&range, MAX_RANGE_NIGHTS)?;
        let bs = self
            .get_bucket(&bucket_id)
            .ok_or(EngineError::NotFound(bucket_id))?;
        let mut guard = bs.write().await;

        for (_, counts) in guard.nights_in(&range) {
            let resized = NightCounts { quantity, ..*counts };
            if let Some(cap) = guard.cap(&resized)
                && resized.used() > cap
            {
                return Err(EngineError::Invalid("quantity below booked + held"));
            }
        }

        let event = Event::BucketCapacitySet {
            bucket_id,
            range,
            quantity,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Retire a bucket. Idempotent.
    pub async fn release_bucket(&self, bucket_id: Ulid) -> Result<(), EngineError> {
        let bs = self
            .get_bucket(&bucket_id)
            .ok_or(EngineError::NotFound(bucket_id))?;
        let mut guard = bs.write().await;
        if guard.released {
            return Ok(());
        }
        let event = Event::BucketReleased { bucket_id };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Atomically shift `booked`/`held` on every night of `range`.
    ///
    /// The whole adjustment is validated under the bucket's write lock and
    /// persisted as one event: either every night changes or none does.
    /// Returns the resulting rows.
    pub async fn adjust(
        &self,
        bucket_id: Ulid,
        range: NightRange,
        delta_booked: i64,
        delta_held: i64,
    ) -> Result<Vec<NightCounts>, EngineError> {
        validate_range(&range, MAX_RANGE_NIGHTS)?;
        let bs = self
            .get_bucket(&bucket_id)
            .ok_or(EngineError::NotFound(bucket_id))?;
        let mut guard = bs.write().await;
        if guard.released && delta_booked.saturating_add(delta_held) > 0 {
            return Err(EngineError::BucketReleased(bucket_id));
        }

        if let Err(e) = check_adjustment(&guard, &range, delta_booked, delta_held) {
            if matches!(e, EngineError::CapacityExceeded { .. }) {
                metrics::counter!(crate::observability::CAPACITY_EXCEEDED_TOTAL).increment(1);
            }
            return Err(e);
        }

        let event = Event::CountersAdjusted {
            bucket_id,
            range,
            delta_booked,
            delta_held,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.nights_in(&range).map(|(_, c)| *c).collect())
    }

    /// Per-night counters for every live bucket of a unit, ordered by bucket id then night.
    pub async fn get_availability(
        &self,
        unit_id: Ulid,
        range: NightRange,
    ) -> Result<Vec<DailyAvailability>, EngineError> {
        validate_range(&range, MAX_QUERY_NIGHTS)?;
        let mut bucket_ids = self.buckets_of_unit(&unit_id);
        bucket_ids.sort();

        let mut rows = Vec::new();
        for bucket_id in bucket_ids {
            let Some(bs) = self.get_bucket(&bucket_id) else {
                continue;
            };
            let guard = bs.read().await;
            if guard.released {
                continue;
            }
            rows.extend(daily_rows(&guard, &range));
        }
        Ok(rows)
    }

    pub async fn bucket_availability(
        &self,
        bucket_id: Ulid,
        range: NightRange,
    ) -> Result<Vec<DailyAvailability>, EngineError> {
        validate_range(&range, MAX_QUERY_NIGHTS)?;
        let bs = self
            .get_bucket(&bucket_id)
            .ok_or(EngineError::NotFound(bucket_id))?;
        let guard = bs.read().await;
        Ok(daily_rows(&guard, &range))
    }
}
