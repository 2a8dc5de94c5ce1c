use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Only hold timestamps use it.
pub type Ms = i64;

/// Day number counted from 1970-01-01. Staying "the night of" day `n` occupies night `n`.
pub type Night = i32;

/// Minor currency units (cents).
pub type Money = i64;

/// Basis points, `BPS_ONE` = 100%.
pub type Bps = u32;

pub const BPS_ONE: Bps = 10_000;

/// Half-open range of nights `[start, end)`. Checkout night is `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NightRange {
    pub start: Night,
    pub end: Night,
}

impl NightRange {
    pub fn new(start: Night, end: Night) -> Self {
        debug_assert!(start < end, "NightRange start must be before end");
        Self { start, end }
    }

    /// Non-panicking constructor for untrusted input.
    pub fn checked(start: Night, end: Night) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn nights(&self) -> u32 {
        (self.end - self.start) as u32
    }

    pub fn iter(&self) -> std::ops::Range<Night> {
        self.start..self.end
    }

    pub fn overlaps(&self, other: &NightRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_night(&self, night: Night) -> bool {
        self.start <= night && night < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_range(&self, other: &NightRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationType {
    /// Contracted block; may be oversold by `overbooking_limit`.
    Committed,
    /// Sold subject to supplier confirmation, capped at quantity.
    OnRequest,
    /// Free sale, never capped.
    Unlimited,
}

impl AllocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationType::Committed => "committed",
            AllocationType::OnRequest => "on_request",
            AllocationType::Unlimited => "unlimited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "committed" => Some(AllocationType::Committed),
            "on_request" => Some(AllocationType::OnRequest),
            "unlimited" => Some(AllocationType::Unlimited),
            _ => None,
        }
    }
}

/// Ledger row for one bucket and one night.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightCounts {
    pub quantity: u32,
    pub booked: u32,
    pub held: u32,
}

impl NightCounts {
    pub fn used(&self) -> u32 {
        self.booked.saturating_add(self.held)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldStatus {
    Active,
    Confirmed,
    Released,
    Expired,
    Cancelled,
}

impl HoldStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HoldStatus::Released | HoldStatus::Expired | HoldStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HoldStatus::Active => "active",
            HoldStatus::Confirmed => "confirmed",
            HoldStatus::Released => "released",
            HoldStatus::Expired => "expired",
            HoldStatus::Cancelled => "cancelled",
        }
    }
}

/// A claim of `quantity` units on every night of `range` in one bucket.
/// Confirmed holds are bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Ulid,
    pub bucket_id: Ulid,
    pub unit_id: Ulid,
    pub range: NightRange,
    pub quantity: u32,
    pub created_at: Ms,
    pub expires_at: Ms,
    pub requires_confirmation: bool,
    pub status: HoldStatus,
}

impl Hold {
    pub fn is_overdue(&self, now: Ms) -> bool {
        self.status == HoldStatus::Active && self.expires_at <= now
    }
}

/// Static attributes of a bucket, as created by an admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpec {
    pub id: Ulid,
    pub unit_id: Ulid,
    pub supplier_id: Ulid,
    pub allocation_type: AllocationType,
    /// Lower value is tried first.
    pub priority: i32,
    pub cost_per_unit: Money,
    pub overbooking_limit: u32,
}

#[derive(Debug, Clone)]
pub struct BucketState {
    pub spec: BucketSpec,
    /// Retired buckets keep their holds and bookings but take no new holds.
    pub released: bool,
    pub nights: BTreeMap<Night, NightCounts>,
    /// Holds and bookings placed on this bucket, terminal ones included until compaction.
    pub holds: HashMap<Ulid, Hold>,
    /// Final status of terminal holds that compaction dropped from `holds`.
    pub retired: HashMap<Ulid, HoldStatus>,
}

impl BucketState {
    pub fn new(spec: BucketSpec) -> Self {
        Self {
            spec,
            released: false,
            nights: BTreeMap::new(),
            holds: HashMap::new(),
            retired: HashMap::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.spec.id
    }

    /// Current status of a hold, including one retired by compaction.
    pub fn hold_status(&self, id: &Ulid) -> Option<HoldStatus> {
        self.holds
            .get(id)
            .map(|h| h.status)
            .or_else(|| self.retired.get(id).copied())
    }

    /// Active holds and confirmed bookings.
    pub fn live_hold_count(&self) -> usize {
        self.holds.values().filter(|h| !h.status.is_terminal()).count()
    }

    /// Upper bound on `booked + held` for a night row. `None` means uncapped.
    pub fn cap(&self, counts: &NightCounts) -> Option<u32> {
        match self.spec.allocation_type {
            AllocationType::Unlimited => None,
            AllocationType::OnRequest => Some(counts.quantity),
            AllocationType::Committed => {
                Some(counts.quantity.saturating_add(self.spec.overbooking_limit))
            }
        }
    }

    /// Units still sellable on a night row. `None` means uncapped.
    pub fn available(&self, counts: &NightCounts) -> Option<u32> {
        self.cap(counts).map(|cap| cap.saturating_sub(counts.used()))
    }

    /// True when the bucket has a ledger row for every night of `range`.
    pub fn covers(&self, range: &NightRange) -> bool {
        self.nights.range(range.start..range.end).count() == range.nights() as usize
    }

    pub fn nights_in(&self, range: &NightRange) -> impl Iterator<Item = (&Night, &NightCounts)> {
        self.nights.range(range.start..range.end)
    }

    pub fn active_holds(&self) -> impl Iterator<Item = &Hold> {
        self.holds
            .values()
            .filter(|h| h.status == HoldStatus::Active)
    }

    pub fn info(&self) -> BucketInfo {
        BucketInfo {
            id: self.spec.id,
            unit_id: self.spec.unit_id,
            supplier_id: self.spec.supplier_id,
            allocation_type: self.spec.allocation_type,
            priority: self.spec.priority,
            cost_per_unit: self.spec.cost_per_unit,
            overbooking_limit: self.spec.overbooking_limit,
            released: self.released,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryUnit {
    pub id: Ulid,
    pub name: Option<String>,
}

/// One bucket's membership in a pool, with pool-level ranking and pricing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolVariant {
    pub bucket_id: Ulid,
    pub priority: i32,
    pub cost_per_unit: Money,
    pub sell_price: Option<Money>,
    /// Most units a single request may draw from the bucket through this pool.
    pub max_quantity: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryPool {
    pub id: Ulid,
    pub unit_id: Ulid,
    pub name: Option<String>,
    pub auto_allocate: bool,
    pub variants: Vec<PoolVariant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeKind {
    /// Percentage of the taxable subtotal.
    Percent(Bps),
    /// Per unit, per night.
    PerNight(Money),
    /// Once per stay.
    PerStay(Money),
}

impl FeeKind {
    pub fn parse(kind: &str, amount: i64) -> Option<Self> {
        match kind.to_ascii_lowercase().as_str() {
            "percent" => u32::try_from(amount).ok().map(FeeKind::Percent),
            "per_night" => Some(FeeKind::PerNight(amount)),
            "per_stay" => Some(FeeKind::PerStay(amount)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateTaxFee {
    pub id: Ulid,
    pub name: String,
    pub kind: FeeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateSeason {
    pub id: Ulid,
    pub range: NightRange,
    pub nightly_rate: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateOccupancy {
    pub occupancy: u32,
    pub multiplier_bps: Bps,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatePlan {
    pub id: Ulid,
    pub unit_id: Ulid,
    /// `None` prices every supplier's buckets of the unit.
    pub supplier_id: Option<Ulid>,
    pub currency: String,
    pub market: String,
    pub channel: String,
    pub validity: NightRange,
    pub preferred: bool,
    /// Apply percentage taxes on base + fixed fees instead of base alone.
    pub fees_before_taxes: bool,
    pub seasons: Vec<RateSeason>,
    pub occupancies: Vec<RateOccupancy>,
    pub fees: Vec<RateTaxFee>,
}

impl RatePlan {
    pub fn season_for(&self, night: Night) -> Option<&RateSeason> {
        self.seasons.iter().find(|s| s.range.contains_night(night))
    }

    /// Multiplier for an occupancy. A plan without occupancy rows prices every occupancy at 100%.
    pub fn occupancy_multiplier(&self, occupancy: u32) -> Option<Bps> {
        if self.occupancies.is_empty() {
            return Some(BPS_ONE);
        }
        self.occupancies
            .iter()
            .find(|o| o.occupancy == occupancy)
            .map(|o| o.multiplier_bps)
    }

    /// Same selling scope: unit, channel and market. Currency and supplier
    /// scope do not separate preferred plans.
    pub fn same_scope(&self, other: &RatePlan) -> bool {
        self.unit_id == other.unit_id && self.channel == other.channel && self.market == other.market
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UnitCreated {
        id: Ulid,
        name: Option<String>,
    },
    BucketCreated {
        bucket: BucketSpec,
    },
    BucketCapacitySet {
        bucket_id: Ulid,
        range: NightRange,
        quantity: u32,
    },
    BucketReleased {
        bucket_id: Ulid,
    },
    CountersAdjusted {
        bucket_id: Ulid,
        range: NightRange,
        delta_booked: i64,
        delta_held: i64,
    },
    PoolCreated {
        pool: InventoryPool,
    },
    PoolVariantAdded {
        pool_id: Ulid,
        variant: PoolVariant,
    },
    RatePlanCreated {
        plan: RatePlan,
    },
    RateSeasonAdded {
        rate_plan_id: Ulid,
        season: RateSeason,
    },
    RateOccupancySet {
        rate_plan_id: Ulid,
        occupancy: RateOccupancy,
    },
    RateFeeAdded {
        rate_plan_id: Ulid,
        fee: RateTaxFee,
    },
    HoldPlaced {
        hold: Hold,
    },
    HoldReleased {
        id: Ulid,
        bucket_id: Ulid,
        expired: bool,
    },
    HoldConfirmed {
        id: Ulid,
        bucket_id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
        bucket_id: Ulid,
    },
    /// Compaction record: a bucket's full state in one entry.
    BucketRestored {
        bucket: BucketSpec,
        released: bool,
        nights: Vec<(Night, NightCounts)>,
        holds: Vec<Hold>,
        /// Terminal holds, by final status only.
        retired: Vec<(Ulid, HoldStatus)>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketInfo {
    pub id: Ulid,
    pub unit_id: Ulid,
    pub supplier_id: Ulid,
    pub allocation_type: AllocationType,
    pub priority: i32,
    pub cost_per_unit: Money,
    pub overbooking_limit: u32,
    pub released: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyAvailability {
    pub bucket_id: Ulid,
    pub night: Night,
    pub quantity: u32,
    pub booked: u32,
    pub held: u32,
    /// `None` for uncapped buckets.
    pub available: Option<u32>,
}
