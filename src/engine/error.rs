use ulid::Ulid;

use crate::model::{HoldStatus, Night};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Overlaps an existing preferred rate plan or season.
    Conflict(Ulid),
    InvalidRange,
    Invalid(&'static str),
    /// The adjustment would break `booked + held <= cap` on `night`.
    CapacityExceeded {
        bucket_id: Ulid,
        night: Night,
        requested: u32,
        available: u32,
    },
    /// A counter would drop below zero.
    InvalidAdjustment {
        bucket_id: Ulid,
        night: Night,
    },
    /// A multi-night hold fitted `nights_fitted` nights, then failed on
    /// `night`. Nothing was written. Never leaves the hold manager.
    PartialCapacityFailure {
        bucket_id: Ulid,
        night: Night,
        nights_fitted: usize,
    },
    NoAvailability(Ulid),
    NoPricingAvailable {
        unit_id: Ulid,
        night: Night,
    },
    BucketReleased(Ulid),
    InvalidTransition {
        hold_id: Ulid,
        status: HoldStatus,
    },
    HoldExpired(Ulid),
    Cancelled,
    LimitExceeded(&'static str),
    StorageUnavailable(String),
}

impl EngineError {
    /// Only storage faults are worth retrying; everything else is a decision.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StorageUnavailable(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "conflicts with: {id}"),
            EngineError::InvalidRange => write!(f, "invalid night range: start must be before end"),
            EngineError::Invalid(msg) => write!(f, "invalid: {msg}"),
            EngineError::CapacityExceeded {
                bucket_id,
                night,
                requested,
                available,
            } => write!(
                f,
                "capacity exceeded on bucket {bucket_id} night {night}: requested {requested}, available {available}"
            ),
            EngineError::InvalidAdjustment { bucket_id, night } => write!(
                f,
                "adjustment would make a counter negative on bucket {bucket_id} night {night}"
            ),
            EngineError::PartialCapacityFailure {
                bucket_id,
                night,
                nights_fitted,
            } => write!(
                f,
                "hold failed on bucket {bucket_id} night {night} after {nights_fitted} nights fitted"
            ),
            EngineError::NoAvailability(unit_id) => {
                write!(f, "no availability for unit {unit_id}")
            }
            EngineError::NoPricingAvailable { unit_id, night } => {
                write!(f, "no pricing available for unit {unit_id} on night {night}")
            }
            EngineError::BucketReleased(id) => write!(f, "bucket {id} is released"),
            EngineError::InvalidTransition { hold_id, status } => {
                write!(f, "hold {hold_id} is {}", status.as_str())
            }
            EngineError::HoldExpired(id) => write!(f, "hold {id} expired"),
            EngineError::Cancelled => write!(f, "request cancelled"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StorageUnavailable(e) => write!(f, "storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
