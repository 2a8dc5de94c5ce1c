//! Hard limits enforced per organization. Requests past a limit fail with
//! `EngineError::LimitExceeded` instead of growing state without bound.

use crate::model::{Ms, Night};

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_UNITS_PER_TENANT: usize = 100_000;
pub const MAX_BUCKETS_PER_TENANT: usize = 250_000;
pub const MAX_POOLS_PER_TENANT: usize = 50_000;
pub const MAX_RATE_PLANS_PER_TENANT: usize = 250_000;

pub const MAX_VARIANTS_PER_POOL: usize = 256;
pub const MAX_SEASONS_PER_PLAN: usize = 512;
pub const MAX_FEES_PER_PLAN: usize = 64;
pub const MAX_HOLDS_PER_BUCKET: usize = 50_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CODE_LEN: usize = 32;

/// 2000-01-01 as a night number.
pub const MIN_VALID_NIGHT: Night = 10_957;
/// 2200-01-01 as a night number.
pub const MAX_VALID_NIGHT: Night = 84_006;

/// Longest stay or capacity range accepted in one request.
pub const MAX_RANGE_NIGHTS: u32 = 732;
/// Widest availability scan.
pub const MAX_QUERY_NIGHTS: u32 = 1_100;

pub const MAX_QUANTITY_PER_REQUEST: u32 = 10_000;
pub const MAX_HOLD_TTL_MS: Ms = 7 * 24 * 3_600_000;
