use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "allotd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "allotd_query_duration_seconds";

// ── Allocation metrics ──────────────────────────────────────────

/// Counter: holds placed on a bucket.
pub const HOLDS_ACQUIRED_TOTAL: &str = "allotd_holds_acquired_total";

/// Counter: holds converted into bookings.
pub const HOLDS_CONFIRMED_TOTAL: &str = "allotd_holds_confirmed_total";

/// Counter: holds released by the caller.
pub const HOLDS_RELEASED_TOTAL: &str = "allotd_holds_released_total";

/// Counter: holds expired by the sweep or lazily on access.
pub const HOLDS_EXPIRED_TOTAL: &str = "allotd_holds_expired_total";

/// Counter: writes rejected because a night was over its cap.
pub const CAPACITY_EXCEEDED_TOTAL: &str = "allotd_capacity_exceeded_total";

/// Counter: multi-night holds rejected on a later night after earlier nights fitted.
pub const PARTIAL_HOLD_FAILURES_TOTAL: &str = "allotd_partial_hold_failures_total";

/// Histogram: buckets tried per resolve request.
pub const RESOLVE_ATTEMPTS: &str = "allotd_resolve_attempts";

/// Counter: resolve requests that found no bucket with room.
pub const NO_AVAILABILITY_TOTAL: &str = "allotd_no_availability_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "allotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "allotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "allotd_connections_rejected_total";

/// Gauge: number of organizations with a loaded engine.
pub const TENANTS_ACTIVE: &str = "allotd_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "allotd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "allotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "allotd_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUnit { .. } => "insert_unit",
        Command::InsertBucket { .. } => "insert_bucket",
        Command::SetBucketCapacity { .. } => "set_bucket_capacity",
        Command::DeleteBucket { .. } => "delete_bucket",
        Command::InsertPool { .. } => "insert_pool",
        Command::InsertPoolVariant { .. } => "insert_pool_variant",
        Command::InsertRatePlan { .. } => "insert_rate_plan",
        Command::InsertRateSeason { .. } => "insert_rate_season",
        Command::InsertRateOccupancy { .. } => "insert_rate_occupancy",
        Command::InsertRateFee { .. } => "insert_rate_fee",
        Command::InsertAdjustment { .. } => "insert_adjustment",
        Command::InsertHold { .. } => "insert_hold",
        Command::DeleteHold { .. } => "delete_hold",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectHolds { .. } => "select_holds",
        Command::SelectBuckets { .. } => "select_buckets",
        Command::SelectQuote { .. } => "select_quote",
    }
}
