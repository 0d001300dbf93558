use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "spotsense_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "spotsense_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "spotsense_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "spotsense_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "spotsense_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "spotsense_tenants_active";

/// Counter: bookings flipped to no_show by the sweeper.
pub const NO_SHOWS_TOTAL: &str = "spotsense_no_shows_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "spotsense_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "spotsense_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertFacility { .. } => "insert_facility",
        Command::UpdateFacility { .. } => "update_facility",
        Command::DeleteFacility { .. } => "delete_facility",
        Command::InsertBooking { .. } => "insert_booking",
        Command::ConfirmBooking { .. } => "confirm_booking",
        Command::CheckIn { .. } => "check_in",
        Command::CheckOut { .. } => "check_out",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::InsertExtension { .. } => "insert_extension",
        Command::ApproveExtension { .. } => "approve_extension",
        Command::InsertRating { .. } => "insert_rating",
        Command::InsertNote { .. } => "insert_note",
        Command::SelectFacilities => "select_facilities",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectExtensions { .. } => "select_extensions",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFacilityStats { .. } => "select_facility_stats",
        Command::Listen { .. } => "listen",
    }
}
