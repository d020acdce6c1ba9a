use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "reslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "reslot_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: bookings admitted.
pub const BOOKINGS_ADMITTED_TOTAL: &str = "reslot_bookings_admitted_total";

/// Counter: bookings refused. Labels: kind.
pub const BOOKINGS_REJECTED_TOTAL: &str = "reslot_bookings_rejected_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "reslot_bookings_cancelled_total";

/// Counter: window lock waits that timed out.
pub const LOCK_CONTENTION_TOTAL: &str = "reslot_lock_contention_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reslot_connections_rejected_total";

/// Gauge: number of loaded sites.
pub const SITES_ACTIVE: &str = "reslot_sites_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reslot_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertWindow { .. } => "insert_window",
        Command::UpdateWindow { .. } => "update_window",
        Command::DeleteWindow { .. } => "delete_window",
        Command::InsertBooking(_) => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectWindows { .. } => "select_windows",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectCalendar { .. } => "select_calendar",
    }
}
