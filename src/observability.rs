use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "chairtime_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "chairtime_query_duration_seconds";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: appointments successfully booked.
pub const APPOINTMENTS_BOOKED_TOTAL: &str = "chairtime_appointments_booked_total";

/// Counter: bookings refused because every slot was taken.
pub const SLOT_REJECTIONS_TOTAL: &str = "chairtime_slot_rejections_total";

/// Counter: committed lifecycle transitions. Labels: action.
pub const TRANSITIONS_TOTAL: &str = "chairtime_transitions_total";

/// Counter: appointments auto-cancelled by the reaper.
pub const APPOINTMENTS_REAPED_TOTAL: &str = "chairtime_appointments_reaped_total";

/// Counter: engine operations that failed. Labels: op, kind.
pub const ENGINE_ERRORS_TOTAL: &str = "chairtime_engine_errors_total";

/// Counter: notifier / activity log failures. Labels: sink.
pub const COLLABORATOR_FAILURES_TOTAL: &str = "chairtime_collaborator_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "chairtime_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "chairtime_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "chairtime_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "chairtime_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "chairtime_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "chairtime_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSalon { .. } => "insert_salon",
        Command::UpdateSalon { .. } => "update_salon",
        Command::InsertService { .. } => "insert_service",
        Command::InsertSubService { .. } => "insert_sub_service",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::InsertCompletion { .. } => "complete",
        Command::InsertCancellation { .. } => "cancel",
        Command::InsertOffsiteQuote { .. } => "quote_offsite",
        Command::InsertOffsiteRejection { .. } => "reject_offsite",
        Command::InsertQuoteResponse { accepted: true, .. } => "accept_quote",
        Command::InsertQuoteResponse { accepted: false, .. } => "reject_quote",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectDayAvailability { .. } => "select_day_availability",
        Command::SelectMonthAvailability { .. } => "select_month_availability",
        Command::SelectOverdueSweep { .. } => "select_overdue_sweep",
    }
}
