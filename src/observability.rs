use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total operations handled. Labels: op, outcome.
pub const OPS_TOTAL: &str = "roombook_ops_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OP_DURATION_SECONDS: &str = "roombook_op_duration_seconds";

/// Counter: submits and edits refused because the slot was taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "roombook_slot_conflicts_total";

/// Counter: mutations refused for a stale version.
pub const VERSION_CONFLICTS_TOTAL: &str = "roombook_version_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roombook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roombook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roombook_connections_rejected_total";

/// Counter: failed hello handshakes.
pub const AUTH_FAILURES_TOTAL: &str = "roombook_auth_failures_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "roombook_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "roombook_journal_flush_batch_size";

/// Counter: bookings moved to Done by the sweeper.
pub const SWEEPER_ELAPSED_TOTAL: &str = "roombook_sweeper_elapsed_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a request, for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Hello { .. } => "hello",
        Request::Submit { .. } => "submit",
        Request::Edit { .. } => "edit",
        Request::Cancel { .. } => "cancel",
        Request::Approve { .. } => "approve",
        Request::Reject { .. } => "reject",
        Request::MarkElapsed { .. } => "mark_elapsed",
        Request::Get { .. } => "get",
        Request::ListMine => "list_mine",
        Request::ListForOwner { .. } => "list_for_owner",
        Request::ListPending => "list_pending",
        Request::Occupied { .. } => "occupied",
        Request::Free { .. } => "free",
        Request::Rooms => "rooms",
        Request::Watch { .. } => "watch",
        Request::Unwatch => "unwatch",
    }
}
