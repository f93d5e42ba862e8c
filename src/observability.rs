use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::engine::EngineError;

// ── Waitlist ────────────────────────────────────────────────────

/// Counter: successful waitlist joins.
pub const JOINS_TOTAL: &str = "bookhold_joins_total";

/// Counter: rejected joins. Labels: reason.
pub const JOIN_REJECTIONS_TOTAL: &str = "bookhold_join_rejections_total";

/// Counter: voluntary leaves that removed an entry.
pub const LEAVES_TOTAL: &str = "bookhold_leaves_total";

// ── Holds ───────────────────────────────────────────────────────

/// Counter: holds opened by allocation.
pub const HOLDS_OPENED_TOTAL: &str = "bookhold_holds_opened_total";

/// Counter: holds reaching a terminal state. Labels: status.
pub const HOLDS_CLOSED_TOTAL: &str = "bookhold_holds_closed_total";

/// Counter: allocation attempts rolled back (entry restored).
pub const ALLOCATION_FAILURES_TOTAL: &str = "bookhold_allocation_failures_total";

/// Histogram: expiry sweep duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "bookhold_sweep_duration_seconds";

/// Counter: requester notices that could not be delivered.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "bookhold_notifications_failed_total";

// ── Engine ──────────────────────────────────────────────────────

/// Gauge: resources with tracked state.
pub const RESOURCES_ACTIVE: &str = "bookhold_resources_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookhold_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookhold_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a rejected join.
pub fn rejection_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::NotFound(_) => "not_found",
        EngineError::AlreadyQueued { .. } => "already_queued",
        EngineError::AlreadyHeld { .. } => "already_held",
        EngineError::ResourceAvailable { .. } => "resource_available",
        EngineError::InvalidTransition { .. } => "invalid_transition",
        EngineError::Catalog(_) => "catalog",
        EngineError::Standing(_) => "standing",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::WalError(_) => "wal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn init_without_port_is_noop() {
        assert!(init(None).is_ok());
    }

    #[test]
    fn rejection_labels() {
        let id = Ulid::new();
        assert_eq!(
            rejection_label(&EngineError::AlreadyQueued { requester: id, resource: id }),
            "already_queued"
        );
        assert_eq!(
            rejection_label(&EngineError::ResourceAvailable { resource: id, available: 2 }),
            "resource_available"
        );
        assert_eq!(rejection_label(&EngineError::LimitExceeded("x")), "limit_exceeded");
    }
}
