//! Prometheus metrics for observability.
//!
//! Covers the control surface (WebSocket connections) and run outcomes.
//! Attempt terminals are labelled with their failure class so a
//! dashboard can tell a sold-out train from an expired session.

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// Active WebSocket connections.
pub static WS_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "chetak_ws_connections_active",
        "Number of active WebSocket connections",
    )
    .unwrap()
});

/// Total WebSocket connections (cumulative).
pub static WS_CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "chetak_ws_connections_total",
        "Total WebSocket connections since startup",
    )
    .unwrap()
});

/// Booking runs launched.
pub static RUNS_STARTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "chetak_runs_started_total",
        "Booking runs launched since startup",
    )
    .unwrap()
});

/// Booking runs that reached their terminal event, by outcome.
pub static RUNS_FINISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "chetak_runs_finished_total",
            "Booking runs finished, by outcome",
        ),
        &["outcome"],
    )
    .unwrap()
});

/// Attempt terminal events, by outcome class ("booked" on success).
pub static ATTEMPT_OUTCOMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "chetak_attempt_outcomes_total",
            "Attempt terminal events, by outcome class",
        ),
        &["class"],
    )
    .unwrap()
});

/// Status events forwarded to clients.
pub static WS_EVENTS_SENT_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "chetak_ws_events_sent_total",
        "Status events forwarded over WebSocket",
    )
    .unwrap()
});

fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(WS_CONNECTIONS_ACTIVE.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_CONNECTIONS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(RUNS_STARTED_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(RUNS_FINISHED_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(ATTEMPT_OUTCOMES_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_EVENTS_SENT_TOTAL.clone()))
        .unwrap();
}

/// Encode all registered metrics in the Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap_or_default()
}
