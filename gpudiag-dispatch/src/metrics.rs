//! Dispatch-layer observability: per-node dispatch duration, breaker state,
//! and reachability.
//!
//! Lazily-registered `prometheus` vectors behind a small wrapper type,
//! tracking the gateway's per-node signals rather than per-device health
//! gauges.

use once_cell::sync::Lazy;
use prometheus::{HistogramVec, IntGaugeVec, Registry};

use crate::breaker::BreakerState;

static DISPATCH_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    prometheus::register_histogram_vec!(
        "gpudiag_dispatch_duration_seconds",
        "Per-node proxied request duration",
        &["node", "transport", "status"]
    )
    .expect("metric registration should not collide")
});

static BREAKER_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    prometheus::register_int_gauge_vec!(
        "gpudiag_dispatch_breaker_state",
        "Per-node circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        &["node"]
    )
    .expect("metric registration should not collide")
});

static NODE_REACHABLE: Lazy<IntGaugeVec> = Lazy::new(|| {
    prometheus::register_int_gauge_vec!(
        "gpudiag_dispatch_node_reachable",
        "Per-node agent reachability (1=reachable, 0=not)",
        &["node"]
    )
    .expect("metric registration should not collide")
});

/// Transport used for a single per-node call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    Exec,
}

impl Transport {
    fn as_label(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Exec => "exec",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Error,
    BreakerRefused,
}

impl CallOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Error => "error",
            CallOutcome::BreakerRefused => "breaker",
        }
    }
}

/// Record one completed per-node call's duration and outcome.
pub fn observe_dispatch(node: &str, transport: Transport, outcome: CallOutcome, seconds: f64) {
    DISPATCH_DURATION_SECONDS
        .with_label_values(&[node, transport.as_label(), outcome.as_label()])
        .observe(seconds);
}

pub fn set_breaker_state(node: &str, state: BreakerState) {
    BREAKER_STATE
        .with_label_values(&[node])
        .set(state.as_gauge_value() as i64);
}

pub fn set_node_reachable(node: &str, reachable: bool) {
    NODE_REACHABLE
        .with_label_values(&[node])
        .set(i64::from(reachable));
}

/// Registry used by the `/metrics` HTTP endpoint. Prometheus's default
/// registry already holds everything registered above via the `register_*`
/// macros; this wrapper exists so the transport layer doesn't reach into
/// the `prometheus` crate directly.
pub fn default_registry() -> Registry {
    prometheus::default_registry().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_metrics_does_not_panic() {
        observe_dispatch("node-a", Transport::Http, CallOutcome::Success, 0.01);
        set_breaker_state("node-a", BreakerState::Closed);
        set_node_reachable("node-a", true);
    }
}
