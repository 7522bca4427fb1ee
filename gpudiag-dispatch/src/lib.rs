//! Gateway dispatch fabric: per-node circuit breakers, bounded-concurrency
//! fan-out across agent pods, dual-transport (HTTP/exec) outbound calls, and
//! the Prometheus signals the gateway exposes.

pub mod breaker;
pub mod metrics;
pub mod router;
pub mod transport_client;

pub use breaker::{Admission, BreakerState, CircuitBreaker};
pub use router::{AggregatedResult, NodeResult, OperationKind, Router};
pub use transport_client::{RoutingMode, TransportClient, TransportError};
