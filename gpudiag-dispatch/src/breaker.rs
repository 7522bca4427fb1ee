//! Per-node circuit breaker.
//!
//! A tagged enum rather than a free-form struct: the breaker is only ever
//! in exactly one of three states, and the state itself (not a separate
//! flag) carries the data relevant to that state. State transitions always
//! happen under the write half of the guarding lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// 0/1/2 encoding for the dispatch gauge.
    pub fn as_gauge_value(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

#[derive(Debug, Clone)]
enum Breaker {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

impl Default for Breaker {
    fn default() -> Self {
        Breaker::Closed {
            consecutive_failures: 0,
        }
    }
}

/// Whether a call is allowed to proceed, and why not if it isn't.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Refused,
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    nodes: RwLock<HashMap<String, Breaker>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Ask whether a call to `node` may proceed. If the breaker is Open and
    /// cool-down has elapsed, this call transitions it to HalfOpen and
    /// admits exactly one probe; concurrent callers racing this transition
    /// only ever see one of them win, because the transition happens under
    /// the write lock.
    pub async fn admit(&self, node: &str) -> Admission {
        let now_state = {
            let nodes = self.nodes.read().await;
            nodes.get(node).cloned()
        };

        match now_state {
            None | Some(Breaker::Closed { .. }) => Admission::Allowed,
            Some(Breaker::HalfOpen) => Admission::Refused,
            Some(Breaker::Open { until }) => {
                if Instant::now() < until {
                    Admission::Refused
                } else {
                    let mut nodes = self.nodes.write().await;
                    // Re-check under the write lock: another caller may
                    // have already flipped this node to HalfOpen.
                    match nodes.get(node) {
                        Some(Breaker::Open { until }) if Instant::now() >= *until => {
                            nodes.insert(node.to_string(), Breaker::HalfOpen);
                            debug!(node, "breaker Open -> HalfOpen, admitting probe");
                            Admission::Allowed
                        }
                        _ => Admission::Refused,
                    }
                }
            }
        }
    }

    /// Record the outcome of a call that was admitted.
    pub async fn record(&self, node: &str, success: bool) {
        let mut nodes = self.nodes.write().await;
        let current = nodes.entry(node.to_string()).or_default();

        *current = match (&*current, success) {
            (Breaker::HalfOpen, true) => {
                debug!(node, "breaker HalfOpen -> Closed (probe succeeded)");
                Breaker::Closed {
                    consecutive_failures: 0,
                }
            }
            (Breaker::HalfOpen, false) => {
                warn!(node, "breaker HalfOpen -> Open (probe failed)");
                Breaker::Open {
                    until: Instant::now() + self.cooldown,
                }
            }
            (Breaker::Closed { .. }, true) => Breaker::Closed {
                consecutive_failures: 0,
            },
            (Breaker::Closed { consecutive_failures }, false) => {
                let failures = consecutive_failures + 1;
                if failures >= self.threshold {
                    warn!(node, failures, "breaker Closed -> Open (threshold reached)");
                    Breaker::Open {
                        until: Instant::now() + self.cooldown,
                    }
                } else {
                    Breaker::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            (Breaker::Open { until }, _) => Breaker::Open { until: *until },
        };
    }

    pub async fn state(&self, node: &str) -> BreakerState {
        let nodes = self.nodes.read().await;
        match nodes.get(node) {
            None | Some(Breaker::Closed { .. }) => BreakerState::Closed,
            Some(Breaker::Open { .. }) => BreakerState::Open,
            Some(Breaker::HalfOpen) => BreakerState::HalfOpen,
        }
    }

    /// Drop bookkeeping for nodes not present in `live_nodes`. Never called
    /// while a request references a stale breaker — the caller is
    /// responsible for only invoking this between fan-outs.
    pub async fn evict_stale(&self, live_nodes: &[String]) {
        let mut nodes = self.nodes.write().await;
        nodes.retain(|name, _| live_nodes.contains(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        for _ in 0..4 {
            assert_eq!(breaker.admit("node-a").await, Admission::Allowed);
            breaker.record("node-a", false).await;
        }
        assert_eq!(breaker.state("node-a").await, BreakerState::Closed);

        assert_eq!(breaker.admit("node-a").await, Admission::Allowed);
        breaker.record("node-a", false).await;
        assert_eq!(breaker.state("node-a").await, BreakerState::Open);

        assert_eq!(breaker.admit("node-a").await, Admission::Refused);
    }

    #[tokio::test]
    async fn half_open_probe_success_resets_to_closed() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        assert_eq!(breaker.admit("node-b").await, Admission::Allowed);
        breaker.record("node-b", false).await;
        assert_eq!(breaker.state("node-b").await, BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(breaker.admit("node-b").await, Admission::Allowed);
        assert_eq!(breaker.state("node-b").await, BreakerState::HalfOpen);
        breaker.record("node-b", true).await;
        assert_eq!(breaker.state("node-b").await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens_with_fresh_cooldown() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.admit("node-c").await;
        breaker.record("node-c", false).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        breaker.admit("node-c").await;
        breaker.record("node-c", false).await;

        assert_eq!(breaker.state("node-c").await, BreakerState::Open);
        assert_eq!(breaker.admit("node-c").await, Admission::Refused);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failure_counter() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record("node-d", false).await;
        breaker.record("node-d", false).await;
        breaker.record("node-d", true).await;
        breaker.record("node-d", false).await;
        breaker.record("node-d", false).await;
        assert_eq!(breaker.state("node-d").await, BreakerState::Closed);
    }
}
