//! Gateway fan-out: turns one client invocation into concurrent per-node
//! calls and recombines the results.
//!
//! Grounded on the tick-dispatch-then-aggregate shape of `scheduler.rs`
//! (there: tiered detection tickers; here: one bounded fan-out per inbound
//! proxied call) using `futures::stream::FuturesUnordered` for the
//! concurrent collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use gpudiag_cluster::{AgentPod, K8sClient};

use crate::breaker::{Admission, CircuitBreaker};
use crate::metrics::{observe_dispatch, set_breaker_state, set_node_reachable, CallOutcome, Transport};
use crate::transport_client::{AgentToolResult, RoutingMode, TransportClient};

/// Whether an operation is handled in-process or forwarded to every agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Local,
    Proxied,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum NodeOutcome {
    Success { result: Value, is_error: bool },
    Error { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeResult {
    pub node_name: String,
    pub pod_name: String,
    pub transport: &'static str,
    #[serde(flatten)]
    outcome: NodeOutcome,
}

impl NodeResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, NodeOutcome::Success { .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            NodeOutcome::Success { result, .. } => Some(result),
            NodeOutcome::Error { .. } => None,
        }
    }

    /// Whether the agent reported this tool invocation as a tool-level
    /// error (`isError: true`). `false` for a node that never answered at
    /// all — check [`NodeResult::is_success`] for that.
    pub fn is_tool_error(&self) -> bool {
        match &self.outcome {
            NodeOutcome::Success { is_error, .. } => *is_error,
            NodeOutcome::Error { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatedResult {
    pub status: String,
    pub node_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub nodes: Vec<NodeResult>,
}

fn transport_label(mode: RoutingMode) -> (&'static str, Transport) {
    match mode {
        RoutingMode::Http => ("http", Transport::Http),
        RoutingMode::Exec => ("exec", Transport::Exec),
    }
}

fn node_error(agent: &AgentPod, transport: &'static str, message: impl Into<String>) -> NodeResult {
    NodeResult {
        node_name: agent.node_name.clone(),
        pod_name: agent.pod_name.clone(),
        transport,
        outcome: NodeOutcome::Error {
            error: message.into(),
        },
    }
}

fn node_success(agent: &AgentPod, transport: &'static str, result: Value, is_error: bool) -> NodeResult {
    NodeResult {
        node_name: agent.node_name.clone(),
        pod_name: agent.pod_name.clone(),
        transport,
        outcome: NodeOutcome::Success { result, is_error },
    }
}

fn aggregate(nodes: Vec<NodeResult>) -> AggregatedResult {
    let success_count = nodes.iter().filter(|n| n.is_success()).count();
    let error_count = nodes.len() - success_count;

    let status = if nodes.is_empty() {
        "error".to_string()
    } else if error_count == 0 {
        "success".to_string()
    } else if success_count == 0 {
        "error".to_string()
    } else {
        "partial".to_string()
    };

    AggregatedResult {
        status,
        node_count: nodes.len(),
        success_count,
        error_count,
        nodes,
    }
}

/// Fans proxied tool calls out to every ready agent pod under a bounded
/// concurrency cap and a per-node circuit breaker.
pub struct Router {
    cluster: Arc<K8sClient>,
    breaker: Arc<CircuitBreaker>,
    transport: Arc<TransportClient>,
    routing_mode: RoutingMode,
    max_concurrency: usize,
}

impl Router {
    pub fn new(
        cluster: Arc<K8sClient>,
        transport: Arc<TransportClient>,
        routing_mode: RoutingMode,
        max_concurrency: usize,
        breaker_threshold: u32,
        breaker_cooldown: Duration,
    ) -> Self {
        Self {
            cluster,
            breaker: Arc::new(CircuitBreaker::new(breaker_threshold, breaker_cooldown)),
            transport,
            routing_mode,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Proxy `method(params)` to every ready agent pod, bounded by
    /// `max_concurrency` in-flight calls, and aggregate the outcomes.
    pub async fn fan_out(
        &self,
        method: &str,
        params: Value,
        token: &CancellationToken,
    ) -> AggregatedResult {
        let correlation_id = Uuid::new_v4().to_string();

        let agents = match self.cluster.list_agent_pods().await {
            Ok(agents) => agents.into_iter().filter(|a| a.ready).collect::<Vec<_>>(),
            Err(e) => {
                warn!(error = %e, "agent discovery failed, fan-out aborted");
                return aggregate(vec![]);
            }
        };

        let live_names: Vec<String> = agents.iter().map(|a| a.node_name.clone()).collect();
        self.breaker.evict_stale(&live_names).await;

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut in_flight = FuturesUnordered::new();

        for agent in agents {
            if token.is_cancelled() {
                break;
            }

            let semaphore = semaphore.clone();
            let breaker = self.breaker.clone();
            let transport = self.transport.clone();
            let cluster = self.cluster.clone();
            let method = method.to_string();
            let params = params.clone();
            let correlation_id = correlation_id.clone();
            let token = token.clone();
            let routing_mode = self.routing_mode;
            let (transport_name, transport_metric) = transport_label(routing_mode);

            in_flight.push(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return node_error(&agent, transport_name, "dispatch shutting down"),
                };

                if token.is_cancelled() {
                    return node_error(&agent, transport_name, "operation cancelled");
                }

                match breaker.admit(&agent.node_name).await {
                    Admission::Refused => {
                        observe_dispatch(&agent.node_name, transport_metric, CallOutcome::BreakerRefused, 0.0);
                        node_error(&agent, transport_name, "breaker open")
                    }
                    Admission::Allowed => {
                        let cluster_for_call = match routing_mode {
                            RoutingMode::Exec => Some(cluster.as_ref()),
                            RoutingMode::Http => None,
                        };

                        let result = transport
                            .call(
                                routing_mode,
                                &agent,
                                cluster_for_call,
                                &method,
                                params,
                                &correlation_id,
                                &token,
                            )
                            .await;

                        let success = result.is_ok();
                        breaker.record(&agent.node_name, success).await;
                        set_breaker_state(&agent.node_name, breaker.state(&agent.node_name).await);
                        set_node_reachable(&agent.node_name, success);

                        match result {
                            Ok(AgentToolResult { document, is_error }) => {
                                node_success(&agent, transport_name, document, is_error)
                            }
                            Err(e) => {
                                debug!(node = %agent.node_name, error = %e, "proxied call failed");
                                node_error(&agent, transport_name, e.to_string())
                            }
                        }
                    }
                }
            });
        }

        let mut nodes = Vec::new();
        while let Some(result) = in_flight.next().await {
            nodes.push(result);
        }

        aggregate(nodes)
    }

    /// Proxy `method(params)` to the single agent owning `node_name`, for
    /// the node-scoped operations (`describe_node`, `get_pod_gpu_allocation`)
    /// that target one node rather than fanning out to all of them.
    pub async fn call_node(
        &self,
        node_name: &str,
        method: &str,
        params: Value,
        token: &CancellationToken,
    ) -> Result<AgentToolResult, String> {
        if token.is_cancelled() {
            return Err("operation cancelled".to_string());
        }

        let agents = self
            .cluster
            .list_agent_pods()
            .await
            .map_err(|e| e.to_string())?;
        let agent = agents
            .into_iter()
            .find(|a| a.node_name == node_name && a.ready)
            .ok_or_else(|| format!("no ready agent pod found for node {node_name}"))?;

        let (transport_name, transport_metric) = transport_label(self.routing_mode);
        let _ = transport_name;

        match self.breaker.admit(&agent.node_name).await {
            Admission::Refused => {
                observe_dispatch(&agent.node_name, transport_metric, CallOutcome::BreakerRefused, 0.0);
                Err("breaker open".to_string())
            }
            Admission::Allowed => {
                let cluster_for_call = match self.routing_mode {
                    RoutingMode::Exec => Some(self.cluster.as_ref()),
                    RoutingMode::Http => None,
                };

                let correlation_id = Uuid::new_v4().to_string();
                let result = self
                    .transport
                    .call(
                        self.routing_mode,
                        &agent,
                        cluster_for_call,
                        method,
                        params,
                        &correlation_id,
                        token,
                    )
                    .await;

                let success = result.is_ok();
                self.breaker.record(&agent.node_name, success).await;
                set_breaker_state(&agent.node_name, self.breaker.state(&agent.node_name).await);
                set_node_reachable(&agent.node_name, success);

                result.map_err(|e| e.to_string())
            }
        }
    }
}

/// Combine per-node `get_gpu_inventory` results into a cluster-wide
/// summary: total node/GPU counts, per-model counts, and the full
/// per-node device array.
pub fn aggregate_inventory(result: &AggregatedResult) -> Value {
    let mut total_gpus: u64 = 0;
    let mut model_counts: HashMap<String, u64> = HashMap::new();

    for node in &result.nodes {
        if let Some(devices) = node
            .result()
            .and_then(|r| r.get("devices"))
            .and_then(|d| d.as_array())
        {
            total_gpus += devices.len() as u64;
            for device in devices {
                if let Some(name) = device.get("name").and_then(|n| n.as_str()) {
                    *model_counts.entry(name.to_string()).or_insert(0) += 1;
                }
            }
        }
    }

    json!({
        "status": result.status,
        "total_nodes": result.node_count,
        "total_gpus": total_gpus,
        "gpu_model_counts": model_counts,
        "success_count": result.success_count,
        "error_count": result.error_count,
        "nodes": result.nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str) -> AgentPod {
        AgentPod {
            node_name: name.to_string(),
            pod_name: format!("{name}-agent"),
            pod_namespace: "gpu-diagnostics".to_string(),
            pod_ip: Some("10.0.0.1".to_string()),
            ready: true,
        }
    }

    #[test]
    fn aggregate_status_all_success() {
        let nodes = vec![
            node_success(&agent("a"), "http", json!({"ok": true}), false),
            node_success(&agent("b"), "http", json!({"ok": true}), false),
        ];
        let result = aggregate(nodes);
        assert_eq!(result.status, "success");
        assert_eq!(result.success_count, 2);
        assert_eq!(result.error_count, 0);
    }

    #[test]
    fn aggregate_status_partial_on_mixed_outcomes() {
        let nodes = vec![
            node_success(&agent("a"), "http", json!({"ok": true}), false),
            node_error(&agent("b"), "http", "timed out"),
        ];
        let result = aggregate(nodes);
        assert_eq!(result.status, "partial");
        assert_eq!(result.success_count, 1);
        assert_eq!(result.error_count, 1);
    }

    #[test]
    fn aggregate_status_error_when_all_fail() {
        let nodes = vec![node_error(&agent("a"), "http", "timed out")];
        let result = aggregate(nodes);
        assert_eq!(result.status, "error");
    }

    #[test]
    fn every_attempted_node_appears_exactly_once() {
        let nodes = vec![
            node_success(&agent("a"), "http", json!({}), false),
            node_error(&agent("b"), "http", "x"),
        ];
        let result = aggregate(nodes);
        assert_eq!(result.node_count, 2);
        let names: Vec<&str> = result.nodes.iter().map(|n| n.node_name.as_str()).collect();
        assert!(names.contains(&"a"));
        assert!(names.contains(&"b"));
    }

    #[test]
    fn node_result_exposes_tool_level_is_error() {
        let success = node_success(&agent("a"), "http", json!({"status": "error"}), true);
        assert!(success.is_success());
        assert!(success.is_tool_error());

        let failure = node_error(&agent("b"), "http", "timed out");
        assert!(!failure.is_tool_error());
    }

    #[test]
    fn aggregate_inventory_sums_devices_and_models() {
        let nodes = vec![
            node_success(
                &agent("a"),
                "http",
                json!({"devices": [{"name": "NVIDIA A100-SXM4-40GB"}]}),
                false,
            ),
            node_success(
                &agent("b"),
                "http",
                json!({"devices": [{"name": "NVIDIA A100-SXM4-40GB"}, {"name": "NVIDIA H100"}]}),
                false,
            ),
        ];
        let result = aggregate(nodes);
        let summary = aggregate_inventory(&result);
        assert_eq!(summary["total_gpus"], json!(3));
        assert_eq!(summary["gpu_model_counts"]["NVIDIA A100-SXM4-40GB"], json!(2));
    }

    #[test]
    fn aggregate_inventory_unwraps_the_real_agent_tool_result_shape() {
        use crate::transport_client::{extract_tool_result, AgentToolResult};

        let envelope = json!({
            "jsonrpc": "2.0",
            "id": "corr-1",
            "result": {
                "content": [{
                    "type": "text",
                    "text": "{\"devices\":[{\"name\":\"NVIDIA A100-SXM4-40GB\"}]}",
                }],
                "isError": false,
            },
        });
        let AgentToolResult { document, is_error } = extract_tool_result(&envelope).unwrap();
        assert!(!is_error);

        let nodes = vec![node_success(&agent("a"), "http", document, is_error)];
        let result = aggregate(nodes);
        let summary = aggregate_inventory(&result);
        assert_eq!(summary["total_gpus"], json!(1));
    }
}
