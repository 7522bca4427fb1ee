//! Tool registration: wires the five diagnostic operations to either the
//! native handlers (agent mode) or the gateway's fan-out router (gateway
//! mode), classified as local or proxied. Both registries implement
//! `gpudiag_transport::ToolDispatch`, so the HTTP and stdio transports are
//! unaware of which mode is running underneath them.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use gpudiag_core::tools::{self, ClusterContext, ClusterError, NodeDescription, PodGpuAllocation, ToolFailure};
use gpudiag_core::DeviceInterface;
use gpudiag_dispatch::router::aggregate_inventory;
use gpudiag_dispatch::Router;
use gpudiag_transport::http::ReadinessCheck;
use gpudiag_transport::jsonrpc::{ToolCallOutcome, ToolDescriptor, ToolDispatch};

pub const GET_GPU_INVENTORY: &str = "get_gpu_inventory";
pub const GET_GPU_HEALTH: &str = "get_gpu_health";
pub const ANALYZE_XID_ERRORS: &str = "analyze_xid_errors";
pub const DESCRIBE_NODE: &str = "describe_gpu_node";
pub const GET_POD_GPU_ALLOCATION: &str = "get_pod_gpu_allocation";

fn no_args_schema() -> Value {
    json!({"type": "object", "properties": {}, "additionalProperties": false})
}

fn node_scoped_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "node_name": {"type": "string", "description": "RFC 1123 DNS subdomain name of the node"},
        },
        "required": ["node_name"],
        "additionalProperties": false,
    })
}

fn pod_allocation_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "node_name": {"type": "string", "description": "RFC 1123 DNS subdomain name of the node"},
            "namespace": {"type": "string", "description": "restrict to this namespace; empty means all"},
        },
        "required": ["node_name"],
        "additionalProperties": false,
    })
}

fn tool_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: GET_GPU_INVENTORY.to_string(),
            description: "GPU inventory with live telemetry for every locally visible device".to_string(),
            input_schema: no_args_schema(),
        },
        ToolDescriptor {
            name: GET_GPU_HEALTH.to_string(),
            description: "Per-GPU health score derived from temperature, memory, power, throttle, and ECC state".to_string(),
            input_schema: no_args_schema(),
        },
        ToolDescriptor {
            name: ANALYZE_XID_ERRORS.to_string(),
            description: "Parse the kernel log for NVRM Xid events and join them against live GPU identity".to_string(),
            input_schema: no_args_schema(),
        },
        ToolDescriptor {
            name: DESCRIBE_NODE.to_string(),
            description: "Node labels/taints/conditions/capacity plus local GPU health and scheduled pods".to_string(),
            input_schema: node_scoped_schema(),
        },
        ToolDescriptor {
            name: GET_POD_GPU_ALLOCATION.to_string(),
            description: "Pods on a node that request the NVIDIA GPU resource, with per-container allocation".to_string(),
            input_schema: pod_allocation_schema(),
        },
    ]
}

fn outcome_from_tool_result(result: tools::ToolOutcome) -> ToolCallOutcome {
    match result {
        Ok(document) => ToolCallOutcome::ok(document),
        Err(ToolFailure::Validation(message)) => ToolCallOutcome::error_text(message),
        Err(ToolFailure::Cancelled) => {
            ToolCallOutcome::error_document(json!({"status": "error", "error": "operation cancelled"}))
        }
        Err(ToolFailure::Operational { error, hint }) => {
            ToolCallOutcome::error_document(json!({"status": "error", "error": error, "hint": hint}))
        }
    }
}

fn missing_node_name() -> ToolCallOutcome {
    ToolCallOutcome::error_text("invalid node_name: argument is required".to_string())
}

fn node_name_arg(arguments: &Value) -> Option<&str> {
    arguments.get("node_name").and_then(|v| v.as_str())
}

/// `ClusterContext` stand-in for processes started without reachable
/// cluster credentials (e.g. local development outside a cluster). Every
/// call reports `Unavailable` rather than panicking the whole process —
/// only `describe_gpu_node`/`get_pod_gpu_allocation` ever observe it.
pub struct UnavailableCluster;

#[async_trait]
impl ClusterContext for UnavailableCluster {
    async fn describe_node(
        &self,
        _node_name: &str,
        _token: &CancellationToken,
    ) -> Result<NodeDescription, ClusterError> {
        Err(ClusterError::Unavailable(
            "no Kubernetes client configured for this process".to_string(),
        ))
    }

    async fn list_gpu_pods_on_node(
        &self,
        _node_name: &str,
        _namespace: Option<&str>,
        _token: &CancellationToken,
    ) -> Result<Vec<PodGpuAllocation>, ClusterError> {
        Err(ClusterError::Unavailable(
            "no Kubernetes client configured for this process".to_string(),
        ))
    }
}

/// Agent-mode dispatch: every operation runs locally against the hardware
/// abstraction (and, for the two cluster-facing tools, this agent's own
/// `ClusterContext`).
pub struct AgentRegistry {
    devices: Arc<dyn DeviceInterface>,
    cluster: Arc<dyn ClusterContext>,
}

impl AgentRegistry {
    pub fn new(devices: Arc<dyn DeviceInterface>, cluster: Arc<dyn ClusterContext>) -> Self {
        Self { devices, cluster }
    }
}

#[async_trait]
impl ToolDispatch for AgentRegistry {
    fn list_tools(&self) -> Vec<ToolDescriptor> {
        tool_descriptors()
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        _correlation_id: &str,
        token: &CancellationToken,
    ) -> ToolCallOutcome {
        match name {
            GET_GPU_INVENTORY => outcome_from_tool_result(tools::get_gpu_inventory(&self.devices, token).await),
            GET_GPU_HEALTH => outcome_from_tool_result(tools::get_gpu_health(&self.devices, token).await),
            ANALYZE_XID_ERRORS => outcome_from_tool_result(tools::analyze_xid_errors(&self.devices, token).await),
            DESCRIBE_NODE => match node_name_arg(&arguments) {
                Some(node_name) => outcome_from_tool_result(
                    tools::describe_node(&self.devices, &self.cluster, token, node_name).await,
                ),
                None => missing_node_name(),
            },
            GET_POD_GPU_ALLOCATION => match node_name_arg(&arguments) {
                Some(node_name) => {
                    let namespace = arguments.get("namespace").and_then(|v| v.as_str());
                    outcome_from_tool_result(
                        tools::get_pod_gpu_allocation(&self.cluster, token, node_name, namespace).await,
                    )
                }
                None => missing_node_name(),
            },
            other => ToolCallOutcome::error_text(format!("unknown tool: {other}")),
        }
    }
}

#[async_trait]
impl ReadinessCheck for AgentRegistry {
    async fn is_ready(&self) -> bool {
        let token = CancellationToken::new();
        self.devices.device_count(&token).await.is_ok()
    }
}

/// Gateway-mode dispatch: cluster-wide operations (`get_gpu_inventory`,
/// `get_gpu_health`, `analyze_xid_errors`) fan out to every ready agent;
/// node-scoped operations (`describe_gpu_node`, `get_pod_gpu_allocation`)
/// are routed to the single agent owning the requested node.
pub struct GatewayRegistry {
    router: Arc<Router>,
}

impl GatewayRegistry {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl ToolDispatch for GatewayRegistry {
    fn list_tools(&self) -> Vec<ToolDescriptor> {
        tool_descriptors()
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        _correlation_id: &str,
        token: &CancellationToken,
    ) -> ToolCallOutcome {
        match name {
            GET_GPU_INVENTORY => {
                let result = self.router.fan_out(name, arguments, token).await;
                ToolCallOutcome::ok(aggregate_inventory(&result))
            }
            GET_GPU_HEALTH | ANALYZE_XID_ERRORS => {
                let result = self.router.fan_out(name, arguments, token).await;
                let is_error = result.success_count == 0 && result.node_count > 0;
                let document = serde_json::to_value(&result).unwrap_or(Value::Null);
                if is_error {
                    ToolCallOutcome::error_document(document)
                } else {
                    ToolCallOutcome::ok(document)
                }
            }
            DESCRIBE_NODE | GET_POD_GPU_ALLOCATION => match node_name_arg(&arguments) {
                Some(node_name) => {
                    match self.router.call_node(node_name, name, arguments.clone(), token).await {
                        Ok(result) => ToolCallOutcome {
                            document: result.document,
                            is_error: result.is_error,
                        },
                        Err(e) => ToolCallOutcome::error_document(json!({"status": "error", "error": e})),
                    }
                }
                None => missing_node_name(),
            },
            other => ToolCallOutcome::error_text(format!("unknown tool: {other}")),
        }
    }
}

#[async_trait]
impl ReadinessCheck for GatewayRegistry {
    async fn is_ready(&self) -> bool {
        true
    }
}

/// Readiness over the raw cluster client, used by the gateway before a
/// `Router` has discovered any agents yet.
pub struct ClusterReadiness {
    pub cluster: Arc<gpudiag_cluster::K8sClient>,
}

#[async_trait]
impl ReadinessCheck for ClusterReadiness {
    async fn is_ready(&self) -> bool {
        self.cluster.health_check().await.is_ok()
    }
}
