//! `describe_node` tool handler.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::device::DeviceInterface;
use crate::health::{overall_score, score_device, worst_status};

use super::cluster_context::ClusterContext;
use super::{validate_node_name, ClusterError, ToolFailure, ToolOutcome};

/// Combines the node resource (labels/taints/conditions/capacity), the
/// local GPU inventory + health score, and the pods scheduled on the node,
/// run concurrently. A cluster-listing failure degrades the document to
/// `status: partial` rather than failing the whole tool.
pub async fn describe_node(
    devices: &Arc<dyn DeviceInterface>,
    cluster: &Arc<dyn ClusterContext>,
    token: &CancellationToken,
    node_name: &str,
) -> ToolOutcome {
    if token.is_cancelled() {
        return Err(ToolFailure::Cancelled);
    }
    validate_node_name(node_name)?;

    let (node_result, pods_result) = tokio::join!(
        cluster.describe_node(node_name, token),
        cluster.list_gpu_pods_on_node(node_name, None, token),
    );

    let node = node_result.map_err(|e| cluster_error_to_failure(node_name, e))?;

    let count = devices.device_count(token).await.unwrap_or(0);
    let mut gpus = Vec::with_capacity(count as usize);
    for index in 0..count {
        if let Ok(device) = devices.device_snapshot(index, token).await {
            gpus.push(score_device(&device));
        }
    }

    let (pods_json, pods_status) = match pods_result {
        Ok(pods) => {
            let total_gpu_requests: u64 = pods
                .iter()
                .flat_map(|p| p.containers.iter())
                .map(|c| c.gpu_request)
                .sum();
            (
                json!({
                    "pods": pods,
                    "total_gpu_requests": total_gpu_requests,
                }),
                "success",
            )
        }
        Err(e) => (
            json!({
                "pods": [],
                "total_gpu_requests": 0,
                "error": e.to_string(),
            }),
            "partial",
        ),
    };

    Ok(json!({
        "status": pods_status,
        "node_name": node.node_name,
        "labels": node.labels,
        "taints": node.taints,
        "conditions": node.conditions,
        "capacity": node.capacity,
        "allocatable": node.allocatable,
        "gpu_health": {
            "overall_status": worst_status(&gpus).to_string(),
            "overall_score": overall_score(&gpus),
            "gpus": gpus,
        },
        "workloads": pods_json,
    }))
}

fn cluster_error_to_failure(node_name: &str, e: ClusterError) -> ToolFailure {
    match e {
        ClusterError::NotFound(_) => ToolFailure::operational(
            format!("node {node_name} not found"),
            "verify the node name matches an existing cluster node",
        ),
        ClusterError::RbacDenied(msg) => ToolFailure::operational(
            format!("cluster API access denied: {msg}"),
            "grant the gateway's service account get/list permissions on nodes and pods",
        ),
        ClusterError::Cancelled => ToolFailure::Cancelled,
        other => ToolFailure::operational(
            other.to_string(),
            "check cluster API connectivity from the gateway",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevice;
    use crate::tools::cluster_context::{NodeDescription, PodGpuAllocation};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct FakeCluster {
        fail_pods: bool,
    }

    #[async_trait]
    impl ClusterContext for FakeCluster {
        async fn describe_node(
            &self,
            node_name: &str,
            _token: &CancellationToken,
        ) -> Result<NodeDescription, ClusterError> {
            Ok(NodeDescription {
                node_name: node_name.to_string(),
                labels: BTreeMap::new(),
                taints: vec![],
                conditions: BTreeMap::from([("Ready".to_string(), true)]),
                capacity: BTreeMap::new(),
                allocatable: BTreeMap::new(),
            })
        }

        async fn list_gpu_pods_on_node(
            &self,
            _node_name: &str,
            _namespace: Option<&str>,
            _token: &CancellationToken,
        ) -> Result<Vec<PodGpuAllocation>, ClusterError> {
            if self.fail_pods {
                Err(ClusterError::Unavailable("timed out".to_string()))
            } else {
                Ok(vec![])
            }
        }
    }

    #[tokio::test]
    async fn rejects_invalid_node_name() {
        let devices: Arc<dyn DeviceInterface> = Arc::new(MockDevice::new());
        let cluster: Arc<dyn ClusterContext> = Arc::new(FakeCluster { fail_pods: false });
        let token = CancellationToken::new();

        let result = describe_node(&devices, &cluster, &token, "../etc/passwd").await;
        assert!(matches!(result, Err(ToolFailure::Validation(_))));
    }

    #[tokio::test]
    async fn pod_listing_failure_degrades_to_partial() {
        let devices: Arc<dyn DeviceInterface> = Arc::new(MockDevice::new());
        let cluster: Arc<dyn ClusterContext> = Arc::new(FakeCluster { fail_pods: true });
        let token = CancellationToken::new();

        let result = describe_node(&devices, &cluster, &token, "gpu-node-1")
            .await
            .unwrap();
        assert_eq!(result["status"], json!("partial"));
    }
}
