//! `get_pod_gpu_allocation` tool handler.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::cluster_context::ClusterContext;
use super::{validate_node_name, ClusterError, ToolFailure, ToolOutcome};

pub async fn get_pod_gpu_allocation(
    cluster: &Arc<dyn ClusterContext>,
    token: &CancellationToken,
    node_name: &str,
    namespace: Option<&str>,
) -> ToolOutcome {
    if token.is_cancelled() {
        return Err(ToolFailure::Cancelled);
    }
    validate_node_name(node_name)?;

    let pods = cluster
        .list_gpu_pods_on_node(node_name, namespace, token)
        .await
        .map_err(|e| match e {
            ClusterError::NotFound(_) => ToolFailure::operational(
                format!("node {node_name} not found"),
                "verify the node name matches an existing cluster node",
            ),
            ClusterError::RbacDenied(msg) => ToolFailure::operational(
                format!("cluster API access denied: {msg}"),
                "apply the RBAC manifest granting the gateway's service account list access on pods",
            ),
            ClusterError::Cancelled => ToolFailure::Cancelled,
            other => ToolFailure::operational(
                other.to_string(),
                "check cluster API connectivity from the gateway",
            ),
        })?;

    let total_gpu_requests: u64 = pods
        .iter()
        .flat_map(|p| p.containers.iter())
        .map(|c| c.gpu_request)
        .sum();

    Ok(json!({
        "status": "success",
        "node_name": node_name,
        "pod_count": pods.len(),
        "total_gpu_requests": total_gpu_requests,
        "pods": pods,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::cluster_context::{ContainerGpuAllocation, NodeDescription, PodGpuAllocation};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct FakeCluster;

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
                conditions: BTreeMap::new(),
                capacity: BTreeMap::new(),
                allocatable: BTreeMap::new(),
            })
        }

        async fn list_gpu_pods_on_node(
            &self,
            node_name: &str,
            _namespace: Option<&str>,
            _token: &CancellationToken,
        ) -> Result<Vec<PodGpuAllocation>, ClusterError> {
            Ok(vec![PodGpuAllocation {
                name: "training-job-0".to_string(),
                namespace: "ml".to_string(),
                phase: "Running".to_string(),
                node_name: node_name.to_string(),
                containers: vec![ContainerGpuAllocation {
                    name: "trainer".to_string(),
                    gpu_request: 2,
                    gpu_limit: 2,
                    gpu_uuids: vec!["GPU-0000".to_string(), "GPU-0001".to_string()],
                }],
            }])
        }
    }

    #[tokio::test]
    async fn rejects_path_traversal_in_node_name() {
        let cluster: Arc<dyn ClusterContext> = Arc::new(FakeCluster);
        let token = CancellationToken::new();

        let result = get_pod_gpu_allocation(&cluster, &token, "../etc/passwd", None).await;
        match result {
            Err(ToolFailure::Validation(msg)) => assert!(msg.contains("invalid node_name")),
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sums_gpu_requests_across_pods() {
        let cluster: Arc<dyn ClusterContext> = Arc::new(FakeCluster);
        let token = CancellationToken::new();

        let result = get_pod_gpu_allocation(&cluster, &token, "gpu-node-1", None)
            .await
            .unwrap();
        assert_eq!(result["total_gpu_requests"], json!(2));
        assert_eq!(result["pod_count"], json!(1));
    }
}
