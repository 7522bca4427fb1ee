//! `ClusterContext` implementation: node description + pod GPU allocation.

use k8s_openapi::api::core::v1::Pod;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use gpudiag_core::tools::{
    ClusterContext, ClusterError, ContainerGpuAllocation, NodeDescription, PodGpuAllocation,
    TaintInfo,
};

use crate::client::K8sClient;

const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";
/// Device-plugin-set pod annotation holding the comma-separated UUID list.
/// Pod-scoped, not container-scoped.
const GPU_UUID_ANNOTATION: &str = "nvidia.com/gpu.device";
const ALLOWED_LABEL_PREFIXES: &[&str] = &["nvidia.com/", "feature.node.kubernetes.io/"];

#[async_trait]
impl ClusterContext for K8sClient {
    async fn describe_node(
        &self,
        node_name: &str,
        token: &CancellationToken,
    ) -> Result<NodeDescription, ClusterError> {
        if token.is_cancelled() {
            return Err(ClusterError::Cancelled);
        }

        let node = self
            .get_node(node_name)
            .await
            .map_err(|e| classify_error(node_name, e))?;

        let labels = node
            .metadata
            .labels
            .unwrap_or_default()
            .into_iter()
            .filter(|(key, _)| ALLOWED_LABEL_PREFIXES.iter().any(|p| key.starts_with(p)))
            .collect();

        let taints = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|t| TaintInfo {
                key: t.key,
                value: t.value,
                effect: t.effect,
            })
            .collect();

        let conditions = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|c| (c.type_, c.status == "True"))
            .collect();

        let capacity = node
            .status
            .as_ref()
            .and_then(|s| s.capacity.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect();

        let allocatable = node
            .status
            .as_ref()
            .and_then(|s| s.allocatable.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect();

        Ok(NodeDescription {
            node_name: node_name.to_string(),
            labels,
            taints,
            conditions,
            capacity,
            allocatable,
        })
    }

    async fn list_gpu_pods_on_node(
        &self,
        node_name: &str,
        namespace: Option<&str>,
        token: &CancellationToken,
    ) -> Result<Vec<PodGpuAllocation>, ClusterError> {
        if token.is_cancelled() {
            return Err(ClusterError::Cancelled);
        }

        let pods = self
            .list_pods_on_node(node_name, namespace)
            .await
            .map_err(|e| classify_error(node_name, e))?;

        Ok(pods
            .iter()
            .filter_map(pod_to_allocation)
            .filter(|p| !p.containers.is_empty())
            .collect())
    }
}

fn pod_to_allocation(pod: &Pod) -> Option<PodGpuAllocation> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let node_name = pod.spec.as_ref()?.node_name.clone()?;
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());

    let gpu_uuids: Vec<String> = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(GPU_UUID_ANNOTATION))
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let gpu_containers: Vec<(String, u64, u64)> = pod
        .spec
        .as_ref()?
        .containers
        .iter()
        .filter_map(|c| {
            let resources = c.resources.as_ref()?;
            let request = resources
                .requests
                .as_ref()
                .and_then(|r| r.get(GPU_RESOURCE_NAME))
                .and_then(|q| q.0.parse::<u64>().ok())
                .unwrap_or(0);
            let limit = resources
                .limits
                .as_ref()
                .and_then(|r| r.get(GPU_RESOURCE_NAME))
                .and_then(|q| q.0.parse::<u64>().ok())
                .unwrap_or(0);
            if request == 0 && limit == 0 {
                None
            } else {
                Some((c.name.clone(), request, limit))
            }
        })
        .collect();

    // The device-plugin UUID annotation is pod-scoped; assign the whole
    // list to the first GPU-requesting container as a best-effort
    // approximation.
    let containers = gpu_containers
        .into_iter()
        .enumerate()
        .map(|(i, (name, gpu_request, gpu_limit))| ContainerGpuAllocation {
            name,
            gpu_request,
            gpu_limit,
            gpu_uuids: if i == 0 { gpu_uuids.clone() } else { Vec::new() },
        })
        .collect();

    Some(PodGpuAllocation {
        name,
        namespace,
        phase,
        node_name,
        containers,
    })
}

fn classify_error(node_name: &str, e: anyhow::Error) -> ClusterError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("404") || lower.contains("not found") {
        ClusterError::NotFound(node_name.to_string())
    } else if lower.contains("403") || lower.contains("forbidden") {
        ClusterError::RbacDenied(msg)
    } else {
        ClusterError::Unavailable(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn gpu_container(name: &str, request: &str) -> Container {
        let mut requests = BTreeMap::new();
        requests.insert(GPU_RESOURCE_NAME.to_string(), Quantity(request.to_string()));
        Container {
            name: name.to_string(),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn assigns_uuids_to_first_gpu_container_only() {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "nvidia.com/gpu.device".to_string(),
            "GPU-aaa,GPU-bbb".to_string(),
        );

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("trainer-0".to_string()),
                namespace: Some("ml".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("gpu-node-1".to_string()),
                containers: vec![gpu_container("trainer", "2"), gpu_container("sidecar", "1")],
                ..Default::default()
            }),
            status: None,
        };

        let allocation = pod_to_allocation(&pod).unwrap();
        assert_eq!(allocation.containers.len(), 2);
        assert_eq!(allocation.containers[0].gpu_uuids, vec!["GPU-aaa", "GPU-bbb"]);
        assert!(allocation.containers[1].gpu_uuids.is_empty());
    }

    #[test]
    fn non_gpu_pod_has_no_containers() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("gpu-node-1".to_string()),
                containers: vec![Container {
                    name: "web".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        };

        let allocation = pod_to_allocation(&pod).unwrap();
        assert!(allocation.containers.is_empty());
    }
}
