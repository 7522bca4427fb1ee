//! Seam between tool handlers and the Kubernetes-shaped cluster client.
//!
//! `gpudiag-core` has no `kube` dependency; `describe_node` and
//! `get_pod_gpu_allocation` need cluster metadata, so they depend on this
//! trait instead of a concrete client. `gpudiag-cluster` provides the real
//! implementation; tests provide a fake one.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone)]
pub enum ClusterError {
    #[error("node not found: {0}")]
    NotFound(String),

    #[error("cluster API access denied: {0}")]
    RbacDenied(String),

    #[error("cluster API unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaintInfo {
    pub key: String,
    pub value: Option<String>,
    pub effect: String,
}

/// Everything `describe_node` needs about the node resource itself, before
/// the local GPU snapshot and pod listing are folded in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescription {
    pub node_name: String,
    /// GPU-related labels only (prefix allow-list), not the full label set.
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<TaintInfo>,
    /// Condition type -> true/false, e.g. "Ready" -> true.
    pub conditions: BTreeMap<String, bool>,
    pub capacity: BTreeMap<String, String>,
    pub allocatable: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerGpuAllocation {
    pub name: String,
    pub gpu_request: u64,
    pub gpu_limit: u64,
    /// Best-effort: the pod's device-plugin UUID annotation assigned to the
    /// first GPU-requesting container in the pod.
    pub gpu_uuids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodGpuAllocation {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub node_name: String,
    pub containers: Vec<ContainerGpuAllocation>,
}

/// Cluster-facing primitives tool handlers need, independent of the
/// Kubernetes client crate that implements them.
#[async_trait]
pub trait ClusterContext: Send + Sync {
    async fn describe_node(
        &self,
        node_name: &str,
        token: &CancellationToken,
    ) -> Result<NodeDescription, ClusterError>;

    /// Pods with `spec.nodeName == node_name` that request the NVIDIA GPU
    /// resource, optionally restricted to `namespace`.
    async fn list_gpu_pods_on_node(
        &self,
        node_name: &str,
        namespace: Option<&str>,
        token: &CancellationToken,
    ) -> Result<Vec<PodGpuAllocation>, ClusterError>;
}
