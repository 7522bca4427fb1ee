//! Kubernetes client wrapper.
//!
//! Read-only primitives over the cluster API: agent pod discovery, node
//! lookup, pod listing. No mutation surface.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams};
use kube::{Client, Config};
use tracing::info;

/// A discovered agent pod: node identity plus what's needed to reach it.
#[derive(Debug, Clone)]
pub struct AgentPod {
    pub node_name: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_ip: Option<String>,
    pub ready: bool,
}

impl AgentPod {
    /// `http://<pod-ip>:<agent-port>`, or `None` if no IP has been assigned
    /// yet (pod still pending).
    pub fn endpoint(&self, agent_port: u16) -> Option<String> {
        self.pod_ip
            .as_ref()
            .map(|ip| format!("http://{ip}:{agent_port}"))
    }
}

pub struct K8sClient {
    client: Client,
    namespace: String,
    agent_label_name: String,
}

impl K8sClient {
    /// Create a client using in-cluster config (or `~/.kube/config` outside
    /// a cluster), scoped to `namespace` and discovering agents by
    /// `app.kubernetes.io/name=<agent_label_name>`.
    pub async fn new(namespace: String, agent_label_name: String) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("failed to create Kubernetes client")?;

        info!(namespace = %namespace, "connected to Kubernetes API server");
        Ok(Self {
            client,
            namespace,
            agent_label_name,
        })
    }

    pub async fn with_config(
        config: Config,
        namespace: String,
        agent_label_name: String,
    ) -> Result<Self> {
        let client = Client::try_from(config)
            .context("failed to create Kubernetes client from config")?;
        Ok(Self {
            client,
            namespace,
            agent_label_name,
        })
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn agent_pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// List every agent pod in the configured namespace. The
    /// `component!=gateway` negation is load-bearing: without it the
    /// gateway, which shares the same `app.kubernetes.io/name` label as its
    /// agents, would discover and try to proxy to itself.
    pub async fn list_agent_pods(&self) -> Result<Vec<AgentPod>> {
        let selector = format!(
            "app.kubernetes.io/name={},app.kubernetes.io/component!=gateway",
            self.agent_label_name
        );
        let params = ListParams::default().labels(&selector);

        let pods = self
            .agent_pods()
            .list(&params)
            .await
            .context("failed to list agent pods")?;

        Ok(pods.items.iter().filter_map(pod_to_agent_pod).collect())
    }

    /// Find the agent pod scheduled on `node_name`, if any.
    pub async fn get_agent_pod(&self, node_name: &str) -> Result<Option<AgentPod>> {
        Ok(self
            .list_agent_pods()
            .await?
            .into_iter()
            .find(|p| p.node_name == node_name))
    }

    pub async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes()
            .get(name)
            .await
            .with_context(|| format!("failed to get node: {name}"))
    }

    /// Pods with `spec.nodeName == node_name`, optionally restricted to
    /// `namespace`.
    pub async fn list_pods_on_node(&self, node_name: &str, namespace: Option<&str>) -> Result<Vec<Pod>> {
        let params =
            ListParams::default().fields(&format!("spec.nodeName={node_name}"));

        let api: Api<Pod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        let pods = api
            .list(&params)
            .await
            .with_context(|| format!("failed to list pods on node: {node_name}"))?;

        Ok(pods.items)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _ = self
            .nodes()
            .list(&ListParams::default().limit(1))
            .await
            .context("failed to list nodes")?;
        Ok(())
    }
}

fn pod_to_agent_pod(pod: &Pod) -> Option<AgentPod> {
    let node_name = pod.spec.as_ref()?.node_name.clone()?;
    let pod_name = pod.metadata.name.clone()?;
    let pod_namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());
    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    Some(AgentPod {
        node_name,
        pod_name,
        pod_namespace,
        pod_ip,
        ready,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodSpec, PodStatus};
    use kube::api::ObjectMeta;

    fn pod_fixture(node_name: &str, ready: bool, ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("gpudiag-agent-abc".to_string()),
                namespace: Some("gpudiag".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node_name.to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: ip.map(|s| s.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn converts_ready_pod_with_ip() {
        let pod = pod_fixture("gpu-node-1", true, Some("10.0.0.5"));
        let agent = pod_to_agent_pod(&pod).unwrap();
        assert_eq!(agent.node_name, "gpu-node-1");
        assert!(agent.ready);
        assert_eq!(agent.endpoint(9100), Some("http://10.0.0.5:9100".to_string()));
    }

    #[test]
    fn pod_without_ip_has_no_endpoint() {
        let pod = pod_fixture("gpu-node-2", false, None);
        let agent = pod_to_agent_pod(&pod).unwrap();
        assert!(!agent.ready);
        assert_eq!(agent.endpoint(9100), None);
    }

    #[test]
    fn pod_without_node_name_is_skipped() {
        let mut pod = pod_fixture("gpu-node-3", true, Some("10.0.0.6"));
        pod.spec.as_mut().unwrap().node_name = None;
        assert!(pod_to_agent_pod(&pod).is_none());
    }
}
