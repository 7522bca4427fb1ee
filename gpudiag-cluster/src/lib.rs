//! Kubernetes integration for the GPU diagnostics service.
//!
//! Read-only cluster primitives (agent discovery, node lookup, pod listing),
//! exec-in-pod streaming for the exec transport mode, and the
//! `ClusterContext` implementation tool handlers in `gpudiag-core` use to
//! reach the cluster API without depending on `kube` directly.

pub mod client;
pub mod describe;
pub mod exec;

pub use client::{AgentPod, K8sClient};
