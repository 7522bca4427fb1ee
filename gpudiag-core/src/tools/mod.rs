//! Diagnostic tool handlers.
//!
//! Each handler has the shape `(context, cancellation token, arguments) ->
//! Result<Value, ToolFailure>`. A `ToolFailure` never becomes a JSON-RPC
//! protocol error; it's shaped into an `isError` tool result one layer up,
//! in `gpudiag-transport`.

mod cluster_context;
mod describe_node;
mod health;
mod inventory;
mod pod_allocation;
mod validation;
mod xid;

pub use cluster_context::{
    ClusterContext, ClusterError, ContainerGpuAllocation, NodeDescription, PodGpuAllocation,
    TaintInfo,
};
pub use describe_node::describe_node;
pub use health::get_gpu_health;
pub use inventory::get_gpu_inventory;
pub use pod_allocation::get_pod_gpu_allocation;
pub use validation::validate_node_name;
pub use xid::analyze_xid_errors;

/// A tool-level failure. Never surfaces as a JSON-RPC `error` object; the
/// transport layer renders it as a tool result with `isError: true`.
#[derive(Debug, Clone)]
pub enum ToolFailure {
    /// Malformed arguments — plain text message, no JSON document.
    Validation(String),
    /// RBAC denied, kernel buffer unreadable, agent unreachable, etc. —
    /// rendered as `{status: "error", error, hint}`.
    Operational { error: String, hint: String },
    /// The supplied cancellation token had already fired.
    Cancelled,
}

impl ToolFailure {
    pub fn operational(error: impl Into<String>, hint: impl Into<String>) -> Self {
        ToolFailure::Operational {
            error: error.into(),
            hint: hint.into(),
        }
    }
}

pub type ToolOutcome = Result<serde_json::Value, ToolFailure>;
