//! GPU diagnostics core.
//!
//! Hardware abstraction, XID catalog/parser, health scoring, and the five
//! diagnostic tool handlers. Deliberately free of any Kubernetes client
//! dependency: cluster-facing handlers depend on the `ClusterContext` trait
//! in `tools`, implemented by `gpudiag-cluster`.

pub mod device;
pub mod health;
pub mod tools;
pub mod xid;

pub use device::{create_device_interface, BackendMode, DeviceError, DeviceInterface, GpuDevice};
pub use health::{GpuHealth, HealthStatus};
pub use tools::{ClusterContext, ToolFailure, ToolOutcome};
