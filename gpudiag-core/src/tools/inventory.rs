//! `get_gpu_inventory` tool handler.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::DeviceInterface;

use super::{ToolFailure, ToolOutcome};

/// Enumerate every locally-visible device and report driver/CUDA versions.
/// Per-device attribute failures already degrade silently inside the
/// hardware abstraction; a device that fails to enumerate at all is skipped
/// with a logged warning rather than failing the whole tool.
pub async fn get_gpu_inventory(
    devices: &Arc<dyn DeviceInterface>,
    token: &CancellationToken,
) -> ToolOutcome {
    if token.is_cancelled() {
        return Err(ToolFailure::Cancelled);
    }

    let count = devices.device_count(token).await.map_err(|e| {
        ToolFailure::operational(
            format!("failed to query device count: {e}"),
            "verify the GPU management library is initialized and the node has visible devices",
        )
    })?;

    let mut device_docs = Vec::with_capacity(count as usize);
    for index in 0..count {
        match devices.device_snapshot(index, token).await {
            Ok(device) => device_docs.push(json!({
                "index": device.index,
                "name": device.name,
                "uuid": device.uuid,
                "pci_bus_id": device.pci_bus_id,
                "compute_capability": device.compute_capability.map(|(maj, min)| format!("{maj}.{min}")),
                "memory": {
                    "total_bytes": device.memory.total_bytes,
                    "used_bytes": device.memory.used_bytes,
                    "free_bytes": device.memory.free_bytes,
                },
                "temperature": {
                    "current_c": device.temperature.current_c,
                    "slowdown_c": device.temperature.slowdown_c,
                    "shutdown_c": device.temperature.shutdown_c,
                },
                "power": {
                    "current_mw": device.power.usage_mw,
                    "limit_mw": device.power.limit_mw,
                },
                "clocks": {
                    "sm_mhz": device.clocks.sm_mhz,
                    "memory_mhz": device.clocks.memory_mhz,
                },
                "utilization": {
                    "gpu_percent": device.utilization.gpu_percent,
                    "memory_percent": device.utilization.memory_percent,
                },
                "ecc": device.ecc.map(|ecc| json!({
                    "enabled": ecc.enabled,
                    "correctable": ecc.correctable,
                    "uncorrectable": ecc.uncorrectable,
                })),
            })),
            Err(e) => warn!(index, error = %e, "skipping device that failed to enumerate"),
        }
    }

    let driver_version = devices.driver_version(token).await.ok();
    let cuda_version = devices.cuda_version(token).await.ok();
    debug!(device_count = count, "assembled GPU inventory");

    Ok(json!({
        "status": "success",
        "driver_version": driver_version,
        "cuda_version": cuda_version,
        "device_count": device_docs.len(),
        "devices": device_docs,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevice;

    #[tokio::test]
    async fn reports_device_count_and_a100_memory() {
        let devices: Arc<dyn DeviceInterface> = Arc::new(MockDevice::new());
        let token = CancellationToken::new();

        let result = get_gpu_inventory(&devices, &token).await.unwrap();
        assert_eq!(result["device_count"], json!(2));
        assert!(result["devices"][0]["name"]
            .as_str()
            .unwrap()
            .starts_with("NVIDIA A100"));
        assert_eq!(result["devices"][0]["memory"]["total_bytes"], json!(42_949_672_960u64));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let devices: Arc<dyn DeviceInterface> = Arc::new(MockDevice::new());
        let token = CancellationToken::new();
        token.cancel();

        assert!(matches!(
            get_gpu_inventory(&devices, &token).await,
            Err(ToolFailure::Cancelled)
        ));
    }
}
