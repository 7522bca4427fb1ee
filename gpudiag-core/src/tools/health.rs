//! `get_gpu_health` tool handler.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::device::DeviceInterface;
use crate::health::{overall_score, score_device, worst_status};

use super::{ToolFailure, ToolOutcome};

pub async fn get_gpu_health(
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

    let mut gpus = Vec::with_capacity(count as usize);
    for index in 0..count {
        match devices.device_snapshot(index, token).await {
            Ok(device) => gpus.push(score_device(&device)),
            Err(e) => warn!(index, error = %e, "skipping device that failed to enumerate"),
        }
    }

    let overall_status = worst_status(&gpus);
    let score = overall_score(&gpus);

    let gpu_docs: Vec<Value> = gpus
        .iter()
        .map(|g| {
            json!({
                "index": g.index,
                "name": g.name,
                "uuid": g.uuid,
                "score": g.score,
                "status": g.status.to_string(),
                "issues": g.issues.iter().map(|i| json!({
                    "component": i.component,
                    "severity": i.severity,
                    "penalty": i.penalty,
                    "detail": i.detail,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();

    Ok(json!({
        "status": overall_status.to_string(),
        "overall_score": score,
        "gpus": gpu_docs,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevice;

    #[tokio::test]
    async fn hot_gpu_degrades_overall_score_and_status() {
        let mock = MockDevice::new();
        mock.configure(0, |d| {
            d.temperature.current_c = 92;
            d.temperature.shutdown_c = 90;
        })
        .await;
        let devices: Arc<dyn DeviceInterface> = Arc::new(mock);
        let token = CancellationToken::new();

        let result = get_gpu_health(&devices, &token).await.unwrap();
        assert!(result["overall_score"].as_u64().unwrap() <= 70);
        assert_eq!(result["gpus"][0]["status"], json!("critical"));
        let issues = result["gpus"][0]["issues"].as_array().unwrap();
        assert!(issues
            .iter()
            .any(|i| i["component"] == "temperature" && i["severity"] == "critical"));
    }

    #[tokio::test]
    async fn healthy_fleet_reports_healthy() {
        let devices: Arc<dyn DeviceInterface> = Arc::new(MockDevice::new());
        let token = CancellationToken::new();

        let result = get_gpu_health(&devices, &token).await.unwrap();
        assert_eq!(result["status"], json!("healthy"));
    }
}
