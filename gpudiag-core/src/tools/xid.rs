//! `analyze_xid_errors` tool handler.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::device::DeviceInterface;
use crate::xid::{self, Severity};

use super::{ToolFailure, ToolOutcome};

struct DeviceIdentity {
    index: u32,
    name: String,
    uuid: String,
}

async fn devices_by_pci_bus_id(
    devices: &Arc<dyn DeviceInterface>,
    token: &CancellationToken,
) -> HashMap<String, DeviceIdentity> {
    let mut map = HashMap::new();
    let count = match devices.device_count(token).await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "could not enumerate devices for XID join");
            return map;
        }
    };

    for index in 0..count {
        if let Ok(device) = devices.device_snapshot(index, token).await {
            map.insert(
                device.pci_bus_id.clone(),
                DeviceIdentity {
                    index: device.index,
                    name: device.name,
                    uuid: device.uuid,
                },
            );
        }
    }
    map
}

pub async fn analyze_xid_errors(
    devices: &Arc<dyn DeviceInterface>,
    token: &CancellationToken,
) -> ToolOutcome {
    if token.is_cancelled() {
        return Err(ToolFailure::Cancelled);
    }

    let lines = xid::read_kernel_log(token).await.map_err(|e| {
        ToolFailure::operational(
            format!("failed to read kernel log: {e}"),
            "grant the CAP_SYSLOG capability (or mount /dev/kmsg) so the kernel ring buffer can be read",
        )
    })?;

    let events = xid::parse_xid_events(&lines);
    let identities = devices_by_pci_bus_id(devices, token).await;

    let mut fatal = 0u32;
    let mut critical = 0u32;
    let mut warning = 0u32;
    let mut info = 0u32;
    let mut worst = None;
    let mut fatal_gpu_lines = Vec::new();

    let enriched: Vec<Value> = events
        .iter()
        .map(|event| {
            let entry = xid::lookup(event.code);
            match entry.severity {
                Severity::Fatal => fatal += 1,
                Severity::Critical => critical += 1,
                Severity::Warning => warning += 1,
                Severity::Info => info += 1,
            }
            worst = Some(worst.map_or(entry.severity, |w: Severity| w.max(entry.severity)));

            let identity = identities.get(&event.pci_bus_id);
            if entry.severity == Severity::Fatal {
                let label = identity
                    .map(|d| format!("GPU {}: XID {} ({})", d.index, event.code, d.name))
                    .unwrap_or_else(|| format!("GPU ?: XID {} ({})", event.code, event.pci_bus_id));
                fatal_gpu_lines.push(label);
            }

            json!({
                "xid": event.code,
                "name": entry.name,
                "description": entry.description,
                "severity": entry.severity.to_string(),
                "category": entry.category.to_string(),
                "remediation": entry.remediation,
                "pci_bus_id": event.pci_bus_id,
                "gpu_index": identity.map(|d| d.index),
                "gpu_name": identity.map(|d| d.name.clone()),
                "gpu_uuid": identity.map(|d| d.uuid.clone()),
                "pid": event.pid,
                "process_name": event.process_name,
            })
        })
        .collect();

    let status = match worst {
        Some(Severity::Fatal) => "critical",
        Some(Severity::Critical) => "critical",
        Some(Severity::Warning) => "warning",
        Some(Severity::Info) => "ok",
        None => "ok",
    };

    let recommendation = if fatal_gpu_lines.is_empty() {
        "No fatal XID events detected.".to_string()
    } else {
        format!(
            "Fatal XID events detected, drain affected nodes: {}",
            fatal_gpu_lines.join("; ")
        )
    };

    Ok(json!({
        "status": status,
        "error_count": enriched.len(),
        "summary": {
            "fatal": fatal,
            "critical": critical,
            "warning": warning,
            "info": info,
        },
        "errors": enriched,
        "recommendation": recommendation,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MockDevice;

    #[tokio::test]
    async fn joins_xid_event_against_device_by_pci_bus_id() {
        let mock = MockDevice::new();
        mock.configure(0, |d| d.pci_bus_id = "0000:01:00.0".to_string())
            .await;
        let devices: Arc<dyn DeviceInterface> = Arc::new(mock);
        let token = CancellationToken::new();

        let line = "[100.0] NVRM: Xid (PCI:0000:01:00.0): 48, pid='1234', name=python3".to_string();
        let events = xid::parse_xid_events(&[line]);
        let identities = devices_by_pci_bus_id(&devices, &token).await;

        assert_eq!(events.len(), 1);
        let identity = identities.get(&events[0].pci_bus_id).unwrap();
        assert_eq!(identity.index, 0);
    }

    #[tokio::test]
    async fn empty_log_reports_ok_status() {
        let identities: HashMap<String, DeviceIdentity> = HashMap::new();
        let events = xid::parse_xid_events(&[]);
        assert!(events.is_empty());
        assert!(identities.is_empty());
    }
}
