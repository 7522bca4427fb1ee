//! Per-GPU health scoring.
//!
//! A device starts at 100 and accrues integer penalties for each condition
//! it matches; the score floors at 0 and never depends on penalty order.
//! Grounded on the weighted-condition shape of `state_machine.rs`'s health
//! transitions, replaced here with a fixed penalty table.

use serde::{Deserialize, Serialize};

use crate::device::GpuDevice;

/// Device-reported thresholds of 0 mean "not reported"; fall back to these
/// constants only then, per the Open Question resolution in DESIGN.md —
/// never override a thresholds the backend does report.
const FALLBACK_SLOWDOWN_C: u32 = 82;
const FALLBACK_SHUTDOWN_C: u32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// One penalty condition that fired against a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    pub component: String,
    pub severity: String,
    pub penalty: i32,
    pub detail: String,
}

/// Scored health for a single GPU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuHealth {
    pub index: u32,
    pub name: String,
    pub uuid: String,
    pub score: u32,
    pub status: HealthStatus,
    pub issues: Vec<HealthIssue>,
}

fn issue(component: &str, severity: &str, penalty: i32, detail: impl Into<String>) -> HealthIssue {
    HealthIssue {
        component: component.to_string(),
        severity: severity.to_string(),
        penalty,
        detail: detail.into(),
    }
}

/// Score a single device snapshot against the fixed penalty table.
pub fn score_device(device: &GpuDevice) -> GpuHealth {
    let mut issues = Vec::new();

    let slowdown_c = if device.temperature.slowdown_c == 0 {
        FALLBACK_SLOWDOWN_C
    } else {
        device.temperature.slowdown_c
    };
    let shutdown_c = if device.temperature.shutdown_c == 0 {
        FALLBACK_SHUTDOWN_C
    } else {
        device.temperature.shutdown_c
    };
    let current_c = device.temperature.current_c;

    if current_c >= shutdown_c {
        issues.push(issue(
            "temperature",
            "critical",
            -30,
            format!("{current_c}C at or above shutdown threshold {shutdown_c}C"),
        ));
    } else if current_c >= slowdown_c {
        issues.push(issue(
            "temperature",
            "high",
            -20,
            format!("{current_c}C at or above slowdown threshold {slowdown_c}C"),
        ));
    } else if slowdown_c >= 10 && current_c >= slowdown_c - 10 {
        issues.push(issue(
            "temperature",
            "elevated",
            -10,
            format!("{current_c}C within 10C of slowdown threshold {slowdown_c}C"),
        ));
    }

    if device.memory.total_bytes > 0 {
        let used_percent =
            (device.memory.used_bytes as u128 * 100 / device.memory.total_bytes as u128) as u32;
        if used_percent >= 95 {
            issues.push(issue(
                "memory",
                "critical",
                -20,
                format!("memory used {used_percent}%"),
            ));
        } else if used_percent >= 90 {
            issues.push(issue(
                "memory",
                "high",
                -10,
                format!("memory used {used_percent}%"),
            ));
        }
    }

    if device.power.limit_mw > 0 {
        let power_percent = (device.power.usage_mw as u64 * 100 / device.power.limit_mw as u64) as u32;
        if power_percent >= 100 {
            issues.push(issue(
                "power",
                "over_limit",
                -15,
                format!("power usage {power_percent}% of limit"),
            ));
        } else if power_percent >= 95 {
            issues.push(issue(
                "power",
                "high",
                -10,
                format!("power usage {power_percent}% of limit"),
            ));
        }
    }

    if device.throttle_reasons.is_throttling() {
        if device.throttle_reasons.is_thermal() || device.throttle_reasons.count() >= 2 {
            issues.push(issue(
                "throttling",
                "severe",
                -25,
                "thermal or multiple throttle reasons active",
            ));
        } else {
            issues.push(issue(
                "throttling",
                "minor",
                -10,
                "single non-thermal throttle reason active",
            ));
        }
    }

    if let Some(ecc) = device.ecc {
        if ecc.uncorrectable > 0 {
            issues.push(issue(
                "ecc",
                "critical",
                -30,
                format!("{} uncorrectable ECC errors", ecc.uncorrectable),
            ));
        } else if ecc.correctable > 1000 {
            issues.push(issue(
                "ecc",
                "warning",
                -10,
                format!("{} lifetime correctable ECC errors", ecc.correctable),
            ));
        }
    }

    let total_penalty: i32 = issues.iter().map(|i| i.penalty).sum();
    let score = (100 + total_penalty).max(0) as u32;
    let has_critical_issue = issues.iter().any(|i| i.severity == "critical");

    let status = if has_critical_issue {
        HealthStatus::Critical
    } else if score >= 90 {
        HealthStatus::Healthy
    } else if score >= 70 {
        HealthStatus::Warning
    } else if score >= 50 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Critical
    };

    GpuHealth {
        index: device.index,
        name: device.name.clone(),
        uuid: device.uuid.clone(),
        score,
        status,
        issues,
    }
}

/// Worst-wins aggregate over every scored device on the node.
pub fn worst_status(gpus: &[GpuHealth]) -> HealthStatus {
    gpus.iter()
        .map(|g| g.status)
        .max()
        .unwrap_or(HealthStatus::Healthy)
}

/// Overall numeric score for the node: the minimum across devices, mirroring
/// the worst-wins status rule.
pub fn overall_score(gpus: &[GpuHealth]) -> u32 {
    gpus.iter().map(|g| g.score).min().unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        ClockSpec, EccSpec, MemorySpec, PowerSpec, TemperatureSpec, ThrottleReasons,
        UtilizationSpec,
    };

    fn base_device() -> GpuDevice {
        GpuDevice {
            index: 0,
            name: "NVIDIA A100-SXM4-40GB".to_string(),
            uuid: "GPU-0".to_string(),
            pci_bus_id: "0000:01:00.0".to_string(),
            compute_capability: Some((8, 0)),
            memory: MemorySpec {
                total_bytes: 40_000_000_000,
                used_bytes: 1_000_000_000,
                free_bytes: 39_000_000_000,
            },
            temperature: TemperatureSpec {
                current_c: 45,
                slowdown_c: 90,
                shutdown_c: 95,
            },
            power: PowerSpec {
                usage_mw: 100_000,
                limit_mw: 400_000,
            },
            clocks: ClockSpec {
                sm_mhz: 1410,
                memory_mhz: 1215,
            },
            utilization: UtilizationSpec {
                gpu_percent: 10,
                memory_percent: 10,
            },
            ecc: Some(EccSpec {
                enabled: true,
                correctable: 0,
                uncorrectable: 0,
            }),
            throttle_reasons: ThrottleReasons(0),
        }
    }

    #[test]
    fn healthy_device_scores_100() {
        let health = score_device(&base_device());
        assert_eq!(health.score, 100);
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.issues.is_empty());
    }

    #[test]
    fn hot_gpu_over_shutdown_threshold_is_critical() {
        let mut device = base_device();
        device.temperature.current_c = 92;
        device.temperature.shutdown_c = 90;

        let health = score_device(&device);
        assert!(health.score <= 70);
        assert_eq!(health.status, HealthStatus::Critical);
        assert!(health
            .issues
            .iter()
            .any(|i| i.component == "temperature" && i.severity == "critical"));
    }

    #[test]
    fn uncorrectable_ecc_forces_critical_regardless_of_score() {
        let mut device = base_device();
        device.ecc = Some(EccSpec {
            enabled: true,
            correctable: 0,
            uncorrectable: 1,
        });

        let health = score_device(&device);
        assert_eq!(health.status, HealthStatus::Critical);
    }

    #[test]
    fn score_never_goes_below_zero() {
        let mut device = base_device();
        device.temperature.current_c = 99;
        device.temperature.shutdown_c = 90;
        device.memory.used_bytes = device.memory.total_bytes;
        device.power.usage_mw = device.power.limit_mw * 2;
        device.throttle_reasons = ThrottleReasons(ThrottleReasons::THERMAL);
        device.ecc = Some(EccSpec {
            enabled: true,
            correctable: 0,
            uncorrectable: 5,
        });

        let health = score_device(&device);
        assert_eq!(health.score, 0);
    }

    #[test]
    fn zero_thresholds_fall_back_to_constants() {
        let mut device = base_device();
        device.temperature.slowdown_c = 0;
        device.temperature.shutdown_c = 0;
        device.temperature.current_c = 91;

        let health = score_device(&device);
        assert!(health
            .issues
            .iter()
            .any(|i| i.component == "temperature" && i.severity == "critical"));
    }

    #[test]
    fn worst_wins_across_devices() {
        let healthy = score_device(&base_device());
        let mut hot = base_device();
        hot.index = 1;
        hot.temperature.current_c = 96;
        let critical = score_device(&hot);

        let gpus = vec![healthy, critical];
        assert_eq!(worst_status(&gpus), HealthStatus::Critical);
        assert!(overall_score(&gpus) <= 70);
    }
}
