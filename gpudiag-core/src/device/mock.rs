//! Deterministic mock device backend.
//!
//! Generates plausible fake devices parameterized by a count, with the same
//! semantics as the real NVML backend so tool handlers run unchanged. Used
//! for tests, CI, and development without hardware.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::interface::{check_cancelled, DeviceError};
use super::{
    ClockSpec, DeviceInterface, EccSpec, GpuDevice, MemorySpec, PowerSpec, TemperatureSpec,
    ThrottleReasons, UtilizationSpec,
};

/// 40GiB, matching an NVIDIA A100-SXM4-40GB — the fixture scenario.md's
/// end-to-end tests pin a literal byte count against.
const A100_40GB_BYTES: u64 = 42_949_672_960;

fn default_device(index: u32) -> GpuDevice {
    GpuDevice {
        index,
        name: format!("NVIDIA A100-SXM4-40GB (mock {})", index),
        uuid: format!("GPU-MOCK-{:04}-0000-0000-000000000000", index),
        pci_bus_id: format!("0000:{:02x}:00.0", index + 1),
        compute_capability: Some((8, 0)),
        memory: MemorySpec {
            total_bytes: A100_40GB_BYTES,
            used_bytes: A100_40GB_BYTES / 4,
            free_bytes: A100_40GB_BYTES - A100_40GB_BYTES / 4,
        },
        temperature: TemperatureSpec {
            current_c: 45,
            slowdown_c: 90,
            shutdown_c: 95,
        },
        power: PowerSpec {
            usage_mw: 150_000,
            limit_mw: 400_000,
        },
        clocks: ClockSpec {
            sm_mhz: 1410,
            memory_mhz: 1215,
        },
        utilization: UtilizationSpec {
            gpu_percent: 25,
            memory_percent: 30,
        },
        ecc: Some(EccSpec {
            enabled: true,
            correctable: 0,
            uncorrectable: 0,
        }),
        throttle_reasons: ThrottleReasons(0),
    }
}

/// Mock hardware backend. Every accessor returns the configured snapshot for
/// the requested index, or a simple function of it if untouched.
pub struct MockDevice {
    devices: Vec<RwLock<GpuDevice>>,
}

impl MockDevice {
    /// Create a mock backend with the default 2 devices.
    pub fn new() -> Self {
        Self::with_device_count(2)
    }

    /// Create a mock backend with `count` devices, each a plausible default
    /// A100 snapshot parameterized by index.
    pub fn with_device_count(count: u32) -> Self {
        let devices = (0..count).map(|i| RwLock::new(default_device(i))).collect();
        Self { devices }
    }

    /// Mutate the snapshot for `index` via `f`. Panics on an out-of-range
    /// index — this is test setup code, not a runtime query path.
    pub async fn configure<F: FnOnce(&mut GpuDevice)>(&self, index: u32, f: F) {
        let mut guard = self.devices[index as usize].write().await;
        f(&mut guard);
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceInterface for MockDevice {
    async fn init(&self, token: &CancellationToken) -> Result<(), DeviceError> {
        check_cancelled(token)?;
        Ok(())
    }

    async fn shutdown(&self, token: &CancellationToken) -> Result<(), DeviceError> {
        check_cancelled(token)?;
        Ok(())
    }

    async fn driver_version(&self, token: &CancellationToken) -> Result<String, DeviceError> {
        check_cancelled(token)?;
        Ok("550.54.15-mock".to_string())
    }

    async fn cuda_version(&self, token: &CancellationToken) -> Result<String, DeviceError> {
        check_cancelled(token)?;
        Ok("12.4".to_string())
    }

    async fn device_count(&self, token: &CancellationToken) -> Result<u32, DeviceError> {
        check_cancelled(token)?;
        Ok(self.devices.len() as u32)
    }

    async fn device_snapshot(
        &self,
        index: u32,
        token: &CancellationToken,
    ) -> Result<GpuDevice, DeviceError> {
        check_cancelled(token)?;
        let guard = self
            .devices
            .get(index as usize)
            .ok_or(DeviceError::InvalidDeviceIndex(index))?
            .read()
            .await;
        Ok(guard.clone())
    }
}
