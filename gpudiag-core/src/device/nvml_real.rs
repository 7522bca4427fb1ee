//! Real hardware backend over NVML (NVIDIA Management Library).
//!
//! `init` is idempotent — a second call returns success without
//! re-initializing, via a process-global `OnceCell`. NVML is not guaranteed
//! thread-safe, so every native call is serialized behind a single
//! process-wide mutex and run on the blocking thread pool.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nvml_wrapper::enum_wrappers::device::{
    Clock, PcieUtilCounter, TemperatureSensor, TemperatureThreshold,
};
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::interface::check_cancelled;
use super::{
    ClockSpec, DeviceError, DeviceInterface, EccSpec, GpuDevice, MemorySpec, PowerSpec,
    TemperatureSpec, ThrottleReasons, UtilizationSpec,
};

static NVML: OnceCell<Arc<Nvml>> = OnceCell::new();
/// Serializes every call into NVML; the library itself is not thread-safe.
static NVML_CALL_LOCK: Mutex<()> = Mutex::new(());

fn get_nvml() -> Result<Arc<Nvml>, DeviceError> {
    NVML.get_or_try_init(|| {
        Nvml::init()
            .map(Arc::new)
            .map_err(|e| DeviceError::InitError(e.to_string()))
    })
    .cloned()
}

/// NVML-backed hardware abstraction.
pub struct NvmlDevice {
    nvml: Arc<Nvml>,
}

impl NvmlDevice {
    /// Construct the real backend, initializing NVML if this is the first
    /// instance in the process.
    pub fn new() -> Result<Self, DeviceError> {
        Ok(Self { nvml: get_nvml()? })
    }

    /// Run a blocking NVML call on the blocking pool, serialized by the
    /// process-global lock.
    async fn with_nvml<T, F>(&self, f: F) -> Result<T, DeviceError>
    where
        T: Send + 'static,
        F: FnOnce(&Nvml) -> Result<T, DeviceError> + Send + 'static,
    {
        let nvml = self.nvml.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = NVML_CALL_LOCK.lock().unwrap_or_else(|p| p.into_inner());
            f(&nvml)
        })
        .await
        .map_err(|e| DeviceError::Other(format!("NVML task panicked: {e}")))?
    }
}

fn canonical_pci_bus_id(raw: &str) -> String {
    raw.to_ascii_lowercase()
}

fn snapshot_device(nvml: &Nvml, index: u32) -> Result<GpuDevice, DeviceError> {
    let device = nvml
        .device_by_index(index)
        .map_err(|e| nvml_to_device_error(index, e))?;

    let name = device
        .name()
        .map_err(|e| DeviceError::QueryError(format!("name: {e}")))?;
    let uuid = device
        .uuid()
        .map_err(|e| DeviceError::QueryError(format!("uuid: {e}")))?;
    let pci_info = device
        .pci_info()
        .map_err(|e| DeviceError::QueryError(format!("pci_info: {e}")))?;
    let pci_bus_id = canonical_pci_bus_id(&pci_info.bus_id);

    let current_c = device.temperature(TemperatureSensor::Gpu).unwrap_or(0);
    let slowdown_c = device
        .temperature_threshold(TemperatureThreshold::Slowdown)
        .unwrap_or(0);
    let shutdown_c = device
        .temperature_threshold(TemperatureThreshold::Shutdown)
        .unwrap_or(0);

    let (gpu_percent, memory_percent) = device
        .utilization_rates()
        .map(|u| (u.gpu, u.memory))
        .unwrap_or((0, 0));

    let usage_mw = device.power_usage().unwrap_or(0);
    let limit_mw = device.power_management_limit().unwrap_or(0);

    let memory_info = device
        .memory_info()
        .map_err(|e| DeviceError::QueryError(format!("memory_info: {e}")))?;

    let sm_mhz = device.clock_info(Clock::SM).unwrap_or(0);
    let memory_mhz = device.clock_info(Clock::Memory).unwrap_or(0);

    // Touch PCIe throughput counters; GpuDevice doesn't surface them but a
    // degraded read here must not poison the rest of the snapshot.
    let _ = device.pcie_throughput(PcieUtilCounter::Send);
    let _ = device.pcie_throughput(PcieUtilCounter::Receive);

    let ecc = match device.is_ecc_enabled() {
        Ok(modes) if modes.currently_enabled => {
            let correctable = device.total_ecc_errors(
                nvml_wrapper::enum_wrappers::device::MemoryError::Corrected,
                nvml_wrapper::enum_wrappers::device::EccCounter::Aggregate,
            );
            let uncorrectable = device.total_ecc_errors(
                nvml_wrapper::enum_wrappers::device::MemoryError::Uncorrected,
                nvml_wrapper::enum_wrappers::device::EccCounter::Aggregate,
            );
            Some(EccSpec {
                enabled: true,
                correctable: correctable.unwrap_or(0),
                uncorrectable: uncorrectable.unwrap_or(0),
            })
        }
        Ok(_) => Some(EccSpec {
            enabled: false,
            correctable: 0,
            uncorrectable: 0,
        }),
        // Not supported on this device — §4.1: not a failure.
        Err(_) => None,
    };

    let throttle_reasons = device
        .current_throttle_reasons()
        .map(|bits| ThrottleReasons(bits.bits()))
        .unwrap_or(ThrottleReasons(0));

    let compute_capability = device
        .cuda_compute_capability()
        .ok()
        .map(|cc| (cc.major as u32, cc.minor as u32));

    Ok(GpuDevice {
        index,
        name,
        uuid,
        pci_bus_id,
        compute_capability,
        memory: MemorySpec {
            total_bytes: memory_info.total,
            used_bytes: memory_info.used,
            free_bytes: memory_info.free,
        },
        temperature: TemperatureSpec {
            current_c,
            slowdown_c,
            shutdown_c,
        },
        power: PowerSpec {
            usage_mw,
            limit_mw,
        },
        clocks: ClockSpec { sm_mhz, memory_mhz },
        utilization: UtilizationSpec {
            gpu_percent,
            memory_percent,
        },
        ecc,
        throttle_reasons,
    })
}

fn nvml_to_device_error(index: u32, e: NvmlError) -> DeviceError {
    match e {
        NvmlError::InvalidArg => DeviceError::InvalidDeviceIndex(index),
        NvmlError::NotSupported => DeviceError::NotSupported,
        NvmlError::Uninitialized => DeviceError::NotInitialized,
        other => DeviceError::QueryError(other.to_string()),
    }
}

#[async_trait]
impl DeviceInterface for NvmlDevice {
    async fn init(&self, token: &CancellationToken) -> Result<(), DeviceError> {
        check_cancelled(token)?;
        // NVML is already initialized by `new()`/`get_nvml()`; a repeat call
        // here is a no-op, satisfying the idempotence requirement.
        debug!("NVML init (idempotent)");
        Ok(())
    }

    async fn shutdown(&self, token: &CancellationToken) -> Result<(), DeviceError> {
        check_cancelled(token)?;
        // NVML is a process-global singleton; it is not torn down
        // per-instance, only logged as intent to release it.
        debug!("NVML shutdown requested (process-global instance retained)");
        Ok(())
    }

    async fn driver_version(&self, token: &CancellationToken) -> Result<String, DeviceError> {
        check_cancelled(token)?;
        self.with_nvml(|nvml| {
            nvml.sys_driver_version()
                .map_err(|e| DeviceError::QueryError(e.to_string()))
        })
        .await
    }

    async fn cuda_version(&self, token: &CancellationToken) -> Result<String, DeviceError> {
        check_cancelled(token)?;
        self.with_nvml(|nvml| {
            nvml.sys_cuda_driver_version()
                .map(|v| format!("{}.{}", v / 1000, (v % 1000) / 10))
                .map_err(|e| DeviceError::QueryError(e.to_string()))
        })
        .await
    }

    async fn device_count(&self, token: &CancellationToken) -> Result<u32, DeviceError> {
        check_cancelled(token)?;
        self.with_nvml(|nvml| {
            nvml.device_count()
                .map_err(|e| DeviceError::QueryError(e.to_string()))
        })
        .await
    }

    async fn device_snapshot(
        &self,
        index: u32,
        token: &CancellationToken,
    ) -> Result<GpuDevice, DeviceError> {
        check_cancelled(token)?;
        let result = self.with_nvml(move |nvml| snapshot_device(nvml, index)).await;
        if let Err(ref e) = result {
            warn!(index, error = %e, "failed to snapshot device");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_pci_bus_id_to_lowercase() {
        assert_eq!(
            canonical_pci_bus_id("0000:AB:00.0"),
            "0000:ab:00.0".to_string()
        );
    }
}
