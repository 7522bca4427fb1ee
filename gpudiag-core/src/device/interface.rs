//! Device interface trait and common types
//!
//! Defines the core abstraction over a vendor GPU management library: process
//! lifecycle (init/shutdown/driver version) plus per-device attribute
//! queries. Two backends implement this trait — a real NVML-backed one and a
//! deterministic mock — with identical semantics so tool handlers run
//! unchanged against either.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Stable identity of a single physical device within a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId {
    /// Local index within the node (0-based).
    pub index: u32,
    /// Globally-unique device UUID as reported by the vendor library.
    pub uuid: String,
    /// Product name, e.g. "NVIDIA A100-SXM4-40GB".
    pub name: String,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU{}", self.index)
    }
}

/// Memory capacity/usage, in bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemorySpec {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

/// Instantaneous and threshold temperatures, in Celsius.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TemperatureSpec {
    pub current_c: u32,
    /// 0 when the backend does not report a slowdown threshold.
    pub slowdown_c: u32,
    /// 0 when the backend does not report a shutdown threshold.
    pub shutdown_c: u32,
}

/// Instantaneous power draw and configured limit, in milliwatts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PowerSpec {
    pub usage_mw: u32,
    pub limit_mw: u32,
}

/// SM and memory clock frequencies, in MHz.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClockSpec {
    pub sm_mhz: u32,
    pub memory_mhz: u32,
}

/// Compute and memory utilization percentages (0-100).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UtilizationSpec {
    pub gpu_percent: u32,
    pub memory_percent: u32,
}

/// ECC mode and lifetime error totals. `None` when the device does not
/// support ECC (not a failure — see `DeviceError::NotSupported`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EccSpec {
    pub enabled: bool,
    pub correctable: u64,
    pub uncorrectable: u64,
}

/// Bitmask of active throttle reasons, vendor encoding preserved verbatim.
/// Bit 0 is reserved to mean "thermal slowdown" for the purposes of health
/// scoring (see `gpudiag_core::health`); every bit set counts toward "how
/// many distinct reasons are active".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ThrottleReasons(pub u64);

impl ThrottleReasons {
    pub const NONE: u64 = 0;
    pub const THERMAL: u64 = 1 << 0;

    pub fn is_thermal(&self) -> bool {
        self.0 & Self::THERMAL != 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_throttling(&self) -> bool {
        self.0 != 0
    }
}

/// Full per-device snapshot returned by a single query. Fields the backend
/// cannot read are degraded silently per spec — zero values or `None`, never
/// a hard failure (see `tools::inventory` for the per-attribute semantics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub uuid: String,
    /// Canonical lowercase `domain:bus:device.function`.
    pub pci_bus_id: String,
    pub compute_capability: Option<(u32, u32)>,
    pub memory: MemorySpec,
    pub temperature: TemperatureSpec,
    pub power: PowerSpec,
    pub clocks: ClockSpec,
    pub utilization: UtilizationSpec,
    pub ecc: Option<EccSpec>,
    pub throttle_reasons: ThrottleReasons,
}

/// Errors from the hardware abstraction.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device library not initialized")]
    NotInitialized,

    #[error("operation not supported by this device")]
    NotSupported,

    #[error("operation not implemented by this backend")]
    NotImplemented,

    #[error("invalid device index: {0}")]
    InvalidDeviceIndex(u32),

    #[error("native GPU management library required but not available: {0}")]
    NativeLibraryRequired(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("failed to initialize device library: {0}")]
    InitError(String),

    #[error("failed to query device: {0}")]
    QueryError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Checks a cancellation token before every call into the hardware
/// abstraction. Returns early without touching the native library.
pub(crate) fn check_cancelled(token: &CancellationToken) -> Result<(), DeviceError> {
    if token.is_cancelled() {
        Err(DeviceError::Cancelled)
    } else {
        Ok(())
    }
}

/// Uniform query API over GPU devices.
///
/// Methods with a default body return `NotImplemented` — new methods can be
/// added to this trait without breaking existing backends; they simply
/// report "not implemented" until a backend fills them in. `init`,
/// `device_count`, and `device_snapshot` have no default because every
/// backend must answer them to be useful at all.
#[async_trait]
pub trait DeviceInterface: Send + Sync {
    /// Initialize the underlying library. Idempotent: a second call must
    /// succeed without re-initializing.
    async fn init(&self, token: &CancellationToken) -> Result<(), DeviceError>;

    /// Release the underlying library. Safe to call more than once.
    async fn shutdown(&self, _token: &CancellationToken) -> Result<(), DeviceError> {
        Err(DeviceError::NotImplemented)
    }

    /// Driver version string, if the backend can report one.
    async fn driver_version(&self, _token: &CancellationToken) -> Result<String, DeviceError> {
        Err(DeviceError::NotImplemented)
    }

    /// CUDA runtime version string, if the backend can report one.
    async fn cuda_version(&self, _token: &CancellationToken) -> Result<String, DeviceError> {
        Err(DeviceError::NotImplemented)
    }

    /// Number of devices visible to this backend.
    async fn device_count(&self, token: &CancellationToken) -> Result<u32, DeviceError>;

    /// Full attribute snapshot for the device at `index`.
    async fn device_snapshot(
        &self,
        index: u32,
        token: &CancellationToken,
    ) -> Result<GpuDevice, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_display_uses_index() {
        let id = DeviceId {
            index: 3,
            uuid: "GPU-abc".into(),
            name: "Tesla V100".into(),
        };
        assert_eq!(format!("{}", id), "GPU3");
    }

    #[test]
    fn throttle_reasons_thermal_and_count() {
        let none = ThrottleReasons(0);
        assert!(!none.is_throttling());

        let thermal = ThrottleReasons(ThrottleReasons::THERMAL);
        assert!(thermal.is_thermal());
        assert_eq!(thermal.count(), 1);

        let multi = ThrottleReasons(ThrottleReasons::THERMAL | (1 << 3) | (1 << 5));
        assert_eq!(multi.count(), 3);
    }

    #[test]
    fn check_cancelled_reports_cancellation() {
        let token = CancellationToken::new();
        assert!(check_cancelled(&token).is_ok());
        token.cancel();
        assert!(matches!(
            check_cancelled(&token),
            Err(DeviceError::Cancelled)
        ));
    }
}
