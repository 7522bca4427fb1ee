//! Hardware abstraction layer.
//!
//! Provides a uniform query API over GPU devices, with a real NVML-backed
//! implementation and a deterministic mock sharing identical semantics.

mod interface;
mod mock;
mod nvml_real;

pub use interface::*;
pub use mock::MockDevice;
pub use nvml_real::NvmlDevice;

use std::sync::Arc;

/// Backend selection, mirrored by `gpudiag`'s `--nvml-mode` CLI flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// Deterministic in-memory devices; no hardware required.
    Mock,
    /// Real NVML-backed devices.
    Real,
}

/// Construct the hardware abstraction for the given mode.
pub fn create_device_interface(mode: BackendMode) -> Result<Arc<dyn DeviceInterface>, DeviceError> {
    match mode {
        BackendMode::Mock => Ok(Arc::new(MockDevice::new())),
        BackendMode::Real => {
            let device = NvmlDevice::new()?;
            Ok(Arc::new(device))
        }
    }
}
