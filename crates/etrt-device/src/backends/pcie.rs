//! PCIe device layer
//!
//! Real hardware is reached through the kernel driver's device nodes. This
//! build carries no driver binding, so construction reports the backend as
//! unavailable and callers fall back to the emulator.

use crate::error::{DeviceLayerError, Result};
use crate::layer::DeviceLayer;
use serde::{Deserialize, Serialize};

/// Options for PCIe-attached devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcieOptions {
    /// Open the master-minion (operations) node
    pub enable_master_minion: bool,
    /// Open the service-processor (management) node
    pub enable_service_processor: bool,
}

impl Default for PcieOptions {
    fn default() -> Self {
        Self {
            enable_master_minion: true,
            enable_service_processor: false,
        }
    }
}

/// Create a device layer over PCIe-attached devices
pub fn create_pcie_device_layer(options: &PcieOptions) -> Result<Box<dyn DeviceLayer>> {
    if !options.enable_master_minion && !options.enable_service_processor {
        return Err(DeviceLayerError::invalid_options(
            "at least one of master minion or service processor must be enabled",
        ));
    }
    Err(DeviceLayerError::BackendUnavailable(
        "PCIe backend requires the accelerator kernel driver".into(),
    ))
}

/// Whether a PCIe device layer can be created in this build
pub fn is_available() -> bool {
    false
}
