//! Device layer implementations
//!
//! - `sim` - In-process functional model of the device (reference implementation)
//! - `sysemu` - Construction of emulated devices from [`SysEmuOptions`]
//! - `pcie` - Hardware devices behind the kernel driver

pub mod pcie;
pub mod sim;
pub mod sysemu;

pub use pcie::{create_pcie_device_layer, PcieOptions};
pub use sim::SimDeviceLayer;
pub use sysemu::{create_sysemu_device_layer, create_sysemu_device_layer_multi, SysEmuOptions};
