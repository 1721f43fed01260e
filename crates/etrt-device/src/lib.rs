//! Device layer for the etrt accelerator runtime
//!
//! This crate provides:
//! - **DeviceLayer trait**: enumeration, raw command submission and
//!   completion notifications for RISC-V accelerator devices
//! - **Fault model**: device error codes and captured hart state
//! - **Code images**: ELF64 RISC-V parsing and flattening
//! - **Emulator backend**: an in-process simulated device with fault injection
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     etrt-runtime                         │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ Arc<dyn DeviceLayer>
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │   DeviceCommand  ──►  device queues  ──►  Notification   │
//! └─────────────────────┬───────────────────────────────────┘
//!              ┌────────┴────────┐
//!              ▼                 ▼
//!        ┌───────────┐     ┌───────────┐
//!        │  SysEmu   │     │   PCIe    │
//!        └───────────┘     └───────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use etrt_device::{create_sysemu_device_layer, DeviceIndex, DeviceLayer, SysEmuOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let layer = create_sysemu_device_layer(&SysEmuOptions::default(), 1)?;
//! let props = layer.device_properties(DeviceIndex::new(0))?;
//! println!("{} shires at {} MHz", props.available_shires, props.frequency_mhz);
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod error;
pub mod image;
pub mod layer;

pub use backends::{
    create_pcie_device_layer, create_sysemu_device_layer, create_sysemu_device_layer_multi, PcieOptions,
    SimDeviceLayer, SysEmuOptions,
};
pub use error::{DeviceLayerError, Result};
pub use image::CodeImage;
pub use layer::{
    ApiVersion, ArchRevision, CommandHeader, CommandKind, CommandOutcome, CommandTag, DeviceCommand, DeviceErrorCode,
    DeviceFault, DeviceIndex, DeviceLayer, DeviceProperties, DiagnosticBuffer, DmaInfo, ErrorContext, FormFactor,
    HostBuffer, KernelLaunch, Notification, QueueId, StackConfig, UserTrace,
};
