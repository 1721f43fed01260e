//! Device layer trait
//!
//! This trait is the only seam between the runtime and the hardware. The
//! runtime never touches device memory directly; it submits commands and
//! consumes completion notifications.

use super::command::{DeviceCommand, Notification};
use super::types::{ApiVersion, CommandTag, DeviceIndex, DeviceProperties, DmaInfo};
use crate::error::Result;
use std::time::Duration;

/// Device layer consumed by the runtime
///
/// Implementations enumerate devices, accept raw commands and report each
/// command's outcome exactly once.
///
/// # Architecture
///
/// ```text
/// ┌─────────────────────────────────────────────────────────┐
/// │                        Runtime                           │
/// │   streams / events / memory / kernels / error reporter   │
/// └───────────────┬───────────────────────▲─────────────────┘
///          submit │                       │ next_notification
///                 ▼                       │
/// ┌─────────────────────────────────────────────────────────┐
/// │                   DeviceLayer trait                      │
/// └───────────────┬───────────────────────┬─────────────────┘
///                 ▼                       ▼
///          ┌─────────────┐         ┌─────────────┐
///          │    SysEmu   │         │    PCIe     │
///          │ (simulated) │         │  (driver)   │
///          └─────────────┘         └─────────────┘
/// ```
///
/// # Ordering
///
/// Commands of the same queue start in submission order. A command with
/// `barrier` set starts only after every earlier command of its queue has
/// completed. Without a barrier an implementation may overlap a command with
/// earlier ones of its queue.
pub trait DeviceLayer: Send + Sync {
    /// Number of enumerated devices
    fn device_count(&self) -> usize;

    /// Static properties of a device
    fn device_properties(&self, device: DeviceIndex) -> Result<DeviceProperties>;

    /// DMA constraints of a device
    fn dma_info(&self, device: DeviceIndex) -> Result<DmaInfo>;

    /// Firmware device-API version of a device
    fn api_version(&self, device: DeviceIndex) -> Result<ApiVersion>;

    /// Whether device-to-device copies between `a` and `b` are possible
    fn is_p2p_enabled(&self, a: DeviceIndex, b: DeviceIndex) -> Result<bool>;

    /// Whether DMA commands of different queues may run concurrently
    fn supports_concurrent_dma(&self) -> bool;

    /// Enqueue a command
    ///
    /// Returns once the command is accepted. Its outcome is delivered later
    /// as a [`Notification`] carrying the command's tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the device does not exist or the layer is shut
    /// down. Faults during execution are never reported here.
    fn submit(&self, device: DeviceIndex, command: DeviceCommand) -> Result<()>;

    /// Request the abort of a submitted command
    ///
    /// Best effort: a command that already started may still complete. An
    /// aborted command is reported with a `*_HOST_ABORTED` fault. Returns
    /// whether the tag was still pending.
    fn abort(&self, device: DeviceIndex, tag: CommandTag) -> Result<bool>;

    /// Wait up to `timeout` for the next completion notification
    ///
    /// Returns `Ok(None)` on timeout.
    fn next_notification(&self, timeout: Duration) -> Result<Option<Notification>>;
}
