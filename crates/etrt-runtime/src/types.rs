//! Value types exchanged through the runtime API

use crate::error::{Error, Result};
use crate::ids::{DeviceId, DevicePtr, EventId, KernelId, StreamId};
use etrt_device::{DeviceErrorCode, ErrorContext};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use etrt_device::{StackConfig, UserTrace};

/// Default code space reserved per device for loaded kernels
pub const DEFAULT_CODE_SPACE_SIZE: u64 = 32 << 20;

/// Runtime construction options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Check that device ranges of copies lie inside a live allocation
    pub check_memcpy_device_operations: bool,
    /// Refuse devices whose firmware API is incompatible with this runtime
    pub check_device_api_version: bool,
    /// Bytes reserved at the top of each device's DRAM for code images,
    /// clamped to a quarter of device memory
    pub code_space_size: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            check_memcpy_device_operations: true,
            check_device_api_version: true,
            code_space_size: DEFAULT_CODE_SPACE_SIZE,
        }
    }
}

impl Options {
    /// Defaults overlaid with environment variables
    ///
    /// - `ETRT_CHECK_MEMCPY`: `0`/`false`/`off` disables copy range checks
    /// - `ETRT_CHECK_API_VERSION`: same for the firmware API check
    /// - `ETRT_CODE_SPACE_SIZE`: code space in bytes
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(value) = env_flag("ETRT_CHECK_MEMCPY") {
            options.check_memcpy_device_operations = value;
        }
        if let Some(value) = env_flag("ETRT_CHECK_API_VERSION") {
            options.check_device_api_version = value;
        }
        if let Ok(raw) = std::env::var("ETRT_CODE_SPACE_SIZE") {
            match raw.trim().parse::<u64>() {
                Ok(size) => options.code_space_size = size,
                Err(_) => tracing::warn!(value = %raw, "ignoring_invalid_code_space_size"),
            }
        }
        options
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => {
            tracing::warn!(variable = name, value = %raw, "ignoring_invalid_flag");
            None
        }
    }
}

/// Launch configuration for one kernel execution
///
/// ```
/// use etrt_runtime::KernelLaunchOptions;
///
/// let options = KernelLaunchOptions::new(0x3).with_barrier(false).with_flush_l3(true);
/// assert_eq!(options.shire_mask, 0x3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLaunchOptions {
    /// Compute shires that execute the kernel
    pub shire_mask: u64,
    /// Start only after every earlier operation of the stream completed
    pub barrier: bool,
    /// Flush L3 before the kernel starts
    pub flush_l3: bool,
    pub user_trace: Option<UserTrace>,
    pub stack: Option<StackConfig>,
}

impl Default for KernelLaunchOptions {
    fn default() -> Self {
        Self::new(0xFFFF_FFFF)
    }
}

impl KernelLaunchOptions {
    pub fn new(shire_mask: u64) -> Self {
        Self {
            shire_mask,
            barrier: true,
            flush_l3: false,
            user_trace: None,
            stack: None,
        }
    }

    pub fn with_shire_mask(mut self, shire_mask: u64) -> Self {
        self.shire_mask = shire_mask;
        self
    }

    pub fn with_barrier(mut self, barrier: bool) -> Self {
        self.barrier = barrier;
        self
    }

    pub fn with_flush_l3(mut self, flush_l3: bool) -> Self {
        self.flush_l3 = flush_l3;
        self
    }

    pub fn with_user_trace(mut self, trace: UserTrace) -> Self {
        self.user_trace = Some(trace);
        self
    }

    pub fn with_stack(mut self, base_address: u64, size: u64) -> Self {
        self.stack = Some(StackConfig { base_address, size });
        self
    }
}

/// A device fault attributed to a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub error_code: DeviceErrorCode,
    pub device: DeviceId,
    pub stream: Option<StreamId>,
    /// Offending shires, when the device reported them
    pub cm_shire_mask: Option<u64>,
    pub error_context: Option<ErrorContext>,
}

impl StreamError {
    pub fn new(error_code: DeviceErrorCode, device: DeviceId) -> Self {
        Self {
            error_code,
            device,
            stream: None,
            cm_shire_mask: None,
            error_context: None,
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.error_code, self.device)?;
        if let Some(stream) = self.stream {
            write!(f, " {stream}")?;
        }
        if let Some(mask) = self.cm_shire_mask {
            write!(f, " (shires {mask:#x})")?;
        }
        Ok(())
    }
}

/// A live device allocation
///
/// Handles are plain values; the caller owns the allocation until it passes
/// the handle to `free_device` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    pub device: DeviceId,
    pub address: u64,
    pub size: u64,
    pub alignment: u64,
}

impl DeviceBuffer {
    pub fn ptr(&self) -> DevicePtr {
        DevicePtr(self.address)
    }

    /// Pointer `offset` bytes into the buffer
    pub fn ptr_at(&self, offset: u64) -> Result<DevicePtr> {
        if offset >= self.size {
            return Err(Error::OutOfBounds {
                device: self.device,
                address: self.address.saturating_add(offset),
                size: 1,
            });
        }
        Ok(DevicePtr(self.address + offset))
    }
}

/// Handles returned by `load_code`
///
/// `kernel` and both addresses are placeholders until `event` resolves
/// successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadCodeResult {
    pub event: EventId,
    pub kernel: KernelId,
    pub load_address: DevicePtr,
    pub entry_address: DevicePtr,
}

/// Observed state of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingResult {
    Pending,
    Completed,
    Failed(DeviceErrorCode),
}

impl PendingResult {
    pub fn is_resolved(self) -> bool {
        !matches!(self, PendingResult::Pending)
    }

    pub fn is_success(self) -> bool {
        matches!(self, PendingResult::Completed)
    }
}

/// Lifecycle of a loaded code image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    /// Load submitted, event unresolved
    Loading,
    Loaded,
    /// The load event resolved as failed
    LoadFailed,
    Unloaded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_options_builder() {
        let options = KernelLaunchOptions::default()
            .with_shire_mask(0x5)
            .with_barrier(false)
            .with_stack(0x8000_0000, 4096);
        assert_eq!(options.shire_mask, 0x5);
        assert!(!options.barrier);
        assert!(!options.flush_l3);
        assert_eq!(options.stack.map(|s| s.size), Some(4096));
    }

    #[test]
    fn buffer_interior_pointers() {
        let buffer = DeviceBuffer {
            device: DeviceId::from_raw(0),
            address: 0x1000,
            size: 256,
            alignment: 64,
        };
        assert_eq!(buffer.ptr_at(16).unwrap(), DevicePtr(0x1010));
        assert!(buffer.ptr_at(256).is_err());
    }

    #[test]
    fn stream_error_display() {
        let mut err = StreamError::new(DeviceErrorCode::DmaInvalidAddress, DeviceId::from_raw(1));
        err.stream = Some(StreamId::from_raw(4));
        err.cm_shire_mask = Some(0x30);
        assert_eq!(err.to_string(), "DMA_INVALID_ADDRESS on dev1 stream4 (shires 0x30)");
    }
}
