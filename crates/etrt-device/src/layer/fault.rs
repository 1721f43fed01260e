//! Device-originated fault vocabulary

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes a device reports for a failed command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceErrorCode {
    KernelLaunchUnexpectedError,
    KernelLaunchException,
    KernelLaunchShiresNotReady,
    KernelLaunchHostAborted,
    KernelLaunchInvalidAddress,
    KernelLaunchTimeoutHang,
    KernelLaunchInvalidArgsPayloadSize,
    KernelLaunchCmIfaceMulticastFailed,
    KernelLaunchCmIfaceUnicastFailed,
    KernelLaunchSpIfaceResetFailed,
    KernelLaunchCwMinionsBootFailed,
    KernelLaunchInvalidArgsInvalidShireMask,
    KernelLaunchResponseUserError,
    KernelAbortError,
    KernelAbortInvalidTagId,
    KernelAbortTimeoutHang,
    KernelAbortHostAborted,
    AbortUnexpectedError,
    AbortInvalidTagId,
    DmaUnexpectedError,
    DmaHostAborted,
    DmaErrorAborted,
    DmaInvalidAddress,
    DmaInvalidSize,
    DmaCmIfaceMulticastFailed,
    DmaDriverDataConfigFailed,
    DmaDriverLinkConfigFailed,
    DmaDriverChanStartFailed,
    DmaDriverAbortFailed,
    TraceConfigUnexpectedError,
    TraceConfigBadShireMask,
    TraceConfigBadThreadMask,
    TraceConfigBadEventMask,
    TraceConfigBadFilterMask,
    TraceConfigHostAborted,
    TraceConfigCmFailed,
    TraceConfigMmFailed,
    TraceConfigInvalidConfig,
    TraceControlUnexpectedError,
    TraceControlBadRtType,
    TraceControlBadControlMask,
    TraceControlComputeMinionRtCtrlError,
    TraceControlMasterMinionRtCtrlError,
    TraceControlHostAborted,
    TraceControlCmIfaceMulticastFailed,
    ApiCompatibilityUnexpectedError,
    ApiCompatibilityIncompatibleMajor,
    ApiCompatibilityIncompatibleMinor,
    ApiCompatibilityIncompatiblePatch,
    ApiCompatibilityBadFirmwareType,
    ApiCompatibilityHostAborted,
    FirmwareVersionUnexpectedError,
    FirmwareVersionBadFwType,
    FirmwareVersionNotAvailable,
    FirmwareVersionHostAborted,
    EchoHostAborted,
    CmResetUnexpectedError,
    CmResetInvalidShireMask,
    CmResetFailed,
    ErrorTypeUnsupportedCommand,
    ErrorTypeCmSmodeRtException,
    ErrorTypeCmSmodeRtHang,
    Unknown,
}

impl DeviceErrorCode {
    /// Stable upper-snake-case name, as shown in logs and at the binding boundary
    pub fn as_str(self) -> &'static str {
        use DeviceErrorCode::*;
        match self {
            KernelLaunchUnexpectedError => "KERNEL_LAUNCH_UNEXPECTED_ERROR",
            KernelLaunchException => "KERNEL_LAUNCH_EXCEPTION",
            KernelLaunchShiresNotReady => "KERNEL_LAUNCH_SHIRES_NOT_READY",
            KernelLaunchHostAborted => "KERNEL_LAUNCH_HOST_ABORTED",
            KernelLaunchInvalidAddress => "KERNEL_LAUNCH_INVALID_ADDRESS",
            KernelLaunchTimeoutHang => "KERNEL_LAUNCH_TIMEOUT_HANG",
            KernelLaunchInvalidArgsPayloadSize => "KERNEL_LAUNCH_INVALID_ARGS_PAYLOAD_SIZE",
            KernelLaunchCmIfaceMulticastFailed => "KERNEL_LAUNCH_CM_IFACE_MULTICAST_FAILED",
            KernelLaunchCmIfaceUnicastFailed => "KERNEL_LAUNCH_CM_IFACE_UNICAST_FAILED",
            KernelLaunchSpIfaceResetFailed => "KERNEL_LAUNCH_SP_IFACE_RESET_FAILED",
            KernelLaunchCwMinionsBootFailed => "KERNEL_LAUNCH_CW_MINIONS_BOOT_FAILED",
            KernelLaunchInvalidArgsInvalidShireMask => "KERNEL_LAUNCH_INVALID_ARGS_INVALID_SHIRE_MASK",
            KernelLaunchResponseUserError => "KERNEL_LAUNCH_RESPONSE_USER_ERROR",
            KernelAbortError => "KERNEL_ABORT_ERROR",
            KernelAbortInvalidTagId => "KERNEL_ABORT_INVALID_TAG_ID",
            KernelAbortTimeoutHang => "KERNEL_ABORT_TIMEOUT_HANG",
            KernelAbortHostAborted => "KERNEL_ABORT_HOST_ABORTED",
            AbortUnexpectedError => "ABORT_UNEXPECTED_ERROR",
            AbortInvalidTagId => "ABORT_INVALID_TAG_ID",
            DmaUnexpectedError => "DMA_UNEXPECTED_ERROR",
            DmaHostAborted => "DMA_HOST_ABORTED",
            DmaErrorAborted => "DMA_ERROR_ABORTED",
            DmaInvalidAddress => "DMA_INVALID_ADDRESS",
            DmaInvalidSize => "DMA_INVALID_SIZE",
            DmaCmIfaceMulticastFailed => "DMA_CM_IFACE_MULTICAST_FAILED",
            DmaDriverDataConfigFailed => "DMA_DRIVER_DATA_CONFIG_FAILED",
            DmaDriverLinkConfigFailed => "DMA_DRIVER_LINK_CONFIG_FAILED",
            DmaDriverChanStartFailed => "DMA_DRIVER_CHAN_START_FAILED",
            DmaDriverAbortFailed => "DMA_DRIVER_ABORT_FAILED",
            TraceConfigUnexpectedError => "TRACE_CONFIG_UNEXPECTED_ERROR",
            TraceConfigBadShireMask => "TRACE_CONFIG_BAD_SHIRE_MASK",
            TraceConfigBadThreadMask => "TRACE_CONFIG_BAD_THREAD_MASK",
            TraceConfigBadEventMask => "TRACE_CONFIG_BAD_EVENT_MASK",
            TraceConfigBadFilterMask => "TRACE_CONFIG_BAD_FILTER_MASK",
            TraceConfigHostAborted => "TRACE_CONFIG_HOST_ABORTED",
            TraceConfigCmFailed => "TRACE_CONFIG_CM_FAILED",
            TraceConfigMmFailed => "TRACE_CONFIG_MM_FAILED",
            TraceConfigInvalidConfig => "TRACE_CONFIG_INVALID_CONFIG",
            TraceControlUnexpectedError => "TRACE_CONTROL_UNEXPECTED_ERROR",
            TraceControlBadRtType => "TRACE_CONTROL_BAD_RT_TYPE",
            TraceControlBadControlMask => "TRACE_CONTROL_BAD_CONTROL_MASK",
            TraceControlComputeMinionRtCtrlError => "TRACE_CONTROL_COMPUTE_MINION_RT_CTRL_ERROR",
            TraceControlMasterMinionRtCtrlError => "TRACE_CONTROL_MASTER_MINION_RT_CTRL_ERROR",
            TraceControlHostAborted => "TRACE_CONTROL_HOST_ABORTED",
            TraceControlCmIfaceMulticastFailed => "TRACE_CONTROL_CM_IFACE_MULTICAST_FAILED",
            ApiCompatibilityUnexpectedError => "API_COMPATIBILITY_UNEXPECTED_ERROR",
            ApiCompatibilityIncompatibleMajor => "API_COMPATIBILITY_INCOMPATIBLE_MAJOR",
            ApiCompatibilityIncompatibleMinor => "API_COMPATIBILITY_INCOMPATIBLE_MINOR",
            ApiCompatibilityIncompatiblePatch => "API_COMPATIBILITY_INCOMPATIBLE_PATCH",
            ApiCompatibilityBadFirmwareType => "API_COMPATIBILITY_BAD_FIRMWARE_TYPE",
            ApiCompatibilityHostAborted => "API_COMPATIBILITY_HOST_ABORTED",
            FirmwareVersionUnexpectedError => "FIRMWARE_VERSION_UNEXPECTED_ERROR",
            FirmwareVersionBadFwType => "FIRMWARE_VERSION_BAD_FW_TYPE",
            FirmwareVersionNotAvailable => "FIRMWARE_VERSION_NOT_AVAILABLE",
            FirmwareVersionHostAborted => "FIRMWARE_VERSION_HOST_ABORTED",
            EchoHostAborted => "ECHO_HOST_ABORTED",
            CmResetUnexpectedError => "CM_RESET_UNEXPECTED_ERROR",
            CmResetInvalidShireMask => "CM_RESET_INVALID_SHIRE_MASK",
            CmResetFailed => "CM_RESET_FAILED",
            ErrorTypeUnsupportedCommand => "ERROR_TYPE_UNSUPPORTED_COMMAND",
            ErrorTypeCmSmodeRtException => "ERROR_TYPE_CM_SMODE_RT_EXCEPTION",
            ErrorTypeCmSmodeRtHang => "ERROR_TYPE_CM_SMODE_RT_HANG",
            Unknown => "UNKNOWN",
        }
    }

    /// DMA-class failure
    pub fn is_dma(self) -> bool {
        self.as_str().starts_with("DMA_")
    }

    /// Failure reported for a command the host asked to abort
    pub fn is_host_aborted(self) -> bool {
        self.as_str().ends_with("_HOST_ABORTED")
    }
}

impl Default for DeviceErrorCode {
    fn default() -> Self {
        DeviceErrorCode::Unknown
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of general purpose registers captured (x1..x31)
pub const ERROR_CONTEXT_GPRS: usize = 31;

/// Machine state captured by a hart at the moment of a device-side fault
///
/// The device ships this record as raw little-endian bytes; the layout is
/// fixed (`repr(C)`, no padding) so it can be read straight out of a
/// diagnostic buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ErrorContext {
    pub error_type: u64,
    pub cycle: u64,
    pub hart_id: u64,
    /// Exception program counter
    pub mepc: u64,
    pub mstatus: u64,
    /// Bad address or instruction
    pub mtval: u64,
    pub mcause: u64,
    pub user_defined_error: i64,
    pub gpr: [u64; ERROR_CONTEXT_GPRS],
}

impl ErrorContext {
    /// Size of the encoded record in bytes
    pub const SIZE: usize = std::mem::size_of::<ErrorContext>();

    /// Decode a context from the front of a raw payload
    pub fn from_bytes(bytes: &[u8]) -> Option<ErrorContext> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        bytemuck::try_pod_read_unaligned(&bytes[..Self::SIZE]).ok()
    }

    /// Raw encoding of this context
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Zeroable::zeroed()
    }
}

/// A failed command as reported by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFault {
    pub code: DeviceErrorCode,
    /// Offending shires, when the fault is attributable to some of them
    pub shire_mask: Option<u64>,
    pub context: Option<ErrorContext>,
}

impl DeviceFault {
    pub fn new(code: DeviceErrorCode) -> Self {
        Self {
            code,
            shire_mask: None,
            context: None,
        }
    }

    pub fn with_shire_mask(mut self, mask: u64) -> Self {
        self.shire_mask = Some(mask);
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(mask) = self.shire_mask {
            write!(f, " (shires {mask:#x})")?;
        }
        Ok(())
    }
}
