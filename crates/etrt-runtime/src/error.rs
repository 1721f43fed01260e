//! Error types for runtime operations

use crate::ids::{DeviceId, EventId, KernelId, StreamId};
use etrt_device::{ApiVersion, DeviceLayerError};

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The call violated the API contract; nothing was submitted
    Validation,
    /// Device memory or code space could not satisfy the request
    ResourceExhaustion,
    /// The device layer refused or failed the request
    Device,
    /// The object is in a state that forbids the request
    Lifecycle,
}

/// Errors raised synchronously by the runtime
///
/// Faults of submitted work are never returned here; they resolve the
/// operation's event as failed and land in the stream error queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("unknown stream: {0}")]
    UnknownStream(StreamId),

    #[error("unknown event: {0}")]
    UnknownEvent(EventId),

    /// Kernel id was never returned by `load_code`, or was unloaded
    #[error("unknown kernel: {0}")]
    UnknownKernel(KernelId),

    /// Buffer is not a live allocation of the device
    #[error("invalid buffer {address:#x} on {device}")]
    InvalidBuffer { device: DeviceId, address: u64 },

    #[error("invalid size: {0}")]
    InvalidSize(String),

    /// Alignment is not a power of two
    #[error("invalid alignment: {0}")]
    InvalidAlignment(u64),

    /// Copy exceeds what one DMA command can carry
    #[error("transfer of {size} bytes exceeds the device limit of {max} bytes")]
    TransferTooLarge { size: u64, max: u64 },

    /// Device range is not inside one live allocation
    #[error("device range {address:#x}+{size} on {device} is not inside a live allocation")]
    OutOfBounds { device: DeviceId, address: u64, size: u64 },

    #[error("host buffer holds {actual} bytes, {required} required")]
    HostBufferTooSmall { required: u64, actual: u64 },

    #[error("invalid shire mask {mask:#x}: {reason}")]
    InvalidShireMask { mask: u64, reason: &'static str },

    #[error("kernel arguments of {size} bytes exceed the limit of {max} bytes")]
    KernelArgsTooLarge { size: usize, max: usize },

    #[error("invalid code image: {0}")]
    InvalidCodeImage(String),

    /// Kernel was loaded on another device than the launching stream's
    #[error("{kernel} is loaded on {kernel_device}, stream is on {stream_device}")]
    KernelDeviceMismatch {
        kernel: KernelId,
        kernel_device: DeviceId,
        stream_device: DeviceId,
    },

    /// Kernel cannot be unloaded yet
    #[error("{kernel} is busy: {reason}")]
    KernelBusy { kernel: KernelId, reason: &'static str },

    /// The load event of the kernel resolved as failed
    #[error("{0} failed to load")]
    KernelLoadFailed(KernelId),

    #[error("{stream} has {pending} unresolved events")]
    StreamBusy { stream: StreamId, pending: usize },

    #[error("peer-to-peer DMA between {src} and {dst} is not enabled")]
    P2pDisabled { src: DeviceId, dst: DeviceId },

    #[error("out of device memory on {device}: requested {requested} bytes aligned to {alignment}")]
    OutOfDeviceMemory {
        device: DeviceId,
        requested: u64,
        alignment: u64,
    },

    #[error("out of code space on {device}: requested {requested} bytes")]
    OutOfCodeSpace { device: DeviceId, requested: u64 },

    #[error("{device} runs device API {found}, runtime requires {required}")]
    IncompatibleDeviceApi {
        device: DeviceId,
        found: ApiVersion,
        required: ApiVersion,
    },

    #[error("device layer error: {0}")]
    DeviceLayer(#[from] DeviceLayerError),

    #[error("runtime is shut down")]
    Shutdown,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownDevice(_)
            | Error::UnknownStream(_)
            | Error::UnknownEvent(_)
            | Error::UnknownKernel(_)
            | Error::InvalidBuffer { .. }
            | Error::InvalidSize(_)
            | Error::InvalidAlignment(_)
            | Error::TransferTooLarge { .. }
            | Error::OutOfBounds { .. }
            | Error::HostBufferTooSmall { .. }
            | Error::InvalidShireMask { .. }
            | Error::KernelArgsTooLarge { .. }
            | Error::InvalidCodeImage(_)
            | Error::KernelDeviceMismatch { .. }
            | Error::P2pDisabled { .. } => ErrorKind::Validation,
            Error::OutOfDeviceMemory { .. } | Error::OutOfCodeSpace { .. } => ErrorKind::ResourceExhaustion,
            Error::DeviceLayer(_) | Error::IncompatibleDeviceApi { .. } => ErrorKind::Device,
            Error::KernelBusy { .. } | Error::KernelLoadFailed(_) | Error::StreamBusy { .. } | Error::Shutdown => {
                ErrorKind::Lifecycle
            }
        }
    }

    /// Create an invalid size error
    pub fn invalid_size(msg: impl Into<String>) -> Self {
        Self::InvalidSize(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(Error::UnknownKernel(KernelId::from_raw(4)).kind(), ErrorKind::Validation);
        assert_eq!(
            Error::OutOfDeviceMemory {
                device: DeviceId::from_raw(0),
                requested: 1,
                alignment: 64
            }
            .kind(),
            ErrorKind::ResourceExhaustion
        );
        assert_eq!(
            Error::StreamBusy {
                stream: StreamId::from_raw(1),
                pending: 2
            }
            .kind(),
            ErrorKind::Lifecycle
        );
        assert_eq!(Error::from(DeviceLayerError::ShutDown).kind(), ErrorKind::Device);
    }

    #[test]
    fn messages_name_the_object() {
        let err = Error::StreamBusy {
            stream: StreamId::from_raw(3),
            pending: 2,
        };
        assert_eq!(err.to_string(), "stream3 has 2 unresolved events");
    }
}
