//! Error types for device-layer operations

/// Result type for device-layer operations
pub type Result<T> = std::result::Result<T, DeviceLayerError>;

/// Errors raised synchronously by a device layer
///
/// Faults that happen while a command executes on the device are not
/// errors of this type: they are reported asynchronously through
/// [`crate::Notification`]s.
#[derive(Debug, thiserror::Error)]
pub enum DeviceLayerError {
    /// Device index does not name an enumerated device
    #[error("no such device: {0}")]
    NoSuchDevice(u32),

    /// The device layer has been shut down and accepts no more commands
    #[error("device layer is shut down")]
    ShutDown,

    /// The requested backend cannot be constructed in this build or on this host
    #[error("device backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend construction options are inconsistent
    #[error("invalid device layer options: {0}")]
    InvalidOptions(String),

    /// A code image could not be parsed or is not loadable
    #[error("invalid code image: {0}")]
    InvalidImage(String),

    /// Direct memory access outside a device's DRAM window
    #[error("address range {address:#x}+{len} outside device memory")]
    AddressOutOfRange { address: u64, len: u64 },

    /// I/O failure inside the backend (log files, device nodes)
    #[error("device layer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceLayerError {
    /// Create an invalid image error
    pub fn invalid_image(msg: impl Into<String>) -> Self {
        Self::InvalidImage(msg.into())
    }

    /// Create an invalid options error
    pub fn invalid_options(msg: impl Into<String>) -> Self {
        Self::InvalidOptions(msg.into())
    }
}
