//! Device layer trait and the types it exchanges

mod command;
mod fault;
mod traits;
mod types;

pub use command::{
    CommandHeader, CommandKind, CommandOutcome, DeviceCommand, DiagnosticBuffer, HostBuffer, KernelLaunch,
    Notification, StackConfig, UserTrace,
};
pub use fault::{DeviceErrorCode, DeviceFault, ErrorContext, ERROR_CONTEXT_GPRS};
pub use traits::DeviceLayer;
pub use types::{ApiVersion, ArchRevision, CommandTag, DeviceIndex, DeviceProperties, DmaInfo, FormFactor, QueueId};
