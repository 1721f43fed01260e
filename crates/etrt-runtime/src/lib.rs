//! Asynchronous execution runtime for shire-based RISC-V accelerators
//!
//! The runtime drives devices exposed by an [`etrt_device::DeviceLayer`]:
//! it allocates device memory, moves data between host and device, loads
//! and launches kernels, and reports completion and device faults.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Runtime                             │
//! │                                                               │
//! │  MemoryManager ×device   StreamEngine   KernelManager         │
//! │          │                    │  submit        │ code space   │
//! │          │                    ▼                ▼              │
//! │          │               EventTable ◄──── ErrorReporter       │
//! │          │             (wait / poll)     (etrt-notify thread) │
//! └──────────┼────────────────────┬───────────────▲──────────────┘
//!            │                    │ DeviceCommand │ Notification
//!            ▼                    ▼               │
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 DeviceLayer (sysemu / PCIe)                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every submission returns an [`EventId`] immediately. Events resolve on
//! the notification thread; callers observe them with
//! [`Runtime::wait_for_event`] or [`Runtime::poll_event`]. Device faults
//! are queued per stream ([`Runtime::retrieve_stream_errors`]) and mirrored
//! to the optional callbacks.
//!
//! # Ordering
//!
//! Operations of one stream are issued in submission order. An operation
//! with `barrier` set starts only after every earlier operation of its
//! stream completed. Without it a device that supports concurrent DMA may
//! overlap it with earlier ones; on any other device the stream is first
//! in, first out. Nothing orders operations of different streams.
//!
//! # Large transfers
//!
//! A single copy may not exceed [`etrt_device::DmaInfo::max_transfer_size`];
//! the runtime never splits copies on the caller's behalf.

pub mod error;
pub mod event;
pub mod ids;
pub mod kernel;
pub mod memory;
pub mod reporter;
pub mod runtime;
pub mod stream;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use ids::{DeviceId, DevicePtr, EventId, KernelId, StreamId};
pub use kernel::MAX_KERNEL_ARGS_SIZE;
pub use reporter::{KernelAbortContext, KernelAbortedCallback, StreamErrorCallback};
pub use runtime::{Runtime, DEFAULT_SHUTDOWN_TIMEOUT, REQUIRED_DEVICE_API};
pub use types::{
    DeviceBuffer, KernelLaunchOptions, KernelState, LoadCodeResult, Options, PendingResult, StackConfig, StreamError,
    UserTrace,
};

pub use etrt_device::{DeviceErrorCode, DeviceProperties, DmaInfo, ErrorContext, HostBuffer};
