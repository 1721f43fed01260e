//! Commands submitted to a device and the notifications they produce

use super::fault::{DeviceFault, ErrorContext};
use super::types::{CommandTag, DeviceIndex, QueueId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Host memory a device may write into after submission returns
///
/// Device-to-host copies complete asynchronously, so the destination is a
/// shared buffer rather than a borrowed slice. Clones alias the same bytes.
#[derive(Clone, Default)]
pub struct HostBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HostBuffer {
    /// Zero-filled buffer of `len` bytes
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current contents
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Run `f` over the contents without copying them
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.lock())
    }

    /// Run `f` over the contents mutably
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes.lock())
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer").field("len", &self.len()).finish()
    }
}

/// Fields common to every command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub tag: CommandTag,
    pub queue: QueueId,
    /// Do not start before every earlier command of `queue` has completed
    pub barrier: bool,
}

/// User trace capture configuration for a launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserTrace {
    pub buffer: u64,
    pub buffer_size: u64,
    /// Free-space threshold that triggers a trace flush
    pub threshold: u64,
    pub shire_mask: u64,
    pub thread_mask: u64,
    pub event_mask: u64,
    pub filter_mask: u64,
}

/// Kernel stack placement for a launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConfig {
    pub base_address: u64,
    pub size: u64,
}

/// Everything the device needs to start a kernel
#[derive(Debug, Clone)]
pub struct KernelLaunch {
    /// Device address the code image was loaded at
    pub code_address: u64,
    pub code_size: u64,
    pub entry_address: u64,
    pub args: Arc<[u8]>,
    pub shire_mask: u64,
    pub flush_l3: bool,
    pub user_trace: Option<UserTrace>,
    pub stack: Option<StackConfig>,
}

/// A raw command for one device
#[derive(Debug, Clone)]
pub enum DeviceCommand {
    HostToDevice {
        header: CommandHeader,
        src: Arc<[u8]>,
        dst: u64,
    },
    DeviceToHost {
        header: CommandHeader,
        src: u64,
        dst: HostBuffer,
        len: u64,
    },
    DeviceToDevice {
        header: CommandHeader,
        src: u64,
        dst_device: DeviceIndex,
        dst: u64,
        len: u64,
    },
    LoadCode {
        header: CommandHeader,
        image: Arc<[u8]>,
        dst: u64,
    },
    KernelLaunch {
        header: CommandHeader,
        launch: KernelLaunch,
    },
}

/// Coarse command classification used for logging and fault matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    LoadCode,
    KernelLaunch,
}

impl CommandKind {
    /// Moves bytes without running code
    pub fn is_dma(self) -> bool {
        !matches!(self, CommandKind::KernelLaunch)
    }
}

impl DeviceCommand {
    pub fn header(&self) -> &CommandHeader {
        match self {
            DeviceCommand::HostToDevice { header, .. }
            | DeviceCommand::DeviceToHost { header, .. }
            | DeviceCommand::DeviceToDevice { header, .. }
            | DeviceCommand::LoadCode { header, .. }
            | DeviceCommand::KernelLaunch { header, .. } => header,
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            DeviceCommand::HostToDevice { .. } => CommandKind::HostToDevice,
            DeviceCommand::DeviceToHost { .. } => CommandKind::DeviceToHost,
            DeviceCommand::DeviceToDevice { .. } => CommandKind::DeviceToDevice,
            DeviceCommand::LoadCode { .. } => CommandKind::LoadCode,
            DeviceCommand::KernelLaunch { .. } => CommandKind::KernelLaunch,
        }
    }

    /// Bytes moved by a DMA command, zero for launches
    pub fn transfer_len(&self) -> u64 {
        match self {
            DeviceCommand::HostToDevice { src, .. } => src.len() as u64,
            DeviceCommand::DeviceToHost { len, .. } | DeviceCommand::DeviceToDevice { len, .. } => *len,
            DeviceCommand::LoadCode { image, .. } => image.len() as u64,
            DeviceCommand::KernelLaunch { .. } => 0,
        }
    }
}

/// Raw fault diagnostics handed over with a kernel abort
///
/// The bytes live in device-side diagnostic memory; [`DiagnosticBuffer::release`]
/// returns that memory to the device. Release runs exactly once: explicitly,
/// or when the buffer is dropped.
pub struct DiagnosticBuffer {
    bytes: Vec<u8>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DiagnosticBuffer {
    pub fn new(bytes: Vec<u8>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            bytes,
            release: Some(Box::new(release)),
        }
    }

    /// A buffer with no device-side backing to give back
    pub fn detached(bytes: Vec<u8>) -> Self {
        Self { bytes, release: None }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode the leading [`ErrorContext`] record, if the payload holds one
    pub fn error_context(&self) -> Option<ErrorContext> {
        ErrorContext::from_bytes(&self.bytes)
    }

    /// Give the backing memory back to the device
    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for DiagnosticBuffer {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl fmt::Debug for DiagnosticBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticBuffer")
            .field("len", &self.bytes.len())
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// How a command ended
#[derive(Debug)]
pub enum CommandOutcome {
    Completed,
    Failed(DeviceFault),
    /// Fatal, unrecoverable execution fault of a kernel
    KernelAborted {
        fault: DeviceFault,
        diagnostics: DiagnosticBuffer,
    },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Completed)
    }

    pub fn fault(&self) -> Option<&DeviceFault> {
        match self {
            CommandOutcome::Completed => None,
            CommandOutcome::Failed(fault) | CommandOutcome::KernelAborted { fault, .. } => Some(fault),
        }
    }
}

/// Completion record delivered through [`crate::DeviceLayer::next_notification`]
#[derive(Debug)]
pub struct Notification {
    pub device: DeviceIndex,
    pub queue: QueueId,
    pub tag: CommandTag,
    pub outcome: CommandOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn diagnostic_buffer_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&released);
        let buffer = DiagnosticBuffer::new(vec![1, 2, 3], move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(buffer.len(), 3);
        buffer.release();
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&released);
        let dropped = DiagnosticBuffer::new(vec![0; 4], move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(dropped);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn host_buffer_clones_alias() {
        let buffer = HostBuffer::new(4);
        let alias = buffer.clone();
        alias.with_bytes_mut(|bytes| bytes.copy_from_slice(&[9, 8, 7, 6]));
        assert_eq!(buffer.to_vec(), vec![9, 8, 7, 6]);
    }

    #[test]
    fn command_classification() {
        let header = CommandHeader {
            tag: CommandTag(1),
            queue: QueueId(0),
            barrier: false,
        };
        let cmd = DeviceCommand::HostToDevice {
            header,
            src: Arc::from(vec![0u8; 32]),
            dst: 0x1000,
        };
        assert_eq!(cmd.kind(), CommandKind::HostToDevice);
        assert!(cmd.kind().is_dma());
        assert_eq!(cmd.transfer_len(), 32);
        assert_eq!(cmd.header().tag, CommandTag(1));
    }
}
