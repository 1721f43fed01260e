//! Runtime facade
//!
//! Composes the per-device memory managers, the stream engine, the event
//! table, the kernel manager and the error reporter over one device layer.
//!
//! # Threading
//!
//! Every call runs on the caller's thread and only blocks inside the
//! `wait_*` family. Distinct streams may be driven from different threads
//! without external locking; concurrent calls on the same stream must be
//! serialised by the caller. Completions are processed on the runtime's
//! `etrt-notify` thread, which also runs the registered callbacks.

use crate::error::{Error, Result};
use crate::event::EventTable;
use crate::ids::{DeviceId, DevicePtr, EventId, KernelId, StreamId};
use crate::kernel::KernelManager;
use crate::memory::MemoryManager;
use crate::reporter::{ErrorReporter, KernelAbortContext};
use crate::stream::{StreamEngine, ABORT_GRACE};
use crate::types::{
    DeviceBuffer, KernelLaunchOptions, KernelState, LoadCodeResult, Options, PendingResult, StreamError,
};
use bytemuck::Pod;
use etrt_device::image::MIN_IMAGE_ALIGNMENT;
use etrt_device::{ApiVersion, DeviceCommand, DeviceLayer, DeviceProperties, DmaInfo, HostBuffer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Oldest firmware device API this runtime drives
pub const REQUIRED_DEVICE_API: ApiVersion = ApiVersion::new(1, 0, 0);

/// Drain budget used when a runtime is dropped without `shutdown`
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

struct DeviceSlot {
    id: DeviceId,
    properties: DeviceProperties,
    dma_info: DmaInfo,
    memory: MemoryManager,
}

/// Asynchronous execution runtime over one device layer
///
/// # Example
///
/// ```
/// use etrt_device::{create_sysemu_device_layer, HostBuffer, SysEmuOptions};
/// use etrt_runtime::{Options, Runtime};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let layer = Arc::new(create_sysemu_device_layer(&SysEmuOptions::default(), 1)?);
/// let runtime = Runtime::create(layer, Options::default())?;
///
/// let device = runtime.get_devices()[0];
/// let stream = runtime.create_stream(device)?;
/// let buffer = runtime.malloc_device(device, 4096, 64)?;
///
/// runtime.memcpy_host_to_device(stream, &[7u8; 4096], buffer.ptr(), false)?;
/// let out = HostBuffer::new(4096);
/// let event = runtime.memcpy_device_to_host(stream, buffer.ptr(), &out, 4096, true)?;
/// assert!(runtime.wait_for_event(event, Duration::from_secs(10))?);
/// assert!(out.to_vec().iter().all(|&b| b == 7));
///
/// runtime.free_device(device, buffer)?;
/// runtime.destroy_stream(stream)?;
/// # Ok(())
/// # }
/// ```
pub struct Runtime {
    layer: Arc<dyn DeviceLayer>,
    options: Options,
    devices: Vec<DeviceSlot>,
    events: Arc<EventTable>,
    streams: Arc<StreamEngine>,
    kernels: KernelManager,
    reporter: ErrorReporter,
    shut_down: AtomicBool,
}

impl Runtime {
    /// Enumerate the layer's devices and start the notification thread
    ///
    /// # Errors
    ///
    /// [`Error::IncompatibleDeviceApi`] when `check_device_api_version` is
    /// set and a device's firmware API is older than
    /// [`REQUIRED_DEVICE_API`] or of another major version.
    #[tracing::instrument(skip(layer))]
    pub fn create(layer: Arc<dyn DeviceLayer>, options: Options) -> Result<Self> {
        let start = Instant::now();
        let mut devices = Vec::with_capacity(layer.device_count());
        let mut code_space = Vec::with_capacity(layer.device_count());

        for index in 0..layer.device_count() {
            let id = DeviceId::from_raw(index as u32);
            let properties = layer.device_properties(id.into())?;
            let dma_info = layer.dma_info(id.into())?;

            if options.check_device_api_version {
                let found = layer.api_version(id.into())?;
                if !found.satisfies(&REQUIRED_DEVICE_API) {
                    return Err(Error::IncompatibleDeviceApi {
                        device: id,
                        found,
                        required: REQUIRED_DEVICE_API,
                    });
                }
            }

            let code_size = (options.code_space_size.min(properties.memory_size / 4)) & !(MIN_IMAGE_ALIGNMENT - 1);
            let data_size = properties.memory_size - code_size;
            let code_base = properties.dram_base_address + data_size;
            code_space.push((id, code_base, code_size));

            let memory = MemoryManager::new(
                id,
                properties.dram_base_address,
                data_size,
                properties.minimum_alignment(),
            );
            tracing::info!(
                device = %id,
                arch = ?properties.device_arch,
                shires = properties.available_shires,
                memory_size = properties.memory_size,
                code_space = code_size,
                "device_attached"
            );
            devices.push(DeviceSlot {
                id,
                properties,
                dma_info,
                memory,
            });
        }

        let events = Arc::new(EventTable::new());
        let streams = Arc::new(StreamEngine::new(Arc::clone(&layer), Arc::clone(&events)));
        let kernels = KernelManager::new(Arc::clone(&events), code_space);
        let reporter = ErrorReporter::start(Arc::clone(&layer), Arc::clone(&events), Arc::clone(&streams))?;

        tracing::info!(
            devices = devices.len(),
            duration_us = start.elapsed().as_micros() as u64,
            "runtime_created"
        );
        Ok(Self {
            layer,
            options,
            devices,
            events,
            streams,
            kernels,
            reporter,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    pub fn get_devices(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|d| d.id).collect()
    }

    pub fn device_properties(&self, device: DeviceId) -> Result<DeviceProperties> {
        Ok(self.slot(device)?.properties.clone())
    }

    /// DMA limits of a device; copies larger than
    /// [`DmaInfo::max_transfer_size`] must be split by the caller
    pub fn dma_info(&self, device: DeviceId) -> Result<DmaInfo> {
        Ok(self.slot(device)?.dma_info)
    }

    pub fn is_p2p_enabled(&self, a: DeviceId, b: DeviceId) -> Result<bool> {
        self.slot(a)?;
        self.slot(b)?;
        Ok(self.layer.is_p2p_enabled(a.into(), b.into())?)
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub fn malloc_device(&self, device: DeviceId, size: u64, alignment: u64) -> Result<DeviceBuffer> {
        self.ensure_running()?;
        self.slot(device)?.memory.malloc(size, alignment)
    }

    #[tracing::instrument(skip(self))]
    pub fn free_device(&self, device: DeviceId, buffer: DeviceBuffer) -> Result<()> {
        self.slot(device)?.memory.free(&buffer)
    }

    /// Live allocations of a device
    pub fn outstanding_allocations(&self, device: DeviceId) -> Result<usize> {
        Ok(self.slot(device)?.memory.outstanding())
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub fn create_stream(&self, device: DeviceId) -> Result<StreamId> {
        self.ensure_running()?;
        self.slot(device)?;
        Ok(self.streams.create(device))
    }

    /// Destroy a stream whose events have all resolved
    ///
    /// # Errors
    ///
    /// [`Error::StreamBusy`] while any event of the stream is unresolved.
    #[tracing::instrument(skip(self))]
    pub fn destroy_stream(&self, stream: StreamId) -> Result<()> {
        self.streams.destroy(stream)
    }

    /// Wait up to `timeout` for the stream to drain, abort whatever is
    /// still pending, then destroy it
    #[tracing::instrument(skip(self))]
    pub fn destroy_stream_forced(&self, stream: StreamId, timeout: Duration) -> Result<()> {
        self.streams.destroy_forced(stream, timeout)
    }

    // ------------------------------------------------------------------
    // Copies
    // ------------------------------------------------------------------

    /// Queue a copy of `src` to device address `dst`
    ///
    /// `src` is captured at submission; the caller may reuse it on return.
    #[tracing::instrument(skip(self, src), fields(size = src.len()))]
    pub fn memcpy_host_to_device(&self, stream: StreamId, src: &[u8], dst: DevicePtr, barrier: bool) -> Result<EventId> {
        self.ensure_running()?;
        let device = self.streams.device_of(stream)?;
        let size = src.len() as u64;
        self.check_copy(device, dst, size)?;

        let data: Arc<[u8]> = Arc::from(src);
        self.streams.submit(stream, barrier, |header| DeviceCommand::HostToDevice {
            header,
            src: data,
            dst: dst.address(),
        })
    }

    /// Queue a copy of `size` device bytes at `src` into `dst`
    ///
    /// `dst` is filled when the returned event resolves successfully.
    #[tracing::instrument(skip(self, dst))]
    pub fn memcpy_device_to_host(
        &self,
        stream: StreamId,
        src: DevicePtr,
        dst: &HostBuffer,
        size: u64,
        barrier: bool,
    ) -> Result<EventId> {
        self.ensure_running()?;
        let device = self.streams.device_of(stream)?;
        if (dst.len() as u64) < size {
            return Err(Error::HostBufferTooSmall {
                required: size,
                actual: dst.len() as u64,
            });
        }
        self.check_copy(device, src, size)?;

        let out = dst.clone();
        self.streams.submit(stream, barrier, |header| DeviceCommand::DeviceToHost {
            header,
            src: src.address(),
            dst: out,
            len: size,
        })
    }

    /// Queue a copy from the stream's device to `device_dst`
    ///
    /// Cross-device copies require peer-to-peer DMA between the two devices.
    #[tracing::instrument(skip(self))]
    pub fn memcpy_device_to_device(
        &self,
        stream_src: StreamId,
        device_dst: DeviceId,
        src: DevicePtr,
        dst: DevicePtr,
        size: u64,
        barrier: bool,
    ) -> Result<EventId> {
        self.ensure_running()?;
        let device_src = self.streams.device_of(stream_src)?;
        self.slot(device_dst)?;
        if device_src != device_dst && !self.layer.is_p2p_enabled(device_src.into(), device_dst.into())? {
            return Err(Error::P2pDisabled {
                src: device_src,
                dst: device_dst,
            });
        }
        self.check_copy(device_src, src, size)?;
        self.check_copy(device_dst, dst, size)?;

        self.streams.submit(stream_src, barrier, |header| DeviceCommand::DeviceToDevice {
            header,
            src: src.address(),
            dst_device: device_dst.into(),
            dst: dst.address(),
            len: size,
        })
    }

    fn check_copy(&self, device: DeviceId, address: DevicePtr, size: u64) -> Result<()> {
        let slot = self.slot(device)?;
        if size == 0 {
            return Err(Error::invalid_size("copy of zero bytes"));
        }
        let max = slot.dma_info.max_transfer_size();
        if size > max {
            return Err(Error::TransferTooLarge { size, max });
        }
        if self.options.check_memcpy_device_operations && !slot.memory.contains_range(address.address(), size) {
            return Err(Error::OutOfBounds {
                device,
                address: address.address(),
                size,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Kernels
    // ------------------------------------------------------------------

    /// Queue the load of an ELF code image on `stream`
    ///
    /// The returned kernel id and addresses may only be launched once
    /// `event` has resolved successfully. A launch issued before then on
    /// the same stream is fenced behind the load; one issued on another
    /// stream races it.
    #[tracing::instrument(skip(self, image), fields(image_size = image.len()))]
    pub fn load_code(&self, stream: StreamId, image: &[u8]) -> Result<LoadCodeResult> {
        self.ensure_running()?;
        self.kernels.load(&self.streams, stream, image)
    }

    /// Release a kernel's code space
    ///
    /// # Errors
    ///
    /// [`Error::KernelBusy`] while its load or a launch is unresolved,
    /// [`Error::UnknownKernel`] if it is already unloaded.
    #[tracing::instrument(skip(self))]
    pub fn unload_code(&self, kernel: KernelId) -> Result<()> {
        self.kernels.unload(kernel)
    }

    /// Queue an execution of `kernel` with a raw argument block
    #[tracing::instrument(skip(self, args), fields(args_size = args.len()))]
    pub fn kernel_launch(
        &self,
        stream: StreamId,
        kernel: KernelId,
        args: &[u8],
        options: &KernelLaunchOptions,
    ) -> Result<EventId> {
        self.ensure_running()?;
        self.kernels.launch(&self.streams, stream, kernel, args, options)
    }

    /// [`kernel_launch`](Self::kernel_launch) with a plain-data argument struct
    pub fn kernel_launch_with<T: Pod>(
        &self,
        stream: StreamId,
        kernel: KernelId,
        args: &T,
        options: &KernelLaunchOptions,
    ) -> Result<EventId> {
        self.kernel_launch(stream, kernel, bytemuck::bytes_of(args), options)
    }

    pub fn kernel_state(&self, kernel: KernelId) -> Result<KernelState> {
        self.kernels.state(kernel)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Block until `event` resolves or `timeout` elapses
    ///
    /// Returns `true` once resolved, successfully or not, and `false` on
    /// timeout. A timeout abandons only the wait.
    pub fn wait_for_event(&self, event: EventId, timeout: Duration) -> Result<bool> {
        self.events.wait(event, timeout)
    }

    pub fn poll_event(&self, event: EventId) -> Result<PendingResult> {
        self.events.poll(event)
    }

    /// Block until every operation submitted on `stream` so far resolved
    pub fn wait_for_stream(&self, stream: StreamId, timeout: Duration) -> Result<bool> {
        self.streams.wait(stream, timeout)
    }

    pub fn event_stream(&self, event: EventId) -> Result<StreamId> {
        self.events.stream_of(event)
    }

    // ------------------------------------------------------------------
    // Errors and aborts
    // ------------------------------------------------------------------

    /// Take the device faults queued on `stream`
    pub fn retrieve_stream_errors(&self, stream: StreamId) -> Result<Vec<StreamError>> {
        self.streams.drain_errors(stream)
    }

    /// Register the stream-error callback, replacing any previous one
    ///
    /// Runs on the notification thread before the failed operation's event
    /// resolves. It must not wait on events of this runtime.
    pub fn set_on_stream_errors_callback<F>(&self, callback: F)
    where
        F: Fn(EventId, &StreamError) + Send + Sync + 'static,
    {
        self.reporter.callbacks().set_stream_error(Some(Arc::new(callback)));
    }

    pub fn clear_on_stream_errors_callback(&self) {
        self.reporter.callbacks().set_stream_error(None);
    }

    /// Register the kernel-abort callback, replacing any previous one
    ///
    /// The callback owns the [`KernelAbortContext`] and must call
    /// [`KernelAbortContext::free_resources`] once. Without a registered
    /// callback abort diagnostics are released immediately.
    ///
    /// An abort is also a stream error: the stream-error callback, if set,
    /// runs first for the same fault, then this one.
    pub fn set_on_kernel_aborted_callback<F>(&self, callback: F)
    where
        F: Fn(EventId, KernelAbortContext) + Send + Sync + 'static,
    {
        self.reporter.callbacks().set_kernel_aborted(Some(Arc::new(callback)));
    }

    pub fn clear_on_kernel_aborted_callback(&self) {
        self.reporter.callbacks().set_kernel_aborted(None);
    }

    /// Ask the device to abort the command behind `event` and wait up to
    /// `timeout` for it to resolve
    ///
    /// Returns whether the event is resolved on return. A command that
    /// already started may still complete successfully.
    #[tracing::instrument(skip(self))]
    pub fn abort_command(&self, event: EventId, timeout: Duration) -> Result<bool> {
        if self.events.poll(event)?.is_resolved() {
            return Ok(true);
        }
        let device = self.events.device_of(event)?;
        let pending = self
            .layer
            .abort(device.into(), etrt_device::CommandTag(event.as_raw()))?;
        tracing::debug!(event = %event, pending, "abort_requested");
        self.events.wait(event, timeout)
    }

    /// Abort every pending command of `stream`
    ///
    /// Returns how many commands the device still held.
    #[tracing::instrument(skip(self))]
    pub fn abort_stream(&self, stream: StreamId) -> Result<usize> {
        self.streams.abort_pending(stream)
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Force-drain every stream and stop the notification thread
    ///
    /// Streams get up to `timeout` to drain before their remaining commands
    /// are aborted. Buffers and kernels still held by the caller are
    /// reported as leaks. Later submissions fail with [`Error::Shutdown`].
    #[tracing::instrument(skip(self))]
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let started = Instant::now();
        let mut result = Ok(());

        for stream in self.streams.ids() {
            let remaining = timeout.saturating_sub(started.elapsed()).max(ABORT_GRACE);
            if let Err(e) = self.streams.destroy_forced(stream, remaining) {
                tracing::warn!(stream = %stream, error = %e, "stream_not_drained");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        for kernel in self.kernels.resident() {
            tracing::warn!(kernel = %kernel, "kernel_leaked");
        }
        for slot in &self.devices {
            let leaked = slot.memory.outstanding();
            if leaked > 0 {
                tracing::warn!(device = %slot.id, buffers = leaked, "device_buffers_leaked");
            }
        }

        self.reporter.stop();
        tracing::info!(
            pending_events = self.events.pending_count(),
            duration_us = started.elapsed().as_micros() as u64,
            "runtime_shut_down"
        );
        result
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    fn slot(&self, device: DeviceId) -> Result<&DeviceSlot> {
        self.devices
            .get(device.as_raw() as usize)
            .ok_or(Error::UnknownDevice(device))
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown(DEFAULT_SHUTDOWN_TIMEOUT) {
            tracing::warn!(error = %e, "runtime_drop_incomplete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etrt_device::{create_sysemu_device_layer, SysEmuOptions};

    fn runtime_with(sysemu: SysEmuOptions, options: Options) -> Result<Runtime> {
        let layer = Arc::new(create_sysemu_device_layer(&sysemu, 1).unwrap());
        Runtime::create(layer, options)
    }

    #[test]
    fn code_space_is_carved_from_the_top() {
        let runtime = runtime_with(SysEmuOptions::default(), Options::default()).unwrap();
        let dev = runtime.get_devices()[0];
        let props = runtime.device_properties(dev).unwrap();
        let stream = runtime.create_stream(dev).unwrap();

        let image = etrt_device::image::build_riscv_elf(&[0x13; 32], 0);
        let loaded = runtime.load_code(stream, &image).unwrap();
        assert_eq!(
            loaded.load_address.address(),
            props.dram_end_address() - Options::default().code_space_size
        );
        assert!(runtime.wait_for_event(loaded.event, Duration::from_secs(10)).unwrap());
        assert_eq!(runtime.kernel_state(loaded.kernel).unwrap(), KernelState::Loaded);
        runtime.unload_code(loaded.kernel).unwrap();
    }

    #[test]
    fn old_firmware_is_refused() {
        let sysemu = SysEmuOptions {
            api_version: ApiVersion::new(0, 9, 0),
            ..SysEmuOptions::default()
        };
        assert!(matches!(
            runtime_with(sysemu.clone(), Options::default()),
            Err(Error::IncompatibleDeviceApi { .. })
        ));

        let unchecked = Options {
            check_device_api_version: false,
            ..Options::default()
        };
        assert!(runtime_with(sysemu, unchecked).is_ok());
    }

    #[test]
    fn copy_validation() {
        let runtime = runtime_with(SysEmuOptions::default(), Options::default()).unwrap();
        let dev = runtime.get_devices()[0];
        let stream = runtime.create_stream(dev).unwrap();
        let buffer = runtime.malloc_device(dev, 256, 64).unwrap();

        assert!(matches!(
            runtime.memcpy_host_to_device(stream, &[], buffer.ptr(), false),
            Err(Error::InvalidSize(_))
        ));
        assert!(matches!(
            runtime.memcpy_host_to_device(stream, &[0; 512], buffer.ptr(), false),
            Err(Error::OutOfBounds { .. })
        ));
        let small = HostBuffer::new(16);
        assert!(matches!(
            runtime.memcpy_device_to_host(stream, buffer.ptr(), &small, 64, false),
            Err(Error::HostBufferTooSmall { .. })
        ));
        assert!(matches!(
            runtime.create_stream(DeviceId::from_raw(3)),
            Err(Error::UnknownDevice(_))
        ));
        runtime.free_device(dev, buffer).unwrap();
    }

    #[test]
    fn submissions_fail_after_shutdown() {
        let runtime = runtime_with(SysEmuOptions::default(), Options::default()).unwrap();
        let dev = runtime.get_devices()[0];
        let stream = runtime.create_stream(dev).unwrap();
        runtime.shutdown(Duration::from_secs(1)).unwrap();
        assert!(matches!(runtime.create_stream(dev), Err(Error::Shutdown)));
        assert!(matches!(
            runtime.retrieve_stream_errors(stream),
            Err(Error::UnknownStream(_))
        ));
        runtime.shutdown(Duration::from_secs(1)).unwrap();
    }
}
