//! Simulated device layer
//!
//! A functional model of one or more devices: sparse DRAM, FIFO command
//! processing on a worker thread per device, host-side kernel handlers and
//! one-shot fault injection. It reproduces the observable contract of real
//! firmware (completion notifications, error codes, diagnostics lifetime)
//! without timing accuracy.

pub mod faults;
pub mod kernels;
pub mod memory;
mod worker;

use crate::error::{DeviceLayerError, Result};
use crate::layer::{
    ApiVersion, CommandTag, DeviceCommand, DeviceIndex, DeviceLayer, DeviceProperties, DiagnosticBuffer, DmaInfo,
    Notification,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use faults::{FaultInjector, FaultRule};
use kernels::{KernelFn, KernelRegistry};
use memory::SparseMemory;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use worker::Worker;

/// Largest kernel argument block the simulated firmware accepts
pub const MAX_KERNEL_ARGS: usize = 4096;

/// Behaviour of one simulated device
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub properties: DeviceProperties,
    pub dma_info: DmaInfo,
    pub api_version: ApiVersion,
    /// Take part in peer-to-peer DMA with other p2p-capable devices
    pub p2p: bool,
    pub supports_concurrent_dma: bool,
    /// Cycles a launch may run before it reports a hang
    pub cycle_budget: u64,
    pub max_kernel_args: usize,
    /// When set, unfenced commands arriving within this window of each
    /// other run in reverse order
    pub reorder_window: Option<Duration>,
    /// Device console output
    pub uart_log: Option<PathBuf>,
}

#[derive(Default)]
struct TagState {
    queued: HashSet<CommandTag>,
    aborted: HashSet<CommandTag>,
    running: Option<(CommandTag, Arc<AtomicBool>)>,
}

pub(crate) struct DeviceState {
    pub(crate) config: SimConfig,
    pub(crate) memory: Mutex<SparseMemory>,
    pub(crate) uart: Option<Mutex<File>>,
    tags: Mutex<TagState>,
}

impl DeviceState {
    fn new(config: SimConfig) -> Result<Self> {
        if config.properties.compute_minion_shire_mask == 0 {
            return Err(DeviceLayerError::invalid_options("compute shire mask is empty"));
        }
        if config.dma_info.max_transfer_size() == 0 {
            return Err(DeviceLayerError::invalid_options("DMA transfer size limit is zero"));
        }
        let uart = match &config.uart_log {
            Some(path) => Some(Mutex::new(OpenOptions::new().create(true).append(true).open(path)?)),
            None => None,
        };
        Ok(Self {
            memory: Mutex::new(SparseMemory::new(
                config.properties.dram_base_address,
                config.properties.memory_size,
            )),
            config,
            uart,
            tags: Mutex::new(TagState::default()),
        })
    }

    fn enqueue(&self, tag: CommandTag) {
        self.tags.lock().queued.insert(tag);
    }

    /// Mark `tag` running; returns true when it was aborted while queued
    pub(crate) fn begin(&self, tag: CommandTag, abort: Arc<AtomicBool>) -> bool {
        let mut tags = self.tags.lock();
        tags.queued.remove(&tag);
        if tags.aborted.remove(&tag) {
            return true;
        }
        tags.running = Some((tag, abort));
        false
    }

    pub(crate) fn finish(&self) {
        self.tags.lock().running = None;
    }

    fn abort(&self, tag: CommandTag) -> bool {
        let mut tags = self.tags.lock();
        if tags.queued.contains(&tag) {
            tags.aborted.insert(tag);
            return true;
        }
        match &tags.running {
            Some((running, flag)) if *running == tag => {
                flag.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) devices: Vec<DeviceState>,
    pub(crate) kernels: KernelRegistry,
    pub(crate) faults: FaultInjector,
    pub(crate) notify: Sender<Notification>,
    outstanding_diagnostics: Arc<AtomicUsize>,
}

impl Shared {
    /// Diagnostic buffer whose release is tracked by the layer
    pub(crate) fn diagnostics(&self, bytes: Vec<u8>) -> DiagnosticBuffer {
        let counter = Arc::clone(&self.outstanding_diagnostics);
        counter.fetch_add(1, Ordering::SeqCst);
        DiagnosticBuffer::new(bytes, move || {
            counter.fetch_sub(1, Ordering::SeqCst);
        })
    }
}

/// Simulated devices behind the [`DeviceLayer`] trait
///
/// # Example
///
/// ```
/// use etrt_device::backends::sim::{SimConfig, SimDeviceLayer};
/// use etrt_device::backends::sysemu::SysEmuOptions;
/// use etrt_device::DeviceLayer;
///
/// let layer = SimDeviceLayer::uniform(SimConfig::from(&SysEmuOptions::default()), 1)?;
/// assert_eq!(layer.device_count(), 1);
/// # Ok::<(), etrt_device::DeviceLayerError>(())
/// ```
pub struct SimDeviceLayer {
    shared: Arc<Shared>,
    workers: Vec<Worker>,
    notifications: Receiver<Notification>,
    shut_down: AtomicBool,
}

impl SimDeviceLayer {
    /// Start `num_devices` identical simulated devices
    pub fn uniform(config: SimConfig, num_devices: usize) -> Result<Self> {
        Self::new(vec![config; num_devices])
    }

    /// Start one simulated device per configuration
    pub fn new(configs: Vec<SimConfig>) -> Result<Self> {
        if configs.is_empty() {
            return Err(DeviceLayerError::invalid_options("at least one device is required"));
        }
        let devices = configs.into_iter().map(DeviceState::new).collect::<Result<Vec<_>>>()?;
        let num_devices = devices.len();

        let (notify, notifications) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            devices,
            kernels: KernelRegistry::with_builtins()?,
            faults: FaultInjector::default(),
            notify,
            outstanding_diagnostics: Arc::new(AtomicUsize::new(0)),
        });

        let mut workers = Vec::with_capacity(num_devices);
        for index in 0..num_devices {
            workers.push(Worker::spawn(DeviceIndex::new(index as u32), Arc::clone(&shared))?);
        }

        tracing::info!(devices = num_devices, "sim_device_layer_started");

        Ok(Self {
            shared,
            workers,
            notifications,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Configuration of the first device
    pub fn config(&self) -> &SimConfig {
        &self.shared.devices[0].config
    }

    pub fn device_config(&self, device: DeviceIndex) -> Result<&SimConfig> {
        Ok(&self.device(device)?.config)
    }

    /// Arm a one-shot fault
    pub fn inject_fault(&self, rule: FaultRule) {
        self.shared.faults.arm(rule);
    }

    /// Faults armed but not yet fired
    pub fn pending_faults(&self) -> usize {
        self.shared.faults.pending()
    }

    /// Run `handler` whenever the image in `elf` is launched
    pub fn register_kernel(&self, name: &str, elf: &[u8], handler: KernelFn) -> Result<()> {
        self.shared.kernels.register(name, elf, handler)
    }

    /// Kernel-abort diagnostic buffers handed out and not yet released
    pub fn outstanding_diagnostics(&self) -> usize {
        self.shared.outstanding_diagnostics.load(Ordering::SeqCst)
    }

    /// Read device memory directly, bypassing the command queues
    pub fn read_memory(&self, device: DeviceIndex, address: u64, len: usize) -> Result<Vec<u8>> {
        let state = self.device(device)?;
        let mut out = vec![0u8; len];
        state
            .memory
            .lock()
            .read(address, &mut out)
            .map_err(|e| DeviceLayerError::AddressOutOfRange {
                address: e.address,
                len: e.len,
            })?;
        Ok(out)
    }

    /// Write device memory directly, bypassing the command queues
    pub fn write_memory(&self, device: DeviceIndex, address: u64, data: &[u8]) -> Result<()> {
        self.device(device)?
            .memory
            .lock()
            .write(address, data)
            .map_err(|e| DeviceLayerError::AddressOutOfRange {
                address: e.address,
                len: e.len,
            })
    }

    /// Stop all workers; queued commands still complete
    pub fn shutdown(&mut self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for worker in &mut self.workers {
            worker.stop();
        }
        tracing::info!("sim_device_layer_stopped");
    }

    fn device(&self, device: DeviceIndex) -> Result<&DeviceState> {
        self.shared
            .devices
            .get(device.index() as usize)
            .ok_or(DeviceLayerError::NoSuchDevice(device.index()))
    }
}

impl DeviceLayer for SimDeviceLayer {
    fn device_count(&self) -> usize {
        self.shared.devices.len()
    }

    fn device_properties(&self, device: DeviceIndex) -> Result<DeviceProperties> {
        let mut props = self.device(device)?.config.properties.clone();
        props.p2p_bitmap = 0;
        for peer in 0..self.shared.devices.len().min(64) {
            let peer = DeviceIndex::new(peer as u32);
            if peer != device && self.is_p2p_enabled(device, peer)? {
                props.p2p_bitmap |= 1 << peer.index();
            }
        }
        Ok(props)
    }

    fn dma_info(&self, device: DeviceIndex) -> Result<DmaInfo> {
        Ok(self.device(device)?.config.dma_info)
    }

    fn api_version(&self, device: DeviceIndex) -> Result<ApiVersion> {
        Ok(self.device(device)?.config.api_version)
    }

    fn is_p2p_enabled(&self, a: DeviceIndex, b: DeviceIndex) -> Result<bool> {
        let (da, db) = (self.device(a)?, self.device(b)?);
        Ok(a == b || (da.config.p2p && db.config.p2p))
    }

    fn supports_concurrent_dma(&self) -> bool {
        self.shared.devices.iter().all(|d| d.config.supports_concurrent_dma)
    }

    fn submit(&self, device: DeviceIndex, command: DeviceCommand) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(DeviceLayerError::ShutDown);
        }
        let state = self.device(device)?;
        let tag = command.header().tag;
        tracing::trace!(device = %device, tag = %tag, kind = ?command.kind(), "sim_submit");

        state.enqueue(tag);
        if self.workers[device.index() as usize].send(command) {
            Ok(())
        } else {
            state.tags.lock().queued.remove(&tag);
            Err(DeviceLayerError::ShutDown)
        }
    }

    fn abort(&self, device: DeviceIndex, tag: CommandTag) -> Result<bool> {
        let found = self.device(device)?.abort(tag);
        tracing::debug!(device = %device, tag = %tag, found, "sim_abort");
        Ok(found)
    }

    fn next_notification(&self, timeout: Duration) -> Result<Option<Notification>> {
        match self.notifications.recv_timeout(timeout) {
            Ok(notification) => Ok(Some(notification)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(DeviceLayerError::ShutDown),
        }
    }
}

impl Drop for SimDeviceLayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::sysemu::SysEmuOptions;
    use crate::layer::{CommandHeader, CommandOutcome, DeviceErrorCode, HostBuffer, QueueId};

    fn layer() -> SimDeviceLayer {
        SimDeviceLayer::uniform(SimConfig::from(&SysEmuOptions::default()), 2).unwrap()
    }

    fn header(tag: u64) -> CommandHeader {
        CommandHeader {
            tag: CommandTag(tag),
            queue: QueueId(0),
            barrier: false,
        }
    }

    fn wait(layer: &SimDeviceLayer) -> Notification {
        layer
            .next_notification(Duration::from_secs(5))
            .unwrap()
            .expect("notification within timeout")
    }

    #[test]
    fn host_round_trip() {
        let layer = layer();
        let dev = DeviceIndex(0);
        let base = layer.config().properties.dram_base_address;

        layer
            .submit(
                dev,
                DeviceCommand::HostToDevice {
                    header: header(1),
                    src: Arc::from(&b"abcdef"[..]),
                    dst: base + 64,
                },
            )
            .unwrap();
        let out = HostBuffer::new(6);
        layer
            .submit(
                dev,
                DeviceCommand::DeviceToHost {
                    header: header(2),
                    src: base + 64,
                    dst: out.clone(),
                    len: 6,
                },
            )
            .unwrap();

        let first = wait(&layer);
        let second = wait(&layer);
        assert_eq!((first.tag, second.tag), (CommandTag(1), CommandTag(2)));
        assert!(first.outcome.is_success() && second.outcome.is_success());
        assert_eq!(out.to_vec(), b"abcdef");
    }

    #[test]
    fn dma_outside_dram_fails() {
        let layer = layer();
        layer
            .submit(
                DeviceIndex(1),
                DeviceCommand::HostToDevice {
                    header: header(9),
                    src: Arc::from(vec![0u8; 16]),
                    dst: 0x10,
                },
            )
            .unwrap();
        let n = wait(&layer);
        assert_eq!(n.device, DeviceIndex(1));
        assert_eq!(
            n.outcome.fault().map(|f| f.code),
            Some(DeviceErrorCode::DmaInvalidAddress)
        );
    }

    #[test]
    fn unknown_device_is_rejected() {
        let layer = layer();
        assert!(matches!(
            layer.dma_info(DeviceIndex(5)),
            Err(DeviceLayerError::NoSuchDevice(5))
        ));
    }

    #[test]
    fn injected_abort_tracks_diagnostics() {
        let layer = layer();
        layer.inject_fault(FaultRule::abort_kernel(Default::default()));
        layer
            .submit(
                DeviceIndex(0),
                DeviceCommand::KernelLaunch {
                    header: header(3),
                    launch: crate::layer::KernelLaunch {
                        code_address: 0,
                        code_size: 0,
                        entry_address: 0,
                        args: Arc::from(Vec::new()),
                        shire_mask: 1,
                        flush_l3: false,
                        user_trace: None,
                        stack: None,
                    },
                },
            )
            .unwrap();

        let n = wait(&layer);
        let CommandOutcome::KernelAborted { diagnostics, .. } = n.outcome else {
            panic!("expected kernel abort, got {:?}", n.outcome);
        };
        assert_eq!(layer.outstanding_diagnostics(), 1);
        diagnostics.release();
        assert_eq!(layer.outstanding_diagnostics(), 0);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let mut layer = layer();
        layer.shutdown();
        let err = layer
            .submit(
                DeviceIndex(0),
                DeviceCommand::HostToDevice {
                    header: header(1),
                    src: Arc::from(vec![1u8]),
                    dst: layer.config().properties.dram_base_address,
                },
            )
            .unwrap_err();
        assert!(matches!(err, DeviceLayerError::ShutDown));
    }
}
