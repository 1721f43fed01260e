//! Kernel manager
//!
//! Loads code images into a per-device code space and tracks each kernel
//! through `Loading -> Loaded -> Unloaded`.
//!
//! Loading is asynchronous. The kernel id and addresses returned by
//! [`KernelManager::load`] are placeholders until the load event resolves
//! successfully. Launching before then is not prevented. A launch on the
//! load stream is fenced behind the load while the kernel is still loading;
//! a launch on another stream races it. Callers wait on the load event first.

use crate::error::{Error, Result};
use crate::event::EventTable;
use crate::ids::{DeviceId, DevicePtr, EventId, KernelId, StreamId};
use crate::memory::RangeAllocator;
use crate::stream::StreamEngine;
use crate::types::{KernelLaunchOptions, KernelState, LoadCodeResult, PendingResult};
use etrt_device::{CodeImage, DeviceCommand, KernelLaunch};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Largest argument block a launch may carry
pub const MAX_KERNEL_ARGS_SIZE: usize = 4096;

#[derive(Debug)]
struct KernelRecord {
    device: DeviceId,
    stream: StreamId,
    load_event: EventId,
    address: u64,
    size: u64,
    entry_address: u64,
    state: KernelState,
    /// Launch events not yet observed as resolved
    launches: Vec<EventId>,
}

/// Code-space owner and kernel registry of a runtime
///
/// Records of unloaded kernels are kept for the lifetime of the runtime so
/// their ids keep answering [`KernelState::Unloaded`].
pub struct KernelManager {
    events: Arc<EventTable>,
    code_space: HashMap<DeviceId, Mutex<RangeAllocator>>,
    kernels: Mutex<HashMap<KernelId, KernelRecord>>,
    next_id: AtomicU32,
}

impl KernelManager {
    /// `code_space` maps each device to its `(base, size)` code range
    pub fn new(events: Arc<EventTable>, code_space: impl IntoIterator<Item = (DeviceId, u64, u64)>) -> Self {
        Self {
            events,
            code_space: code_space
                .into_iter()
                .map(|(device, base, size)| (device, Mutex::new(RangeAllocator::new(base, size))))
                .collect(),
            kernels: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Parse `image`, reserve code space and queue the copy on `stream`
    pub fn load(&self, streams: &StreamEngine, stream: StreamId, image: &[u8]) -> Result<LoadCodeResult> {
        let device = streams.device_of(stream)?;
        let image = CodeImage::parse(image).map_err(|e| Error::InvalidCodeImage(e.to_string()))?;
        let space = self.code_space.get(&device).ok_or(Error::UnknownDevice(device))?;

        let size = image.load_size();
        let address = space
            .lock()
            .allocate(size, image.alignment())
            .ok_or(Error::OutOfCodeSpace {
                device,
                requested: size,
            })?;

        let bytes = Arc::clone(image.bytes());
        let event = match streams.submit(stream, false, |header| DeviceCommand::LoadCode {
            header,
            image: bytes,
            dst: address,
        }) {
            Ok(event) => event,
            Err(e) => {
                space.lock().free(address);
                return Err(e);
            }
        };

        let kernel = KernelId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry_address = address + image.entry_offset();
        self.kernels.lock().insert(
            kernel,
            KernelRecord {
                device,
                stream,
                load_event: event,
                address,
                size,
                entry_address,
                state: KernelState::Loading,
                launches: Vec::new(),
            },
        );
        tracing::debug!(
            kernel = %kernel,
            device = %device,
            event = %event,
            address = format_args!("{address:#x}"),
            size,
            "kernel_load_queued"
        );

        Ok(LoadCodeResult {
            event,
            kernel,
            load_address: DevicePtr(address),
            entry_address: DevicePtr(entry_address),
        })
    }

    /// Queue an execution of `kernel` on `stream`
    pub fn launch(
        &self,
        streams: &StreamEngine,
        stream: StreamId,
        kernel: KernelId,
        args: &[u8],
        options: &KernelLaunchOptions,
    ) -> Result<EventId> {
        let stream_device = streams.device_of(stream)?;
        if args.len() > MAX_KERNEL_ARGS_SIZE {
            return Err(Error::KernelArgsTooLarge {
                size: args.len(),
                max: MAX_KERNEL_ARGS_SIZE,
            });
        }
        if options.shire_mask == 0 {
            return Err(Error::InvalidShireMask {
                mask: 0,
                reason: "no shire selected",
            });
        }

        let mut kernels = self.kernels.lock();
        let record = kernels.get_mut(&kernel).ok_or(Error::UnknownKernel(kernel))?;
        refresh(&self.events, record);
        match record.state {
            KernelState::Unloaded => return Err(Error::UnknownKernel(kernel)),
            KernelState::LoadFailed => return Err(Error::KernelLoadFailed(kernel)),
            KernelState::Loading | KernelState::Loaded => {}
        }
        if record.device != stream_device {
            return Err(Error::KernelDeviceMismatch {
                kernel,
                kernel_device: record.device,
                stream_device,
            });
        }

        let launch = KernelLaunch {
            code_address: record.address,
            code_size: record.size,
            entry_address: record.entry_address,
            args: Arc::from(args),
            shire_mask: options.shire_mask,
            flush_l3: options.flush_l3,
            user_trace: options.user_trace,
            stack: options.stack,
        };
        // the load may still be queued unfenced ahead of this launch
        let barrier = options.barrier || (record.state == KernelState::Loading && record.stream == stream);
        let event = streams.submit(stream, barrier, |header| DeviceCommand::KernelLaunch {
            header,
            launch,
        })?;
        record.launches.push(event);
        Ok(event)
    }

    /// Release the code space of a kernel
    ///
    /// Refused while the load or any launch of the kernel is unresolved.
    pub fn unload(&self, kernel: KernelId) -> Result<()> {
        let mut kernels = self.kernels.lock();
        let record = kernels.get_mut(&kernel).ok_or(Error::UnknownKernel(kernel))?;
        refresh(&self.events, record);
        match record.state {
            KernelState::Unloaded => return Err(Error::UnknownKernel(kernel)),
            KernelState::Loading => {
                return Err(Error::KernelBusy {
                    kernel,
                    reason: "load in flight",
                })
            }
            KernelState::Loaded | KernelState::LoadFailed => {}
        }
        if !record.launches.is_empty() {
            return Err(Error::KernelBusy {
                kernel,
                reason: "launch in flight",
            });
        }

        if let Some(space) = self.code_space.get(&record.device) {
            space.lock().free(record.address);
        }
        record.state = KernelState::Unloaded;
        tracing::debug!(kernel = %kernel, device = %record.device, "kernel_unloaded");
        Ok(())
    }

    pub fn state(&self, kernel: KernelId) -> Result<KernelState> {
        let mut kernels = self.kernels.lock();
        let record = kernels.get_mut(&kernel).ok_or(Error::UnknownKernel(kernel))?;
        refresh(&self.events, record);
        Ok(record.state)
    }

    /// Kernels not yet unloaded
    pub fn resident(&self) -> Vec<KernelId> {
        let mut ids: Vec<KernelId> = self
            .kernels
            .lock()
            .iter()
            .filter(|(_, r)| r.state != KernelState::Unloaded)
            .map(|(&id, _)| id)
            .collect();
        ids.sort();
        ids
    }
}

/// Fold resolved load and launch events into the record
fn refresh(events: &EventTable, record: &mut KernelRecord) {
    if record.state == KernelState::Loading {
        match events.poll(record.load_event) {
            Ok(PendingResult::Completed) => record.state = KernelState::Loaded,
            Ok(PendingResult::Failed(_)) | Err(_) => record.state = KernelState::LoadFailed,
            Ok(PendingResult::Pending) => {}
        }
    }
    record
        .launches
        .retain(|&event| matches!(events.poll(event), Ok(PendingResult::Pending)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use etrt_device::image::build_riscv_elf;
    use etrt_device::{create_sysemu_device_layer, DeviceLayer, SysEmuOptions};

    const DEV: DeviceId = DeviceId::from_raw(0);
    const CODE_BASE: u64 = 0x90_0000_0000;

    struct Fixture {
        events: Arc<EventTable>,
        streams: StreamEngine,
        kernels: KernelManager,
    }

    fn fixture(code_size: u64) -> Fixture {
        let layer: Arc<dyn DeviceLayer> = Arc::new(create_sysemu_device_layer(&SysEmuOptions::default(), 1).unwrap());
        let events = Arc::new(EventTable::new());
        Fixture {
            streams: StreamEngine::new(layer, Arc::clone(&events)),
            kernels: KernelManager::new(Arc::clone(&events), [(DEV, CODE_BASE, code_size)]),
            events,
        }
    }

    #[test]
    fn rejects_malformed_images() {
        let f = fixture(1 << 20);
        let stream = f.streams.create(DEV);
        assert!(matches!(
            f.kernels.load(&f.streams, stream, b"not an elf"),
            Err(Error::InvalidCodeImage(_))
        ));
    }

    #[test]
    fn code_space_exhaustion() {
        let f = fixture(4096);
        let stream = f.streams.create(DEV);
        let image = build_riscv_elf(&[0x13; 8192], 0);
        assert!(matches!(
            f.kernels.load(&f.streams, stream, &image),
            Err(Error::OutOfCodeSpace { .. })
        ));
    }

    #[test]
    fn state_follows_load_event() {
        let f = fixture(1 << 20);
        let stream = f.streams.create(DEV);
        let image = build_riscv_elf(&[0x13; 64], 16);
        let loaded = f.kernels.load(&f.streams, stream, &image).unwrap();
        assert_eq!(loaded.load_address, DevicePtr(CODE_BASE));
        assert_eq!(loaded.entry_address, DevicePtr(CODE_BASE + 16));
        assert_eq!(f.kernels.state(loaded.kernel).unwrap(), KernelState::Loading);
        assert!(matches!(
            f.kernels.unload(loaded.kernel),
            Err(Error::KernelBusy { .. })
        ));

        f.events.resolve(loaded.event, PendingResult::Completed);
        assert_eq!(f.kernels.state(loaded.kernel).unwrap(), KernelState::Loaded);
        assert_eq!(f.kernels.resident(), vec![loaded.kernel]);
        f.kernels.unload(loaded.kernel).unwrap();
        assert_eq!(f.kernels.state(loaded.kernel).unwrap(), KernelState::Unloaded);
        assert!(f.kernels.resident().is_empty());
    }

    #[test]
    fn launch_validation() {
        let f = fixture(1 << 20);
        let stream = f.streams.create(DEV);
        let options = KernelLaunchOptions::default();
        assert!(matches!(
            f.kernels.launch(&f.streams, stream, KernelId::from_raw(42), &[], &options),
            Err(Error::UnknownKernel(_))
        ));

        let image = build_riscv_elf(&[0x13; 64], 0);
        let loaded = f.kernels.load(&f.streams, stream, &image).unwrap();
        f.events.resolve(loaded.event, PendingResult::Failed(etrt_device::DeviceErrorCode::DmaInvalidAddress));
        assert!(matches!(
            f.kernels.launch(&f.streams, stream, loaded.kernel, &[], &options),
            Err(Error::KernelLoadFailed(_))
        ));
        assert!(matches!(
            f.kernels
                .launch(&f.streams, stream, loaded.kernel, &[0; MAX_KERNEL_ARGS_SIZE + 1], &options),
            Err(Error::KernelArgsTooLarge { .. })
        ));
        assert!(matches!(
            f.kernels
                .launch(&f.streams, stream, loaded.kernel, &[], &options.with_shire_mask(0)),
            Err(Error::InvalidShireMask { .. })
        ));

        // Failed loads can still be unloaded to reclaim their code space
        f.kernels.unload(loaded.kernel).unwrap();
        assert!(matches!(
            f.kernels.launch(&f.streams, stream, loaded.kernel, &[], &options),
            Err(Error::UnknownKernel(_))
        ));
    }
}
