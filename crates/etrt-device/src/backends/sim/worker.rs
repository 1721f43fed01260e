//! Per-device command processor
//!
//! Each simulated device owns one thread draining its command channel in
//! FIFO order. Outcomes go to the layer-wide notification channel.

use super::faults::InjectedFault;
use super::kernels::{exception_context, KernelContext, KernelFault};
use super::{DeviceState, Shared};
use crate::layer::{
    CommandKind, CommandOutcome, DeviceCommand, DeviceErrorCode, DeviceFault, DeviceIndex, ErrorContext, KernelLaunch,
    Notification,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Harts per compute shire
const HARTS_PER_SHIRE: u64 = 64;

pub(crate) enum WorkerMessage {
    Execute(DeviceCommand),
    Shutdown,
}

pub(crate) struct Worker {
    tx: Sender<WorkerMessage>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn(device: DeviceIndex, shared: Arc<Shared>) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name(format!("etrt-sim-{device}"))
            .spawn(move || run(device, shared, rx))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    pub(crate) fn send(&self, command: DeviceCommand) -> bool {
        self.tx.send(WorkerMessage::Execute(command)).is_ok()
    }

    pub(crate) fn stop(&mut self) {
        let _ = self.tx.send(WorkerMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("simulated device worker panicked");
            }
        }
    }
}

fn run(device: DeviceIndex, shared: Arc<Shared>, rx: Receiver<WorkerMessage>) {
    tracing::debug!(device = %device, "sim_worker_started");
    let mut held: Option<DeviceCommand> = None;

    loop {
        let first = match held.take() {
            Some(command) => command,
            None => match rx.recv() {
                Ok(WorkerMessage::Execute(command)) => command,
                Ok(WorkerMessage::Shutdown) | Err(_) => break,
            },
        };

        let mut batch = vec![first];
        let mut stop = false;
        if let Some(window) = shared.devices[device.index() as usize].config.reorder_window {
            // Gather unfenced commands and run them newest-first
            if !batch[0].header().barrier {
                loop {
                    match rx.recv_timeout(window) {
                        Ok(WorkerMessage::Execute(next)) if next.header().barrier => {
                            held = Some(next);
                            break;
                        }
                        Ok(WorkerMessage::Execute(next)) => batch.push(next),
                        Ok(WorkerMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                            stop = true;
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => break,
                    }
                }
                batch.reverse();
            }
        }

        for command in batch {
            let notification = execute(device, &shared, command);
            if shared.notify.send(notification).is_err() {
                return;
            }
        }
        if stop {
            break;
        }
    }

    tracing::debug!(device = %device, "sim_worker_stopped");
}

fn execute(device: DeviceIndex, shared: &Shared, command: DeviceCommand) -> Notification {
    let header = *command.header();
    let kind = command.kind();
    let state = &shared.devices[device.index() as usize];

    let abort_flag = Arc::new(AtomicBool::new(false));
    let aborted = state.begin(header.tag, Arc::clone(&abort_flag));

    let outcome = if aborted {
        CommandOutcome::Failed(DeviceFault::new(host_aborted_code(kind)))
    } else if let Some(injected) = shared.faults.take(device, kind) {
        tracing::debug!(device = %device, tag = %header.tag, ?injected, "sim_fault_injected");
        match injected {
            InjectedFault::Fail { code, shire_mask } => {
                let mut fault = DeviceFault::new(code);
                fault.shire_mask = shire_mask;
                CommandOutcome::Failed(fault)
            }
            InjectedFault::Abort { context } => CommandOutcome::KernelAborted {
                fault: DeviceFault::new(DeviceErrorCode::KernelLaunchException).with_context(context),
                diagnostics: shared.diagnostics(context.as_bytes().to_vec()),
            },
        }
    } else {
        match command {
            DeviceCommand::KernelLaunch { launch, .. } => launch_kernel(device, shared, state, &launch, &abort_flag),
            DeviceCommand::HostToDevice { src, dst, .. } => {
                completion(dma_check(state, src.len() as u64).and_then(|_| write_memory(state, dst, &src)))
            }
            DeviceCommand::LoadCode { image, dst, .. } => {
                completion(dma_check(state, image.len() as u64).and_then(|_| write_memory(state, dst, &image)))
            }
            DeviceCommand::DeviceToHost { src, dst, len, .. } => completion(dma_check(state, len).and_then(|_| {
                if (dst.len() as u64) < len {
                    return Err(DeviceFault::new(DeviceErrorCode::DmaInvalidSize));
                }
                let memory = state.memory.lock();
                dst.with_bytes_mut(|bytes| memory.read(src, &mut bytes[..len as usize]))
                    .map_err(|_| DeviceFault::new(DeviceErrorCode::DmaInvalidAddress))
            })),
            DeviceCommand::DeviceToDevice {
                src,
                dst_device,
                dst,
                len,
                ..
            } => completion(dma_check(state, len).and_then(|_| copy_to_peer(device, shared, src, dst_device, dst, len))),
        }
    };

    state.finish();
    tracing::debug!(
        device = %device,
        queue = %header.queue,
        tag = %header.tag,
        ?kind,
        success = outcome.is_success(),
        "sim_command_done"
    );
    Notification {
        device,
        queue: header.queue,
        tag: header.tag,
        outcome,
    }
}

fn host_aborted_code(kind: CommandKind) -> DeviceErrorCode {
    match kind {
        CommandKind::KernelLaunch => DeviceErrorCode::KernelLaunchHostAborted,
        _ => DeviceErrorCode::DmaHostAborted,
    }
}

fn completion(result: Result<(), DeviceFault>) -> CommandOutcome {
    match result {
        Ok(()) => CommandOutcome::Completed,
        Err(fault) => CommandOutcome::Failed(fault),
    }
}

fn dma_check(state: &DeviceState, len: u64) -> Result<(), DeviceFault> {
    if len > state.config.dma_info.max_transfer_size() {
        Err(DeviceFault::new(DeviceErrorCode::DmaInvalidSize))
    } else {
        Ok(())
    }
}

fn write_memory(state: &DeviceState, dst: u64, data: &[u8]) -> Result<(), DeviceFault> {
    state
        .memory
        .lock()
        .write(dst, data)
        .map_err(|_| DeviceFault::new(DeviceErrorCode::DmaInvalidAddress))
}

fn copy_to_peer(
    device: DeviceIndex,
    shared: &Shared,
    src: u64,
    dst_device: DeviceIndex,
    dst: u64,
    len: u64,
) -> Result<(), DeviceFault> {
    let Some(peer) = shared.devices.get(dst_device.index() as usize) else {
        return Err(DeviceFault::new(DeviceErrorCode::DmaInvalidAddress));
    };
    let source = &shared.devices[device.index() as usize];
    if dst_device != device && !(source.config.p2p && peer.config.p2p) {
        return Err(DeviceFault::new(DeviceErrorCode::DmaUnexpectedError));
    }

    let mut staging = vec![0u8; len as usize];
    source
        .memory
        .lock()
        .read(src, &mut staging)
        .map_err(|_| DeviceFault::new(DeviceErrorCode::DmaInvalidAddress))?;
    write_memory(peer, dst, &staging)
}

fn launch_kernel(
    device: DeviceIndex,
    shared: &Shared,
    state: &DeviceState,
    launch: &KernelLaunch,
    abort: &AtomicBool,
) -> CommandOutcome {
    let props = &state.config.properties;
    let compute_mask = props.compute_minion_shire_mask;

    let invalid = launch.shire_mask & !compute_mask;
    if launch.shire_mask == 0 || invalid != 0 {
        return CommandOutcome::Failed(
            DeviceFault::new(DeviceErrorCode::KernelLaunchInvalidArgsInvalidShireMask)
                .with_shire_mask(if invalid != 0 { invalid } else { launch.shire_mask }),
        );
    }
    if launch.args.len() > state.config.max_kernel_args {
        return CommandOutcome::Failed(DeviceFault::new(DeviceErrorCode::KernelLaunchInvalidArgsPayloadSize));
    }
    if let Some(trace) = &launch.user_trace {
        if trace.shire_mask & !compute_mask != 0 {
            return CommandOutcome::Failed(
                DeviceFault::new(DeviceErrorCode::TraceConfigBadShireMask)
                    .with_shire_mask(trace.shire_mask & !compute_mask),
            );
        }
        if trace.buffer_size == 0 || !state.memory.lock().contains(trace.buffer, trace.buffer_size) {
            return CommandOutcome::Failed(DeviceFault::new(DeviceErrorCode::TraceConfigInvalidConfig));
        }
    }
    if let Some(stack) = &launch.stack {
        if !state.memory.lock().contains(stack.base_address, stack.size) {
            return CommandOutcome::Failed(DeviceFault::new(DeviceErrorCode::KernelLaunchInvalidAddress));
        }
    }

    let mut memory = state.memory.lock();
    let mut code = vec![0u8; launch.code_size as usize];
    let kernel = match memory.read(launch.code_address, &mut code) {
        Ok(()) => shared.kernels.lookup(&code),
        Err(_) => None,
    };
    let Some(kernel) = kernel.filter(|k| launch.code_address.checked_add(k.entry_offset) == Some(launch.entry_address)) else {
        drop(memory);
        state.uart_line(format_args!(
            "{device}: launch at {:#x}: no runnable image",
            launch.entry_address
        ));
        return CommandOutcome::Failed(DeviceFault::new(DeviceErrorCode::KernelLaunchInvalidAddress));
    };

    let mut ctx = KernelContext::new(
        &mut memory,
        &launch.args,
        launch.shire_mask,
        props.frequency_mhz as u64,
        state.config.cycle_budget,
        abort,
    );
    let result = (kernel.handler)(&mut ctx);
    let cycles = ctx.cycles();
    let console = ctx.take_console();
    drop(memory);

    for line in &console {
        state.uart_line(format_args!("{device}: {}: {line}", kernel.name));
    }

    let first_shire = launch.shire_mask.trailing_zeros() as u64;
    let outcome = match result {
        Ok(()) => CommandOutcome::Completed,
        Err(KernelFault::Exception { mcause, mtval }) => {
            let mut context = exception_context(mcause, mtval, launch.entry_address, cycles);
            context.hart_id = first_shire * HARTS_PER_SHIRE;
            CommandOutcome::KernelAborted {
                fault: DeviceFault::new(DeviceErrorCode::KernelLaunchException)
                    .with_shire_mask(1 << first_shire)
                    .with_context(context),
                diagnostics: shared.diagnostics(context.as_bytes().to_vec()),
            }
        }
        Err(KernelFault::UserError(status)) => {
            let context = ErrorContext {
                user_defined_error: status,
                cycle: cycles,
                hart_id: first_shire * HARTS_PER_SHIRE,
                ..ErrorContext::default()
            };
            CommandOutcome::Failed(
                DeviceFault::new(DeviceErrorCode::KernelLaunchResponseUserError)
                    .with_shire_mask(launch.shire_mask)
                    .with_context(context),
            )
        }
        Err(KernelFault::Timeout) => CommandOutcome::Failed(
            DeviceFault::new(DeviceErrorCode::KernelLaunchTimeoutHang).with_shire_mask(launch.shire_mask),
        ),
        Err(KernelFault::HostAborted) => {
            CommandOutcome::Failed(DeviceFault::new(DeviceErrorCode::KernelLaunchHostAborted))
        }
    };

    state.uart_line(format_args!(
        "{device}: {} entry={:#x} shires={:#x} cycles={cycles} -> {}",
        kernel.name,
        launch.entry_address,
        launch.shire_mask,
        outcome.fault().map_or("OK", |f| f.code.as_str())
    ));
    outcome
}

impl DeviceState {
    fn uart_line(&self, line: std::fmt::Arguments<'_>) {
        if let Some(uart) = &self.uart {
            let mut file = uart.lock();
            if let Err(err) = writeln!(file, "{line}") {
                tracing::warn!(error = %err, "sim_uart_write_failed");
            }
        }
    }
}
