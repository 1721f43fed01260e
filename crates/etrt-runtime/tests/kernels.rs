//! Kernel loading, launching and abort reporting

mod common;

use common::{fixture, fixture_with, TIMEOUT};
use etrt_device::backends::sim::kernels::{BuiltinKernel, MemOpsParams};
use etrt_device::SysEmuOptions;
use etrt_runtime::{
    DeviceErrorCode, Error, HostBuffer, KernelAbortContext, KernelId, KernelLaunchOptions, KernelState, Options,
    PendingResult, Result, StreamError,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn launching_an_unknown_kernel_fails() {
    let f = fixture();
    let result = f
        .runtime
        .kernel_launch(f.stream, KernelId::from_raw(999), &[], &KernelLaunchOptions::default());
    assert!(matches!(result, Err(Error::UnknownKernel(_))));
}

#[test]
fn memset_kernel_fills_buffer() -> Result<()> {
    let f = fixture();
    let buffer = f.runtime.malloc_device(f.device, 1024, 64)?;

    let loaded = f.runtime.load_code(f.stream, &BuiltinKernel::MemOps.elf())?;
    assert!(f.runtime.wait_for_event(loaded.event, TIMEOUT)?);
    assert_eq!(f.runtime.kernel_state(loaded.kernel)?, KernelState::Loaded);

    let params = MemOpsParams::memset(buffer.address, 0x42, 1024);
    let launch = f
        .runtime
        .kernel_launch_with(f.stream, loaded.kernel, &params, &KernelLaunchOptions::default())?;
    assert!(f.runtime.wait_for_event(launch, TIMEOUT)?);
    assert_eq!(f.runtime.poll_event(launch)?, PendingResult::Completed);

    let out = HostBuffer::new(1024);
    let read = f.runtime.memcpy_device_to_host(f.stream, buffer.ptr(), &out, 1024, true)?;
    assert!(f.runtime.wait_for_event(read, TIMEOUT)?);
    assert_eq!(out.to_vec(), vec![0x42; 1024]);

    f.runtime.unload_code(loaded.kernel)?;
    assert!(matches!(
        f.runtime.kernel_launch_with(f.stream, loaded.kernel, &params, &KernelLaunchOptions::default()),
        Err(Error::UnknownKernel(_))
    ));
    f.runtime.free_device(f.device, buffer)
}

#[test]
fn launch_queued_behind_load_on_same_stream() -> Result<()> {
    let f = fixture();
    let buffer = f.runtime.malloc_device(f.device, 256, 64)?;
    let loaded = f.runtime.load_code(f.stream, &BuiltinKernel::MemOps.elf())?;

    let params = MemOpsParams::memset(buffer.address, 0x11, 256);
    let options = KernelLaunchOptions::new(0x1).with_barrier(true);
    let launch = f.runtime.kernel_launch_with(f.stream, loaded.kernel, &params, &options)?;
    assert!(f.runtime.wait_for_event(launch, TIMEOUT)?);
    assert_eq!(f.runtime.poll_event(launch)?, PendingResult::Completed);

    f.runtime.unload_code(loaded.kernel)?;
    f.runtime.free_device(f.device, buffer)
}

#[test]
fn unfenced_launch_waits_for_load_on_its_stream() -> Result<()> {
    let sysemu = SysEmuOptions {
        reorder_unfenced_ms: Some(200),
        ..SysEmuOptions::default()
    };
    let f = fixture_with(sysemu, Options::default());
    let buffer = f.runtime.malloc_device(f.device, 512, 64)?;
    let loaded = f.runtime.load_code(f.stream, &BuiltinKernel::MemOps.elf())?;

    let params = MemOpsParams::memset(buffer.address, 0x42, 512);
    let options = KernelLaunchOptions::new(0x1).with_barrier(false);
    let launch = f.runtime.kernel_launch_with(f.stream, loaded.kernel, &params, &options)?;
    assert!(f.runtime.wait_for_event(launch, TIMEOUT)?);
    assert_eq!(f.runtime.poll_event(loaded.event)?, PendingResult::Completed);
    assert_eq!(f.runtime.poll_event(launch)?, PendingResult::Completed);

    let out = HostBuffer::new(512);
    let read = f.runtime.memcpy_device_to_host(f.stream, buffer.ptr(), &out, 512, true)?;
    assert!(f.runtime.wait_for_event(read, TIMEOUT)?);
    assert_eq!(out.to_vec(), vec![0x42; 512]);

    f.runtime.unload_code(loaded.kernel)?;
    f.runtime.free_device(f.device, buffer)
}

#[test]
fn unload_waits_for_launches() -> Result<()> {
    let f = fixture();
    let loaded = f.runtime.load_code(f.stream, &BuiltinKernel::Spin.elf())?;
    assert!(f.runtime.wait_for_event(loaded.event, TIMEOUT)?);

    let launch = f
        .runtime
        .kernel_launch(f.stream, loaded.kernel, &[], &KernelLaunchOptions::new(0x1))?;
    assert!(matches!(
        f.runtime.unload_code(loaded.kernel),
        Err(Error::KernelBusy { .. })
    ));

    assert!(f.runtime.abort_command(launch, TIMEOUT)?);
    assert_eq!(
        f.runtime.poll_event(launch)?,
        PendingResult::Failed(DeviceErrorCode::KernelLaunchHostAborted)
    );
    f.runtime.unload_code(loaded.kernel)?;
    assert_eq!(f.runtime.kernel_state(loaded.kernel)?, KernelState::Unloaded);
    Ok(())
}

#[test]
fn offending_shires_reach_the_stream_error() -> Result<()> {
    let sysemu = SysEmuOptions {
        minion_shires_mask: 0xF,
        ..SysEmuOptions::default()
    };
    let f = fixture_with(sysemu, Options::default());
    let loaded = f.runtime.load_code(f.stream, &BuiltinKernel::UserStatus.elf())?;

    let launch = f
        .runtime
        .kernel_launch(f.stream, loaded.kernel, &[], &KernelLaunchOptions::new(0x31))?;
    assert!(f.runtime.wait_for_event(launch, TIMEOUT)?);

    let errors = f.runtime.retrieve_stream_errors(f.stream)?;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_code, DeviceErrorCode::KernelLaunchInvalidArgsInvalidShireMask);
    assert_eq!(errors[0].cm_shire_mask, Some(0x30));
    assert_eq!(errors[0].stream, Some(f.stream));
    Ok(())
}

#[test]
fn kernel_abort_hands_over_diagnostics_once() -> Result<()> {
    let f = fixture();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(None));

    {
        let calls = Arc::clone(&calls);
        let seen = Arc::clone(&seen);
        f.runtime
            .set_on_kernel_aborted_callback(move |event, context: KernelAbortContext| {
                calls.fetch_add(1, Ordering::SeqCst);
                *seen.lock() = Some((event, context.len(), context.error_context()));
                context.free_resources();
            });
    }

    let loaded = f.runtime.load_code(f.stream, &BuiltinKernel::Trap.elf())?;
    let launch = f
        .runtime
        .kernel_launch(f.stream, loaded.kernel, &[], &KernelLaunchOptions::new(0x1))?;
    assert!(f.runtime.wait_for_event(launch, TIMEOUT)?);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let (event, len, context) = seen.lock().take().expect("abort delivered");
    assert_eq!(event, launch);
    assert!(len >= etrt_runtime::ErrorContext::SIZE);
    let context = context.expect("error context decodes");
    assert_eq!(context.mepc, loaded.entry_address.address());
    assert_eq!(f.layer.outstanding_diagnostics(), 0);

    let errors = f.runtime.retrieve_stream_errors(f.stream)?;
    assert_eq!(errors[0].error_code, DeviceErrorCode::KernelLaunchException);
    Ok(())
}

#[test]
fn kernel_abort_runs_stream_error_callback_first() -> Result<()> {
    let f = fixture();
    let order = Arc::new(Mutex::new(Vec::new()));

    {
        let order = Arc::clone(&order);
        f.runtime.set_on_stream_errors_callback(move |_, error: &StreamError| {
            order.lock().push(("stream_error", error.error_code));
        });
    }
    {
        let order = Arc::clone(&order);
        f.runtime
            .set_on_kernel_aborted_callback(move |_, context: KernelAbortContext| {
                order.lock().push(("kernel_aborted", DeviceErrorCode::KernelLaunchException));
                context.free_resources();
            });
    }

    let loaded = f.runtime.load_code(f.stream, &BuiltinKernel::Trap.elf())?;
    let launch = f
        .runtime
        .kernel_launch(f.stream, loaded.kernel, &[], &KernelLaunchOptions::new(0x1))?;
    assert!(f.runtime.wait_for_event(launch, TIMEOUT)?);

    assert_eq!(
        *order.lock(),
        vec![
            ("stream_error", DeviceErrorCode::KernelLaunchException),
            ("kernel_aborted", DeviceErrorCode::KernelLaunchException),
        ]
    );
    assert_eq!(f.layer.outstanding_diagnostics(), 0);
    Ok(())
}

#[test]
fn abort_diagnostics_released_without_callback() -> Result<()> {
    let f = fixture();
    let loaded = f.runtime.load_code(f.stream, &BuiltinKernel::Trap.elf())?;
    let launch = f
        .runtime
        .kernel_launch(f.stream, loaded.kernel, &[], &KernelLaunchOptions::new(0x1))?;
    assert!(f.runtime.wait_for_event(launch, TIMEOUT)?);
    assert_eq!(f.layer.outstanding_diagnostics(), 0);
    assert_eq!(
        f.runtime.poll_event(launch)?,
        PendingResult::Failed(DeviceErrorCode::KernelLaunchException)
    );
    Ok(())
}

#[test]
fn kernel_on_another_device_is_rejected() -> Result<()> {
    common::init();
    let layer = Arc::new(etrt_device::create_sysemu_device_layer(&SysEmuOptions::default(), 2)?);
    let runtime = etrt_runtime::Runtime::create(layer, Options::default())?;
    let devices = runtime.get_devices();
    let s0 = runtime.create_stream(devices[0])?;
    let s1 = runtime.create_stream(devices[1])?;

    let loaded = runtime.load_code(s0, &BuiltinKernel::UserStatus.elf())?;
    assert!(runtime.wait_for_event(loaded.event, TIMEOUT)?);
    assert!(matches!(
        runtime.kernel_launch(s1, loaded.kernel, &[], &KernelLaunchOptions::new(0x1)),
        Err(Error::KernelDeviceMismatch { .. })
    ));
    Ok(())
}
