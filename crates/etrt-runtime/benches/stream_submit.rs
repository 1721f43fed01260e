//! Benchmarks for stream submission and completion
//!
//! Measures the host-side cost of queueing copies and kernel launches and
//! the end-to-end latency of a submit-and-wait cycle on the emulator.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use etrt_device::backends::sim::kernels::{BuiltinKernel, MemOpsParams};
use etrt_device::{create_sysemu_device_layer, HostBuffer, SysEmuOptions};
use etrt_runtime::{KernelLaunchOptions, Options, Runtime};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(30);

fn runtime() -> Runtime {
    let layer = Arc::new(create_sysemu_device_layer(&SysEmuOptions::default(), 1).unwrap());
    Runtime::create(layer, Options::default()).unwrap()
}

fn benchmark_copy_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_round_trip");
    let rt = runtime();
    let device = rt.get_devices()[0];
    let stream = rt.create_stream(device).unwrap();

    for size in [64usize, 4096, 1 << 20].iter() {
        group.throughput(Throughput::Bytes(*size as u64 * 2));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |bencher, &size| {
            let buffer = rt.malloc_device(device, size as u64, 64).unwrap();
            let data = vec![0x5Au8; size];
            let out = HostBuffer::new(size);

            bencher.iter(|| {
                rt.memcpy_host_to_device(stream, black_box(&data), buffer.ptr(), false)
                    .unwrap();
                let event = rt
                    .memcpy_device_to_host(stream, buffer.ptr(), &out, size as u64, true)
                    .unwrap();
                rt.wait_for_event(event, TIMEOUT).unwrap();
            });

            rt.free_device(device, buffer).unwrap();
        });
    }

    group.finish();
}

fn benchmark_submission_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("submission_burst");
    let rt = runtime();
    let device = rt.get_devices()[0];
    let stream = rt.create_stream(device).unwrap();
    let buffer = rt.malloc_device(device, 4096, 64).unwrap();
    let data = vec![1u8; 4096];

    for burst in [16usize, 128].iter() {
        group.throughput(Throughput::Elements(*burst as u64));
        group.bench_with_input(BenchmarkId::from_parameter(burst), burst, |bencher, &burst| {
            bencher.iter(|| {
                for _ in 0..burst {
                    black_box(rt.memcpy_host_to_device(stream, &data, buffer.ptr(), false).unwrap());
                }
                rt.wait_for_stream(stream, TIMEOUT).unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_kernel_launch(c: &mut Criterion) {
    let rt = runtime();
    let device = rt.get_devices()[0];
    let stream = rt.create_stream(device).unwrap();
    let buffer = rt.malloc_device(device, 4096, 64).unwrap();
    let loaded = rt.load_code(stream, &BuiltinKernel::MemOps.elf()).unwrap();
    rt.wait_for_event(loaded.event, TIMEOUT).unwrap();

    let params = MemOpsParams::memset(buffer.address, 0x42, 4096);
    let options = KernelLaunchOptions::new(0x1);
    c.bench_function("memset_launch_and_wait", |bencher| {
        bencher.iter(|| {
            let event = rt.kernel_launch_with(stream, loaded.kernel, &params, &options).unwrap();
            rt.wait_for_event(event, TIMEOUT).unwrap();
        });
    });
}

criterion_group!(
    benches,
    benchmark_copy_round_trip,
    benchmark_submission_burst,
    benchmark_kernel_launch
);
criterion_main!(benches);
