//! Shared fixtures for runtime integration tests

#![allow(dead_code)]

use etrt_device::{create_sysemu_device_layer, SimDeviceLayer, SysEmuOptions};
use etrt_runtime::{DeviceId, Options, Runtime, StreamId};
use std::sync::Arc;
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(30);

pub struct Fixture {
    pub layer: Arc<SimDeviceLayer>,
    pub runtime: Runtime,
    pub device: DeviceId,
    pub stream: StreamId,
}

pub fn fixture() -> Fixture {
    fixture_with(SysEmuOptions::default(), Options::default())
}

pub fn init() {
    etrt_tracing::init_for_tests();
}

pub fn fixture_with(sysemu: SysEmuOptions, options: Options) -> Fixture {
    init();
    let layer = Arc::new(create_sysemu_device_layer(&sysemu, 1).expect("sysemu layer"));
    let runtime = Runtime::create(layer.clone(), options).expect("runtime");
    let device = runtime.get_devices()[0];
    let stream = runtime.create_stream(device).expect("stream");
    Fixture {
        layer,
        runtime,
        device,
        stream,
    }
}

/// Deterministic test pattern
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
