//! System-emulator device layer construction
//!
//! `SysEmuOptions` is the serializable knob set for simulated devices. It
//! can be built in code or read from JSON so test harnesses can share one
//! configuration file.

use super::sim::{SimConfig, SimDeviceLayer, MAX_KERNEL_ARGS};
use crate::error::{DeviceLayerError, Result};
use crate::layer::{ApiVersion, ArchRevision, DeviceProperties, DmaInfo, FormFactor};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Start of the host-visible DRAM window (past the firmware carve-out)
pub const DEFAULT_DRAM_BASE: u64 = 0x80_0400_0000;
/// 16 GiB of DRAM minus the 64 MiB firmware carve-out
pub const DEFAULT_MEMORY_SIZE: u64 = (16 << 30) - (64 << 20);
/// Firmware API version reported by the emulator
pub const DEFAULT_API_VERSION: ApiVersion = ApiVersion::new(1, 2, 0);

/// Options for one emulated device
///
/// Firmware, executable and run-directory paths are opaque to the
/// in-process model and carried through for tooling that inspects them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SysEmuOptions {
    pub bootrom_trampoline_to_bl2_elf_path: Option<PathBuf>,
    pub sp_bl2_elf_path: Option<PathBuf>,
    pub machine_minion_elf_path: Option<PathBuf>,
    pub master_minion_elf_path: Option<PathBuf>,
    pub worker_minion_elf_path: Option<PathBuf>,
    pub executable_path: Option<PathBuf>,
    pub run_dir: Option<PathBuf>,
    pub frequency_mhz: u32,
    pub dram_base_address: u64,
    pub memory_size: u64,
    /// Enabled compute shires
    pub minion_shires_mask: u64,
    pub minimum_address_alignment_bits: u32,
    pub dma_max_element_size: u64,
    pub dma_max_element_count: u64,
    pub api_version: ApiVersion,
    pub p2p: bool,
    /// Kernel cycle budget; launches running longer report a hang
    pub max_cycles: u64,
    /// Reverse unfenced commands that arrive within this many milliseconds.
    /// Setting it makes the layer report concurrent DMA support.
    pub reorder_unfenced_ms: Option<u64>,
    /// Path of the PU UART0 console log
    pub pu_uart0_path: Option<PathBuf>,
}

impl Default for SysEmuOptions {
    fn default() -> Self {
        Self {
            bootrom_trampoline_to_bl2_elf_path: None,
            sp_bl2_elf_path: None,
            machine_minion_elf_path: None,
            master_minion_elf_path: None,
            worker_minion_elf_path: None,
            executable_path: None,
            run_dir: None,
            frequency_mhz: 1000,
            dram_base_address: DEFAULT_DRAM_BASE,
            memory_size: DEFAULT_MEMORY_SIZE,
            minion_shires_mask: 0xFFFF_FFFF,
            minimum_address_alignment_bits: 6,
            dma_max_element_size: 128 << 20,
            dma_max_element_count: 4,
            api_version: DEFAULT_API_VERSION,
            p2p: true,
            max_cycles: 2_000_000_000,
            reorder_unfenced_ms: None,
            pu_uart0_path: None,
        }
    }
}

impl SysEmuOptions {
    /// Load options from a JSON file; absent fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| DeviceLayerError::invalid_options(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.minion_shires_mask == 0 {
            return Err(DeviceLayerError::invalid_options("minion_shires_mask enables no shire"));
        }
        if self.max_cycles == 0 {
            return Err(DeviceLayerError::invalid_options("max_cycles must be non-zero"));
        }
        if self.memory_size == 0 {
            return Err(DeviceLayerError::invalid_options("memory_size must be non-zero"));
        }
        if self.dram_base_address.checked_add(self.memory_size).is_none() {
            return Err(DeviceLayerError::invalid_options("DRAM window overflows the address space"));
        }
        if self.minimum_address_alignment_bits > 30 {
            return Err(DeviceLayerError::invalid_options("minimum alignment above 1 GiB"));
        }
        if self.dram_base_address % (1u64 << self.minimum_address_alignment_bits) != 0 {
            return Err(DeviceLayerError::invalid_options(
                "DRAM base is not aligned to the minimum alignment",
            ));
        }
        Ok(())
    }
}

impl From<&SysEmuOptions> for SimConfig {
    fn from(opts: &SysEmuOptions) -> Self {
        SimConfig {
            properties: DeviceProperties {
                frequency_mhz: opts.frequency_mhz,
                available_shires: opts.minion_shires_mask.count_ones(),
                memory_bandwidth: 25_600,
                memory_size: opts.memory_size,
                l3_size: 32 << 20,
                l2_shire_size: 4 << 20,
                l2_scratchpad_size: 2 << 20,
                cache_line_size: 64,
                l2_cache_banks: 4,
                compute_minion_shire_mask: opts.minion_shires_mask,
                spare_compute_minion_shire_id: 32,
                device_arch: ArchRevision::EtSoc1,
                form_factor: FormFactor::Pcie,
                tdp: 25,
                p2p_bitmap: 0,
                dram_base_address: opts.dram_base_address,
                minimum_address_alignment_bits: opts.minimum_address_alignment_bits,
                num_chiplets: 1,
            },
            dma_info: DmaInfo {
                max_element_size: opts.dma_max_element_size,
                max_element_count: opts.dma_max_element_count,
            },
            api_version: opts.api_version,
            p2p: opts.p2p,
            supports_concurrent_dma: opts.reorder_unfenced_ms.is_some(),
            cycle_budget: opts.max_cycles,
            max_kernel_args: MAX_KERNEL_ARGS,
            reorder_window: opts.reorder_unfenced_ms.map(Duration::from_millis),
            uart_log: opts.pu_uart0_path.clone(),
        }
    }
}

/// Create a device layer with `num_devices` identically configured emulated devices
pub fn create_sysemu_device_layer(options: &SysEmuOptions, num_devices: usize) -> Result<SimDeviceLayer> {
    if num_devices == 0 {
        return Err(DeviceLayerError::invalid_options("num_devices must be at least 1"));
    }
    options.validate()?;
    SimDeviceLayer::uniform(SimConfig::from(options), num_devices)
}

/// Create a device layer with one emulated device per entry of `options`
pub fn create_sysemu_device_layer_multi(options: &[SysEmuOptions]) -> Result<SimDeviceLayer> {
    if options.is_empty() {
        return Err(DeviceLayerError::invalid_options("no device options given"));
    }
    for opts in options {
        opts.validate()?;
    }
    SimDeviceLayer::new(options.iter().map(SimConfig::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{DeviceIndex, DeviceLayer};

    #[test]
    fn defaults_describe_one_etsoc() {
        let layer = create_sysemu_device_layer(&SysEmuOptions::default(), 1).unwrap();
        let props = layer.device_properties(DeviceIndex(0)).unwrap();
        assert_eq!(props.available_shires, 32);
        assert_eq!(props.dram_base_address, DEFAULT_DRAM_BASE);
        assert_eq!(props.minimum_alignment(), 64);
        assert_eq!(layer.dma_info(DeviceIndex(0)).unwrap().max_transfer_size(), 512 << 20);
        assert_eq!(layer.api_version(DeviceIndex(0)).unwrap(), DEFAULT_API_VERSION);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let opts: SysEmuOptions = serde_json::from_str(r#"{"frequency_mhz": 800, "p2p": false}"#).unwrap();
        assert_eq!(opts.frequency_mhz, 800);
        assert!(!opts.p2p);
        assert_eq!(opts.memory_size, DEFAULT_MEMORY_SIZE);
    }

    #[test]
    fn loads_options_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sysemu.json");
        std::fs::write(
            &path,
            r#"{"minion_shires_mask": 15, "run_dir": "/tmp/sysemu", "max_cycles": 1000}"#,
        )
        .unwrap();

        let opts = SysEmuOptions::from_json_file(&path).unwrap();
        assert_eq!(opts.minion_shires_mask, 0xF);
        assert_eq!(opts.run_dir.as_deref(), Some(Path::new("/tmp/sysemu")));
    }

    #[test]
    fn rejects_misaligned_dram() {
        let opts = SysEmuOptions {
            dram_base_address: DEFAULT_DRAM_BASE + 8,
            ..SysEmuOptions::default()
        };
        assert!(matches!(
            create_sysemu_device_layer(&opts, 1),
            Err(DeviceLayerError::InvalidOptions(_))
        ));
    }

    #[test]
    fn rejects_empty_shire_mask_and_device_count() {
        let opts = SysEmuOptions {
            minion_shires_mask: 0,
            ..SysEmuOptions::default()
        };
        assert!(create_sysemu_device_layer(&opts, 1).is_err());
        assert!(create_sysemu_device_layer(&SysEmuOptions::default(), 0).is_err());
        assert!(create_sysemu_device_layer_multi(&[]).is_err());
    }

    #[test]
    fn per_device_options() {
        let small = SysEmuOptions {
            minion_shires_mask: 0x3,
            p2p: false,
            ..SysEmuOptions::default()
        };
        let layer = create_sysemu_device_layer_multi(&[SysEmuOptions::default(), small]).unwrap();
        assert_eq!(layer.device_count(), 2);
        assert_eq!(layer.device_properties(DeviceIndex(0)).unwrap().available_shires, 32);
        assert_eq!(layer.device_properties(DeviceIndex(1)).unwrap().available_shires, 2);
        assert!(!layer.is_p2p_enabled(DeviceIndex(0), DeviceIndex(1)).unwrap());
    }

    #[test]
    fn reordering_reports_concurrent_dma() {
        let layer = create_sysemu_device_layer(&SysEmuOptions::default(), 1).unwrap();
        assert!(!layer.supports_concurrent_dma());

        let opts = SysEmuOptions {
            reorder_unfenced_ms: Some(10),
            ..SysEmuOptions::default()
        };
        let layer = create_sysemu_device_layer(&opts, 2).unwrap();
        assert!(layer.supports_concurrent_dma());
    }

    #[test]
    fn p2p_bitmap_excludes_self() {
        let layer = create_sysemu_device_layer(&SysEmuOptions::default(), 3).unwrap();
        let props = layer.device_properties(DeviceIndex(1)).unwrap();
        assert_eq!(props.p2p_bitmap, 0b101);
        assert!(layer.is_p2p_enabled(DeviceIndex(0), DeviceIndex(2)).unwrap());
    }
}
