//! Handles and descriptive types exchanged with a device layer

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a device inside one device layer (`0..device_count()`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIndex(pub u32);

impl DeviceIndex {
    /// Create a new device index
    pub const fn new(index: u32) -> Self {
        DeviceIndex(index)
    }

    /// Get the raw index
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// Submission queue a command belongs to
///
/// The runtime uses one queue per stream; the device layer only needs it to
/// attribute faults and to scope aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u32);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Caller-chosen tag echoed back in the command's [`crate::Notification`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandTag(pub u64);

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag{}", self.0)
    }
}

/// Device architecture revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchRevision {
    EtSoc1,
    Pantero,
    Gepardo,
    Unknown,
}

/// Physical form factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormFactor {
    Pcie,
    M2,
}

/// Immutable hardware properties reported at enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    /// Boot frequency in MHz
    pub frequency_mhz: u32,
    /// Number of usable compute shires
    pub available_shires: u32,
    /// Memory bandwidth in MB/s
    pub memory_bandwidth: u32,
    /// Size in bytes of the host-visible DRAM window starting at `dram_base_address`
    pub memory_size: u64,
    pub l3_size: u32,
    pub l2_shire_size: u32,
    pub l2_scratchpad_size: u32,
    pub cache_line_size: u32,
    pub l2_cache_banks: u32,
    /// Bit `n` set when compute shire `n` may be targeted by a launch
    pub compute_minion_shire_mask: u64,
    pub spare_compute_minion_shire_id: u32,
    pub device_arch: ArchRevision,
    pub form_factor: FormFactor,
    /// Thermal design power in watts
    pub tdp: u32,
    /// Bit `n` set when peer-to-peer DMA to device `n` is possible
    pub p2p_bitmap: u64,
    /// First device address of the host-visible DRAM window
    pub dram_base_address: u64,
    /// log2 of the smallest address alignment the device accepts
    pub minimum_address_alignment_bits: u32,
    pub num_chiplets: u32,
}

impl DeviceProperties {
    /// One-past-the-end address of the DRAM window
    pub fn dram_end_address(&self) -> u64 {
        self.dram_base_address.saturating_add(self.memory_size)
    }

    /// Smallest alignment in bytes honoured for any device address
    pub fn minimum_alignment(&self) -> u64 {
        1u64 << self.minimum_address_alignment_bits.min(63)
    }
}

/// DMA constraints reported by the device
///
/// Informational: callers chunk large transfers themselves. A single
/// command may carry at most [`DmaInfo::max_transfer_size`] bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmaInfo {
    /// Maximum bytes per DMA list entry
    pub max_element_size: u64,
    /// Maximum entries per DMA command
    pub max_element_count: u64,
}

impl DmaInfo {
    /// Largest transfer one command can describe
    pub fn max_transfer_size(&self) -> u64 {
        self.max_element_size.saturating_mul(self.max_element_count)
    }
}

/// Firmware device-API version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Whether a host built against `required` can drive firmware at `self`
    pub fn satisfies(&self, required: &ApiVersion) -> bool {
        self.major == required.major && self.minor >= required.minor
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
