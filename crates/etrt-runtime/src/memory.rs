//! Device memory management
//!
//! Each device's DRAM window is split in two ranges:
//!
//! ```text
//! dram_base                                   dram_end - code    dram_end
//! ├──────────────── data allocations ───────────────┼──── code ────┤
//! │              MemoryManager (malloc_device)       │ KernelManager │
//! ```
//!
//! Both ranges are served by a [`RangeAllocator`]: a best-fit free list kept
//! in address order so neighbouring free blocks coalesce on free.

use crate::error::{Error, Result};
use crate::ids::DeviceId;
use crate::types::DeviceBuffer;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Best-fit allocator over one address range
#[derive(Debug)]
pub struct RangeAllocator {
    /// Free blocks, start -> size
    free: BTreeMap<u64, u64>,
    /// Live allocations, start -> size
    live: BTreeMap<u64, u64>,
}

impl RangeAllocator {
    /// Allocator over `[base, base + size)`
    pub fn new(base: u64, size: u64) -> Self {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(base, size);
        }
        Self {
            free,
            live: BTreeMap::new(),
        }
    }

    /// Reserve `size` bytes at an address aligned to `alignment`
    ///
    /// `alignment` must be a power of two. Picks the smallest free block
    /// that fits, lowest address on ties.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        debug_assert!(alignment.is_power_of_two());
        if size == 0 {
            return None;
        }

        let mut best: Option<(u64, u64, u64)> = None;
        for (&start, &block) in &self.free {
            let Some(aligned) = align_up(start, alignment) else {
                continue;
            };
            let padding = aligned - start;
            if padding >= block || block - padding < size {
                continue;
            }
            if best.map_or(true, |(_, best_block, _)| block < best_block) {
                best = Some((start, block, aligned));
            }
        }

        let (start, block, aligned) = best?;
        self.free.remove(&start);
        if aligned > start {
            self.free.insert(start, aligned - start);
        }
        let tail = start + block - (aligned + size);
        if tail > 0 {
            self.free.insert(aligned + size, tail);
        }
        self.live.insert(aligned, size);
        Some(aligned)
    }

    /// Return an allocation, yielding its size
    ///
    /// `None` when `address` is not the start of a live allocation.
    pub fn free(&mut self, address: u64) -> Option<u64> {
        let size = self.live.remove(&address)?;
        let mut start = address;
        let mut len = size;

        if let Some((&prev, &prev_len)) = self.free.range(..address).next_back() {
            if prev + prev_len == address {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(address + size)) {
            len += next_len;
        }
        self.free.insert(start, len);
        Some(size)
    }

    /// Size of the live allocation starting at `address`
    pub fn allocation_size(&self, address: u64) -> Option<u64> {
        self.live.get(&address).copied()
    }

    /// Whether `[address, address + len)` lies inside one live allocation
    pub fn contains_range(&self, address: u64, len: u64) -> bool {
        let Some(end) = address.checked_add(len) else {
            return false;
        };
        match self.live.range(..=address).next_back() {
            Some((&start, &size)) => end <= start + size,
            None => false,
        }
    }

    /// Number of live allocations
    pub fn outstanding(&self) -> usize {
        self.live.len()
    }

    /// Total free bytes
    pub fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }
}

fn align_up(value: u64, alignment: u64) -> Option<u64> {
    value.checked_add(alignment - 1).map(|v| v & !(alignment - 1))
}

/// Data allocations of one device
pub struct MemoryManager {
    device: DeviceId,
    min_alignment: u64,
    allocator: Mutex<RangeAllocator>,
}

impl MemoryManager {
    /// Manager over `[base, base + size)` honouring the device's minimum alignment
    pub fn new(device: DeviceId, base: u64, size: u64, min_alignment: u64) -> Self {
        Self {
            device,
            min_alignment: min_alignment.max(1),
            allocator: Mutex::new(RangeAllocator::new(base, size)),
        }
    }

    /// Allocate `size` bytes aligned to at least `alignment`
    ///
    /// The effective alignment is raised to the device minimum.
    pub fn malloc(&self, size: u64, alignment: u64) -> Result<DeviceBuffer> {
        if size == 0 {
            return Err(Error::invalid_size("cannot allocate zero bytes"));
        }
        if !alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment(alignment));
        }
        let alignment = alignment.max(self.min_alignment);

        let address = self
            .allocator
            .lock()
            .allocate(size, alignment)
            .ok_or(Error::OutOfDeviceMemory {
                device: self.device,
                requested: size,
                alignment,
            })?;

        tracing::debug!(
            device = %self.device,
            address = format_args!("{address:#x}"),
            size,
            alignment,
            "buffer_allocated"
        );
        Ok(DeviceBuffer {
            device: self.device,
            address,
            size,
            alignment,
        })
    }

    /// Release an allocation
    pub fn free(&self, buffer: &DeviceBuffer) -> Result<()> {
        let invalid = Error::InvalidBuffer {
            device: self.device,
            address: buffer.address,
        };
        if buffer.device != self.device {
            return Err(invalid);
        }

        let mut allocator = self.allocator.lock();
        match allocator.allocation_size(buffer.address) {
            Some(size) if size == buffer.size => {
                allocator.free(buffer.address);
            }
            _ => return Err(invalid),
        }
        drop(allocator);

        tracing::debug!(
            device = %self.device,
            address = format_args!("{:#x}", buffer.address),
            size = buffer.size,
            "buffer_freed"
        );
        Ok(())
    }

    pub fn contains_range(&self, address: u64, len: u64) -> bool {
        self.allocator.lock().contains_range(address, len)
    }

    pub fn outstanding(&self) -> usize {
        self.allocator.lock().outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BASE: u64 = 0x80_0400_0000;

    #[test]
    fn best_fit_prefers_smallest_hole() {
        let mut alloc = RangeAllocator::new(0, 1024);
        let a = alloc.allocate(100, 1).unwrap();
        let b = alloc.allocate(300, 1).unwrap();
        let c = alloc.allocate(50, 1).unwrap();
        let _d = alloc.allocate(100, 1).unwrap();
        alloc.free(b);
        alloc.free(c);
        alloc.free(a);

        // Holes: [0, 450) after coalescing, and the tail [550, 1024)
        assert_eq!(alloc.allocate(450, 1), Some(0));
        assert_eq!(alloc.allocate(400, 1), Some(550));
    }

    #[test]
    fn coalesces_neighbours() {
        let mut alloc = RangeAllocator::new(BASE, 4096);
        let blocks: Vec<u64> = (0..4).map(|_| alloc.allocate(1024, 64).unwrap()).collect();
        assert_eq!(alloc.free_bytes(), 0);
        alloc.free(blocks[1]);
        alloc.free(blocks[3]);
        alloc.free(blocks[2]);
        alloc.free(blocks[0]);
        assert_eq!(alloc.allocate(4096, 64), Some(BASE));
    }

    #[test]
    fn alignment_padding_stays_free() {
        let mut alloc = RangeAllocator::new(BASE + 64, 8192);
        let a = alloc.allocate(128, 4096).unwrap();
        assert_eq!(a % 4096, 0);
        assert_eq!(alloc.allocate(64, 64), Some(BASE + 64));
    }

    #[test]
    fn contains_range_checks_one_allocation() {
        let mut alloc = RangeAllocator::new(BASE, 4096);
        let a = alloc.allocate(256, 64).unwrap();
        let b = alloc.allocate(256, 64).unwrap();
        assert!(alloc.contains_range(a, 256));
        assert!(alloc.contains_range(a + 10, 100));
        assert!(!alloc.contains_range(a + 200, 100));
        assert!(!alloc.contains_range(b + 256, 1));
        assert!(!alloc.contains_range(BASE - 1, 1));
    }

    #[test]
    fn manager_rejects_double_free_and_bad_input() {
        let mm = MemoryManager::new(DeviceId::from_raw(0), BASE, 1 << 20, 64);
        assert!(matches!(mm.malloc(0, 64), Err(Error::InvalidSize(_))));
        assert!(matches!(mm.malloc(16, 48), Err(Error::InvalidAlignment(48))));

        let buffer = mm.malloc(100, 8).unwrap();
        assert_eq!(buffer.alignment, 64);
        assert_eq!(mm.outstanding(), 1);
        mm.free(&buffer).unwrap();
        assert!(matches!(mm.free(&buffer), Err(Error::InvalidBuffer { .. })));

        let foreign = DeviceBuffer {
            device: DeviceId::from_raw(1),
            ..mm.malloc(64, 64).unwrap()
        };
        assert!(matches!(mm.free(&foreign), Err(Error::InvalidBuffer { .. })));
    }

    #[test]
    fn exhaustion_is_reported() {
        let mm = MemoryManager::new(DeviceId::from_raw(0), BASE, 4096, 64);
        mm.malloc(4096, 64).unwrap();
        assert!(matches!(mm.malloc(1, 64), Err(Error::OutOfDeviceMemory { .. })));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc { size: u64, align_bits: u32 },
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u64..8192, 0u32..13).prop_map(|(size, align_bits)| Op::Alloc { size, align_bits }),
            (0usize..64).prop_map(Op::Free),
        ]
    }

    proptest! {
        #[test]
        fn live_allocations_never_overlap(ops in proptest::collection::vec(op(), 1..200)) {
            let mut alloc = RangeAllocator::new(BASE, 256 << 10);
            let mut live: Vec<(u64, u64)> = Vec::new();

            for op in ops {
                match op {
                    Op::Alloc { size, align_bits } => {
                        let alignment = 1u64 << align_bits;
                        if let Some(address) = alloc.allocate(size, alignment) {
                            prop_assert_eq!(address % alignment, 0);
                            prop_assert!(address >= BASE && address + size <= BASE + (256 << 10));
                            for &(other, other_size) in &live {
                                prop_assert!(address + size <= other || other + other_size <= address);
                            }
                            live.push((address, size));
                        }
                    }
                    Op::Free(index) if !live.is_empty() => {
                        let (address, size) = live.swap_remove(index % live.len());
                        prop_assert_eq!(alloc.free(address), Some(size));
                    }
                    Op::Free(_) => {}
                }
            }

            let used: u64 = live.iter().map(|&(_, s)| s).sum();
            prop_assert_eq!(alloc.free_bytes() + used, 256 << 10);
        }

        #[test]
        fn freeing_everything_restores_one_block(sizes in proptest::collection::vec(1u64..4096, 1..40)) {
            let mut alloc = RangeAllocator::new(BASE, 1 << 20);
            let addresses: Vec<u64> = sizes.iter().filter_map(|&s| alloc.allocate(s, 64)).collect();
            for address in addresses.into_iter().rev() {
                alloc.free(address);
            }
            prop_assert_eq!(alloc.allocate(1 << 20, 64), Some(BASE));
        }
    }
}
