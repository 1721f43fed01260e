//! Sparse device DRAM
//!
//! Device memory windows are many gigabytes wide while tests touch a few
//! megabytes, so backing storage is allocated lazily in fixed pages.
//! Unwritten bytes read as zero.

use std::collections::HashMap;

/// Backing page size (1 MiB)
pub const PAGE_SIZE: u64 = 1 << 20;

/// Access outside the memory window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfRange {
    pub address: u64,
    pub len: u64,
}

/// Lazily backed memory covering `[base, base + size)`
pub struct SparseMemory {
    base: u64,
    size: u64,
    pages: HashMap<u64, Box<[u8]>>,
}

impl SparseMemory {
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            pages: HashMap::new(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether `[address, address + len)` lies inside the window
    pub fn contains(&self, address: u64, len: u64) -> bool {
        match address.checked_sub(self.base) {
            Some(offset) => offset.checked_add(len).is_some_and(|end| end <= self.size),
            None => false,
        }
    }

    /// Number of pages that have been materialized
    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn read(&self, address: u64, out: &mut [u8]) -> Result<(), OutOfRange> {
        let offset = self.check(address, out.len() as u64)?;
        let mut done = 0usize;
        while done < out.len() {
            let pos = offset + done as u64;
            let (page, in_page) = (pos / PAGE_SIZE, (pos % PAGE_SIZE) as usize);
            let chunk = (PAGE_SIZE as usize - in_page).min(out.len() - done);
            match self.pages.get(&page) {
                Some(bytes) => out[done..done + chunk].copy_from_slice(&bytes[in_page..in_page + chunk]),
                None => out[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        Ok(())
    }

    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<(), OutOfRange> {
        let offset = self.check(address, data.len() as u64)?;
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let (page, in_page) = (pos / PAGE_SIZE, (pos % PAGE_SIZE) as usize);
            let chunk = (PAGE_SIZE as usize - in_page).min(data.len() - done);
            self.page_mut(page)[in_page..in_page + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    pub fn fill(&mut self, address: u64, len: u64, value: u8) -> Result<(), OutOfRange> {
        let offset = self.check(address, len)?;
        let mut done = 0u64;
        while done < len {
            let pos = offset + done;
            let (page, in_page) = (pos / PAGE_SIZE, (pos % PAGE_SIZE) as usize);
            let chunk = (PAGE_SIZE - in_page as u64).min(len - done) as usize;
            if value == 0 && !self.pages.contains_key(&page) {
                done += chunk as u64;
                continue;
            }
            self.page_mut(page)[in_page..in_page + chunk].fill(value);
            done += chunk as u64;
        }
        Ok(())
    }

    fn check(&self, address: u64, len: u64) -> Result<u64, OutOfRange> {
        if self.contains(address, len) {
            Ok(address - self.base)
        } else {
            Err(OutOfRange { address, len })
        }
    }

    fn page_mut(&mut self, page: u64) -> &mut [u8] {
        self.pages
            .entry(page)
            .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x80_0400_0000;

    #[test]
    fn unwritten_memory_reads_zero() {
        let mem = SparseMemory::new(BASE, 16 * PAGE_SIZE);
        let mut out = [0xffu8; 32];
        mem.read(BASE + 100, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0));
        assert_eq!(mem.resident_pages(), 0);
    }

    #[test]
    fn write_spanning_pages() {
        let mut mem = SparseMemory::new(BASE, 16 * PAGE_SIZE);
        let data: Vec<u8> = (0..4096).map(|i| (i % 251) as u8).collect();
        let addr = BASE + PAGE_SIZE - 1000;
        mem.write(addr, &data).unwrap();
        assert_eq!(mem.resident_pages(), 2);

        let mut out = vec![0u8; data.len()];
        mem.read(addr, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn fill_then_read() {
        let mut mem = SparseMemory::new(BASE, 4 * PAGE_SIZE);
        mem.fill(BASE + 10, 20, 0x42).unwrap();
        let mut out = [0u8; 32];
        mem.read(BASE, &mut out).unwrap();
        assert_eq!(&out[..10], &[0u8; 10]);
        assert_eq!(&out[10..30], &[0x42u8; 20]);
        assert_eq!(&out[30..], &[0u8; 2]);
    }

    #[test]
    fn rejects_accesses_outside_window() {
        let mut mem = SparseMemory::new(BASE, PAGE_SIZE);
        assert!(mem.write(BASE - 1, &[1]).is_err());
        assert!(mem.write(BASE + PAGE_SIZE - 1, &[1, 2]).is_err());
        assert!(mem.fill(u64::MAX - 2, 8, 0).is_err());
        assert!(mem.contains(BASE, PAGE_SIZE));
        assert!(!mem.contains(BASE, PAGE_SIZE + 1));
    }
}
