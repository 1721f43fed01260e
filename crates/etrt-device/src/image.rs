//! Loadable code images
//!
//! Kernels reach the device as RISC-V ELF64 executables. Before loading, the
//! `PT_LOAD` segments are flattened into one contiguous, position-relative
//! byte image: the first byte corresponds to the lowest segment address,
//! gaps and `.bss` tails are zero-filled.
//!
//! ```
//! use etrt_device::image::{build_riscv_elf, CodeImage};
//!
//! let elf = build_riscv_elf(&[0x13, 0x00, 0x00, 0x00], 0);
//! let image = CodeImage::parse(&elf)?;
//! assert_eq!(image.load_size(), 4);
//! assert_eq!(image.entry_offset(), 0);
//! # Ok::<(), etrt_device::DeviceLayerError>(())
//! ```

use crate::error::{DeviceLayerError, Result};
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use std::sync::Arc;

/// RISC-V machine type in the ELF header (`e_machine`)
pub const EM_RISCV: u16 = 243;

/// Minimum alignment of a loaded image
pub const MIN_IMAGE_ALIGNMENT: u64 = 4096;

/// Largest flattened image accepted
pub const MAX_IMAGE_SIZE: u64 = 256 << 20;

/// Base virtual address used by [`build_riscv_elf`]
const SYNTHETIC_BASE: u64 = 0x1000;

const ELF64_HEADER_SIZE: usize = 64;
const ELF64_PHDR_SIZE: usize = 56;

/// A parsed, flattened code image
#[derive(Debug, Clone)]
pub struct CodeImage {
    bytes: Arc<[u8]>,
    entry_offset: u64,
    alignment: u64,
    base_address: u64,
}

impl CodeImage {
    /// Parse and flatten an ELF64 RISC-V executable
    ///
    /// # Errors
    ///
    /// Returns [`DeviceLayerError::InvalidImage`] when the bytes are not a
    /// little-endian ELF64 for RISC-V, have no loadable segment, have a
    /// segment pointing outside the file, or have an entry point outside the
    /// loaded range.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let elf = Elf::parse(data).map_err(|e| DeviceLayerError::invalid_image(format!("failed to parse ELF: {e}")))?;

        if elf.header.e_machine != EM_RISCV {
            return Err(DeviceLayerError::invalid_image(format!(
                "not a RISC-V ELF: machine type {:#x}, expected {:#x}",
                elf.header.e_machine, EM_RISCV
            )));
        }
        if !elf.is_64 {
            return Err(DeviceLayerError::invalid_image("code images must be ELF64"));
        }
        if !elf.little_endian {
            return Err(DeviceLayerError::invalid_image("code images must be little-endian"));
        }

        let segments: Vec<_> = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD && ph.p_memsz > 0)
            .collect();
        if segments.is_empty() {
            return Err(DeviceLayerError::invalid_image("no loadable segment"));
        }

        let base = segments.iter().map(|ph| ph.p_vaddr).min().unwrap_or(0);
        let mut end = base;
        let mut alignment = MIN_IMAGE_ALIGNMENT;
        for ph in &segments {
            if ph.p_filesz > ph.p_memsz {
                return Err(DeviceLayerError::invalid_image(format!(
                    "segment at {:#x} has file size larger than memory size",
                    ph.p_vaddr
                )));
            }
            let seg_end = ph
                .p_vaddr
                .checked_add(ph.p_memsz)
                .ok_or_else(|| DeviceLayerError::invalid_image("segment address overflow"))?;
            end = end.max(seg_end);
            if ph.p_align.is_power_of_two() {
                alignment = alignment.max(ph.p_align);
            }
        }

        let load_size = end - base;
        if load_size > MAX_IMAGE_SIZE {
            return Err(DeviceLayerError::invalid_image(format!(
                "image spans {load_size} bytes, limit is {MAX_IMAGE_SIZE}"
            )));
        }

        let mut flat = vec![0u8; load_size as usize];
        for ph in &segments {
            let file_start = ph.p_offset as usize;
            let file_end = file_start
                .checked_add(ph.p_filesz as usize)
                .filter(|&e| e <= data.len())
                .ok_or_else(|| {
                    DeviceLayerError::invalid_image(format!("segment at {:#x} extends past end of file", ph.p_vaddr))
                })?;
            let dst = (ph.p_vaddr - base) as usize;
            flat[dst..dst + ph.p_filesz as usize].copy_from_slice(&data[file_start..file_end]);
        }

        let entry = elf.header.e_entry;
        if entry < base || entry >= end {
            return Err(DeviceLayerError::invalid_image(format!(
                "entry point {entry:#x} outside loaded range {base:#x}..{end:#x}"
            )));
        }

        Ok(Self {
            bytes: flat.into(),
            entry_offset: entry - base,
            alignment,
            base_address: base,
        })
    }

    /// Flattened bytes to copy to the device
    pub fn bytes(&self) -> &Arc<[u8]> {
        &self.bytes
    }

    /// Size of the flattened image
    pub fn load_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Entry point relative to the first loaded byte
    pub fn entry_offset(&self) -> u64 {
        self.entry_offset
    }

    /// Required alignment of the load address
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Link-time address of the first loaded byte
    pub fn base_address(&self) -> u64 {
        self.base_address
    }
}

/// Wrap raw code in a minimal RISC-V ELF64 executable
///
/// The result has one `PT_LOAD` segment holding `payload` and no sections.
/// Used to produce loadable images for the simulator's built-in kernels and
/// in tests.
pub fn build_riscv_elf(payload: &[u8], entry_offset: u64) -> Vec<u8> {
    let data_offset = (ELF64_HEADER_SIZE + ELF64_PHDR_SIZE) as u64;
    let mut elf = Vec::with_capacity(data_offset as usize + payload.len());

    // e_ident: magic, ELFCLASS64, ELFDATA2LSB, EV_CURRENT, padding
    elf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    elf.extend_from_slice(&[0u8; 8]);
    elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    elf.extend_from_slice(&EM_RISCV.to_le_bytes());
    elf.extend_from_slice(&1u32.to_le_bytes());
    elf.extend_from_slice(&(SYNTHETIC_BASE + entry_offset).to_le_bytes());
    elf.extend_from_slice(&(ELF64_HEADER_SIZE as u64).to_le_bytes()); // e_phoff
    elf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    elf.extend_from_slice(&(ELF64_HEADER_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&(ELF64_PHDR_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    elf.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    elf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    elf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    // Program header
    elf.extend_from_slice(&PT_LOAD.to_le_bytes());
    elf.extend_from_slice(&5u32.to_le_bytes()); // PF_R | PF_X
    elf.extend_from_slice(&data_offset.to_le_bytes());
    elf.extend_from_slice(&SYNTHETIC_BASE.to_le_bytes());
    elf.extend_from_slice(&SYNTHETIC_BASE.to_le_bytes());
    elf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    elf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    elf.extend_from_slice(&MIN_IMAGE_ALIGNMENT.to_le_bytes());

    elf.extend_from_slice(payload);
    elf
}
