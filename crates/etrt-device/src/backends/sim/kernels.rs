//! Host-side kernel handlers for the simulator
//!
//! The simulator does not execute RISC-V code. A loaded image is identified
//! by its flattened bytes and dispatched to a registered handler that plays
//! the kernel's part against device memory.

use super::memory::SparseMemory;
use crate::error::Result;
use crate::image::{build_riscv_elf, CodeImage};
use crate::layer::ErrorContext;
use bytemuck::{Pod, Zeroable};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// `mcause` reported for an illegal instruction
pub const MCAUSE_ILLEGAL_INSTRUCTION: u64 = 2;
/// `mcause` reported for a load access fault
pub const MCAUSE_LOAD_ACCESS_FAULT: u64 = 5;
/// `mcause` reported for a store access fault
pub const MCAUSE_STORE_ACCESS_FAULT: u64 = 7;

/// Memset operation selector in [`MemOpsParams::op`]
pub const MEMOPS_MEMSET: u32 = 0;
/// Memcpy operation selector in [`MemOpsParams::op`]
pub const MEMOPS_MEMCPY: u32 = 1;

/// Argument block of [`BuiltinKernel::MemOps`]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MemOpsParams {
    pub op: u32,
    /// Fill byte for memset (low 8 bits)
    pub value: u32,
    pub dst: u64,
    pub size: u64,
    /// Source address for memcpy
    pub src: u64,
}

impl MemOpsParams {
    pub fn memset(dst: u64, value: u8, size: u64) -> Self {
        Self {
            op: MEMOPS_MEMSET,
            value: value as u32,
            dst,
            size,
            src: 0,
        }
    }

    pub fn memcpy(dst: u64, src: u64, size: u64) -> Self {
        Self {
            op: MEMOPS_MEMCPY,
            value: 0,
            dst,
            size,
            src,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Why a kernel stopped early
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelFault {
    /// Hart trapped; fatal for the launch
    Exception { mcause: u64, mtval: u64 },
    /// Kernel returned a negative status
    UserError(i64),
    /// Cycle budget exhausted
    Timeout,
    /// Host requested abort while running
    HostAborted,
}

impl KernelFault {
    fn access_fault(address: u64, store: bool) -> Self {
        KernelFault::Exception {
            mcause: if store {
                MCAUSE_STORE_ACCESS_FAULT
            } else {
                MCAUSE_LOAD_ACCESS_FAULT
            },
            mtval: address,
        }
    }
}

/// View of the device a running kernel gets
pub struct KernelContext<'a> {
    memory: &'a mut SparseMemory,
    args: &'a [u8],
    shire_mask: u64,
    frequency_mhz: u64,
    cycles: u64,
    cycle_budget: u64,
    abort: &'a AtomicBool,
    console: Vec<String>,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        memory: &'a mut SparseMemory,
        args: &'a [u8],
        shire_mask: u64,
        frequency_mhz: u64,
        cycle_budget: u64,
        abort: &'a AtomicBool,
    ) -> Self {
        Self {
            memory,
            args,
            shire_mask,
            frequency_mhz: frequency_mhz.max(1),
            cycles: 0,
            cycle_budget,
            abort,
            console: Vec::new(),
        }
    }

    pub fn args(&self) -> &[u8] {
        self.args
    }

    /// Decode the argument block as `T`, faulting on a short payload
    pub fn args_as<T: Pod>(&self) -> std::result::Result<T, KernelFault> {
        let size = std::mem::size_of::<T>();
        if self.args.len() < size {
            return Err(KernelFault::Exception {
                mcause: MCAUSE_LOAD_ACCESS_FAULT,
                mtval: self.args.len() as u64,
            });
        }
        bytemuck::try_pod_read_unaligned(&self.args[..size]).map_err(|_| KernelFault::Exception {
            mcause: MCAUSE_LOAD_ACCESS_FAULT,
            mtval: 0,
        })
    }

    pub fn shire_mask(&self) -> u64 {
        self.shire_mask
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn read(&mut self, address: u64, out: &mut [u8]) -> std::result::Result<(), KernelFault> {
        self.spend_cycles(out.len() as u64 / 64 + 1)?;
        self.memory
            .read(address, out)
            .map_err(|e| KernelFault::access_fault(e.address, false))
    }

    pub fn write(&mut self, address: u64, data: &[u8]) -> std::result::Result<(), KernelFault> {
        self.spend_cycles(data.len() as u64 / 64 + 1)?;
        self.memory
            .write(address, data)
            .map_err(|e| KernelFault::access_fault(e.address, true))
    }

    pub fn fill(&mut self, address: u64, len: u64, value: u8) -> std::result::Result<(), KernelFault> {
        self.spend_cycles(len / 64 + 1)?;
        self.memory
            .fill(address, len, value)
            .map_err(|e| KernelFault::access_fault(e.address, true))
    }

    /// Account `cycles` of work against the budget
    pub fn spend_cycles(&mut self, cycles: u64) -> std::result::Result<(), KernelFault> {
        if self.abort.load(Ordering::Acquire) {
            return Err(KernelFault::HostAborted);
        }
        self.cycles = self.cycles.saturating_add(cycles);
        if self.cycles > self.cycle_budget {
            return Err(KernelFault::Timeout);
        }
        Ok(())
    }

    /// Busy the harts for `duration` of wall time, in small steps
    pub fn stall(&mut self, duration: Duration) -> std::result::Result<(), KernelFault> {
        const STEP: Duration = Duration::from_millis(1);
        let mut left = duration;
        while !left.is_zero() {
            let step = left.min(STEP);
            thread::sleep(step);
            self.spend_cycles(step.as_micros() as u64 * self.frequency_mhz)?;
            left = left.saturating_sub(step);
        }
        Ok(())
    }

    /// Append a line to the device console
    pub fn print(&mut self, line: impl Into<String>) {
        self.console.push(line.into());
    }

    pub(crate) fn take_console(&mut self) -> Vec<String> {
        std::mem::take(&mut self.console)
    }
}

/// Kernel handler signature
pub type KernelFn = Arc<dyn Fn(&mut KernelContext<'_>) -> std::result::Result<(), KernelFault> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct RegisteredKernel {
    pub name: String,
    pub entry_offset: u64,
    pub handler: KernelFn,
}

/// Images the simulator knows how to run
#[derive(Default)]
pub struct KernelRegistry {
    kernels: RwLock<HashMap<Vec<u8>, RegisteredKernel>>,
}

impl KernelRegistry {
    /// Registry pre-populated with every [`BuiltinKernel`]
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::default();
        for builtin in BuiltinKernel::ALL {
            registry.register(builtin.name(), &builtin.elf(), builtin.handler())?;
        }
        Ok(registry)
    }

    /// Register `handler` for the image contained in `elf`
    ///
    /// A later registration of the same image replaces the earlier one.
    pub fn register(&self, name: &str, elf: &[u8], handler: KernelFn) -> Result<()> {
        let image = CodeImage::parse(elf)?;
        self.kernels.write().insert(
            image.bytes().to_vec(),
            RegisteredKernel {
                name: name.to_string(),
                entry_offset: image.entry_offset(),
                handler,
            },
        );
        Ok(())
    }

    pub(crate) fn lookup(&self, code: &[u8]) -> Option<RegisteredKernel> {
        self.kernels.read().get(code).cloned()
    }
}

/// Kernels every simulated device can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinKernel {
    /// Memset or memcpy on device memory, argument block [`MemOpsParams`]
    MemOps,
    /// Traps on its first instruction with an illegal-instruction exception
    Trap,
    /// Stalls until its cycle budget runs out or it is aborted
    Spin,
    /// Returns the `i64` at the start of its arguments as a user error
    /// when it is negative, succeeds otherwise
    UserStatus,
}

impl BuiltinKernel {
    pub const ALL: [BuiltinKernel; 4] = [
        BuiltinKernel::MemOps,
        BuiltinKernel::Trap,
        BuiltinKernel::Spin,
        BuiltinKernel::UserStatus,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BuiltinKernel::MemOps => "memops",
            BuiltinKernel::Trap => "trap",
            BuiltinKernel::Spin => "spin",
            BuiltinKernel::UserStatus => "user_status",
        }
    }

    /// Loadable ELF for this kernel
    pub fn elf(self) -> Vec<u8> {
        let mut payload = format!("etrt-sim:{}", self.name()).into_bytes();
        payload.resize(64, 0);
        build_riscv_elf(&payload, 0)
    }

    fn handler(self) -> KernelFn {
        match self {
            BuiltinKernel::MemOps => Arc::new(run_memops),
            BuiltinKernel::Trap => Arc::new(|ctx: &mut KernelContext<'_>| -> std::result::Result<(), KernelFault> {
                ctx.spend_cycles(1)?;
                Err(KernelFault::Exception {
                    mcause: MCAUSE_ILLEGAL_INSTRUCTION,
                    mtval: 0,
                })
            }),
            BuiltinKernel::Spin => Arc::new(|ctx: &mut KernelContext<'_>| -> std::result::Result<(), KernelFault> {
                loop {
                    ctx.stall(Duration::from_millis(5))?;
                }
            }),
            BuiltinKernel::UserStatus => Arc::new(|ctx: &mut KernelContext<'_>| -> std::result::Result<(), KernelFault> {
                let status: i64 = ctx.args_as()?;
                if status < 0 {
                    Err(KernelFault::UserError(status))
                } else {
                    Ok(())
                }
            }),
        }
    }
}

fn run_memops(ctx: &mut KernelContext<'_>) -> std::result::Result<(), KernelFault> {
    let params: MemOpsParams = ctx.args_as()?;
    match params.op {
        MEMOPS_MEMSET => {
            ctx.print(format!(
                "memset dst={:#x} size={} value={:#04x}",
                params.dst, params.size, params.value as u8
            ));
            ctx.fill(params.dst, params.size, params.value as u8)
        }
        MEMOPS_MEMCPY => {
            ctx.print(format!(
                "memcpy dst={:#x} src={:#x} size={}",
                params.dst, params.src, params.size
            ));
            const CHUNK: u64 = 1 << 20;
            let mut done = 0u64;
            let mut buf = Vec::new();
            while done < params.size {
                let len = CHUNK.min(params.size - done);
                buf.resize(len as usize, 0);
                ctx.read(params.src + done, &mut buf)?;
                ctx.write(params.dst + done, &buf)?;
                done += len;
            }
            Ok(())
        }
        other => Err(KernelFault::UserError(-(other as i64) - 1)),
    }
}

/// Machine state for a trapped kernel
pub(crate) fn exception_context(mcause: u64, mtval: u64, entry: u64, cycles: u64) -> ErrorContext {
    ErrorContext {
        error_type: 1,
        cycle: cycles,
        mepc: entry,
        mcause,
        mtval,
        ..ErrorContext::default()
    }
}
