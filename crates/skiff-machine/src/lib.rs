//! Canonical machine integration layer.
//!
//! This crate composes one CPU core (`skiff_cpu_core`) with one paged guest
//! memory (`memory`) plus the host-facing trap surface: a syscall-handler
//! table, the stop flag, the instruction budget, bulk guest transfer, and
//! `vmcall` for calling individual guest functions. An embedder that wants
//! to run untrusted guest code holds exactly one value: [`Machine`].

#![forbid(unsafe_code)]

pub mod syscalls;

use std::any::Any;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memory::{Memory, PageAttr, PAGE_SIZE};
use skiff_cpu_core::{reg, Cpu, Exception, StepExit, Xlen};

/// Syscall number used to report an unbound EBREAK trap.
pub const SYSCALL_EBREAK: u64 = 0x7FF;

/// Host callback for one syscall number. Callbacks read arguments from
/// a0..a5, write the result into a0, may touch guest memory, and may set
/// the stop flag; returning an error aborts the execution loop.
pub type SyscallHandler = dyn Fn(&mut Machine) -> Result<(), Exception> + Send + Sync;

type OutputFn = Box<dyn FnMut(&[u8]) + Send>;
type InputFn = Box<dyn FnMut(&mut [u8]) -> usize + Send>;

#[derive(Debug, Clone)]
pub struct MachineOptions {
    pub xlen: Xlen,
    /// Byte cap on guest memory.
    pub memory_max: u64,
    pub stack_size: u64,
    /// Rewrite adjacent decoder-cache slots into fused handlers.
    pub instruction_fusion: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            xlen: Xlen::Rv64,
            memory_max: 128 * 1024 * 1024,
            stack_size: 1024 * 1024,
            instruction_fusion: true,
        }
    }
}

/// Why `simulate` returned without a fault. Both cases are recoverable:
/// calling `simulate` again resumes from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A handler (usually exit) set the stop flag.
    Stopped,
    /// The retired-instruction budget was exhausted.
    InstructionLimit,
}

pub struct Machine {
    pub cpu: Cpu,
    pub memory: Memory,
    syscall_handlers: Vec<Option<Arc<SyscallHandler>>>,
    ebreak_handler: Option<Arc<SyscallHandler>>,
    stop: Arc<AtomicBool>,
    exit_address: u64,
    stack_top: u64,
    options: MachineOptions,
    userdata: Option<Arc<dyn Any + Send + Sync>>,
    stdout: OutputFn,
    stderr: OutputFn,
    stdin: InputFn,
}

impl Machine {
    pub fn new(options: MachineOptions) -> Result<Self, Exception> {
        let mut memory = Memory::new(options.memory_max);
        // The stack sits directly under the top page of the address space;
        // that page's base doubles as the vmcall exit sentinel.
        let exit_address = options.xlen.addr_mask() & !(PAGE_SIZE as u64 - 1);
        let stack_top = exit_address;
        memory.set_page_attr(stack_top - options.stack_size, options.stack_size, PageAttr::RW)?;

        let mut cpu = Cpu::new(options.xlen, options.instruction_fusion);
        cpu.state.set_reg(reg::SP, stack_top);

        Ok(Self {
            cpu,
            memory,
            syscall_handlers: Vec::new(),
            ebreak_handler: None,
            stop: Arc::new(AtomicBool::new(false)),
            exit_address,
            stack_top,
            options,
            userdata: None,
            stdout: default_stdout(),
            stderr: default_stderr(),
            stdin: default_stdin(),
        })
    }

    /// Runs until the stop flag, the instruction budget, or a fault.
    ///
    /// The budget is enforced at iteration boundaries against a
    /// precomputed end count; the retired counter never exceeds it.
    pub fn simulate(&mut self, limit: u64) -> Result<StopReason, Exception> {
        self.stop.store(false, Ordering::Relaxed);
        let end = self.cpu.state.instret.saturating_add(limit);
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Ok(StopReason::Stopped);
            }
            if self.cpu.state.instret >= end {
                return Ok(StopReason::InstructionLimit);
            }
            if self.cpu.state.pc() == self.exit_address {
                // Return into the vmcall sentinel.
                self.stop();
                return Ok(StopReason::Stopped);
            }
            let remaining = end - self.cpu.state.instret;
            let outcome = self.cpu.step(&mut self.memory, remaining)?;
            match outcome.exit {
                StepExit::Continue => {}
                StepExit::Ecall => self.dispatch_syscall()?,
                StepExit::Ebreak => self.dispatch_ebreak()?,
            }
        }
    }

    /// Executes a single instruction, leaving any surrounding budget
    /// bookkeeping to the caller.
    pub fn step_one(&mut self) -> Result<StopReason, Exception> {
        self.simulate(1)
    }

    /// Calls the guest function at `addr`: arguments go to a0.., the
    /// return address is the exit sentinel, and the result is a0.
    pub fn vmcall(&mut self, addr: u64, args: &[u64], budget: u64) -> Result<i64, Exception> {
        for (i, &value) in args.iter().enumerate().take(8) {
            self.cpu.state.set_reg(reg::A0 + i as u8, value);
        }
        self.cpu.state.set_reg(reg::RA, self.exit_address);
        self.cpu.state.set_reg(reg::SP, self.stack_top);
        self.cpu.state.set_pc(addr);
        self.simulate(budget)?;
        Ok(self.return_value())
    }

    /// Registers a host callback for syscall number `n`.
    pub fn install_syscall_handler<F>(&mut self, number: u64, handler: F)
    where
        F: Fn(&mut Machine) -> Result<(), Exception> + Send + Sync + 'static,
    {
        let index = number as usize;
        if self.syscall_handlers.len() <= index {
            self.syscall_handlers.resize(index + 1, None);
        }
        self.syscall_handlers[index] = Some(Arc::new(handler));
    }

    /// Registers the distinct EBREAK debug-trap handler.
    pub fn install_ebreak_handler<F>(&mut self, handler: F)
    where
        F: Fn(&mut Machine) -> Result<(), Exception> + Send + Sync + 'static,
    {
        self.ebreak_handler = Some(Arc::new(handler));
    }

    fn dispatch_syscall(&mut self) -> Result<(), Exception> {
        let number = self.cpu.state.reg(reg::A7);
        tracing::trace!(number, pc = self.cpu.state.pc(), "ecall");
        let handler = self
            .syscall_handlers
            .get(number as usize)
            .and_then(|slot| slot.clone());
        match handler {
            Some(handler) => handler(self),
            None => Err(Exception::UnhandledSyscall { number }),
        }
    }

    fn dispatch_ebreak(&mut self) -> Result<(), Exception> {
        tracing::trace!(pc = self.cpu.state.pc(), "ebreak");
        match self.ebreak_handler.clone() {
            Some(handler) => handler(self),
            None => Err(Exception::UnhandledSyscall { number: SYSCALL_EBREAK }),
        }
    }

    /// Sets the stop flag; the loop exits at its next iteration boundary.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Shareable stop flag for cancellation from another thread.
    pub fn stop_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Syscall argument `n` (a0..a5).
    pub fn sysarg(&self, n: usize) -> u64 {
        self.cpu.state.reg(reg::A0 + n as u8)
    }

    /// A 64-bit syscall argument starting at slot `n`. On a 32-bit guest
    /// it occupies the consecutive register pair per the ilp32 convention.
    pub fn sysarg64(&self, n: usize) -> u64 {
        match self.cpu.state.xlen {
            Xlen::Rv64 => self.sysarg(n),
            Xlen::Rv32 => self.sysarg(n) | (self.sysarg(n + 1) << 32),
        }
    }

    /// Writes a syscall result (or `-errno`) into a0.
    pub fn set_result(&mut self, value: i64) {
        self.cpu.state.set_reg(reg::A0, value as u64);
    }

    /// The guest's a0, as the exit-code convention reads it.
    pub fn return_value(&self) -> i64 {
        self.cpu.state.reg_signed(reg::A0)
    }

    pub fn set_start_address(&mut self, pc: u64) {
        self.cpu.state.set_pc(pc);
    }

    pub fn set_stack_pointer(&mut self, sp: u64) {
        self.cpu.state.set_reg(reg::SP, sp);
    }

    pub fn stack_pointer(&self) -> u64 {
        self.cpu.state.reg(reg::SP)
    }

    /// Loader-facing passthrough: grant attributes over a range,
    /// materializing pages.
    pub fn set_page_attr(&mut self, addr: u64, len: u64, attr: PageAttr) -> Result<(), Exception> {
        self.memory.set_page_attr(addr, len, attr)?;
        Ok(())
    }

    /// Bulk host-to-guest transfer honoring page attributes.
    pub fn copy_to_guest(&mut self, dst: u64, src: &[u8]) -> Result<(), Exception> {
        self.memory.write_bytes(dst, src)?;
        self.cpu.segments.notify_write(dst, src.len(), &self.memory);
        Ok(())
    }

    /// Bulk guest-to-host transfer honoring page attributes.
    pub fn copy_from_guest(&self, dst: &mut [u8], src: u64) -> Result<(), Exception> {
        self.memory.read_bytes(src, dst)?;
        Ok(())
    }

    /// Sets the brk heap base (and with it the mmap arena) for the
    /// heap-related syscall handlers; typically the end of the loaded
    /// image, rounded up.
    pub fn set_heap_base(&mut self, addr: u64) {
        self.memory.set_heap_base(addr);
    }

    /// Re-initializes CPU state and guest memory. Syscall handlers and
    /// I/O callbacks survive a reset.
    pub fn reset(&mut self) -> Result<(), Exception> {
        self.cpu.reset();
        self.memory = Memory::new(self.options.memory_max);
        self.memory.set_page_attr(
            self.stack_top - self.options.stack_size,
            self.options.stack_size,
            PageAttr::RW,
        )?;
        self.cpu.state.set_reg(reg::SP, self.stack_top);
        self.stop.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Copy-on-write clone: the child shares every page, the decoder
    /// caches, and the handler table. I/O callbacks reset to the host
    /// defaults and the child gets its own stop flag.
    pub fn fork(&mut self) -> Machine {
        Machine {
            cpu: self.cpu.clone(),
            memory: self.memory.fork(),
            syscall_handlers: self.syscall_handlers.clone(),
            ebreak_handler: self.ebreak_handler.clone(),
            stop: Arc::new(AtomicBool::new(false)),
            exit_address: self.exit_address,
            stack_top: self.stack_top,
            options: self.options.clone(),
            userdata: self.userdata.clone(),
            stdout: default_stdout(),
            stderr: default_stderr(),
            stdin: default_stdin(),
        }
    }

    /// Opaque embedder data carried to callbacks.
    pub fn set_userdata<T: Any + Send + Sync>(&mut self, data: Arc<T>) {
        self.userdata = Some(data);
    }

    pub fn userdata<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.userdata
            .clone()
            .and_then(|data| data.downcast::<T>().ok())
    }

    pub fn set_stdout(&mut self, f: impl FnMut(&[u8]) + Send + 'static) {
        self.stdout = Box::new(f);
    }

    pub fn set_stderr(&mut self, f: impl FnMut(&[u8]) + Send + 'static) {
        self.stderr = Box::new(f);
    }

    /// Installs the stdin callback; it reports how many bytes it filled.
    pub fn set_stdin(&mut self, f: impl FnMut(&mut [u8]) -> usize + Send + 'static) {
        self.stdin = Box::new(f);
    }

    pub fn print(&mut self, bytes: &[u8]) {
        (self.stdout)(bytes);
    }

    pub fn print_err(&mut self, bytes: &[u8]) {
        (self.stderr)(bytes);
    }

    /// Zero-copy write syscall body: enumerates the readable runs of the
    /// guest buffer and hands each to the output callback.
    fn sys_write_to(&mut self, fd_err: bool, addr: u64, len: u64) -> Result<(), Exception> {
        let buffers = self.memory.gather_buffers(16, addr, len)?;
        let out = if fd_err { &mut self.stderr } else { &mut self.stdout };
        for buffer in buffers {
            out(buffer);
        }
        Ok(())
    }

    /// Read-from-stdin syscall body: walks the writable runs of the guest
    /// buffer and lets the input callback fill each one.
    fn sys_read_stdin(&mut self, addr: u64, len: u64) -> Result<(), Exception> {
        let stdin = &mut self.stdin;
        self.memory.update_buffers_mut(addr, len, |buffer| {
            stdin(buffer);
        })?;
        Ok(())
    }
}

fn default_stdout() -> OutputFn {
    Box::new(|bytes| {
        let _ = std::io::stdout().write_all(bytes);
    })
}

fn default_stderr() -> OutputFn {
    Box::new(|bytes| {
        let _ = std::io::stderr().write_all(bytes);
    })
}

fn default_stdin() -> InputFn {
    Box::new(|_buffer| 0)
}
