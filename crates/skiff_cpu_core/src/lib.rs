#![forbid(unsafe_code)]

//! RISC-V CPU core: architectural state, instruction decoding (including the
//! compressed expander), the per-segment decoder cache, and the interpreter.
//!
//! The crate API is centered around [`state::CpuState`] plus [`cpu::Cpu`],
//! which couples the state to the decoder cache. The machine crate drives
//! [`cpu::Cpu::step`] in its budget loop; everything here is synchronous and
//! returns typed [`Exception`]s instead of panicking.

pub mod cpu;
pub mod decoder_cache;
pub mod exception;
pub mod interp;
pub mod state;

pub use cpu::{Cpu, StepExit, StepOutcome};
pub use exception::Exception;
pub use interp::{DecodedInst, InstKind};
pub use state::{reg, CpuState, Xlen};
