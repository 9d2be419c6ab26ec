use memory::MemoryError;
use thiserror::Error;

/// CPU exception/fault reported back to the embedder.
///
/// All variants except the syscall-routing ones abort the execution loop;
/// see the machine crate for the recoverable stop/budget outcomes, which
/// are deliberately not modeled as errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    #[error("illegal instruction {bits:#010x} at {pc:#x}")]
    IllegalInstruction { pc: u64, bits: u32 },

    /// The encoding belongs to an extension this build does not carry.
    #[error("unimplemented instruction {bits:#010x} at {pc:#x}")]
    UnimplementedInstruction { pc: u64, bits: u32 },

    #[error("instruction fetch from non-executable memory at {addr:#x}")]
    ExecutionFault { addr: u64 },

    #[error("read fault at {addr:#x}")]
    ReadFault { addr: u64 },

    #[error("write fault at {addr:#x}")]
    WriteFault { addr: u64 },

    #[error("access beyond the configured memory cap at {addr:#x}")]
    OutOfBoundsFault { addr: u64 },

    #[error("misaligned access at {addr:#x}")]
    MisalignedFault { addr: u64 },

    #[error("no handler installed for syscall {number}")]
    UnhandledSyscall { number: u64 },
}

impl From<MemoryError> for Exception {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::ReadFault { addr } => Exception::ReadFault { addr },
            MemoryError::WriteFault { addr } => Exception::WriteFault { addr },
            MemoryError::ExecutionFault { addr } => Exception::ExecutionFault { addr },
            MemoryError::OutOfBoundsFault { addr, .. } => Exception::OutOfBoundsFault { addr },
            MemoryError::MisalignedFault { addr } => Exception::MisalignedFault { addr },
        }
    }
}
