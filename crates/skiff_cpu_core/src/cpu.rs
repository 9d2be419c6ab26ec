//! One hart: architectural state plus its decoder caches, and the
//! fetch/decode/execute step the machine loop drives.

use memory::Memory;

use crate::decoder_cache::{SegmentSet, Slot};
use crate::exception::Exception;
use crate::interp::{decode_any, exec_decoded, DecodedInst, ExecOutcome, InstKind};
use crate::state::{CpuState, Xlen};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    Continue,
    /// ECALL retired; the machine routes through its handler table.
    Ecall,
    /// EBREAK retired; the machine routes to the debug-trap handler.
    Ebreak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    pub exit: StepExit,
    /// Instructions retired by this step (2 for a fused pair).
    pub retired: u64,
}

#[derive(Debug, Clone)]
pub struct Cpu {
    pub state: CpuState,
    pub segments: SegmentSet,
}

impl Cpu {
    pub fn new(xlen: Xlen, fusion: bool) -> Self {
        Self {
            state: CpuState::new(xlen),
            segments: SegmentSet::new(fusion),
        }
    }

    pub fn reset(&mut self) {
        self.state = CpuState::new(self.state.xlen);
        self.segments.clear();
    }

    /// Fetches the decoded record at the current PC, building a decoder
    /// cache for the surrounding executable region on first entry.
    fn fetch_decoded(&mut self, mem: &Memory) -> Result<DecodedInst, Exception> {
        let pc = self.state.pc();
        if pc & 1 != 0 {
            return Err(Exception::MisalignedFault { addr: pc });
        }
        let slot = match self.segments.lookup(pc) {
            Some(slot) => *slot,
            None => {
                if !self.segments.build_for(pc, mem, self.state.xlen)? {
                    return Err(Exception::ExecutionFault { addr: pc });
                }
                *self
                    .segments
                    .lookup(pc)
                    .expect("freshly built segment covers its own pc")
            }
        };
        match slot {
            Slot::Inst(inst) => Ok(inst),
            Slot::Invalid { bits } => Err(Exception::IllegalInstruction { pc, bits }),
            Slot::Unimplemented { bits } => {
                Err(Exception::UnimplementedInstruction { pc, bits })
            }
            Slot::Truncated { addr } => Err(Exception::ExecutionFault { addr }),
        }
    }

    /// Executes one decoded record. `remaining` is the budget headroom of
    /// the surrounding loop; a fused pair that would overshoot it is split
    /// back into its first component so retirement stays exact.
    pub fn step(&mut self, mem: &mut Memory, remaining: u64) -> Result<StepOutcome, Exception> {
        self.segments.sync(mem);
        let mut inst = self.fetch_decoded(mem)?;
        if inst.retire_count() > 1 && inst.retire_count() > remaining {
            let first = match inst.kind {
                InstKind::FusedLi { first, .. } => first,
                InstKind::FusedStorePair { first, .. } => first,
                _ => unreachable!("only fused kinds retire more than one"),
            };
            inst = decode_any(first, self.state.xlen)
                .expect("fused slots preserve a decodable first component");
        }
        let outcome = exec_decoded(&mut self.state, mem, &mut self.segments, &inst)?;
        let retired = inst.retire_count();
        self.state.instret += retired;
        let exit = match outcome {
            ExecOutcome::Branch => StepExit::Continue,
            ExecOutcome::Continue => {
                self.state.advance_pc(inst.len as u64);
                StepExit::Continue
            }
            ExecOutcome::Ecall => {
                self.state.advance_pc(inst.len as u64);
                StepExit::Ecall
            }
            ExecOutcome::Ebreak => {
                self.state.advance_pc(inst.len as u64);
                StepExit::Ebreak
            }
        };
        Ok(StepOutcome { exit, retired })
    }
}
