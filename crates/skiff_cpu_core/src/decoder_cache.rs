//! Per-execute-segment decoder cache.
//!
//! A segment is a private copy of a contiguous executable page range with
//! one slot per 2-byte offset, filled by a single linear pre-decode pass
//! from the segment base. Data bytes interleaved with code decode to
//! whatever they decode to; that is harmless as long as they are never
//! executed. Segments are shared across forks through `Arc` and detached
//! with `make_mut` when a guest write lands inside one.

use std::sync::Arc;

use memory::{Memory, MemoryResult};

use crate::interp::{decode_any, AluOp, DecodeFail, DecodedInst, InstKind, MemWidth};
use crate::state::Xlen;

#[derive(Clone, Copy, Debug)]
pub enum Slot {
    Inst(DecodedInst),
    /// Undecodable bytes, or the interior halfwords of a longer
    /// instruction.
    Invalid { bits: u32 },
    /// Encoding from an extension this build does not carry.
    Unimplemented { bits: u32 },
    /// A 32-bit instruction whose upper halfword lies beyond the end of
    /// the executable region; `addr` is the halfword that faulted.
    Truncated { addr: u64 },
}

#[derive(Clone, Debug)]
pub struct ExecSegment {
    base: u64,
    xlen: Xlen,
    data: Vec<u8>,
    slots: Vec<Slot>,
    fusion: bool,
}

impl ExecSegment {
    pub fn build(base: u64, data: Vec<u8>, xlen: Xlen, fusion: bool) -> Self {
        let mut segment = Self {
            base,
            xlen,
            data,
            slots: Vec::new(),
            fusion,
        };
        segment.populate();
        if segment.fusion {
            segment.fuse();
        }
        segment
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn overlaps(&self, addr: u64, len: usize) -> bool {
        addr < self.end() && addr.wrapping_add(len as u64) > self.base
    }

    /// The decoded slot for an even `pc` inside the segment.
    pub fn slot(&self, pc: u64) -> &Slot {
        &self.slots[((pc - self.base) >> 1) as usize]
    }

    fn halfword(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.data[off], self.data[off + 1]])
    }

    fn word(&self, off: usize) -> Option<u32> {
        if off + 4 <= self.data.len() {
            Some(u32::from_le_bytes([
                self.data[off],
                self.data[off + 1],
                self.data[off + 2],
                self.data[off + 3],
            ]))
        } else {
            None
        }
    }

    fn decode_slot(&self, bits: u32) -> Slot {
        match decode_any(bits, self.xlen) {
            Ok(inst) => Slot::Inst(inst),
            Err(DecodeFail::Illegal) => Slot::Invalid { bits },
            Err(DecodeFail::Unimplemented) => Slot::Unimplemented { bits },
        }
    }

    /// One linear pass over the segment. Compressed instructions make many
    /// offsets the interior of a longer instruction; those slots decode as
    /// invalid so a stray jump into them faults.
    fn populate(&mut self) {
        self.slots = Vec::with_capacity(self.data.len() / 2);
        let mut at_boundary = true;
        let mut off = 0usize;
        while off + 1 < self.data.len() {
            let lo = self.halfword(off);
            let is_long = lo & 0b11 == 0b11;
            let slot = if !at_boundary {
                Slot::Invalid { bits: lo as u32 }
            } else if is_long {
                match self.word(off) {
                    Some(word) => self.decode_slot(word),
                    None => Slot::Truncated {
                        addr: self.base + off as u64 + 2,
                    },
                }
            } else {
                self.decode_slot(lo as u32)
            };
            self.slots.push(slot);
            at_boundary = if at_boundary { !is_long } else { true };
            off += 2;
        }
    }

    /// Rewrites adjacent decoded pairs into single fused handlers. The
    /// observable state after a fused handler equals sequential execution
    /// of its components; intermediate PC values are not observable.
    fn fuse(&mut self) {
        if self.slots.len() < 3 {
            return;
        }
        for i in 0..self.slots.len() - 2 {
            let (Slot::Inst(a), Slot::Inst(b)) = (self.slots[i], self.slots[i + 2]) else {
                continue;
            };
            if a.len != 4 || b.len != 4 {
                continue;
            }
            let Some(first) = self.word(i * 2) else {
                continue;
            };
            match (a.kind, b.kind) {
                // lui rd, hi ; addi rd, rd, lo  =>  one constant load.
                (
                    InstKind::Lui { rd, imm },
                    InstKind::OpImm { op: AluOp::Add, rd: rd2, rs1, imm: lo },
                ) if rd2 == rd && rs1 == rd => {
                    let value = (imm as i64).wrapping_add(lo as i64);
                    self.slots[i] = Slot::Inst(DecodedInst {
                        len: 8,
                        kind: InstKind::FusedLi { rd, value, first },
                    });
                }
                // Two stores off the same base collapse into one handler.
                (
                    InstKind::Store { width, rs2: rs2a, rs1, offset: offset_a },
                    InstKind::Store { width: wb, rs2: rs2b, rs1: rs1b, offset: offset_b },
                ) if width == wb
                    && rs1b == rs1
                    && matches!(width, MemWidth::W | MemWidth::D) =>
                {
                    self.slots[i] = Slot::Inst(DecodedInst {
                        len: 8,
                        kind: InstKind::FusedStorePair {
                            width,
                            rs1,
                            rs2a,
                            offset_a,
                            rs2b,
                            offset_b,
                            first,
                        },
                    });
                }
                _ => {}
            }
        }
    }

    /// Refreshes the byte copy from guest memory after a write landed in
    /// this segment and re-decodes every slot. Fusion stays off for a
    /// segment the guest has written.
    fn refresh(&mut self, mem: &Memory) {
        if mem.read_raw(self.base, &mut self.data).is_err() {
            // Pages vanished under the segment; drop every slot so the
            // next fetch rebuilds from scratch.
            self.slots.clear();
            self.data.clear();
            return;
        }
        self.fusion = false;
        self.populate();
    }
}

/// The decoder caches of one hart, shared with forked machines until a
/// write detaches them.
#[derive(Clone, Debug)]
pub struct SegmentSet {
    segments: Vec<Arc<ExecSegment>>,
    epoch: u64,
    fusion: bool,
}

impl SegmentSet {
    pub fn new(fusion: bool) -> Self {
        Self {
            segments: Vec::new(),
            epoch: 0,
            fusion,
        }
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Drops every cache when executable mappings changed under us.
    pub fn sync(&mut self, mem: &Memory) {
        if self.epoch != mem.exec_epoch() {
            self.epoch = mem.exec_epoch();
            self.segments.clear();
        }
    }

    pub fn lookup(&self, pc: u64) -> Option<&Slot> {
        self.segments
            .iter()
            .find(|segment| segment.contains(pc))
            .map(|segment| segment.slot(pc))
    }

    /// Builds a segment covering the executable region around `pc`.
    /// Returns `false` when `pc` is not inside executable pages.
    pub fn build_for(&mut self, pc: u64, mem: &Memory, xlen: Xlen) -> MemoryResult<bool> {
        let Some((start, len)) = mem.exec_region_around(pc) else {
            return Ok(false);
        };
        let mut data = vec![0u8; len as usize];
        mem.read_raw(start, &mut data)?;
        self.segments
            .push(Arc::new(ExecSegment::build(start, data, xlen, self.fusion)));
        Ok(true)
    }

    /// Called after every guest store: keeps overlapped decoder caches
    /// coherent with self-modifying code.
    pub fn notify_write(&mut self, addr: u64, len: usize, mem: &Memory) {
        for segment in &mut self.segments {
            if segment.overlaps(addr, len) {
                Arc::make_mut(segment).refresh(mem);
            }
        }
        self.segments.retain(|segment| !segment.data.is_empty());
    }
}
