//! A-extension: LR/SC and the AMO read-modify-write family.
//!
//! A single hart exists from the guest's perspective, so the reservation is
//! one slot in the CPU state. Each operation is bracketed by sequentially
//! consistent fences, the conservative choice for the acquire/release bits.

use std::sync::atomic::{fence, Ordering};

use memory::Memory;

use crate::decoder_cache::SegmentSet;
use crate::exception::Exception;
use crate::state::CpuState;

use super::exec::{load_value, store_value, ExecOutcome};
use super::{AmoOp, DecodedInst, InstKind, MemWidth};

fn check_aligned(addr: u64, width: MemWidth) -> Result<(), Exception> {
    if addr % width.bytes() != 0 {
        return Err(Exception::MisalignedFault { addr });
    }
    Ok(())
}

fn amo32(op: AmoOp, old: u32, rhs: u32) -> u32 {
    match op {
        AmoOp::Swap => rhs,
        AmoOp::Add => old.wrapping_add(rhs),
        AmoOp::Xor => old ^ rhs,
        AmoOp::And => old & rhs,
        AmoOp::Or => old | rhs,
        AmoOp::Min => (old as i32).min(rhs as i32) as u32,
        AmoOp::Max => (old as i32).max(rhs as i32) as u32,
        AmoOp::MinU => old.min(rhs),
        AmoOp::MaxU => old.max(rhs),
    }
}

fn amo64(op: AmoOp, old: u64, rhs: u64) -> u64 {
    match op {
        AmoOp::Swap => rhs,
        AmoOp::Add => old.wrapping_add(rhs),
        AmoOp::Xor => old ^ rhs,
        AmoOp::And => old & rhs,
        AmoOp::Or => old | rhs,
        AmoOp::Min => (old as i64).min(rhs as i64) as u64,
        AmoOp::Max => (old as i64).max(rhs as i64) as u64,
        AmoOp::MinU => old.min(rhs),
        AmoOp::MaxU => old.max(rhs),
    }
}

pub fn exec_atomic(
    state: &mut CpuState,
    mem: &mut Memory,
    segs: &mut SegmentSet,
    inst: &DecodedInst,
) -> Result<ExecOutcome, Exception> {
    let mask = state.xlen.addr_mask();
    match inst.kind {
        InstKind::LoadReserved { width, rd, rs1 } => {
            let addr = state.reg(rs1) & mask;
            check_aligned(addr, width)?;
            fence(Ordering::SeqCst);
            let value = load_value(mem, addr, width, true)?;
            fence(Ordering::SeqCst);
            state.reservation = Some(addr);
            state.set_reg(rd, value);
        }
        InstKind::StoreConditional { width, rd, rs1, rs2 } => {
            let addr = state.reg(rs1) & mask;
            check_aligned(addr, width)?;
            if state.reservation.take() == Some(addr) {
                fence(Ordering::SeqCst);
                store_value(mem, segs, addr, width, state.reg(rs2))?;
                fence(Ordering::SeqCst);
                state.set_reg(rd, 0);
            } else {
                state.set_reg(rd, 1);
            }
        }
        InstKind::Amo { op, width, rd, rs1, rs2 } => {
            let addr = state.reg(rs1) & mask;
            check_aligned(addr, width)?;
            fence(Ordering::SeqCst);
            let old = load_value(mem, addr, width, true)?;
            let new = match width {
                MemWidth::W => amo32(op, old as u32, state.reg(rs2) as u32) as u64,
                MemWidth::D => amo64(op, old, state.reg(rs2)),
                _ => unreachable!("decode only admits W/D"),
            };
            store_value(mem, segs, addr, width, new)?;
            fence(Ordering::SeqCst);
            state.set_reg(rd, old);
        }
        _ => unreachable!("non-atomic kind routed to exec_atomic"),
    }
    Ok(ExecOutcome::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amo_min_max_are_signed() {
        assert_eq!(amo32(AmoOp::Min, -5i32 as u32, 3), -5i32 as u32);
        assert_eq!(amo32(AmoOp::Max, -5i32 as u32, 3), 3);
        assert_eq!(amo32(AmoOp::MinU, -5i32 as u32, 3), 3);
        assert_eq!(amo64(AmoOp::Max, -1i64 as u64, 0), 0);
        assert_eq!(amo64(AmoOp::MaxU, -1i64 as u64, 0), u64::MAX);
    }

    #[test]
    fn misaligned_address_is_rejected() {
        assert!(check_aligned(0x1002, MemWidth::W).is_err());
        assert!(check_aligned(0x1004, MemWidth::W).is_ok());
        assert!(check_aligned(0x1004, MemWidth::D).is_err());
    }
}
