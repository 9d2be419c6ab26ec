//! Base (32-bit) instruction decoder.
//!
//! Discriminates the 7-bit opcode, then funct3/funct7 sub-fields, yielding a
//! [`DecodedInst`] with pre-extracted operands. Extensions that are not
//! compiled in decode to [`DecodeFail::Unimplemented`].

use crate::state::Xlen;

use super::{
    AluOp, AmoOp, BranchCond, CsrOp, CsrSrc, DecodedInst, FmaOp, FpCmpOp, FpFmt, FpOp, InstKind,
    IntCvt, MemWidth, MulDivOp,
};

const EXT_M: bool = cfg!(feature = "ext-m");
const EXT_A: bool = cfg!(feature = "ext-a");
const EXT_F: bool = cfg!(feature = "ext-f");
const EXT_C: bool = cfg!(feature = "ext-c");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFail {
    /// Undefined or reserved encoding.
    Illegal,
    /// Valid encoding of an extension this build does not carry.
    Unimplemented,
}

/// Decodes a 16- or 32-bit instruction word. Compressed halfwords (low two
/// bits != 0b11) are expanded to their base equivalent first; the returned
/// record reports the original length.
pub fn decode_any(bits: u32, xlen: Xlen) -> Result<DecodedInst, DecodeFail> {
    if bits & 0b11 == 0b11 {
        decode(bits, xlen)
    } else if EXT_C {
        let word = super::compressed::expand(bits as u16, xlen)?;
        let mut inst = decode(word, xlen)?;
        inst.len = 2;
        Ok(inst)
    } else {
        Err(DecodeFail::Unimplemented)
    }
}

#[inline]
fn rd(w: u32) -> u8 {
    ((w >> 7) & 0x1F) as u8
}

#[inline]
fn rs1(w: u32) -> u8 {
    ((w >> 15) & 0x1F) as u8
}

#[inline]
fn rs2(w: u32) -> u8 {
    ((w >> 20) & 0x1F) as u8
}

#[inline]
fn funct3(w: u32) -> u32 {
    (w >> 12) & 0x7
}

#[inline]
fn funct7(w: u32) -> u32 {
    w >> 25
}

#[inline]
fn imm_i(w: u32) -> i32 {
    (w as i32) >> 20
}

#[inline]
fn imm_s(w: u32) -> i32 {
    ((w & 0xFE00_0000) as i32 >> 20) | ((w >> 7) & 0x1F) as i32
}

#[inline]
fn imm_b(w: u32) -> i32 {
    let imm = ((w >> 31) & 1) << 12
        | ((w >> 7) & 1) << 11
        | ((w >> 25) & 0x3F) << 5
        | ((w >> 8) & 0xF) << 1;
    ((imm as i32) << 19) >> 19
}

#[inline]
fn imm_u(w: u32) -> i32 {
    (w & 0xFFFF_F000) as i32
}

#[inline]
fn imm_j(w: u32) -> i32 {
    let imm = ((w >> 31) & 1) << 20
        | ((w >> 12) & 0xFF) << 12
        | ((w >> 20) & 1) << 11
        | ((w >> 21) & 0x3FF) << 1;
    ((imm as i32) << 11) >> 11
}

/// Rounding-mode field check: 5 and 6 are reserved, 7 selects the dynamic
/// mode from fcsr.
fn check_rm(rm: u32) -> Result<u8, DecodeFail> {
    match rm {
        0..=4 | 7 => Ok(rm as u8),
        _ => Err(DecodeFail::Illegal),
    }
}

fn decode_shift_imm(w: u32, xlen: Xlen) -> Result<InstKind, DecodeFail> {
    // The SRA bit sits in funct7 bit 5; RV64 steals funct7 bit 0 for the
    // sixth shamt bit, so normalize the checked field to funct7 form.
    let (top, shamt) = match xlen {
        Xlen::Rv32 => (w >> 25, (w >> 20) & 0x1F),
        Xlen::Rv64 => ((w >> 26) << 1, (w >> 20) & 0x3F),
    };
    let op = match (funct3(w), top) {
        (1, 0x00) => AluOp::Sll,
        (5, 0x00) => AluOp::Srl,
        (5, 0x20) => AluOp::Sra,
        _ => return Err(DecodeFail::Illegal),
    };
    Ok(InstKind::OpImm {
        op,
        rd: rd(w),
        rs1: rs1(w),
        imm: shamt as i32,
    })
}

pub fn decode(w: u32, xlen: Xlen) -> Result<DecodedInst, DecodeFail> {
    let kind = match w & 0x7F {
        0x37 => InstKind::Lui { rd: rd(w), imm: imm_u(w) },
        0x17 => InstKind::Auipc { rd: rd(w), imm: imm_u(w) },
        0x6F => InstKind::Jal { rd: rd(w), offset: imm_j(w) },
        0x67 => match funct3(w) {
            0 => InstKind::Jalr { rd: rd(w), rs1: rs1(w), offset: imm_i(w) },
            _ => return Err(DecodeFail::Illegal),
        },
        0x63 => {
            let cond = match funct3(w) {
                0 => BranchCond::Eq,
                1 => BranchCond::Ne,
                4 => BranchCond::Lt,
                5 => BranchCond::Ge,
                6 => BranchCond::Ltu,
                7 => BranchCond::Geu,
                _ => return Err(DecodeFail::Illegal),
            };
            InstKind::Branch { cond, rs1: rs1(w), rs2: rs2(w), offset: imm_b(w) }
        }
        0x03 => {
            let (width, signed) = match funct3(w) {
                0 => (MemWidth::B, true),
                1 => (MemWidth::H, true),
                2 => (MemWidth::W, true),
                3 if xlen == Xlen::Rv64 => (MemWidth::D, true),
                4 => (MemWidth::B, false),
                5 => (MemWidth::H, false),
                6 if xlen == Xlen::Rv64 => (MemWidth::W, false),
                _ => return Err(DecodeFail::Illegal),
            };
            InstKind::Load { width, signed, rd: rd(w), rs1: rs1(w), offset: imm_i(w) }
        }
        0x23 => {
            let width = match funct3(w) {
                0 => MemWidth::B,
                1 => MemWidth::H,
                2 => MemWidth::W,
                3 if xlen == Xlen::Rv64 => MemWidth::D,
                _ => return Err(DecodeFail::Illegal),
            };
            InstKind::Store { width, rs2: rs2(w), rs1: rs1(w), offset: imm_s(w) }
        }
        0x13 => match funct3(w) {
            0 => InstKind::OpImm { op: AluOp::Add, rd: rd(w), rs1: rs1(w), imm: imm_i(w) },
            1 | 5 => decode_shift_imm(w, xlen)?,
            2 => InstKind::OpImm { op: AluOp::Slt, rd: rd(w), rs1: rs1(w), imm: imm_i(w) },
            3 => InstKind::OpImm { op: AluOp::Sltu, rd: rd(w), rs1: rs1(w), imm: imm_i(w) },
            4 => InstKind::OpImm { op: AluOp::Xor, rd: rd(w), rs1: rs1(w), imm: imm_i(w) },
            6 => InstKind::OpImm { op: AluOp::Or, rd: rd(w), rs1: rs1(w), imm: imm_i(w) },
            7 => InstKind::OpImm { op: AluOp::And, rd: rd(w), rs1: rs1(w), imm: imm_i(w) },
            _ => unreachable!(),
        },
        0x33 => match funct7(w) {
            0x00 => {
                let op = match funct3(w) {
                    0 => AluOp::Add,
                    1 => AluOp::Sll,
                    2 => AluOp::Slt,
                    3 => AluOp::Sltu,
                    4 => AluOp::Xor,
                    5 => AluOp::Srl,
                    6 => AluOp::Or,
                    7 => AluOp::And,
                    _ => unreachable!(),
                };
                InstKind::Op { op, rd: rd(w), rs1: rs1(w), rs2: rs2(w) }
            }
            0x20 => {
                let op = match funct3(w) {
                    0 => AluOp::Sub,
                    5 => AluOp::Sra,
                    _ => return Err(DecodeFail::Illegal),
                };
                InstKind::Op { op, rd: rd(w), rs1: rs1(w), rs2: rs2(w) }
            }
            0x01 => {
                if !EXT_M {
                    return Err(DecodeFail::Unimplemented);
                }
                let op = match funct3(w) {
                    0 => MulDivOp::Mul,
                    1 => MulDivOp::Mulh,
                    2 => MulDivOp::Mulhsu,
                    3 => MulDivOp::Mulhu,
                    4 => MulDivOp::Div,
                    5 => MulDivOp::Divu,
                    6 => MulDivOp::Rem,
                    7 => MulDivOp::Remu,
                    _ => unreachable!(),
                };
                InstKind::MulDiv { op, rd: rd(w), rs1: rs1(w), rs2: rs2(w) }
            }
            _ => return Err(DecodeFail::Illegal),
        },
        0x1B if xlen == Xlen::Rv64 => match funct3(w) {
            0 => InstKind::OpImm32 { op: AluOp::Add, rd: rd(w), rs1: rs1(w), imm: imm_i(w) },
            1 if funct7(w) == 0 => InstKind::OpImm32 {
                op: AluOp::Sll,
                rd: rd(w),
                rs1: rs1(w),
                imm: ((w >> 20) & 0x1F) as i32,
            },
            5 if funct7(w) == 0x00 => InstKind::OpImm32 {
                op: AluOp::Srl,
                rd: rd(w),
                rs1: rs1(w),
                imm: ((w >> 20) & 0x1F) as i32,
            },
            5 if funct7(w) == 0x20 => InstKind::OpImm32 {
                op: AluOp::Sra,
                rd: rd(w),
                rs1: rs1(w),
                imm: ((w >> 20) & 0x1F) as i32,
            },
            _ => return Err(DecodeFail::Illegal),
        },
        0x3B if xlen == Xlen::Rv64 => match (funct7(w), funct3(w)) {
            (0x00, 0) => InstKind::Op32 { op: AluOp::Add, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
            (0x20, 0) => InstKind::Op32 { op: AluOp::Sub, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
            (0x00, 1) => InstKind::Op32 { op: AluOp::Sll, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
            (0x00, 5) => InstKind::Op32 { op: AluOp::Srl, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
            (0x20, 5) => InstKind::Op32 { op: AluOp::Sra, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
            (0x01, f3) => {
                if !EXT_M {
                    return Err(DecodeFail::Unimplemented);
                }
                let op = match f3 {
                    0 => MulDivOp::Mul,
                    4 => MulDivOp::Div,
                    5 => MulDivOp::Divu,
                    6 => MulDivOp::Rem,
                    7 => MulDivOp::Remu,
                    _ => return Err(DecodeFail::Illegal),
                };
                InstKind::MulDiv32 { op, rd: rd(w), rs1: rs1(w), rs2: rs2(w) }
            }
            _ => return Err(DecodeFail::Illegal),
        },
        0x0F => match funct3(w) {
            0 => InstKind::Fence,
            1 => InstKind::FenceI,
            _ => return Err(DecodeFail::Illegal),
        },
        0x73 => decode_system(w, xlen)?,
        0x2F => {
            if !EXT_A {
                return Err(DecodeFail::Unimplemented);
            }
            decode_amo(w, xlen)?
        }
        0x07 => {
            if !EXT_F {
                return Err(DecodeFail::Unimplemented);
            }
            let fmt = match funct3(w) {
                2 => FpFmt::S,
                3 => FpFmt::D,
                _ => return Err(DecodeFail::Illegal),
            };
            InstKind::FpLoad { fmt, frd: rd(w), rs1: rs1(w), offset: imm_i(w) }
        }
        0x27 => {
            if !EXT_F {
                return Err(DecodeFail::Unimplemented);
            }
            let fmt = match funct3(w) {
                2 => FpFmt::S,
                3 => FpFmt::D,
                _ => return Err(DecodeFail::Illegal),
            };
            InstKind::FpStore { fmt, frs2: rs2(w), rs1: rs1(w), offset: imm_s(w) }
        }
        0x43 | 0x47 | 0x4B | 0x4F => {
            if !EXT_F {
                return Err(DecodeFail::Unimplemented);
            }
            let op = match w & 0x7F {
                0x43 => FmaOp::MAdd,
                0x47 => FmaOp::MSub,
                0x4B => FmaOp::NMSub,
                _ => FmaOp::NMAdd,
            };
            let fmt = match (w >> 25) & 0x3 {
                0 => FpFmt::S,
                1 => FpFmt::D,
                _ => return Err(DecodeFail::Illegal),
            };
            InstKind::FpFma {
                op,
                fmt,
                frd: rd(w),
                frs1: rs1(w),
                frs2: rs2(w),
                frs3: ((w >> 27) & 0x1F) as u8,
                rm: check_rm(funct3(w))?,
            }
        }
        0x53 => {
            if !EXT_F {
                return Err(DecodeFail::Unimplemented);
            }
            decode_op_fp(w, xlen)?
        }
        _ => return Err(DecodeFail::Illegal),
    };
    Ok(DecodedInst { len: 4, kind })
}

fn decode_system(w: u32, xlen: Xlen) -> Result<InstKind, DecodeFail> {
    let op = match funct3(w) {
        0 => {
            return match w {
                0x0000_0073 => Ok(InstKind::Ecall),
                0x0010_0073 => Ok(InstKind::Ebreak),
                _ => Err(DecodeFail::Illegal),
            };
        }
        1 | 5 => CsrOp::Rw,
        2 | 6 => CsrOp::Rs,
        3 | 7 => CsrOp::Rc,
        _ => return Err(DecodeFail::Illegal),
    };
    let src = if funct3(w) >= 5 {
        CsrSrc::Imm(rs1(w))
    } else {
        CsrSrc::Reg(rs1(w))
    };
    let csr = (w >> 20) as u16;
    let read_only = match csr {
        0x001 | 0x002 | 0x003 => {
            if !EXT_F {
                return Err(DecodeFail::Unimplemented);
            }
            false
        }
        0xC00 | 0xC01 | 0xC02 => true,
        0xC80 | 0xC81 | 0xC82 if xlen == Xlen::Rv32 => true,
        _ => return Err(DecodeFail::Illegal),
    };
    // A write attempt against a read-only counter is statically illegal.
    let writes = op == CsrOp::Rw || src.writes();
    if read_only && writes {
        return Err(DecodeFail::Illegal);
    }
    Ok(InstKind::Csr { op, rd: rd(w), src, csr })
}

fn decode_amo(w: u32, xlen: Xlen) -> Result<InstKind, DecodeFail> {
    let width = match funct3(w) {
        2 => MemWidth::W,
        3 if xlen == Xlen::Rv64 => MemWidth::D,
        _ => return Err(DecodeFail::Illegal),
    };
    let kind = match funct7(w) >> 2 {
        0x02 if rs2(w) == 0 => InstKind::LoadReserved { width, rd: rd(w), rs1: rs1(w) },
        0x03 => InstKind::StoreConditional { width, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
        0x01 => InstKind::Amo { op: AmoOp::Swap, width, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
        0x00 => InstKind::Amo { op: AmoOp::Add, width, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
        0x04 => InstKind::Amo { op: AmoOp::Xor, width, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
        0x0C => InstKind::Amo { op: AmoOp::And, width, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
        0x08 => InstKind::Amo { op: AmoOp::Or, width, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
        0x10 => InstKind::Amo { op: AmoOp::Min, width, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
        0x14 => InstKind::Amo { op: AmoOp::Max, width, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
        0x18 => InstKind::Amo { op: AmoOp::MinU, width, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
        0x1C => InstKind::Amo { op: AmoOp::MaxU, width, rd: rd(w), rs1: rs1(w), rs2: rs2(w) },
        _ => return Err(DecodeFail::Illegal),
    };
    Ok(kind)
}

fn decode_op_fp(w: u32, xlen: Xlen) -> Result<InstKind, DecodeFail> {
    let fmt = if funct7(w) & 1 == 0 { FpFmt::S } else { FpFmt::D };
    let kind = match funct7(w) {
        0x00 | 0x01 => InstKind::FpOp {
            op: FpOp::Add,
            fmt,
            frd: rd(w),
            frs1: rs1(w),
            frs2: rs2(w),
            rm: check_rm(funct3(w))?,
        },
        0x04 | 0x05 => InstKind::FpOp {
            op: FpOp::Sub,
            fmt,
            frd: rd(w),
            frs1: rs1(w),
            frs2: rs2(w),
            rm: check_rm(funct3(w))?,
        },
        0x08 | 0x09 => InstKind::FpOp {
            op: FpOp::Mul,
            fmt,
            frd: rd(w),
            frs1: rs1(w),
            frs2: rs2(w),
            rm: check_rm(funct3(w))?,
        },
        0x0C | 0x0D => InstKind::FpOp {
            op: FpOp::Div,
            fmt,
            frd: rd(w),
            frs1: rs1(w),
            frs2: rs2(w),
            rm: check_rm(funct3(w))?,
        },
        0x2C | 0x2D if rs2(w) == 0 => InstKind::FpOp {
            op: FpOp::Sqrt,
            fmt,
            frd: rd(w),
            frs1: rs1(w),
            frs2: 0,
            rm: check_rm(funct3(w))?,
        },
        0x10 | 0x11 => {
            let op = match funct3(w) {
                0 => FpOp::SgnJ,
                1 => FpOp::SgnJN,
                2 => FpOp::SgnJX,
                _ => return Err(DecodeFail::Illegal),
            };
            InstKind::FpOp { op, fmt, frd: rd(w), frs1: rs1(w), frs2: rs2(w), rm: 0 }
        }
        0x14 | 0x15 => {
            let op = match funct3(w) {
                0 => FpOp::Min,
                1 => FpOp::Max,
                _ => return Err(DecodeFail::Illegal),
            };
            InstKind::FpOp { op, fmt, frd: rd(w), frs1: rs1(w), frs2: rs2(w), rm: 0 }
        }
        0x50 | 0x51 => {
            let op = match funct3(w) {
                2 => FpCmpOp::Eq,
                1 => FpCmpOp::Lt,
                0 => FpCmpOp::Le,
                _ => return Err(DecodeFail::Illegal),
            };
            InstKind::FpCmp { op, fmt, rd: rd(w), frs1: rs1(w), frs2: rs2(w) }
        }
        0x60 | 0x61 => InstKind::FpCvtInt {
            fmt,
            to: int_cvt(rs2(w), xlen)?,
            rd: rd(w),
            frs1: rs1(w),
            rm: check_rm(funct3(w))?,
        },
        0x68 | 0x69 => InstKind::FpCvtFromInt {
            fmt,
            from: int_cvt(rs2(w), xlen)?,
            frd: rd(w),
            rs1: rs1(w),
            rm: check_rm(funct3(w))?,
        },
        0x20 if rs2(w) == 1 => InstKind::FpCvtFp {
            to: FpFmt::S,
            frd: rd(w),
            frs1: rs1(w),
            rm: check_rm(funct3(w))?,
        },
        0x21 if rs2(w) == 0 => InstKind::FpCvtFp {
            to: FpFmt::D,
            frd: rd(w),
            frs1: rs1(w),
            rm: check_rm(funct3(w))?,
        },
        0x70 if rs2(w) == 0 => match funct3(w) {
            0 => InstKind::FpMvToInt { fmt: FpFmt::S, rd: rd(w), frs1: rs1(w) },
            1 => InstKind::FpClass { fmt: FpFmt::S, rd: rd(w), frs1: rs1(w) },
            _ => return Err(DecodeFail::Illegal),
        },
        0x71 if rs2(w) == 0 => match funct3(w) {
            0 if xlen == Xlen::Rv64 => {
                InstKind::FpMvToInt { fmt: FpFmt::D, rd: rd(w), frs1: rs1(w) }
            }
            1 => InstKind::FpClass { fmt: FpFmt::D, rd: rd(w), frs1: rs1(w) },
            _ => return Err(DecodeFail::Illegal),
        },
        0x78 if rs2(w) == 0 && funct3(w) == 0 => {
            InstKind::FpMvFromInt { fmt: FpFmt::S, frd: rd(w), rs1: rs1(w) }
        }
        0x79 if rs2(w) == 0 && funct3(w) == 0 && xlen == Xlen::Rv64 => {
            InstKind::FpMvFromInt { fmt: FpFmt::D, frd: rd(w), rs1: rs1(w) }
        }
        _ => return Err(DecodeFail::Illegal),
    };
    Ok(kind)
}

fn int_cvt(rs2: u8, xlen: Xlen) -> Result<IntCvt, DecodeFail> {
    match rs2 {
        0 => Ok(IntCvt::W),
        1 => Ok(IntCvt::Wu),
        2 if xlen == Xlen::Rv64 => Ok(IntCvt::L),
        3 if xlen == Xlen::Rv64 => Ok(IntCvt::Lu),
        _ => Err(DecodeFail::Illegal),
    }
}
