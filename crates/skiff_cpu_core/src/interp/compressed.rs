//! Compressed (RVC) expander.
//!
//! Every defined 16-bit encoding maps to exactly one 32-bit base
//! instruction, so the expander emits the base word and lets the base
//! decoder extract operands; semantic equivalence between a compressed
//! encoding and its expansion holds by construction. Reserved encodings
//! fail with [`DecodeFail::Illegal`].

use crate::state::Xlen;

use super::decode::DecodeFail;

#[inline]
fn bit(h: u16, n: u32) -> u32 {
    ((h >> n) & 1) as u32
}

#[inline]
fn bits(h: u16, hi: u32, lo: u32) -> u32 {
    ((h >> lo) as u32) & ((1 << (hi - lo + 1)) - 1)
}

/// x8..x15, the registers reachable from three-bit fields.
#[inline]
fn rc(field: u32) -> u32 {
    8 + field
}

#[inline]
fn sext(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value as i32) << shift) >> shift
}

fn enc_r(opcode: u32, rd: u32, funct3: u32, rs1: u32, rs2: u32, funct7: u32) -> u32 {
    opcode | rd << 7 | funct3 << 12 | rs1 << 15 | rs2 << 20 | funct7 << 25
}

fn enc_i(opcode: u32, rd: u32, funct3: u32, rs1: u32, imm: i32) -> u32 {
    opcode | rd << 7 | funct3 << 12 | rs1 << 15 | ((imm as u32) & 0xFFF) << 20
}

fn enc_s(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    opcode | (imm & 0x1F) << 7 | funct3 << 12 | rs1 << 15 | rs2 << 20 | ((imm >> 5) & 0x7F) << 25
}

fn enc_b(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    opcode
        | ((imm >> 11) & 1) << 7
        | ((imm >> 1) & 0xF) << 8
        | funct3 << 12
        | rs1 << 15
        | rs2 << 20
        | ((imm >> 5) & 0x3F) << 25
        | ((imm >> 12) & 1) << 31
}

/// `imm` carries the already-shifted U-type value (bits 12..31).
fn enc_u(opcode: u32, rd: u32, imm: i32) -> u32 {
    opcode | rd << 7 | (imm as u32 & 0xFFFF_F000)
}

fn enc_j(opcode: u32, rd: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    opcode
        | rd << 7
        | ((imm >> 12) & 0xFF) << 12
        | ((imm >> 11) & 1) << 20
        | ((imm >> 1) & 0x3FF) << 21
        | ((imm >> 20) & 1) << 31
}

const OP_LOAD: u32 = 0x03;
const OP_LOAD_FP: u32 = 0x07;
const OP_OP_IMM: u32 = 0x13;
const OP_STORE: u32 = 0x23;
const OP_STORE_FP: u32 = 0x27;
const OP_OP: u32 = 0x33;
const OP_LUI: u32 = 0x37;
const OP_OP_IMM32: u32 = 0x1B;
const OP_OP32: u32 = 0x3B;
const OP_JALR: u32 = 0x67;
const OP_JAL: u32 = 0x6F;

/// CJ-type offset: [11|4|9:8|10|6|7|3:1|5] in halfword bits 12..2.
fn cj_offset(h: u16) -> i32 {
    let imm = bit(h, 12) << 11
        | bit(h, 11) << 4
        | bits(h, 10, 9) << 8
        | bit(h, 8) << 10
        | bit(h, 7) << 6
        | bit(h, 6) << 7
        | bits(h, 5, 3) << 1
        | bit(h, 2) << 5;
    sext(imm, 12)
}

/// CB-type offset: [8|4:3|7:6|2:1|5].
fn cb_offset(h: u16) -> i32 {
    let imm = bit(h, 12) << 8
        | bits(h, 11, 10) << 3
        | bits(h, 6, 5) << 6
        | bits(h, 4, 3) << 1
        | bit(h, 2) << 5;
    sext(imm, 9)
}

/// Expands a 16-bit encoding into its 32-bit base equivalent.
pub fn expand(h: u16, xlen: Xlen) -> Result<u32, DecodeFail> {
    let funct3 = (h >> 13) & 0x7;
    match h & 0b11 {
        0b00 => expand_q0(h, funct3, xlen),
        0b01 => expand_q1(h, funct3, xlen),
        0b10 => expand_q2(h, funct3, xlen),
        _ => Err(DecodeFail::Illegal),
    }
}

fn expand_q0(h: u16, funct3: u16, xlen: Xlen) -> Result<u32, DecodeFail> {
    let rd_c = rc(bits(h, 4, 2));
    let rs1_c = rc(bits(h, 9, 7));
    // C.LW/C.SW scaled offset: [5:3|2|6].
    let imm_w = (bits(h, 12, 10) << 3 | bit(h, 6) << 2 | bit(h, 5) << 6) as i32;
    // C.LD/C.FLD scaled offset: [5:3|7:6].
    let imm_d = (bits(h, 12, 10) << 3 | bits(h, 6, 5) << 6) as i32;
    match funct3 {
        0b000 => {
            // C.ADDI4SPN: nzuimm[5:4|9:6|2|3].
            let imm = bits(h, 12, 11) << 4
                | bits(h, 10, 7) << 6
                | bit(h, 6) << 2
                | bit(h, 5) << 3;
            if imm == 0 {
                return Err(DecodeFail::Illegal);
            }
            Ok(enc_i(OP_OP_IMM, rd_c, 0, 2, imm as i32))
        }
        0b001 => Ok(enc_i(OP_LOAD_FP, rd_c, 3, rs1_c, imm_d)),
        0b010 => Ok(enc_i(OP_LOAD, rd_c, 2, rs1_c, imm_w)),
        0b011 => match xlen {
            Xlen::Rv32 => Ok(enc_i(OP_LOAD_FP, rd_c, 2, rs1_c, imm_w)),
            Xlen::Rv64 => Ok(enc_i(OP_LOAD, rd_c, 3, rs1_c, imm_d)),
        },
        0b101 => Ok(enc_s(OP_STORE_FP, 3, rs1_c, rd_c, imm_d)),
        0b110 => Ok(enc_s(OP_STORE, 2, rs1_c, rd_c, imm_w)),
        0b111 => match xlen {
            Xlen::Rv32 => Ok(enc_s(OP_STORE_FP, 2, rs1_c, rd_c, imm_w)),
            Xlen::Rv64 => Ok(enc_s(OP_STORE, 3, rs1_c, rd_c, imm_d)),
        },
        _ => Err(DecodeFail::Illegal),
    }
}

fn expand_q1(h: u16, funct3: u16, xlen: Xlen) -> Result<u32, DecodeFail> {
    let rd = bits(h, 11, 7);
    let imm6 = sext(bit(h, 12) << 5 | bits(h, 6, 2), 6);
    match funct3 {
        0b000 => Ok(enc_i(OP_OP_IMM, rd, 0, rd, imm6)),
        0b001 => match xlen {
            Xlen::Rv32 => Ok(enc_j(OP_JAL, 1, cj_offset(h))),
            Xlen::Rv64 => {
                if rd == 0 {
                    return Err(DecodeFail::Illegal);
                }
                Ok(enc_i(OP_OP_IMM32, rd, 0, rd, imm6))
            }
        },
        0b010 => Ok(enc_i(OP_OP_IMM, rd, 0, 0, imm6)),
        0b011 => {
            if rd == 2 {
                // C.ADDI16SP: nzimm[9|4|6|8:7|5].
                let imm = sext(
                    bit(h, 12) << 9
                        | bit(h, 6) << 4
                        | bit(h, 5) << 6
                        | bits(h, 4, 3) << 7
                        | bit(h, 2) << 5,
                    10,
                );
                if imm == 0 {
                    return Err(DecodeFail::Illegal);
                }
                Ok(enc_i(OP_OP_IMM, 2, 0, 2, imm))
            } else {
                // C.LUI: nzimm[17|16:12].
                let imm = sext(bit(h, 12) << 17 | bits(h, 6, 2) << 12, 18);
                if imm == 0 {
                    return Err(DecodeFail::Illegal);
                }
                Ok(enc_u(OP_LUI, rd, imm))
            }
        }
        0b100 => {
            let rd_c = rc(bits(h, 9, 7));
            match bits(h, 11, 10) {
                0b00 | 0b01 => {
                    let shamt = bit(h, 12) << 5 | bits(h, 6, 2);
                    if xlen == Xlen::Rv32 && bit(h, 12) != 0 {
                        return Err(DecodeFail::Illegal);
                    }
                    let funct7 = if bits(h, 11, 10) == 0b01 { 0x20 } else { 0x00 };
                    Ok(enc_r(OP_OP_IMM, rd_c, 5, rd_c, shamt & 0x1F, funct7 | (shamt >> 5)))
                }
                0b10 => Ok(enc_i(OP_OP_IMM, rd_c, 7, rd_c, imm6)),
                _ => {
                    let rs2_c = rc(bits(h, 4, 2));
                    if bit(h, 12) == 0 {
                        let (funct3, funct7) = match bits(h, 6, 5) {
                            0b00 => (0, 0x20), // C.SUB
                            0b01 => (4, 0x00), // C.XOR
                            0b10 => (6, 0x00), // C.OR
                            _ => (7, 0x00),    // C.AND
                        };
                        Ok(enc_r(OP_OP, rd_c, funct3, rd_c, rs2_c, funct7))
                    } else if xlen == Xlen::Rv64 {
                        match bits(h, 6, 5) {
                            0b00 => Ok(enc_r(OP_OP32, rd_c, 0, rd_c, rs2_c, 0x20)), // C.SUBW
                            0b01 => Ok(enc_r(OP_OP32, rd_c, 0, rd_c, rs2_c, 0x00)), // C.ADDW
                            _ => Err(DecodeFail::Illegal),
                        }
                    } else {
                        Err(DecodeFail::Illegal)
                    }
                }
            }
        }
        0b101 => Ok(enc_j(OP_JAL, 0, cj_offset(h))),
        0b110 => Ok(enc_b(0x63, 0, rc(bits(h, 9, 7)), 0, cb_offset(h))),
        0b111 => Ok(enc_b(0x63, 1, rc(bits(h, 9, 7)), 0, cb_offset(h))),
        _ => unreachable!(),
    }
}

fn expand_q2(h: u16, funct3: u16, xlen: Xlen) -> Result<u32, DecodeFail> {
    let rd = bits(h, 11, 7);
    let rs2 = bits(h, 6, 2);
    // Stack-pointer-relative scaled offsets.
    let imm_lwsp = (bit(h, 12) << 5 | bits(h, 6, 4) << 2 | bits(h, 3, 2) << 6) as i32;
    let imm_ldsp = (bit(h, 12) << 5 | bits(h, 6, 5) << 3 | bits(h, 4, 2) << 6) as i32;
    let imm_swsp = (bits(h, 12, 9) << 2 | bits(h, 8, 7) << 6) as i32;
    let imm_sdsp = (bits(h, 12, 10) << 3 | bits(h, 9, 7) << 6) as i32;
    match funct3 {
        0b000 => {
            let shamt = bit(h, 12) << 5 | rs2;
            if xlen == Xlen::Rv32 && bit(h, 12) != 0 {
                return Err(DecodeFail::Illegal);
            }
            Ok(enc_r(OP_OP_IMM, rd, 1, rd, shamt & 0x1F, shamt >> 5))
        }
        0b001 => Ok(enc_i(OP_LOAD_FP, rd, 3, 2, imm_ldsp)),
        0b010 => {
            if rd == 0 {
                return Err(DecodeFail::Illegal);
            }
            Ok(enc_i(OP_LOAD, rd, 2, 2, imm_lwsp))
        }
        0b011 => match xlen {
            Xlen::Rv32 => Ok(enc_i(OP_LOAD_FP, rd, 2, 2, imm_lwsp)),
            Xlen::Rv64 => {
                if rd == 0 {
                    return Err(DecodeFail::Illegal);
                }
                Ok(enc_i(OP_LOAD, rd, 3, 2, imm_ldsp))
            }
        },
        0b100 => {
            if bit(h, 12) == 0 {
                if rs2 == 0 {
                    if rd == 0 {
                        return Err(DecodeFail::Illegal);
                    }
                    Ok(enc_i(OP_JALR, 0, 0, rd, 0)) // C.JR
                } else {
                    Ok(enc_r(OP_OP, rd, 0, 0, rs2, 0)) // C.MV
                }
            } else if rs2 == 0 {
                if rd == 0 {
                    Ok(0x0010_0073) // C.EBREAK
                } else {
                    Ok(enc_i(OP_JALR, 1, 0, rd, 0)) // C.JALR
                }
            } else {
                Ok(enc_r(OP_OP, rd, 0, rd, rs2, 0)) // C.ADD
            }
        }
        0b101 => Ok(enc_s(OP_STORE_FP, 3, 2, rs2, imm_sdsp)),
        0b110 => Ok(enc_s(OP_STORE, 2, 2, rs2, imm_swsp)),
        0b111 => match xlen {
            Xlen::Rv32 => Ok(enc_s(OP_STORE_FP, 2, 2, rs2, imm_swsp)),
            Xlen::Rv64 => Ok(enc_s(OP_STORE, 3, 2, rs2, imm_sdsp)),
        },
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::super::{decode, AluOp, BranchCond, InstKind, MemWidth};
    use super::*;

    proptest! {
        /// Whatever the expander accepts, the base decoder accepts too:
        /// expansion never fabricates an undecodable word.
        #[test]
        fn expansion_always_decodes(half in any::<u16>()) {
            for xlen in [Xlen::Rv32, Xlen::Rv64] {
                if half & 0b11 == 0b11 {
                    continue;
                }
                if let Ok(word) = expand(half, xlen) {
                    prop_assert!(
                        decode(word, xlen).is_ok(),
                        "h={half:#06x} expanded to undecodable {word:#010x}"
                    );
                }
            }
        }
    }

    fn expand_kind(h: u16, xlen: Xlen) -> InstKind {
        let word = expand(h, xlen).unwrap();
        decode(word, xlen).unwrap().kind
    }

    #[test]
    fn all_zero_halfword_is_illegal() {
        assert_eq!(expand(0, Xlen::Rv32), Err(DecodeFail::Illegal));
        assert_eq!(expand(0, Xlen::Rv64), Err(DecodeFail::Illegal));
    }

    #[test]
    fn c_addi() {
        // c.addi x10, -1 => 0x157d
        assert_eq!(
            expand_kind(0x157D, Xlen::Rv32),
            InstKind::OpImm { op: AluOp::Add, rd: 10, rs1: 10, imm: -1 }
        );
    }

    #[test]
    fn c_li_and_c_lui() {
        // c.li x10, 1 => 0x4505
        assert_eq!(
            expand_kind(0x4505, Xlen::Rv32),
            InstKind::OpImm { op: AluOp::Add, rd: 10, rs1: 0, imm: 1 }
        );
        // c.lui x10, 0x1f (negative, sign-extends to 0xfffff000) => 0x757d
        assert_eq!(
            expand_kind(0x757D, Xlen::Rv32),
            InstKind::Lui { rd: 10, imm: -4096 }
        );
    }

    #[test]
    fn c_mv_and_c_add() {
        // c.mv x10, x11 => 0x852e
        assert_eq!(
            expand_kind(0x852E, Xlen::Rv32),
            InstKind::Op { op: AluOp::Add, rd: 10, rs1: 0, rs2: 11 }
        );
        // c.add x10, x11 => 0x952e
        assert_eq!(
            expand_kind(0x952E, Xlen::Rv32),
            InstKind::Op { op: AluOp::Add, rd: 10, rs1: 10, rs2: 11 }
        );
    }

    #[test]
    fn c_lwsp_rd_zero_is_reserved() {
        // c.lwsp x0, 0(sp) => 0x4002
        assert_eq!(expand(0x4002, Xlen::Rv32), Err(DecodeFail::Illegal));
    }

    #[test]
    fn c_jal_is_addiw_on_rv64() {
        // Same bits: c.jal on RV32, c.addiw x10, -1 on RV64 (0x357d).
        assert!(matches!(
            expand_kind(0x357D, Xlen::Rv32),
            InstKind::Jal { rd: 1, .. }
        ));
        assert_eq!(
            expand_kind(0x357D, Xlen::Rv64),
            InstKind::OpImm32 { op: AluOp::Add, rd: 10, rs1: 10, imm: -1 }
        );
    }

    #[test]
    fn c_lw_offset_scaling() {
        // c.lw x10, 4(x11) => 0x41c8
        assert_eq!(
            expand_kind(0x41C8, Xlen::Rv32),
            InstKind::Load { width: MemWidth::W, signed: true, rd: 10, rs1: 11, offset: 4 }
        );
    }

    #[test]
    fn c_beqz_negative_offset() {
        // c.beqz x10, 8 => 0xc501
        assert_eq!(
            expand_kind(0xC501, Xlen::Rv32),
            InstKind::Branch { cond: BranchCond::Eq, rs1: 10, rs2: 0, offset: 8 }
        );
    }

    #[test]
    fn c_sub_family() {
        // c.sub x10, x11 => 0x8d0d
        assert_eq!(
            expand_kind(0x8D0D, Xlen::Rv32),
            InstKind::Op { op: AluOp::Sub, rd: 10, rs1: 10, rs2: 11 }
        );
        // c.and x10, x11 => 0x8d6d
        assert_eq!(
            expand_kind(0x8D6D, Xlen::Rv32),
            InstKind::Op { op: AluOp::And, rd: 10, rs1: 10, rs2: 11 }
        );
    }

    #[test]
    fn c_andi_sweep_expands_to_andi() {
        for imm in -32i32..32 {
            let uimm = (imm as u32) & 0x3F;
            // C.ANDI a0: funct3=100, bit12=imm[5], rd'=010 (x10), funct2=10, imm[4:0].
            let h = (0b100u16 << 13)
                | (((uimm >> 5) as u16 & 1) << 12)
                | (0b10 << 10)
                | (0b010 << 7)
                | ((uimm as u16 & 0x1F) << 2)
                | 0b01;
            assert_eq!(
                expand_kind(h, Xlen::Rv32),
                InstKind::OpImm { op: AluOp::And, rd: 10, rs1: 10, imm },
                "imm={imm}"
            );
        }
    }
}
