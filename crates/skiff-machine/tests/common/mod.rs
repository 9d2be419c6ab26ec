//! Shared helpers: a minimal instruction encoder and machine bring-up.

#![allow(dead_code)]

use memory::PageAttr;
use skiff_cpu_core::Xlen;
use skiff_machine::{Machine, MachineOptions};

pub const CODE_BASE: u64 = 0x1_0000;

pub fn rtype(opcode: u32, rd: u32, funct3: u32, rs1: u32, rs2: u32, funct7: u32) -> u32 {
    opcode | rd << 7 | funct3 << 12 | rs1 << 15 | rs2 << 20 | funct7 << 25
}

pub fn itype(opcode: u32, rd: u32, funct3: u32, rs1: u32, imm: i32) -> u32 {
    opcode | rd << 7 | funct3 << 12 | rs1 << 15 | ((imm as u32) & 0xFFF) << 20
}

pub fn stype(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    opcode | (imm & 0x1F) << 7 | funct3 << 12 | rs1 << 15 | rs2 << 20 | ((imm >> 5) & 0x7F) << 25
}

pub fn btype(opcode: u32, funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
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

pub fn jtype(opcode: u32, rd: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    opcode
        | rd << 7
        | ((imm >> 12) & 0xFF) << 12
        | ((imm >> 11) & 1) << 20
        | ((imm >> 1) & 0x3FF) << 21
        | ((imm >> 20) & 1) << 31
}

pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    itype(0x13, rd, 0, rs1, imm)
}

pub fn li(rd: u32, imm: i32) -> u32 {
    addi(rd, 0, imm)
}

pub fn lui(rd: u32, imm: i32) -> u32 {
    0x37 | rd << 7 | (imm as u32 & 0xFFFF_F000)
}

pub fn lw(rd: u32, rs1: u32, offset: i32) -> u32 {
    itype(0x03, rd, 2, rs1, offset)
}

pub fn lbu(rd: u32, rs1: u32, offset: i32) -> u32 {
    itype(0x03, rd, 4, rs1, offset)
}

pub fn sw(rs2: u32, rs1: u32, offset: i32) -> u32 {
    stype(0x23, 2, rs1, rs2, offset)
}

pub fn sb(rs2: u32, rs1: u32, offset: i32) -> u32 {
    stype(0x23, 0, rs1, rs2, offset)
}

pub fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
    rtype(0x33, rd, 0, rs1, rs2, 0)
}

pub fn jal(rd: u32, offset: i32) -> u32 {
    jtype(0x6F, rd, offset)
}

pub fn jalr(rd: u32, rs1: u32, offset: i32) -> u32 {
    itype(0x67, rd, 0, rs1, offset)
}

pub fn beq(rs1: u32, rs2: u32, offset: i32) -> u32 {
    btype(0x63, 0, rs1, rs2, offset)
}

pub fn bne(rs1: u32, rs2: u32, offset: i32) -> u32 {
    btype(0x63, 1, rs1, rs2, offset)
}

pub fn ecall() -> u32 {
    0x0000_0073
}

pub fn ebreak() -> u32 {
    0x0010_0073
}

/// jalr x0, 0(ra)
pub fn ret() -> u32 {
    jalr(0, 1, 0)
}

pub fn amo_w(funct5: u32, rd: u32, rs1: u32, rs2: u32) -> u32 {
    rtype(0x2F, rd, 2, rs1, rs2, funct5 << 2)
}

pub fn assemble(words: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Boots a machine with `code` mapped read+execute at [`CODE_BASE`] and the
/// PC pointing at it, the way an external loader would.
pub fn boot(xlen: Xlen, code: &[u8]) -> Machine {
    let mut machine = Machine::new(MachineOptions {
        xlen,
        ..Default::default()
    })
    .expect("machine options are valid");
    let len = code.len().max(1) as u64;
    machine.set_page_attr(CODE_BASE, len, PageAttr::RW).unwrap();
    machine.copy_to_guest(CODE_BASE, code).unwrap();
    machine.set_page_attr(CODE_BASE, len, PageAttr::RX).unwrap();
    machine.set_heap_base(CODE_BASE + 0x10_0000);
    machine.set_start_address(CODE_BASE);
    machine
}

pub fn boot_words(xlen: Xlen, words: &[u32]) -> Machine {
    boot(xlen, &assemble(words))
}
