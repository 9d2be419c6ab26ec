mod common;

use common::*;
use proptest::prelude::*;
use skiff_cpu_core::Xlen;
use skiff_machine::StopReason;

proptest! {
    /// x0 reads zero no matter what is written to it.
    #[test]
    fn x0_stays_zero(imm in -2048i32..2048, seed in any::<u64>()) {
        // addi x0, x0, imm ; add x0, x5, x6
        let words = [addi(0, 0, imm), add(0, 5, 6)];
        let mut machine = boot_words(Xlen::Rv64, &words);
        machine.cpu.state.set_reg(5, seed);
        machine.cpu.state.set_reg(6, seed.rotate_left(13));
        machine.simulate(2).unwrap();
        prop_assert_eq!(machine.cpu.state.reg(0), 0);
    }

    /// store(v) ; load() round-trips for every width and offset.
    #[test]
    fn store_load_roundtrip(value in any::<u64>(), offset in 0u64..16) {
        let data = CODE_BASE + 0x1000;
        let mut machine = boot_words(Xlen::Rv64, &[jal(0, 0)]);
        machine.set_page_attr(data, 0x2000, memory::PageAttr::RW).unwrap();

        let addr = data + offset;
        machine.memory.write_u64(addr, value).unwrap();
        prop_assert_eq!(machine.memory.read_u64(addr).unwrap(), value);
        machine.memory.write_u16(addr, value as u16).unwrap();
        prop_assert_eq!(machine.memory.read_u16(addr).unwrap(), value as u16);
    }

    /// A compressed instruction has the same architectural effect as its
    /// 32-bit expansion, modulo the encoded length.
    #[test]
    fn compressed_equals_expansion(imm in -32i32..32) {
        // c.addi a0, imm vs addi a0, a0, imm.
        let uimm = (imm as u32) & 0x3F;
        let c_addi = (((uimm >> 5) as u16 & 1) << 12)
            | (10 << 7)
            | ((uimm as u16 & 0x1F) << 2)
            | 0b01;
        let mut compressed = boot(
            Xlen::Rv32,
            &c_addi.to_le_bytes(),
        );
        let mut expanded = boot_words(Xlen::Rv32, &[addi(10, 10, imm)]);
        for machine in [&mut compressed, &mut expanded] {
            machine.cpu.state.set_reg(10, 1000);
            machine.simulate(1).unwrap();
        }
        prop_assert_eq!(
            compressed.cpu.state.reg(10),
            expanded.cpu.state.reg(10)
        );
        prop_assert_eq!(compressed.cpu.state.pc(), CODE_BASE + 2);
        prop_assert_eq!(expanded.cpu.state.pc(), CODE_BASE + 4);
    }

    /// One step from PC advances by the instruction length unless a
    /// branch/jump takes its target.
    #[test]
    fn pc_advance_matches_length(imm in -2048i32..2048) {
        let words = [addi(7, 7, imm), addi(8, 8, 1)];
        let mut machine = boot_words(Xlen::Rv64, &words);
        machine.simulate(1).unwrap();
        prop_assert_eq!(machine.cpu.state.pc(), CODE_BASE + 4);
    }

    /// simulate(N) retires at most N; a following simulate(M) at most M.
    #[test]
    fn budget_bounds_retirement(n in 1u64..500, m in 1u64..500) {
        let mut machine = boot_words(Xlen::Rv64, &[jal(0, 0)]);
        let reason = machine.simulate(n).unwrap();
        prop_assert_eq!(reason, StopReason::InstructionLimit);
        prop_assert!(machine.cpu.state.instret <= n);
        machine.simulate(m).unwrap();
        prop_assert!(machine.cpu.state.instret <= n + m);
    }
}
