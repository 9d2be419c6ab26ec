mod common;

use common::*;
use pretty_assertions::assert_eq;
use skiff_cpu_core::{Exception, Xlen};
use skiff_machine::StopReason;

#[test]
fn addi_chain_retires_exactly() {
    // li x1, 0 ; then addi x1, x1, 1 a thousand times.
    let mut words = vec![li(1, 0)];
    words.extend(std::iter::repeat(addi(1, 1, 1)).take(1000));
    let mut machine = boot_words(Xlen::Rv64, &words);

    let reason = machine.simulate(1001).unwrap();
    assert_eq!(reason, StopReason::InstructionLimit);
    assert_eq!(machine.cpu.state.reg(1), 1000);
    assert_eq!(machine.cpu.state.instret, 1001);
}

#[test]
fn store_load_roundtrip_at_every_alignment() {
    // For each offset 0..4: sw t0, off(sp) ; lw t1, off(sp). Unaligned
    // accesses are permitted and may straddle pages.
    for offset in 0..4i32 {
        let words = [sw(5, 2, offset), lw(6, 2, offset)];
        let mut machine = boot_words(Xlen::Rv32, &words);
        machine.cpu.state.set_reg(5, 0xDEAD_BEEF);
        // Point sp into the middle of the stack so negative and positive
        // offsets both stay mapped.
        let sp = machine.stack_pointer() - 64;
        machine.set_stack_pointer(sp);

        machine.simulate(2).unwrap();
        assert_eq!(machine.cpu.state.reg(6), 0xDEAD_BEEF, "offset {offset}");
    }
}

#[test]
fn ecall_routes_to_exit_handler() {
    // li a7, 93 ; li a0, 42 ; ecall
    let words = [li(17, 93), li(10, 42), ecall()];
    let mut machine = boot_words(Xlen::Rv64, &words);
    machine.setup_minimal_syscalls();

    let reason = machine.simulate(10).unwrap();
    assert_eq!(reason, StopReason::Stopped);
    assert!(machine.stopped());
    assert_eq!(machine.return_value(), 42);
    assert_eq!(machine.cpu.state.instret, 3);
}

#[test]
fn unhandled_syscall_is_a_typed_error() {
    let words = [li(17, 93), ecall()];
    let mut machine = boot_words(Xlen::Rv64, &words);
    assert_eq!(
        machine.simulate(10),
        Err(Exception::UnhandledSyscall { number: 93 })
    );
}

#[test]
fn budget_is_resumable() {
    // An infinite loop: j .
    let words = [jal(0, 0)];
    let mut machine = boot_words(Xlen::Rv64, &words);

    assert_eq!(machine.simulate(100).unwrap(), StopReason::InstructionLimit);
    assert_eq!(machine.cpu.state.instret, 100);
    assert_eq!(machine.simulate(50).unwrap(), StopReason::InstructionLimit);
    assert_eq!(machine.cpu.state.instret, 150);
}

#[test]
fn external_stop_token_halts_the_loop() {
    let words = [jal(0, 0)];
    let mut machine = boot_words(Xlen::Rv64, &words);
    let token = machine.stop_token();

    // Stop from "outside" after the loop is entered: flip the flag first
    // and verify the loop honors it at the next boundary.
    std::thread::scope(|scope| {
        let handle = scope.spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            token.store(true, std::sync::atomic::Ordering::Relaxed);
        });
        let reason = machine.simulate(u64::MAX).unwrap();
        assert_eq!(reason, StopReason::Stopped);
        handle.join().unwrap();
    });
}

#[test]
fn vmcall_returns_a0() {
    // A guest function: addi a0, a0, 1 ; ret
    let words = [addi(10, 10, 1), ret()];
    let mut machine = boot_words(Xlen::Rv64, &words);

    let result = machine.vmcall(CODE_BASE, &[41], 100).unwrap();
    assert_eq!(result, 42);
}

#[test]
fn branches_take_their_targets() {
    // li x5, 3 ; loop: addi x5, x5, -1 ; bne x5, x0, loop ; li a0, 7
    let words = [
        li(5, 3),
        addi(5, 5, -1),
        bne(5, 0, -4),
        li(10, 7),
    ];
    let mut machine = boot_words(Xlen::Rv64, &words);
    machine.simulate(8).unwrap();
    assert_eq!(machine.cpu.state.reg(5), 0);
    assert_eq!(machine.cpu.state.reg(10), 7);
    // 1 li + 3 addi + 3 bne + 1 li
    assert_eq!(machine.cpu.state.instret, 8);
}

#[test]
fn jal_links_past_the_call() {
    // jal x1, +8 (skips one instruction) ; li x5, 1 (skipped) ; li x6, 2
    let words = [jal(1, 8), li(5, 1), li(6, 2)];
    let mut machine = boot_words(Xlen::Rv64, &words);
    machine.simulate(2).unwrap();
    assert_eq!(machine.cpu.state.reg(1), CODE_BASE + 4);
    assert_eq!(machine.cpu.state.reg(5), 0);
    assert_eq!(machine.cpu.state.reg(6), 2);
}

#[test]
fn step_one_advances_a_single_instruction() {
    let words = [li(5, 1), li(6, 2)];
    let mut machine = boot_words(Xlen::Rv64, &words);
    machine.step_one().unwrap();
    assert_eq!(machine.cpu.state.reg(5), 1);
    assert_eq!(machine.cpu.state.reg(6), 0);
    assert_eq!(machine.cpu.state.instret, 1);
}

#[test]
fn ebreak_routes_to_the_debug_trap_handler() {
    use skiff_machine::SYSCALL_EBREAK;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    let words = [li(10, 5), ebreak(), li(10, 6)];

    // Unbound EBREAK is an unhandled-syscall error.
    let mut machine = boot_words(Xlen::Rv64, &words);
    assert_eq!(
        machine.simulate(10),
        Err(Exception::UnhandledSyscall { number: SYSCALL_EBREAK })
    );

    // A bound handler sees the machine and may continue execution.
    let mut machine = boot_words(Xlen::Rv64, &words);
    let hits = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&hits);
    machine.install_ebreak_handler(move |m| {
        seen.store(m.return_value() as u64, Ordering::Relaxed);
        Ok(())
    });
    machine.simulate(3).unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), 5);
    assert_eq!(machine.cpu.state.reg(10), 6);
}

#[test]
fn reset_reinitializes_state_and_memory() {
    let words = [li(5, 9), jal(0, 0)];
    let mut machine = boot_words(Xlen::Rv64, &words);
    machine.simulate(3).unwrap();
    assert_eq!(machine.cpu.state.reg(5), 9);

    machine.reset().unwrap();
    assert_eq!(machine.cpu.state.reg(5), 0);
    assert_eq!(machine.cpu.state.instret, 0);
    assert_eq!(machine.cpu.state.pc(), 0);
    // The code pages are gone until a loader maps them again.
    let mut byte = [0u8; 1];
    assert!(machine.copy_from_guest(&mut byte, CODE_BASE).is_err());
}

#[test]
fn write_syscall_reaches_the_stdout_callback() {
    use std::sync::{Arc, Mutex};

    // Guest data page holding "hi\n" + write(1, buf, 3) + exit(0).
    let message = b"hi\n";
    let data_addr = CODE_BASE + 0x1000;
    let words = [
        li(17, 64),                       // a7 = write
        li(10, 1),                        // a0 = stdout
        lui(11, (data_addr & 0xFFFF_F000) as i32),
        addi(11, 11, (data_addr & 0xFFF) as i32),
        li(12, message.len() as i32),     // a2 = len
        ecall(),
        li(17, 93),
        li(10, 0),
        ecall(),
    ];
    let mut machine = boot_words(Xlen::Rv64, &words);
    machine.setup_minimal_syscalls();
    machine
        .set_page_attr(data_addr, 0x1000, memory::PageAttr::RW)
        .unwrap();
    machine.copy_to_guest(data_addr, message).unwrap();

    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    machine.set_stdout(move |bytes| sink.lock().unwrap().extend_from_slice(bytes));

    let reason = machine.simulate(100).unwrap();
    assert_eq!(reason, StopReason::Stopped);
    assert_eq!(machine.return_value(), 0);
    assert_eq!(captured.lock().unwrap().as_slice(), message);
}
