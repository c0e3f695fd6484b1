//! Block lifecycle tests: splits, continuations, invalidation, dynamic
//! operands and the host-IP back-map, all driven through the public
//! machine surface with a 4-opcode block limit so the interesting
//! boundaries are close together.

use bbc_core::driver::{GuestFault, RunResult};
use bbc_core::machine::{Machine, MachineOptions};
use cpu_6502::emit::Program;
use cpu_6502::opcodes::{Instruction, Mode};

fn machine_with(opt_flags: &str) -> Machine {
    Machine::new(&MachineOptions {
        accurate: false,
        opt_flags: opt_flags.into(),
        debug_stop_addr: None,
    })
    .unwrap()
}

fn test_machine() -> Machine {
    machine_with("jit:max-ops=4,jit:optimizing=0")
}

fn run_from(machine: &mut Machine, pc: u16) {
    machine.set_pc(pc);
    assert_eq!(machine.run(1 << 30), RunResult::Exited, "run from {pc:04X}");
}

#[track_caller]
fn expect_block_invalidated(machine: &mut Machine, expect: bool, addr: u16) {
    assert_eq!(
        machine.jit().jit().is_block_invalidated(addr),
        expect,
        "block {addr:04X}"
    );
}

#[track_caller]
fn expect_code_invalidated(machine: &mut Machine, expect: bool, addr: u16) {
    assert_eq!(
        machine.jit().jit().is_code_invalidated(addr),
        expect,
        "code {addr:04X}"
    );
}

#[test]
fn uncompiled_blocks_read_as_invalidated() {
    let mut machine = test_machine();
    expect_block_invalidated(&mut machine, true, 0x0000);
    expect_block_invalidated(&mut machine, true, 0x0B00);
    expect_block_invalidated(&mut machine, true, 0xFFFF);
}

#[test]
fn block_split() {
    let mut machine = test_machine();
    expect_block_invalidated(&mut machine, true, 0xB00);
    expect_block_invalidated(&mut machine, true, 0xB01);

    let mut p = Program::new();
    p.nop().nop().exit();
    machine.set_block(0xB00, p.bytes());

    run_from(&mut machine, 0xB00);
    expect_block_invalidated(&mut machine, false, 0xB00);
    expect_block_invalidated(&mut machine, true, 0xB01);

    // Entering mid-block splits the covering block.
    run_from(&mut machine, 0xB01);
    expect_block_invalidated(&mut machine, true, 0xB00);
    expect_block_invalidated(&mut machine, false, 0xB01);

    // Recompiling from the head stops at the established entry instead
    // of splitting it away again.
    run_from(&mut machine, 0xB00);
    expect_block_invalidated(&mut machine, false, 0xB00);
    expect_block_invalidated(&mut machine, false, 0xB01);
}

#[test]
fn block_continuation() {
    let mut machine = test_machine();
    let mut p = Program::new();
    p.nop().nop().nop().nop();
    // Block continuation here because the limit is 4 opcodes.
    p.nop().nop().exit();
    machine.set_block(0xC00, p.bytes());

    run_from(&mut machine, 0xC00);
    expect_block_invalidated(&mut machine, false, 0xC00);
    expect_block_invalidated(&mut machine, true, 0xC01);
    expect_block_invalidated(&mut machine, false, 0xC04);

    // The continuation head is not fundamental: a block grown over it
    // absorbs it.
    run_from(&mut machine, 0xC01);
    expect_block_invalidated(&mut machine, false, 0xC01);
    expect_block_invalidated(&mut machine, true, 0xC04);
    expect_block_invalidated(&mut machine, false, 0xC05);
}

#[test]
fn invalidation_mid_block() {
    let mut machine = test_machine();
    let mut p = Program::new();
    p.nop().nop().nop().nop();
    // Block continuation here.
    p.nop().nop().exit();
    machine.set_block(0xD00, p.bytes());

    run_from(&mut machine, 0xD00);
    machine.jit().jit_mut().invalidate_code_at(0xD01);

    // The block split compiling the invalidated code at 0xD01
    // invalidates the block at 0xD00.
    run_from(&mut machine, 0xD00);
    expect_block_invalidated(&mut machine, true, 0xD00);
    expect_block_invalidated(&mut machine, false, 0xD01);

    run_from(&mut machine, 0xD00);
    expect_block_invalidated(&mut machine, false, 0xD00);
    // The mid-block invalidation did not become a block boundary.
    expect_block_invalidated(&mut machine, true, 0xD01);
    expect_block_invalidated(&mut machine, false, 0xD04);

    machine.jit().jit_mut().invalidate_code_at(0xD05);

    // This creates a block at 0xD05 for a while, but neither 0xD04 nor
    // 0xD05 becomes fundamental.
    run_from(&mut machine, 0xD00);
    run_from(&mut machine, 0xD00);
    expect_block_invalidated(&mut machine, false, 0xD00);
    expect_block_invalidated(&mut machine, false, 0xD04);
    expect_block_invalidated(&mut machine, true, 0xD05);

    // No block boundaries in incorrect places.
    run_from(&mut machine, 0xD03);
    expect_block_invalidated(&mut machine, false, 0xD03);
    expect_block_invalidated(&mut machine, true, 0xD04);
    expect_block_invalidated(&mut machine, true, 0xD05);
}

#[test]
fn idempotent_invalidation() {
    let mut machine = test_machine();
    let mut p = Program::new();
    p.nop().exit();
    machine.set_block(0xB80, p.bytes());
    run_from(&mut machine, 0xB80);

    machine.jit().jit_mut().invalidate_code_at(0xB80);
    expect_code_invalidated(&mut machine, true, 0xB80);
    machine.jit().jit_mut().invalidate_code_at(0xB80);
    expect_code_invalidated(&mut machine, true, 0xB80);

    machine.jit().jit_mut().invalidate_range(0xB80, 2);
    expect_block_invalidated(&mut machine, true, 0xB80);
    machine.jit().jit_mut().invalidate_range(0xB80, 2);
    expect_block_invalidated(&mut machine, true, 0xB80);

    // Still recompiles and runs fine afterwards.
    run_from(&mut machine, 0xB80);
    expect_block_invalidated(&mut machine, false, 0xB80);
}

#[test]
fn dynamic_operand() {
    let mut machine = machine_with("jit:max-ops=4,jit:optimizing=1");

    let mut p = Program::new();
    p.lda(Mode::AbsoluteIndexedX, 0x0E01)
        .sta(Mode::Absolute, 0x00F0)
        .ldx(Mode::Immediate, 0x02)
        .stx(Mode::Absolute, 0x0E01)
        .exit();
    machine.set_block(0xE00, p.bytes());

    // First run: the STX self-modifies the LDA operand at 0x0E01 and
    // invalidates its code, but not the block entry.
    run_from(&mut machine, 0xE00);
    expect_block_invalidated(&mut machine, false, 0xE00);
    expect_code_invalidated(&mut machine, true, 0xE00);
    expect_code_invalidated(&mut machine, false, 0xE03);
    expect_block_invalidated(&mut machine, true, 0xE01);

    // The recompile promotes the operand to dynamic; the next
    // self-modification no longer invalidates anything.
    run_from(&mut machine, 0xE00);
    expect_block_invalidated(&mut machine, false, 0xE00);
    expect_code_invalidated(&mut machine, false, 0xE00);
    expect_code_invalidated(&mut machine, false, 0xE03);
    expect_block_invalidated(&mut machine, true, 0xE01);

    machine.jit().jit_mut().invalidate_code_at(0xE01);
    machine.jit().jit_mut().invalidate_code_at(0xE02);
    expect_block_invalidated(&mut machine, false, 0xE00);

    // A different opcode at 0xE00 resets the history: no dynamic
    // operand right away.
    machine.mem_write(0xE00, 0xB9); // LDA aby
    machine.jit().jit_mut().invalidate_code_at(0xE00);
    run_from(&mut machine, 0xE00);
    expect_code_invalidated(&mut machine, true, 0xE00);
}

#[test]
fn dynamic_operand_not_at_block_start() {
    let mut machine = machine_with("jit:max-ops=4,jit:optimizing=1");

    let mut p = Program::new();
    p.ldy(Mode::Immediate, 0x84)
        .lda(Mode::AbsoluteIndexedX, 0x0E83)
        .sty(Mode::Absolute, 0x0E83)
        .exit();
    machine.set_block(0xE80, p.bytes());

    run_from(&mut machine, 0xE80);
    expect_block_invalidated(&mut machine, false, 0xE80);
    expect_block_invalidated(&mut machine, true, 0xE82);
    expect_code_invalidated(&mut machine, true, 0xE82);

    // The self-modify recompile splits the block at 0xE80 and produces
    // a dynamic operand at 0xE82.
    run_from(&mut machine, 0xE80);
    expect_block_invalidated(&mut machine, true, 0xE80);
    expect_block_invalidated(&mut machine, false, 0xE82);
    expect_code_invalidated(&mut machine, false, 0xE82);

    machine.jit().jit_mut().invalidate_code_at(0xE84);
    expect_block_invalidated(&mut machine, false, 0xE82);
    expect_code_invalidated(&mut machine, false, 0xE82);

    // The promotion persists when a block is compiled over the opcode.
    run_from(&mut machine, 0xE80);
    expect_block_invalidated(&mut machine, false, 0xE80);
    expect_block_invalidated(&mut machine, true, 0xE82);
    expect_code_invalidated(&mut machine, false, 0xE82);

    machine.jit().jit_mut().invalidate_code_at(0xE84);
    expect_block_invalidated(&mut machine, true, 0xE82);
    expect_code_invalidated(&mut machine, false, 0xE82);

    // A block-split invalidation must not read as a self-modify: the
    // literal LDY operand at 0xE81 stays tracked.
    machine.jit().jit_mut().invalidate_code_at(0xE81);
    expect_code_invalidated(&mut machine, true, 0xE80);
}

#[test]
fn dynamic_operands_later_in_a_block() {
    let mut machine = machine_with("jit:max-ops=4,jit:optimizing=1");

    let mut p = Program::new();
    p.ldx(Mode::Immediate, 0x01)
        .ldy(Mode::Immediate, 0x02)
        .exit();
    machine.set_block(0xE90, p.bytes());

    run_from(&mut machine, 0xE90);
    machine.jit().jit_mut().invalidate_code_at(0xE91);
    machine.jit().jit_mut().invalidate_code_at(0xE93);

    run_from(&mut machine, 0xE90);
    machine.jit().jit_mut().invalidate_code_at(0xE91);
    machine.jit().jit_mut().invalidate_code_at(0xE93);

    // Both operands went dynamic, so nothing needed recompiling and no
    // split appeared.
    run_from(&mut machine, 0xE90);
    expect_block_invalidated(&mut machine, false, 0xE90);
    expect_block_invalidated(&mut machine, true, 0xE92);
}

#[test]
fn dynamic_operand_needs_history() {
    let mut machine = machine_with("jit:max-ops=4,jit:optimizing=1,jit:dynamic-trigger=2");

    let mut p = Program::new();
    p.lda(Mode::Immediate, 0x01).exit();
    machine.set_block(0xF00, p.bytes());

    run_from(&mut machine, 0xF00);

    machine.mem_write(0xF01, 0x02);
    expect_code_invalidated(&mut machine, true, 0xF00);

    // First compile-time encounter of the self-modified code: not
    // enough for a dynamic operand.
    run_from(&mut machine, 0xF00);
    machine.mem_write(0xF01, 0x03);
    expect_code_invalidated(&mut machine, true, 0xF00);

    // Second encounter reaches the threshold.
    run_from(&mut machine, 0xF00);
    machine.mem_write(0xF01, 0x03);
    expect_code_invalidated(&mut machine, false, 0xF00);

    // The dynamic operand persists when a block compiled earlier runs
    // into the promoted opcode.
    machine.mem_write(0xEFF, 0xEA); // NOP
    run_from(&mut machine, 0xEFF);
    machine.mem_write(0xF01, 0x04);
    expect_code_invalidated(&mut machine, false, 0xF00);
}

#[test]
fn details_from_host_ip() {
    let mut machine = machine_with("jit:max-ops=1024,jit:optimizing=0");

    let entry_a00 = machine.jit().jit().block_host_address(0xA00);
    let entry_a01 = machine.jit().jit().block_host_address(0xA01);

    let details = machine.jit().jit().details_from_host_ip(entry_a00);
    assert_eq!(details.pc_6502, None);
    assert_eq!(details.block_6502, None);
    assert_eq!(details.invalidation_code_block, None);

    let mut p = Program::new();
    p.implied(Instruction::PLA)
        .lda(Mode::Immediate, 0x00)
        .exit();
    machine.set_block(0xA00, p.bytes());
    run_from(&mut machine, 0xA00);

    // Inside the block prologue: the block resolves for invalidation
    // purposes but no opcode matches.
    let details = machine.jit().jit().details_from_host_ip(entry_a00);
    assert_eq!(details.pc_6502, None);
    assert_eq!(details.block_6502, None);
    assert_eq!(details.invalidation_code_block, Some(entry_a00));

    // A covered byte's own entry slot, past the end of the block's
    // code.
    let details = machine.jit().jit().details_from_host_ip(entry_a01);
    assert_eq!(details.pc_6502, None);
    assert_eq!(details.block_6502, None);
    assert_eq!(details.invalidation_code_block, Some(entry_a00));

    let ptr = machine.jit().jit().code_host_address(0xA00).unwrap();
    let details = machine.jit().jit().details_from_host_ip(ptr);
    assert!(details.exact_match);
    assert_eq!(details.pc_6502, Some(0xA00));
    assert_eq!(details.block_6502, Some(0xA00));
    assert_eq!(details.invalidation_code_block, Some(entry_a00));

    let ptr = machine.jit().jit().code_host_address(0xA01).unwrap();
    let details = machine.jit().jit().details_from_host_ip(ptr);
    assert!(details.exact_match);
    assert_eq!(details.pc_6502, Some(0xA01));
    assert_eq!(details.block_6502, Some(0xA00));

    let ptr = machine.jit().jit().code_host_address(0xA00).unwrap();
    let details = machine.jit().jit().details_from_host_ip(ptr + 1);
    assert!(!details.exact_match);
    assert_eq!(details.pc_6502, Some(0xA00));
    assert_eq!(details.block_6502, Some(0xA00));

    let ptr = machine.jit().jit().code_host_address(0xA01).unwrap();
    let details = machine.jit().jit().details_from_host_ip(ptr + 1);
    assert!(!details.exact_match);
    assert_eq!(details.pc_6502, Some(0xA01));
    assert_eq!(details.block_6502, Some(0xA00));
}

#[test]
fn details_for_a_spilled_block() {
    let mut machine = machine_with("jit:max-ops=1024,jit:optimizing=0");

    // Plenty of consecutive opcodes, so the block's host code spills
    // across many following entry slots.
    let mut p = Program::new();
    for _ in 0..200 {
        p.implied(Instruction::PHA);
    }
    p.exit();
    machine.set_block(0x200, p.bytes());
    run_from(&mut machine, 0x200);

    let entry_200 = machine.jit().jit().block_host_address(0x200);
    let ptr = machine.jit().jit().code_host_address(0x280).unwrap();
    let details = machine.jit().jit().details_from_host_ip(ptr);
    assert!(details.exact_match);
    assert_eq!(details.pc_6502, Some(0x280));
    assert_eq!(details.block_6502, Some(0x200));
    assert_eq!(details.invalidation_code_block, Some(entry_200));
}

#[test]
fn irq_is_serviced_at_a_block_boundary() {
    let mut machine = test_machine();

    // Vector the IRQ at a tiny handler.
    machine.set_block(0xFFFE, &[0x00, 0x11]); // -> 0x1100
    let mut handler = Program::new();
    handler.lda(Mode::Immediate, 0x05).exit();
    machine.set_block(0x1100, handler.bytes());

    // Enable interrupts, then spin.
    let mut p = Program::new();
    p.implied(Instruction::CLI).jmp(0x1001);
    machine.set_block(0x1000, p.bytes());

    machine.set_interrupt(0, true);
    machine.set_pc(0x1000);
    assert_eq!(machine.run(1 << 20), RunResult::Exited);
    assert_eq!(machine.get_registers().a, 0x05);
    // The handler pushed the return address and flags.
    assert_eq!(machine.get_registers().s, 0xFF - 3);
}

#[test]
fn guest_faults_are_reported() {
    let mut machine = test_machine();

    let mut p = Program::new();
    p.nop().crash();
    machine.set_block(0x1200, p.bytes());
    machine.set_pc(0x1200);
    assert_eq!(
        machine.run(1 << 20),
        RunResult::Fault(GuestFault::Crash { pc: 0x1201 })
    );

    machine.set_block(0x1300, &[0xEA, 0x12]); // NOP, then a jam
    machine.set_pc(0x1300);
    assert_eq!(
        machine.run(1 << 20),
        RunResult::Fault(GuestFault::Illegal {
            pc: 0x1301,
            opcode: 0x12
        })
    );
}
