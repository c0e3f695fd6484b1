//! Backend equivalence: any terminating program must leave identical
//! registers, flags and memory behind whether it ran through the
//! interpreter or through compiled blocks — with folding on or off, and
//! with blocks cut short enough to force continuations everywhere.

use bbc_core::driver::RunResult;
use bbc_core::machine::{Machine, MachineOptions, Registers};
use cpu_6502::emit::Program;
use cpu_6502::opcodes::{Instruction, Mode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const LOAD_ADDR: u16 = 0x1000;

struct Outcome {
    registers: Registers,
    low_memory: Vec<u8>,
    data_page: Vec<u8>,
}

fn run_machine(opt_flags: &str, accurate: bool, setup: &dyn Fn(&mut Machine)) -> Outcome {
    let mut machine = Machine::new(&MachineOptions {
        accurate,
        opt_flags: opt_flags.into(),
        debug_stop_addr: None,
    })
    .unwrap();
    setup(&mut machine);
    assert_eq!(machine.run(10_000_000), RunResult::Exited);
    Outcome {
        registers: machine.get_registers(),
        low_memory: (0x0000..0x0300).map(|a| machine.mem_read(a)).collect(),
        data_page: (0x2000..0x2200).map(|a| machine.mem_read(a)).collect(),
    }
}

/// Run through the interpreter and two differently tuned JIT machines,
/// and insist on identical final state.
fn assert_equivalent(setup: &dyn Fn(&mut Machine)) {
    let reference = run_machine("", true, setup);
    for opt_flags in ["jit:max-ops=4,jit:optimizing=1", "jit:max-ops=3,jit:optimizing=0"] {
        let jit = run_machine(opt_flags, false, setup);
        assert_eq!(jit.registers, reference.registers, "{opt_flags}");
        assert_eq!(jit.low_memory, reference.low_memory, "{opt_flags}");
        assert_eq!(jit.data_page, reference.data_page, "{opt_flags}");
    }
}

fn program_setup(program: Program) -> impl Fn(&mut Machine) {
    move |machine: &mut Machine| {
        machine.set_block(LOAD_ADDR, program.bytes());
        machine.set_pc(LOAD_ADDR);
    }
}

#[test]
fn arithmetic_and_flags() {
    let mut p = Program::new();
    p.op(Instruction::CLD, Mode::Implied, 0)
        .implied(Instruction::CLC)
        .lda(Mode::Immediate, 0x7F)
        .adc(Mode::Immediate, 0x01)
        .sta(Mode::ZeroPage, 0x40)
        .implied(Instruction::SEC)
        .op(Instruction::SBC, Mode::Immediate, 0x30)
        .op(Instruction::CMP, Mode::Immediate, 0x50)
        .op(Instruction::CPX, Mode::Immediate, 0x00)
        .op(Instruction::ORA, Mode::Immediate, 0x0F)
        .op(Instruction::AND, Mode::Immediate, 0x3C)
        .op(Instruction::EOR, Mode::Immediate, 0xFF)
        .sta(Mode::Absolute, 0x2000)
        .exit();
    assert_equivalent(&program_setup(p));
}

#[test]
fn decimal_mode_arithmetic() {
    let mut p = Program::new();
    p.implied(Instruction::SED)
        .implied(Instruction::CLC)
        .lda(Mode::Immediate, 0x09)
        .adc(Mode::Immediate, 0x01)
        .sta(Mode::ZeroPage, 0x41)
        .implied(Instruction::CLC)
        .lda(Mode::Immediate, 0x50)
        .adc(Mode::Immediate, 0x99)
        .sta(Mode::ZeroPage, 0x42)
        .implied(Instruction::SEC)
        .lda(Mode::Immediate, 0x10)
        .op(Instruction::SBC, Mode::Immediate, 0x01)
        .sta(Mode::ZeroPage, 0x43)
        .implied(Instruction::CLD)
        .exit();
    assert_equivalent(&program_setup(p));
}

#[test]
fn counted_loop_with_stores() {
    let mut p = Program::new();
    p.lda(Mode::Immediate, 0x00).ldx(Mode::Immediate, 0x08);
    // loop: CLC; ADC #3; STA $50; DEX; BNE loop
    p.implied(Instruction::CLC)
        .adc(Mode::Immediate, 0x03)
        .sta(Mode::ZeroPage, 0x50)
        .op(Instruction::DEX, Mode::Implied, 0)
        .branch(Instruction::BNE, -8)
        .exit();
    assert_equivalent(&program_setup(p));
}

#[test]
fn forward_branches_and_conditions() {
    let mut p = Program::new();
    p.lda(Mode::Immediate, 0x00)
        .branch(Instruction::BEQ, 2) // skip the LDA below
        .lda(Mode::Immediate, 0xFF)
        .branch(Instruction::BMI, 2) // not taken
        .ldx(Mode::Immediate, 0x11)
        .branch(Instruction::BCC, 2) // carry clear at reset: taken
        .ldy(Mode::Immediate, 0x22)
        .exit();
    assert_equivalent(&program_setup(p));
}

#[test]
fn subroutines() {
    let sub = {
        let mut p = Program::new();
        p.op(Instruction::INX, Mode::Implied, 0)
            .op(Instruction::INX, Mode::Implied, 0)
            .op(Instruction::RTS, Mode::Implied, 0);
        p
    };
    let mut main = Program::new();
    main.ldx(Mode::Immediate, 0x00)
        .jsr(0x1040)
        .jsr(0x1040)
        .stx(Mode::ZeroPage, 0x44)
        .exit();
    assert_equivalent(&move |machine: &mut Machine| {
        machine.set_block(0x1040, sub.bytes());
        machine.set_block(LOAD_ADDR, main.bytes());
        machine.set_pc(LOAD_ADDR);
    });
}

#[test]
fn indexed_addressing_with_page_crossing() {
    let mut p = Program::new();
    p.ldx(Mode::Immediate, 0x20)
        .ldy(Mode::Immediate, 0x02)
        .lda(Mode::AbsoluteIndexedX, 0x20F0) // crosses into 0x2110
        .sta(Mode::ZeroPage, 0x45)
        .lda(Mode::IndirectY, 0x40) // ($40),Y -> 0x20FF + 2, crosses
        .sta(Mode::ZeroPage, 0x46)
        .lda(Mode::IndirectX, 0x20) // ($20,X) -> pointer at $40
        .sta(Mode::ZeroPageX, 0x47)
        .exit();
    assert_equivalent(&move |machine: &mut Machine| {
        machine.set_block(0x0040, &[0xFF, 0x20]); // pointer -> 0x20FF
        machine.set_block(0x2110, &[0x5A]);
        machine.set_block(0x20FF, &[0xA5]);
        machine.set_block(0x2101, &[0x3C]);
        machine.set_block(LOAD_ADDR, p.bytes());
        machine.set_pc(LOAD_ADDR);
    });
}

#[test]
fn stack_and_transfers() {
    let mut p = Program::new();
    p.lda(Mode::Immediate, 0xAA)
        .implied(Instruction::PHA)
        .lda(Mode::Immediate, 0x00)
        .implied(Instruction::PHP)
        .implied(Instruction::PLP)
        .implied(Instruction::PLA)
        .op(Instruction::TAX, Mode::Implied, 0)
        .op(Instruction::TSX, Mode::Implied, 0)
        .op(Instruction::TXA, Mode::Implied, 0)
        .op(Instruction::TAY, Mode::Implied, 0)
        .exit();
    assert_equivalent(&program_setup(p));
}

#[test]
fn shifts_and_memory_rmw() {
    let mut p = Program::new();
    p.lda(Mode::Immediate, 0x81)
        .op(Instruction::ASL, Mode::RegisterA, 0)
        .op(Instruction::ROR, Mode::RegisterA, 0)
        .sta(Mode::ZeroPage, 0x50)
        .op(Instruction::ASL, Mode::ZeroPage, 0x50)
        .op(Instruction::LSR, Mode::ZeroPage, 0x50)
        .op(Instruction::ROL, Mode::ZeroPage, 0x50)
        .op(Instruction::INC, Mode::ZeroPage, 0x50)
        .op(Instruction::DEC, Mode::ZeroPage, 0x51)
        .op(Instruction::BIT, Mode::ZeroPage, 0x50)
        .exit();
    assert_equivalent(&program_setup(p));
}

#[test]
fn jmp_indirect_with_page_wrap() {
    let mut p = Program::new();
    p.op(Instruction::JMP, Mode::Indirect, 0x20FF);
    let mut target = Program::new();
    target.lda(Mode::Immediate, 0x77).exit();
    assert_equivalent(&move |machine: &mut Machine| {
        // The vector low byte sits at 0x20FF; the high byte wraps to
        // 0x2000 rather than reading 0x2100.
        machine.set_block(0x20FF, &[0x50]);
        machine.set_block(0x2000, &[0x30]);
        machine.set_block(0x3050, target.bytes());
        machine.set_block(LOAD_ADDR, p.bytes());
        machine.set_pc(LOAD_ADDR);
    });
}

#[test]
fn self_modifying_store_runs_identically() {
    // Each pass increments the LDA's own operand low byte, so the three
    // passes read three different locations.
    let code = {
        let mut p = Program::new();
        p.lda(Mode::AbsoluteIndexedX, 0x0005)
            .sta(Mode::ZeroPage, 0x60)
            .op(Instruction::INC, Mode::Absolute, LOAD_ADDR + 1)
            .op(Instruction::INC, Mode::ZeroPage, 0x61)
            .lda(Mode::ZeroPage, 0x61)
            .op(Instruction::CMP, Mode::Immediate, 0x03)
            .branch(Instruction::BNE, -16)
            .exit();
        p
    };
    assert_equivalent(&move |machine: &mut Machine| {
        machine.set_block(0x0005, &[0xDE, 0xAD, 0x42]);
        machine.set_block(LOAD_ADDR, code.bytes());
        machine.set_pc(LOAD_ADDR);
    });
}

#[test]
fn store_into_a_later_opcode_of_the_same_block() {
    // The STX patches the operand of the LDA that has not executed yet;
    // the trap on the patched code must fire before the stale literal
    // runs.
    let mut p = Program::new();
    p.ldx(Mode::Immediate, 0x42)
        .stx(Mode::Absolute, LOAD_ADDR + 6)
        .lda(Mode::Immediate, 0x00)
        .sta(Mode::ZeroPage, 0x62)
        .exit();
    assert_equivalent(&program_setup(p));
}

#[test]
fn randomized_straight_line_programs() {
    let mut rng = StdRng::seed_from_u64(0x6502_1977);
    for _ in 0..24 {
        let program = random_program(&mut rng);
        assert_equivalent(&program_setup(program));
    }
}

fn random_program(rng: &mut StdRng) -> Program {
    let mut p = Program::new();
    // Start from a known arithmetic mode so decimal chaos stays
    // deterministic but bounded.
    p.op(Instruction::CLD, Mode::Implied, 0);
    let len = rng.gen_range(30..80);
    for _ in 0..len {
        match rng.gen_range(0..17) {
            0 => p.lda(Mode::Immediate, rng.gen_range(0..256)),
            1 => p.ldx(Mode::Immediate, rng.gen_range(0..256)),
            2 => p.ldy(Mode::Immediate, rng.gen_range(0..256)),
            3 => p.adc(Mode::Immediate, rng.gen_range(0..256)),
            4 => p.op(Instruction::SBC, Mode::Immediate, rng.gen_range(0..256)),
            5 => p.op(Instruction::AND, Mode::Immediate, rng.gen_range(0..256)),
            6 => p.op(Instruction::ORA, Mode::Immediate, rng.gen_range(0..256)),
            7 => p.op(Instruction::EOR, Mode::Immediate, rng.gen_range(0..256)),
            8 => p.op(Instruction::CMP, Mode::Immediate, rng.gen_range(0..256)),
            9 => p.sta(Mode::ZeroPage, rng.gen_range(0x40..0x80)),
            10 => p.op(
                [
                    Instruction::INX,
                    Instruction::INY,
                    Instruction::DEX,
                    Instruction::DEY,
                    Instruction::TAX,
                    Instruction::TAY,
                    Instruction::TXA,
                    Instruction::TYA,
                    Instruction::NOP,
                    Instruction::CLC,
                    Instruction::SEC,
                    Instruction::CLV,
                ][rng.gen_range(0..12)],
                Mode::Implied,
                0,
            ),
            11 => p.op(Instruction::ASL, Mode::RegisterA, 0),
            12 => p.op(Instruction::ROL, Mode::RegisterA, 0),
            13 => p.lda(Mode::ZeroPage, rng.gen_range(0x40..0x80)),
            14 => p.op(Instruction::INC, Mode::ZeroPage, rng.gen_range(0x40..0x80)),
            15 => p.sta(Mode::Absolute, rng.gen_range(0x2000..0x2100)),
            _ => p.adc(Mode::ZeroPage, rng.gen_range(0x40..0x80)),
        };
    }
    p.exit();
    p
}
