//! The interpreter backend.
//!
//! One instruction at a time, straight off the descriptor tables. This is
//! the functional specification of the machine: the block compiler is
//! only ever allowed to produce code that matches what happens here, and
//! the equivalence suite holds it to that.

use cpu_6502::alu::{self, page_crossed};
use cpu_6502::constants::{InterruptVectors, STACK_PAGE};
use cpu_6502::opcodes::{instruction_len, ExtraCycle, Instruction, Mode, OPCODES};
use cpu_6502::state::{State6502, StatusFlag};

use crate::driver::{CoreContext, GuestFault};

/// Everything a per-instruction callback gets to see.
#[derive(Debug, Clone, Copy)]
pub struct InterpEvent {
    pub pc: u16,
    pub opcode: u8,
    /// Effective address, for instructions that touch memory.
    pub addr: Option<u16>,
    /// True when this boundary serviced an interrupt.
    pub is_irq: bool,
    pub irq_pending: bool,
}

pub type InterpCallback<'a> = &'a mut dyn FnMut(&InterpEvent, &State6502) -> bool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpExit {
    CountdownExpired,
    CallbackStop,
    Exited,
    Fault(GuestFault),
}

/// What the operand resolved to.
enum Operand {
    None,
    Acc,
    Imm(u8),
    Mem { addr: u16, crossed: bool },
}

fn read16_zp(ctx: &CoreContext, zp: u8) -> u16 {
    let lo = ctx.mem.read_ind(zp as u16);
    let hi = ctx.mem.read_ind(zp.wrapping_add(1) as u16);
    u16::from_le_bytes([lo, hi])
}

fn resolve_operand(ctx: &mut CoreContext, mode: Mode, pc: u16) -> Operand {
    let state = &ctx.state;
    match mode {
        Mode::Implied | Mode::Relative => Operand::None,
        Mode::RegisterA => Operand::Acc,
        Mode::Immediate => Operand::Imm(ctx.mem.read_ind(pc.wrapping_add(1))),
        Mode::ZeroPage => Operand::Mem {
            addr: ctx.mem.read_ind(pc.wrapping_add(1)) as u16,
            crossed: false,
        },
        Mode::ZeroPageX => Operand::Mem {
            addr: ctx.mem.read_ind(pc.wrapping_add(1)).wrapping_add(state.x()) as u16,
            crossed: false,
        },
        Mode::ZeroPageY => Operand::Mem {
            addr: ctx.mem.read_ind(pc.wrapping_add(1)).wrapping_add(state.y()) as u16,
            crossed: false,
        },
        Mode::Absolute | Mode::Indirect => Operand::Mem {
            addr: ctx.mem.read16_ind(pc.wrapping_add(1)),
            crossed: false,
        },
        Mode::AbsoluteIndexedX => {
            let base = ctx.mem.read16_ind(pc.wrapping_add(1));
            let addr = base.wrapping_add(state.x() as u16);
            Operand::Mem {
                addr,
                crossed: page_crossed(base, addr),
            }
        }
        Mode::AbsoluteIndexedY => {
            let base = ctx.mem.read16_ind(pc.wrapping_add(1));
            let addr = base.wrapping_add(state.y() as u16);
            Operand::Mem {
                addr,
                crossed: page_crossed(base, addr),
            }
        }
        Mode::IndirectX => {
            let zp = ctx.mem.read_ind(pc.wrapping_add(1)).wrapping_add(state.x());
            Operand::Mem {
                addr: read16_zp(ctx, zp),
                crossed: false,
            }
        }
        Mode::IndirectY => {
            let zp = ctx.mem.read_ind(pc.wrapping_add(1));
            let base = read16_zp(ctx, zp);
            let addr = base.wrapping_add(state.y() as u16);
            Operand::Mem {
                addr,
                crossed: page_crossed(base, addr),
            }
        }
    }
}

fn load(
    ctx: &mut CoreContext,
    operand: &Operand,
    extra: ExtraCycle,
    extra_cycles: &mut i64,
) -> u8 {
    match operand {
        Operand::Imm(value) => *value,
        Operand::Acc => ctx.state.a(),
        Operand::Mem { addr, crossed } => {
            if *crossed && extra == ExtraCycle::PageBoundary {
                *extra_cycles += 1;
            }
            ctx.mem.read_full(*addr)
        }
        Operand::None => unreachable!("operand-less instruction tried to load"),
    }
}

fn store(ctx: &mut CoreContext, invalidate: &mut dyn FnMut(u16), addr: u16, value: u8) {
    if ctx.mem.write_full(addr, value) {
        invalidate(addr);
    }
}

fn push(ctx: &mut CoreContext, invalidate: &mut dyn FnMut(u16), value: u8) {
    let s = ctx.state.s();
    store(ctx, invalidate, STACK_PAGE + s as u16, value);
    ctx.state.set_s(s.wrapping_sub(1));
}

fn pull(ctx: &mut CoreContext) -> u8 {
    let s = ctx.state.s().wrapping_add(1);
    ctx.state.set_s(s);
    ctx.mem.read_full(STACK_PAGE + s as u16)
}

/// Enter the IRQ handler: used at interpreter boundaries and by the JIT
/// driver when a countdown trap reports a pending interrupt.
pub fn service_irq(ctx: &mut CoreContext, invalidate: &mut dyn FnMut(u16)) {
    let pc = ctx.state.pc();
    push(ctx, invalidate, (pc >> 8) as u8);
    push(ctx, invalidate, pc as u8);
    let flags =
        (ctx.state.flags() & !(StatusFlag::Break as u8)) | StatusFlag::Push as u8;
    push(ctx, invalidate, flags);
    ctx.state.set_flag(StatusFlag::InterruptDisable, true);
    let target = ctx.mem.read16_ind(InterruptVectors::IrqBrkVector as u16);
    ctx.state.set_pc(target);
    let countdown = ctx.countdown.load();
    ctx.countdown.store(countdown - 7);
}

/// Execute the instruction at PC. Returns `None` to continue, or the
/// exit the caller should report.
pub fn step_one(
    ctx: &mut CoreContext,
    mut callback: Option<InterpCallback>,
    invalidate: &mut dyn FnMut(u16),
) -> Option<InterpExit> {
    use Instruction::*;

    let irq_pending = ctx.irq_lines.pending();
    ctx.state.set_irq_fire(irq_pending);
    let mut is_irq = false;
    if irq_pending && !ctx.state.is_flag_set(StatusFlag::InterruptDisable) {
        service_irq(ctx, invalidate);
        is_irq = true;
    }

    let pc = ctx.state.pc();
    let opcode = ctx.mem.read_ind(pc);
    let desc = &OPCODES[opcode as usize];
    let operand = resolve_operand(ctx, desc.mode, pc);

    if let Some(cb) = callback.as_mut() {
        let event = InterpEvent {
            pc,
            opcode,
            addr: match operand {
                Operand::Mem { addr, .. } => Some(addr),
                _ => None,
            },
            is_irq,
            irq_pending,
        };
        if !cb(&event, &ctx.state) {
            return Some(InterpExit::CallbackStop);
        }
    }

    let mut next_pc = pc.wrapping_add(instruction_len(desc.mode) as u16);
    let mut extra_cycles: i64 = 0;

    match desc.instruction {
        // Loads, stores and transfers.
        LDA => {
            let value = load(ctx, &operand, desc.extra, &mut extra_cycles);
            ctx.state.set_a(value);
            ctx.state.update_nz(value);
        }
        LDX => {
            let value = load(ctx, &operand, desc.extra, &mut extra_cycles);
            ctx.state.set_x(value);
            ctx.state.update_nz(value);
        }
        LDY => {
            let value = load(ctx, &operand, desc.extra, &mut extra_cycles);
            ctx.state.set_y(value);
            ctx.state.update_nz(value);
        }
        STA | STX | STY => {
            let Operand::Mem { addr, .. } = operand else {
                unreachable!("store without an address");
            };
            let value = match desc.instruction {
                STA => ctx.state.a(),
                STX => ctx.state.x(),
                _ => ctx.state.y(),
            };
            store(ctx, invalidate, addr, value);
        }
        TAX => {
            let value = ctx.state.a();
            ctx.state.set_x(value);
            ctx.state.update_nz(value);
        }
        TAY => {
            let value = ctx.state.a();
            ctx.state.set_y(value);
            ctx.state.update_nz(value);
        }
        TXA => {
            let value = ctx.state.x();
            ctx.state.set_a(value);
            ctx.state.update_nz(value);
        }
        TYA => {
            let value = ctx.state.y();
            ctx.state.set_a(value);
            ctx.state.update_nz(value);
        }
        TSX => {
            let value = ctx.state.s();
            ctx.state.set_x(value);
            ctx.state.update_nz(value);
        }
        TXS => {
            let value = ctx.state.x();
            ctx.state.set_s(value);
        }

        // Stack.
        PHA => {
            let value = ctx.state.a();
            push(ctx, invalidate, value);
        }
        PHP => {
            let value = ctx.state.flags()
                | StatusFlag::Break as u8
                | StatusFlag::Push as u8;
            push(ctx, invalidate, value);
        }
        PLA => {
            let value = pull(ctx);
            ctx.state.set_a(value);
            ctx.state.update_nz(value);
        }
        PLP => {
            let value = pull(ctx);
            ctx.state
                .set_flags((value & !(StatusFlag::Break as u8)) | StatusFlag::Push as u8);
        }

        // Arithmetic and logic.
        ADC => {
            let value = load(ctx, &operand, desc.extra, &mut extra_cycles);
            let r = alu::adc(
                ctx.state.a(),
                value,
                ctx.state.is_flag_set(StatusFlag::Carry),
                ctx.state.is_flag_set(StatusFlag::Decimal),
            );
            ctx.state.set_a(r.value);
            ctx.state.set_flag(StatusFlag::Negative, r.n);
            ctx.state.set_flag(StatusFlag::Zero, r.z);
            ctx.state.set_flag(StatusFlag::Carry, r.c);
            ctx.state.set_flag(StatusFlag::Overflow, r.v);
        }
        SBC => {
            let value = load(ctx, &operand, desc.extra, &mut extra_cycles);
            let r = alu::sbc(
                ctx.state.a(),
                value,
                ctx.state.is_flag_set(StatusFlag::Carry),
                ctx.state.is_flag_set(StatusFlag::Decimal),
            );
            ctx.state.set_a(r.value);
            ctx.state.set_flag(StatusFlag::Negative, r.n);
            ctx.state.set_flag(StatusFlag::Zero, r.z);
            ctx.state.set_flag(StatusFlag::Carry, r.c);
            ctx.state.set_flag(StatusFlag::Overflow, r.v);
        }
        AND => {
            let value = load(ctx, &operand, desc.extra, &mut extra_cycles);
            let a = ctx.state.a() & value;
            ctx.state.set_a(a);
            ctx.state.update_nz(a);
        }
        ORA => {
            let value = load(ctx, &operand, desc.extra, &mut extra_cycles);
            let a = ctx.state.a() | value;
            ctx.state.set_a(a);
            ctx.state.update_nz(a);
        }
        EOR => {
            let value = load(ctx, &operand, desc.extra, &mut extra_cycles);
            let a = ctx.state.a() ^ value;
            ctx.state.set_a(a);
            ctx.state.update_nz(a);
        }
        CMP | CPX | CPY => {
            let value = load(ctx, &operand, desc.extra, &mut extra_cycles);
            let reg = match desc.instruction {
                CMP => ctx.state.a(),
                CPX => ctx.state.x(),
                _ => ctx.state.y(),
            };
            ctx.state.update_nz(reg.wrapping_sub(value));
            ctx.state.set_flag(StatusFlag::Carry, reg >= value);
        }
        BIT => {
            let value = load(ctx, &operand, desc.extra, &mut extra_cycles);
            ctx.state
                .set_flag(StatusFlag::Zero, ctx.state.a() & value == 0);
            ctx.state.set_flag(StatusFlag::Negative, value & 0x80 != 0);
            ctx.state.set_flag(StatusFlag::Overflow, value & 0x40 != 0);
        }

        // Increments, decrements.
        INC | DEC => {
            let Operand::Mem { addr, .. } = operand else {
                unreachable!("rmw without an address");
            };
            let value = ctx.mem.read_full(addr);
            let result = if desc.instruction == INC {
                value.wrapping_add(1)
            } else {
                value.wrapping_sub(1)
            };
            ctx.state.update_nz(result);
            store(ctx, invalidate, addr, result);
        }
        INX => {
            let value = ctx.state.x().wrapping_add(1);
            ctx.state.set_x(value);
            ctx.state.update_nz(value);
        }
        INY => {
            let value = ctx.state.y().wrapping_add(1);
            ctx.state.set_y(value);
            ctx.state.update_nz(value);
        }
        DEX => {
            let value = ctx.state.x().wrapping_sub(1);
            ctx.state.set_x(value);
            ctx.state.update_nz(value);
        }
        DEY => {
            let value = ctx.state.y().wrapping_sub(1);
            ctx.state.set_y(value);
            ctx.state.update_nz(value);
        }

        // Shifts and rotates.
        ASL | LSR | ROL | ROR => {
            let carry_in = ctx.state.is_flag_set(StatusFlag::Carry);
            let input = match &operand {
                Operand::Acc => ctx.state.a(),
                Operand::Mem { addr, .. } => ctx.mem.read_full(*addr),
                _ => unreachable!("shift without a target"),
            };
            let (result, carry) = match desc.instruction {
                ASL => alu::asl(input),
                LSR => alu::lsr(input),
                ROL => alu::rol(input, carry_in),
                _ => alu::ror(input, carry_in),
            };
            ctx.state.update_nz(result);
            ctx.state.set_flag(StatusFlag::Carry, carry);
            match operand {
                Operand::Acc => ctx.state.set_a(result),
                Operand::Mem { addr, .. } => store(ctx, invalidate, addr, result),
                _ => unreachable!(),
            }
        }

        // Flag twiddles.
        CLC => ctx.state.set_flag(StatusFlag::Carry, false),
        SEC => ctx.state.set_flag(StatusFlag::Carry, true),
        CLI => ctx.state.set_flag(StatusFlag::InterruptDisable, false),
        SEI => ctx.state.set_flag(StatusFlag::InterruptDisable, true),
        CLD => ctx.state.set_flag(StatusFlag::Decimal, false),
        SED => ctx.state.set_flag(StatusFlag::Decimal, true),
        CLV => ctx.state.set_flag(StatusFlag::Overflow, false),
        NOP => {}

        // Control flow.
        JMP => {
            let Operand::Mem { addr, .. } = operand else {
                unreachable!("jmp without a target");
            };
            next_pc = if desc.mode == Mode::Indirect {
                // The 6502 never carries into the high byte when the
                // vector straddles a page.
                let lo = ctx.mem.read_ind(addr);
                let hi = ctx
                    .mem
                    .read_ind((addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF));
                u16::from_le_bytes([lo, hi])
            } else {
                addr
            };
        }
        JSR => {
            let Operand::Mem { addr, .. } = operand else {
                unreachable!("jsr without a target");
            };
            let ret = pc.wrapping_add(2);
            push(ctx, invalidate, (ret >> 8) as u8);
            push(ctx, invalidate, ret as u8);
            next_pc = addr;
        }
        RTS => {
            let lo = pull(ctx);
            let hi = pull(ctx);
            next_pc = u16::from_le_bytes([lo, hi]).wrapping_add(1);
        }
        RTI => {
            let flags = pull(ctx);
            ctx.state
                .set_flags((flags & !(StatusFlag::Break as u8)) | StatusFlag::Push as u8);
            let lo = pull(ctx);
            let hi = pull(ctx);
            next_pc = u16::from_le_bytes([lo, hi]);
        }
        BRK => {
            let ret = pc.wrapping_add(2);
            push(ctx, invalidate, (ret >> 8) as u8);
            push(ctx, invalidate, ret as u8);
            let flags = ctx.state.flags()
                | StatusFlag::Break as u8
                | StatusFlag::Push as u8;
            push(ctx, invalidate, flags);
            ctx.state.set_flag(StatusFlag::InterruptDisable, true);
            next_pc = ctx.mem.read16_ind(InterruptVectors::IrqBrkVector as u16);
        }
        BPL | BMI | BVC | BVS | BCC | BCS | BNE | BEQ => {
            let taken = match desc.instruction {
                BPL => !ctx.state.is_flag_set(StatusFlag::Negative),
                BMI => ctx.state.is_flag_set(StatusFlag::Negative),
                BVC => !ctx.state.is_flag_set(StatusFlag::Overflow),
                BVS => ctx.state.is_flag_set(StatusFlag::Overflow),
                BCC => !ctx.state.is_flag_set(StatusFlag::Carry),
                BCS => ctx.state.is_flag_set(StatusFlag::Carry),
                BNE => !ctx.state.is_flag_set(StatusFlag::Zero),
                _ => ctx.state.is_flag_set(StatusFlag::Zero),
            };
            if taken {
                let displacement = ctx.mem.read_ind(pc.wrapping_add(1)) as i8;
                let target = next_pc.wrapping_add(displacement as u16);
                extra_cycles += 1;
                if page_crossed(next_pc, target) {
                    extra_cycles += 1;
                }
                next_pc = target;
            }
        }

        // Pseudo-opcodes and jams.
        EXIT => return Some(InterpExit::Exited),
        CRASH => return Some(InterpExit::Fault(GuestFault::Crash { pc })),
        KIL => return Some(InterpExit::Fault(GuestFault::Illegal { pc, opcode })),
    }

    ctx.state.set_pc(next_pc);
    let countdown = ctx.countdown.load();
    ctx.countdown
        .store(countdown - desc.cycles as i64 - extra_cycles);
    None
}

/// Run instructions until the countdown runs out, the callback stops the
/// run, the EXIT pseudo-opcode is reached, or a fault occurs.
fn reborrow_callback<'a>(callback: &'a mut Option<InterpCallback<'_>>) -> Option<InterpCallback<'a>> {
    match callback {
        Some(cb) => Some(&mut **cb),
        None => None,
    }
}

pub fn enter(
    ctx: &mut CoreContext,
    mut callback: Option<InterpCallback>,
    invalidate: &mut dyn FnMut(u16),
) -> InterpExit {
    loop {
        if ctx.countdown.load() <= 0 {
            return InterpExit::CountdownExpired;
        }
        if let Some(exit) = step_one(ctx, reborrow_callback(&mut callback), invalidate) {
            return exit;
        }
    }
}
