//! The host instruction set and its executor.
//!
//! Compiled blocks are sequences of fixed-width eight-byte host
//! instructions living in the arena: `[op, n, addr.lo, addr.hi, ext x4]`.
//! The executor runs them against the state record, the memory views and
//! the countdown cell, and is the only code that ever runs out of the
//! arena. Control only ever transfers to slot-aligned block entries, so
//! the two-byte invalidation trap at a block head is always seen before
//! any stale code behind it.

use cpu_6502::alu::{self, page_crossed};
use cpu_6502::constants::{InterruptVectors, STACK_PAGE};
use cpu_6502::state::{State6502, StatusFlag};

use crate::driver::CoreContext;
use crate::jit::arena::{block_entry, BYTES_PER_GUEST_BYTE, TRAP_SEQUENCE};
use crate::jit::Jit;
use crate::memory::MemoryMap;

pub const HOST_INSN_LEN: usize = 8;

/// Host opcode bytes. 0xF4 is reserved as the first trap byte and is
/// never emitted.
pub mod op {
    pub const COUNTDOWN: u8 = 0x01;
    pub const EXIT: u8 = 0x02;
    pub const CRASH: u8 = 0x03;
    pub const ILLEGAL: u8 = 0x04;
    pub const DEBUG: u8 = 0x05;
    pub const JMP_HOST: u8 = 0x06;
    pub const BRANCH: u8 = 0x07;
    pub const BRANCH_DYN: u8 = 0x08;
    pub const JMP_IND: u8 = 0x09;
    pub const JMP_DYN: u8 = 0x0A;
    pub const JSR: u8 = 0x0B;
    pub const JSR_DYN: u8 = 0x0C;
    pub const RTS: u8 = 0x0D;
    pub const RTI: u8 = 0x0E;
    pub const BRK: u8 = 0x0F;

    pub const LDA: u8 = 0x10;
    pub const LDX: u8 = 0x11;
    pub const LDY: u8 = 0x12;
    pub const STA: u8 = 0x13;
    pub const STX: u8 = 0x14;
    pub const STY: u8 = 0x15;
    pub const ADC: u8 = 0x16;
    pub const SBC: u8 = 0x17;
    pub const AND: u8 = 0x18;
    pub const ORA: u8 = 0x19;
    pub const EOR: u8 = 0x1A;
    pub const CMP: u8 = 0x1B;
    pub const CPX: u8 = 0x1C;
    pub const CPY: u8 = 0x1D;
    pub const INC: u8 = 0x1E;
    pub const DEC: u8 = 0x1F;
    pub const ASL: u8 = 0x20;
    pub const LSR: u8 = 0x21;
    pub const ROL: u8 = 0x22;
    pub const ROR: u8 = 0x23;
    pub const BIT: u8 = 0x24;
    pub const TAX: u8 = 0x25;
    pub const TAY: u8 = 0x26;
    pub const TXA: u8 = 0x27;
    pub const TYA: u8 = 0x28;
    pub const TSX: u8 = 0x29;
    pub const TXS: u8 = 0x2A;
    pub const PHA: u8 = 0x2B;
    pub const PHP: u8 = 0x2C;
    pub const PLA: u8 = 0x2D;
    pub const PLP: u8 = 0x2E;
    pub const CLC: u8 = 0x2F;
    pub const SEC: u8 = 0x30;
    pub const CLI: u8 = 0x31;
    pub const SEI: u8 = 0x32;
    pub const CLD: u8 = 0x33;
    pub const SED: u8 = 0x34;
    pub const CLV: u8 = 0x35;
    pub const NOP: u8 = 0x36;

    pub const FLAG_A: u8 = 0x40;
    pub const FLAG_X: u8 = 0x41;
    pub const FLAG_Y: u8 = 0x42;
    pub const ADD_IMM: u8 = 0x43;
    pub const SAVE_CARRY: u8 = 0x44;
    pub const SAVE_OVERFLOW: u8 = 0x45;
    pub const STOA_IMM: u8 = 0x46;

    pub const TRAP: u8 = 0xF4;
}

/// Addressing forms carried in the `n` field of memory-touching host
/// instructions. The high bit marks a dynamic operand: `addr` then holds
/// the guest location the operand is fetched from at run time.
pub mod form {
    pub const IMM: u8 = 0;
    pub const ZPG: u8 = 1;
    pub const ZPX: u8 = 2;
    pub const ZPY: u8 = 3;
    pub const ABS: u8 = 4;
    pub const ABX: u8 = 5;
    pub const ABY: u8 = 6;
    pub const IZX: u8 = 7;
    pub const IZY: u8 = 8;
    pub const ACC: u8 = 9;

    pub const DYNAMIC: u8 = 0x80;
}

/// Branch condition codes carried in the `n` field of branch host
/// instructions.
pub mod cond {
    pub const PL: u8 = 0;
    pub const MI: u8 = 1;
    pub const VC: u8 = 2;
    pub const VS: u8 = 3;
    pub const CC: u8 = 4;
    pub const CS: u8 = 5;
    pub const NE: u8 = 6;
    pub const EQ: u8 = 7;
}

#[derive(Debug, Clone, Copy)]
pub struct HostInsn {
    pub op: u8,
    pub n: u8,
    pub addr: u16,
    pub ext: u32,
}

impl HostInsn {
    pub fn encode(&self) -> [u8; HOST_INSN_LEN] {
        let addr = self.addr.to_le_bytes();
        let ext = self.ext.to_le_bytes();
        [
            self.op, self.n, addr[0], addr[1], ext[0], ext[1], ext[2], ext[3],
        ]
    }

    pub fn decode(bytes: &[u8; HOST_INSN_LEN]) -> HostInsn {
        HostInsn {
            op: bytes[0],
            n: bytes[1],
            addr: u16::from_le_bytes([bytes[2], bytes[3]]),
            ext: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Why execution left the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Countdown { host_ip: u32 },
    Irq { host_ip: u32 },
    Exited { host_ip: u32 },
    Crash { host_ip: u32 },
    Illegal { host_ip: u32 },
    Debug { pc: u16 },
    InvalidationTrap { host_ip: u32 },
    BlockNotCompiled { guest: u16 },
}

enum Resolved {
    Value(u8),
    Acc,
    Mem { addr: u16, crossed: bool },
}

fn read16_zp(mem: &MemoryMap, zp: u8) -> u16 {
    let lo = mem.read_ind(zp as u16);
    let hi = mem.read_ind(zp.wrapping_add(1) as u16);
    u16::from_le_bytes([lo, hi])
}

fn charge(ctx: &CoreContext, cycles: i64) {
    let countdown = ctx.countdown.load();
    ctx.countdown.store(countdown - cycles);
}

fn condition_met(state: &State6502, code: u8) -> bool {
    match code {
        cond::PL => !state.is_flag_set(StatusFlag::Negative),
        cond::MI => state.is_flag_set(StatusFlag::Negative),
        cond::VC => !state.is_flag_set(StatusFlag::Overflow),
        cond::VS => state.is_flag_set(StatusFlag::Overflow),
        cond::CC => !state.is_flag_set(StatusFlag::Carry),
        cond::CS => state.is_flag_set(StatusFlag::Carry),
        cond::NE => !state.is_flag_set(StatusFlag::Zero),
        _ => state.is_flag_set(StatusFlag::Zero),
    }
}

/// The operand value of a dynamic form, fetched from the guest image.
fn dynamic_operand(mem: &MemoryMap, base_form: u8, location: u16) -> u16 {
    match base_form {
        form::ABS | form::ABX | form::ABY => mem.read16_ind(location),
        _ => mem.read_ind(location) as u16,
    }
}

fn resolve(ctx: &CoreContext, n: u8, operand: u16) -> Resolved {
    let base = n & !form::DYNAMIC;
    let operand = if n & form::DYNAMIC != 0 {
        dynamic_operand(&ctx.mem, base, operand)
    } else {
        operand
    };
    let state = &ctx.state;
    match base {
        form::IMM => Resolved::Value(operand as u8),
        form::ACC => Resolved::Acc,
        form::ZPG => Resolved::Mem {
            addr: operand & 0x00FF,
            crossed: false,
        },
        form::ZPX => Resolved::Mem {
            addr: (operand as u8).wrapping_add(state.x()) as u16,
            crossed: false,
        },
        form::ZPY => Resolved::Mem {
            addr: (operand as u8).wrapping_add(state.y()) as u16,
            crossed: false,
        },
        form::ABS => Resolved::Mem {
            addr: operand,
            crossed: false,
        },
        form::ABX => {
            let addr = operand.wrapping_add(state.x() as u16);
            Resolved::Mem {
                addr,
                crossed: page_crossed(operand, addr),
            }
        }
        form::ABY => {
            let addr = operand.wrapping_add(state.y() as u16);
            Resolved::Mem {
                addr,
                crossed: page_crossed(operand, addr),
            }
        }
        form::IZX => {
            let zp = (operand as u8).wrapping_add(state.x());
            Resolved::Mem {
                addr: read16_zp(&ctx.mem, zp),
                crossed: false,
            }
        }
        _ => {
            let base16 = read16_zp(&ctx.mem, operand as u8);
            let addr = base16.wrapping_add(state.y() as u16);
            Resolved::Mem {
                addr,
                crossed: page_crossed(base16, addr),
            }
        }
    }
}

impl Jit {
    /// Load an operand value; `penalty` charges the page-cross cycle the
    /// same way the interpreter's descriptor tables do.
    fn load_value(&self, ctx: &mut CoreContext, resolved: &Resolved, penalty: bool) -> u8 {
        match resolved {
            Resolved::Value(value) => *value,
            Resolved::Acc => ctx.state.a(),
            Resolved::Mem { addr, crossed } => {
                if *crossed && penalty {
                    charge(ctx, 1);
                }
                ctx.mem.read_full(*addr)
            }
        }
    }

    /// All compiled stores funnel through here; a write that lands on
    /// bytes covered by compiled code invalidates that code.
    fn store(&mut self, ctx: &mut CoreContext, addr: u16, value: u8) {
        if ctx.mem.write_full(addr, value) {
            self.invalidate_code_at(addr);
        }
    }

    fn push(&mut self, ctx: &mut CoreContext, value: u8) {
        let s = ctx.state.s();
        self.store(ctx, STACK_PAGE + s as u16, value);
        ctx.state.set_s(s.wrapping_sub(1));
    }

    fn pull(&mut self, ctx: &mut CoreContext) -> u8 {
        let s = ctx.state.s().wrapping_add(1);
        ctx.state.set_s(s);
        ctx.mem.read_full(STACK_PAGE + s as u16)
    }

    /// Check a control transfer target. Targets are always block
    /// entries; entering one without a live block is reported so the
    /// driver can compile there.
    fn transfer(&self, target_host: u32) -> Result<u32, ExitReason> {
        if target_host % BYTES_PER_GUEST_BYTE as u32 == 0 {
            let guest = (target_host / BYTES_PER_GUEST_BYTE as u32) as u16;
            if !self.blocks.contains_key(&guest) {
                return Err(ExitReason::BlockNotCompiled { guest });
            }
        }
        Ok(target_host)
    }

    fn transfer_guest(&self, target: u16) -> Result<u32, ExitReason> {
        self.transfer(block_entry(target))
    }

    /// Run host code starting at an arena offset until something hands
    /// control back to the driver.
    pub(crate) fn execute(&mut self, ctx: &mut CoreContext, start: u32) -> ExitReason {
        let mut ip = start;
        loop {
            let Some(bytes) = self.arena.insn_bytes(ip) else {
                return ExitReason::Crash { host_ip: ip };
            };
            if bytes[0] == TRAP_SEQUENCE[0] && bytes[1] == TRAP_SEQUENCE[1] {
                return ExitReason::InvalidationTrap { host_ip: ip };
            }
            let insn = HostInsn::decode(&bytes);
            let mut next_ip = ip + HOST_INSN_LEN as u32;

            match insn.op {
                op::COUNTDOWN => {
                    let pending = ctx.irq_lines.pending();
                    ctx.state.set_irq_fire(pending);
                    let countdown = ctx.countdown.load() - insn.addr as i64;
                    ctx.countdown.store(countdown);
                    if countdown < 0 {
                        return ExitReason::Countdown { host_ip: ip };
                    }
                    if pending && !ctx.state.is_flag_set(StatusFlag::InterruptDisable) {
                        return ExitReason::Irq { host_ip: ip };
                    }
                }
                op::EXIT => return ExitReason::Exited { host_ip: ip },
                op::CRASH => return ExitReason::Crash { host_ip: ip },
                op::ILLEGAL => return ExitReason::Illegal { host_ip: ip },
                op::DEBUG => {
                    let pc = insn.addr;
                    log::trace!("debug hook at {pc:04X}");
                    if self.debug_stop == Some(pc) {
                        let stop = match &self.debug_condition {
                            None => true,
                            Some(cond) => cond.evaluate_for_state(&ctx.state) != 0,
                        };
                        if stop {
                            return ExitReason::Debug { pc };
                        }
                    }
                }

                // Control transfers. Every target is a block entry.
                op::JMP_HOST => match self.transfer(insn.ext) {
                    Ok(target) => next_ip = target,
                    Err(exit) => return exit,
                },
                op::JMP_DYN => {
                    let target = ctx.mem.read16_ind(insn.addr);
                    match self.transfer_guest(target) {
                        Ok(host) => next_ip = host,
                        Err(exit) => return exit,
                    }
                }
                op::JMP_IND => {
                    let vector = if insn.n & form::DYNAMIC != 0 {
                        ctx.mem.read16_ind(insn.addr)
                    } else {
                        insn.addr
                    };
                    // The 6502 never carries into the high byte when the
                    // vector straddles a page.
                    let lo = ctx.mem.read_ind(vector);
                    let hi = ctx
                        .mem
                        .read_ind((vector & 0xFF00) | (vector.wrapping_add(1) & 0x00FF));
                    let target = u16::from_le_bytes([lo, hi]);
                    match self.transfer_guest(target) {
                        Ok(host) => next_ip = host,
                        Err(exit) => return exit,
                    }
                }
                op::BRANCH => {
                    if condition_met(&ctx.state, insn.n) {
                        charge(ctx, insn.addr as i64);
                        match self.transfer(insn.ext) {
                            Ok(target) => next_ip = target,
                            Err(exit) => return exit,
                        }
                    }
                }
                op::BRANCH_DYN => {
                    if condition_met(&ctx.state, insn.n) {
                        let fallthrough = insn.ext as u16;
                        let displacement = ctx.mem.read_ind(insn.addr) as i8;
                        let target = fallthrough.wrapping_add(displacement as u16);
                        let extra = 1 + page_crossed(fallthrough, target) as i64;
                        charge(ctx, extra);
                        match self.transfer_guest(target) {
                            Ok(host) => next_ip = host,
                            Err(exit) => return exit,
                        }
                    }
                }
                op::JSR | op::JSR_DYN => {
                    // Push before resolving the target: on an uncompiled
                    // target the driver re-enters at the target block,
                    // not at this instruction.
                    let (ret, target_host) = if insn.op == op::JSR {
                        (insn.addr, insn.ext)
                    } else {
                        let target = ctx.mem.read16_ind(insn.addr);
                        (insn.ext as u16, block_entry(target))
                    };
                    self.push(ctx, (ret >> 8) as u8);
                    self.push(ctx, ret as u8);
                    match self.transfer(target_host) {
                        Ok(host) => next_ip = host,
                        Err(exit) => return exit,
                    }
                }
                op::RTS => {
                    let lo = self.pull(ctx);
                    let hi = self.pull(ctx);
                    let target = u16::from_le_bytes([lo, hi]).wrapping_add(1);
                    match self.transfer_guest(target) {
                        Ok(host) => next_ip = host,
                        Err(exit) => return exit,
                    }
                }
                op::RTI => {
                    let flags = self.pull(ctx);
                    ctx.state.set_flags(
                        (flags & !(StatusFlag::Break as u8)) | StatusFlag::Push as u8,
                    );
                    let lo = self.pull(ctx);
                    let hi = self.pull(ctx);
                    let target = u16::from_le_bytes([lo, hi]);
                    match self.transfer_guest(target) {
                        Ok(host) => next_ip = host,
                        Err(exit) => return exit,
                    }
                }
                op::BRK => {
                    let ret = insn.addr;
                    self.push(ctx, (ret >> 8) as u8);
                    self.push(ctx, ret as u8);
                    let flags = ctx.state.flags()
                        | StatusFlag::Break as u8
                        | StatusFlag::Push as u8;
                    self.push(ctx, flags);
                    ctx.state.set_flag(StatusFlag::InterruptDisable, true);
                    let target = ctx
                        .mem
                        .read16_ind(InterruptVectors::IrqBrkVector as u16);
                    match self.transfer_guest(target) {
                        Ok(host) => next_ip = host,
                        Err(exit) => return exit,
                    }
                }

                // Loads and stores. Loads leave N/Z to a FLAG_* micro-op.
                op::LDA => {
                    let resolved = resolve(ctx, insn.n, insn.addr);
                    let value = self.load_value(ctx, &resolved, true);
                    ctx.state.set_a(value);
                }
                op::LDX => {
                    let resolved = resolve(ctx, insn.n, insn.addr);
                    let value = self.load_value(ctx, &resolved, true);
                    ctx.state.set_x(value);
                }
                op::LDY => {
                    let resolved = resolve(ctx, insn.n, insn.addr);
                    let value = self.load_value(ctx, &resolved, true);
                    ctx.state.set_y(value);
                }
                op::STA | op::STX | op::STY => {
                    let resolved = resolve(ctx, insn.n, insn.addr);
                    let Resolved::Mem { addr, .. } = resolved else {
                        return ExitReason::Crash { host_ip: ip };
                    };
                    let value = match insn.op {
                        op::STA => ctx.state.a(),
                        op::STX => ctx.state.x(),
                        _ => ctx.state.y(),
                    };
                    self.store(ctx, addr, value);
                }

                // Arithmetic. Overflow is left in the host scratch flags
                // for a SAVE_OVERFLOW micro-op.
                op::ADC | op::SBC => {
                    let resolved = resolve(ctx, insn.n, insn.addr);
                    let value = self.load_value(ctx, &resolved, true);
                    let r = if insn.op == op::ADC {
                        alu::adc(
                            ctx.state.a(),
                            value,
                            ctx.state.is_flag_set(StatusFlag::Carry),
                            ctx.state.is_flag_set(StatusFlag::Decimal),
                        )
                    } else {
                        alu::sbc(
                            ctx.state.a(),
                            value,
                            ctx.state.is_flag_set(StatusFlag::Carry),
                            ctx.state.is_flag_set(StatusFlag::Decimal),
                        )
                    };
                    ctx.state.set_a(r.value);
                    ctx.state.set_flag(StatusFlag::Negative, r.n);
                    ctx.state.set_flag(StatusFlag::Zero, r.z);
                    ctx.state.set_flag(StatusFlag::Carry, r.c);
                    ctx.state.set_host_overflow(r.v);
                }
                op::ADD_IMM => {
                    let r = alu::adc(ctx.state.a(), insn.n, false, false);
                    ctx.state.set_a(r.value);
                    ctx.state.set_flag(StatusFlag::Negative, r.n);
                    ctx.state.set_flag(StatusFlag::Zero, r.z);
                    ctx.state.set_flag(StatusFlag::Carry, r.c);
                    ctx.state.set_host_overflow(r.v);
                }

                op::AND | op::ORA | op::EOR => {
                    let resolved = resolve(ctx, insn.n, insn.addr);
                    let value = self.load_value(ctx, &resolved, true);
                    let a = match insn.op {
                        op::AND => ctx.state.a() & value,
                        op::ORA => ctx.state.a() | value,
                        _ => ctx.state.a() ^ value,
                    };
                    ctx.state.set_a(a);
                    ctx.state.update_nz(a);
                }

                // Compares leave carry in the host scratch flags for a
                // SAVE_CARRY micro-op.
                op::CMP | op::CPX | op::CPY => {
                    let resolved = resolve(ctx, insn.n, insn.addr);
                    let value = self.load_value(ctx, &resolved, true);
                    let reg = match insn.op {
                        op::CMP => ctx.state.a(),
                        op::CPX => ctx.state.x(),
                        _ => ctx.state.y(),
                    };
                    ctx.state.update_nz(reg.wrapping_sub(value));
                    ctx.state.set_host_carry(reg >= value);
                }

                op::BIT => {
                    let resolved = resolve(ctx, insn.n, insn.addr);
                    let value = self.load_value(ctx, &resolved, false);
                    ctx.state
                        .set_flag(StatusFlag::Zero, ctx.state.a() & value == 0);
                    ctx.state.set_flag(StatusFlag::Negative, value & 0x80 != 0);
                    ctx.state.set_flag(StatusFlag::Overflow, value & 0x40 != 0);
                }

                op::INC | op::DEC => {
                    let resolved = resolve(ctx, insn.n, insn.addr);
                    let Resolved::Mem { addr, .. } = resolved else {
                        return ExitReason::Crash { host_ip: ip };
                    };
                    let value = ctx.mem.read_full(addr);
                    let result = if insn.op == op::INC {
                        value.wrapping_add(1)
                    } else {
                        value.wrapping_sub(1)
                    };
                    ctx.state.update_nz(result);
                    self.store(ctx, addr, result);
                }

                op::ASL | op::LSR | op::ROL | op::ROR => {
                    let carry_in = ctx.state.is_flag_set(StatusFlag::Carry);
                    let resolved = resolve(ctx, insn.n, insn.addr);
                    let input = match &resolved {
                        Resolved::Acc => ctx.state.a(),
                        Resolved::Mem { addr, .. } => ctx.mem.read_full(*addr),
                        Resolved::Value(_) => return ExitReason::Crash { host_ip: ip },
                    };
                    let (result, carry) = match insn.op {
                        op::ASL => alu::asl(input),
                        op::LSR => alu::lsr(input),
                        op::ROL => alu::rol(input, carry_in),
                        _ => alu::ror(input, carry_in),
                    };
                    ctx.state.update_nz(result);
                    ctx.state.set_flag(StatusFlag::Carry, carry);
                    match resolved {
                        Resolved::Acc => ctx.state.set_a(result),
                        Resolved::Mem { addr, .. } => self.store(ctx, addr, result),
                        Resolved::Value(_) => unreachable!(),
                    }
                }

                // Transfers; N/Z comes from the trailing FLAG_* where the
                // 6502 sets it (TXS does not).
                op::TAX => {
                    let a = ctx.state.a();
                    ctx.state.set_x(a);
                }
                op::TAY => {
                    let a = ctx.state.a();
                    ctx.state.set_y(a);
                }
                op::TXA => {
                    let x = ctx.state.x();
                    ctx.state.set_a(x);
                }
                op::TYA => {
                    let y = ctx.state.y();
                    ctx.state.set_a(y);
                }
                op::TSX => {
                    let s = ctx.state.s();
                    ctx.state.set_x(s);
                }
                op::TXS => {
                    let x = ctx.state.x();
                    ctx.state.set_s(x);
                }

                op::PHA => {
                    let a = ctx.state.a();
                    self.push(ctx, a);
                }
                op::PHP => {
                    let flags = ctx.state.flags()
                        | StatusFlag::Break as u8
                        | StatusFlag::Push as u8;
                    self.push(ctx, flags);
                }
                op::PLA => {
                    let value = self.pull(ctx);
                    ctx.state.set_a(value);
                }
                op::PLP => {
                    let value = self.pull(ctx);
                    ctx.state.set_flags(
                        (value & !(StatusFlag::Break as u8)) | StatusFlag::Push as u8,
                    );
                }

                op::CLC => ctx.state.set_flag(StatusFlag::Carry, false),
                op::SEC => ctx.state.set_flag(StatusFlag::Carry, true),
                op::CLI => ctx.state.set_flag(StatusFlag::InterruptDisable, false),
                op::SEI => ctx.state.set_flag(StatusFlag::InterruptDisable, true),
                op::CLD => ctx.state.set_flag(StatusFlag::Decimal, false),
                op::SED => ctx.state.set_flag(StatusFlag::Decimal, true),
                op::CLV => ctx.state.set_flag(StatusFlag::Overflow, false),
                op::NOP => {}

                op::FLAG_A => {
                    let a = ctx.state.a();
                    ctx.state.update_nz(a);
                }
                op::FLAG_X => {
                    let x = ctx.state.x();
                    ctx.state.update_nz(x);
                }
                op::FLAG_Y => {
                    let y = ctx.state.y();
                    ctx.state.update_nz(y);
                }
                op::SAVE_CARRY => ctx.state.save_host_carry(),
                op::SAVE_OVERFLOW => ctx.state.save_host_overflow(),
                op::STOA_IMM => {
                    self.store(ctx, insn.addr, insn.n);
                }

                _ => return ExitReason::Crash { host_ip: ip },
            }

            ip = next_ip;
        }
    }
}

fn form_text(n: u8, operand: u16) -> String {
    let marker = if n & form::DYNAMIC != 0 { "@" } else { "" };
    match n & !form::DYNAMIC {
        form::IMM => format!(" {marker}#${:02X}", operand as u8),
        form::ZPG => format!(" {marker}${:02X}", operand as u8),
        form::ZPX => format!(" {marker}${:02X},X", operand as u8),
        form::ZPY => format!(" {marker}${:02X},Y", operand as u8),
        form::ABS => format!(" {marker}${operand:04X}"),
        form::ABX => format!(" {marker}${operand:04X},X"),
        form::ABY => format!(" {marker}${operand:04X},Y"),
        form::IZX => format!(" {marker}(${:02X},X)", operand as u8),
        form::IZY => format!(" {marker}(${:02X}),Y", operand as u8),
        form::ACC => " A".to_string(),
        _ => String::new(),
    }
}

/// Render one host instruction; used by tracing and by the compiler
/// tests.
pub fn disassemble(insn: &HostInsn) -> String {
    let guest_target = |host: u32| (host / BYTES_PER_GUEST_BYTE as u32) as u16;
    let branch_name = |code: u8| match code {
        cond::PL => "BPL",
        cond::MI => "BMI",
        cond::VC => "BVC",
        cond::VS => "BVS",
        cond::CC => "BCC",
        cond::CS => "BCS",
        cond::NE => "BNE",
        _ => "BEQ",
    };
    match insn.op {
        op::COUNTDOWN => format!("COUNTDOWN {}", insn.addr),
        op::EXIT => "EXIT".to_string(),
        op::CRASH => "CRASH".to_string(),
        op::ILLEGAL => "ILLEGAL".to_string(),
        op::DEBUG => format!("DEBUG ${:04X}", insn.addr),
        op::JMP_HOST => format!("JMP ${:04X}", guest_target(insn.ext)),
        op::JMP_DYN => format!("JMP @${:04X}", insn.addr),
        op::JMP_IND => {
            if insn.n & form::DYNAMIC != 0 {
                format!("JMP (@${:04X})", insn.addr)
            } else {
                format!("JMP (${:04X})", insn.addr)
            }
        }
        op::BRANCH => format!(
            "{} ${:04X}",
            branch_name(insn.n & !form::DYNAMIC),
            guest_target(insn.ext)
        ),
        op::BRANCH_DYN => format!(
            "{} @${:04X}",
            branch_name(insn.n & !form::DYNAMIC),
            insn.addr
        ),
        op::JSR => format!("JSR ${:04X}", guest_target(insn.ext)),
        op::JSR_DYN => format!("JSR @${:04X}", insn.addr),
        op::RTS => "RTS".to_string(),
        op::RTI => "RTI".to_string(),
        op::BRK => "BRK".to_string(),
        op::FLAG_A => "FLAG_A".to_string(),
        op::FLAG_X => "FLAG_X".to_string(),
        op::FLAG_Y => "FLAG_Y".to_string(),
        op::ADD_IMM => format!("ADD_IMM #${:02X}", insn.n),
        op::SAVE_CARRY => "SAVE_CARRY".to_string(),
        op::SAVE_OVERFLOW => "SAVE_OVERFLOW".to_string(),
        op::STOA_IMM => format!("STOA_IMM ${:04X} #${:02X}", insn.addr, insn.n),
        op::TRAP => "TRAP".to_string(),
        other => {
            let name = match other {
                op::LDA => "LDA",
                op::LDX => "LDX",
                op::LDY => "LDY",
                op::STA => "STA",
                op::STX => "STX",
                op::STY => "STY",
                op::ADC => "ADC",
                op::SBC => "SBC",
                op::AND => "AND",
                op::ORA => "ORA",
                op::EOR => "EOR",
                op::CMP => "CMP",
                op::CPX => "CPX",
                op::CPY => "CPY",
                op::INC => "INC",
                op::DEC => "DEC",
                op::ASL => "ASL",
                op::LSR => "LSR",
                op::ROL => "ROL",
                op::ROR => "ROR",
                op::BIT => "BIT",
                op::TAX => "TAX",
                op::TAY => "TAY",
                op::TXA => "TXA",
                op::TYA => "TYA",
                op::TSX => "TSX",
                op::TXS => "TXS",
                op::PHA => "PHA",
                op::PHP => "PHP",
                op::PLA => "PLA",
                op::PLP => "PLP",
                op::CLC => "CLC",
                op::SEC => "SEC",
                op::CLI => "CLI",
                op::SEI => "SEI",
                op::CLD => "CLD",
                op::SED => "SED",
                op::CLV => "CLV",
                op::NOP => "NOP",
                _ => return format!("?{other:02X}"),
            };
            match other {
                op::LDA | op::LDX | op::LDY | op::STA | op::STX | op::STY | op::ADC
                | op::SBC | op::AND | op::ORA | op::EOR | op::CMP | op::CPX | op::CPY
                | op::INC | op::DEC | op::ASL | op::LSR | op::ROL | op::ROR | op::BIT => {
                    format!("{}{}", name, form_text(insn.n, insn.addr))
                }
                _ => name.to_string(),
            }
        }
    }
}
