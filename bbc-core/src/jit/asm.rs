//! The single-micro-op assembler.
//!
//! One call emits the host code for exactly one micro-op into the
//! caller's buffer, and never allocates. Every emission is bounded by
//! `MAX_UOP_LEN`; blowing that bound would mean a micro-op the arena
//! slot arithmetic cannot accommodate, which is a fatal bug rather than
//! a recoverable error.

use cpu_6502::opcodes::{Instruction, Mode};

use crate::jit::host::{cond, form, op, HostInsn, HOST_INSN_LEN};

/// Upper bound on the host bytes of a single micro-op. Each micro-op is
/// exactly one host instruction, so the per-opcode total (debug hook +
/// primary + trailing flag op) stays far below the arena's
/// bytes-per-guest-byte slot size.
pub const MAX_UOP_LEN: usize = HOST_INSN_LEN;

/// A micro-op descriptor, as produced by the block compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uop {
    /// Charge the block's summed cycle cost, trapping to the driver on
    /// expiry or a pending interrupt.
    Countdown { cycles: u16 },
    /// A non-control 6502 instruction, parametrized by addressing form.
    /// With `form::DYNAMIC`, `operand` is the guest location the operand
    /// is read from at run time.
    Insn6502 {
        instruction: Instruction,
        form: u8,
        operand: u16,
    },
    Branch {
        condition: u8,
        taken_cycles: u8,
        target_host: u32,
    },
    BranchDyn {
        condition: u8,
        operand_addr: u16,
        fallthrough: u16,
    },
    JmpHost { target_host: u32 },
    JmpDyn { operand_addr: u16 },
    JmpInd { vector: u16, dynamic: bool },
    Jsr { target_host: u32, return_addr: u16 },
    JsrDyn { operand_addr: u16, return_addr: u16 },
    Rts,
    Rti,
    Brk { return_addr: u16 },
    FlagA,
    FlagX,
    FlagY,
    AddImm { value: u8 },
    SaveCarry,
    SaveOverflow,
    StoaImm { addr: u16, value: u8 },
    Exit,
    Crash,
    Illegal,
    Debug { pc: u16 },
}

pub fn form_of(mode: Mode) -> u8 {
    match mode {
        Mode::Immediate => form::IMM,
        Mode::ZeroPage => form::ZPG,
        Mode::ZeroPageX => form::ZPX,
        Mode::ZeroPageY => form::ZPY,
        Mode::Absolute => form::ABS,
        Mode::AbsoluteIndexedX => form::ABX,
        Mode::AbsoluteIndexedY => form::ABY,
        Mode::IndirectX => form::IZX,
        Mode::IndirectY => form::IZY,
        Mode::RegisterA => form::ACC,
        // Implied, Relative and Indirect never reach Insn6502.
        _ => form::ACC,
    }
}

pub fn condition_of(instruction: Instruction) -> u8 {
    match instruction {
        Instruction::BPL => cond::PL,
        Instruction::BMI => cond::MI,
        Instruction::BVC => cond::VC,
        Instruction::BVS => cond::VS,
        Instruction::BCC => cond::CC,
        Instruction::BCS => cond::CS,
        Instruction::BNE => cond::NE,
        _ => cond::EQ,
    }
}

fn host_op_of(instruction: Instruction) -> u8 {
    use Instruction::*;
    match instruction {
        LDA => op::LDA,
        LDX => op::LDX,
        LDY => op::LDY,
        STA => op::STA,
        STX => op::STX,
        STY => op::STY,
        ADC => op::ADC,
        SBC => op::SBC,
        AND => op::AND,
        ORA => op::ORA,
        EOR => op::EOR,
        CMP => op::CMP,
        CPX => op::CPX,
        CPY => op::CPY,
        INC => op::INC,
        DEC => op::DEC,
        ASL => op::ASL,
        LSR => op::LSR,
        ROL => op::ROL,
        ROR => op::ROR,
        BIT => op::BIT,
        TAX => op::TAX,
        TAY => op::TAY,
        TXA => op::TXA,
        TYA => op::TYA,
        TSX => op::TSX,
        TXS => op::TXS,
        PHA => op::PHA,
        PHP => op::PHP,
        PLA => op::PLA,
        PLP => op::PLP,
        CLC => op::CLC,
        SEC => op::SEC,
        CLI => op::CLI,
        SEI => op::SEI,
        CLD => op::CLD,
        SED => op::SED,
        CLV => op::CLV,
        NOP => op::NOP,
        other => panic!("{other:?} is not a straight-line instruction"),
    }
}

/// Emit one micro-op into `code`. The caller reserves capacity up front;
/// the assembler itself never allocates.
pub fn emit(code: &mut Vec<u8>, uop: &Uop) {
    debug_assert!(code.capacity() - code.len() >= MAX_UOP_LEN);
    let start = code.len();
    let insn = match *uop {
        Uop::Countdown { cycles } => HostInsn {
            op: op::COUNTDOWN,
            n: 0,
            addr: cycles,
            ext: 0,
        },
        Uop::Insn6502 {
            instruction,
            form,
            operand,
        } => HostInsn {
            op: host_op_of(instruction),
            n: form,
            addr: operand,
            ext: 0,
        },
        Uop::Branch {
            condition,
            taken_cycles,
            target_host,
        } => HostInsn {
            op: op::BRANCH,
            n: condition,
            addr: taken_cycles as u16,
            ext: target_host,
        },
        Uop::BranchDyn {
            condition,
            operand_addr,
            fallthrough,
        } => HostInsn {
            op: op::BRANCH_DYN,
            n: condition,
            addr: operand_addr,
            ext: fallthrough as u32,
        },
        Uop::JmpHost { target_host } => HostInsn {
            op: op::JMP_HOST,
            n: 0,
            addr: 0,
            ext: target_host,
        },
        Uop::JmpDyn { operand_addr } => HostInsn {
            op: op::JMP_DYN,
            n: 0,
            addr: operand_addr,
            ext: 0,
        },
        Uop::JmpInd { vector, dynamic } => HostInsn {
            op: op::JMP_IND,
            n: if dynamic { form::DYNAMIC } else { 0 },
            addr: vector,
            ext: 0,
        },
        Uop::Jsr {
            target_host,
            return_addr,
        } => HostInsn {
            op: op::JSR,
            n: 0,
            addr: return_addr,
            ext: target_host,
        },
        Uop::JsrDyn {
            operand_addr,
            return_addr,
        } => HostInsn {
            op: op::JSR_DYN,
            n: 0,
            addr: operand_addr,
            ext: return_addr as u32,
        },
        Uop::Rts => HostInsn {
            op: op::RTS,
            n: 0,
            addr: 0,
            ext: 0,
        },
        Uop::Rti => HostInsn {
            op: op::RTI,
            n: 0,
            addr: 0,
            ext: 0,
        },
        Uop::Brk { return_addr } => HostInsn {
            op: op::BRK,
            n: 0,
            addr: return_addr,
            ext: 0,
        },
        Uop::FlagA => HostInsn {
            op: op::FLAG_A,
            n: 0,
            addr: 0,
            ext: 0,
        },
        Uop::FlagX => HostInsn {
            op: op::FLAG_X,
            n: 0,
            addr: 0,
            ext: 0,
        },
        Uop::FlagY => HostInsn {
            op: op::FLAG_Y,
            n: 0,
            addr: 0,
            ext: 0,
        },
        Uop::AddImm { value } => HostInsn {
            op: op::ADD_IMM,
            n: value,
            addr: 0,
            ext: 0,
        },
        Uop::SaveCarry => HostInsn {
            op: op::SAVE_CARRY,
            n: 0,
            addr: 0,
            ext: 0,
        },
        Uop::SaveOverflow => HostInsn {
            op: op::SAVE_OVERFLOW,
            n: 0,
            addr: 0,
            ext: 0,
        },
        Uop::StoaImm { addr, value } => HostInsn {
            op: op::STOA_IMM,
            n: value,
            addr,
            ext: 0,
        },
        Uop::Exit => HostInsn {
            op: op::EXIT,
            n: 0,
            addr: 0,
            ext: 0,
        },
        Uop::Crash => HostInsn {
            op: op::CRASH,
            n: 0,
            addr: 0,
            ext: 0,
        },
        Uop::Illegal => HostInsn {
            op: op::ILLEGAL,
            n: 0,
            addr: 0,
            ext: 0,
        },
        Uop::Debug { pc } => HostInsn {
            op: op::DEBUG,
            n: 0,
            addr: pc,
            ext: 0,
        },
    };
    code.extend_from_slice(&insn.encode());
    let emitted = code.len() - start;
    assert!(
        emitted <= MAX_UOP_LEN,
        "micro-op emitted {emitted} bytes, budget is {MAX_UOP_LEN}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::host::disassemble;

    fn emit_one(uop: &Uop) -> HostInsn {
        let mut code = Vec::with_capacity(MAX_UOP_LEN);
        emit(&mut code, uop);
        assert_eq!(code.len(), HOST_INSN_LEN);
        HostInsn::decode(&code.try_into().unwrap())
    }

    #[test]
    fn every_emission_is_one_host_instruction() {
        let insn = emit_one(&Uop::Insn6502 {
            instruction: Instruction::LDA,
            form: form::ABX,
            operand: 0x0E01,
        });
        assert_eq!(disassemble(&insn), "LDA $0E01,X");
    }

    #[test]
    fn introduced_micro_ops_encode_their_operands() {
        let insn = emit_one(&Uop::StoaImm {
            addr: 0x0050,
            value: 0x1D,
        });
        assert_eq!(disassemble(&insn), "STOA_IMM $0050 #$1D");

        let insn = emit_one(&Uop::Countdown { cycles: 11 });
        assert_eq!(disassemble(&insn), "COUNTDOWN 11");

        let insn = emit_one(&Uop::AddImm { value: 0x22 });
        assert_eq!(disassemble(&insn), "ADD_IMM #$22");
    }

    #[test]
    #[should_panic(expected = "not a straight-line instruction")]
    fn control_flow_has_no_generic_encoding() {
        emit_one(&Uop::Insn6502 {
            instruction: Instruction::JMP,
            form: form::ABS,
            operand: 0x1234,
        });
    }
}
