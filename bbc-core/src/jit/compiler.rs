//! The block translator.
//!
//! Decodes successive guest opcodes into micro-ops, folds what the
//! per-block known-value state allows, and asks the assembler to emit
//! each micro-op. Block-walk policy (where a block may end, which
//! opcodes get dynamic operands) is decided by the invalidation layer in
//! `jit`; this module turns the resulting opcode list into host code.

use cpu_6502::alu::page_crossed;
use cpu_6502::opcodes::{
    branch_kind_of, instruction_len, BranchKind, Instruction, Mode, OPCODES,
};

use crate::jit::arena::block_entry;
use crate::jit::asm::{self, condition_of, form_of, Uop, MAX_UOP_LEN};
use crate::jit::host::{form, HOST_INSN_LEN};
use crate::memory::MemoryMap;

/// One decoded guest opcode, plus the block-walk decisions made for it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpcodeDetails {
    pub pc: u16,
    pub opcode: u8,
    pub instruction: Instruction,
    pub mode: Mode,
    pub len: u8,
    pub cycles: u8,
    /// Decoded literal operand (immediate value or guest address).
    pub operand: u16,
    pub branch_kind: BranchKind,
    /// Resolved target for relative branches and static jumps.
    pub branch_target: u16,
    /// Promoted operand: read from the guest image at run time instead
    /// of being baked in.
    pub dynamic: bool,
}

pub(crate) fn decode_opcode(mem: &MemoryMap, pc: u16) -> OpcodeDetails {
    let opcode = mem.read_ind(pc);
    let desc = &OPCODES[opcode as usize];
    let len = instruction_len(desc.mode);
    let operand = match len {
        2 => mem.read_ind(pc.wrapping_add(1)) as u16,
        3 => mem.read16_ind(pc.wrapping_add(1)),
        _ => 0,
    };
    let branch_kind = branch_kind_of(desc);
    let branch_target = match desc.mode {
        Mode::Relative => pc
            .wrapping_add(2)
            .wrapping_add(operand as u8 as i8 as u16),
        _ => operand,
    };
    OpcodeDetails {
        pc,
        opcode,
        instruction: desc.instruction,
        mode: desc.mode,
        len,
        cycles: desc.cycles,
        operand,
        branch_kind,
        branch_target,
        dynamic: false,
    }
}

/// Host code for one block, with the offset of every opcode's first host
/// instruction.
pub(crate) struct EmittedBlock {
    pub code: Vec<u8>,
    pub offsets: Vec<u32>,
}

/// Known values carried across opcodes within one block. Reset at every
/// block entry; used only for intra-block folding.
pub(crate) struct Compiler {
    known_a: Option<u8>,
    known_x: Option<u8>,
    known_y: Option<u8>,
    known_carry: Option<bool>,
    known_decimal: Option<bool>,
}

impl Compiler {
    pub fn new() -> Compiler {
        Compiler {
            known_a: None,
            known_x: None,
            known_y: None,
            known_carry: None,
            known_decimal: None,
        }
    }

    fn reset(&mut self) {
        *self = Compiler::new();
    }

    /// Emit a whole block: countdown prologue, each opcode's micro-ops,
    /// and the continuation jump when the walk was cut short.
    pub fn emit_block(
        &mut self,
        ops: &[OpcodeDetails],
        continuation: Option<u16>,
        optimizing: bool,
        debug: bool,
    ) -> EmittedBlock {
        self.reset();

        let cycles: u16 = ops.iter().map(|o| o.cycles as u16).sum();
        let max_insns = ops.len() * 3 + 2;
        let mut code = Vec::with_capacity(max_insns * MAX_UOP_LEN);
        let mut offsets = Vec::with_capacity(ops.len());

        asm::emit(&mut code, &Uop::Countdown { cycles });
        for op in ops {
            offsets.push(code.len() as u32);
            if debug {
                asm::emit(&mut code, &Uop::Debug { pc: op.pc });
            }
            self.emit_opcode(&mut code, op, optimizing);
        }
        if let Some(next) = continuation {
            asm::emit(
                &mut code,
                &Uop::JmpHost {
                    target_host: block_entry(next),
                },
            );
        }

        debug_assert!(code.len() <= max_insns * HOST_INSN_LEN);
        EmittedBlock { code, offsets }
    }

    fn emit_opcode(&mut self, code: &mut Vec<u8>, op: &OpcodeDetails, optimizing: bool) {
        use Instruction::*;

        match op.branch_kind {
            BranchKind::Conditional => {
                let condition = condition_of(op.instruction);
                if op.dynamic {
                    asm::emit(
                        code,
                        &Uop::BranchDyn {
                            condition,
                            operand_addr: op.pc.wrapping_add(1),
                            fallthrough: op.pc.wrapping_add(2),
                        },
                    );
                } else {
                    let fallthrough = op.pc.wrapping_add(2);
                    let taken_cycles =
                        1 + page_crossed(fallthrough, op.branch_target) as u8;
                    asm::emit(
                        code,
                        &Uop::Branch {
                            condition,
                            taken_cycles,
                            target_host: block_entry(op.branch_target),
                        },
                    );
                }
            }
            BranchKind::Always => {
                if op.instruction == JSR {
                    if op.dynamic {
                        asm::emit(
                            code,
                            &Uop::JsrDyn {
                                operand_addr: op.pc.wrapping_add(1),
                                return_addr: op.pc.wrapping_add(2),
                            },
                        );
                    } else {
                        asm::emit(
                            code,
                            &Uop::Jsr {
                                target_host: block_entry(op.branch_target),
                                return_addr: op.pc.wrapping_add(2),
                            },
                        );
                    }
                } else if op.dynamic {
                    asm::emit(
                        code,
                        &Uop::JmpDyn {
                            operand_addr: op.pc.wrapping_add(1),
                        },
                    );
                } else {
                    asm::emit(
                        code,
                        &Uop::JmpHost {
                            target_host: block_entry(op.branch_target),
                        },
                    );
                }
            }
            BranchKind::Indirect => match op.instruction {
                JMP => asm::emit(
                    code,
                    &Uop::JmpInd {
                        vector: if op.dynamic {
                            op.pc.wrapping_add(1)
                        } else {
                            op.operand
                        },
                        dynamic: op.dynamic,
                    },
                ),
                RTS => asm::emit(code, &Uop::Rts),
                RTI => asm::emit(code, &Uop::Rti),
                _ => asm::emit(
                    code,
                    &Uop::Brk {
                        return_addr: op.pc.wrapping_add(2),
                    },
                ),
            },
            BranchKind::None => {
                match op.instruction {
                    EXIT => {
                        asm::emit(code, &Uop::Exit);
                        return;
                    }
                    CRASH => {
                        asm::emit(code, &Uop::Crash);
                        return;
                    }
                    KIL => {
                        asm::emit(code, &Uop::Illegal);
                        return;
                    }
                    _ => {}
                }

                // Re-write the opcode if there is a folding opportunity.
                let primary = self
                    .rewrite(op, optimizing)
                    .unwrap_or_else(|| Uop::Insn6502 {
                        instruction: op.instruction,
                        form: form_of(op.mode)
                            | if op.dynamic { form::DYNAMIC } else { 0 },
                        operand: if op.dynamic {
                            op.pc.wrapping_add(1)
                        } else {
                            op.operand
                        },
                    });
                asm::emit(code, &primary);

                match op.instruction.sets_nz_from() {
                    Some(cpu_6502::opcodes::WritesReg::A) => {
                        asm::emit(code, &Uop::FlagA)
                    }
                    Some(cpu_6502::opcodes::WritesReg::X) => {
                        asm::emit(code, &Uop::FlagX)
                    }
                    Some(cpu_6502::opcodes::WritesReg::Y) => {
                        asm::emit(code, &Uop::FlagY)
                    }
                    _ => {}
                }
                if op.instruction.persists_carry() {
                    asm::emit(code, &Uop::SaveCarry);
                }
                if op.instruction.persists_overflow() {
                    asm::emit(code, &Uop::SaveOverflow);
                }

                self.update_known(op);
            }
        }
    }

    fn rewrite(&self, op: &OpcodeDetails, optimizing: bool) -> Option<Uop> {
        use Instruction::*;
        if !optimizing || op.dynamic {
            return None;
        }
        match (op.instruction, op.mode) {
            // ADC with a known-clear carry in binary mode is a plain
            // add.
            (ADC, Mode::Immediate)
                if self.known_carry == Some(false)
                    && self.known_decimal == Some(false) =>
            {
                Some(Uop::AddImm {
                    value: op.operand as u8,
                })
            }
            // STA of a known accumulator is a constant store.
            (STA, Mode::ZeroPage) | (STA, Mode::Absolute) => {
                self.known_a.map(|value| Uop::StoaImm {
                    addr: op.operand,
                    value,
                })
            }
            _ => None,
        }
    }

    fn update_known(&mut self, op: &OpcodeDetails) {
        use Instruction::*;

        let imm = (op.mode == Mode::Immediate && !op.dynamic)
            .then_some(op.operand as u8);
        match op.instruction.writes_reg() {
            cpu_6502::opcodes::WritesReg::A => {
                self.known_a = if op.instruction == LDA { imm } else { None };
            }
            cpu_6502::opcodes::WritesReg::X => {
                self.known_x = if op.instruction == LDX { imm } else { None };
            }
            cpu_6502::opcodes::WritesReg::Y => {
                self.known_y = if op.instruction == LDY { imm } else { None };
            }
            _ => {}
        }

        if op.instruction.changes_carry() {
            self.known_carry = None;
        }
        match op.instruction {
            CLC => self.known_carry = Some(false),
            SEC => self.known_carry = Some(true),
            CLD => self.known_decimal = Some(false),
            SED => self.known_decimal = Some(true),
            PLP | RTI => self.known_decimal = None,
            _ => {}
        }
    }
}
