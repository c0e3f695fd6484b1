//! The dynamic recompiler: mapping tables, the invalidation engine and
//! block lifecycle.
//!
//! A block is the unit of invalidation. Per guest byte the engine keeps
//! the host pointer of the opcode covering that byte (`ptrs`) and the
//! head of the block owning it (`owner`); per block head it keeps the
//! opcode list for the inverse host-to-guest lookup. Stale blocks are
//! never freed: their entry bytes are overwritten with the trap
//! sequence, and re-entry falls back to the driver for recompilation.

pub mod arena;
pub mod asm;
pub mod compiler;
pub mod host;

use std::collections::HashMap;

use cpu_6502::opcodes::{operand_len, BranchKind};
use log::debug;

use self::arena::{block_entry, Arena};
use self::compiler::{decode_opcode, Compiler, OpcodeDetails};
use self::host::{HostInsn, HOST_INSN_LEN};
use crate::config::JitTuning;
use crate::expression::Expression;
use crate::memory::MemoryMap;

pub const INVALID_PTR: u32 = u32::MAX;
const NO_OWNER: u32 = u32::MAX;
const NO_OPCODE: u16 = 0xFFFF;

struct BlockOp {
    pc: u16,
    /// Absolute arena offset of this opcode's first host instruction.
    host: u32,
}

struct BlockInfo {
    start: u16,
    /// One past the last guest byte covered (not wrapped, so it can
    /// reach 0x10000 and slightly beyond for a final wrapping opcode).
    end_guest: u32,
    code_len: u32,
    ops: Vec<BlockOp>,
}

/// Per-address compile history driving dynamic-operand promotion.
#[derive(Clone, Copy)]
struct CompileHistory {
    opcode: u16,
    self_modify_count: u32,
}

const EMPTY_HISTORY: CompileHistory = CompileHistory {
    opcode: NO_OPCODE,
    self_modify_count: 0,
};

/// Inverse lookup result: host instruction pointer back to guest PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostIpDetails {
    pub exact_match: bool,
    pub pc_6502: Option<u16>,
    pub block_6502: Option<u16>,
    /// Where the invalidation trap for the covering block lives.
    pub invalidation_code_block: Option<u32>,
}

pub struct Jit {
    arena: Arena,
    /// Host pointer of the opcode covering each guest byte. Operand
    /// bytes of a dynamic-operand opcode are deliberately absent so
    /// writes to them no longer invalidate anything.
    ptrs: Vec<u32>,
    /// Head of the block covering each guest byte.
    owner: Vec<u32>,
    blocks: HashMap<u16, BlockInfo>,
    /// Forced block starts: external entries. A compile walk never runs
    /// across one of these; continuation heads are not marked and may be
    /// absorbed back.
    entry_points: Vec<bool>,
    history: Vec<CompileHistory>,
    compiler: Compiler,
    tuning: JitTuning,
    debug_stop: Option<u16>,
    debug_condition: Option<Expression>,
}

impl Jit {
    pub fn new(tuning: JitTuning) -> Jit {
        Jit {
            arena: Arena::new(),
            ptrs: vec![INVALID_PTR; 0x10000],
            owner: vec![NO_OWNER; 0x10000],
            blocks: HashMap::new(),
            entry_points: vec![false; 0x10000],
            history: vec![EMPTY_HISTORY; 0x10000],
            compiler: Compiler::new(),
            tuning,
            debug_stop: None,
            debug_condition: None,
        }
    }

    pub fn tuning(&self) -> &JitTuning {
        &self.tuning
    }

    pub fn set_max_ops(&mut self, max_ops: u32) {
        self.tuning.max_ops = max_ops.clamp(1, 1024);
    }

    pub fn set_optimizing(&mut self, optimizing: bool) {
        self.tuning.optimizing = optimizing;
    }

    pub fn set_dynamic_trigger(&mut self, trigger: u32) {
        self.tuning.dynamic_trigger = trigger.max(1);
    }

    pub fn set_debug_stop(&mut self, addr: Option<u16>) {
        self.debug_stop = addr;
    }

    pub fn set_debug_condition(&mut self, condition: Option<Expression>) {
        self.debug_condition = condition;
    }

    /// Canonical block entry host address for a guest address, whether
    /// or not a block is compiled there.
    pub fn block_host_address(&self, addr: u16) -> u32 {
        block_entry(addr)
    }

    /// Host address of the compiled translation of the opcode covering
    /// this guest byte.
    pub fn code_host_address(&self, addr: u16) -> Option<u32> {
        let ptr = self.ptrs[addr as usize];
        (ptr != INVALID_PTR).then_some(ptr)
    }

    pub fn is_invalidated_at(&self, host: u32) -> bool {
        self.arena.is_trap_at(host)
    }

    pub fn is_block_invalidated(&self, addr: u16) -> bool {
        self.is_invalidated_at(block_entry(addr))
    }

    pub fn is_code_invalidated(&self, addr: u16) -> bool {
        match self.code_host_address(addr) {
            Some(host) => self.is_invalidated_at(host),
            None => true,
        }
    }

    pub fn has_valid_block(&self, addr: u16) -> bool {
        self.blocks.contains_key(&addr)
    }

    /// Head of the block covering a guest address, if any.
    pub fn block_for_addr(&self, addr: u16) -> Option<u16> {
        let owner = self.owner[addr as usize];
        (owner != NO_OWNER).then_some(owner as u16)
    }

    /// Mark an external entry as a fundamental block boundary.
    pub fn mark_entry_point(&mut self, addr: u16) {
        self.entry_points[addr as usize] = true;
    }

    /// Explicit invalidation of the code covering one guest byte: writes
    /// the trap over the covering opcode's host code. Idempotent, cheap,
    /// and a no-op for uncovered bytes (including the operand bytes of
    /// dynamic-operand opcodes).
    pub fn invalidate_code_at(&mut self, addr: u16) {
        let ptr = self.ptrs[addr as usize];
        if ptr != INVALID_PTR {
            self.arena.write_trap(ptr);
        }
    }

    /// Invalidate every block covering any byte of a guest range. Used
    /// for ROM bank switches and snapshot loads.
    pub fn invalidate_range(&mut self, start: u16, len: u32) {
        let lo = start as u32;
        let hi = lo + len;
        let heads: Vec<u16> = self
            .blocks
            .values()
            .filter(|info| (info.start as u32) < hi && info.end_guest > lo)
            .map(|info| info.start)
            .collect();
        for head in heads {
            self.invalidate_block(head);
        }
    }

    pub fn invalidate_all(&mut self) {
        let heads: Vec<u16> = self.blocks.keys().copied().collect();
        for head in heads {
            self.invalidate_block(head);
        }
        self.entry_points.fill(false);
        self.history.fill(EMPTY_HISTORY);
    }

    fn invalidate_block(&mut self, head: u16) {
        if let Some(info) = self.blocks.remove(&head) {
            let end = info.end_guest.min(0x10000);
            for b in (info.start as u32)..end {
                self.ptrs[b as usize] = INVALID_PTR;
                self.owner[b as usize] = NO_OWNER;
            }
            debug!("invalidated block {head:04X}");
        }
        self.arena.write_trap(block_entry(head));
    }

    /// Walk guest opcodes from `start`, deciding where the block ends
    /// and which operands are promoted to dynamic. Also advances the
    /// self-modification history, so it must look at the old mapping
    /// tables before anything is cleared.
    fn plan_block(
        &mut self,
        mem: &MemoryMap,
        start: u16,
    ) -> (Vec<OpcodeDetails>, Option<u16>) {
        let mut ops: Vec<OpcodeDetails> = Vec::new();
        let mut pc32 = start as u32;
        loop {
            if pc32 > 0xFFFF {
                return (ops, Some((pc32 & 0xFFFF) as u16));
            }
            let pc = pc32 as u16;
            if ops.len() as u32 >= self.tuning.max_ops {
                return (ops, Some(pc));
            }
            if pc != start && self.entry_points[pc as usize] {
                return (ops, Some(pc));
            }

            let mut details = decode_opcode(mem, pc);

            // A trap over this opcode's old host code means a write hit
            // its bytes since the last compile. Block-level invalidation
            // clears `ptrs` first, so a block split never counts here.
            let old_ptr = self.ptrs[pc as usize];
            let self_modified = old_ptr != INVALID_PTR && self.arena.is_trap_at(old_ptr);
            let hist = &mut self.history[pc as usize];
            if hist.opcode == details.opcode as u16 {
                if self_modified {
                    hist.self_modify_count += 1;
                }
            } else {
                *hist = CompileHistory {
                    opcode: details.opcode as u16,
                    self_modify_count: 0,
                };
            }
            details.dynamic = self.tuning.optimizing
                && operand_len(details.mode) >= 1
                && self.history[pc as usize].self_modify_count >= self.tuning.dynamic_trigger;

            pc32 += details.len as u32;
            let ends = matches!(
                details.branch_kind,
                BranchKind::Always | BranchKind::Indirect
            );
            ops.push(details);
            if ends {
                return (ops, None);
            }
        }
    }

    /// Compile the block at `start` and publish it: splits and absorbed
    /// heads are invalidated, host code lands at the block entry, and
    /// the per-byte mapping tables are rewritten.
    pub fn compile_block(&mut self, mem: &MemoryMap, start: u16) {
        let (ops, continuation) = self.plan_block(mem, start);

        // Compiling strictly inside an existing block splits it.
        let split_owner = self.owner[start as usize];
        if split_owner != NO_OWNER && split_owner != start as u32 {
            self.invalidate_block(split_owner as u16);
        }
        // Recompiling the same head: retire the previous coverage.
        if self.blocks.contains_key(&start) {
            self.invalidate_block(start);
        }

        let end_guest = start as u32 + ops.iter().map(|o| o.len as u32).sum::<u32>();
        // Absorb every non-fundamental head now strictly inside this
        // block.
        for b in (start as u32 + 1)..end_guest.min(0x10000) {
            if self.blocks.contains_key(&(b as u16)) {
                self.invalidate_block(b as u16);
            }
        }

        let emitted = self.compiler.emit_block(
            &ops,
            continuation,
            self.tuning.optimizing,
            self.tuning.debug,
        );
        let entry = block_entry(start);
        self.arena.install(entry, &emitted.code);

        let mut block_ops = Vec::with_capacity(ops.len());
        for (op, rel) in ops.iter().zip(&emitted.offsets) {
            let host = entry + rel;
            block_ops.push(BlockOp { pc: op.pc, host });
            for i in 0..op.len as u16 {
                let b = op.pc.wrapping_add(i) as usize;
                self.owner[b] = start as u32;
                self.ptrs[b] = if op.dynamic && i >= 1 {
                    INVALID_PTR
                } else {
                    host
                };
            }
        }
        self.blocks.insert(
            start,
            BlockInfo {
                start,
                end_guest,
                code_len: emitted.code.len() as u32,
                ops: block_ops,
            },
        );
        debug!(
            "compiled block {start:04X}..{:04X}, {} host bytes",
            end_guest,
            emitted.code.len()
        );
    }

    /// Inverse lookup: which guest PC and block does a host IP belong
    /// to? The PC resolves only when the IP lands inside some opcode's
    /// emitted bytes; the prologue and trailer belong to the block but
    /// to no opcode.
    pub fn details_from_host_ip(&self, ip: u32) -> HostIpDetails {
        const NONE: HostIpDetails = HostIpDetails {
            exact_match: false,
            pc_6502: None,
            block_6502: None,
            invalidation_code_block: None,
        };

        let slot = (ip / arena::BYTES_PER_GUEST_BYTE as u32).min(0xFFFF) as usize;
        let owner = self.owner[slot];
        if owner == NO_OWNER {
            return NONE;
        }
        let head = owner as u16;
        let invalidation_code_block = Some(block_entry(head));
        let Some(info) = self.blocks.get(&head) else {
            return NONE;
        };

        let code_end = block_entry(head) + info.code_len;
        for (i, op) in info.ops.iter().enumerate() {
            let end = info
                .ops
                .get(i + 1)
                .map(|next| next.host)
                .unwrap_or(code_end);
            if ip >= op.host && ip < end {
                return HostIpDetails {
                    exact_match: ip == op.host,
                    pc_6502: Some(op.pc),
                    block_6502: Some(head),
                    invalidation_code_block,
                };
            }
        }
        HostIpDetails {
            exact_match: false,
            pc_6502: None,
            block_6502: None,
            invalidation_code_block,
        }
    }

    /// Render a compiled block's host code, one line per instruction.
    pub fn disassemble_block(&self, addr: u16) -> Option<Vec<String>> {
        let info = self.blocks.get(&addr)?;
        let entry = block_entry(addr);
        let mut lines = Vec::new();
        let mut offset = entry;
        while offset < entry + info.code_len {
            let bytes = self.arena.insn_bytes(offset)?;
            lines.push(host::disassemble(&HostInsn::decode(&bytes)));
            offset += HOST_INSN_LEN as u32;
        }
        Some(lines)
    }
}
