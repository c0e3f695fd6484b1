//! Execution backends and the shared context they run against.
//!
//! The two backends (interpreter, JIT) implement the [`CpuBackend`]
//! capability record and are interchangeable from the machine's point of
//! view; they share one architectural state, one memory image and one
//! countdown cell.

use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use cpu_6502::state::State6502;

use crate::expression::Expression;
use crate::interp::{self, InterpExit};
use crate::jit::host::ExitReason;
use crate::jit::{arena, Jit};
use crate::memory::MemoryMap;

/// Interrupt lines asserted from any thread, observed by the emulation
/// thread at instruction and block boundaries.
pub struct IrqLines {
    lines: AtomicCell<u32>,
}

impl IrqLines {
    pub fn new() -> IrqLines {
        IrqLines {
            lines: AtomicCell::new(0),
        }
    }

    pub fn set(&self, id: u8, level: bool) {
        let bit = 1u32 << (id & 31);
        let mut cur = self.lines.load();
        loop {
            let next = if level { cur | bit } else { cur & !bit };
            match self.lines.compare_exchange(cur, next) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn pending(&self) -> bool {
        self.lines.load() != 0
    }
}

/// The owned mutable context threaded through every operation; there are
/// no process-wide singletons anywhere in the core.
pub struct CoreContext {
    pub state: State6502,
    pub mem: MemoryMap,
    /// Cycles remaining before control returns to the caller. Shared so
    /// other threads can force an exit by driving it far negative.
    pub countdown: Arc<AtomicCell<i64>>,
    pub irq_lines: Arc<IrqLines>,
}

/// A guest-visible failure delivered through a trap, never through an
/// error channel in compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestFault {
    Illegal { pc: u16, opcode: u8 },
    Crash { pc: u16 },
}

/// Why the backend handed control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Countdown,
    Exited,
    DebugStop(u16),
    Fault(GuestFault),
}

/// Capability record implemented by both backends.
pub trait CpuBackend: Send {
    fn init(&mut self, ctx: &mut CoreContext);

    /// Run until the countdown expires or something stops execution.
    fn enter(&mut self, ctx: &mut CoreContext) -> RunResult;

    fn set_debug_stop(&mut self, addr: Option<u16>);

    fn set_debug_condition(&mut self, condition: Option<Expression>);

    /// Typed access for the JIT-specific surface (tests, invalidation
    /// from the machine layer). The interpreter backend has none.
    fn as_jit(&mut self) -> Option<&mut JitDriver> {
        None
    }
}

/// The accurate backend: pure interpretation.
pub struct InterpDriver {
    stop_addr: Option<u16>,
    condition: Option<Expression>,
}

impl InterpDriver {
    pub fn new() -> InterpDriver {
        InterpDriver {
            stop_addr: None,
            condition: None,
        }
    }
}

impl CpuBackend for InterpDriver {
    fn init(&mut self, _ctx: &mut CoreContext) {}

    fn enter(&mut self, ctx: &mut CoreContext) -> RunResult {
        let stop_addr = self.stop_addr;
        let condition = self.condition.as_ref();
        let mut callback = |event: &interp::InterpEvent, state: &State6502| {
            let stop = Some(event.pc) == stop_addr
                && condition.map_or(true, |c| c.evaluate_for_state(state) != 0);
            !stop
        };
        let mut no_invalidate = |_addr: u16| {};
        match interp::enter(ctx, Some(&mut callback), &mut no_invalidate) {
            InterpExit::CountdownExpired => RunResult::Countdown,
            InterpExit::CallbackStop => RunResult::DebugStop(ctx.state.pc()),
            InterpExit::Exited => RunResult::Exited,
            InterpExit::Fault(fault) => RunResult::Fault(fault),
        }
    }

    fn set_debug_stop(&mut self, addr: Option<u16>) {
        self.stop_addr = addr;
    }

    fn set_debug_condition(&mut self, condition: Option<Expression>) {
        self.condition = condition;
    }
}

/// The fast backend: block compilation with interpreter assistance for
/// interrupt entry and fault reporting.
pub struct JitDriver {
    jit: Jit,
}

impl JitDriver {
    pub fn new(jit: Jit) -> JitDriver {
        JitDriver { jit }
    }

    pub fn jit(&self) -> &Jit {
        &self.jit
    }

    pub fn jit_mut(&mut self) -> &mut Jit {
        &mut self.jit
    }

    /// Guest PC for a host IP that delivered a trap. Code traps resolve
    /// through the back-map; a trap at a block-entry boundary with no
    /// live block is a jump target awaiting compilation.
    fn trap_pc(&self, host_ip: u32) -> Option<u16> {
        if host_ip % arena::BYTES_PER_GUEST_BYTE as u32 == 0 {
            let guest = (host_ip / arena::BYTES_PER_GUEST_BYTE as u32) as u16;
            if !self.jit.has_valid_block(guest) {
                return Some(guest);
            }
        }
        self.jit.details_from_host_ip(host_ip).pc_6502
    }
}

impl CpuBackend for JitDriver {
    fn init(&mut self, _ctx: &mut CoreContext) {}

    fn enter(&mut self, ctx: &mut CoreContext) -> RunResult {
        // An external entry is a fundamental block boundary; recompiles
        // triggered from inside the run are not.
        self.jit.mark_entry_point(ctx.state.pc());

        loop {
            let pc = ctx.state.pc();
            if !self.jit.has_valid_block(pc) {
                self.jit.compile_block(&ctx.mem, pc);
            }
            match self.jit.execute(ctx, arena::block_entry(pc)) {
                ExitReason::Countdown { host_ip } => {
                    let block = (host_ip / arena::BYTES_PER_GUEST_BYTE as u32) as u16;
                    ctx.state.set_pc(block);
                    return RunResult::Countdown;
                }
                ExitReason::Irq { host_ip } => {
                    let block = (host_ip / arena::BYTES_PER_GUEST_BYTE as u32) as u16;
                    ctx.state.set_pc(block);
                    let jit = &mut self.jit;
                    interp::service_irq(ctx, &mut |addr| jit.invalidate_code_at(addr));
                }
                ExitReason::Exited { host_ip } => {
                    if let Some(pc) = self.jit.details_from_host_ip(host_ip).pc_6502 {
                        ctx.state.set_pc(pc);
                    }
                    return RunResult::Exited;
                }
                ExitReason::Crash { host_ip } => {
                    let pc = self.trap_pc(host_ip).unwrap_or(ctx.state.pc());
                    ctx.state.set_pc(pc);
                    return RunResult::Fault(GuestFault::Crash { pc });
                }
                ExitReason::Illegal { host_ip } => {
                    // Drop through to the interpreter for the exact fault
                    // report.
                    if let Some(pc) = self.jit.details_from_host_ip(host_ip).pc_6502 {
                        ctx.state.set_pc(pc);
                    }
                    let jit = &mut self.jit;
                    let mut invalidate = |addr: u16| jit.invalidate_code_at(addr);
                    if let Some(exit) = interp::step_one(ctx, None, &mut invalidate) {
                        return match exit {
                            InterpExit::Fault(fault) => RunResult::Fault(fault),
                            InterpExit::Exited => RunResult::Exited,
                            InterpExit::CountdownExpired => RunResult::Countdown,
                            InterpExit::CallbackStop => RunResult::DebugStop(ctx.state.pc()),
                        };
                    }
                }
                ExitReason::Debug { pc } => {
                    ctx.state.set_pc(pc);
                    return RunResult::DebugStop(pc);
                }
                ExitReason::InvalidationTrap { host_ip } => {
                    let Some(pc) = self.trap_pc(host_ip) else {
                        let pc = ctx.state.pc();
                        return RunResult::Fault(GuestFault::Crash { pc });
                    };
                    ctx.state.set_pc(pc);
                    self.jit.compile_block(&ctx.mem, pc);
                }
                ExitReason::BlockNotCompiled { guest } => {
                    ctx.state.set_pc(guest);
                }
            }
        }
    }

    fn set_debug_stop(&mut self, addr: Option<u16>) {
        self.jit.set_debug_stop(addr);
    }

    fn set_debug_condition(&mut self, condition: Option<Expression>) {
        self.jit.set_debug_condition(condition);
    }

    fn as_jit(&mut self) -> Option<&mut JitDriver> {
        Some(self)
    }
}
