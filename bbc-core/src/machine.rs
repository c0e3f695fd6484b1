//! The machine: one owned context, one backend, and the surface the
//! rest of the emulator talks to.
//!
//! A single emulation thread owns the core. Other threads interact only
//! through the interrupt lines, the shared countdown cell and the
//! bounded message channel.

use std::io::{Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::atomic::AtomicCell;
use cpu_6502::state::State6502;
use log::debug;

use crate::config::parse_opt_flags;
use crate::driver::{CoreContext, CpuBackend, InterpDriver, IrqLines, JitDriver, RunResult};
use crate::expression::Expression;
use crate::jit::Jit;
use crate::memory::{DeviceBus, MemoryMap, NullDevices};
use crate::snapshot::Snapshot;
use crate::CoreError;

/// Messages from the emulation thread to the host, as ASCII byte codes.
pub mod message {
    pub const EXITED: u8 = b'E';
    pub const VSYNC: u8 = b'V';
    pub const RENDER_DONE: u8 = b'R';
}

const MESSAGE_QUEUE_DEPTH: usize = 16;

/// Cycles granted per scheduling slice on the async run loop.
pub const RUN_SLICE_CYCLES: i64 = 100_000;

/// Countdown values at or below this read as a stop request.
const STOP_THRESHOLD: i64 = i64::MIN / 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub s: u8,
    pub flags: u8,
    pub pc: u16,
}

#[derive(Debug, Clone, Default)]
pub struct MachineOptions {
    /// The accurate flag selects the interpreter backend; the default
    /// fast shape is the JIT.
    pub accurate: bool,
    pub opt_flags: String,
    pub debug_stop_addr: Option<u16>,
}

pub struct Machine {
    ctx: CoreContext,
    backend: Box<dyn CpuBackend>,
    sender: SyncSender<u8>,
    receiver: Option<Receiver<u8>>,
    run_result: Option<RunResult>,
    cycles: u64,
}

impl Machine {
    pub fn new(options: &MachineOptions) -> Result<Machine, CoreError> {
        Machine::with_devices(options, Box::new(NullDevices))
    }

    pub fn with_devices(
        options: &MachineOptions,
        devices: Box<dyn DeviceBus>,
    ) -> Result<Machine, CoreError> {
        let tuning = parse_opt_flags(&options.opt_flags)?;
        let mut backend: Box<dyn CpuBackend> = if options.accurate {
            Box::new(InterpDriver::new())
        } else {
            Box::new(JitDriver::new(Jit::new(tuning)))
        };
        backend.set_debug_stop(options.debug_stop_addr);

        let mut ctx = CoreContext {
            state: State6502::new(),
            mem: MemoryMap::new(devices),
            countdown: Arc::new(AtomicCell::new(0)),
            irq_lines: Arc::new(IrqLines::new()),
        };
        backend.init(&mut ctx);

        let (sender, receiver) = sync_channel(MESSAGE_QUEUE_DEPTH);
        Ok(Machine {
            ctx,
            backend,
            sender,
            receiver: Some(receiver),
            run_result: None,
            cycles: 0,
        })
    }

    // ----- memory surface -----

    pub fn mem_read(&mut self, addr: u16) -> u8 {
        self.ctx.mem.read_full(addr)
    }

    pub fn mem_write(&mut self, addr: u16, value: u8) {
        if self.ctx.mem.write_full(addr, value) {
            self.invalidate_code_at(addr);
        }
    }

    pub fn set_block(&mut self, addr: u16, bytes: &[u8]) {
        self.ctx.mem.set_block(addr, bytes);
        for i in 0..bytes.len() {
            self.invalidate_code_at(addr.wrapping_add(i as u16));
        }
    }

    pub fn load_os_rom(&mut self, data: &[u8]) -> Result<(), CoreError> {
        self.ctx.mem.load_os_rom(data)?;
        self.invalidate_range(0xC000, 0x4000);
        Ok(())
    }

    pub fn load_rom(&mut self, slot: u8, data: &[u8]) -> Result<(), CoreError> {
        self.ctx.mem.load_rom(slot, data)?;
        self.invalidate_range(0x8000, 0x4000);
        Ok(())
    }

    pub fn make_sideways_ram(&mut self, slot: u8) -> Result<(), CoreError> {
        self.ctx.mem.make_sideways_ram(slot)?;
        self.invalidate_range(0x8000, 0x4000);
        Ok(())
    }

    pub fn select_rom(&mut self, slot: u8) -> Result<(), CoreError> {
        self.ctx.mem.select_rom(slot)?;
        self.invalidate_range(0x8000, 0x4000);
        Ok(())
    }

    fn invalidate_code_at(&mut self, addr: u16) {
        if let Some(jit) = self.backend.as_jit() {
            jit.jit_mut().invalidate_code_at(addr);
        }
    }

    fn invalidate_range(&mut self, start: u16, len: u32) {
        if let Some(jit) = self.backend.as_jit() {
            jit.jit_mut().invalidate_range(start, len);
        }
    }

    // ----- state surface -----

    pub fn get_registers(&self) -> Registers {
        let s = &self.ctx.state;
        Registers {
            a: s.a(),
            x: s.x(),
            y: s.y(),
            s: s.s(),
            flags: s.flags(),
            pc: s.pc(),
        }
    }

    pub fn set_registers(&mut self, registers: Registers) {
        let s = &mut self.ctx.state;
        s.set_a(registers.a);
        s.set_x(registers.x);
        s.set_y(registers.y);
        s.set_s(registers.s);
        s.set_flags(registers.flags);
        s.set_pc(registers.pc);
    }

    pub fn set_pc(&mut self, pc: u16) {
        self.ctx.state.set_pc(pc);
    }

    pub fn get_cycles(&self) -> u64 {
        self.cycles
    }

    /// Head of the compiled block covering an address, when the JIT
    /// backend has one.
    pub fn get_block(&mut self, pc: u16) -> Option<u16> {
        self.backend
            .as_jit()
            .and_then(|jit| jit.jit().block_for_addr(pc))
    }

    /// Assert or clear an interrupt line; observed at the next
    /// instruction or block boundary.
    pub fn set_interrupt(&self, id: u8, level: bool) {
        self.ctx.irq_lines.set(id, level);
    }

    // ----- debugger surface -----

    pub fn set_debug_stop(&mut self, addr: Option<u16>) {
        self.backend.set_debug_stop(addr);
    }

    pub fn set_debug_condition(&mut self, text: Option<&str>) -> Result<(), CoreError> {
        let condition = match text {
            Some(text) => Some(Expression::parse(text)?),
            None => None,
        };
        self.backend.set_debug_condition(condition);
        Ok(())
    }

    // ----- run control -----

    /// Run for (roughly) `countdown` guest cycles, or until the program
    /// exits, stops for the debugger, or faults.
    pub fn run(&mut self, countdown: i64) -> RunResult {
        self.ctx.countdown.store(countdown);
        let result = self.backend.enter(&mut self.ctx);
        let remaining = self.ctx.countdown.load();
        self.cycles += countdown.saturating_sub(remaining).clamp(0, countdown.max(0)) as u64;
        self.finish_run(result);
        result
    }

    fn finish_run(&mut self, result: RunResult) {
        debug!("run halted: {result:?}");
        self.run_result = Some(result);
        if result == RunResult::Exited {
            // A full queue or a dropped receiver must not stall the
            // emulation thread.
            let _ = self.sender.try_send(message::EXITED);
        }
    }

    /// Why the last run halted.
    pub fn run_result(&self) -> Option<RunResult> {
        self.run_result
    }

    /// Take the host side of the message channel.
    pub fn messages(&mut self) -> Option<Receiver<u8>> {
        self.receiver.take()
    }

    /// Move the machine onto its own emulation thread.
    pub fn run_async(mut self) -> MachineHandle {
        let messages = self.receiver.take().expect("message receiver already taken");
        let irq_lines = Arc::clone(&self.ctx.irq_lines);
        let countdown = Arc::clone(&self.ctx.countdown);

        let thread = thread::spawn(move || {
            loop {
                // Top up the slice, unless a stop request drove the
                // countdown far negative in the meantime.
                let current = self.ctx.countdown.load();
                if current <= STOP_THRESHOLD {
                    self.run_result = Some(RunResult::Countdown);
                    break;
                }
                if self
                    .ctx
                    .countdown
                    .compare_exchange(current, RUN_SLICE_CYCLES)
                    .is_err()
                {
                    continue;
                }
                let result = self.backend.enter(&mut self.ctx);
                let remaining = self.ctx.countdown.load();
                self.cycles += (RUN_SLICE_CYCLES - remaining).clamp(0, RUN_SLICE_CYCLES) as u64;
                if result == RunResult::Countdown {
                    continue;
                }
                self.finish_run(result);
                break;
            }
            self
        });

        MachineHandle {
            thread,
            messages,
            irq_lines,
            countdown,
        }
    }

    /// Typed access to the JIT backend, for tests and invalidating
    /// subsystems. Panics on an accurate-flag machine.
    pub fn jit(&mut self) -> &mut JitDriver {
        self.backend
            .as_jit()
            .expect("machine is running the interpreter backend")
    }

    // ----- snapshots -----

    pub fn save_snapshot(&self, writer: impl Write) -> Result<(), CoreError> {
        Snapshot::capture(&self.ctx.state, &self.ctx.mem).write_to(writer)
    }

    pub fn load_snapshot(&mut self, reader: impl Read) -> Result<(), CoreError> {
        let snapshot = Snapshot::read_from(reader)?;
        if snapshot.memory.len() != self.ctx.mem.raw_image().len() {
            return Err(CoreError::RomSize(snapshot.memory.len()));
        }
        for id in &snapshot.rom_slots {
            if id.writable {
                self.ctx.mem.make_sideways_ram(id.slot)?;
            }
        }
        self.ctx.mem.restore_romsel(snapshot.romsel);
        self.ctx.mem.restore_raw_image(&snapshot.memory);
        self.ctx.state = snapshot.state;
        if let Some(jit) = self.backend.as_jit() {
            jit.jit_mut().invalidate_all();
        }
        Ok(())
    }
}

/// Handle to a machine running on its own thread.
pub struct MachineHandle {
    thread: JoinHandle<Machine>,
    pub messages: Receiver<u8>,
    irq_lines: Arc<IrqLines>,
    countdown: Arc<AtomicCell<i64>>,
}

impl MachineHandle {
    pub fn set_interrupt(&self, id: u8, level: bool) {
        self.irq_lines.set(id, level);
    }

    /// Request a stop by driving the shared countdown far negative; the
    /// next countdown check exits compiled code.
    pub fn stop(&self) {
        self.countdown.store(i64::MIN / 2);
    }

    pub fn join(self) -> Machine {
        self.thread.join().expect("emulation thread panicked")
    }
}
