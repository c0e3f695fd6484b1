//! Run a flat 6502 binary image through the emulator core and report
//! the final registers. Handy for poking at the compiler with real
//! programs without a full machine attached.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use bbc_core::driver::{GuestFault, RunResult};
use bbc_core::machine::{Machine, MachineOptions};
use colored::Colorize;
use log::info;
use structopt::StructOpt;

fn parse_addr(text: &str) -> Result<u16, String> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix('$'))
        .map(|hex| u16::from_str_radix(hex, 16))
        .unwrap_or_else(|| text.parse());
    digits.map_err(|e| format!("bad address `{text}`: {e}"))
}

#[derive(StructOpt)]
#[structopt(
    name = "bbc-cli-tool",
    about = "Run a flat 6502 image through the JIT or the interpreter."
)]
struct CliOptions {
    /// Flat binary loaded into guest memory.
    #[structopt(parse(from_os_str))]
    image: PathBuf,

    /// Load address for the image.
    #[structopt(long, parse(try_from_str = parse_addr), default_value = "$1000")]
    load_addr: u16,

    /// Entry point; defaults to the load address.
    #[structopt(long, parse(try_from_str = parse_addr))]
    entry: Option<u16>,

    /// Use the accurate (interpreter) backend instead of the JIT.
    #[structopt(long)]
    accurate: bool,

    /// Subsystem opt flags, e.g. "jit:max-ops=16,jit:optimizing=0".
    #[structopt(long, default_value = "")]
    opt_flags: String,

    /// Cycle budget before giving up.
    #[structopt(long, default_value = "20000000")]
    cycles: i64,

    /// Stop when execution reaches this address.
    #[structopt(long, parse(try_from_str = parse_addr))]
    debug_stop: Option<u16>,
}

fn main() -> Result<()> {
    env_logger::init();
    let options = CliOptions::from_args();

    let image = fs::read(&options.image)
        .with_context(|| format!("reading {}", options.image.display()))?;
    let mut machine = Machine::new(&MachineOptions {
        accurate: options.accurate,
        opt_flags: options.opt_flags.clone(),
        debug_stop_addr: options.debug_stop,
    })?;

    machine.set_block(options.load_addr, &image);
    let entry = options.entry.unwrap_or(options.load_addr);
    machine.set_pc(entry);
    info!(
        "loaded {} bytes at {:04X}, entering at {:04X}",
        image.len(),
        options.load_addr,
        entry
    );

    let result = machine.run(options.cycles);
    let registers = machine.get_registers();
    let status = match result {
        RunResult::Exited => "exited".green(),
        RunResult::Countdown => "out of cycles".yellow(),
        RunResult::DebugStop(_) => "debug stop".cyan(),
        RunResult::Fault(_) => "fault".red(),
    };
    println!(
        "{status}  A={:02X} X={:02X} Y={:02X} S={:02X} P={:08b} PC={:04X}  cycles={}",
        registers.a,
        registers.x,
        registers.y,
        registers.s,
        registers.flags,
        registers.pc,
        machine.get_cycles()
    );

    match result {
        RunResult::Fault(GuestFault::Illegal { pc, opcode }) => {
            bail!("illegal opcode {opcode:02X} at {pc:04X}")
        }
        RunResult::Fault(GuestFault::Crash { pc }) => bail!("crash at {pc:04X}"),
        _ => Ok(()),
    }
}
