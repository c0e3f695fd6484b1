//! Emulator core for a 6502-based home micro, built around a per-block
//! dynamic recompiler with an interpreter fallback.
//!
//! The pieces, leaves first: the guest memory image and its access views
//! ([`memory`]), the interpreter ([`interp`]), the single-micro-op host
//! assembler ([`jit::asm`]), the block compiler ([`jit::compiler`]), the
//! host-code arena ([`jit::arena`]) with the invalidation engine
//! ([`jit`]), the backend drivers ([`driver`]) and the owning machine
//! surface ([`machine`]).

// Clippy rules to disable.
#![allow(clippy::new_without_default)]
#![allow(clippy::upper_case_acronyms)]

pub mod config;
pub mod driver;
pub mod expression;
pub mod interp;
pub mod jit;
pub mod machine;
pub mod memory;
pub mod snapshot;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("ROM image is {0:#x} bytes, expected 16 KiB")]
    RomSize(usize),
    #[error("no such ROM slot {0}")]
    RomSlot(u8),
    #[error("malformed opt flag `{0}`")]
    OptFlag(String),
    #[error("snapshot i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("debug expression: {0}")]
    Expression(#[from] expression::ExpressionError),
}
