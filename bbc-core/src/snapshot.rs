//! Persisted machine state.
//!
//! A flat record: the raw 64 KiB image, the state record, and the ROM
//! bank identifiers (not the bank contents; those come from the ROM
//! files). Loading a snapshot invalidates every compiled block.

use std::io::{Read, Write};

use cpu_6502::state::State6502;
use serde::{Deserialize, Serialize};

use crate::memory::{MemoryMap, NUM_ROM_SLOTS};
use crate::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RomSlotId {
    pub slot: u8,
    pub loaded: bool,
    pub writable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub memory: Vec<u8>,
    pub state: State6502,
    pub romsel: u8,
    pub rom_slots: Vec<RomSlotId>,
}

impl Snapshot {
    pub fn capture(state: &State6502, mem: &MemoryMap) -> Snapshot {
        Snapshot {
            memory: mem.raw_image().to_vec(),
            state: state.clone(),
            romsel: mem.romsel(),
            rom_slots: (0..NUM_ROM_SLOTS)
                .map(|slot| RomSlotId {
                    slot,
                    loaded: mem.slot_loaded(slot),
                    writable: mem.slot_writable(slot),
                })
                .collect(),
        }
    }

    pub fn write_to(&self, writer: impl Write) -> Result<(), CoreError> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn read_from(reader: impl Read) -> Result<Snapshot, CoreError> {
        Ok(serde_json::from_reader(reader)?)
    }
}
