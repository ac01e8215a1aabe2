//! `MachineState` layout as seen by generated code.
//!
//! Offsets are computed from the same constants `rvjit-state` uses, and the
//! tests pin them against the real struct with `memoffset`.

use rvjit_state::{MAX_FRAMES, MAX_PAGES, NUM_REGS, NUM_TEMPS};

/// `MachineState` field offsets, in bytes from the state pointer.
pub struct StateLayout;

impl StateLayout {
    /// Bytes per register slot.
    pub const REG_BYTES: i32 = 8;

    pub const REGISTERS: i32 = 0;
    pub const PC: i32 = Self::REGISTERS + NUM_REGS as i32 * Self::REG_BYTES;
    pub const TEMPS: i32 = Self::PC + Self::REG_BYTES;
    pub const CYCLES: i32 = Self::TEMPS + NUM_TEMPS as i32 * Self::REG_BYTES;
    pub const MAX_CYCLES: i32 = Self::CYCLES + 8;
    pub const MEMORY_SIZE: i32 = Self::MAX_CYCLES + 8;
    pub const CHAOS_MODE: i32 = Self::MEMORY_SIZE + 8;
    pub const CHAOS_SEED: i32 = Self::CHAOS_MODE + 8;
    pub const FLAGS: i32 = Self::CHAOS_SEED + 8;
    pub const FRAMES: i32 = Self::FLAGS + MAX_PAGES as i32;
    pub const MEMORY: i32 = Self::FRAMES + MAX_FRAMES as i32;

    /// Offset of virtual register slot `vreg` (GPRs, then PC, then temps).
    #[must_use]
    pub const fn vreg(vreg: u8) -> i32 {
        Self::REGISTERS + vreg as i32 * Self::REG_BYTES
    }
}
