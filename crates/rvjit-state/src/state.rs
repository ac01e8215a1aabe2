//! RISC-V machine state struct.
//!
//! Layout must match the offsets baked into generated code exactly.

use crate::memory::{MAX_FRAMES, MAX_MEMORY, MAX_PAGES, MemoryError, validate_memory_size};

/// Number of architectural integer registers.
pub const NUM_REGS: usize = 32;

/// Number of emitter-private temporary slots.
pub const NUM_TEMPS: usize = 3;

/// Virtual register index of the program counter.
pub const REG_PC: u8 = 32;

/// Virtual register indices of the emitter temporaries.
pub const REG_TEMP1: u8 = 33;
pub const REG_TEMP2: u8 = 34;
pub const REG_TEMP3: u8 = 35;

/// Total virtual register slots (GPRs, PC and temporaries).
pub const NUM_VREGS: usize = NUM_REGS + 1 + NUM_TEMPS;

/// RISC-V machine state.
///
/// # Layout
///
/// ```text
/// offset 0:     registers[32]
/// offset 256:   pc
/// offset 264:   temps[3]
/// offset 288:   cycles
/// offset 296:   max_cycles
/// offset 304:   memory_size
/// offset 312:   chaos_mode
/// offset 320:   chaos_seed
/// offset 328:   flags[MAX_PAGES]
/// offset 1352:  frames[MAX_FRAMES]
/// offset 1368:  memory[MAX_MEMORY]
/// ```
///
/// Registers, PC and temporaries are contiguous so virtual slot `i` lives
/// at `8 * i`. Every field is a `u64` or a byte array whose length is a
/// multiple of 8, so the struct has no padding.
#[repr(C)]
pub struct MachineState {
    /// General-purpose registers. `registers[0]` is kept zero by callers.
    pub registers: [u64; NUM_REGS],

    /// Program counter.
    pub pc: u64,

    /// Emitter temporaries (virtual slots 33..35).
    pub temps: [u64; NUM_TEMPS],

    /// Cycles consumed so far.
    pub cycles: u64,

    /// Cycle budget; exceeding it stops execution.
    pub max_cycles: u64,

    /// Usable guest memory in bytes.
    pub memory_size: u64,

    /// Non-zero: fill fresh frames with pseudo-random bytes instead of zeros.
    pub chaos_mode: u64,

    /// Xorshift state consumed by chaos-mode frame initialization.
    pub chaos_seed: u64,

    /// Per-page protection flags.
    pub flags: [u8; MAX_PAGES],

    /// Per-frame initialization markers (0 = untouched).
    pub frames: [u8; MAX_FRAMES],

    /// Flat guest memory.
    pub memory: [u8; MAX_MEMORY],
}

impl MachineState {
    /// Allocate a zeroed state with `memory_size` bytes of usable guest memory.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidSize`] if `memory_size` is zero, above
    /// [`MAX_MEMORY`](crate::MAX_MEMORY), or not a multiple of the frame size.
    pub fn new(memory_size: u64) -> Result<Box<Self>, MemoryError> {
        validate_memory_size(memory_size)?;
        // SAFETY: every field is an integer or an integer array, so the
        // all-zero bit pattern is a valid `MachineState`.
        let mut state = unsafe { Box::<Self>::new_zeroed().assume_init() };
        state.memory_size = memory_size;
        state.max_cycles = u64::MAX;
        Ok(state)
    }

    /// Read a virtual register slot (GPR, PC or temporary).
    #[must_use]
    pub fn vreg(&self, idx: u8) -> u64 {
        match idx as usize {
            i if i < NUM_REGS => self.registers[i],
            i if i == REG_PC as usize => self.pc,
            i => self.temps[i - NUM_REGS - 1],
        }
    }

    /// Write a virtual register slot (GPR, PC or temporary).
    pub fn set_vreg(&mut self, idx: u8, value: u64) {
        match idx as usize {
            i if i < NUM_REGS => self.registers[i] = value,
            i if i == REG_PC as usize => self.pc = value,
            i => self.temps[i - NUM_REGS - 1] = value,
        }
    }

    /// Reset registers and counters, keeping memory contents.
    pub fn reset(&mut self) {
        self.registers = [0; NUM_REGS];
        self.temps = [0; NUM_TEMPS];
        self.pc = 0;
        self.cycles = 0;
    }

    /// View the whole state as raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `MachineState` is `repr(C)` with no padding, so every byte
        // is initialized.
        unsafe {
            std::slice::from_raw_parts(std::ptr::from_ref(self).cast::<u8>(), size_of::<Self>())
        }
    }

    /// View the whole state as mutable raw bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_bytes`; any byte pattern is a valid state.
        unsafe {
            std::slice::from_raw_parts_mut(
                std::ptr::from_mut(self).cast::<u8>(),
                size_of::<Self>(),
            )
        }
    }

    /// Get state as a mutable pointer (for generated code).
    pub fn as_mut_ptr(&mut self) -> *mut Self {
        std::ptr::from_mut(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MAX_MEMORY;
    use memoffset::offset_of;
    use std::mem::size_of;

    #[test]
    fn test_state_layout() {
        assert_eq!(offset_of!(MachineState, registers), 0);
        assert_eq!(offset_of!(MachineState, pc), 256);
        assert_eq!(offset_of!(MachineState, temps), 264);
        assert_eq!(offset_of!(MachineState, cycles), 288);
        assert_eq!(offset_of!(MachineState, max_cycles), 296);
        assert_eq!(offset_of!(MachineState, memory_size), 304);
        assert_eq!(offset_of!(MachineState, chaos_mode), 312);
        assert_eq!(offset_of!(MachineState, chaos_seed), 320);
        assert_eq!(offset_of!(MachineState, flags), 328);
        assert_eq!(offset_of!(MachineState, frames), 1352);
        assert_eq!(offset_of!(MachineState, memory), 1368);
        assert_eq!(size_of::<MachineState>(), 1368 + MAX_MEMORY);
    }

    #[test]
    fn test_vreg_slots_are_contiguous() {
        let mut state = MachineState::new(MAX_MEMORY as u64).unwrap();
        for idx in 0..NUM_VREGS as u8 {
            state.set_vreg(idx, u64::from(idx) * 0x0101);
        }
        let bytes = state.as_bytes();
        for idx in 0..NUM_VREGS {
            let slot: [u8; 8] = bytes[idx * 8..idx * 8 + 8].try_into().unwrap();
            assert_eq!(u64::from_le_bytes(slot), idx as u64 * 0x0101);
        }
        assert_eq!(state.vreg(REG_PC), 32 * 0x0101);
        assert_eq!(state.temps[2], u64::from(REG_TEMP3) * 0x0101);
    }

    #[test]
    fn test_state_new() {
        let state = MachineState::new(1 << 20).unwrap();
        assert_eq!(state.memory_size, 1 << 20);
        assert_eq!(state.max_cycles, u64::MAX);
        assert_eq!(state.pc, 0);
        assert!(state.frames.iter().all(|&f| f == 0));
    }

    #[test]
    fn test_state_reset() {
        let mut state = MachineState::new(1 << 20).unwrap();
        state.pc = 0x1000;
        state.cycles = 100;
        state.registers[5] = 7;
        state.memory[3] = 9;

        state.reset();

        assert_eq!(state.pc, 0);
        assert_eq!(state.cycles, 0);
        assert_eq!(state.registers[5], 0);
        assert_eq!(state.memory[3], 9);
    }

    #[test]
    fn test_invalid_memory_size() {
        assert!(MachineState::new(0).is_err());
        assert!(MachineState::new(MAX_MEMORY as u64 * 2).is_err());
        assert!(MachineState::new(4096).is_err());
    }
}
