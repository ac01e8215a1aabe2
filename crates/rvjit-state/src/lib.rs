//! RISC-V machine state shared by the code emitters and the host.
//!
//! `MachineState` has a fixed `#[repr(C)]` layout. Generated code addresses
//! its fields through byte offsets relative to a single state pointer, so
//! the field order here is part of the contract with `rvjit-emit`.
//!
//! The crate also carries the guest-memory protection model (pages, frames,
//! flags) and a safe reference implementation of guest loads and stores.
//! The interpreter-style emitter reaches that implementation through the
//! `extern "C"` functions in [`callbacks`].

pub mod callbacks;
mod exit;
mod memory;
mod state;

pub use exit::ExitCode;
pub use memory::{
    FLAG_DIRTY, FLAG_EXECUTABLE, FLAG_FREEZED, FLAG_WXORX_BIT, FLAG_WRITABLE, FRAME_SHIFT,
    FRAME_SIZE, MAX_FRAMES, MAX_MEMORY, MAX_PAGES, MemoryError, PAGE_SHIFT, PAGE_SIZE,
    validate_memory_size, xorshift64,
};
pub use state::{
    MachineState, NUM_REGS, NUM_TEMPS, NUM_VREGS, REG_PC, REG_TEMP1, REG_TEMP2, REG_TEMP3,
};
