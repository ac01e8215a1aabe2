//! x86-64 machine-code layer.
//!
//! # Module Structure
//!
//! - `registers` - Physical registers and the two register mapping tables
//! - `inst` - Typed instruction model with AT&T rendering
//! - `encode` - Byte encoder
//! - `assembler` - Instruction buffer, labels, in-use register bitmap
//! - `link` - Two-pass layout and label resolution

mod assembler;
mod encode;
mod inst;
mod link;
mod registers;

pub use assembler::{Assembler, Item};
pub use encode::{encode, encoded_len};
pub use inst::{AluOp, Cond, Inst, Label, Mem, Operand, RegImm, RegMem, ShiftOp, Size};
pub use link::{Linked, link};
pub use registers::{
    AOT_REGISTER_MAP, INTERP_REGISTER_MAP, Reg, RegSet, RegisterTable, lookup, mapped, reserved,
};
