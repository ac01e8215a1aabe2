//! x86-64 code emission for a RISC-V interpreter and AOT compiler.
//!
//! Two emitters share one lowering of the RISC-V integer operations:
//!
//! - [`InterpEmitter`] produces `fn(*mut MachineState) -> u32` functions
//!   that reach guest memory through host callbacks.
//! - [`AotEmitter`] produces `fn(*mut MachineState, entry) -> u32`
//!   functions with more guest registers pinned and inline memory
//!   protection.
//!
//! Both return an [`ExitCode`] in `eax` when control goes back to the host.
//! [`Linked`] holds the finished machine code; mapping it executable is the
//! host's job. [`sim`] runs linked code without doing so.
//!
//! ```ignore
//! use rvjit_emit::{EmitConfig, InterpEmitter, MemoryCallbacks, Value};
//!
//! let mut e = InterpEmitter::new(EmitConfig::default(), MemoryCallbacks::default())?;
//! e.emit_add(10, Value::Reg(10), Value::imm(-3))?;
//! let linked = e.finish()?;
//! ```

mod aot;
mod config;
mod emitter;
mod error;
mod interp;
mod layout;
mod ops;
pub mod sim;
mod value;
pub mod x86;

#[cfg(test)]
mod tests;

pub use aot::{Aot, AotEmitter, AotEntry, compile_batch};
pub use config::{DEFAULT_MAX_LABELS, EmitConfig, MemoryCallbacks};
pub use emitter::{Emitter, Variant};
pub use error::{EmitError, ErrorCode};
pub use interp::{Interp, InterpEmitter, InterpEntry};
pub use layout::StateLayout;
pub use ops::{BinaryOp, UnaryOp};
pub use rvjit_state::ExitCode;
pub use value::{PcUpdate, Value};
pub use x86::{Linked, Reg};
