//! Generated code executed on the reference executor.
//!
//! Every test builds a function with one or both emitters, runs it through
//! [`Machine`] against a real `MachineState`, and compares the guest-visible
//! result with [`reference`]. Every linked buffer is also decoded by
//! [`encoding::check`], and `native` runs a sample of them on the host CPU.

mod memory;
#[cfg(all(target_arch = "x86_64", unix))]
mod native;

use rvjit_state::{ExitCode, MAX_MEMORY, MachineState};

use crate::sim::{CODE_BASE, Machine};
use crate::{
    AotEmitter, BinaryOp, EmitConfig, EmitError, InterpEmitter, Linked, MemoryCallbacks, PcUpdate,
    Reg, UnaryOp, Value,
};

/// Label table size used by the tests.
const MAX_LABELS: u32 = 16;

/// Label the AOT harness enters through.
const ENTRY: u32 = MAX_LABELS - 1;

/// Exit of a function that ran off the end of its body.
const FELL_THROUGH: u32 = ExitCode::DecodeTrace as u32;

fn config() -> EmitConfig {
    EmitConfig::default().with_max_labels(MAX_LABELS)
}

fn new_state() -> Box<MachineState> {
    MachineState::new(MAX_MEMORY as u64).unwrap()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flavor {
    Interp,
    Aot,
}

impl Flavor {
    const ALL: [Self; 2] = [Self::Interp, Self::Aot];
}

/// Either emitter behind one surface.
enum AnyEmitter {
    Interp(InterpEmitter),
    Aot(AotEmitter),
}

macro_rules! forward {
    ($($name:ident($($arg:ident: $ty:ty),*) -> $ret:ty;)*) => {
        impl AnyEmitter {
            $(
                fn $name(&mut self, $($arg: $ty),*) -> $ret {
                    match self {
                        Self::Interp(e) => e.$name($($arg),*),
                        Self::Aot(e) => e.$name($($arg),*),
                    }
                }
            )*
        }
    };
}

forward! {
    lock_register(reg: Reg) -> Result<(), EmitError>;
    unlock_register(reg: Reg) -> Result<(), EmitError>;
    emit_mov(dest: u8, value: Value) -> Result<(), EmitError>;
    emit_binary(op: BinaryOp, dest: u8, a: Value, b: Value) -> Result<(), EmitError>;
    emit_unary(op: UnaryOp, dest: u8, a: Value) -> Result<(), EmitError>;
    emit_sext(dest: u8, src: Value, bits: Value) -> Result<(), EmitError>;
    emit_zext(dest: u8, src: Value, bits: Value) -> Result<(), EmitError>;
    emit_cond(dest: u8, cond: Value, when_true: Value, when_false: Value) -> Result<(), EmitError>;
    emit_load(dest: u8, addr: Value, width: u8) -> Result<(), EmitError>;
    emit_store(addr: Value, value: Value, width: u8) -> Result<(), EmitError>;
    place_label(id: u32) -> Result<(), EmitError>;
    emit_pc(update: PcUpdate) -> Result<(), EmitError>;
    emit_cond_pc(cond: Value, taken: PcUpdate, not_taken: PcUpdate) -> Result<(), EmitError>;
    emit_add_cycles(cycles: u64) -> Result<(), EmitError>;
    emit_ecall(pc: u64) -> Result<(), EmitError>;
    emit_ebreak(pc: u64) -> Result<(), EmitError>;
    emit_exit(code: ExitCode) -> ();
}

/// A linked function and the `rsi` argument that enters its body.
struct Compiled {
    linked: Linked,
    entry: u64,
}

impl Compiled {
    fn machine(&self) -> Machine<'_> {
        Machine::new(&self.linked).with_callbacks(&MemoryCallbacks::default())
    }

    /// Run on `state`; panics on any executor fault.
    fn run(&self, state: &mut MachineState) -> u32 {
        self.machine().run(state, self.entry).unwrap()
    }
}

/// Build a function with the `flavor` emitter.
///
/// AOT bodies start at [`ENTRY`], placed right after the prologue.
fn compile(
    flavor: Flavor,
    body: impl FnOnce(&mut AnyEmitter) -> Result<(), EmitError>,
) -> Result<Compiled, EmitError> {
    let mut emitter = match flavor {
        Flavor::Interp => {
            AnyEmitter::Interp(InterpEmitter::new(config(), MemoryCallbacks::default())?)
        }
        Flavor::Aot => {
            let mut e = AotEmitter::new(config())?;
            e.place_label(ENTRY)?;
            AnyEmitter::Aot(e)
        }
    };
    body(&mut emitter)?;
    match emitter {
        AnyEmitter::Interp(e) => {
            let linked = e.finish()?;
            encoding::check(&linked);
            Ok(Compiled { linked, entry: 0 })
        }
        AnyEmitter::Aot(e) => {
            let linked = e.finish()?;
            encoding::check(&linked);
            let offset = linked
                .label_offset(ENTRY)
                .ok_or(EmitError::UnresolvedLabel(ENTRY))?;
            Ok(Compiled {
                linked,
                entry: CODE_BASE + offset as u64,
            })
        }
    }
}

#[test]
fn test_empty_body_falls_through() {
    for flavor in Flavor::ALL {
        let f = compile(flavor, |_| Ok(())).unwrap();
        let mut state = new_state();
        state.registers[10] = 77;
        assert_eq!(f.run(&mut state), FELL_THROUGH, "{flavor:?}");
        // Pinned registers round-trip through the prologue and epilogue.
        assert_eq!(state.registers[10], 77);
    }
}

#[test]
fn test_listing_names_the_body() {
    let f = compile(Flavor::Interp, |e| e.emit_binary(BinaryOp::Add, 5, Value::Reg(6), Value::Imm(9)))
        .unwrap();
    let listing = f.linked.listing();
    assert!(listing.contains("add"), "{listing}");
    assert!(listing.contains("ret"), "{listing}");
}
