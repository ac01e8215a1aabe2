//! Generated code run on the host CPU.
//!
//! Each function is copied into an anonymous mapping, switched to
//! read-execute and called through its C entry point. Exit codes and guest
//! state must match [`Machine`](crate::sim::Machine) started from an
//! identical state, and operation results must match [`reference`].

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::{self, NonNull};

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, mprotect, munmap};
use rvjit_state::{
    ExitCode, FLAG_EXECUTABLE, FRAME_SIZE, MAX_MEMORY, MachineState, NUM_VREGS, PAGE_SIZE,
};

use super::reference::{self, EDGES};
use super::{Compiled, FELL_THROUGH, Flavor, compile, new_state};
use crate::sim::CODE_BASE;
use crate::{AotEntry, BinaryOp, InterpEntry, PcUpdate, UnaryOp, Value};

/// A linked function mapped read-execute.
struct Executable {
    region: NonNull<c_void>,
    len: usize,
    /// Body entry offset for AOT code; `None` for interpreter code.
    entry: Option<usize>,
}

impl Executable {
    fn map(compiled: &Compiled, flavor: Flavor) -> Self {
        let code = compiled.linked.code();
        let len = NonZeroUsize::new(code.len()).unwrap();
        let region = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .unwrap();
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), region.as_ptr().cast::<u8>(), code.len());
            mprotect(region, code.len(), ProtFlags::PROT_READ | ProtFlags::PROT_EXEC).unwrap();
        }
        let entry = match flavor {
            Flavor::Interp => None,
            Flavor::Aot => Some((compiled.entry - CODE_BASE) as usize),
        };
        Self {
            region,
            len: code.len(),
            entry,
        }
    }

    fn call(&self, state: &mut MachineState) -> u32 {
        let base = self.region.as_ptr();
        // SAFETY: the mapping holds a complete function emitted for this
        // entry signature, and `state` outlives the call.
        unsafe {
            match self.entry {
                None => {
                    let f = std::mem::transmute::<*mut c_void, InterpEntry>(base);
                    f(state.as_mut_ptr())
                }
                Some(offset) => {
                    let f = std::mem::transmute::<*mut c_void, AotEntry>(base);
                    f(state.as_mut_ptr(), base as usize + offset)
                }
            }
        }
    }
}

impl Drop for Executable {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.region, self.len);
        }
    }
}

/// Two states that start identical: one for the CPU, one for the executor.
struct Pair {
    native: Box<MachineState>,
    simulated: Box<MachineState>,
}

impl Pair {
    fn new() -> Self {
        Self {
            native: new_state(),
            simulated: new_state(),
        }
    }

    fn with(mut self, setup: impl Fn(&mut MachineState)) -> Self {
        setup(&mut self.native);
        setup(&mut self.simulated);
        self
    }

    fn set_vreg(&mut self, idx: u8, value: u64) {
        self.native.set_vreg(idx, value);
        self.simulated.set_vreg(idx, value);
    }

    /// Run both sides and check exit code, vregs, cycles and page metadata.
    fn run(&mut self, exe: &Executable, compiled: &Compiled, what: &str) -> u32 {
        let expected = compiled.run(&mut self.simulated);
        let exit = exe.call(&mut self.native);
        assert_eq!(exit, expected, "{what}: exit");
        for idx in 0..NUM_VREGS as u8 {
            assert_eq!(
                self.native.vreg(idx),
                self.simulated.vreg(idx),
                "{what}: vreg {idx}"
            );
        }
        assert_eq!(self.native.cycles, self.simulated.cycles, "{what}: cycles");
        assert_eq!(self.native.chaos_seed, self.simulated.chaos_seed, "{what}: seed");
        assert_eq!(self.native.flags, self.simulated.flags, "{what}: flags");
        assert_eq!(self.native.frames, self.simulated.frames, "{what}: frames");
        exit
    }

    /// Full byte comparison, memory included.
    fn assert_identical(&self, what: &str) {
        assert!(
            self.native.as_bytes() == self.simulated.as_bytes(),
            "{what}: states differ"
        );
    }
}

fn compile_mapped(
    flavor: Flavor,
    body: impl FnOnce(&mut super::AnyEmitter) -> Result<(), crate::EmitError>,
) -> (Compiled, Executable) {
    let compiled = compile(flavor, body).unwrap();
    let exe = Executable::map(&compiled, flavor);
    (compiled, exe)
}

#[test]
fn test_binary_ops_on_cpu() {
    let pairs = reference::pairs(&EDGES);
    for flavor in Flavor::ALL {
        for op in BinaryOp::ALL {
            let (f, exe) =
                compile_mapped(flavor, |e| e.emit_binary(op, 5, Value::Reg(6), Value::Reg(11)));
            let mut states = Pair::new();
            for &(a, b) in &pairs {
                let what = format!("{flavor:?} {op} {a:#x} {b:#x}");
                states.set_vreg(6, a);
                states.set_vreg(11, b);
                assert_eq!(states.run(&exe, &f, &what), FELL_THROUGH, "{what}");
                assert_eq!(states.native.registers[5], reference::binary(op, a, b), "{what}");
            }

            // Immediate right operand, including values that need movabs.
            for b in EDGES {
                let (f, exe) =
                    compile_mapped(flavor, |e| e.emit_binary(op, 5, Value::Reg(6), Value::Imm(b)));
                let a = 0x8000_0000_0000_0001;
                let what = format!("{flavor:?} {op} {a:#x} imm {b:#x}");
                states.set_vreg(6, a);
                assert_eq!(states.run(&exe, &f, &what), FELL_THROUGH, "{what}");
                assert_eq!(states.native.registers[5], reference::binary(op, a, b), "{what}");
            }
        }
    }
}

#[test]
fn test_unary_ops_on_cpu() {
    let values = reference::operands(32);
    for flavor in Flavor::ALL {
        for op in UnaryOp::ALL {
            // Temp destination exercises the memory-backed path.
            for dest in [7, rvjit_state::REG_TEMP1] {
                let (f, exe) = compile_mapped(flavor, |e| e.emit_unary(op, dest, Value::Reg(10)));
                let mut states = Pair::new();
                for &a in &values {
                    let what = format!("{flavor:?} {op} x{dest} {a:#x}");
                    states.set_vreg(10, a);
                    assert_eq!(states.run(&exe, &f, &what), FELL_THROUGH, "{what}");
                    assert_eq!(states.native.vreg(dest), reference::unary(op, a), "{what}");
                }
            }
        }
    }
}

#[test]
fn test_extension_on_cpu() {
    for flavor in Flavor::ALL {
        for signed in [false, true] {
            let (f, exe) = compile_mapped(flavor, |e| {
                if signed {
                    e.emit_sext(5, Value::Reg(6), Value::Reg(7))
                } else {
                    e.emit_zext(5, Value::Reg(6), Value::Reg(7))
                }
            });
            let mut states = Pair::new();
            for value in EDGES {
                for bits in [0, 1, 8, 16, 31, 32, 63, 64] {
                    let what = format!("{flavor:?} signed={signed} {value:#x} {bits}");
                    states.set_vreg(6, value);
                    states.set_vreg(7, bits);
                    assert_eq!(states.run(&exe, &f, &what), FELL_THROUGH, "{what}");
                    assert_eq!(
                        states.native.registers[5],
                        reference::extend(signed, value, bits),
                        "{what}"
                    );
                }
            }
        }
    }
}

#[test]
fn test_memory_on_cpu() {
    const OUT_OF_BOUND: u32 = ExitCode::OutOfBound as u32;
    const INVALID_PERMISSION: u32 = ExitCode::InvalidPermission as u32;
    let exec = 0x3000u64;

    for flavor in Flavor::ALL {
        for width in [1u8, 2, 4, 8] {
            let w = u64::from(width);
            let (f, exe) = compile_mapped(flavor, |e| {
                e.emit_store(Value::Reg(10), Value::Reg(11), width)?;
                e.emit_load(12, Value::Reg(10), width)
            });
            let mut states = Pair::new().with(|state| {
                state.set_flags(exec, PAGE_SIZE as u64, FLAG_EXECUTABLE).unwrap();
            });
            let cases = [
                (0, FELL_THROUGH),
                (0x1234, FELL_THROUGH),
                (FRAME_SIZE as u64 - 1, FELL_THROUGH),
                (MAX_MEMORY as u64 - w, FELL_THROUGH),
                (MAX_MEMORY as u64 - w + 1, OUT_OF_BOUND),
                (u64::MAX - w + 1, OUT_OF_BOUND),
                (exec + 8, INVALID_PERMISSION),
            ];
            for (addr, expected) in cases {
                let what = format!("{flavor:?} w{width} {addr:#x}");
                states.set_vreg(10, addr);
                states.set_vreg(11, 0x8899_aabb_ccdd_eeff);
                states.set_vreg(12, 0);
                assert_eq!(states.run(&exe, &f, &what), expected, "{what}");
                if expected == FELL_THROUGH {
                    let mask = if width == 8 { u64::MAX } else { (1 << (8 * w)) - 1 };
                    assert_eq!(states.native.registers[12], 0x8899_aabb_ccdd_eeff & mask, "{what}");
                }
            }
            states.assert_identical(&format!("{flavor:?} w{width}"));
        }
    }
}

#[test]
fn test_chaos_frames_on_cpu() {
    for flavor in Flavor::ALL {
        let (f, exe) = compile_mapped(flavor, |e| e.emit_load(5, Value::Reg(6), 8));
        let mut states = Pair::new().with(|state| {
            state.chaos_mode = 1;
            state.chaos_seed = 0x0123_4567_89ab_cdef;
        });
        for addr in [0, FRAME_SIZE as u64 * 3 + 8, FRAME_SIZE as u64 * 2 - 4] {
            let what = format!("{flavor:?} {addr:#x}");
            states.set_vreg(6, addr);
            assert_eq!(states.run(&exe, &f, &what), FELL_THROUGH, "{what}");
        }
        states.assert_identical(&format!("{flavor:?} chaos"));
    }
}

#[test]
fn test_control_exits_on_cpu() {
    for flavor in Flavor::ALL {
        let (f, exe) = compile_mapped(flavor, |e| {
            e.emit_add_cycles(5)?;
            e.emit_mov(5, Value::Imm(1))?;
            e.emit_add_cycles(6)?;
            e.emit_cond_pc(
                Value::Reg(7),
                PcUpdate::Dynamic(Value::Reg(8)),
                PcUpdate::Write(Value::Imm(0x1004)),
            )?;
            e.emit_ecall(0x1000)
        });
        for (max_cycles, cycles, cond, expected) in [
            (10, 0, 0, ExitCode::MaxCyclesExceeded),
            (11, 0, 0, ExitCode::Ecall),
            (11, 0, 1, ExitCode::DynamicJump),
            (u64::MAX, u64::MAX - 2, 0, ExitCode::CyclesOverflow),
        ] {
            let mut states = Pair::new().with(|state| {
                state.max_cycles = max_cycles;
                state.cycles = cycles;
            });
            states.set_vreg(7, cond);
            states.set_vreg(8, 0x2468);
            let what = format!("{flavor:?} {expected:?}");
            assert_eq!(states.run(&exe, &f, &what), expected as u32, "{what}");
            assert_eq!(states.native.pc, states.simulated.pc, "{what}");
        }
    }
}
