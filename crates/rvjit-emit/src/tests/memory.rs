//! Guest loads and stores: callbacks versus inline protection.

use rvjit_state::{
    ExitCode, FLAG_DIRTY, FLAG_EXECUTABLE, FRAME_SIZE, MAX_MEMORY, MachineState, PAGE_SIZE,
    REG_TEMP1, REG_TEMP2, xorshift64,
};

use super::{FELL_THROUGH, Flavor, compile, new_state};
use crate::{EmitError, Reg, Value};

const WIDTHS: [u8; 4] = [1, 2, 4, 8];
const PATTERN: u64 = 0x8899_aabb_ccdd_eeff;

const OUT_OF_BOUND: u32 = ExitCode::OutOfBound as u32;
const INVALID_PERMISSION: u32 = ExitCode::InvalidPermission as u32;

fn mask(width: u8) -> u64 {
    if width == 8 {
        u64::MAX
    } else {
        (1 << (8 * u32::from(width))) - 1
    }
}

/// Addresses at page, frame and memory edges that fit `width` bytes.
fn addresses(width: u8) -> Vec<u64> {
    let w = u64::from(width);
    let frame = FRAME_SIZE as u64;
    vec![
        0,
        0x1234,
        PAGE_SIZE as u64 - 1,
        frame - w / 2 - 1,
        frame * 3 + 5,
        MAX_MEMORY as u64 - w,
    ]
}

#[test]
fn test_store_then_load_round_trips() {
    // (addr vreg or imm, value vreg or imm, load dest)
    let layouts: [(Option<u8>, Option<u8>, u8); 5] = [
        (Some(5), Some(6), 7),
        (Some(10), Some(11), 1),
        (None, None, 7),
        (Some(REG_TEMP1), Some(REG_TEMP2), REG_TEMP2),
        // the loaded value replaces its own address
        (Some(5), Some(11), 5),
    ];
    for flavor in Flavor::ALL {
        for width in WIDTHS {
            for addr in addresses(width) {
                for (addr_reg, value_reg, dest) in layouts {
                    let operand = |reg: Option<u8>, imm: u64| reg.map_or(Value::Imm(imm), Value::Reg);
                    let f = compile(flavor, |e| {
                        e.emit_store(operand(addr_reg, addr), operand(value_reg, PATTERN), width)?;
                        e.emit_load(dest, operand(addr_reg, addr), width)
                    })
                    .unwrap();
                    let mut state = new_state();
                    // Frame initialization has its own tests.
                    state.frames.fill(1);
                    if let Some(r) = addr_reg {
                        state.set_vreg(r, addr);
                    }
                    if let Some(r) = value_reg {
                        state.set_vreg(r, PATTERN);
                    }
                    let what = format!("{flavor:?} w{width} {addr:#x} {addr_reg:?}/{value_reg:?}");
                    assert_eq!(f.run(&mut state), FELL_THROUGH, "{what}");
                    assert_eq!(state.vreg(dest), PATTERN & mask(width), "{what}");
                    let at = addr as usize;
                    assert_eq!(
                        state.memory[at..at + width as usize],
                        PATTERN.to_le_bytes()[..width as usize],
                        "{what}"
                    );
                    assert_ne!(state.flags[at / PAGE_SIZE] & FLAG_DIRTY, 0, "{what}");
                }
            }
        }
    }
}

#[test]
fn test_load_zero_extends() {
    for flavor in Flavor::ALL {
        for width in WIDTHS {
            let f = compile(flavor, |e| e.emit_load(1, Value::Imm(0x40), width)).unwrap();
            let mut state = new_state();
            state.frames[0] = 1;
            state.memory[0x40..0x48].copy_from_slice(&u64::MAX.to_le_bytes());
            state.registers[1] = 0x1234_5678_9abc_def0;
            assert_eq!(f.run(&mut state), FELL_THROUGH);
            assert_eq!(state.registers[1], mask(width), "{flavor:?} w{width}");
        }
    }
}

#[test]
fn test_out_of_bounds_exits() {
    for flavor in Flavor::ALL {
        for width in WIDTHS {
            let w = u64::from(width);
            for addr in [MAX_MEMORY as u64 - w + 1, MAX_MEMORY as u64, u64::MAX - w + 1, u64::MAX] {
                let load = compile(flavor, |e| e.emit_load(7, Value::Reg(5), width)).unwrap();
                let store =
                    compile(flavor, |e| e.emit_store(Value::Reg(5), Value::Imm(1), width)).unwrap();
                for f in [load, store] {
                    let mut state = new_state();
                    state.registers[5] = addr;
                    state.registers[7] = 3;
                    assert_eq!(f.run(&mut state), OUT_OF_BOUND, "{flavor:?} w{width} {addr:#x}");
                    assert_eq!(state.registers[7], 3);
                    assert!(state.frames.iter().all(|&f| f == 0));
                    assert!(state.flags.iter().all(|&f| f == 0));
                }
            }
        }
    }
}

#[test]
fn test_bounds_follow_state_memory_size() {
    // Code built for the full size still honours a smaller state.
    let small = FRAME_SIZE as u64 * 2;
    for flavor in Flavor::ALL {
        let f = compile(flavor, |e| e.emit_load(7, Value::Reg(5), 8)).unwrap();
        let mut state = MachineState::new(small).unwrap();
        for (addr, exit) in [(small - 8, FELL_THROUGH), (small - 7, OUT_OF_BOUND)] {
            state.registers[5] = addr;
            assert_eq!(f.run(&mut state), exit, "{flavor:?} {addr:#x}");
        }
    }
}

#[test]
fn test_oversized_memory_size_is_capped() {
    let end = MAX_MEMORY as u64;
    for flavor in Flavor::ALL {
        let load = compile(flavor, |e| e.emit_load(7, Value::Reg(5), 1)).unwrap();
        let store = compile(flavor, |e| e.emit_store(Value::Reg(5), Value::Imm(9), 2)).unwrap();
        let mut state = new_state();
        state.memory_size = u64::MAX;
        for addr in [end, end + 0x1000, u64::MAX - 1] {
            state.registers[5] = addr;
            assert_eq!(load.run(&mut state), OUT_OF_BOUND, "{flavor:?} {addr:#x}");
            assert_eq!(store.run(&mut state), OUT_OF_BOUND, "{flavor:?} {addr:#x}");
        }
        state.registers[5] = end - 2;
        assert_eq!(store.run(&mut state), FELL_THROUGH);
        assert_eq!(load.run(&mut state), FELL_THROUGH);
        assert_eq!(state.registers[7], 9);
    }
}

#[test]
fn test_store_to_executable_page_is_rejected() {
    let exec = 0x3000u64;
    for flavor in Flavor::ALL {
        for width in WIDTHS {
            // Inside the page, and straddling into it from the page below.
            for addr in [exec, exec + 8, exec - 1] {
                let f = compile(flavor, |e| {
                    e.emit_store(Value::Reg(10), Value::Imm(0x7f), width)
                })
                .unwrap();
                let mut state = new_state();
                state.set_flags(exec, PAGE_SIZE as u64, FLAG_EXECUTABLE).unwrap();
                state.registers[10] = addr;
                let expected = if width == 1 && addr == exec - 1 {
                    FELL_THROUGH
                } else {
                    INVALID_PERMISSION
                };
                assert_eq!(f.run(&mut state), expected, "{flavor:?} w{width} {addr:#x}");
                if expected == INVALID_PERMISSION {
                    assert_eq!(state.flags[2], 0, "lower page dirtied");
                    assert_eq!(state.flags[3], FLAG_EXECUTABLE);
                    assert!(state.memory[0x2ff0..0x3010].iter().all(|&b| b == 0));
                }
            }
        }
    }
}

#[test]
fn test_loads_from_executable_page_succeed() {
    for flavor in Flavor::ALL {
        let f = compile(flavor, |e| e.emit_load(1, Value::Imm(0x3000), 4)).unwrap();
        let mut state = new_state();
        state.set_flags(0x3000, PAGE_SIZE as u64, FLAG_EXECUTABLE).unwrap();
        assert_eq!(f.run(&mut state), FELL_THROUGH);
        assert_eq!(state.frames[0], 1);
        assert_eq!(state.flags[3], FLAG_EXECUTABLE);
    }
}

#[test]
fn test_first_touch_zeroes_frame() {
    for flavor in Flavor::ALL {
        let f = compile(flavor, |e| e.emit_load(7, Value::Reg(5), 8)).unwrap();
        let mut state = new_state();
        let base = FRAME_SIZE * 2;
        state.memory[base..base + FRAME_SIZE].fill(0xaa);
        state.registers[5] = base as u64 + 16;
        assert_eq!(f.run(&mut state), FELL_THROUGH);
        assert_eq!(state.registers[7], 0);
        assert_eq!(state.frames[2], 1);
        assert!(state.memory[base..base + FRAME_SIZE].iter().all(|&b| b == 0));
        // Neighbours stay untouched.
        assert_eq!(state.frames[1], 0);
        assert_eq!(state.frames[3], 0);

        // Initialized frames are never refilled.
        state.memory[base + 16] = 0x5a;
        assert_eq!(f.run(&mut state), FELL_THROUGH);
        assert_eq!(state.registers[7], 0x5a);
    }
}

#[test]
fn test_access_across_frames_touches_both() {
    for flavor in Flavor::ALL {
        let f = compile(flavor, |e| e.emit_store(Value::Reg(5), Value::Reg(6), 8)).unwrap();
        let mut state = new_state();
        state.registers[5] = FRAME_SIZE as u64 - 4;
        state.registers[6] = PATTERN;
        assert_eq!(f.run(&mut state), FELL_THROUGH);
        assert_eq!(&state.frames[..3], &[1, 1, 0]);
        assert_eq!(
            state.memory[FRAME_SIZE - 4..FRAME_SIZE + 4],
            PATTERN.to_le_bytes()
        );
    }
}

#[test]
fn test_chaos_mode_fills_with_xorshift() {
    let seed = 0x0123_4567_89ab_cdef;
    for flavor in Flavor::ALL {
        let f = compile(flavor, |e| e.emit_load(7, Value::Imm(FRAME_SIZE as u64 + 8), 8)).unwrap();
        let mut state = new_state();
        state.chaos_mode = 1;
        state.chaos_seed = seed;
        assert_eq!(f.run(&mut state), FELL_THROUGH);

        let first = xorshift64(seed);
        assert_eq!(state.registers[7], xorshift64(first), "{flavor:?}");
        let start = FRAME_SIZE;
        assert_eq!(state.memory[start..start + 8], first.to_le_bytes());
        let last = (0..FRAME_SIZE / 8).fold(seed, |s, _| xorshift64(s));
        assert_eq!(state.chaos_seed, last);
        assert_eq!(
            state.memory[start + FRAME_SIZE - 8..start + FRAME_SIZE],
            last.to_le_bytes()
        );
    }
}

/// One access in the parity script.
#[derive(Clone, Copy, Debug)]
enum Access {
    Load { addr: u64, width: u8 },
    Store { addr: u64, width: u8, value: u64 },
}

#[test]
fn test_interp_and_aot_agree() {
    let script = [
        Access::Store { addr: 0x10, width: 8, value: PATTERN },
        Access::Load { addr: 0x12, width: 4 },
        Access::Store { addr: 0x2ffe, width: 4, value: 0x1122_3344 },
        Access::Store { addr: 0x5000, width: 2, value: 0xbeef },
        Access::Load { addr: 0x5000, width: 8 },
        Access::Store { addr: FRAME_SIZE as u64 * 5 - 1, width: 2, value: 0xabcd },
        Access::Load { addr: FRAME_SIZE as u64 * 5 - 2, width: 4 },
        Access::Load { addr: MAX_MEMORY as u64 - 1, width: 1 },
        Access::Load { addr: MAX_MEMORY as u64 - 1, width: 2 },
        Access::Store { addr: MAX_MEMORY as u64, width: 1, value: 1 },
        Access::Store { addr: u64::MAX, width: 8, value: 1 },
        Access::Load { addr: FRAME_SIZE as u64 * 9, width: 1 },
    ];
    let mut states = [new_state(), new_state()];
    for state in &mut states {
        state.set_flags(0x3000, PAGE_SIZE as u64, FLAG_EXECUTABLE).unwrap();
        state.set_flags(0x5000, PAGE_SIZE as u64, FLAG_EXECUTABLE).unwrap();
        state.chaos_mode = 1;
        state.chaos_seed = 42;
    }
    for access in script {
        let mut outcomes = Vec::new();
        for (flavor, state) in Flavor::ALL.into_iter().zip(&mut states) {
            let f = compile(flavor, |e| match access {
                Access::Load { addr, width } => e.emit_load(7, Value::Imm(addr), width),
                Access::Store { addr, width, value } => {
                    e.emit_store(Value::Imm(addr), Value::Imm(value), width)
                }
            })
            .unwrap();
            state.registers[7] = 0xdead;
            let exit = f.run(state);
            outcomes.push((exit, state.registers[7]));
        }
        assert_eq!(outcomes[0], outcomes[1], "{access:?}");
    }
    let [interp, aot] = &states;
    assert_eq!(interp.flags, aot.flags);
    assert_eq!(interp.frames, aot.frames);
    assert_eq!(interp.chaos_seed, aot.chaos_seed);
    assert!(interp.memory == aot.memory);
}

#[test]
fn test_interp_callbacks_preserve_live_registers() {
    let f = compile(Flavor::Interp, |e| {
        e.lock_register(Reg::R8)?;
        e.lock_register(Reg::Rcx)?;
        e.emit_store(Value::Reg(REG_TEMP1), Value::Reg(REG_TEMP2), 8)?;
        e.emit_load(5, Value::Reg(REG_TEMP1), 8)?;
        e.unlock_register(Reg::Rcx)?;
        e.unlock_register(Reg::R8)
    })
    .unwrap();
    let mut state = new_state();
    state.set_vreg(REG_TEMP1, 0x800);
    state.set_vreg(REG_TEMP2, PATTERN);
    state.registers[10] = 11;
    let mut machine = f.machine();
    machine.set_reg(Reg::R8, 0x88);
    machine.set_reg(Reg::Rcx, 0xcc);
    assert_eq!(machine.run(&mut state, 0), Ok(FELL_THROUGH));
    assert_eq!(machine.host_calls(), 2);
    assert_eq!(machine.reg(Reg::R8), 0x88);
    assert_eq!(machine.reg(Reg::Rcx), 0xcc);
    assert_eq!(state.registers[5], PATTERN);
    assert_eq!(state.vreg(REG_TEMP1), 0x800);
    assert_eq!(state.vreg(REG_TEMP2), PATTERN);
    assert_eq!(state.registers[10], 11);
}

#[test]
fn test_exit_from_nested_scratch_restores_stack() {
    // The fault exit leaves with `rcx` still pushed; the executor checks
    // the stack pointer and callee-saved registers on return.
    for flavor in Flavor::ALL {
        let f = compile(flavor, |e| {
            e.lock_register(Reg::Rcx)?;
            e.emit_load(7, Value::Reg(5), 8)?;
            e.unlock_register(Reg::Rcx)
        })
        .unwrap();
        let mut state = new_state();
        state.registers[5] = MAX_MEMORY as u64;
        assert_eq!(f.run(&mut state), OUT_OF_BOUND, "{flavor:?}");
    }
}

#[test]
fn test_aot_memory_with_physical_operands() {
    let f = compile(Flavor::Aot, |e| {
        e.lock_register(Reg::Rcx)?;
        e.lock_register(Reg::Rdx)?;
        e.emit_store(Value::Phys(Reg::Rcx), Value::Phys(Reg::Rdx), 8)?;
        e.emit_load(7, Value::Phys(Reg::Rcx), 8)?;
        e.unlock_register(Reg::Rdx)?;
        e.unlock_register(Reg::Rcx)
    })
    .unwrap();
    let mut state = new_state();
    let mut machine = f.machine();
    machine.set_reg(Reg::Rcx, 0x9000);
    machine.set_reg(Reg::Rdx, PATTERN);
    assert_eq!(machine.run(&mut state, f.entry), Ok(FELL_THROUGH));
    assert_eq!(state.registers[7], PATTERN);
    assert_eq!(machine.reg(Reg::Rcx), 0x9000);
    assert_eq!(machine.reg(Reg::Rdx), PATTERN);
}

#[test]
fn test_unsupported_width() {
    for flavor in Flavor::ALL {
        for width in [0, 3, 16] {
            let load = compile(flavor, |e| e.emit_load(5, Value::Imm(0), width));
            assert!(matches!(load, Err(EmitError::UnsupportedWidth(w)) if w == width));
            let store = compile(flavor, |e| e.emit_store(Value::Imm(0), Value::Imm(0), width));
            assert!(matches!(store, Err(EmitError::UnsupportedWidth(w)) if w == width));
        }
    }
}
