//! Interpreter-style emitter.
//!
//! Pins `ra`, `sp`, `a0`, `a1` to callee-saved registers and the first two
//! temporaries to `rsi`/`rdi`. Guest memory is reached through the host
//! callbacks in [`MemoryCallbacks`], which own bounds, permission and frame
//! handling.

use rvjit_state::MachineState;
use tracing::debug;

use crate::config::{EmitConfig, MemoryCallbacks};
use crate::emitter::{Emitter, ExitSource, Variant};
use crate::error::EmitError;
use crate::value::Value;
use crate::x86::{
    AluOp, Cond, INTERP_REGISTER_MAP, Inst, Linked, Operand, Reg, RegImm, RegisterTable, Size,
    mapped, reserved,
};

/// Interpreter-style flavour.
#[derive(Clone, Copy, Debug)]
pub struct Interp {
    callbacks: MemoryCallbacks,
}

impl Variant for Interp {
    const NAME: &'static str = "interp";
    const REGISTERS: &'static RegisterTable = &INTERP_REGISTER_MAP;
    const PHYS_OPERANDS: bool = false;
    const INDIRECT_ENTRY: bool = false;
}

/// Emitter used by the interpreter's dispatch loop.
///
/// The generated function has the signature
/// `extern "C" fn(*mut MachineState) -> u32`.
pub type InterpEmitter = Emitter<Interp>;

/// Native entry point of an interpreter-emitter function.
pub type InterpEntry = unsafe extern "C" fn(*mut MachineState) -> u32;

impl Emitter<Interp> {
    /// Start a translation unit.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(config: EmitConfig, callbacks: MemoryCallbacks) -> Result<Self, EmitError> {
        Self::with_variant(config, Interp { callbacks })
    }

    /// Callback addresses embedded in memory accesses.
    #[must_use]
    pub const fn callbacks(&self) -> &MemoryCallbacks {
        &self.variant.callbacks
    }

    /// `dest = zext(load(addr, width))` through the load callback.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::UnsupportedWidth`] unless `width` is 1, 2, 4
    /// or 8, or an error for invalid operands.
    pub fn emit_load(&mut self, dest: u8, addr: Value, width: u8) -> Result<(), EmitError> {
        check_width(width)?;
        let dest = self.loc(dest)?;
        let addr = self.src(addr)?;
        let target = self.variant.callbacks.load;
        self.with_scratch(&[Reg::Rax, Reg::Rcx, Reg::Rdx], |e| {
            let saved = e.save_live();
            // `addr` may sit in `rdi`, so it is moved before the state pointer.
            e.load(Reg::Rsi, addr);
            e.emit(Inst::Mov {
                dst: Reg::Rdi,
                src: reserved::STATE_PTR,
            });
            e.emit(Inst::MovImm {
                dst: Reg::Rdx,
                imm: u64::from(width),
            });
            e.call_host(target);
            e.restore_live(&saved);
            e.check_exit();
            e.store(dest, Reg::Rdx);
            Ok(())
        })
    }

    /// `store(addr, value, width)` through the store callback.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::UnsupportedWidth`] unless `width` is 1, 2, 4
    /// or 8, or an error for invalid operands.
    pub fn emit_store(&mut self, addr: Value, value: Value, width: u8) -> Result<(), EmitError> {
        check_width(width)?;
        let addr = self.src(addr)?;
        let value = self.src(value)?;
        let target = self.variant.callbacks.store;
        self.with_scratch(&[Reg::Rax, Reg::Rcx, Reg::Rdx], |e| {
            let saved = e.save_live();
            e.load_pair(addr, Reg::Rsi, value, Reg::Rdx);
            e.emit(Inst::Mov {
                dst: Reg::Rdi,
                src: reserved::STATE_PTR,
            });
            e.emit(Inst::MovImm {
                dst: Reg::Rcx,
                imm: u64::from(width),
            });
            e.call_host(target);
            e.restore_live(&saved);
            e.check_exit();
            Ok(())
        })
    }

    /// Close the function and link it.
    ///
    /// # Errors
    ///
    /// Fails if a label was placed twice or a referenced label was never
    /// placed.
    pub fn finish(self) -> Result<Linked, EmitError> {
        debug!(insts = self.inst_count(), "finishing interpreter function");
        self.link_with(|_| Ok(()))
    }

    /// Push caller-saved registers that hold mapped guest registers or are
    /// locked by the caller. Scratch registers are already handled.
    fn save_live(&mut self) -> Vec<Reg> {
        let in_use = self.asm.in_use();
        let saved: Vec<Reg> = Reg::ALL
            .into_iter()
            .filter(|&r| r.is_caller_saved() && !matches!(r, Reg::Rax | Reg::Rcx | Reg::Rdx))
            .filter(|&r| in_use.contains(r) || mapped(Interp::REGISTERS).any(|(_, m)| m == r))
            .collect();
        for &reg in &saved {
            self.emit(Inst::Push { src: reg });
        }
        saved
    }

    fn restore_live(&mut self, saved: &[Reg]) {
        for &reg in saved.iter().rev() {
            self.emit(Inst::Pop { dst: reg });
        }
    }

    /// Call an absolute host address with `rsp` 16-byte aligned.
    fn call_host(&mut self, target: u64) {
        let pad = self.asm.depth() % 2 == 1;
        if pad {
            self.emit(Inst::Alu {
                op: AluOp::Sub,
                dst: Reg::Rsp,
                src: Operand::Imm(8),
            });
        }
        self.emit(Inst::MovImm {
            dst: Reg::Rax,
            imm: target,
        });
        self.emit(Inst::CallReg { target: Reg::Rax });
        if pad {
            self.emit(Inst::Alu {
                op: AluOp::Add,
                dst: Reg::Rsp,
                src: Operand::Imm(8),
            });
        }
    }

    /// Leave with the callback's exit code if it is non-zero.
    fn check_exit(&mut self) {
        self.emit(Inst::Test {
            dst: Reg::Rax,
            src: RegImm::Reg(Reg::Rax),
        });
        self.exit_if(Cond::Ne, ExitSource::Rax);
    }
}

pub(crate) const fn check_width(width: u8) -> Result<Size, EmitError> {
    match Size::from_width(width) {
        Some(size) => Ok(size),
        None => Err(EmitError::UnsupportedWidth(width)),
    }
}
