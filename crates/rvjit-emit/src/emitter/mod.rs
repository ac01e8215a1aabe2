//! Lowering shared by the interpreter-style and AOT emitters.
//!
//! Generated functions follow one frame convention:
//!
//! ```text
//! entry:   push rbx, rbp, r12-r15; sub rsp, 8; mov rbx, rdi
//!          load mapped registers from the state
//! body:    ...
//! stubs:   add rsp, 8 * depth; mov eax, code; jmp exit
//! exit:    store mapped registers; add rsp, 8; pop ...; ret
//! ```
//!
//! `rbx` holds the `MachineState` pointer for the whole function. Virtual
//! registers without a physical slot are accessed as `[rbx + 8 * vreg]`.
//!
//! # Module Structure
//!
//! - `alu` - Add/sub/logic/mul-low, shifts, rotates, comparisons
//! - `muldiv` - Multiply-high, division and remainder
//! - `bits` - Bit manipulation, extension, conditional select
//! - `control` - Labels, PC updates, cycle accounting, exits

mod alu;
mod bits;
mod control;
mod muldiv;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::EmitConfig;
use crate::error::EmitError;
use crate::layout::StateLayout;
use crate::ops::{BinaryOp, UnaryOp};
use crate::value::Value;
use crate::x86::{
    AluOp, Assembler, Inst, Label, Linked, Mem, Operand, Reg, RegisterTable, Size, link, lookup,
    mapped, reserved,
};
pub(crate) use control::ExitSource;
use rvjit_state::{ExitCode, NUM_VREGS};

/// Emitter flavour: register table and entry convention.
pub trait Variant {
    /// Name used in logs.
    const NAME: &'static str;
    /// Virtual-to-physical register table.
    const REGISTERS: &'static RegisterTable;
    /// Whether `Value::Phys` operands are accepted.
    const PHYS_OPERANDS: bool;
    /// Whether the prologue ends by jumping to the address passed in `rsi`.
    const INDIRECT_ENTRY: bool;
}

/// Where a virtual register lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Loc {
    Reg(Reg),
    Slot(Mem),
}

/// Resolved source operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Src {
    Reg(Reg),
    Mem(Mem),
    Imm(u64),
}

impl Src {
    const fn reg(self) -> Option<Reg> {
        match self {
            Self::Reg(r) => Some(r),
            _ => None,
        }
    }

    const fn is(self, reg: Reg) -> bool {
        matches!(self, Self::Reg(r) if r as u8 == reg as u8)
    }

    /// Direct ALU source, if no scratch register is needed.
    fn operand(self) -> Option<Operand> {
        match self {
            Self::Reg(r) => Some(Operand::Reg(r)),
            Self::Mem(m) => Some(Operand::Mem(m)),
            Self::Imm(i) => imm32(i).map(Operand::Imm),
        }
    }
}

impl From<Loc> for Src {
    fn from(loc: Loc) -> Self {
        match loc {
            Loc::Reg(r) => Self::Reg(r),
            Loc::Slot(m) => Self::Mem(m),
        }
    }
}

/// `imm` as a sign-extended 32-bit immediate, if it fits.
pub(crate) fn imm32(imm: u64) -> Option<i32> {
    i32::try_from(imm as i64).ok()
}

/// x86-64 code emitter for one translation unit.
pub struct Emitter<V: Variant> {
    pub(crate) asm: Assembler,
    pub(crate) config: EmitConfig,
    pub(crate) variant: V,
    /// Shared epilogue.
    exit: Label,
    stubs: Vec<(ExitSource, u32, Label)>,
    stub_index: FxHashMap<(ExitSource, u32), Label>,
}

impl<V: Variant> Emitter<V> {
    pub(crate) fn with_variant(config: EmitConfig, variant: V) -> Result<Self, EmitError> {
        config.validate()?;
        let mut asm = Assembler::new(config.max_labels);
        let exit = asm.new_label();
        debug!(
            variant = V::NAME,
            max_labels = config.max_labels,
            memory_size = config.memory_size,
            "created emitter"
        );
        let mut emitter = Self {
            asm,
            config,
            variant,
            exit,
            stubs: Vec::new(),
            stub_index: FxHashMap::default(),
        };
        emitter.emit_prologue();
        Ok(emitter)
    }

    /// The emitter configuration.
    #[must_use]
    pub const fn config(&self) -> &EmitConfig {
        &self.config
    }

    /// Instructions emitted so far.
    #[must_use]
    pub fn inst_count(&self) -> usize {
        self.asm.inst_count()
    }

    /// Mark `reg` as holding a live caller value.
    ///
    /// While locked, any operation that needs `reg` as scratch saves and
    /// restores it, and memory callbacks preserve it.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::ReservedRegister`] for `rbx` and `rsp`.
    pub fn lock_register(&mut self, reg: Reg) -> Result<(), EmitError> {
        check_not_reserved(reg)?;
        self.asm.mark(reg);
        Ok(())
    }

    /// Release a register locked with [`lock_register`](Self::lock_register).
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::NotLocked`] if `reg` is not locked.
    pub fn unlock_register(&mut self, reg: Reg) -> Result<(), EmitError> {
        if !self.asm.is_in_use(reg) {
            return Err(EmitError::NotLocked(reg));
        }
        self.asm.unmark(reg);
        Ok(())
    }

    /// `dest = value`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_mov(&mut self, dest: u8, value: Value) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let src = self.src(value)?;
        self.move_to(dest, src)
    }

    /// Emit any binary operation.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_binary(
        &mut self,
        op: BinaryOp,
        dest: u8,
        a: Value,
        b: Value,
    ) -> Result<(), EmitError> {
        match op {
            BinaryOp::Add => self.emit_add(dest, a, b),
            BinaryOp::Sub => self.emit_sub(dest, a, b),
            BinaryOp::And => self.emit_and(dest, a, b),
            BinaryOp::Or => self.emit_or(dest, a, b),
            BinaryOp::Xor => self.emit_xor(dest, a, b),
            BinaryOp::Mul => self.emit_mul(dest, a, b),
            BinaryOp::Mulh => self.emit_mulh(dest, a, b),
            BinaryOp::Mulhu => self.emit_mulhu(dest, a, b),
            BinaryOp::Mulhsu => self.emit_mulhsu(dest, a, b),
            BinaryOp::Div => self.emit_div(dest, a, b),
            BinaryOp::Divu => self.emit_divu(dest, a, b),
            BinaryOp::Rem => self.emit_rem(dest, a, b),
            BinaryOp::Remu => self.emit_remu(dest, a, b),
            BinaryOp::Sll => self.emit_sll(dest, a, b),
            BinaryOp::Srl => self.emit_srl(dest, a, b),
            BinaryOp::Sra => self.emit_sra(dest, a, b),
            BinaryOp::Rol => self.emit_rol(dest, a, b),
            BinaryOp::Ror => self.emit_ror(dest, a, b),
            BinaryOp::Eq => self.emit_eq(dest, a, b),
            BinaryOp::Lt => self.emit_lt(dest, a, b),
            BinaryOp::Ltu => self.emit_ltu(dest, a, b),
            BinaryOp::Clmul => self.emit_clmul(dest, a, b),
            BinaryOp::Clmulh => self.emit_clmulh(dest, a, b),
            BinaryOp::Clmulr => self.emit_clmulr(dest, a, b),
        }
    }

    /// Emit any unary operation.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_unary(&mut self, op: UnaryOp, dest: u8, a: Value) -> Result<(), EmitError> {
        match op {
            UnaryOp::Not => self.emit_not(dest, a),
            UnaryOp::Clz => self.emit_clz(dest, a),
            UnaryOp::Ctz => self.emit_ctz(dest, a),
            UnaryOp::Cpop => self.emit_cpop(dest, a),
            UnaryOp::OrcB => self.emit_orc_b(dest, a),
            UnaryOp::Rev8 => self.emit_rev8(dest, a),
        }
    }

    // ===== Operand resolution =====

    pub(crate) fn loc(&self, vreg: u8) -> Result<Loc, EmitError> {
        if vreg as usize >= NUM_VREGS {
            return Err(EmitError::InvalidRegister(vreg));
        }
        Ok(lookup(V::REGISTERS, vreg).map_or_else(
            || Loc::Slot(Mem::base(reserved::STATE_PTR, StateLayout::vreg(vreg))),
            Loc::Reg,
        ))
    }

    pub(crate) fn src(&self, value: Value) -> Result<Src, EmitError> {
        match value {
            Value::Reg(vreg) => self.loc(vreg).map(Src::from),
            Value::Imm(imm) => Ok(Src::Imm(imm)),
            Value::Phys(reg) => {
                if !V::PHYS_OPERANDS {
                    return Err(EmitError::PhysicalOperand(reg));
                }
                check_not_reserved(reg)?;
                Ok(Src::Reg(reg))
            }
        }
    }

    // ===== Scratch registers =====

    /// Run `f` with `regs` claimed as scratch.
    ///
    /// Registers held by the caller are pushed first and popped afterwards,
    /// in reverse order, on every path out of `f`.
    pub(crate) fn with_scratch<T>(
        &mut self,
        regs: &[Reg],
        f: impl FnOnce(&mut Self) -> Result<T, EmitError>,
    ) -> Result<T, EmitError> {
        let mut saved = [false; 3];
        for (slot, &reg) in saved.iter_mut().zip(regs) {
            *slot = self.asm.acquire(reg);
        }
        let result = f(self);
        for (&reg, &was_saved) in regs.iter().zip(&saved).rev() {
            self.asm.release(reg, was_saved);
        }
        result
    }

    // ===== Data movement =====

    pub(crate) fn emit(&mut self, inst: Inst) {
        self.asm.emit(inst);
    }

    /// `dst = src`, skipping self-moves.
    pub(crate) fn load(&mut self, dst: Reg, src: Src) {
        match src {
            Src::Reg(r) if r == dst => {}
            Src::Reg(r) => self.emit(Inst::Mov { dst, src: r }),
            Src::Mem(mem) => self.emit(Inst::Load {
                dst,
                mem,
                size: Size::Qword,
            }),
            Src::Imm(imm) => self.emit(Inst::MovImm { dst, imm }),
        }
    }

    /// Load two operands into two registers without clobbering either.
    pub(crate) fn load_pair(&mut self, x: Src, rx: Reg, y: Src, ry: Reg) {
        let x_clobbers_y = y.is(rx);
        let y_clobbers_x = x.is(ry);
        if x_clobbers_y && y_clobbers_x {
            if rx != ry {
                self.emit(Inst::Xchg { a: rx, b: ry });
            }
        } else if x_clobbers_y {
            self.load(ry, y);
            self.load(rx, x);
        } else {
            self.load(rx, x);
            self.load(ry, y);
        }
    }

    /// Write a full register to a virtual register location.
    pub(crate) fn store(&mut self, dest: Loc, reg: Reg) {
        match dest {
            Loc::Reg(d) => {
                if d != reg {
                    self.emit(Inst::Mov { dst: d, src: reg });
                }
            }
            Loc::Slot(mem) => self.emit(Inst::Store {
                mem,
                src: reg,
                size: Size::Qword,
            }),
        }
    }

    pub(crate) fn move_to(&mut self, dest: Loc, src: Src) -> Result<(), EmitError> {
        match (dest, src) {
            (Loc::Reg(d), src) => {
                self.load(d, src);
                Ok(())
            }
            (Loc::Slot(mem), Src::Mem(from)) if mem == from => Ok(()),
            (Loc::Slot(mem), Src::Reg(r)) => {
                self.store(Loc::Slot(mem), r);
                Ok(())
            }
            (Loc::Slot(mem), Src::Imm(imm)) => match imm32(imm) {
                Some(imm) => {
                    self.emit(Inst::StoreImm {
                        mem,
                        imm,
                        size: Size::Qword,
                    });
                    Ok(())
                }
                None => self.move_via_scratch(dest, src),
            },
            (Loc::Slot(_), Src::Mem(_)) => self.move_via_scratch(dest, src),
        }
    }

    fn move_via_scratch(&mut self, dest: Loc, src: Src) -> Result<(), EmitError> {
        let [s] = pick_scratch(&[src])?;
        self.with_scratch(&[s], |e| {
            e.load(s, src);
            e.store(dest, s);
            Ok(())
        })
    }

    /// Compute into `dest` in place: `dest` itself if it has a register,
    /// else a scratch register that is stored back afterwards.
    ///
    /// `body` receives the working register after `a` was loaded into it.
    pub(crate) fn in_place(
        &mut self,
        dest: Loc,
        a: Src,
        body: impl FnOnce(&mut Self, Reg) -> Result<(), EmitError>,
    ) -> Result<(), EmitError> {
        match dest {
            Loc::Reg(d) => {
                self.load(d, a);
                body(self, d)
            }
            Loc::Slot(_) => {
                let [s] = pick_scratch(&[a])?;
                self.with_scratch(&[s], |e| {
                    e.load(s, a);
                    body(e, s)?;
                    e.store(dest, s);
                    Ok(())
                })
            }
        }
    }

    // ===== Frame =====

    fn emit_prologue(&mut self) {
        for reg in reserved::CALLEE_SAVED {
            self.emit(Inst::Push { src: reg });
        }
        // Six pushes plus the return address: pad rsp back to 16 bytes.
        self.emit(Inst::Alu {
            op: AluOp::Sub,
            dst: Reg::Rsp,
            src: Operand::Imm(8),
        });
        self.emit(Inst::Mov {
            dst: reserved::STATE_PTR,
            src: Reg::Rdi,
        });
        if V::INDIRECT_ENTRY {
            self.emit(Inst::Mov {
                dst: Reg::Rax,
                src: Reg::Rsi,
            });
        }
        for (vreg, reg) in mapped(V::REGISTERS) {
            self.emit(Inst::Load {
                dst: reg,
                mem: Mem::base(reserved::STATE_PTR, StateLayout::vreg(vreg)),
                size: Size::Qword,
            });
        }
        if V::INDIRECT_ENTRY {
            self.emit(Inst::JmpReg { target: Reg::Rax });
        }
        self.asm.reset_depth();
    }

    fn emit_epilogue(&mut self) -> Result<(), EmitError> {
        self.asm.bind(self.exit)?;
        for (vreg, reg) in mapped(V::REGISTERS) {
            self.emit(Inst::Store {
                mem: Mem::base(reserved::STATE_PTR, StateLayout::vreg(vreg)),
                src: reg,
                size: Size::Qword,
            });
        }
        self.emit(Inst::Alu {
            op: AluOp::Add,
            dst: Reg::Rsp,
            src: Operand::Imm(8),
        });
        for reg in reserved::CALLEE_SAVED.into_iter().rev() {
            self.emit(Inst::Pop { dst: reg });
        }
        self.emit(Inst::Ret);
        Ok(())
    }

    /// Close the body: fall-through exit, out-of-line `trailer` code, exit
    /// stubs, epilogue.
    fn emit_tail(
        &mut self,
        trailer: impl FnOnce(&mut Self) -> Result<(), EmitError>,
    ) -> Result<(), EmitError> {
        self.exit_with(ExitSource::Code(ExitCode::DecodeTrace));
        trailer(self)?;
        self.emit_exit_stubs()?;
        self.emit_epilogue()
    }

    /// Close the body and link.
    ///
    /// # Errors
    ///
    /// Fails if a label was placed twice or a referenced label was never
    /// placed.
    pub(crate) fn link_with(
        mut self,
        trailer: impl FnOnce(&mut Self) -> Result<(), EmitError>,
    ) -> Result<Linked, EmitError> {
        self.emit_tail(trailer)?;
        link(self.asm)
    }
}

const fn check_not_reserved(reg: Reg) -> Result<(), EmitError> {
    match reg {
        Reg::Rbx | Reg::Rsp => Err(EmitError::ReservedRegister(reg)),
        _ => Ok(()),
    }
}

/// Scratch registers not used by any operand, in preference order.
pub(crate) fn free_scratch(avoid: &[Src]) -> impl Iterator<Item = Reg> + '_ {
    reserved::SCRATCH
        .into_iter()
        .filter(move |&r| !avoid.iter().any(|s| s.reg() == Some(r)))
}

/// First `N` scratch registers not used by any operand.
pub(crate) fn pick_scratch<const N: usize>(avoid: &[Src]) -> Result<[Reg; N], EmitError> {
    let mut out = [Reg::Rax; N];
    let mut free = free_scratch(avoid);
    for slot in &mut out {
        *slot = free.next().ok_or(EmitError::ScratchExhausted)?;
    }
    Ok(out)
}
