//! Add/sub/logic/mul-low, shifts, rotates and comparisons.

use super::{Emitter, Loc, Src, Variant, free_scratch, pick_scratch};
use crate::error::EmitError;
use crate::value::Value;
use crate::x86::{AluOp, Cond, Inst, Operand, Reg, RegMem, ShiftOp};

/// Two-operand, destination-is-first-source operation.
#[derive(Clone, Copy, Debug)]
enum Arith {
    Alu(AluOp),
    Mul,
}

impl Arith {
    const fn inst(self, dst: Reg, src: Operand) -> Inst {
        match (self, src) {
            (Self::Alu(op), src) => Inst::Alu { op, dst, src },
            (Self::Mul, Operand::Reg(reg)) => Inst::Imul {
                dst,
                src: RegMem::Reg(reg),
            },
            (Self::Mul, Operand::Mem(mem)) => Inst::Imul {
                dst,
                src: RegMem::Mem(mem),
            },
            (Self::Mul, Operand::Imm(imm)) => Inst::ImulImm { dst, src: dst, imm },
        }
    }
}

impl<V: Variant> Emitter<V> {
    /// `dest = a + b`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_add(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.arith(Arith::Alu(AluOp::Add), dest, a, b)
    }

    /// `dest = a - b`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_sub(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.arith(Arith::Alu(AluOp::Sub), dest, a, b)
    }

    /// `dest = a & b`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_and(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.arith(Arith::Alu(AluOp::And), dest, a, b)
    }

    /// `dest = a | b`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_or(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.arith(Arith::Alu(AluOp::Or), dest, a, b)
    }

    /// `dest = a ^ b`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_xor(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.arith(Arith::Alu(AluOp::Xor), dest, a, b)
    }

    /// `dest = low64(a * b)`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_mul(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.arith(Arith::Mul, dest, a, b)
    }

    /// `dest = a << (b & 63)`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_sll(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.shift(ShiftOp::Shl, dest, a, b)
    }

    /// Logical `dest = a >> (b & 63)`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_srl(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.shift(ShiftOp::Shr, dest, a, b)
    }

    /// Arithmetic `dest = a >> (b & 63)`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_sra(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.shift(ShiftOp::Sar, dest, a, b)
    }

    /// `dest = a.rotate_left(b & 63)`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_rol(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.shift(ShiftOp::Rol, dest, a, b)
    }

    /// `dest = a.rotate_right(b & 63)`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_ror(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.shift(ShiftOp::Ror, dest, a, b)
    }

    /// `dest = (a == b) as u64`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_eq(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.compare(Cond::E, dest, a, b)
    }

    /// `dest = (a < b) as u64`, signed.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_lt(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.compare(Cond::L, dest, a, b)
    }

    /// `dest = (a < b) as u64`, unsigned.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_ltu(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.compare(Cond::B, dest, a, b)
    }

    fn arith(&mut self, op: Arith, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let a = self.src(a)?;
        let b = self.src(b)?;
        let direct = b.operand();

        match dest {
            // `b` is captured before `dest` is overwritten by `a`.
            Loc::Reg(d) if direct.is_none() || (b.is(d) && !a.is(d)) => {
                let [s] = pick_scratch(&[a, b])?;
                self.with_scratch(&[s], |e| {
                    e.load(s, b);
                    e.load(d, a);
                    e.emit(op.inst(d, Operand::Reg(s)));
                    Ok(())
                })
            }
            Loc::Reg(d) => {
                let src = direct.ok_or(EmitError::ScratchExhausted)?;
                self.load(d, a);
                self.emit(op.inst(d, src));
                Ok(())
            }
            Loc::Slot(_) => match direct {
                Some(src) => {
                    let [s] = pick_scratch(&[a, b])?;
                    self.with_scratch(&[s], |e| {
                        e.load(s, a);
                        e.emit(op.inst(s, src));
                        e.store(dest, s);
                        Ok(())
                    })
                }
                None => {
                    let [s, t] = pick_scratch(&[a, b])?;
                    self.with_scratch(&[s, t], |e| {
                        e.load(t, b);
                        e.load(s, a);
                        e.emit(op.inst(s, Operand::Reg(t)));
                        e.store(dest, s);
                        Ok(())
                    })
                }
            },
        }
    }

    fn shift(&mut self, op: ShiftOp, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let a = self.src(a)?;
        let b = self.src(b)?;

        if let Src::Imm(amount) = b {
            let amount = (amount & 63) as u8;
            return self.in_place(dest, a, |e, r| {
                if amount != 0 {
                    e.emit(Inst::Shift {
                        op,
                        dst: r,
                        amount: Some(amount),
                    });
                }
                Ok(())
            });
        }

        // x86 masks the count in cl to 6 bits, as RISC-V does.
        match dest {
            Loc::Reg(d) if !a.is(Reg::Rcx) => self.with_scratch(&[Reg::Rcx], |e| {
                e.load(Reg::Rcx, b);
                e.load(d, a);
                e.emit(Inst::Shift {
                    op,
                    dst: d,
                    amount: None,
                });
                Ok(())
            }),
            _ => self.with_scratch(&[Reg::Rcx, Reg::Rax], |e| {
                e.load_pair(a, Reg::Rax, b, Reg::Rcx);
                e.emit(Inst::Shift {
                    op,
                    dst: Reg::Rax,
                    amount: None,
                });
                e.store(dest, Reg::Rax);
                Ok(())
            }),
        }
    }

    fn compare(&mut self, cond: Cond, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let a = self.src(a)?;
        let b = self.src(b)?;

        let operands = [a, b];
        let mut free = free_scratch(&operands);
        let result = free.next().ok_or(EmitError::ScratchExhausted)?;
        let stage_a = match a {
            Src::Reg(_) => None,
            _ => Some(free.next().ok_or(EmitError::ScratchExhausted)?),
        };
        let stage_b = match b.operand() {
            Some(_) => None,
            None => Some(free.next().ok_or(EmitError::ScratchExhausted)?),
        };
        let regs: Vec<Reg> = [Some(result), stage_a, stage_b]
            .into_iter()
            .flatten()
            .collect();

        self.with_scratch(&regs, |e| {
            e.emit(Inst::Alu {
                op: AluOp::Xor,
                dst: result,
                src: Operand::Reg(result),
            });
            let lhs = match (a, stage_a) {
                (Src::Reg(r), _) => r,
                (_, Some(t)) => {
                    e.load(t, a);
                    t
                }
                (_, None) => return Err(EmitError::ScratchExhausted),
            };
            let rhs = match (b.operand(), stage_b) {
                (Some(operand), _) => operand,
                (None, Some(u)) => {
                    e.load(u, b);
                    Operand::Reg(u)
                }
                (None, None) => return Err(EmitError::ScratchExhausted),
            };
            e.emit(Inst::Alu {
                op: AluOp::Cmp,
                dst: lhs,
                src: rhs,
            });
            e.emit(Inst::Setcc { cond, dst: result });
            e.store(dest, result);
            Ok(())
        })
    }
}
