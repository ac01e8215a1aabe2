//! Bit manipulation, sign/zero extension and conditional select.

use super::{Emitter, Loc, Src, Variant, free_scratch};
use crate::error::EmitError;
use crate::value::Value;
use crate::x86::{AluOp, Cond, Inst, Operand, Reg, RegImm, ShiftOp};

/// Carry-less multiply flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Clmul {
    /// Low half of the product.
    Low,
    /// High half.
    High,
    /// Bits 126..63.
    Reversed,
}

impl<V: Variant> Emitter<V> {
    /// `dest = !a`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_not(&mut self, dest: u8, a: Value) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let a = self.src(a)?;
        self.in_place(dest, a, |e, r| {
            e.emit(Inst::Not { dst: r });
            Ok(())
        })
    }

    /// Count leading zeros; 64 for zero.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_clz(&mut self, dest: u8, a: Value) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let a = self.src(a)?;
        self.in_place(dest, a, |e, r| {
            e.bit_scan(r, |e| {
                e.emit(Inst::Bsr { dst: r, src: r });
                // 63 - index
                e.emit(Inst::Alu {
                    op: AluOp::Xor,
                    dst: r,
                    src: Operand::Imm(63),
                });
            })
        })
    }

    /// Count trailing zeros; 64 for zero.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_ctz(&mut self, dest: u8, a: Value) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let a = self.src(a)?;
        self.in_place(dest, a, |e, r| {
            e.bit_scan(r, |e| e.emit(Inst::Bsf { dst: r, src: r }))
        })
    }

    /// Population count.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_cpop(&mut self, dest: u8, a: Value) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let a = self.src(a)?;
        self.in_place(dest, a, |e, r| {
            e.emit(Inst::Popcnt { dst: r, src: r });
            Ok(())
        })
    }

    /// Byte reverse.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_rev8(&mut self, dest: u8, a: Value) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let a = self.src(a)?;
        self.in_place(dest, a, |e, r| {
            e.emit(Inst::Bswap { dst: r });
            Ok(())
        })
    }

    /// Each byte becomes `0xff` if it is non-zero, else `0x00`.
    ///
    /// Unrolled over the eight bytes: test the low byte of a rotating copy
    /// of `a`, set the matching byte of the result, rotate both by 8.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_orc_b(&mut self, dest: u8, a: Value) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let a = self.src(a)?;
        let operands = [a];
        let mut free = free_scratch(&operands);
        let result = match dest {
            Loc::Reg(d) => d,
            Loc::Slot(_) => free.next().ok_or(EmitError::ScratchExhausted)?,
        };
        let copy = free.next().ok_or(EmitError::ScratchExhausted)?;
        let regs: Vec<Reg> = match dest {
            Loc::Reg(_) => vec![copy],
            Loc::Slot(_) => vec![result, copy],
        };

        self.with_scratch(&regs, |e| {
            e.load(copy, a);
            e.emit(Inst::Alu {
                op: AluOp::Xor,
                dst: result,
                src: Operand::Reg(result),
            });
            for _ in 0..8 {
                let skip = e.asm.new_label();
                e.emit(Inst::Test {
                    dst: copy,
                    src: RegImm::Imm(0xff),
                });
                e.emit(Inst::Jcc {
                    cond: Cond::E,
                    target: skip,
                });
                e.emit(Inst::Alu {
                    op: AluOp::Or,
                    dst: result,
                    src: Operand::Imm(0xff),
                });
                e.asm.bind(skip)?;
                for reg in [copy, result] {
                    e.emit(Inst::Shift {
                        op: ShiftOp::Ror,
                        dst: reg,
                        amount: Some(8),
                    });
                }
            }
            e.store(dest, result);
            Ok(())
        })
    }

    /// Carry-less multiply, low half.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_clmul(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.clmul(Clmul::Low, dest, a, b)
    }

    /// Carry-less multiply, high half.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_clmulh(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.clmul(Clmul::High, dest, a, b)
    }

    /// Carry-less multiply, reversed.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_clmulr(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.clmul(Clmul::Reversed, dest, a, b)
    }

    /// Sign-extend the low `bits` bits of `src`.
    ///
    /// `bits` may be an immediate or a runtime value; 0 and 64 leave the
    /// value unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_sext(&mut self, dest: u8, src: Value, bits: Value) -> Result<(), EmitError> {
        self.extend(true, dest, src, bits)
    }

    /// Zero-extend the low `bits` bits of `src`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_zext(&mut self, dest: u8, src: Value, bits: Value) -> Result<(), EmitError> {
        self.extend(false, dest, src, bits)
    }

    /// `dest = cond == 1 ? when_true : when_false`.
    ///
    /// A constant condition emits only the selected move.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_cond(
        &mut self,
        dest: u8,
        cond: Value,
        when_true: Value,
        when_false: Value,
    ) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let cond = self.src(cond)?;
        let when_true = self.src(when_true)?;
        let when_false = self.src(when_false)?;

        if let Src::Imm(c) = cond {
            return self.move_to(dest, if c == 1 { when_true } else { when_false });
        }
        let else_ = self.asm.new_label();
        let done = self.asm.new_label();
        self.compare_one(cond)?;
        self.emit(Inst::Jcc {
            cond: Cond::Ne,
            target: else_,
        });
        self.move_to(dest, when_true)?;
        self.emit(Inst::Jmp { target: done });
        self.asm.bind(else_)?;
        self.move_to(dest, when_false)?;
        self.asm.bind(done)
    }

    /// `test r, r; je zero; scan; jmp done; zero: r = 64; done:`.
    fn bit_scan(&mut self, r: Reg, scan: impl FnOnce(&mut Self)) -> Result<(), EmitError> {
        let zero = self.asm.new_label();
        let done = self.asm.new_label();
        self.emit(Inst::Test {
            dst: r,
            src: RegImm::Reg(r),
        });
        self.emit(Inst::Jcc {
            cond: Cond::E,
            target: zero,
        });
        scan(self);
        self.emit(Inst::Jmp { target: done });
        self.asm.bind(zero)?;
        self.emit(Inst::MovImm { dst: r, imm: 64 });
        self.asm.bind(done)
    }

    /// Unrolled shift-and-xor over the bits of `b`.
    fn clmul(&mut self, kind: Clmul, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let a = self.src(a)?;
        let b = self.src(b)?;

        let operands = [a, b];
        let mut free = free_scratch(&operands);
        let result = match dest {
            Loc::Reg(d) => d,
            Loc::Slot(_) => free.next().ok_or(EmitError::ScratchExhausted)?,
        };
        let shifted = free.next().ok_or(EmitError::ScratchExhausted)?;
        // `b` is read bit by bit, so it must survive clearing the result.
        let multiplier = match b {
            Src::Reg(r) if r != result => None,
            _ => Some(free.next().ok_or(EmitError::ScratchExhausted)?),
        };
        let mut regs = Vec::with_capacity(3);
        if matches!(dest, Loc::Slot(_)) {
            regs.push(result);
        }
        regs.push(shifted);
        regs.extend(multiplier);

        self.with_scratch(&regs, |e| {
            e.load(shifted, a);
            let bits = match (multiplier, b) {
                (Some(m), _) => {
                    e.load(m, b);
                    m
                }
                (None, Src::Reg(r)) => r,
                (None, _) => return Err(EmitError::ScratchExhausted),
            };
            e.emit(Inst::Alu {
                op: AluOp::Xor,
                dst: result,
                src: Operand::Reg(result),
            });

            let steps: Vec<(u8, bool)> = match kind {
                // bit i: result ^= a << i
                Clmul::Low => (0..64).map(|i| (i, i != 0)).collect(),
                // bit i: result ^= a >> (64 - i)
                Clmul::High => (1..64).rev().map(|i| (i, true)).collect(),
                // bit i: result ^= a >> (63 - i)
                Clmul::Reversed => (0..64).rev().map(|i| (i, i != 63)).collect(),
            };
            let shift = if kind == Clmul::Low {
                ShiftOp::Shl
            } else {
                ShiftOp::Shr
            };
            for (bit, advance) in steps {
                if advance {
                    e.emit(Inst::Shift {
                        op: shift,
                        dst: shifted,
                        amount: Some(1),
                    });
                }
                let skip = e.asm.new_label();
                e.emit(Inst::Bt { src: bits, bit });
                e.emit(Inst::Jcc {
                    cond: Cond::Ae,
                    target: skip,
                });
                e.emit(Inst::Alu {
                    op: AluOp::Xor,
                    dst: result,
                    src: Operand::Reg(shifted),
                });
                e.asm.bind(skip)?;
            }
            e.store(dest, result);
            Ok(())
        })
    }

    fn extend(&mut self, signed: bool, dest: u8, src: Value, bits: Value) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let src = self.src(src)?;
        let bits = self.src(bits)?;
        let right = if signed { ShiftOp::Sar } else { ShiftOp::Shr };

        if let Src::Imm(n) = bits {
            if n == 0 || n >= 64 {
                return self.move_to(dest, src);
            }
            return self.in_place(dest, src, |e, r| {
                if n == 32 {
                    e.emit(if signed {
                        Inst::Movsxd { dst: r, src: r }
                    } else {
                        Inst::Mov32 { dst: r, src: r }
                    });
                } else {
                    let amount = (64 - n) as u8;
                    for op in [ShiftOp::Shl, right] {
                        e.emit(Inst::Shift {
                            op,
                            dst: r,
                            amount: Some(amount),
                        });
                    }
                }
                Ok(())
            });
        }

        // rcx = 64 - bits; x86 masks the count, so 0 and 64 both shift by 0.
        let (work, regs): (Reg, &[Reg]) = match dest {
            Loc::Reg(d) => (d, &[Reg::Rcx]),
            Loc::Slot(_) => (Reg::Rax, &[Reg::Rcx, Reg::Rax]),
        };
        self.with_scratch(regs, |e| {
            e.load_pair(src, work, bits, Reg::Rcx);
            e.emit(Inst::Neg { dst: Reg::Rcx });
            e.emit(Inst::Alu {
                op: AluOp::Add,
                dst: Reg::Rcx,
                src: Operand::Imm(64),
            });
            for op in [ShiftOp::Shl, right] {
                e.emit(Inst::Shift {
                    op,
                    dst: work,
                    amount: None,
                });
            }
            e.store(dest, work);
            Ok(())
        })
    }
}
