//! Multiply-high, division and remainder.
//!
//! All of these go through `rdx:rax`, so they claim `rax`, `rcx` and `rdx`
//! for the duration of the operation.

use super::{Emitter, Variant};
use crate::error::EmitError;
use crate::value::Value;
use crate::x86::{AluOp, Cond, Inst, Operand, Reg, RegImm, ShiftOp};

const WIDE: [Reg; 3] = [Reg::Rax, Reg::Rcx, Reg::Rdx];

impl<V: Variant> Emitter<V> {
    /// High 64 bits of the signed x signed product.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_mulh(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.mul_high(true, dest, a, b)
    }

    /// High 64 bits of the unsigned x unsigned product.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_mulhu(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.mul_high(false, dest, a, b)
    }

    /// High 64 bits of the signed `a` x unsigned `b` product.
    ///
    /// Computed as the unsigned high part minus `b` when `a` is negative.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_mulhsu(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let a = self.src(a)?;
        let b = self.src(b)?;
        self.with_scratch(&WIDE, |e| {
            e.load_pair(a, Reg::Rax, b, Reg::Rcx);
            // rdx = a < 0 ? b : 0
            e.emit(Inst::Mov {
                dst: Reg::Rdx,
                src: Reg::Rax,
            });
            e.emit(Inst::Shift {
                op: ShiftOp::Sar,
                dst: Reg::Rdx,
                amount: Some(63),
            });
            e.emit(Inst::Alu {
                op: AluOp::And,
                dst: Reg::Rdx,
                src: Operand::Reg(Reg::Rcx),
            });
            e.emit(Inst::Push { src: Reg::Rdx });
            e.emit(Inst::MulWide {
                src: Reg::Rcx,
                signed: false,
            });
            e.emit(Inst::Pop { dst: Reg::Rcx });
            e.emit(Inst::Alu {
                op: AluOp::Sub,
                dst: Reg::Rdx,
                src: Operand::Reg(Reg::Rcx),
            });
            e.store(dest, Reg::Rdx);
            Ok(())
        })
    }

    /// Signed division; `a / 0 = -1`, `i64::MIN / -1 = i64::MIN`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_div(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.divide(true, false, dest, a, b)
    }

    /// Unsigned division; `a / 0 = u64::MAX`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_divu(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.divide(false, false, dest, a, b)
    }

    /// Signed remainder; `a % 0 = a`, `i64::MIN % -1 = 0`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_rem(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.divide(true, true, dest, a, b)
    }

    /// Unsigned remainder; `a % 0 = a`.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands.
    pub fn emit_remu(&mut self, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        self.divide(false, true, dest, a, b)
    }

    fn mul_high(&mut self, signed: bool, dest: u8, a: Value, b: Value) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let a = self.src(a)?;
        let b = self.src(b)?;
        self.with_scratch(&WIDE, |e| {
            e.load_pair(a, Reg::Rax, b, Reg::Rcx);
            e.emit(Inst::MulWide {
                src: Reg::Rcx,
                signed,
            });
            e.store(dest, Reg::Rdx);
            Ok(())
        })
    }

    /// `div`/`idiv` fault on a zero divisor and on `i64::MIN / -1`; both are
    /// branched around. The zero divisor is checked first.
    fn divide(
        &mut self,
        signed: bool,
        remainder: bool,
        dest: u8,
        a: Value,
        b: Value,
    ) -> Result<(), EmitError> {
        let dest = self.loc(dest)?;
        let a = self.src(a)?;
        let b = self.src(b)?;
        self.with_scratch(&WIDE, |e| {
            let by_zero = e.asm.new_label();
            let done = e.asm.new_label();
            e.load_pair(a, Reg::Rax, b, Reg::Rcx);

            e.emit(Inst::Test {
                dst: Reg::Rcx,
                src: RegImm::Reg(Reg::Rcx),
            });
            e.emit(Inst::Jcc {
                cond: Cond::E,
                target: by_zero,
            });

            if signed {
                let normal = e.asm.new_label();
                e.emit(Inst::Alu {
                    op: AluOp::Cmp,
                    dst: Reg::Rcx,
                    src: Operand::Imm(-1),
                });
                e.emit(Inst::Jcc {
                    cond: Cond::Ne,
                    target: normal,
                });
                e.emit(Inst::MovImm {
                    dst: Reg::Rdx,
                    imm: i64::MIN as u64,
                });
                e.emit(Inst::Alu {
                    op: AluOp::Cmp,
                    dst: Reg::Rax,
                    src: Operand::Reg(Reg::Rdx),
                });
                e.emit(Inst::Jcc {
                    cond: Cond::Ne,
                    target: normal,
                });
                // Overflow: quotient is the dividend, remainder is zero.
                if remainder {
                    e.emit(Inst::Alu {
                        op: AluOp::Xor,
                        dst: Reg::Rdx,
                        src: Operand::Reg(Reg::Rdx),
                    });
                }
                e.emit(Inst::Jmp { target: done });
                e.asm.bind(normal)?;
                e.emit(Inst::Cqo);
            } else {
                e.emit(Inst::Alu {
                    op: AluOp::Xor,
                    dst: Reg::Rdx,
                    src: Operand::Reg(Reg::Rdx),
                });
            }
            e.emit(Inst::Div {
                src: Reg::Rcx,
                signed,
            });
            e.emit(Inst::Jmp { target: done });

            e.asm.bind(by_zero)?;
            if remainder {
                e.emit(Inst::Mov {
                    dst: Reg::Rdx,
                    src: Reg::Rax,
                });
            } else {
                e.emit(Inst::MovImm {
                    dst: Reg::Rax,
                    imm: u64::MAX,
                });
            }

            e.asm.bind(done)?;
            e.store(dest, if remainder { Reg::Rdx } else { Reg::Rax });
            Ok(())
        })
    }
}
