//! Labels, program-counter updates, cycle accounting and exits.

use rvjit_state::{ExitCode, REG_PC};
use tracing::trace;

use super::{Emitter, Src, Variant};
use crate::error::EmitError;
use crate::layout::StateLayout;
use crate::value::{PcUpdate, Value};
use crate::x86::{AluOp, Cond, Inst, Label, Mem, Operand, Reg, RegImm, Size, reserved};

/// Where an exit stub takes the exit code from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ExitSource {
    Code(ExitCode),
    /// Already in `rax` (interpreter callbacks).
    Rax,
    /// In `rdx` (AOT memory subroutines).
    Rdx,
}

impl<V: Variant> Emitter<V> {
    /// Place dynamic label `id` at the current position.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::LabelOutOfRange`] for an index beyond the label
    /// table and [`EmitError::DuplicateLabel`] if it was already placed.
    pub fn place_label(&mut self, id: u32) -> Result<(), EmitError> {
        let label = self.asm.dynamic_label(id)?;
        self.asm.bind(label)
    }

    /// Update the guest program counter.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands or label indices.
    pub fn emit_pc(&mut self, update: PcUpdate) -> Result<(), EmitError> {
        match update {
            PcUpdate::Write(value) => self.write_pc(value),
            PcUpdate::Label { label, pc } => {
                let target = self.asm.dynamic_label(label)?;
                self.write_pc(Value::Imm(pc))?;
                self.emit(Inst::Jmp { target });
                Ok(())
            }
            PcUpdate::Dynamic(value) => {
                self.write_pc(value)?;
                self.exit_with(ExitSource::Code(ExitCode::DynamicJump));
                Ok(())
            }
        }
    }

    /// Apply `taken` if `cond` holds 1, else `not_taken`.
    ///
    /// A constant condition emits only the selected update.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid operands or label indices.
    pub fn emit_cond_pc(
        &mut self,
        cond: Value,
        taken: PcUpdate,
        not_taken: PcUpdate,
    ) -> Result<(), EmitError> {
        let cond = self.src(cond)?;
        if let Src::Imm(c) = cond {
            return self.emit_pc(if c == 1 { taken } else { not_taken });
        }
        let else_ = self.asm.new_label();
        let done = self.asm.new_label();
        self.compare_one(cond)?;
        self.emit(Inst::Jcc {
            cond: Cond::Ne,
            target: else_,
        });
        self.emit_pc(taken)?;
        self.emit(Inst::Jmp { target: done });
        self.asm.bind(else_)?;
        self.emit_pc(not_taken)?;
        self.asm.bind(done)
    }

    /// Account `cycles` and exit if the counter overflows or passes the
    /// budget. The updated counter is stored before the budget check.
    ///
    /// # Errors
    ///
    /// Propagates scratch-register errors.
    pub fn emit_add_cycles(&mut self, cycles: u64) -> Result<(), EmitError> {
        let counter = Mem::base(reserved::STATE_PTR, StateLayout::CYCLES);
        let budget = Mem::base(reserved::STATE_PTR, StateLayout::MAX_CYCLES);
        let amount = i32::try_from(cycles).ok();
        let regs: &[Reg] = if amount.is_some() {
            &[Reg::Rax]
        } else {
            &[Reg::Rax, Reg::Rcx]
        };
        self.with_scratch(regs, |e| {
            e.emit(Inst::Load {
                dst: Reg::Rax,
                mem: counter,
                size: Size::Qword,
            });
            let src = match amount {
                Some(imm) => Operand::Imm(imm),
                None => {
                    e.emit(Inst::MovImm {
                        dst: Reg::Rcx,
                        imm: cycles,
                    });
                    Operand::Reg(Reg::Rcx)
                }
            };
            e.emit(Inst::Alu {
                op: AluOp::Add,
                dst: Reg::Rax,
                src,
            });
            e.exit_if(Cond::B, ExitSource::Code(ExitCode::CyclesOverflow));
            e.emit(Inst::Store {
                mem: counter,
                src: Reg::Rax,
                size: Size::Qword,
            });
            e.emit(Inst::Alu {
                op: AluOp::Cmp,
                dst: Reg::Rax,
                src: Operand::Mem(budget),
            });
            e.exit_if(Cond::A, ExitSource::Code(ExitCode::MaxCyclesExceeded));
            Ok(())
        })
    }

    /// Store `pc` and exit with [`ExitCode::Ecall`].
    ///
    /// # Errors
    ///
    /// Propagates scratch-register errors.
    pub fn emit_ecall(&mut self, pc: u64) -> Result<(), EmitError> {
        self.write_pc(Value::Imm(pc))?;
        self.exit_with(ExitSource::Code(ExitCode::Ecall));
        Ok(())
    }

    /// Store `pc` and exit with [`ExitCode::Ebreak`].
    ///
    /// # Errors
    ///
    /// Propagates scratch-register errors.
    pub fn emit_ebreak(&mut self, pc: u64) -> Result<(), EmitError> {
        self.write_pc(Value::Imm(pc))?;
        self.exit_with(ExitSource::Code(ExitCode::Ebreak));
        Ok(())
    }

    /// Return `code` to the host.
    pub fn emit_exit(&mut self, code: ExitCode) {
        self.exit_with(ExitSource::Code(code));
    }

    fn write_pc(&mut self, value: Value) -> Result<(), EmitError> {
        let dest = self.loc(REG_PC)?;
        let src = self.src(value)?;
        self.move_to(dest, src)
    }

    /// `cmp cond, 1`.
    pub(crate) fn compare_one(&mut self, cond: Src) -> Result<(), EmitError> {
        match cond {
            Src::Reg(reg) => self.emit(Inst::Alu {
                op: AluOp::Cmp,
                dst: reg,
                src: Operand::Imm(1),
            }),
            Src::Mem(mem) => self.emit(Inst::AluMem {
                op: AluOp::Cmp,
                mem,
                src: RegImm::Imm(1),
                size: Size::Qword,
            }),
            // Callers fold constants; kept for completeness. `pop` leaves
            // the flags intact.
            Src::Imm(imm) => {
                return self.with_scratch(&[Reg::Rax], |e| {
                    e.emit(Inst::MovImm { dst: Reg::Rax, imm });
                    e.emit(Inst::Alu {
                        op: AluOp::Cmp,
                        dst: Reg::Rax,
                        src: Operand::Imm(1),
                    });
                    Ok(())
                });
            }
        }
        Ok(())
    }

    /// Jump to the exit stub for `source` at the current stack depth.
    pub(crate) fn exit_with(&mut self, source: ExitSource) {
        let target = self.stub(source);
        self.emit(Inst::Jmp { target });
    }

    /// Exit through `source` if `cond` holds.
    pub(crate) fn exit_if(&mut self, cond: Cond, source: ExitSource) {
        let target = self.stub(source);
        self.emit(Inst::Jcc { cond, target });
    }

    fn stub(&mut self, source: ExitSource) -> Label {
        let depth = self.asm.depth();
        if let Some(&label) = self.stub_index.get(&(source, depth)) {
            return label;
        }
        let label = self.asm.new_label();
        self.stub_index.insert((source, depth), label);
        self.stubs.push((source, depth, label));
        label
    }

    /// One stub per (exit, depth): drop the pushed slots, set `eax`, leave.
    pub(crate) fn emit_exit_stubs(&mut self) -> Result<(), EmitError> {
        let stubs = std::mem::take(&mut self.stubs);
        trace!(count = stubs.len(), "emitting exit stubs");
        for (source, depth, label) in stubs {
            self.asm.bind(label)?;
            if depth > 0 {
                self.emit(Inst::Alu {
                    op: AluOp::Add,
                    dst: Reg::Rsp,
                    src: Operand::Imm(8 * depth as i32),
                });
            }
            match source {
                ExitSource::Code(code) => self.emit(Inst::MovImm {
                    dst: Reg::Rax,
                    imm: u64::from(code.as_raw()),
                }),
                ExitSource::Rax => {}
                ExitSource::Rdx => self.emit(Inst::Mov32 {
                    dst: Reg::Rax,
                    src: Reg::Rdx,
                }),
            }
            self.emit(Inst::Jmp { target: self.exit });
        }
        Ok(())
    }
}
