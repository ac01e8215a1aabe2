//! Machine-code encoder for [`Inst`].
//!
//! Encodings are fixed-form: memory operands always carry a 32-bit
//! displacement and branches always use rel32, so an instruction's length
//! never depends on where its target ends up. The linker relies on this to
//! lay out code in a single sizing pass.

use super::inst::{Inst, Label, Mem, Operand, RegImm, RegMem, Size};
use super::registers::Reg;

/// ModRM r/m operand.
#[derive(Clone, Copy)]
enum Rm {
    Reg(Reg),
    Mem(Mem),
}

impl From<RegMem> for Rm {
    fn from(value: RegMem) -> Self {
        match value {
            RegMem::Reg(r) => Self::Reg(r),
            RegMem::Mem(m) => Self::Mem(m),
        }
    }
}

/// Encode `inst`, located at byte offset `at`, appending to `out`.
///
/// `target` maps a label to its byte offset. During sizing any value works,
/// since rel32 fields have constant width.
pub fn encode(inst: &Inst, at: usize, target: impl Fn(Label) -> usize, out: &mut Vec<u8>) {
    match *inst {
        Inst::Mov { dst, src } => op_rm(out, true, false, &[0x89], src.code(), Rm::Reg(dst)),
        Inst::Mov32 { dst, src } => op_rm(out, false, false, &[0x89], src.code(), Rm::Reg(dst)),
        Inst::MovImm { dst, imm } => mov_imm(out, dst, imm),
        Inst::Load { dst, mem, size } => {
            let (w, opcode): (bool, &[u8]) = match size {
                Size::Byte => (false, &[0x0F, 0xB6]),
                Size::Word => (false, &[0x0F, 0xB7]),
                Size::Dword => (false, &[0x8B]),
                Size::Qword => (true, &[0x8B]),
            };
            op_rm(out, w, false, opcode, dst.code(), Rm::Mem(mem));
        }
        Inst::Store { mem, src, size } => match size {
            Size::Byte => op_rm(out, false, src.needs_rex_for_byte(), &[0x88], src.code(), Rm::Mem(mem)),
            Size::Word => {
                out.push(0x66);
                op_rm(out, false, false, &[0x89], src.code(), Rm::Mem(mem));
            }
            Size::Dword => op_rm(out, false, false, &[0x89], src.code(), Rm::Mem(mem)),
            Size::Qword => op_rm(out, true, false, &[0x89], src.code(), Rm::Mem(mem)),
        },
        Inst::StoreImm { mem, imm, size } => match size {
            Size::Byte => {
                op_rm(out, false, false, &[0xC6], 0, Rm::Mem(mem));
                out.push(imm as u8);
            }
            Size::Word => {
                out.push(0x66);
                op_rm(out, false, false, &[0xC7], 0, Rm::Mem(mem));
                out.extend_from_slice(&(imm as i16).to_le_bytes());
            }
            Size::Dword | Size::Qword => {
                op_rm(out, size == Size::Qword, false, &[0xC7], 0, Rm::Mem(mem));
                out.extend_from_slice(&imm.to_le_bytes());
            }
        },
        Inst::Movsxd { dst, src } => op_rm(out, true, false, &[0x63], dst.code(), Rm::Reg(src)),
        Inst::Alu { op, dst, src } => {
            let base = op.ext() * 8;
            match src {
                Operand::Reg(src) => op_rm(out, true, false, &[base + 1], src.code(), Rm::Reg(dst)),
                Operand::Mem(mem) => op_rm(out, true, false, &[base + 3], dst.code(), Rm::Mem(mem)),
                Operand::Imm(imm) => group_imm(out, true, op.ext(), Rm::Reg(dst), imm),
            }
        }
        Inst::AluMem { op, mem, src, size } => {
            let base = op.ext() * 8;
            match (src, size) {
                (RegImm::Imm(imm), Size::Byte) => {
                    op_rm(out, false, false, &[0x80], op.ext(), Rm::Mem(mem));
                    out.push(imm as u8);
                }
                (RegImm::Imm(imm), Size::Word) => {
                    out.push(0x66);
                    op_rm(out, false, false, &[0x81], op.ext(), Rm::Mem(mem));
                    out.extend_from_slice(&(imm as i16).to_le_bytes());
                }
                (RegImm::Imm(imm), _) => {
                    group_imm(out, size == Size::Qword, op.ext(), Rm::Mem(mem), imm);
                }
                (RegImm::Reg(src), Size::Byte) => {
                    op_rm(out, false, src.needs_rex_for_byte(), &[base], src.code(), Rm::Mem(mem));
                }
                (RegImm::Reg(src), _) => {
                    if size == Size::Word {
                        out.push(0x66);
                    }
                    op_rm(out, size == Size::Qword, false, &[base + 1], src.code(), Rm::Mem(mem));
                }
            }
        }
        Inst::Test { dst, src } => match src {
            RegImm::Reg(src) => op_rm(out, true, false, &[0x85], src.code(), Rm::Reg(dst)),
            RegImm::Imm(imm) => {
                op_rm(out, true, false, &[0xF7], 0, Rm::Reg(dst));
                out.extend_from_slice(&imm.to_le_bytes());
            }
        },
        Inst::TestMem { mem, imm } => {
            op_rm(out, false, false, &[0xF6], 0, Rm::Mem(mem));
            out.push(imm);
        }
        Inst::Shift { op, dst, amount } => match amount {
            None => op_rm(out, true, false, &[0xD3], op.ext(), Rm::Reg(dst)),
            Some(n) => {
                op_rm(out, true, false, &[0xC1], op.ext(), Rm::Reg(dst));
                out.push(n & 63);
            }
        },
        Inst::Imul { dst, src } => op_rm(out, true, false, &[0x0F, 0xAF], dst.code(), src.into()),
        Inst::ImulImm { dst, src, imm } => {
            op_rm(out, true, false, &[0x69], dst.code(), Rm::Reg(src));
            out.extend_from_slice(&imm.to_le_bytes());
        }
        Inst::MulWide { src, signed } => {
            op_rm(out, true, false, &[0xF7], if signed { 5 } else { 4 }, Rm::Reg(src));
        }
        Inst::Div { src, signed } => {
            op_rm(out, true, false, &[0xF7], if signed { 7 } else { 6 }, Rm::Reg(src));
        }
        Inst::Cqo => out.extend_from_slice(&[0x48, 0x99]),
        Inst::Neg { dst } => op_rm(out, true, false, &[0xF7], 3, Rm::Reg(dst)),
        Inst::Not { dst } => op_rm(out, true, false, &[0xF7], 2, Rm::Reg(dst)),
        Inst::Setcc { cond, dst } => op_rm(
            out,
            false,
            dst.needs_rex_for_byte(),
            &[0x0F, 0x90 + cond.code()],
            0,
            Rm::Reg(dst),
        ),
        Inst::Bswap { dst } => {
            rex(out, true, 0, 0, dst.code(), false);
            out.extend_from_slice(&[0x0F, 0xC8 + dst.low()]);
        }
        Inst::Popcnt { dst, src } => {
            out.push(0xF3);
            op_rm(out, true, false, &[0x0F, 0xB8], dst.code(), Rm::Reg(src));
        }
        Inst::Bsr { dst, src } => op_rm(out, true, false, &[0x0F, 0xBD], dst.code(), Rm::Reg(src)),
        Inst::Bsf { dst, src } => op_rm(out, true, false, &[0x0F, 0xBC], dst.code(), Rm::Reg(src)),
        Inst::Bt { src, bit } => {
            op_rm(out, true, false, &[0x0F, 0xBA], 4, Rm::Reg(src));
            out.push(bit & 63);
        }
        Inst::Xchg { a, b } => op_rm(out, true, false, &[0x87], a.code(), Rm::Reg(b)),
        Inst::Lea { dst, mem } => op_rm(out, true, false, &[0x8D], dst.code(), Rm::Mem(mem)),
        Inst::Push { src } => {
            rex(out, false, 0, 0, src.code(), false);
            out.push(0x50 + src.low());
        }
        Inst::Pop { dst } => {
            rex(out, false, 0, 0, dst.code(), false);
            out.push(0x58 + dst.low());
        }
        Inst::Jmp { target: label } => {
            out.push(0xE9);
            rel32(out, at + 5, target(label));
        }
        Inst::Jcc { cond, target: label } => {
            out.extend_from_slice(&[0x0F, 0x80 + cond.code()]);
            rel32(out, at + 6, target(label));
        }
        Inst::JmpReg { target } => op_rm(out, false, false, &[0xFF], 4, Rm::Reg(target)),
        Inst::Call { target: label } => {
            out.push(0xE8);
            rel32(out, at + 5, target(label));
        }
        Inst::CallReg { target } => op_rm(out, false, false, &[0xFF], 2, Rm::Reg(target)),
        Inst::Ret => out.push(0xC3),
    }
}

/// Encoded length of `inst`.
#[must_use]
pub fn encoded_len(inst: &Inst) -> usize {
    let mut buf = Vec::with_capacity(16);
    encode(inst, 0, |_| 0, &mut buf);
    buf.len()
}

/// `mov r32, imm32` when the value zero-extends, `mov r/m64, simm32` when it
/// sign-extends, `movabs` otherwise.
fn mov_imm(out: &mut Vec<u8>, dst: Reg, imm: u64) {
    if let Ok(imm) = u32::try_from(imm) {
        rex(out, false, 0, 0, dst.code(), false);
        out.push(0xB8 + dst.low());
        out.extend_from_slice(&imm.to_le_bytes());
    } else if let Ok(imm) = i32::try_from(imm as i64) {
        op_rm(out, true, false, &[0xC7], 0, Rm::Reg(dst));
        out.extend_from_slice(&imm.to_le_bytes());
    } else {
        rex(out, true, 0, 0, dst.code(), false);
        out.push(0xB8 + dst.low());
        out.extend_from_slice(&imm.to_le_bytes());
    }
}

/// Immediate form of the ALU group (`83 /ext ib` or `81 /ext id`).
fn group_imm(out: &mut Vec<u8>, w: bool, ext: u8, rm: Rm, imm: i32) {
    if let Ok(imm) = i8::try_from(imm) {
        op_rm(out, w, false, &[0x83], ext, rm);
        out.push(imm as u8);
    } else {
        op_rm(out, w, false, &[0x81], ext, rm);
        out.extend_from_slice(&imm.to_le_bytes());
    }
}

fn rel32(out: &mut Vec<u8>, end: usize, target: usize) {
    let rel = target as i64 - end as i64;
    out.extend_from_slice(&(rel as i32).to_le_bytes());
}

fn rex(out: &mut Vec<u8>, w: bool, reg: u8, index: u8, base: u8, force: bool) {
    let byte = 0x40
        | (u8::from(w) << 3)
        | (((reg >> 3) & 1) << 2)
        | (((index >> 3) & 1) << 1)
        | ((base >> 3) & 1);
    if byte != 0x40 || force {
        out.push(byte);
    }
}

/// REX, opcode, then ModRM (with SIB and disp32 for memory operands).
fn op_rm(out: &mut Vec<u8>, w: bool, force_rex: bool, opcode: &[u8], reg: u8, rm: Rm) {
    let (index, base) = match rm {
        Rm::Reg(r) => (0, r.code()),
        Rm::Mem(m) => (m.index.map_or(0, Reg::code), m.base.code()),
    };
    rex(out, w, reg, index, base, force_rex);
    out.extend_from_slice(opcode);

    let reg = (reg & 7) << 3;
    match rm {
        Rm::Reg(r) => out.push(0xC0 | reg | r.low()),
        Rm::Mem(m) => {
            match m.index {
                Some(index) => {
                    out.push(0x80 | reg | 0b100);
                    out.push((index.low() << 3) | m.base.low());
                }
                // rsp/r12 as base always needs a SIB byte
                None if m.base.low() == 0b100 => {
                    out.push(0x80 | reg | 0b100);
                    out.push(0x24);
                }
                None => out.push(0x80 | reg | m.base.low()),
            }
            out.extend_from_slice(&m.disp.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::inst::{AluOp, Cond, ShiftOp};

    fn bytes(inst: Inst) -> Vec<u8> {
        let mut out = Vec::new();
        encode(&inst, 0, |_| 0, &mut out);
        assert_eq!(out.len(), encoded_len(&inst));
        out
    }

    #[test]
    fn test_moves() {
        assert_eq!(bytes(Inst::Mov { dst: Reg::Rax, src: Reg::Rcx }), [0x48, 0x89, 0xC8]);
        assert_eq!(bytes(Inst::Mov { dst: Reg::R12, src: Reg::Rdx }), [0x49, 0x89, 0xD4]);
        assert_eq!(bytes(Inst::Mov32 { dst: Reg::Rax, src: Reg::Rdx }), [0x89, 0xD0]);
        assert_eq!(
            bytes(Inst::Load { dst: Reg::R12, mem: Mem::base(Reg::Rbx, 8), size: Size::Qword }),
            [0x4C, 0x8B, 0xA3, 0x08, 0, 0, 0]
        );
        assert_eq!(
            bytes(Inst::Store { mem: Mem::base(Reg::Rsp, 0), src: Reg::Rax, size: Size::Qword }),
            [0x48, 0x89, 0x84, 0x24, 0, 0, 0, 0]
        );
        assert_eq!(
            bytes(Inst::Store { mem: Mem::base(Reg::Rbx, 0), src: Reg::Rsi, size: Size::Byte }),
            [0x40, 0x88, 0xB3, 0, 0, 0, 0]
        );
        assert_eq!(bytes(Inst::Movsxd { dst: Reg::Rax, src: Reg::Rcx }), [0x48, 0x63, 0xC1]);
    }

    #[test]
    fn test_mov_imm() {
        assert_eq!(bytes(Inst::MovImm { dst: Reg::Rax, imm: 1 }), [0xB8, 1, 0, 0, 0]);
        assert_eq!(bytes(Inst::MovImm { dst: Reg::R8, imm: 1 }), [0x41, 0xB8, 1, 0, 0, 0]);
        assert_eq!(
            bytes(Inst::MovImm { dst: Reg::Rax, imm: u64::MAX }),
            [0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            bytes(Inst::MovImm { dst: Reg::Rax, imm: 0x1122_3344_5566_7788 }),
            [0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_sib_addressing() {
        assert_eq!(
            bytes(Inst::Load {
                dst: Reg::Rax,
                mem: Mem::indexed(Reg::Rbx, Reg::Rax, 1368),
                size: Size::Byte
            }),
            [0x0F, 0xB6, 0x84, 0x03, 0x58, 0x05, 0, 0]
        );
        assert_eq!(
            bytes(Inst::AluMem {
                op: AluOp::Cmp,
                mem: Mem::indexed(Reg::Rbx, Reg::Rcx, 1352),
                src: RegImm::Imm(0),
                size: Size::Byte
            }),
            [0x80, 0xBC, 0x0B, 0x48, 0x05, 0, 0, 0x00]
        );
    }

    #[test]
    fn test_alu() {
        assert_eq!(
            bytes(Inst::Alu { op: AluOp::Add, dst: Reg::Rax, src: Operand::Imm(5) }),
            [0x48, 0x83, 0xC0, 0x05]
        );
        assert_eq!(
            bytes(Inst::Alu { op: AluOp::Xor, dst: Reg::Rax, src: Operand::Reg(Reg::Rax) }),
            [0x48, 0x31, 0xC0]
        );
        assert_eq!(
            bytes(Inst::Alu { op: AluOp::Sub, dst: Reg::Rcx, src: Operand::Imm(0x1000) }),
            [0x48, 0x81, 0xE9, 0x00, 0x10, 0, 0]
        );
        assert_eq!(
            bytes(Inst::Imul { dst: Reg::Rax, src: RegMem::Reg(Reg::Rcx) }),
            [0x48, 0x0F, 0xAF, 0xC1]
        );
        assert_eq!(
            bytes(Inst::ImulImm { dst: Reg::R12, src: Reg::R12, imm: 3 }),
            [0x4D, 0x69, 0xE4, 3, 0, 0, 0]
        );
        assert_eq!(bytes(Inst::Div { src: Reg::Rcx, signed: false }), [0x48, 0xF7, 0xF1]);
        assert_eq!(bytes(Inst::Div { src: Reg::Rcx, signed: true }), [0x48, 0xF7, 0xF9]);
        assert_eq!(bytes(Inst::Cqo), [0x48, 0x99]);
    }

    #[test]
    fn test_shifts_and_bits() {
        assert_eq!(
            bytes(Inst::Shift { op: ShiftOp::Shl, dst: Reg::Rax, amount: None }),
            [0x48, 0xD3, 0xE0]
        );
        assert_eq!(
            bytes(Inst::Shift { op: ShiftOp::Sar, dst: Reg::Rdx, amount: Some(63) }),
            [0x48, 0xC1, 0xFA, 0x3F]
        );
        assert_eq!(bytes(Inst::Bt { src: Reg::Rcx, bit: 5 }), [0x48, 0x0F, 0xBA, 0xE1, 0x05]);
        assert_eq!(
            bytes(Inst::Popcnt { dst: Reg::Rax, src: Reg::Rcx }),
            [0xF3, 0x48, 0x0F, 0xB8, 0xC1]
        );
        assert_eq!(bytes(Inst::Bswap { dst: Reg::R9 }), [0x49, 0x0F, 0xC9]);
        assert_eq!(bytes(Inst::Setcc { cond: Cond::B, dst: Reg::Rdx }), [0x0F, 0x92, 0xC2]);
        assert_eq!(
            bytes(Inst::Setcc { cond: Cond::E, dst: Reg::Rsi }),
            [0x40, 0x0F, 0x94, 0xC6]
        );
    }

    #[test]
    fn test_stack_and_control() {
        assert_eq!(bytes(Inst::Push { src: Reg::R15 }), [0x41, 0x57]);
        assert_eq!(bytes(Inst::Pop { dst: Reg::Rbx }), [0x5B]);
        assert_eq!(bytes(Inst::Ret), [0xC3]);
        assert_eq!(bytes(Inst::CallReg { target: Reg::Rax }), [0xFF, 0xD0]);
        assert_eq!(bytes(Inst::JmpReg { target: Reg::Rax }), [0xFF, 0xE0]);
    }

    #[test]
    fn test_rel32() {
        let mut out = Vec::new();
        encode(&Inst::Jmp { target: Label(0) }, 10, |_| 100, &mut out);
        assert_eq!(out, [0xE9, 85, 0, 0, 0]);

        out.clear();
        encode(&Inst::Jcc { cond: Cond::Ne, target: Label(0) }, 10, |_| 0, &mut out);
        assert_eq!(out, [0x0F, 0x85, 0xF0, 0xFF, 0xFF, 0xFF]);
    }
}
