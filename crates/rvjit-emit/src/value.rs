//! Emission-time operands.

use crate::x86::Reg;

/// Operand of an emitted operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    /// Virtual register (GPR, PC or temporary).
    Reg(u8),
    /// Full 64-bit constant. Whether a short encoding fits is decided per use.
    Imm(u64),
    /// Physical register holding a value computed by the caller. AOT only.
    Phys(Reg),
}

impl Value {
    /// Immediate from a signed constant.
    #[must_use]
    pub const fn imm(value: i64) -> Self {
        Self::Imm(value as u64)
    }

    #[must_use]
    pub const fn as_imm(self) -> Option<u64> {
        match self {
            Self::Imm(v) => Some(v),
            _ => None,
        }
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Imm(value)
    }
}

impl From<Reg> for Value {
    fn from(reg: Reg) -> Self {
        Self::Phys(reg)
    }
}

/// Program-counter update at the end of an emitted instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PcUpdate {
    /// Store the new PC and fall through.
    Write(Value),
    /// Store `pc` and jump straight to a label in this code buffer.
    Label { label: u32, pc: u64 },
    /// Store the target and return to the host to resolve it.
    Dynamic(Value),
}
