//! Emission error types.

use thiserror::Error;

use crate::x86::Reg;

/// Emission error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("virtual register out of range: {0}")]
    InvalidRegister(u8),

    #[error("unsupported access width: {0}")]
    UnsupportedWidth(u8),

    #[error("physical register operands are only accepted by the AOT emitter ({0})")]
    PhysicalOperand(Reg),

    #[error("register {0} is reserved and cannot be used as an operand")]
    ReservedRegister(Reg),

    #[error("register {0} is not locked")]
    NotLocked(Reg),

    #[error("operand combination leaves no scratch register")]
    ScratchExhausted,

    #[error("label {id} exceeds the label table ({max} entries)")]
    LabelOutOfRange { id: u32, max: u32 },

    #[error("label {0} placed twice")]
    DuplicateLabel(u32),

    #[error("label {0} referenced but never placed")]
    UnresolvedLabel(u32),

    #[error("invalid memory size: {0:#x}")]
    InvalidMemorySize(u64),

    #[error("label table size must be non-zero")]
    EmptyLabelTable,
}

/// Fixed emission status codes reported to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    InvalidArgument = -1,
    InvalidMemorySize = -2,
    NotEnoughLabels = -3,
    InvalidValue = -4,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    /// Status of an emission result.
    #[must_use]
    pub const fn of<T>(result: &Result<T, EmitError>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(err) => err.code(),
        }
    }
}

impl EmitError {
    /// Map to the fixed host-facing status code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRegister(_)
            | Self::UnsupportedWidth(_)
            | Self::PhysicalOperand(_)
            | Self::ReservedRegister(_)
            | Self::NotLocked(_)
            | Self::ScratchExhausted => ErrorCode::InvalidArgument,
            Self::InvalidMemorySize(_) => ErrorCode::InvalidMemorySize,
            Self::LabelOutOfRange { .. } | Self::EmptyLabelTable => ErrorCode::NotEnoughLabels,
            Self::DuplicateLabel(_) | Self::UnresolvedLabel(_) => ErrorCode::InvalidValue,
        }
    }
}
