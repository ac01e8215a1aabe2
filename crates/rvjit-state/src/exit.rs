//! Exit codes returned by generated code.

/// Reason generated code handed control back to the host.
///
/// The value is returned in `eax`. Zero is never produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ExitCode {
    /// The host must decode a new trace before continuing.
    DecodeTrace = 1,
    /// Environment call; `pc` points at the `ecall`.
    Ecall = 2,
    /// Breakpoint; `pc` points at the `ebreak`.
    Ebreak = 3,
    /// Jump target is only known at runtime; resume at `pc`.
    DynamicJump = 4,
    MaxCyclesExceeded = 5,
    CyclesOverflow = 6,
    OutOfBound = 7,
    InvalidPermission = 8,
    /// The host should interpret the current instruction.
    SlowPath = 9,
}

impl ExitCode {
    pub const ALL: [Self; 9] = [
        Self::DecodeTrace,
        Self::Ecall,
        Self::Ebreak,
        Self::DynamicJump,
        Self::MaxCyclesExceeded,
        Self::CyclesOverflow,
        Self::OutOfBound,
        Self::InvalidPermission,
        Self::SlowPath,
    ];

    /// Decode a raw exit value.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|code| *code as u64 == raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::DecodeTrace => "decode-trace",
            Self::Ecall => "ecall",
            Self::Ebreak => "ebreak",
            Self::DynamicJump => "dynamic-jump",
            Self::MaxCyclesExceeded => "max-cycles-exceeded",
            Self::CyclesOverflow => "cycles-overflow",
            Self::OutOfBound => "out-of-bound",
            Self::InvalidPermission => "invalid-permission",
            Self::SlowPath => "slow-path",
        };
        f.write_str(name)
    }
}
