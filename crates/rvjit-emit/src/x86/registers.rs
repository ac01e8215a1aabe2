//! x86-64 registers and the RISC-V register mapping tables.
//!
//! Each emitter pins a small fixed subset of virtual registers to physical
//! registers; everything else lives in the `MachineState` slot array and is
//! accessed through memory operands.

use rvjit_state::{NUM_VREGS, REG_TEMP1, REG_TEMP2, REG_TEMP3};

/// x86-64 general-purpose register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    pub const ALL: [Self; 16] = [
        Self::Rax,
        Self::Rcx,
        Self::Rdx,
        Self::Rbx,
        Self::Rsp,
        Self::Rbp,
        Self::Rsi,
        Self::Rdi,
        Self::R8,
        Self::R9,
        Self::R10,
        Self::R11,
        Self::R12,
        Self::R13,
        Self::R14,
        Self::R15,
    ];

    /// Hardware register number (0-15).
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Low three bits, as placed in ModRM/SIB fields.
    #[must_use]
    pub const fn low(self) -> u8 {
        self as u8 & 0x7
    }

    /// Whether the register needs a REX extension bit.
    #[must_use]
    pub const fn is_extended(self) -> bool {
        self as u8 >= 8
    }

    /// Byte access to spl/bpl/sil/dil requires a REX prefix.
    #[must_use]
    pub const fn needs_rex_for_byte(self) -> bool {
        matches!(self, Self::Rsp | Self::Rbp | Self::Rsi | Self::Rdi)
    }

    /// Clobbered across a System V call.
    #[must_use]
    pub const fn is_caller_saved(self) -> bool {
        matches!(
            self,
            Self::Rax
                | Self::Rcx
                | Self::Rdx
                | Self::Rsi
                | Self::Rdi
                | Self::R8
                | Self::R9
                | Self::R10
                | Self::R11
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        NAMES[self as usize]
    }

    #[must_use]
    pub const fn name32(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d",
            "r11d", "r12d", "r13d", "r14d", "r15d",
        ];
        NAMES[self as usize]
    }

    #[must_use]
    pub const fn name16(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w",
            "r12w", "r13w", "r14w", "r15w",
        ];
        NAMES[self as usize]
    }

    #[must_use]
    pub const fn name8(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b",
            "r12b", "r13b", "r14b", "r15b",
        ];
        NAMES[self as usize]
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.name())
    }
}

/// Bitmap of physical registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegSet(u16);

impl RegSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn contains(self, reg: Reg) -> bool {
        self.0 & (1 << reg as u16) != 0
    }

    pub const fn insert(&mut self, reg: Reg) {
        self.0 |= 1 << reg as u16;
    }

    pub const fn remove(&mut self, reg: Reg) {
        self.0 &= !(1 << reg as u16);
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Reg> {
        Reg::ALL.into_iter().filter(move |&r| self.contains(r))
    }
}

impl FromIterator<Reg> for RegSet {
    fn from_iter<I: IntoIterator<Item = Reg>>(iter: I) -> Self {
        let mut set = Self::empty();
        for reg in iter {
            set.insert(reg);
        }
        set
    }
}

/// Registers with a fixed role in generated code.
///
/// - rbx: `MachineState` pointer (callee-saved)
/// - rsp: Stack pointer
/// - rax, rcx, rdx: Scratch for operand staging, mul/div and shift counts
pub mod reserved {
    use super::Reg;

    pub const STATE_PTR: Reg = Reg::Rbx;

    /// Scratch registers, in preference order.
    pub const SCRATCH: [Reg; 3] = [Reg::Rax, Reg::Rcx, Reg::Rdx];

    /// Callee-saved registers pushed by every prologue, in push order.
    pub const CALLEE_SAVED: [Reg; 6] = [Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14, Reg::R15];
}

/// Virtual register -> physical register table.
pub type RegisterTable = [Option<Reg>; NUM_VREGS];

/// Interpreter-style emitter mapping.
///
/// Hot registers live in callee-saved r12-r15 so they survive the memory
/// callbacks; the two emitter temporaries use rsi/rdi and are spilled
/// around every callback.
pub const INTERP_REGISTER_MAP: RegisterTable = {
    let mut table = [None; NUM_VREGS];
    table[1] = Some(Reg::R12); // ra
    table[2] = Some(Reg::R13); // sp
    table[10] = Some(Reg::R14); // a0
    table[11] = Some(Reg::R15); // a1
    table[REG_TEMP1 as usize] = Some(Reg::Rsi);
    table[REG_TEMP2 as usize] = Some(Reg::Rdi);
    table
};

/// AOT emitter mapping.
///
/// AOT code never calls out to the host, so caller-saved registers are
/// fair game and more of the argument registers stay resident.
pub const AOT_REGISTER_MAP: RegisterTable = {
    let mut table = [None; NUM_VREGS];
    table[1] = Some(Reg::Rbp); // ra
    table[2] = Some(Reg::Rsi); // sp
    table[10] = Some(Reg::Rdi); // a0
    table[11] = Some(Reg::R8); // a1
    table[12] = Some(Reg::R9); // a2
    table[13] = Some(Reg::R10); // a3
    table[14] = Some(Reg::R11); // a4
    table[15] = Some(Reg::R12); // a5
    table[REG_TEMP1 as usize] = Some(Reg::R13);
    table[REG_TEMP2 as usize] = Some(Reg::R14);
    table[REG_TEMP3 as usize] = Some(Reg::R15);
    table
};

/// Look up a virtual register in a table.
#[must_use]
pub fn lookup(table: &RegisterTable, vreg: u8) -> Option<Reg> {
    table.get(vreg as usize).copied().flatten()
}

/// Iterator over `(vreg, reg)` pairs of a table.
pub fn mapped(table: &RegisterTable) -> impl Iterator<Item = (u8, Reg)> + '_ {
    table
        .iter()
        .enumerate()
        .filter_map(|(i, slot)| slot.map(|reg| (i as u8, reg)))
}
