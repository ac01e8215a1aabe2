//! Semantic operation identifiers.
//!
//! Every operation has a dedicated `emit_*` method; these enums let a
//! decoder dispatch through [`Emitter::emit_binary`](crate::Emitter::emit_binary)
//! and [`Emitter::emit_unary`](crate::Emitter::emit_unary) instead.

/// Two-source RISC-V integer operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    /// Low 64 bits of the product.
    Mul,
    /// High 64 bits, signed x signed.
    Mulh,
    /// High 64 bits, unsigned x unsigned.
    Mulhu,
    /// High 64 bits, signed x unsigned.
    Mulhsu,
    Div,
    Divu,
    Rem,
    Remu,
    Sll,
    Srl,
    Sra,
    Rol,
    Ror,
    /// 1 if equal, else 0.
    Eq,
    /// Signed less-than, 1 or 0.
    Lt,
    /// Unsigned less-than, 1 or 0.
    Ltu,
    Clmul,
    Clmulh,
    Clmulr,
}

impl BinaryOp {
    pub const ALL: [Self; 24] = [
        Self::Add,
        Self::Sub,
        Self::And,
        Self::Or,
        Self::Xor,
        Self::Mul,
        Self::Mulh,
        Self::Mulhu,
        Self::Mulhsu,
        Self::Div,
        Self::Divu,
        Self::Rem,
        Self::Remu,
        Self::Sll,
        Self::Srl,
        Self::Sra,
        Self::Rol,
        Self::Ror,
        Self::Eq,
        Self::Lt,
        Self::Ltu,
        Self::Clmul,
        Self::Clmulh,
        Self::Clmulr,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Mul => "mul",
            Self::Mulh => "mulh",
            Self::Mulhu => "mulhu",
            Self::Mulhsu => "mulhsu",
            Self::Div => "div",
            Self::Divu => "divu",
            Self::Rem => "rem",
            Self::Remu => "remu",
            Self::Sll => "sll",
            Self::Srl => "srl",
            Self::Sra => "sra",
            Self::Rol => "rol",
            Self::Ror => "ror",
            Self::Eq => "eq",
            Self::Lt => "lt",
            Self::Ltu => "ltu",
            Self::Clmul => "clmul",
            Self::Clmulh => "clmulh",
            Self::Clmulr => "clmulr",
        }
    }
}

/// Single-source RISC-V integer operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    /// Leading zeros; 64 for zero.
    Clz,
    /// Trailing zeros; 64 for zero.
    Ctz,
    /// Population count.
    Cpop,
    /// Each byte becomes 0xff if non-zero, else 0x00.
    OrcB,
    /// Byte reverse.
    Rev8,
}

impl UnaryOp {
    pub const ALL: [Self; 6] = [
        Self::Not,
        Self::Clz,
        Self::Ctz,
        Self::Cpop,
        Self::OrcB,
        Self::Rev8,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Not => "not",
            Self::Clz => "clz",
            Self::Ctz => "ctz",
            Self::Cpop => "cpop",
            Self::OrcB => "orc.b",
            Self::Rev8 => "rev8",
        }
    }
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
