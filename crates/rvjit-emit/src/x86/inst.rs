//! Typed x86-64 instruction model.
//!
//! Only the subset the lowering actually produces is modelled. Every
//! instruction has one canonical encoding (see `encode`), and `Display`
//! renders it in AT&T syntax for listings.

use std::fmt;

use super::registers::Reg;

/// Code label. Ids below the configured label count are caller-visible
/// dynamic labels; the rest are allocated by the emitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub(crate) u32);

impl Label {
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".L{}", self.0)
    }
}

/// Operand size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Size {
    Byte,
    Word,
    Dword,
    Qword,
}

impl Size {
    /// Size for a memory access width in bytes.
    #[must_use]
    pub const fn from_width(width: u8) -> Option<Self> {
        match width {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            8 => Some(Self::Qword),
            _ => None,
        }
    }

    #[must_use]
    pub const fn bytes(self) -> u8 {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    const fn suffix(self) -> char {
        match self {
            Self::Byte => 'b',
            Self::Word => 'w',
            Self::Dword => 'l',
            Self::Qword => 'q',
        }
    }

    const fn reg_name(self, reg: Reg) -> &'static str {
        match self {
            Self::Byte => reg.name8(),
            Self::Word => reg.name16(),
            Self::Dword => reg.name32(),
            Self::Qword => reg.name(),
        }
    }
}

/// Memory operand: `disp(base, index)`. Scale is always 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Mem {
    pub base: Reg,
    pub index: Option<Reg>,
    pub disp: i32,
}

impl Mem {
    #[must_use]
    pub const fn base(base: Reg, disp: i32) -> Self {
        Self { base, index: None, disp }
    }

    #[must_use]
    pub const fn indexed(base: Reg, index: Reg, disp: i32) -> Self {
        Self {
            base,
            index: Some(index),
            disp,
        }
    }
}

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}({},{})", self.disp, self.base, index),
            None => write!(f, "{}({})", self.disp, self.base),
        }
    }
}

/// Condition code, numbered as in the `Jcc`/`SETcc` opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    const fn suffix(self) -> &'static str {
        match self {
            Self::O => "o",
            Self::No => "no",
            Self::B => "b",
            Self::Ae => "ae",
            Self::E => "e",
            Self::Ne => "ne",
            Self::Be => "be",
            Self::A => "a",
            Self::S => "s",
            Self::Ns => "ns",
            Self::L => "l",
            Self::Ge => "ge",
            Self::Le => "le",
            Self::G => "g",
        }
    }
}

/// Two-operand ALU group; the value is the `/digit` of the immediate forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

impl AluOp {
    #[must_use]
    pub const fn ext(self) -> u8 {
        self as u8
    }

    const fn mnemonic(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Or => "or",
            Self::And => "and",
            Self::Sub => "sub",
            Self::Xor => "xor",
            Self::Cmp => "cmp",
        }
    }
}

/// Shift/rotate group; the value is the `/digit` in the ModRM reg field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShiftOp {
    Rol = 0,
    Ror = 1,
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

impl ShiftOp {
    #[must_use]
    pub const fn ext(self) -> u8 {
        self as u8
    }

    const fn mnemonic(self) -> &'static str {
        match self {
            Self::Rol => "rol",
            Self::Ror => "ror",
            Self::Shl => "shl",
            Self::Shr => "shr",
            Self::Sar => "sar",
        }
    }
}

/// Source operand of a register-destination ALU instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(Reg),
    Mem(Mem),
    /// Sign-extended to the operation size.
    Imm(i32),
}

/// Register or immediate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegImm {
    Reg(Reg),
    Imm(i32),
}

/// Register or memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegMem {
    Reg(Reg),
    Mem(Mem),
}

/// x86-64 instruction. Operations are 64-bit unless a `size` says otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Inst {
    Mov { dst: Reg, src: Reg },
    /// 32-bit move; zero-extends into the full register.
    Mov32 { dst: Reg, src: Reg },
    /// Materialize a constant; the encoder picks the shortest form.
    MovImm { dst: Reg, imm: u64 },
    /// Zero-extending load.
    Load { dst: Reg, mem: Mem, size: Size },
    /// Store the low `size` bytes of `src`.
    Store { mem: Mem, src: Reg, size: Size },
    /// Store an immediate, sign-extended to `size`.
    StoreImm { mem: Mem, imm: i32, size: Size },
    /// Sign-extend the low 32 bits.
    Movsxd { dst: Reg, src: Reg },
    Alu { op: AluOp, dst: Reg, src: Operand },
    AluMem { op: AluOp, mem: Mem, src: RegImm, size: Size },
    Test { dst: Reg, src: RegImm },
    TestMem { mem: Mem, imm: u8 },
    /// `amount: None` shifts by `cl`.
    Shift { op: ShiftOp, dst: Reg, amount: Option<u8> },
    /// Two-operand multiply, low 64 bits.
    Imul { dst: Reg, src: RegMem },
    /// `dst = src * imm`, low 64 bits.
    ImulImm { dst: Reg, src: Reg, imm: i32 },
    /// `rdx:rax = rax * src`.
    MulWide { src: Reg, signed: bool },
    /// `rax = rdx:rax / src`, `rdx = rdx:rax % src`.
    Div { src: Reg, signed: bool },
    Cqo,
    Neg { dst: Reg },
    Not { dst: Reg },
    /// Writes the low byte only.
    Setcc { cond: Cond, dst: Reg },
    Bswap { dst: Reg },
    Popcnt { dst: Reg, src: Reg },
    Bsr { dst: Reg, src: Reg },
    Bsf { dst: Reg, src: Reg },
    /// Copy bit `bit` of `src` into CF.
    Bt { src: Reg, bit: u8 },
    Xchg { a: Reg, b: Reg },
    Lea { dst: Reg, mem: Mem },
    Push { src: Reg },
    Pop { dst: Reg },
    Jmp { target: Label },
    Jcc { cond: Cond, target: Label },
    JmpReg { target: Reg },
    Call { target: Label },
    CallReg { target: Reg },
    Ret,
}

impl Inst {
    /// Label referenced by a direct branch or call.
    #[must_use]
    pub const fn label_ref(&self) -> Option<Label> {
        match self {
            Self::Jmp { target } | Self::Jcc { target, .. } | Self::Call { target } => {
                Some(*target)
            }
            _ => None,
        }
    }

    /// Net change in pushed bytes on the fall-through path.
    #[must_use]
    pub const fn stack_effect(&self) -> i32 {
        match self {
            Self::Push { .. } => 8,
            Self::Pop { .. } => -8,
            _ => 0,
        }
    }
}

impl fmt::Display for Inst {
    #[allow(clippy::too_many_lines)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Mov { dst, src } => write!(f, "movq {src}, {dst}"),
            Self::Mov32 { dst, src } => write!(f, "movl %{}, %{}", src.name32(), dst.name32()),
            Self::MovImm { dst, imm } => {
                if u32::try_from(imm).is_ok() {
                    write!(f, "movl ${imm:#x}, %{}", dst.name32())
                } else if i32::try_from(imm as i64).is_ok() {
                    write!(f, "movq ${}, {dst}", imm as i64)
                } else {
                    write!(f, "movabsq ${imm:#x}, {dst}")
                }
            }
            Self::Load { dst, mem, size } => match size {
                Size::Byte => write!(f, "movzbl {mem}, %{}", dst.name32()),
                Size::Word => write!(f, "movzwl {mem}, %{}", dst.name32()),
                Size::Dword => write!(f, "movl {mem}, %{}", dst.name32()),
                Size::Qword => write!(f, "movq {mem}, {dst}"),
            },
            Self::Store { mem, src, size } => {
                write!(f, "mov{} %{}, {mem}", size.suffix(), size.reg_name(src))
            }
            Self::StoreImm { mem, imm, size } => write!(f, "mov{} ${imm}, {mem}", size.suffix()),
            Self::Movsxd { dst, src } => write!(f, "movslq %{}, {dst}", src.name32()),
            Self::Alu { op, dst, src } => {
                let m = op.mnemonic();
                match src {
                    Operand::Reg(src) => write!(f, "{m}q {src}, {dst}"),
                    Operand::Mem(mem) => write!(f, "{m}q {mem}, {dst}"),
                    Operand::Imm(imm) => write!(f, "{m}q ${imm}, {dst}"),
                }
            }
            Self::AluMem { op, mem, src, size } => {
                let m = op.mnemonic();
                let s = size.suffix();
                match src {
                    RegImm::Reg(src) => write!(f, "{m}{s} %{}, {mem}", size.reg_name(src)),
                    RegImm::Imm(imm) => write!(f, "{m}{s} ${imm}, {mem}"),
                }
            }
            Self::Test { dst, src } => match src {
                RegImm::Reg(src) => write!(f, "testq {src}, {dst}"),
                RegImm::Imm(imm) => write!(f, "testq ${imm:#x}, {dst}"),
            },
            Self::TestMem { mem, imm } => write!(f, "testb ${imm:#x}, {mem}"),
            Self::Shift { op, dst, amount } => match amount {
                Some(n) => write!(f, "{}q ${n}, {dst}", op.mnemonic()),
                None => write!(f, "{}q %cl, {dst}", op.mnemonic()),
            },
            Self::Imul { dst, src } => match src {
                RegMem::Reg(src) => write!(f, "imulq {src}, {dst}"),
                RegMem::Mem(mem) => write!(f, "imulq {mem}, {dst}"),
            },
            Self::ImulImm { dst, src, imm } => write!(f, "imulq ${imm}, {src}, {dst}"),
            Self::MulWide { src, signed } => {
                write!(f, "{}q {src}", if signed { "imul" } else { "mul" })
            }
            Self::Div { src, signed } => write!(f, "{}q {src}", if signed { "idiv" } else { "div" }),
            Self::Cqo => f.write_str("cqto"),
            Self::Neg { dst } => write!(f, "negq {dst}"),
            Self::Not { dst } => write!(f, "notq {dst}"),
            Self::Setcc { cond, dst } => write!(f, "set{} %{}", cond.suffix(), dst.name8()),
            Self::Bswap { dst } => write!(f, "bswapq {dst}"),
            Self::Popcnt { dst, src } => write!(f, "popcntq {src}, {dst}"),
            Self::Bsr { dst, src } => write!(f, "bsrq {src}, {dst}"),
            Self::Bsf { dst, src } => write!(f, "bsfq {src}, {dst}"),
            Self::Bt { src, bit } => write!(f, "btq ${bit}, {src}"),
            Self::Xchg { a, b } => write!(f, "xchgq {a}, {b}"),
            Self::Lea { dst, mem } => write!(f, "leaq {mem}, {dst}"),
            Self::Push { src } => write!(f, "pushq {src}"),
            Self::Pop { dst } => write!(f, "popq {dst}"),
            Self::Jmp { target } => write!(f, "jmp {target}"),
            Self::Jcc { cond, target } => write!(f, "j{} {target}", cond.suffix()),
            Self::JmpReg { target } => write!(f, "jmp *{target}"),
            Self::Call { target } => write!(f, "call {target}"),
            Self::CallReg { target } => write!(f, "call *{target}"),
            Self::Ret => f.write_str("ret"),
        }
    }
}
