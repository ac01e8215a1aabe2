//! Reference executor for generated code.
//!
//! Runs a [`Linked`] buffer one instruction at a time against a real
//! `MachineState`, without mapping executable memory. Only the instruction
//! subset the emitters produce is implemented. The host side of the ABI is
//! checked as well: calls into host callbacks must be 16-byte aligned and
//! clobber every caller-saved register, and callee-saved registers and the
//! stack pointer must be intact when the function returns.
//!
//! Flags are tracked for the ALU group, `test`, `bt`, `neg`, the bit scans
//! and `popcnt`. Shifts, rotates and multiplies leave them unchanged; no
//! lowering branches on their flags.

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::trace;

use rvjit_state::{MachineState, callbacks};

use crate::config::MemoryCallbacks;
use crate::x86::{AluOp, Cond, Inst, Label, Linked, Mem, Operand, Reg, RegImm, RegMem, ShiftOp};

/// Address the code buffer is loaded at.
pub const CODE_BASE: u64 = 0x0040_0000;
/// Address of the `MachineState` passed in `rdi`.
pub const STATE_BASE: u64 = 0x7f00_0000_0000;
/// Return address of the outermost frame.
pub const HOST_RETURN: u64 = 0x00de_ad00_0000;

const STACK_TOP: u64 = 0x7ffe_0000_0000;
const STACK_SIZE: usize = 16 << 10;
const POISON: u64 = 0xbad0_bad0_bad0_bad0;
const DEFAULT_STEP_LIMIT: u64 = 50_000_000;

const CALLEE_SAVED: [Reg; 6] = [Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// Execution failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("divide error at {at:#x}")]
    DivideError { at: usize },

    #[error("access of {size} bytes at unmapped address {addr:#x}")]
    MemoryFault { addr: u64, size: usize },

    #[error("jump to {target:#x}, which is not an instruction boundary")]
    BadJump { target: u64 },

    #[error("step limit of {0} exceeded")]
    StepLimit(u64),

    #[error("callee-saved register {0} not restored")]
    CalleeSaved(Reg),

    #[error("stack pointer not restored: {0:#x}")]
    StackImbalance(u64),

    #[error("host call at {at:#x} with misaligned stack")]
    MisalignedCall { at: usize },

    #[error("call to unknown host address {0:#x}")]
    UnknownHost(u64),
}

/// Host functions generated code may call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HostFn {
    Load,
    Store,
}

#[derive(Clone, Copy, Debug, Default)]
struct Flags {
    cf: bool,
    zf: bool,
    sf: bool,
    of: bool,
}

impl Flags {
    const fn holds(self, cond: Cond) -> bool {
        match cond {
            Cond::O => self.of,
            Cond::No => !self.of,
            Cond::B => self.cf,
            Cond::Ae => !self.cf,
            Cond::E => self.zf,
            Cond::Ne => !self.zf,
            Cond::Be => self.cf || self.zf,
            Cond::A => !self.cf && !self.zf,
            Cond::S => self.sf,
            Cond::Ns => !self.sf,
            Cond::L => self.sf != self.of,
            Cond::Ge => self.sf == self.of,
            Cond::Le => self.zf || self.sf != self.of,
            Cond::G => !self.zf && self.sf == self.of,
        }
    }

    /// Logical result: CF and OF cleared.
    const fn logic(result: u64, bits: u32) -> Self {
        Self {
            cf: false,
            zf: result == 0,
            sf: result >> (bits - 1) & 1 == 1,
            of: false,
        }
    }
}

/// Deterministic x86-64 subset interpreter.
pub struct Machine<'a> {
    linked: &'a Linked,
    /// Byte offset to instruction index.
    index: FxHashMap<usize, usize>,
    regs: [u64; 16],
    flags: Flags,
    stack: Vec<u8>,
    host: FxHashMap<u64, HostFn>,
    step_limit: u64,
    steps: u64,
    host_calls: u64,
}

impl<'a> Machine<'a> {
    #[must_use]
    pub fn new(linked: &'a Linked) -> Self {
        let index = linked
            .instructions()
            .iter()
            .enumerate()
            .map(|(i, &(offset, _))| (offset, i))
            .collect();
        Self {
            linked,
            index,
            regs: [0; 16],
            flags: Flags::default(),
            stack: vec![0; STACK_SIZE],
            host: FxHashMap::default(),
            step_limit: DEFAULT_STEP_LIMIT,
            steps: 0,
            host_calls: 0,
        }
    }

    /// Route calls to the callback addresses to the reference memory path.
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: &MemoryCallbacks) -> Self {
        self.host.insert(callbacks.load, HostFn::Load);
        self.host.insert(callbacks.store, HostFn::Store);
        self
    }

    #[must_use]
    pub const fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Absolute address of dynamic label `id`, for AOT entry.
    #[must_use]
    pub fn label_address(&self, id: u32) -> Option<u64> {
        self.linked
            .label_offset(id)
            .map(|offset| CODE_BASE + offset as u64)
    }

    #[must_use]
    pub const fn reg(&self, reg: Reg) -> u64 {
        self.regs[reg as usize]
    }

    /// Preset a register before [`run`](Self::run). `rdi`, `rsi`, `rsp`
    /// and the callee-saved registers are overwritten by `run`.
    pub const fn set_reg(&mut self, reg: Reg, value: u64) {
        self.regs[reg as usize] = value;
    }

    /// Instructions executed by the last run.
    #[must_use]
    pub const fn steps(&self) -> u64 {
        self.steps
    }

    /// Host callbacks invoked by the last run.
    #[must_use]
    pub const fn host_calls(&self) -> u64 {
        self.host_calls
    }

    /// Call the function at offset 0 as `fn(state, entry) -> u32`.
    ///
    /// # Errors
    ///
    /// Returns a [`SimError`] for any fault, or if the function breaks the
    /// calling convention.
    pub fn run(&mut self, state: &mut MachineState, entry: u64) -> Result<u32, SimError> {
        self.steps = 0;
        self.host_calls = 0;
        for (i, reg) in CALLEE_SAVED.into_iter().enumerate() {
            self.regs[reg as usize] = 0x5a5a_0000_0000_0000 | i as u64;
        }
        let saved = CALLEE_SAVED.map(|reg| self.regs[reg as usize]);
        self.regs[Reg::Rdi as usize] = STATE_BASE;
        self.regs[Reg::Rsi as usize] = entry;
        self.regs[Reg::Rsp as usize] = STACK_TOP;
        self.push(state, HOST_RETURN)?;

        let mut pc = 0;
        loop {
            if self.steps >= self.step_limit {
                return Err(SimError::StepLimit(self.step_limit));
            }
            self.steps += 1;
            let &(at, inst) = self
                .linked
                .instructions()
                .get(pc)
                .ok_or(SimError::BadJump {
                    target: CODE_BASE + self.linked.len() as u64,
                })?;
            let next = pc + 1;
            pc = match self.step(state, at, inst, next)? {
                Next::Fallthrough => next,
                Next::Jump(target) => self.resolve(target)?,
                Next::Return => break,
            };
        }

        for (reg, value) in CALLEE_SAVED.into_iter().zip(saved) {
            if self.regs[reg as usize] != value {
                return Err(SimError::CalleeSaved(reg));
            }
        }
        let rsp = self.regs[Reg::Rsp as usize];
        if rsp != STACK_TOP {
            return Err(SimError::StackImbalance(rsp));
        }
        trace!(steps = self.steps, host_calls = self.host_calls, "run finished");
        Ok(self.regs[Reg::Rax as usize] as u32)
    }

    fn resolve(&self, target: u64) -> Result<usize, SimError> {
        target
            .checked_sub(CODE_BASE)
            .and_then(|offset| self.index.get(&(offset as usize)).copied())
            .ok_or(SimError::BadJump { target })
    }

    fn label(&self, label: Label) -> Result<u64, SimError> {
        self.linked
            .offset_of(label)
            .map(|offset| CODE_BASE + offset as u64)
            .ok_or(SimError::BadJump { target: u64::MAX })
    }

    fn return_address(&self, next: usize) -> u64 {
        let offset = self
            .linked
            .instructions()
            .get(next)
            .map_or(self.linked.len(), |&(offset, _)| offset);
        CODE_BASE + offset as u64
    }

    #[allow(clippy::too_many_lines)]
    fn step(
        &mut self,
        state: &mut MachineState,
        at: usize,
        inst: Inst,
        next: usize,
    ) -> Result<Next, SimError> {
        match inst {
            Inst::Mov { dst, src } => self.set(dst, self.get(src)),
            Inst::Mov32 { dst, src } => self.set(dst, self.get(src) & 0xffff_ffff),
            Inst::MovImm { dst, imm } => self.set(dst, imm),
            Inst::Load { dst, mem, size } => {
                let value = self.read(state, self.address(mem), size.bytes() as usize)?;
                self.set(dst, value);
            }
            Inst::Store { mem, src, size } => {
                self.write(state, self.address(mem), size.bytes() as usize, self.get(src))?;
            }
            Inst::StoreImm { mem, imm, size } => {
                self.write(state, self.address(mem), size.bytes() as usize, imm as i64 as u64)?;
            }
            Inst::Movsxd { dst, src } => self.set(dst, self.get(src) as i32 as i64 as u64),
            Inst::Alu { op, dst, src } => {
                let b = match src {
                    Operand::Reg(r) => self.get(r),
                    Operand::Mem(mem) => self.read(state, self.address(mem), 8)?,
                    Operand::Imm(imm) => imm as i64 as u64,
                };
                let result = self.alu(op, self.get(dst), b, 64);
                if op != AluOp::Cmp {
                    self.set(dst, result);
                }
            }
            Inst::AluMem { op, mem, src, size } => {
                let addr = self.address(mem);
                let bytes = size.bytes() as usize;
                let a = self.read(state, addr, bytes)?;
                let b = match src {
                    RegImm::Reg(r) => self.get(r),
                    RegImm::Imm(imm) => imm as i64 as u64,
                };
                let result = self.alu(op, a, b, size.bits());
                if op != AluOp::Cmp {
                    self.write(state, addr, bytes, result)?;
                }
            }
            Inst::Test { dst, src } => {
                let b = match src {
                    RegImm::Reg(r) => self.get(r),
                    RegImm::Imm(imm) => imm as i64 as u64,
                };
                self.flags = Flags::logic(self.get(dst) & b, 64);
            }
            Inst::TestMem { mem, imm } => {
                let byte = self.read(state, self.address(mem), 1)?;
                self.flags = Flags::logic(byte & u64::from(imm), 8);
            }
            Inst::Shift { op, dst, amount } => {
                let count = u32::from(amount.unwrap_or(self.get(Reg::Rcx) as u8) & 63);
                let value = self.get(dst);
                let result = match op {
                    ShiftOp::Rol => value.rotate_left(count),
                    ShiftOp::Ror => value.rotate_right(count),
                    ShiftOp::Shl => value << count,
                    ShiftOp::Shr => value >> count,
                    ShiftOp::Sar => ((value as i64) >> count) as u64,
                };
                self.set(dst, result);
            }
            Inst::Imul { dst, src } => {
                let b = match src {
                    RegMem::Reg(r) => self.get(r),
                    RegMem::Mem(mem) => self.read(state, self.address(mem), 8)?,
                };
                self.set(dst, self.get(dst).wrapping_mul(b));
            }
            Inst::ImulImm { dst, src, imm } => {
                self.set(dst, self.get(src).wrapping_mul(imm as i64 as u64));
            }
            Inst::MulWide { src, signed } => {
                let (a, b) = (self.get(Reg::Rax), self.get(src));
                let product = if signed {
                    (i128::from(a as i64) * i128::from(b as i64)) as u128
                } else {
                    u128::from(a) * u128::from(b)
                };
                self.set(Reg::Rax, product as u64);
                self.set(Reg::Rdx, (product >> 64) as u64);
            }
            Inst::Div { src, signed } => {
                let dividend = (u128::from(self.get(Reg::Rdx)) << 64) | u128::from(self.get(Reg::Rax));
                let divisor = self.get(src);
                let (quotient, remainder) = if signed {
                    divide_signed(dividend as i128, i128::from(divisor as i64))
                } else {
                    divide_unsigned(dividend, u128::from(divisor))
                }
                .ok_or(SimError::DivideError { at })?;
                self.set(Reg::Rax, quotient);
                self.set(Reg::Rdx, remainder);
            }
            Inst::Cqo => {
                let sign = if (self.get(Reg::Rax) as i64) < 0 { u64::MAX } else { 0 };
                self.set(Reg::Rdx, sign);
            }
            Inst::Neg { dst } => {
                let result = self.alu(AluOp::Sub, 0, self.get(dst), 64);
                self.set(dst, result);
            }
            Inst::Not { dst } => self.set(dst, !self.get(dst)),
            Inst::Setcc { cond, dst } => {
                let bit = u64::from(self.flags.holds(cond));
                self.set(dst, (self.get(dst) & !0xff) | bit);
            }
            Inst::Bswap { dst } => self.set(dst, self.get(dst).swap_bytes()),
            Inst::Popcnt { dst, src } => {
                let value = self.get(src);
                self.flags = Flags {
                    zf: value == 0,
                    ..Flags::default()
                };
                self.set(dst, u64::from(value.count_ones()));
            }
            Inst::Bsr { dst, src } | Inst::Bsf { dst, src } => {
                let value = self.get(src);
                self.flags.zf = value == 0;
                if value != 0 {
                    let index = if matches!(inst, Inst::Bsr { .. }) {
                        63 - value.leading_zeros()
                    } else {
                        value.trailing_zeros()
                    };
                    self.set(dst, u64::from(index));
                }
            }
            Inst::Bt { src, bit } => self.flags.cf = self.get(src) >> (bit & 63) & 1 == 1,
            Inst::Xchg { a, b } => {
                let (x, y) = (self.get(a), self.get(b));
                self.set(a, y);
                self.set(b, x);
            }
            Inst::Lea { dst, mem } => self.set(dst, self.address(mem)),
            Inst::Push { src } => self.push(state, self.get(src))?,
            Inst::Pop { dst } => {
                let value = self.pop(state)?;
                self.set(dst, value);
            }
            Inst::Jmp { target } => return Ok(Next::Jump(self.label(target)?)),
            Inst::Jcc { cond, target } => {
                if self.flags.holds(cond) {
                    return Ok(Next::Jump(self.label(target)?));
                }
            }
            Inst::JmpReg { target } => return Ok(Next::Jump(self.get(target))),
            Inst::Call { target } => {
                self.push(state, self.return_address(next))?;
                return Ok(Next::Jump(self.label(target)?));
            }
            Inst::CallReg { target } => {
                let address = self.get(target);
                if let Some(&host) = self.host.get(&address) {
                    if self.get(Reg::Rsp) % 16 != 0 {
                        return Err(SimError::MisalignedCall { at });
                    }
                    self.call_host(state, host);
                } else if self.resolve(address).is_ok() {
                    self.push(state, self.return_address(next))?;
                    return Ok(Next::Jump(address));
                } else {
                    return Err(SimError::UnknownHost(address));
                }
            }
            Inst::Ret => {
                let address = self.pop(state)?;
                if address == HOST_RETURN {
                    return Ok(Next::Return);
                }
                return Ok(Next::Jump(address));
            }
        }
        Ok(Next::Fallthrough)
    }

    fn call_host(&mut self, state: &mut MachineState, host: HostFn) {
        self.host_calls += 1;
        let (rdi, rsi, rdx, rcx) = (
            self.get(Reg::Rdi),
            self.get(Reg::Rsi),
            self.get(Reg::Rdx),
            self.get(Reg::Rcx),
        );
        debug_assert_eq!(rdi, STATE_BASE);
        for reg in Reg::ALL.into_iter().filter(|r| r.is_caller_saved()) {
            self.set(reg, POISON);
        }
        self.flags = Flags::default();
        match host {
            HostFn::Load => {
                let result = callbacks::load_checked(state, rsi, rdx);
                self.set(Reg::Rax, result.exit);
                self.set(Reg::Rdx, result.value);
            }
            HostFn::Store => {
                let exit = callbacks::store_checked(state, rsi, rdx, rcx);
                self.set(Reg::Rax, exit);
            }
        }
    }

    const fn get(&self, reg: Reg) -> u64 {
        self.regs[reg as usize]
    }

    const fn set(&mut self, reg: Reg, value: u64) {
        self.regs[reg as usize] = value;
    }

    fn address(&self, mem: Mem) -> u64 {
        let index = mem.index.map_or(0, |r| self.get(r));
        self.get(mem.base)
            .wrapping_add(index)
            .wrapping_add(i64::from(mem.disp) as u64)
    }

    fn alu(&mut self, op: AluOp, a: u64, b: u64, bits: u32) -> u64 {
        let mask = if bits == 64 { u64::MAX } else { (1 << bits) - 1 };
        let sign = 1u64 << (bits - 1);
        let (a, b) = (a & mask, b & mask);
        let result = match op {
            AluOp::Add => a.wrapping_add(b) & mask,
            AluOp::Sub | AluOp::Cmp => a.wrapping_sub(b) & mask,
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
        };
        let mut flags = Flags::logic(result, bits);
        match op {
            AluOp::Add => {
                flags.cf = u128::from(a) + u128::from(b) > u128::from(mask);
                flags.of = (a ^ result) & (b ^ result) & sign != 0;
            }
            AluOp::Sub | AluOp::Cmp => {
                flags.cf = a < b;
                flags.of = (a ^ b) & (a ^ result) & sign != 0;
            }
            AluOp::And | AluOp::Or | AluOp::Xor => {}
        }
        self.flags = flags;
        result
    }

    fn push(&mut self, state: &mut MachineState, value: u64) -> Result<(), SimError> {
        let rsp = self.get(Reg::Rsp).wrapping_sub(8);
        self.write(state, rsp, 8, value)?;
        self.set(Reg::Rsp, rsp);
        Ok(())
    }

    fn pop(&mut self, state: &MachineState) -> Result<u64, SimError> {
        let rsp = self.get(Reg::Rsp);
        let value = self.read(state, rsp, 8)?;
        self.set(Reg::Rsp, rsp.wrapping_add(8));
        Ok(value)
    }

    fn read(&self, state: &MachineState, addr: u64, size: usize) -> Result<u64, SimError> {
        let bytes = match region(addr, size, state.as_bytes().len()) {
            Some(Region::State(at)) => &state.as_bytes()[at..at + size],
            Some(Region::Stack(at)) => &self.stack[at..at + size],
            None => return Err(SimError::MemoryFault { addr, size }),
        };
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn write(
        &mut self,
        state: &mut MachineState,
        addr: u64,
        size: usize,
        value: u64,
    ) -> Result<(), SimError> {
        let bytes = match region(addr, size, state.as_bytes().len()) {
            Some(Region::State(at)) => &mut state.as_bytes_mut()[at..at + size],
            Some(Region::Stack(at)) => &mut self.stack[at..at + size],
            None => return Err(SimError::MemoryFault { addr, size }),
        };
        bytes.copy_from_slice(&value.to_le_bytes()[..size]);
        Ok(())
    }
}

/// Control transfer after one instruction.
enum Next {
    Fallthrough,
    Jump(u64),
    Return,
}

enum Region {
    State(usize),
    Stack(usize),
}

fn region(addr: u64, size: usize, state_len: usize) -> Option<Region> {
    let end = addr.checked_add(size as u64)?;
    let stack_bottom = STACK_TOP - STACK_SIZE as u64;
    if addr >= STATE_BASE && end <= STATE_BASE + state_len as u64 {
        Some(Region::State((addr - STATE_BASE) as usize))
    } else if addr >= stack_bottom && end <= STACK_TOP {
        Some(Region::Stack((addr - stack_bottom) as usize))
    } else {
        None
    }
}

/// `div`: faults on a zero divisor or a quotient wider than 64 bits.
fn divide_unsigned(dividend: u128, divisor: u128) -> Option<(u64, u64)> {
    let quotient = dividend.checked_div(divisor)?;
    let quotient = u64::try_from(quotient).ok()?;
    Some((quotient, (dividend % divisor) as u64))
}

/// `idiv`: faults on a zero divisor or a quotient outside `i64`.
fn divide_signed(dividend: i128, divisor: i128) -> Option<(u64, u64)> {
    let quotient = dividend.checked_div(divisor)?;
    let quotient = i64::try_from(quotient).ok()?;
    Some((quotient as u64, (dividend % divisor) as i64 as u64))
}
