//! AOT emitter.
//!
//! Pins eleven guest registers (including the three temporaries) to host
//! registers and accesses guest memory inline. Protection is enforced by
//! shared subroutines emitted once after the body:
//!
//! ```text
//! check_read / check_write
//!   in:  rax = guest address, rdx = width
//!   out: rdx = 0, or an exit code
//!   preserves every other register
//! ensure_frame
//!   in:  rcx = frame index
//!   clobbers rcx
//! ```

use rayon::prelude::*;
use rvjit_state::{
    ExitCode, FLAG_DIRTY, FLAG_WXORX_BIT, FRAME_SHIFT, FRAME_SIZE, MAX_MEMORY, MachineState,
    PAGE_SHIFT,
};
use tracing::{debug, trace};

use crate::config::EmitConfig;
use crate::emitter::{Emitter, ExitSource, Variant};
use crate::error::EmitError;
use crate::interp::check_width;
use crate::layout::StateLayout;
use crate::value::Value;
use crate::x86::{
    AOT_REGISTER_MAP, AluOp, Cond, Inst, Label, Linked, Mem, Operand, Reg, RegImm, RegisterTable,
    ShiftOp, Size, reserved,
};

/// Labels of the out-of-line memory routines.
#[derive(Clone, Copy, Debug)]
struct Routines {
    check_read: Label,
    check_write: Label,
    ensure_frames: Label,
    out_of_bound: Label,
    permission: Label,
    ensure_frame: Label,
}

/// AOT flavour.
#[derive(Clone, Copy, Debug, Default)]
pub struct Aot {
    routines: Option<Routines>,
}

impl Variant for Aot {
    const NAME: &'static str = "aot";
    const REGISTERS: &'static RegisterTable = &AOT_REGISTER_MAP;
    const PHYS_OPERANDS: bool = true;
    const INDIRECT_ENTRY: bool = true;
}

/// Emitter for standalone AOT functions.
///
/// The generated function has the signature
/// `extern "C" fn(*mut MachineState, entry: usize) -> u32`: after loading
/// the pinned registers it jumps to `entry`, an absolute address the host
/// computes from [`Linked::label_offset`].
pub type AotEmitter = Emitter<Aot>;

/// Native entry point of an AOT function.
pub type AotEntry = unsafe extern "C" fn(*mut MachineState, usize) -> u32;

impl Emitter<Aot> {
    /// Start a translation unit.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(config: EmitConfig) -> Result<Self, EmitError> {
        Self::with_variant(config, Aot::default())
    }

    /// `dest = zext(load(addr, width))` with inline bounds checking.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::UnsupportedWidth`] unless `width` is 1, 2, 4
    /// or 8, or an error for invalid operands.
    pub fn emit_load(&mut self, dest: u8, addr: Value, width: u8) -> Result<(), EmitError> {
        let size = check_width(width)?;
        let dest = self.loc(dest)?;
        let addr = self.src(addr)?;
        let check = self.routines().check_read;
        self.with_scratch(&[Reg::Rax, Reg::Rdx], |e| {
            e.load(Reg::Rax, addr);
            e.call_check(check, width);
            e.emit(Inst::Load {
                dst: Reg::Rax,
                mem: guest(),
                size,
            });
            e.store(dest, Reg::Rax);
            Ok(())
        })
    }

    /// `store(addr, value, width)` with inline bounds and write-permission
    /// checking.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::UnsupportedWidth`] unless `width` is 1, 2, 4
    /// or 8, or an error for invalid operands.
    pub fn emit_store(&mut self, addr: Value, value: Value, width: u8) -> Result<(), EmitError> {
        let size = check_width(width)?;
        let addr = self.src(addr)?;
        let value = self.src(value)?;
        let check = self.routines().check_write;
        self.with_scratch(&[Reg::Rax, Reg::Rcx, Reg::Rdx], |e| {
            e.load_pair(addr, Reg::Rax, value, Reg::Rcx);
            e.call_check(check, width);
            e.emit(Inst::Store {
                mem: guest(),
                src: Reg::Rcx,
                size,
            });
            Ok(())
        })
    }

    /// Close the function, append the memory routines if used, and link.
    ///
    /// # Errors
    ///
    /// Fails if a label was placed twice or a referenced label was never
    /// placed.
    pub fn finish(self) -> Result<Linked, EmitError> {
        debug!(
            insts = self.inst_count(),
            memory = self.variant.routines.is_some(),
            "finishing aot function"
        );
        self.link_with(|e| match e.variant.routines {
            Some(routines) => e.emit_routines(routines),
            None => Ok(()),
        })
    }

    fn routines(&mut self) -> Routines {
        if let Some(routines) = self.variant.routines {
            return routines;
        }
        let routines = Routines {
            check_read: self.asm.new_label(),
            check_write: self.asm.new_label(),
            ensure_frames: self.asm.new_label(),
            out_of_bound: self.asm.new_label(),
            permission: self.asm.new_label(),
            ensure_frame: self.asm.new_label(),
        };
        self.variant.routines = Some(routines);
        routines
    }

    /// `rdx = width; call check; exit with rdx if non-zero`.
    fn call_check(&mut self, check: Label, width: u8) {
        self.emit(Inst::MovImm {
            dst: Reg::Rdx,
            imm: u64::from(width),
        });
        self.emit(Inst::Call { target: check });
        self.emit(Inst::Test {
            dst: Reg::Rdx,
            src: RegImm::Reg(Reg::Rdx),
        });
        self.exit_if(Cond::Ne, ExitSource::Rdx);
    }

    // ========================================================================
    // Memory routines
    // ========================================================================

    fn emit_routines(&mut self, r: Routines) -> Result<(), EmitError> {
        trace!("emitting memory routines");

        // check_read
        self.asm.bind(r.check_read)?;
        self.emit(Inst::Push { src: Reg::Rcx });
        self.check_bounds(r.out_of_bound);
        self.emit(Inst::Jmp {
            target: r.ensure_frames,
        });

        // check_write: every touched page must be writable before any is
        // marked dirty.
        self.asm.bind(r.check_write)?;
        self.emit(Inst::Push { src: Reg::Rcx });
        self.check_bounds(r.out_of_bound);
        for last in [false, true] {
            self.page_index(last);
            self.emit(Inst::TestMem {
                mem: flags(),
                imm: FLAG_WXORX_BIT,
            });
            self.emit(Inst::Jcc {
                cond: Cond::Ne,
                target: r.permission,
            });
        }
        for last in [false, true] {
            self.page_index(last);
            self.emit(Inst::AluMem {
                op: AluOp::Or,
                mem: flags(),
                src: RegImm::Imm(i32::from(FLAG_DIRTY)),
                size: Size::Byte,
            });
        }

        // Shared tail: initialize the first and last frame, succeed.
        self.asm.bind(r.ensure_frames)?;
        for last in [false, true] {
            self.last_byte_or_start(last);
            self.emit(Inst::Shift {
                op: ShiftOp::Shr,
                dst: Reg::Rcx,
                amount: Some(FRAME_SHIFT as u8),
            });
            self.emit(Inst::Call {
                target: r.ensure_frame,
            });
        }
        self.emit(Inst::Pop { dst: Reg::Rcx });
        self.emit(Inst::Alu {
            op: AluOp::Xor,
            dst: Reg::Rdx,
            src: Operand::Reg(Reg::Rdx),
        });
        self.emit(Inst::Ret);

        for (label, code) in [
            (r.out_of_bound, ExitCode::OutOfBound),
            (r.permission, ExitCode::InvalidPermission),
        ] {
            self.asm.bind(label)?;
            self.emit(Inst::Pop { dst: Reg::Rcx });
            self.emit(Inst::MovImm {
                dst: Reg::Rdx,
                imm: u64::from(code.as_raw()),
            });
            self.emit(Inst::Ret);
        }

        self.emit_ensure_frame(r.ensure_frame)
    }

    /// `addr + width` must not wrap and must stay within guest memory.
    fn check_bounds(&mut self, out_of_bound: Label) {
        self.emit(Inst::Mov {
            dst: Reg::Rcx,
            src: Reg::Rax,
        });
        self.emit(Inst::Alu {
            op: AluOp::Add,
            dst: Reg::Rcx,
            src: Operand::Reg(Reg::Rdx),
        });
        self.emit(Inst::Jcc {
            cond: Cond::B,
            target: out_of_bound,
        });
        // The runtime size field, capped at the backing array.
        for limit in [
            Operand::Mem(Mem::base(reserved::STATE_PTR, StateLayout::MEMORY_SIZE)),
            Operand::Imm(MAX_MEMORY as i32),
        ] {
            self.emit(Inst::Alu {
                op: AluOp::Cmp,
                dst: Reg::Rcx,
                src: limit,
            });
            self.emit(Inst::Jcc {
                cond: Cond::A,
                target: out_of_bound,
            });
        }
    }

    /// `rcx = addr` or `rcx = addr + width - 1`.
    fn last_byte_or_start(&mut self, last: bool) {
        if last {
            self.emit(Inst::Lea {
                dst: Reg::Rcx,
                mem: Mem::indexed(Reg::Rax, Reg::Rdx, -1),
            });
        } else {
            self.emit(Inst::Mov {
                dst: Reg::Rcx,
                src: Reg::Rax,
            });
        }
    }

    fn page_index(&mut self, last: bool) {
        self.last_byte_or_start(last);
        self.emit(Inst::Shift {
            op: ShiftOp::Shr,
            dst: Reg::Rcx,
            amount: Some(PAGE_SHIFT as u8),
        });
    }

    /// Fill frame `rcx` on first touch: zeros, or xorshift64 output in chaos
    /// mode.
    fn emit_ensure_frame(&mut self, entry: Label) -> Result<(), EmitError> {
        const CURSOR: Reg = Reg::Rdi;
        const END: Reg = Reg::Rsi;
        const SEED: Reg = Reg::R8;

        let done = self.asm.new_label();
        let restore = self.asm.new_label();
        let chaos = self.asm.new_label();
        let zero_loop = self.asm.new_label();
        let chaos_loop = self.asm.new_label();
        let frame = Mem::indexed(reserved::STATE_PTR, Reg::Rcx, StateLayout::FRAMES);
        let word = Mem::indexed(reserved::STATE_PTR, CURSOR, StateLayout::MEMORY);
        let seed = Mem::base(reserved::STATE_PTR, StateLayout::CHAOS_SEED);

        self.asm.bind(entry)?;
        self.emit(Inst::AluMem {
            op: AluOp::Cmp,
            mem: frame,
            src: RegImm::Imm(0),
            size: Size::Byte,
        });
        self.emit(Inst::Jcc {
            cond: Cond::Ne,
            target: done,
        });
        self.emit(Inst::StoreImm {
            mem: frame,
            imm: 1,
            size: Size::Byte,
        });
        for reg in [CURSOR, END, SEED] {
            self.emit(Inst::Push { src: reg });
        }
        self.emit(Inst::Mov {
            dst: CURSOR,
            src: Reg::Rcx,
        });
        self.emit(Inst::Shift {
            op: ShiftOp::Shl,
            dst: CURSOR,
            amount: Some(FRAME_SHIFT as u8),
        });
        self.emit(Inst::Lea {
            dst: END,
            mem: Mem::base(CURSOR, FRAME_SIZE as i32),
        });
        self.emit(Inst::AluMem {
            op: AluOp::Cmp,
            mem: Mem::base(reserved::STATE_PTR, StateLayout::CHAOS_MODE),
            src: RegImm::Imm(0),
            size: Size::Qword,
        });
        self.emit(Inst::Jcc {
            cond: Cond::Ne,
            target: chaos,
        });

        self.asm.bind(zero_loop)?;
        self.emit(Inst::StoreImm {
            mem: word,
            imm: 0,
            size: Size::Qword,
        });
        self.advance(CURSOR, END, zero_loop);
        self.emit(Inst::Jmp { target: restore });

        self.asm.bind(chaos)?;
        self.emit(Inst::Load {
            dst: SEED,
            mem: seed,
            size: Size::Qword,
        });
        self.asm.bind(chaos_loop)?;
        for (op, amount) in [(ShiftOp::Shl, 13), (ShiftOp::Shr, 7), (ShiftOp::Shl, 17)] {
            self.emit(Inst::Mov {
                dst: Reg::Rcx,
                src: SEED,
            });
            self.emit(Inst::Shift {
                op,
                dst: Reg::Rcx,
                amount: Some(amount),
            });
            self.emit(Inst::Alu {
                op: AluOp::Xor,
                dst: SEED,
                src: Operand::Reg(Reg::Rcx),
            });
        }
        self.emit(Inst::Store {
            mem: word,
            src: SEED,
            size: Size::Qword,
        });
        self.advance(CURSOR, END, chaos_loop);
        self.emit(Inst::Store {
            mem: seed,
            src: SEED,
            size: Size::Qword,
        });

        self.asm.bind(restore)?;
        for reg in [SEED, END, CURSOR] {
            self.emit(Inst::Pop { dst: reg });
        }
        self.asm.bind(done)?;
        self.emit(Inst::Ret);
        Ok(())
    }

    /// `cursor += 8; if cursor < end goto top`.
    fn advance(&mut self, cursor: Reg, end: Reg, top: Label) {
        self.emit(Inst::Alu {
            op: AluOp::Add,
            dst: cursor,
            src: Operand::Imm(8),
        });
        self.emit(Inst::Alu {
            op: AluOp::Cmp,
            dst: cursor,
            src: Operand::Reg(end),
        });
        self.emit(Inst::Jcc {
            cond: Cond::B,
            target: top,
        });
    }
}

/// Guest byte at `rax`.
const fn guest() -> Mem {
    Mem::indexed(reserved::STATE_PTR, Reg::Rax, StateLayout::MEMORY)
}

/// Page flags of page `rcx`.
const fn flags() -> Mem {
    Mem::indexed(reserved::STATE_PTR, Reg::Rcx, StateLayout::FLAGS)
}

/// Compile independent functions in parallel, one emission context each.
///
/// Results are returned in the order of `bodies`.
pub fn compile_batch<F>(config: &EmitConfig, bodies: &[F]) -> Vec<Result<Linked, EmitError>>
where
    F: Fn(&mut AotEmitter) -> Result<(), EmitError> + Sync,
{
    debug!(functions = bodies.len(), "compiling aot batch");
    bodies
        .par_iter()
        .map(|body| {
            let mut emitter = AotEmitter::new(config.clone())?;
            body(&mut emitter)?;
            emitter.finish()
        })
        .collect()
}
