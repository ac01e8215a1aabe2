//! Guest memory protection model and reference access path.
//!
//! Memory is split into pages (permission granularity) and frames (lazy
//! initialization granularity). Generated AOT code enforces the same rules
//! inline; the functions here are the host-side equivalent used by the
//! interpreter-style emitter's callbacks.

use thiserror::Error;
use tracing::trace;

use crate::exit::ExitCode;
use crate::state::MachineState;

/// Maximum guest memory (4MB).
pub const MAX_MEMORY: usize = 4 << 20;

pub const PAGE_SHIFT: u32 = 12;
/// Permission granularity (4KB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const MAX_PAGES: usize = MAX_MEMORY / PAGE_SIZE;

pub const FRAME_SHIFT: u32 = 18;
/// Lazy-initialization granularity (256KB).
pub const FRAME_SIZE: usize = 1 << FRAME_SHIFT;
pub const MAX_FRAMES: usize = MAX_MEMORY / FRAME_SIZE;

/// Page may no longer change permissions.
pub const FLAG_FREEZED: u8 = 0b001;
/// Page is executable (and therefore not writable).
pub const FLAG_EXECUTABLE: u8 = 0b010;
/// Write-xor-execute bit.
pub const FLAG_WXORX_BIT: u8 = FLAG_EXECUTABLE;
/// Value of the W^X bit on a writable page.
pub const FLAG_WRITABLE: u8 = 0;
/// Page has been written since it was loaded.
pub const FLAG_DIRTY: u8 = 0b100;

/// Guest memory access error.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("access of {width} bytes at {addr:#x} is out of bounds")]
    OutOfBound { addr: u64, width: u64 },

    #[error("page {page} is not writable")]
    InvalidPermission { page: u64 },

    #[error("unsupported access width: {0}")]
    InvalidWidth(u64),

    #[error("invalid memory size: {0:#x}")]
    InvalidSize(u64),
}

impl MemoryError {
    /// Exit code generated code reports for the same failure.
    #[must_use]
    pub const fn exit_code(&self) -> ExitCode {
        match self {
            Self::InvalidPermission { .. } => ExitCode::InvalidPermission,
            Self::OutOfBound { .. } | Self::InvalidWidth(_) | Self::InvalidSize(_) => {
                ExitCode::OutOfBound
            }
        }
    }
}

/// Check that `size` is usable as a guest memory size.
///
/// # Errors
///
/// Returns [`MemoryError::InvalidSize`] if `size` is zero, larger than
/// [`MAX_MEMORY`], or not a whole number of frames.
pub const fn validate_memory_size(size: u64) -> Result<(), MemoryError> {
    if size == 0 || size > MAX_MEMORY as u64 || size % FRAME_SIZE as u64 != 0 {
        return Err(MemoryError::InvalidSize(size));
    }
    Ok(())
}

/// One xorshift64 step, as performed by chaos-mode frame initialization.
#[must_use]
pub const fn xorshift64(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

impl MachineState {
    /// Load `width` bytes at `addr`, zero-extended.
    ///
    /// # Errors
    ///
    /// Returns an error for unsupported widths and out-of-bounds accesses.
    pub fn load(&mut self, addr: u64, width: u64) -> Result<u64, MemoryError> {
        self.check_bounds(addr, width)?;
        self.ensure_frames(addr, width);
        let start = usize::try_from(addr).map_err(|_| MemoryError::OutOfBound { addr, width })?;
        let mut bytes = [0u8; 8];
        bytes[..width as usize].copy_from_slice(&self.memory[start..start + width as usize]);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Store the low `width` bytes of `value` at `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error for unsupported widths, out-of-bounds accesses, and
    /// stores touching a page without write permission. A failed store
    /// leaves memory and page flags untouched.
    pub fn store(&mut self, addr: u64, value: u64, width: u64) -> Result<(), MemoryError> {
        self.check_bounds(addr, width)?;
        let first = addr >> PAGE_SHIFT;
        let last = (addr + width - 1) >> PAGE_SHIFT;
        for page in first..=last {
            if self.flags[page as usize] & FLAG_WXORX_BIT != FLAG_WRITABLE {
                trace!(page, "store to non-writable page");
                return Err(MemoryError::InvalidPermission { page });
            }
        }
        for page in first..=last {
            self.flags[page as usize] |= FLAG_DIRTY;
        }
        self.ensure_frames(addr, width);
        let start = addr as usize;
        self.memory[start..start + width as usize]
            .copy_from_slice(&value.to_le_bytes()[..width as usize]);
        Ok(())
    }

    /// Set protection flags for the pages covering `[addr, addr + len)`.
    ///
    /// Pages carrying [`FLAG_FREEZED`] keep their flags; the call then
    /// fails without changing any page.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::OutOfBound`] if the range leaves guest memory
    /// and [`MemoryError::InvalidPermission`] if it covers a frozen page.
    pub fn set_flags(&mut self, addr: u64, len: u64, flags: u8) -> Result<(), MemoryError> {
        let end = addr
            .checked_add(len)
            .filter(|&end| end <= self.memory_limit())
            .ok_or(MemoryError::OutOfBound { addr, width: len })?;
        if len == 0 {
            return Ok(());
        }
        let pages = (addr >> PAGE_SHIFT)..=((end - 1) >> PAGE_SHIFT);
        if let Some(page) = pages
            .clone()
            .find(|&page| self.flags[page as usize] & FLAG_FREEZED != 0)
        {
            trace!(page, "flags change on frozen page");
            return Err(MemoryError::InvalidPermission { page });
        }
        for page in pages {
            self.flags[page as usize] = flags;
        }
        Ok(())
    }

    /// Usable guest memory: `memory_size`, capped at the backing array.
    #[must_use]
    pub const fn memory_limit(&self) -> u64 {
        if self.memory_size < MAX_MEMORY as u64 {
            self.memory_size
        } else {
            MAX_MEMORY as u64
        }
    }

    fn check_bounds(&self, addr: u64, width: u64) -> Result<(), MemoryError> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(MemoryError::InvalidWidth(width));
        }
        match addr.checked_add(width) {
            Some(end) if end <= self.memory_limit() => Ok(()),
            _ => Err(MemoryError::OutOfBound { addr, width }),
        }
    }

    /// Initialize the frames holding the first and last byte of an access.
    fn ensure_frames(&mut self, addr: u64, width: u64) {
        self.init_frame(addr >> FRAME_SHIFT);
        self.init_frame((addr + width - 1) >> FRAME_SHIFT);
    }

    fn init_frame(&mut self, frame: u64) {
        let frame = frame as usize;
        if self.frames[frame] != 0 {
            return;
        }
        self.frames[frame] = 1;
        let start = frame * FRAME_SIZE;
        let chunk = &mut self.memory[start..start + FRAME_SIZE];
        if self.chaos_mode == 0 {
            chunk.fill(0);
        } else {
            let mut seed = self.chaos_seed;
            for word in chunk.chunks_exact_mut(8) {
                seed = xorshift64(seed);
                word.copy_from_slice(&seed.to_le_bytes());
            }
            self.chaos_seed = seed;
        }
        trace!(frame, chaos = self.chaos_mode != 0, "initialized frame");
    }
}
