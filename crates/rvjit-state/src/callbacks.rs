//! `extern "C"` memory callbacks for interpreter-style generated code.
//!
//! Generated code calls these with the System V ABI. The exit value is `0`
//! on success, otherwise an [`ExitCode`](crate::ExitCode) value.

use crate::state::MachineState;

/// Result of a load callback, returned in `rax:rdx`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadResult {
    /// `0` on success, otherwise an exit code.
    pub exit: u64,
    /// Loaded value, zero-extended.
    pub value: u64,
}

/// Load `width` bytes from guest memory.
///
/// # Safety
///
/// `state` must point to a live `MachineState` not aliased elsewhere for the
/// duration of the call.
pub unsafe extern "C" fn load(state: *mut MachineState, addr: u64, width: u64) -> LoadResult {
    // SAFETY: guaranteed by the caller.
    let state = unsafe { &mut *state };
    load_checked(state, addr, width)
}

/// Store the low `width` bytes of `value` into guest memory.
///
/// # Safety
///
/// Same requirements as [`load`].
pub unsafe extern "C" fn store(state: *mut MachineState, addr: u64, value: u64, width: u64) -> u64 {
    // SAFETY: guaranteed by the caller.
    let state = unsafe { &mut *state };
    store_checked(state, addr, value, width)
}

/// Safe body of [`load`].
pub fn load_checked(state: &mut MachineState, addr: u64, width: u64) -> LoadResult {
    match state.load(addr, width) {
        Ok(value) => LoadResult { exit: 0, value },
        Err(err) => LoadResult {
            exit: u64::from(err.exit_code().as_raw()),
            value: 0,
        },
    }
}

/// Safe body of [`store`].
pub fn store_checked(state: &mut MachineState, addr: u64, value: u64, width: u64) -> u64 {
    match state.store(addr, value, width) {
        Ok(()) => 0,
        Err(err) => u64::from(err.exit_code().as_raw()),
    }
}

/// Host address of [`load`], as embedded in generated code.
#[must_use]
pub fn load_address() -> u64 {
    load as usize as u64
}

/// Host address of [`store`], as embedded in generated code.
#[must_use]
pub fn store_address() -> u64 {
    store as usize as u64
}
