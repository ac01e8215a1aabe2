//! Emit configuration.

use rvjit_state::{MAX_MEMORY, callbacks, validate_memory_size};

use crate::error::EmitError;

/// Default dynamic label table size.
pub const DEFAULT_MAX_LABELS: u32 = 65536;

/// Code generation configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmitConfig {
    /// Number of caller-visible dynamic labels.
    pub max_labels: u32,
    /// Guest memory size the host gives `MachineState::memory_size`.
    /// Generated code bounds accesses by that field at run time.
    pub memory_size: u64,
}

impl Default for EmitConfig {
    fn default() -> Self {
        Self {
            max_labels: DEFAULT_MAX_LABELS,
            memory_size: MAX_MEMORY as u64,
        }
    }
}

impl EmitConfig {
    #[must_use]
    pub const fn with_max_labels(mut self, max_labels: u32) -> Self {
        self.max_labels = max_labels;
        self
    }

    #[must_use]
    pub const fn with_memory_size(mut self, memory_size: u64) -> Self {
        self.memory_size = memory_size;
        self
    }

    /// Check the configuration before an emitter uses it.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty label table or an unusable memory size.
    pub const fn validate(&self) -> Result<(), EmitError> {
        if self.max_labels == 0 {
            return Err(EmitError::EmptyLabelTable);
        }
        if validate_memory_size(self.memory_size).is_err() {
            return Err(EmitError::InvalidMemorySize(self.memory_size));
        }
        Ok(())
    }
}

/// Host functions called by interpreter-style code for guest memory access.
///
/// Both follow the System V ABI:
/// - `load(state, addr, width) -> (exit, value)` in `rax:rdx`
/// - `store(state, addr, value, width) -> exit` in `rax`
///
/// A non-zero exit is returned from the generated function as its exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryCallbacks {
    pub load: u64,
    pub store: u64,
}

impl Default for MemoryCallbacks {
    /// The reference implementations from `rvjit_state::callbacks`.
    fn default() -> Self {
        Self {
            load: callbacks::load_address(),
            store: callbacks::store_address(),
        }
    }
}
