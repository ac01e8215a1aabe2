//! Instruction buffer, label table and physical-register bookkeeping.

use tracing::warn;

use super::inst::{Inst, Label};
use super::registers::{Reg, RegSet};
use crate::error::EmitError;

/// Buffer entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Item {
    Inst(Inst),
    Label(Label),
}

#[derive(Clone, Copy, Debug, Default)]
struct LabelState {
    placed: bool,
    referenced: bool,
}

/// Append-only instruction buffer for one translation unit.
///
/// Labels `0..max_labels` are the caller's dynamic labels, bounds-checked on
/// every use. Emitter-internal labels are allocated above that range.
pub struct Assembler {
    items: Vec<Item>,
    labels: Vec<LabelState>,
    max_labels: u32,
    /// Registers the caller (or an enclosing operation) currently holds.
    in_use: RegSet,
    /// 8-byte slots pushed since the prologue, on the fall-through path.
    depth: u32,
    /// First label error; linking fails with it.
    error: Option<EmitError>,
}

impl Assembler {
    #[must_use]
    pub fn new(max_labels: u32) -> Self {
        Self {
            items: Vec::new(),
            labels: vec![LabelState::default(); max_labels as usize],
            max_labels,
            in_use: RegSet::empty(),
            depth: 0,
            error: None,
        }
    }

    /// Caller-visible label `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::LabelOutOfRange`] if `id` exceeds the table.
    pub fn dynamic_label(&self, id: u32) -> Result<Label, EmitError> {
        if id >= self.max_labels {
            warn!(id, max = self.max_labels, "label index out of range");
            return Err(EmitError::LabelOutOfRange {
                id,
                max: self.max_labels,
            });
        }
        Ok(Label(id))
    }

    /// Allocate an emitter-internal label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(LabelState::default());
        label
    }

    /// Place `label` at the current position.
    ///
    /// # Errors
    ///
    /// Returns [`EmitError::DuplicateLabel`] if the label was already placed.
    /// The error is also remembered so that linking fails.
    pub fn bind(&mut self, label: Label) -> Result<(), EmitError> {
        let state = &mut self.labels[label.0 as usize];
        if state.placed {
            warn!(label = label.0, "label placed twice");
            let err = EmitError::DuplicateLabel(label.0);
            self.error.get_or_insert(err.clone());
            return Err(err);
        }
        state.placed = true;
        self.items.push(Item::Label(label));
        Ok(())
    }

    pub fn emit(&mut self, inst: Inst) {
        if let Some(label) = inst.label_ref() {
            self.labels[label.0 as usize].referenced = true;
        }
        self.depth = self.depth.saturating_add_signed(inst.stack_effect() / 8);
        self.items.push(Item::Inst(inst));
    }

    /// Stack slots pushed since the prologue.
    #[must_use]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    /// Start counting pushes from here (end of the prologue).
    pub const fn reset_depth(&mut self) {
        self.depth = 0;
    }

    #[must_use]
    pub const fn is_in_use(&self, reg: Reg) -> bool {
        self.in_use.contains(reg)
    }

    #[must_use]
    pub const fn in_use(&self) -> RegSet {
        self.in_use
    }

    pub const fn mark(&mut self, reg: Reg) {
        self.in_use.insert(reg);
    }

    pub const fn unmark(&mut self, reg: Reg) {
        self.in_use.remove(reg);
    }

    /// Claim `reg` as scratch: save it if someone holds it, else mark it.
    /// Returns whether it was saved.
    pub fn acquire(&mut self, reg: Reg) -> bool {
        if self.in_use.contains(reg) {
            self.emit(Inst::Push { src: reg });
            true
        } else {
            self.in_use.insert(reg);
            false
        }
    }

    /// Undo a matching [`acquire`](Self::acquire).
    pub fn release(&mut self, reg: Reg, saved: bool) {
        if saved {
            self.emit(Inst::Pop { dst: reg });
        } else {
            self.in_use.remove(reg);
        }
    }

    #[must_use]
    pub const fn max_labels(&self) -> u32 {
        self.max_labels
    }

    /// Number of buffered instructions.
    #[must_use]
    pub fn inst_count(&self) -> usize {
        self.items.iter().filter(|item| matches!(item, Item::Inst(_))).count()
    }

    /// Buffered items, for tests and diagnostics.
    #[must_use]
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Consume the buffer, checking that every referenced label is placed.
    ///
    /// # Errors
    ///
    /// Returns the first recorded label error, or
    /// [`EmitError::UnresolvedLabel`] for the first dangling reference.
    pub fn finish(self) -> Result<(Vec<Item>, u32, usize), EmitError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if let Some(id) = self.labels.iter().position(|l| l.referenced && !l.placed) {
            warn!(label = id, "unresolved label");
            return Err(EmitError::UnresolvedLabel(id as u32));
        }
        let labels = self.labels.len();
        Ok((self.items, self.max_labels, labels))
    }
}
