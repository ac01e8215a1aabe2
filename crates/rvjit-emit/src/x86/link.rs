//! Label resolution and final code layout.

use std::fmt;

use tracing::debug;

use super::assembler::{Assembler, Item};
use super::encode::{encode, encoded_len};
use super::inst::{Inst, Label};
use crate::error::EmitError;

/// Linked, position-independent machine code.
#[derive(Clone, Debug)]
pub struct Linked {
    code: Vec<u8>,
    /// Every instruction with its byte offset.
    insts: Vec<(usize, Inst)>,
    /// Label placements in buffer order.
    placements: Vec<(usize, Label)>,
    /// Offset per label id; `None` for labels never placed.
    offsets: Vec<Option<usize>>,
    max_labels: u32,
}

impl Linked {
    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[must_use]
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Byte offset of dynamic label `id`, if it was placed.
    #[must_use]
    pub fn label_offset(&self, id: u32) -> Option<usize> {
        if id >= self.max_labels {
            return None;
        }
        self.offsets.get(id as usize).copied().flatten()
    }

    /// Byte offset of any label.
    #[must_use]
    pub fn offset_of(&self, label: Label) -> Option<usize> {
        self.offsets.get(label.0 as usize).copied().flatten()
    }

    /// Instructions with their byte offsets.
    #[must_use]
    pub fn instructions(&self) -> &[(usize, Inst)] {
        &self.insts
    }

    /// AT&T-syntax disassembly with offsets and encodings.
    #[must_use]
    pub fn listing(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Linked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut labels = self.placements.iter().peekable();
        for (i, &(offset, inst)) in self.insts.iter().enumerate() {
            while let Some(&&(at, label)) = labels.peek() {
                if at > offset {
                    break;
                }
                writeln!(f, "{label}:")?;
                labels.next();
            }
            let end = self.insts.get(i + 1).map_or(self.code.len(), |&(next, _)| next);
            let bytes: String = self.code[offset..end]
                .iter()
                .map(|byte| format!("{byte:02x} "))
                .collect();
            writeln!(f, "{offset:6x}:  {bytes:<33}{inst}")?;
        }
        for (_, label) in labels {
            writeln!(f, "{label}:")?;
        }
        Ok(())
    }
}

/// Resolve labels and encode the buffer.
///
/// # Errors
///
/// Fails if a label was placed twice or a referenced label was never placed.
/// Nothing is produced on failure.
pub fn link(asm: Assembler) -> Result<Linked, EmitError> {
    let (items, max_labels, num_labels) = asm.finish()?;

    // Pass 1: every encoding has a fixed length, so offsets are final.
    let mut offsets = vec![None; num_labels];
    let mut placements = Vec::new();
    let mut insts = Vec::with_capacity(items.len());
    let mut at = 0;
    for item in &items {
        match *item {
            Item::Label(label) => {
                offsets[label.0 as usize] = Some(at);
                placements.push((at, label));
            }
            Item::Inst(inst) => {
                insts.push((at, inst));
                at += encoded_len(&inst);
            }
        }
    }

    // Pass 2: encode with resolved targets.
    let mut code = Vec::with_capacity(at);
    for &(offset, inst) in &insts {
        debug_assert_eq!(code.len(), offset);
        encode(
            &inst,
            offset,
            |label| offsets[label.0 as usize].unwrap_or(offset),
            &mut code,
        );
    }

    debug!(
        insts = insts.len(),
        bytes = code.len(),
        labels = placements.len(),
        "linked"
    );
    Ok(Linked {
        code,
        insts,
        placements,
        offsets,
        max_labels,
    })
}
