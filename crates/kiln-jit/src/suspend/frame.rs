//! State-machine frame layout
//!
//! A suspended function keeps everything that must outlive one invocation in
//! its frame: the well-known fields (`state`, `sent`, `thrown`) plus numbered
//! slots for arguments, locals live across a suspension, cells, free
//! variables and spilled operand-stack values. The caller creates the frame,
//! fills the argument and free-variable slots with new references and nulls
//! everything else.

use kiln_bytecode::CodeObject;

use crate::analysis::BitSet;
use crate::ir::{FrameField, IrType};

/// What a numbered frame slot holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSlotKind {
    /// Positional argument `i`, filled by the caller
    Arg(u32),
    /// Local `varnames[i]` that is live across a suspension
    Local(u32),
    /// Cell variable `cellvars[i]`
    Cell(u32),
    /// Free variable `freevars[i]`, filled by the caller
    Free(u32),
    /// Operand-stack position `i` kept across a suspension
    Spill(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSlot {
    pub name: String,
    pub kind: FrameSlotKind,
}

/// Field assignment of one state machine's frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    pub slots: Vec<FrameSlot>,
    /// Frame field of every local slot index, `None` for per-invocation slots
    local_fields: Vec<Option<u32>>,
    spill_base: u32,
    spill_count: u32,
}

impl FrameLayout {
    /// Lay out the frame of `code`
    ///
    /// `live_across` holds the `varnames` indices live across any suspension
    /// point; `max_spill` is the deepest stack kept across one.
    pub fn build(code: &CodeObject, live_across: &BitSet, max_spill: u32) -> Self {
        let varnames = code.varnames.len();
        let mut slots = Vec::new();
        let mut local_fields = vec![None; code.slot_count()];
        let mut place =
            |slots: &mut Vec<FrameSlot>, index: usize, name: &str, kind: FrameSlotKind| {
                local_fields[index] = Some(slots.len() as u32);
                slots.push(FrameSlot { name: name.to_string(), kind });
            };

        for i in 0..code.arg_count as usize {
            place(&mut slots, i, &code.varnames[i], FrameSlotKind::Arg(i as u32));
        }
        for i in code.arg_count as usize..varnames {
            if live_across.contains(i) {
                place(&mut slots, i, &code.varnames[i], FrameSlotKind::Local(i as u32));
            }
        }
        for (j, name) in code.cellvars.iter().enumerate() {
            place(&mut slots, varnames + j, name, FrameSlotKind::Cell(j as u32));
        }
        for (j, name) in code.freevars.iter().enumerate() {
            let index = varnames + code.cellvars.len() + j;
            place(&mut slots, index, name, FrameSlotKind::Free(j as u32));
        }

        let spill_base = slots.len() as u32;
        for i in 0..max_spill {
            slots.push(FrameSlot { name: format!("stack{}", i), kind: FrameSlotKind::Spill(i) });
        }
        FrameLayout { slots, local_fields, spill_base, spill_count: max_spill }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Field types, all object references
    pub fn types(&self) -> Vec<IrType> {
        vec![IrType::Obj; self.slots.len()]
    }

    /// Frame field of local slot `index`, if it is frame-resident
    pub fn local_field(&self, index: usize) -> Option<FrameField> {
        self.local_fields.get(index).copied().flatten().map(FrameField::Slot)
    }

    /// Field holding spilled stack position `i`
    pub fn spill_field(&self, i: u32) -> FrameField {
        FrameField::Slot(self.spill_base + i)
    }

    pub fn spill_count(&self) -> u32 {
        self.spill_count
    }

    /// Field the caller fills with positional argument `i`
    pub fn arg_field(&self, i: u32) -> Option<FrameField> {
        self.find(FrameSlotKind::Arg(i))
    }

    /// Field the caller fills with free variable `j`
    pub fn freevar_field(&self, j: u32) -> Option<FrameField> {
        self.find(FrameSlotKind::Free(j))
    }

    fn find(&self, kind: FrameSlotKind) -> Option<FrameField> {
        self.slots.iter().position(|s| s.kind == kind).map(|i| FrameField::Slot(i as u32))
    }
}

impl std::fmt::Display for FrameLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame [state, sent, thrown")?;
        for (i, slot) in self.slots.iter().enumerate() {
            write!(f, ", f{}={}", i, slot.name)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_orders_fields() {
        let mut code = CodeObject::new("g");
        code.arg_count = 1;
        code.varnames = vec!["n".into(), "i".into(), "tmp".into()];
        code.freevars = vec!["outer".into()];
        let mut live = BitSet::new(3);
        live.insert(1);
        let layout = FrameLayout::build(&code, &live, 2);

        let names: Vec<_> = layout.slots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["n", "i", "outer", "stack0", "stack1"]);
        assert_eq!(layout.local_field(0), Some(FrameField::Slot(0)));
        assert_eq!(layout.local_field(1), Some(FrameField::Slot(1)));
        assert_eq!(layout.local_field(2), None);
        assert_eq!(layout.local_field(3), Some(FrameField::Slot(2)));
        assert_eq!(layout.spill_field(1), FrameField::Slot(4));
        assert_eq!(layout.arg_field(0), Some(FrameField::Slot(0)));
        assert_eq!(layout.freevar_field(0), Some(FrameField::Slot(2)));
        assert_eq!(
            layout.to_string(),
            "frame [state, sent, thrown, f0=n, f1=i, f2=outer, f3=stack0, f4=stack1]"
        );
    }
}
