//! Stack-SSA construction
//!
//! Operand-stack positions at a block with several normal predecessors are
//! merged through placeholders. Pass 1 opens one placeholder per stack
//! position of every such block, each backed by an IR phi. Pass 2 delivers one
//! incoming value per predecessor edge as those predecessors are lowered; a
//! loop header's placeholders are read before its back-edge arrives, so a
//! stack entry is a [`StackValue`] that may still be pending.
//!
//! Locals are never merged: they live in slots.

use rustc_hash::FxHashMap;

use crate::analysis::{BlockId, ControlFlowGraph, Traversal};
use crate::error::StructuralVerificationError;
use crate::ir::{BlockRef, ValueId};

/// A merge placeholder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MergeId(pub u32);

impl std::fmt::Display for MergeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// One operand-stack entry during lowering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackValue {
    /// A value produced earlier on this path
    Concrete(ValueId),
    /// A merged position whose incoming values may not all be known yet
    Pending(MergeId),
}

/// Placeholders needed at one merge block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSpec {
    /// One per stack position on entry
    pub placeholders: u32,
    /// Incoming edges each placeholder waits for
    pub predecessors: usize,
}

/// Merge requirements of every block, indexed by [`BlockId`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub blocks: Vec<Option<MergeSpec>>,
}

impl MergePlan {
    pub fn get(&self, block: BlockId) -> Option<MergeSpec> {
        self.blocks.get(block.index()).copied().flatten()
    }

    /// Total placeholders across the function
    pub fn placeholder_count(&self) -> usize {
        self.blocks.iter().flatten().map(|s| s.placeholders as usize).sum()
    }

    /// Number of reachable incoming edges per block
    pub fn predecessor_count(&self, block: BlockId) -> usize {
        self.get(block).map(|s| s.predecessors).unwrap_or(0)
    }
}

/// Normal incoming edges of `block` from reachable code
///
/// The entry block also counts the edge from the function prologue.
pub fn reachable_predecessors(
    cfg: &ControlFlowGraph,
    traversal: &Traversal,
    block: BlockId,
) -> usize {
    let b = cfg.block(block);
    let from_code = b.preds.iter().filter(|p| traversal.is_reachable(p.from)).count();
    from_code + b.is_entry as usize
}

/// Decide which blocks need placeholders and how many
///
/// Depths must already be propagated.
pub fn plan_merges(cfg: &ControlFlowGraph, traversal: &Traversal) -> MergePlan {
    let blocks = cfg
        .blocks
        .iter()
        .map(|block| {
            if !traversal.is_reachable(block.id) {
                return None;
            }
            let predecessors = reachable_predecessors(cfg, traversal, block.id);
            let placeholders = block.entry_depth.unwrap_or(0);
            (predecessors > 1 && placeholders > 0).then_some(MergeSpec {
                placeholders,
                predecessors,
            })
        })
        .collect();
    MergePlan { blocks }
}

#[derive(Debug, Clone)]
struct Placeholder {
    block: BlockId,
    dest: ValueId,
    expected: usize,
    incoming: Vec<(BlockRef, ValueId)>,
    complete: bool,
}

/// Placeholders of the function being lowered
#[derive(Debug, Clone, Default)]
pub struct MergeTable {
    entries: Vec<Placeholder>,
    by_block: FxHashMap<BlockId, Vec<MergeId>>,
}

impl MergeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open one placeholder per phi destination of `block`, bottom of stack first
    pub fn open(&mut self, block: BlockId, dests: &[ValueId], expected: usize) -> Vec<MergeId> {
        let ids: Vec<MergeId> = dests
            .iter()
            .map(|&dest| {
                let id = MergeId(self.entries.len() as u32);
                self.entries.push(Placeholder {
                    block,
                    dest,
                    expected,
                    incoming: Vec::with_capacity(expected),
                    complete: false,
                });
                id
            })
            .collect();
        self.by_block.insert(block, ids.clone());
        ids
    }

    /// Placeholders of `block`, if it is a merge block
    pub fn placeholders(&self, block: BlockId) -> Option<&[MergeId]> {
        self.by_block.get(&block).map(Vec::as_slice)
    }

    /// The entry stack of a merge block
    pub fn entry_stack(&self, block: BlockId) -> Option<Vec<StackValue>> {
        self.placeholders(block).map(|ids| ids.iter().map(|&id| StackValue::Pending(id)).collect())
    }

    /// Deliver the value arriving along the edge from IR block `from`
    ///
    /// Returns the full incoming list when this was the last expected value.
    pub fn add_incoming(
        &mut self,
        id: MergeId,
        from: BlockRef,
        value: ValueId,
    ) -> Result<Option<Vec<(BlockRef, ValueId)>>, StructuralVerificationError> {
        let entry = self.entries.get_mut(id.0 as usize).ok_or_else(|| {
            StructuralVerificationError::MalformedIr(format!("unknown placeholder {}", id))
        })?;
        if entry.complete {
            return Err(StructuralVerificationError::PlaceholderCompletedTwice(id.0));
        }
        entry.incoming.push((from, value));
        if entry.incoming.len() == entry.expected {
            entry.complete = true;
            Ok(Some(entry.incoming.clone()))
        } else {
            Ok(None)
        }
    }

    /// The IR value standing for a stack entry
    pub fn resolve(&self, value: StackValue) -> ValueId {
        match value {
            StackValue::Concrete(v) => v,
            StackValue::Pending(id) => self.entries[id.0 as usize].dest,
        }
    }

    /// Block a placeholder belongs to
    pub fn block_of(&self, id: MergeId) -> BlockId {
        self.entries[id.0 as usize].block
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.complete).count()
    }

    /// Check that every placeholder received all of its incoming values
    pub fn finish(&self) -> Result<(), StructuralVerificationError> {
        for (idx, entry) in self.entries.iter().enumerate() {
            if !entry.complete {
                return Err(StructuralVerificationError::PlaceholderUnresolved {
                    id: idx as u32,
                    received: entry.incoming.len(),
                    expected: entry.expected,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::cfg::build_cfg;
    use crate::analysis::{compute_order, decode_function, propagate_depths, CfgOptions};
    use kiln_bytecode::{Assembler, CodeObject, Constant, Opcode};

    fn analyzed(code: &CodeObject) -> (ControlFlowGraph, Traversal) {
        let decoded = decode_function(code).unwrap();
        let mut cfg = build_cfg(decoded, CfgOptions::default()).unwrap();
        propagate_depths(&mut cfg).unwrap();
        let traversal = compute_order(&mut cfg);
        (cfg, traversal)
    }

    /// `return 1 if x else 2` in stack form: the join has depth 1 and two preds
    fn ternary() -> CodeObject {
        let mut code = CodeObject::new("t");
        code.arg_count = 1;
        code.varnames = vec!["x".into()];
        code.constants = vec![Constant::Int(1), Constant::Int(2)];
        let mut asm = Assembler::new();
        let other = asm.new_label();
        let join = asm.new_label();
        asm.emit(Opcode::LoadFast, 0);
        asm.jump(Opcode::PopJumpIfFalse, other).unwrap();
        asm.emit(Opcode::LoadConst, 0);
        asm.jump(Opcode::JumpForward, join).unwrap();
        asm.bind(other).unwrap();
        asm.emit(Opcode::LoadConst, 1);
        asm.bind(join).unwrap();
        asm.op(Opcode::ReturnValue);
        asm.finish_into(code).unwrap()
    }

    #[test]
    fn test_plan_counts_equal_entry_depth() {
        let (cfg, traversal) = analyzed(&ternary());
        let plan = plan_merges(&cfg, &traversal);
        let join = cfg.block_at(10).unwrap();
        assert_eq!(plan.get(join), Some(MergeSpec { placeholders: 1, predecessors: 2 }));
        assert_eq!(plan.placeholder_count(), 1);
        assert_eq!(plan.get(cfg.entry().unwrap()), None);
    }

    #[test]
    fn test_table_completes_on_last_incoming() {
        let mut table = MergeTable::new();
        let ids = table.open(BlockId(3), &[ValueId(10), ValueId(11)], 2);
        assert_eq!(
            table.entry_stack(BlockId(3)),
            Some(vec![StackValue::Pending(ids[0]), StackValue::Pending(ids[1])])
        );
        assert_eq!(table.resolve(StackValue::Pending(ids[1])), ValueId(11));
        assert_eq!(table.add_incoming(ids[0], BlockRef(1), ValueId(1)).unwrap(), None);
        let done = table.add_incoming(ids[0], BlockRef(2), ValueId(2)).unwrap();
        assert_eq!(done, Some(vec![(BlockRef(1), ValueId(1)), (BlockRef(2), ValueId(2))]));
        assert_eq!(table.completed_count(), 1);
        assert_eq!(
            table.finish(),
            Err(StructuralVerificationError::PlaceholderUnresolved {
                id: 1,
                received: 0,
                expected: 2,
            })
        );
    }

    #[test]
    fn test_completing_twice_is_an_error() {
        let mut table = MergeTable::new();
        let ids = table.open(BlockId(0), &[ValueId(0)], 1);
        table.add_incoming(ids[0], BlockRef(0), ValueId(5)).unwrap();
        assert_eq!(
            table.add_incoming(ids[0], BlockRef(1), ValueId(6)),
            Err(StructuralVerificationError::PlaceholderCompletedTwice(0))
        );
    }
}
