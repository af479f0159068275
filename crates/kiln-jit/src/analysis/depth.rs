//! Stack-depth propagation
//!
//! Worklist fixed point over normal edges. The entry block starts at depth 0;
//! every exception handler is seeded from the table (`depth + lasti + 1`), so
//! blocks reached only through exception edges still get a depth. The depth
//! reaching a block must be identical along every edge.

use std::collections::VecDeque;

use super::cfg::{BlockId, ControlFlowGraph, EdgeKind};
use super::decoder::Instruction;
use super::effect::{self, StackEffect};
use crate::error::StructuralVerificationError;

/// Result of a successful propagation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepthSummary {
    /// Deepest stack reached anywhere in the function
    pub max_depth: u32,
    /// Blocks that received a depth
    pub reached_blocks: usize,
}

/// Effect of the instruction at the end of a block along one edge
///
/// The production table is [`effect::edge_effect`]; tests substitute their own.
pub type EdgeEffectFn<'a> = &'a dyn Fn(&Instruction, Option<EdgeKind>) -> StackEffect;

fn table_effect(instr: &Instruction, kind: Option<EdgeKind>) -> StackEffect {
    match kind {
        Some(kind) => effect::edge_effect(instr.opcode, instr.arg, kind),
        None => instr.effect(),
    }
}

/// Propagate depths using the opcode effect table
pub fn propagate_depths(
    cfg: &mut ControlFlowGraph,
) -> Result<DepthSummary, StructuralVerificationError> {
    propagate_depths_with(cfg, &table_effect)
}

/// Propagate depths using a caller-supplied effect function
///
/// `effect(instr, None)` is the in-block effect; `effect(instr, Some(kind))`
/// is the effect of a block's last instruction along an edge of `kind`.
pub fn propagate_depths_with(
    cfg: &mut ControlFlowGraph,
    effect: EdgeEffectFn<'_>,
) -> Result<DepthSummary, StructuralVerificationError> {
    let mut summary = DepthSummary::default();
    let Some(entry) = cfg.entry() else { return Ok(summary) };

    let mut worklist = VecDeque::new();
    cfg.block_mut(entry).entry_depth = Some(0);
    worklist.push_back(entry);

    seed_handlers(cfg, &mut worklist)?;

    while let Some(id) = worklist.pop_front() {
        let block_start = cfg.block(id).start;
        let Some(mut depth) = cfg.block(id).entry_depth else { continue };
        summary.max_depth = summary.max_depth.max(depth);

        let range = cfg.block(id).instrs.clone();
        let last = range.end - 1;
        for idx in range {
            let instr = cfg.instructions[idx];
            cfg.depth_before[idx] = Some(depth);
            check_region_depth(cfg, &instr, depth)?;

            let fx = effect(&instr, None);
            let after = fx.apply(depth).ok_or(StructuralVerificationError::StackUnderflow {
                opcode: instr.opcode,
                offset: instr.offset,
                pops: fx.pops,
                depth,
            })?;
            if idx != last {
                depth = after;
                summary.max_depth = summary.max_depth.max(depth);
                continue;
            }
            cfg.block_mut(id).exit_depth = Some(after);
            summary.max_depth = summary.max_depth.max(after);
        }

        let term = *cfg.terminator(id);
        let before = cfg.depth_before[last].unwrap_or(0);
        for edge in cfg.block(id).succs.clone() {
            let fx = effect(&term, Some(edge.kind));
            let out = fx.apply(before).ok_or(StructuralVerificationError::StackUnderflow {
                opcode: term.opcode,
                offset: term.offset,
                pops: fx.pops,
                depth: before,
            })?;
            summary.max_depth = summary.max_depth.max(out);

            let succ = cfg.block_mut(edge.target);
            if succ.is_exception_handler {
                return Err(StructuralVerificationError::HandlerWithNormalPredecessor(succ.start));
            }
            match succ.entry_depth {
                None => {
                    succ.entry_depth = Some(out);
                    worklist.push_back(edge.target);
                }
                Some(expected) if expected != out => {
                    tracing::trace!(
                        from = block_start,
                        to = succ.start,
                        expected,
                        found = out,
                        "depth mismatch"
                    );
                    return Err(StructuralVerificationError::DepthMismatch {
                        block: succ.start,
                        expected,
                        found: out,
                    });
                }
                Some(_) => {}
            }
        }
    }

    summary.reached_blocks = cfg.blocks.iter().filter(|b| b.entry_depth.is_some()).count();
    Ok(summary)
}

/// Give each handler block its table depth, rejecting conflicting declarations
fn seed_handlers(
    cfg: &mut ControlFlowGraph,
    worklist: &mut VecDeque<BlockId>,
) -> Result<(), StructuralVerificationError> {
    for region in cfg.regions.clone() {
        let Some(handler) = cfg.block_at(region.target) else { continue };
        let depth = region.handler_depth();
        let block = cfg.block_mut(handler);
        match block.entry_depth {
            None => {
                block.entry_depth = Some(depth);
                worklist.push_back(handler);
            }
            Some(first) if first != depth => {
                return Err(StructuralVerificationError::HandlerDepthConflict {
                    handler: region.target,
                    first,
                    second: depth,
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn check_region_depth(
    cfg: &ControlFlowGraph,
    instr: &Instruction,
    depth: u32,
) -> Result<(), StructuralVerificationError> {
    if let Some(region) = cfg.region_for(instr.offset).map(|r| cfg.regions[r]) {
        if region.depth > depth {
            return Err(StructuralVerificationError::RegionDepthExceedsStack {
                offset: instr.offset,
                region_depth: region.depth,
                depth,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::cfg::{build_cfg, CfgOptions};
    use crate::analysis::decoder::decode_function;
    use kiln_bytecode::{Assembler, CodeObject, Constant, Opcode};

    fn cfg_of(asm: &Assembler) -> ControlFlowGraph {
        let mut code = CodeObject::new("test_func");
        code.constants = vec![Constant::None, Constant::Int(1), Constant::Int(2)];
        code.varnames = vec!["x".into(), "a".into(), "i".into(), "n".into()];
        code.names = vec!["g".into(), "h".into()];
        let decoded = decode_function(&asm.finish_into(code).unwrap()).unwrap();
        build_cfg(decoded, CfgOptions::default()).unwrap()
    }

    fn while_loop(body_push: bool) -> Assembler {
        let mut asm = Assembler::new();
        let head = asm.new_label();
        let exit = asm.new_label();
        asm.op(Opcode::Nop);
        asm.bind(head).unwrap();
        asm.fused(Opcode::LoadFastLoadFast, 2, 3).unwrap();
        asm.emit(Opcode::CompareOp, 0);
        asm.jump(Opcode::PopJumpIfFalse, exit).unwrap();
        asm.emit(Opcode::LoadFast, 2).emit(Opcode::LoadConst, 1).emit(Opcode::BinaryOp, 0);
        if !body_push {
            asm.emit(Opcode::StoreFast, 2);
        }
        asm.jump(Opcode::JumpBackward, head).unwrap();
        asm.bind(exit).unwrap();
        asm.emit(Opcode::ReturnConst, 0);
        asm
    }

    #[test]
    fn test_straight_line_depths() {
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadConst, 1).emit(Opcode::LoadConst, 2).emit(Opcode::BinaryOp, 0);
        asm.op(Opcode::ReturnValue);
        let mut cfg = cfg_of(&asm);
        let summary = propagate_depths(&mut cfg).unwrap();
        let depths: Vec<_> = cfg.depth_before.iter().map(|d| d.unwrap()).collect();
        assert_eq!(depths, vec![0, 1, 2, 1]);
        assert_eq!(cfg.blocks[0].exit_depth, Some(0));
        assert_eq!(summary.max_depth, 2);
    }

    #[test]
    fn test_loop_header_depth_agrees() {
        let mut cfg = cfg_of(&while_loop(false));
        propagate_depths(&mut cfg).unwrap();
        for block in &cfg.blocks {
            assert_eq!(block.entry_depth, Some(0), "{}", block.id);
        }
    }

    #[test]
    fn test_loop_back_edge_mismatch() {
        let mut cfg = cfg_of(&while_loop(true));
        let err = propagate_depths(&mut cfg).unwrap_err();
        assert_eq!(
            err,
            StructuralVerificationError::DepthMismatch { block: 2, expected: 0, found: 1 }
        );
    }

    #[test]
    fn test_injected_effect_mismatch() {
        // A table that treats ForIter as symmetric loses the pushed item.
        let mut asm = Assembler::new();
        let head = asm.new_label();
        let done = asm.new_label();
        asm.emit(Opcode::LoadFast, 0).op(Opcode::GetIter);
        asm.bind(head).unwrap();
        asm.jump(Opcode::ForIter, done).unwrap();
        asm.emit(Opcode::StoreFast, 1);
        asm.jump(Opcode::JumpBackward, head).unwrap();
        asm.bind(done).unwrap();
        asm.op(Opcode::EndFor).emit(Opcode::ReturnConst, 0);

        let mut cfg = cfg_of(&asm);
        propagate_depths(&mut cfg).unwrap();

        let mut cfg = cfg_of(&asm);
        let corrupted = |instr: &Instruction, kind: Option<EdgeKind>| match (instr.opcode, kind) {
            (Opcode::ForIter, Some(_)) => StackEffect::new(1, 1),
            _ => table_effect(instr, kind),
        };
        let err = propagate_depths_with(&mut cfg, &corrupted).unwrap_err();
        assert_eq!(
            err,
            StructuralVerificationError::DepthMismatch { block: 4, expected: 1, found: 0 }
        );
    }

    #[test]
    fn test_for_iter_edges_get_distinct_depths() {
        let mut asm = Assembler::new();
        let head = asm.new_label();
        let done = asm.new_label();
        asm.emit(Opcode::LoadFast, 0).op(Opcode::GetIter);
        asm.bind(head).unwrap();
        asm.jump(Opcode::ForIter, done).unwrap();
        asm.emit(Opcode::StoreFast, 1);
        asm.jump(Opcode::JumpBackward, head).unwrap();
        asm.bind(done).unwrap();
        asm.op(Opcode::EndFor).emit(Opcode::ReturnConst, 0);
        let mut cfg = cfg_of(&asm);
        propagate_depths(&mut cfg).unwrap();
        assert_eq!(cfg.blocks[1].entry_depth, Some(1));
        assert_eq!(cfg.blocks[2].entry_depth, Some(2));
        assert_eq!(cfg.blocks[3].entry_depth, Some(1));
    }

    #[test]
    fn test_handler_seeded_from_table() {
        let mut asm = Assembler::new();
        let start = asm.here();
        asm.emit(Opcode::LoadConst, 1).emit(Opcode::LoadGlobal, 0).emit(Opcode::BinaryOp, 0);
        let end = asm.here();
        asm.op(Opcode::ReturnValue);
        let handler = asm.here();
        asm.op(Opcode::PopTop).op(Opcode::PopTop).emit(Opcode::ReturnConst, 0);
        asm.protect(start, end, handler, 0, true);
        let mut cfg = cfg_of(&asm);
        propagate_depths(&mut cfg).unwrap();
        assert_eq!(cfg.blocks[1].entry_depth, Some(2));
        assert!(cfg.blocks[1].preds.is_empty());
    }

    #[test]
    fn test_underflow() {
        let mut asm = Assembler::new();
        asm.op(Opcode::PopTop).emit(Opcode::ReturnConst, 0);
        let mut cfg = cfg_of(&asm);
        let err = propagate_depths(&mut cfg).unwrap_err();
        assert_eq!(
            err,
            StructuralVerificationError::StackUnderflow {
                opcode: Opcode::PopTop,
                offset: 0,
                pops: 1,
                depth: 0,
            }
        );
    }

    #[test]
    fn test_handler_depth_conflict() {
        let mut asm = Assembler::new();
        let a = asm.here();
        asm.emit(Opcode::LoadConst, 1);
        let b = asm.here();
        asm.emit(Opcode::LoadGlobal, 0);
        let c = asm.here();
        asm.op(Opcode::BinaryOp).op(Opcode::ReturnValue);
        let handler = asm.here();
        asm.op(Opcode::Reraise);
        asm.protect(a, b, handler, 0, false);
        asm.protect(b, c, handler, 1, false);
        let mut cfg = cfg_of(&asm);
        let err = propagate_depths(&mut cfg).unwrap_err();
        assert!(matches!(
            err,
            StructuralVerificationError::HandlerDepthConflict { first: 1, second: 2, .. }
        ));
    }

    #[test]
    fn test_region_deeper_than_stack() {
        let mut asm = Assembler::new();
        let start = asm.here();
        asm.emit(Opcode::LoadGlobal, 0);
        let end = asm.here();
        asm.op(Opcode::ReturnValue);
        let handler = asm.here();
        asm.op(Opcode::Reraise);
        asm.protect(start, end, handler, 2, false);
        let mut cfg = cfg_of(&asm);
        let err = propagate_depths(&mut cfg).unwrap_err();
        assert!(matches!(
            err,
            StructuralVerificationError::RegionDepthExceedsStack { region_depth: 2, depth: 0, .. }
        ));
    }
}
