//! Traversal order and back-edge detection
//!
//! Depth-first walk from the entry block with an explicit stack. `visited`
//! and `on_path` are bit sets indexed by [`BlockId`], so the traversal state
//! is plain data that tests can inspect. A normal edge whose target is on the
//! current path is a back-edge and does not constrain the emission order.
//! Exception edges are followed too, so handlers are ordered after the code
//! they protect, but they are never back-edges.

use super::bitset::BitSet;
use super::cfg::{BlockId, ControlFlowGraph};

/// Outcome of the depth-first walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Traversal {
    /// Blocks in the order they finished
    pub postorder: Vec<BlockId>,
    /// Reverse of `postorder`: every block after its forward predecessors
    pub rpo: Vec<BlockId>,
    /// `(from, to)` pairs of normal edges that close a cycle
    pub back_edges: Vec<(BlockId, BlockId)>,
    /// Blocks reachable from the entry
    pub visited: BitSet,
}

impl Traversal {
    pub fn is_reachable(&self, id: BlockId) -> bool {
        self.visited.contains(id.index())
    }

    pub fn is_back_edge(&self, from: BlockId, to: BlockId) -> bool {
        self.back_edges.contains(&(from, to))
    }

    /// Position of each block in `rpo`, `None` for unreachable blocks
    pub fn rpo_index(&self, block_count: usize) -> Vec<Option<usize>> {
        let mut index = vec![None; block_count];
        for (pos, id) in self.rpo.iter().enumerate() {
            index[id.index()] = Some(pos);
        }
        index
    }
}

/// One DFS frame: the block and the index of the next successor to try
struct Frame {
    block: BlockId,
    next: usize,
}

/// Compute reverse postorder and back-edges without modifying the graph
pub fn reverse_postorder(cfg: &ControlFlowGraph) -> Traversal {
    let n = cfg.blocks.len();
    let mut visited = BitSet::new(n);
    let mut on_path = BitSet::new(n);
    let mut postorder = Vec::with_capacity(n);
    let mut back_edges = Vec::new();

    if let Some(entry) = cfg.entry() {
        let mut stack = vec![Frame { block: entry, next: 0 }];
        visited.insert(entry.index());
        on_path.insert(entry.index());

        while let Some(frame) = stack.last_mut() {
            let from = frame.block;
            match cfg.traversal_successor(from, frame.next) {
                Some((to, exceptional)) => {
                    frame.next += 1;
                    if on_path.contains(to.index()) {
                        if !exceptional && !back_edges.contains(&(from, to)) {
                            back_edges.push((from, to));
                        }
                    } else if visited.insert(to.index()) {
                        on_path.insert(to.index());
                        stack.push(Frame { block: to, next: 0 });
                    }
                }
                None => {
                    on_path.remove(from.index());
                    postorder.push(from);
                    stack.pop();
                }
            }
        }
    }

    let rpo = postorder.iter().rev().copied().collect();
    Traversal { postorder, rpo, back_edges, visited }
}

/// Compute the traversal and record back-edges and loop headers on the graph
pub fn compute_order(cfg: &mut ControlFlowGraph) -> Traversal {
    let traversal = reverse_postorder(cfg);
    for &(from, to) in &traversal.back_edges {
        for edge in cfg.block_mut(from).succs.iter_mut() {
            if edge.target == to {
                edge.back_edge = true;
            }
        }
        cfg.block_mut(to).is_loop_header = true;
    }
    traversal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::cfg::{build_cfg, CfgOptions};
    use crate::analysis::decoder::decode_function;
    use kiln_bytecode::{Assembler, CodeObject, Constant, Opcode};

    fn cfg_of(asm: &Assembler) -> ControlFlowGraph {
        let mut code = CodeObject::new("test_func");
        code.constants = vec![Constant::None, Constant::Int(1)];
        code.varnames = vec!["x".into(), "a".into(), "i".into(), "n".into()];
        code.names = vec!["g".into()];
        let decoded = decode_function(&asm.finish_into(code).unwrap()).unwrap();
        build_cfg(decoded, CfgOptions::default()).unwrap()
    }

    fn ids(blocks: &[BlockId]) -> Vec<u32> {
        blocks.iter().map(|b| b.0).collect()
    }

    #[test]
    fn test_diamond_order() {
        let mut asm = Assembler::new();
        let orelse = asm.new_label();
        let join = asm.new_label();
        asm.emit(Opcode::LoadFast, 0);
        asm.jump(Opcode::PopJumpIfFalse, orelse).unwrap();
        asm.emit(Opcode::LoadConst, 1).emit(Opcode::StoreFast, 1);
        asm.jump(Opcode::JumpForward, join).unwrap();
        asm.bind(orelse).unwrap();
        asm.emit(Opcode::LoadConst, 0).emit(Opcode::StoreFast, 1);
        asm.bind(join).unwrap();
        asm.emit(Opcode::LoadFast, 1).op(Opcode::ReturnValue);
        let mut cfg = cfg_of(&asm);
        let order = compute_order(&mut cfg);
        assert_eq!(ids(&order.rpo), vec![0, 1, 2, 3]);
        assert!(order.back_edges.is_empty());
        assert!(cfg.blocks.iter().all(|b| !b.is_loop_header));
    }

    #[test]
    fn test_loop_back_edge() {
        let mut asm = Assembler::new();
        let head = asm.new_label();
        let exit = asm.new_label();
        asm.op(Opcode::Nop);
        asm.bind(head).unwrap();
        asm.fused(Opcode::LoadFastLoadFast, 2, 3).unwrap();
        asm.emit(Opcode::CompareOp, 0);
        asm.jump(Opcode::PopJumpIfFalse, exit).unwrap();
        asm.emit(Opcode::LoadFast, 2).emit(Opcode::LoadConst, 1).emit(Opcode::BinaryOp, 0);
        asm.emit(Opcode::StoreFast, 2);
        asm.jump(Opcode::JumpBackward, head).unwrap();
        asm.bind(exit).unwrap();
        asm.emit(Opcode::ReturnConst, 0);
        let mut cfg = cfg_of(&asm);
        let order = compute_order(&mut cfg);
        assert_eq!(order.back_edges, vec![(BlockId(2), BlockId(1))]);
        assert!(cfg.blocks[1].is_loop_header);
        assert!(cfg.blocks[2].succs[0].back_edge);
        // Header precedes both the body and the exit.
        let pos = order.rpo_index(cfg.blocks.len());
        assert!(pos[1] < pos[2] && pos[1] < pos[3]);
        assert!(order.visited.contains(3));
    }

    #[test]
    fn test_unreachable_block_not_visited() {
        let mut asm = Assembler::new();
        asm.emit(Opcode::ReturnConst, 0);
        asm.emit(Opcode::LoadConst, 1).op(Opcode::ReturnValue);
        let cfg = cfg_of(&asm);
        let order = reverse_postorder(&cfg);
        assert_eq!(cfg.blocks.len(), 2);
        assert!(!order.is_reachable(BlockId(1)));
        assert_eq!(ids(&order.rpo), vec![0]);
    }

    #[test]
    fn test_handler_after_protected_code() {
        let mut asm = Assembler::new();
        let start = asm.here();
        asm.emit(Opcode::LoadGlobal, 0);
        let end = asm.here();
        asm.op(Opcode::ReturnValue);
        let handler = asm.here();
        asm.op(Opcode::PopTop).emit(Opcode::ReturnConst, 0);
        asm.protect(start, end, handler, 0, false);
        let cfg = cfg_of(&asm);
        let order = reverse_postorder(&cfg);
        assert_eq!(ids(&order.rpo), vec![0, 1]);
        assert!(order.back_edges.is_empty());
    }
}
