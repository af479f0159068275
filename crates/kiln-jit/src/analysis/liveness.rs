//! Backward liveness of local variables
//!
//! Only `varnames` slots are tracked; cells and free variables are always
//! heap-resident. A protected block may transfer to its handler before any of
//! its stores, so the handler's live-in set flows into both the live-in and
//! live-out sets of every block it protects.

use kiln_bytecode::Opcode;

use super::bitset::BitSet;
use super::cfg::{BlockId, ControlFlowGraph};

/// Per-block live-in and live-out sets over local slots
#[derive(Debug, Clone)]
pub struct Liveness {
    pub live_in: Vec<BitSet>,
    pub live_out: Vec<BitSet>,
    locals: usize,
}

/// Uses before definition and definitions of one block
fn gen_kill(cfg: &ControlFlowGraph, id: BlockId, locals: usize) -> (BitSet, BitSet) {
    let mut uses = BitSet::new(locals);
    let mut defs = BitSet::new(locals);
    for instr in cfg.instrs(id) {
        let slot = instr.arg as usize;
        if slot >= locals {
            continue;
        }
        match instr.opcode {
            // Deleting reads the old binding to release and unbound-check it.
            Opcode::LoadFast | Opcode::DeleteFast => {
                if !defs.contains(slot) {
                    uses.insert(slot);
                }
                if instr.opcode == Opcode::DeleteFast {
                    defs.insert(slot);
                }
            }
            Opcode::StoreFast => {
                defs.insert(slot);
            }
            _ => {}
        }
    }
    (uses, defs)
}

impl Liveness {
    /// Solve the dataflow equations for `locals` slots
    pub fn compute(cfg: &ControlFlowGraph, locals: usize) -> Self {
        let n = cfg.blocks.len();
        let mut gens = Vec::with_capacity(n);
        let mut kills = Vec::with_capacity(n);
        for block in &cfg.blocks {
            let (g, k) = gen_kill(cfg, block.id, locals);
            gens.push(g);
            kills.push(k);
        }

        let mut live_in = vec![BitSet::new(locals); n];
        let mut live_out = vec![BitSet::new(locals); n];
        let mut changed = true;
        while changed {
            changed = false;
            for idx in (0..n).rev() {
                let block = &cfg.blocks[idx];
                let mut out = BitSet::new(locals);
                for succ in cfg.successors(block.id) {
                    out.union_with(&live_in[succ.index()]);
                }
                let mut handlers = BitSet::new(locals);
                for edge in &block.exception_edges {
                    handlers.union_with(&live_in[edge.handler.index()]);
                }
                out.union_with(&handlers);

                let mut inn = out.clone();
                inn.subtract(&kills[idx]);
                inn.union_with(&gens[idx]);
                inn.union_with(&handlers);

                changed |= live_out[idx].union_with(&out);
                changed |= live_in[idx].union_with(&inn);
            }
        }
        Liveness { live_in, live_out, locals }
    }

    /// Number of tracked slots
    pub fn locals(&self) -> usize {
        self.locals
    }

    pub fn is_live_in(&self, block: BlockId, slot: usize) -> bool {
        self.live_in[block.index()].contains(slot)
    }

    /// Locals that must survive the suspension ending `block`
    ///
    /// That is everything live into the resumption successor, plus everything
    /// live into the handler that would receive an exception thrown into the
    /// suspended frame.
    pub fn live_across(&self, cfg: &ControlFlowGraph, block: BlockId) -> BitSet {
        let mut live = BitSet::new(self.locals);
        for succ in cfg.successors(block) {
            live.union_with(&self.live_in[succ.index()]);
        }
        let offset = cfg.terminator(block).offset;
        if let Some(region) = cfg.region_for(offset) {
            if let Some(handler) = cfg.block_at(cfg.regions[region].target) {
                live.union_with(&self.live_in[handler.index()]);
            }
        }
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::cfg::{build_cfg, CfgOptions};
    use crate::analysis::decoder::decode_function;
    use kiln_bytecode::{Assembler, CodeObject, Constant};

    fn cfg_of(asm: &Assembler, split: bool) -> ControlFlowGraph {
        let mut code = CodeObject::new("test_func");
        code.constants = vec![Constant::None, Constant::Int(1)];
        code.varnames = vec!["i".into(), "n".into(), "tmp".into()];
        let decoded = decode_function(&asm.finish_into(code).unwrap()).unwrap();
        build_cfg(decoded, CfgOptions { split_suspensions: split }).unwrap()
    }

    /// `while i < n: yield i; i = i + 1` with `tmp` written and read only before the loop
    fn counting_generator() -> Assembler {
        let mut asm = Assembler::new();
        let head = asm.new_label();
        let exit = asm.new_label();
        asm.emit(Opcode::LoadConst, 1).emit(Opcode::StoreFast, 2);
        asm.emit(Opcode::LoadFast, 2).op(Opcode::PopTop);
        asm.bind(head).unwrap();
        asm.fused(Opcode::LoadFastLoadFast, 0, 1).unwrap();
        asm.emit(Opcode::CompareOp, 0);
        asm.jump(Opcode::PopJumpIfFalse, exit).unwrap();
        asm.emit(Opcode::LoadFast, 0).op(Opcode::YieldValue).op(Opcode::PopTop);
        asm.emit(Opcode::LoadFast, 0).emit(Opcode::LoadConst, 1).emit(Opcode::BinaryOp, 0);
        asm.emit(Opcode::StoreFast, 0);
        asm.jump(Opcode::JumpBackward, head).unwrap();
        asm.bind(exit).unwrap();
        asm.emit(Opcode::ReturnConst, 0);
        asm
    }

    #[test]
    fn test_loop_variables_live_at_header() {
        let cfg = cfg_of(&counting_generator(), true);
        let live = Liveness::compute(&cfg, 3);
        let header = cfg.block_at(8).unwrap();
        assert!(live.is_live_in(header, 0));
        assert!(live.is_live_in(header, 1));
        assert!(!live.is_live_in(header, 2));
    }

    #[test]
    fn test_live_across_suspension() {
        let cfg = cfg_of(&counting_generator(), true);
        let live = Liveness::compute(&cfg, 3);
        let yield_block = cfg
            .blocks
            .iter()
            .find(|b| cfg.terminator(b.id).opcode == Opcode::YieldValue)
            .unwrap()
            .id;
        let across: Vec<_> = live.live_across(&cfg, yield_block).iter().collect();
        assert_eq!(across, vec![0, 1]);
    }

    #[test]
    fn test_store_kills() {
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadConst, 1).emit(Opcode::StoreFast, 0);
        asm.emit(Opcode::LoadFast, 0).op(Opcode::ReturnValue);
        let cfg = cfg_of(&asm, false);
        let live = Liveness::compute(&cfg, 3);
        assert!(live.live_in[0].is_empty());
    }

    #[test]
    fn test_handler_liveness_flows_into_protected_block() {
        let mut asm = Assembler::new();
        let start = asm.here();
        asm.emit(Opcode::LoadConst, 1).emit(Opcode::StoreFast, 0);
        let end = asm.here();
        asm.emit(Opcode::ReturnConst, 0);
        let handler = asm.here();
        asm.op(Opcode::PopTop).emit(Opcode::LoadFast, 0).op(Opcode::ReturnValue);
        asm.protect(start, end, handler, 0, false);
        let cfg = cfg_of(&asm, false);
        let live = Liveness::compute(&cfg, 3);
        assert!(live.is_live_in(BlockId(0), 0));
    }
}
