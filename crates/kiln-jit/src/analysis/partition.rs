//! Basic-block partitioning
//!
//! A block starts at offset 0, at every jump target, after every instruction
//! that can leave fall-through (jumps, returns, raises, `ForIter`, and
//! suspension points when requested), and at every exception-handler target.
//! The leader just past a terminal instruction at the end of the code would
//! be an empty exit block; it is never materialized.

use std::collections::BTreeSet;

use super::decoder::{DecodedFunction, Instruction};

/// Half-open instruction range `[first, last)` of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    /// Byte offset of the first instruction
    pub start: u32,
    /// Byte offset just past the last instruction
    pub end: u32,
    /// Index of the first instruction
    pub first: usize,
    /// One past the index of the last instruction
    pub last: usize,
}

/// Whether control may leave fall-through after `instr`
pub fn ends_block(instr: &Instruction, split_suspensions: bool) -> bool {
    let op = instr.opcode;
    op.is_jump() || op.is_terminator() || (split_suspensions && op.is_suspension())
}

/// Sorted leader offsets
pub fn block_leaders(decoded: &DecodedFunction, split_suspensions: bool) -> BTreeSet<u32> {
    let mut leaders = BTreeSet::new();
    if decoded.instructions.is_empty() {
        return leaders;
    }
    leaders.insert(0);
    for instr in &decoded.instructions {
        if let Some(target) = instr.target {
            leaders.insert(target);
        }
        if ends_block(instr, split_suspensions) {
            leaders.insert(instr.next_offset);
        }
    }
    for region in &decoded.regions {
        leaders.insert(region.target);
    }
    leaders.retain(|&offset| offset < decoded.code_len);
    leaders
}

/// Partition the instruction list into blocks
pub fn partition(decoded: &DecodedFunction, split_suspensions: bool) -> Vec<BlockSpan> {
    let leaders = block_leaders(decoded, split_suspensions);
    let starts: Vec<u32> = leaders.into_iter().collect();
    let mut spans = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        // Leaders are instruction starts: jump and handler targets are
        // checked by the decoder.
        let Some(first) = decoded.index_of(start) else { continue };
        let last = match starts.get(i + 1) {
            Some(&next) => decoded.index_of(next).unwrap_or(decoded.instructions.len()),
            None => decoded.instructions.len(),
        };
        let end = decoded.instructions[last - 1].next_offset;
        spans.push(BlockSpan { start, end, first, last });
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::decoder::decode_function;
    use kiln_bytecode::{Assembler, CodeObject, Constant, Opcode};

    fn decode(asm: &Assembler) -> DecodedFunction {
        let mut code = CodeObject::new("test_func");
        code.constants = vec![Constant::None, Constant::Int(1), Constant::Int(2)];
        code.varnames = vec!["x".into(), "a".into()];
        code.names = vec!["g".into()];
        decode_function(&asm.finish_into(code).unwrap()).unwrap()
    }

    #[test]
    fn test_straight_line_is_one_block() {
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadConst, 1).emit(Opcode::StoreFast, 0).emit(Opcode::ReturnConst, 0);
        let spans = partition(&decode(&asm), false);
        assert_eq!(spans, vec![BlockSpan { start: 0, end: 6, first: 0, last: 3 }]);
    }

    #[test]
    fn test_if_else_leaders() {
        let mut asm = Assembler::new();
        let orelse = asm.new_label();
        let join = asm.new_label();
        asm.emit(Opcode::LoadFast, 0);
        asm.jump(Opcode::PopJumpIfFalse, orelse).unwrap();
        asm.emit(Opcode::LoadConst, 1).emit(Opcode::StoreFast, 1);
        asm.jump(Opcode::JumpForward, join).unwrap();
        asm.bind(orelse).unwrap();
        asm.emit(Opcode::LoadConst, 2).emit(Opcode::StoreFast, 1);
        asm.bind(join).unwrap();
        asm.emit(Opcode::LoadFast, 1).op(Opcode::ReturnValue);
        let leaders: Vec<_> = block_leaders(&decode(&asm), false).into_iter().collect();
        assert_eq!(leaders, vec![0, 4, 10, 14]);
    }

    #[test]
    fn test_no_empty_exit_block() {
        let mut asm = Assembler::new();
        asm.emit(Opcode::ReturnConst, 0);
        let decoded = decode(&asm);
        assert_eq!(block_leaders(&decoded, false).len(), 1);
        assert_eq!(partition(&decoded, false).len(), 1);
    }

    #[test]
    fn test_suspension_splits_only_when_requested() {
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadConst, 1)
            .op(Opcode::YieldValue)
            .op(Opcode::PopTop)
            .emit(Opcode::ReturnConst, 0);
        let decoded = decode(&asm);
        assert_eq!(partition(&decoded, false).len(), 1);
        let spans = partition(&decoded, true);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].start, 4);
    }

    #[test]
    fn test_handler_target_is_leader() {
        let mut asm = Assembler::new();
        let start = asm.here();
        asm.emit(Opcode::LoadGlobal, 0);
        let end = asm.here();
        asm.op(Opcode::ReturnValue);
        let handler = asm.here();
        asm.op(Opcode::PopTop).emit(Opcode::ReturnConst, 0);
        asm.protect(start, end, handler, 0, false);
        let leaders: Vec<_> = block_leaders(&decode(&asm), false).into_iter().collect();
        assert_eq!(leaders, vec![0, 4]);
    }
}
