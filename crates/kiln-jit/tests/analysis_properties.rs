//! Properties of the depth analysis and merge planning over assembled functions

use kiln_bytecode::{Assembler, CodeObject, Constant, Opcode};
use kiln_jit::analysis::cfg::build_cfg;
use kiln_jit::analysis::{
    compute_order, decode_function, propagate_depths, CfgOptions, ControlFlowGraph, Traversal,
};
use kiln_jit::ssa::plan_merges;
use kiln_jit::{compile, CompileOptions, Mode};
use kiln_jit::optimize::Optimizer;

fn analyze(code: &CodeObject) -> (ControlFlowGraph, Traversal) {
    let decoded = decode_function(code).unwrap();
    let mut cfg = build_cfg(decoded, CfgOptions::default()).unwrap();
    propagate_depths(&mut cfg).unwrap();
    let traversal = compute_order(&mut cfg);
    (cfg, traversal)
}

/// `return (a + b) * (a - b)`, built with a deep stack
fn arithmetic() -> CodeObject {
    let mut code = CodeObject::new("arith");
    code.arg_count = 2;
    code.varnames = vec!["a".into(), "b".into()];
    let mut asm = Assembler::new();
    asm.emit(Opcode::LoadFast, 0)
        .emit(Opcode::LoadFast, 1)
        .emit(Opcode::BinaryOp, 0)
        .emit(Opcode::LoadFast, 0)
        .emit(Opcode::LoadFast, 1)
        .emit(Opcode::BinaryOp, 10)
        .emit(Opcode::BinaryOp, 5)
        .op(Opcode::ReturnValue);
    asm.finish_into(code).unwrap()
}

/// `return (x, 1 if c else 2)`: the merge sees two stack entries
fn merge_with_depth() -> CodeObject {
    let mut code = CodeObject::new("pair");
    code.arg_count = 2;
    code.varnames = vec!["x".into(), "c".into()];
    code.constants = vec![Constant::Int(1), Constant::Int(2)];
    let mut asm = Assembler::new();
    let other = asm.new_label();
    let join = asm.new_label();
    asm.emit(Opcode::LoadFast, 0).emit(Opcode::LoadFast, 1);
    asm.jump(Opcode::PopJumpIfFalse, other).unwrap();
    asm.emit(Opcode::LoadConst, 0);
    asm.jump(Opcode::JumpForward, join).unwrap();
    asm.bind(other).unwrap();
    asm.emit(Opcode::LoadConst, 1);
    asm.bind(join).unwrap();
    asm.emit(Opcode::BuildTuple, 2).op(Opcode::ReturnValue);
    asm.finish_into(code).unwrap()
}

/// `while i < n: i += 1` with `i` kept on the stack across the loop
fn stack_loop() -> CodeObject {
    let mut code = CodeObject::new("count");
    code.arg_count = 1;
    code.varnames = vec!["n".into()];
    code.constants = vec![Constant::Int(0), Constant::Int(1)];
    let mut asm = Assembler::new();
    let head = asm.new_label();
    let exit = asm.new_label();
    asm.emit(Opcode::LoadConst, 0);
    asm.bind(head).unwrap();
    asm.emit(Opcode::Copy, 1).emit(Opcode::LoadFast, 0).emit(Opcode::CompareOp, 0);
    asm.jump(Opcode::PopJumpIfFalse, exit).unwrap();
    asm.emit(Opcode::LoadConst, 1).emit(Opcode::BinaryOp, 13);
    asm.jump(Opcode::JumpBackward, head).unwrap();
    asm.bind(exit).unwrap();
    asm.op(Opcode::ReturnValue);
    asm.finish_into(code).unwrap()
}

#[test]
fn test_straight_line_depth_is_running_sum_of_effects() {
    let (cfg, _) = analyze(&arithmetic());
    let mut expected = 0i64;
    for (index, instr) in cfg.instructions.iter().enumerate() {
        assert_eq!(
            cfg.depth_before[index],
            Some(expected as u32),
            "before {} at {}",
            instr.opcode,
            instr.offset
        );
        expected += instr.effect().delta();
    }
    // ReturnValue consumes the last value.
    assert_eq!(expected, 0);
}

#[test]
fn test_merge_placeholders_equal_entry_depth() {
    let code = merge_with_depth();
    let (cfg, traversal) = analyze(&code);
    let plan = plan_merges(&cfg, &traversal);
    let join = cfg.blocks.iter().find(|b| b.is_merge()).unwrap();
    let spec = plan.get(join.id).unwrap();
    assert_eq!(Some(spec.placeholders), join.entry_depth);
    assert_eq!(spec.placeholders, 2);
    assert_eq!(spec.predecessors, 2);

    let artifact = compile(&code, &CompileOptions::default(), &Optimizer::empty()).unwrap();
    assert_eq!(artifact.stats.placeholders, 2);
    assert_eq!(artifact.stats.completed_placeholders, 2);
}

#[test]
fn test_phis_have_one_incoming_per_predecessor() {
    let artifact =
        compile(&merge_with_depth(), &CompileOptions::default(), &Optimizer::empty()).unwrap();
    let phis: Vec<_> = artifact.function.blocks.iter().flat_map(|b| b.phis.iter()).collect();
    assert!(!phis.is_empty());
    for phi in phis {
        assert_eq!(phi.incoming.len(), 2);
    }
}

#[test]
fn test_loop_header_depth_matches_back_edge() {
    let code = stack_loop();
    let (cfg, traversal) = analyze(&code);
    assert_eq!(traversal.back_edges.len(), 1);
    let (tail, header) = traversal.back_edges[0];
    let header_block = cfg.block(header);
    assert!(header_block.is_loop_header);
    assert_eq!(header_block.entry_depth, Some(1));
    assert_eq!(cfg.block(tail).exit_depth, Some(1));

    // The integer compile carries the counter through one phi.
    let artifact =
        compile(&code, &CompileOptions::with_mode(Mode::Integer), &Optimizer::empty()).unwrap();
    assert_eq!(artifact.stats.back_edges, 1);
    assert!(artifact.stats.placeholders >= 1);
}

#[test]
fn test_unreachable_blocks_are_not_planned() {
    let mut code = CodeObject::new("dead");
    code.constants = vec![Constant::Int(1)];
    let mut asm = Assembler::new();
    asm.emit(Opcode::ReturnConst, 0);
    // Never reached: no predecessor, no handler.
    asm.emit(Opcode::LoadConst, 0).op(Opcode::ReturnValue);
    let code = asm.finish_into(code).unwrap();
    let (cfg, traversal) = analyze(&code);
    assert_eq!(cfg.blocks.len(), 2);
    assert_eq!(traversal.rpo.len(), 1);
    assert!(cfg.blocks[1].entry_depth.is_none());
    let artifact = compile(&code, &CompileOptions::default(), &Optimizer::new()).unwrap();
    assert_eq!(artifact.stats.blocks, 1);
}
