use super::*;
use crate::analysis::cfg::build_cfg;
use crate::analysis::{compute_order, decode_function, propagate_depths, CfgOptions, Liveness};
use crate::ir::verify_function;
use crate::ssa::plan_merges;
use crate::suspend;
use kiln_bytecode::{Assembler, CodeFlags, Constant};

fn lower(code: &CodeObject, mode: Mode) -> Result<LowerOutput, LowerError> {
    let decoded = decode_function(code).unwrap();
    let machine = suspend::needs_state_machine(code, &decoded);
    let mut cfg = build_cfg(decoded, CfgOptions { split_suspensions: machine }).unwrap();
    propagate_depths(&mut cfg).unwrap();
    let traversal = compute_order(&mut cfg);
    let plan = plan_merges(&cfg, &traversal);
    let suspension = machine.then(|| {
        let liveness = Liveness::compute(&cfg, code.varnames.len());
        suspend::plan(code, &cfg, &liveness)
    });
    let options = LowerOptions { mode, release_gil: false };
    lower_function(code, &cfg, &traversal, &plan, suspension.as_ref(), options)
}

/// `return 1 if x else 2`
fn ternary() -> CodeObject {
    let mut code = CodeObject::new("ternary");
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

/// `return a + b`
fn add() -> CodeObject {
    let mut code = CodeObject::new("add");
    code.arg_count = 2;
    code.varnames = vec!["a".into(), "b".into()];
    let mut asm = Assembler::new();
    asm.emit(Opcode::LoadFast, 0)
        .emit(Opcode::LoadFast, 1)
        .emit(Opcode::BinaryOp, 0)
        .op(Opcode::ReturnValue);
    asm.finish_into(code).unwrap()
}

/// `while n: n = n - 1` / `return n`
fn countdown() -> CodeObject {
    let mut code = CodeObject::new("countdown");
    code.arg_count = 1;
    code.varnames = vec!["n".into()];
    code.constants = vec![Constant::Int(1)];
    let mut asm = Assembler::new();
    let head = asm.new_label();
    let exit = asm.new_label();
    asm.emit(Opcode::Resume, 0);
    asm.bind(head).unwrap();
    asm.emit(Opcode::LoadFast, 0);
    asm.jump(Opcode::PopJumpIfFalse, exit).unwrap();
    asm.emit(Opcode::LoadFast, 0)
        .emit(Opcode::LoadConst, 0)
        .emit(Opcode::BinaryOp, 10)
        .emit(Opcode::StoreFast, 0);
    asm.jump(Opcode::JumpBackward, head).unwrap();
    asm.bind(exit).unwrap();
    asm.emit(Opcode::LoadFast, 0).op(Opcode::ReturnValue);
    asm.finish_into(code).unwrap()
}

fn count_ops(func: &Function, pred: impl Fn(&Op) -> bool) -> usize {
    func.blocks.iter().flat_map(|b| b.ops.iter()).filter(|op| pred(op)).count()
}

#[test]
fn test_ternary_merges_one_placeholder() {
    let out = lower(&ternary(), Mode::Object).unwrap();
    assert_eq!(out.placeholders, 1);
    assert_eq!(out.completed_placeholders, 1);
    let phis: Vec<&Phi> = out.function.blocks.iter().flat_map(|b| b.phis.iter()).collect();
    assert_eq!(phis.len(), 1);
    assert_eq!(phis[0].incoming.len(), 2);
    verify_function(&out.function).unwrap();
}

#[test]
fn test_integer_mode_emits_checked_add() {
    let out = lower(&add(), Mode::Integer).unwrap();
    let text = out.function.to_string();
    assert!(text.contains("iadd"), "{}", text);
    assert!(text.contains("[integer]"), "{}", text);
    // Overflow unwinds to a pad that returns failure.
    assert_eq!(out.landing_pads, 1);
    assert_eq!(
        count_ops(&out.function, |op| matches!(op, Op::IncRef { .. } | Op::DecRef { .. })),
        0
    );
}

#[test]
fn test_object_mode_add_balances_references() {
    let out = lower(&add(), Mode::Object).unwrap();
    let func = &out.function;
    // Both loads guard and take a reference; the call borrows both operands.
    assert_eq!(count_ops(func, |op| matches!(op, Op::GuardBound { .. })), 2);
    let calls: Vec<&Op> = func
        .blocks
        .iter()
        .flat_map(|b| b.ops.iter())
        .filter(|op| matches!(op, Op::CallHost { func: HostFn::Binary(_), .. }))
        .collect();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].unwind().is_some());
    verify_function(func).unwrap();
}

#[test]
fn test_outside_subset_rejected_before_ir() {
    let mut code = CodeObject::new("legacy");
    let mut asm = Assembler::new();
    asm.op(Opcode::SetupAnnotations).emit(Opcode::ReturnConst, 0);
    code.constants = vec![Constant::None];
    let code = asm.finish_into(code).unwrap();
    let err = lower(&code, Mode::Object).unwrap_err();
    assert_eq!(
        err,
        LowerError::Unsupported(UnsupportedOpcode {
            opcode: Opcode::SetupAnnotations,
            offset: 0,
            mode: Mode::Object,
        })
    );
}

#[test]
fn test_return_releases_every_local() {
    let mut code = CodeObject::new("locals");
    code.arg_count = 1;
    code.varnames = vec!["a".into(), "tmp".into(), "unused".into()];
    let mut asm = Assembler::new();
    asm.emit(Opcode::LoadFast, 0)
        .emit(Opcode::StoreFast, 1)
        .emit(Opcode::LoadFast, 1)
        .op(Opcode::ReturnValue);
    let code = asm.finish_into(code).unwrap();
    let out = lower(&code, Mode::Object).unwrap();
    let ret = out
        .function
        .blocks
        .iter()
        .find(|b| matches!(b.terminator, Terminator::Return(_)))
        .unwrap();
    let released = ret.ops.iter().filter(|op| matches!(op, Op::XDecRef { .. })).count();
    // One release for the overwritten `tmp`, then one per slot on return.
    assert_eq!(released, 1 + 3);
}

/// `try: return a + b` / `except: return None`
fn guarded_add() -> CodeObject {
    let mut code = CodeObject::new("guarded");
    code.arg_count = 2;
    code.varnames = vec!["a".into(), "b".into()];
    code.constants = vec![Constant::None];
    let mut asm = Assembler::new();
    let start = asm.here();
    let end = asm.new_label();
    let handler = asm.new_label();
    asm.emit(Opcode::LoadFast, 0)
        .emit(Opcode::LoadFast, 1)
        .emit(Opcode::BinaryOp, 0)
        .op(Opcode::ReturnValue);
    asm.bind(end).unwrap();
    asm.bind(handler).unwrap();
    asm.op(Opcode::PushExcInfo)
        .op(Opcode::PopTop)
        .op(Opcode::PopExcept)
        .emit(Opcode::ReturnConst, 0);
    asm.protect(start, end, handler, 0, false);
    asm.finish_into(code).unwrap()
}

#[test]
fn test_landing_pads_jump_to_handler() {
    let out = lower(&guarded_add(), Mode::Object).unwrap();
    let func = &out.function;
    let handler = func.blocks.iter().find(|b| b.origin == BlockOrigin::Bytecode(8)).unwrap().id;
    let pads: Vec<&crate::ir::Block> =
        func.blocks.iter().filter(|b| matches!(b.origin, BlockOrigin::LandingPad(_))).collect();
    assert_eq!(pads.len(), out.landing_pads);
    assert!(!pads.is_empty());
    for pad in pads {
        assert_eq!(pad.terminator, Terminator::Jump(handler));
    }
    let entry = func.block(handler);
    assert!(entry.ops.iter().any(|op| matches!(op, Op::FetchException { .. })));
    verify_function(func).unwrap();
}

#[test]
fn test_underflowing_pop_is_structural() {
    let mut code = CodeObject::new("bad");
    let mut asm = Assembler::new();
    asm.op(Opcode::PopTop).emit(Opcode::ReturnConst, 0);
    code.constants = vec![Constant::None];
    let code = asm.finish_into(code).unwrap();
    let decoded = decode_function(&code).unwrap();
    let mut cfg = build_cfg(decoded, CfgOptions::default()).unwrap();
    // Depth propagation would reject this; skip it to reach the lowering check.
    cfg.blocks[0].entry_depth = Some(0);
    let traversal = compute_order(&mut cfg);
    let plan = plan_merges(&cfg, &traversal);
    let err = lower_function(&code, &cfg, &traversal, &plan, None, LowerOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        LowerError::Structural(StructuralVerificationError::StackUnderflow { .. })
    ));
}

#[test]
fn test_generator_becomes_state_machine() {
    let mut code = CodeObject::new("countdown");
    code.flags = code.flags.with(CodeFlags::GENERATOR);
    code.arg_count = 1;
    code.varnames = vec!["n".into()];
    code.constants = vec![Constant::None];
    let mut asm = Assembler::new();
    asm.emit(Opcode::LoadFast, 0)
        .op(Opcode::YieldValue)
        .op(Opcode::PopTop)
        .emit(Opcode::ReturnConst, 0);
    let code = asm.finish_into(code).unwrap();

    let out = lower(&code, Mode::Object).unwrap();
    let func = &out.function;
    assert!(func.is_state_machine());
    assert_eq!(func.param_count, 0);
    assert_eq!(func.block(func.entry).origin, BlockOrigin::Dispatch);
    let dispatch = out.dispatch.as_ref().unwrap();
    assert_eq!(dispatch.len(), 1);
    let resume = dispatch.resume_block(1).unwrap();
    assert_eq!(func.block(resume).origin, BlockOrigin::Resume(1));
    assert!(func.blocks.iter().any(|b| matches!(b.terminator, Terminator::Suspend(_))));
    assert!(matches!(
        func.block(func.entry).terminator,
        Terminator::Switch { ref cases, .. } if cases.len() == 2
    ));
    verify_function(func).unwrap();
}

#[test]
fn test_empty_stack_merges_need_no_placeholders() {
    for mode in [Mode::Object, Mode::Integer] {
        let out = lower(&countdown(), mode).unwrap();
        assert_eq!(out.placeholders, 0);
        assert_eq!(out.function.phi_count(), 0);
        verify_function(&out.function).unwrap();
    }
}
