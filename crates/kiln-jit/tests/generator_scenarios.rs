//! Generators lowered to state machines and driven through the portable backend

use kiln_bytecode::{Assembler, CodeFlags, CodeObject, Constant, Opcode};
use kiln_jit::backend::interp::{Frame, ObjRef, Outcome, RefHeap, Resume, Value};
use kiln_jit::backend::InterpBackend;
use kiln_jit::optimize::Optimizer;
use kiln_jit::suspend::{FrameSlotKind, TERMINAL_STATE};
use kiln_jit::{compile, CompileOptions, CompiledArtifact};

/// `for x in it: total = yield x` / `return total`
fn echo_items() -> CodeObject {
    let mut code = CodeObject::new("echo_items");
    code.flags = code.flags.with(CodeFlags::GENERATOR);
    code.arg_count = 1;
    code.varnames = vec!["it".into(), "x".into(), "total".into()];
    code.constants = vec![Constant::None];
    let mut asm = Assembler::new();
    let head = asm.new_label();
    let done = asm.new_label();
    asm.emit(Opcode::LoadConst, 0).emit(Opcode::StoreFast, 2);
    asm.emit(Opcode::LoadFast, 0).op(Opcode::GetIter);
    asm.bind(head).unwrap();
    asm.jump(Opcode::ForIter, done).unwrap();
    asm.emit(Opcode::StoreFast, 1);
    asm.emit(Opcode::LoadFast, 1).op(Opcode::YieldValue);
    asm.emit(Opcode::StoreFast, 2);
    asm.jump(Opcode::JumpBackward, head).unwrap();
    asm.bind(done).unwrap();
    asm.op(Opcode::EndFor);
    asm.emit(Opcode::LoadFast, 2).op(Opcode::ReturnValue);
    asm.finish_into(code).unwrap()
}

/// `a = n; yield a; yield a + a` / `return None`
fn twice() -> CodeObject {
    let mut code = CodeObject::new("twice");
    code.flags = code.flags.with(CodeFlags::GENERATOR);
    code.arg_count = 1;
    code.varnames = vec!["n".into(), "a".into()];
    code.constants = vec![Constant::None];
    let mut asm = Assembler::new();
    asm.emit(Opcode::LoadFast, 0).emit(Opcode::StoreFast, 1);
    asm.emit(Opcode::LoadFast, 1).op(Opcode::YieldValue).op(Opcode::PopTop);
    asm.emit(Opcode::LoadFast, 1).emit(Opcode::LoadFast, 1).emit(Opcode::BinaryOp, 0);
    asm.op(Opcode::YieldValue).op(Opcode::PopTop);
    asm.emit(Opcode::ReturnConst, 0);
    asm.finish_into(code).unwrap()
}

/// `i = 0; while i < n: yield i; i = i + 1` / `return None`
fn count_up() -> CodeObject {
    let mut code = CodeObject::new("count_up");
    code.flags = code.flags.with(CodeFlags::GENERATOR);
    code.arg_count = 1;
    code.varnames = vec!["n".into(), "i".into()];
    code.constants = vec![Constant::Int(0), Constant::Int(1), Constant::None];
    let mut asm = Assembler::new();
    let head = asm.new_label();
    let exit = asm.new_label();
    asm.emit(Opcode::LoadConst, 0).emit(Opcode::StoreFast, 1);
    asm.bind(head).unwrap();
    asm.emit(Opcode::LoadFast, 1).emit(Opcode::LoadFast, 0).emit(Opcode::CompareOp, 0);
    asm.jump(Opcode::PopJumpIfFalse, exit).unwrap();
    asm.emit(Opcode::LoadFast, 1).op(Opcode::YieldValue).op(Opcode::PopTop);
    asm.emit(Opcode::LoadFast, 1)
        .emit(Opcode::LoadConst, 1)
        .emit(Opcode::BinaryOp, 0)
        .emit(Opcode::StoreFast, 1);
    asm.jump(Opcode::JumpBackward, head).unwrap();
    asm.bind(exit).unwrap();
    asm.emit(Opcode::ReturnConst, 2);
    asm.finish_into(code).unwrap()
}

fn build(code: &CodeObject) -> CompiledArtifact {
    compile(code, &CompileOptions::default(), &Optimizer::new()).unwrap()
}

struct Driver {
    code: CodeObject,
    artifact: CompiledArtifact,
    backend: InterpBackend,
    heap: RefHeap,
}

impl Driver {
    fn new(code: CodeObject) -> Self {
        let artifact = build(&code);
        Driver { code, artifact, backend: InterpBackend::default(), heap: RefHeap::new() }
    }

    fn start(&mut self, args: &[ObjRef]) -> Frame {
        self.backend.start(&self.artifact, &mut self.heap, args).unwrap()
    }

    fn resume(&mut self, frame: &mut Frame, resume: Resume) -> Outcome {
        self.backend.resume(&self.code, &self.artifact, &mut self.heap, frame, resume).unwrap()
    }

    /// Expect a yielded integer and release it
    fn expect_yield(&mut self, outcome: Outcome) -> i64 {
        let Outcome::Suspended(Value::Obj(value)) = outcome else {
            panic!("expected a yield, got {:?}", outcome)
        };
        let n = self.heap.as_int(value).unwrap();
        self.heap.decref(value);
        n
    }
}

#[test]
fn test_yield_in_loop_produces_each_item() {
    let mut d = Driver::new(echo_items());
    assert_eq!(d.artifact.dispatch.as_ref().unwrap().len(), 1);

    let items: Vec<ObjRef> = [1, 2, 3].iter().map(|&v| d.heap.int(v)).collect();
    let list = d.heap.list(items);
    let baseline = d.heap.live();

    let mut frame = d.start(&[list]);
    let mut seen = Vec::new();
    let first = d.resume(&mut frame, Resume::Start);
    seen.push(d.expect_yield(first));
    for _ in 0..2 {
        let sent = d.heap.none();
        let next = d.resume(&mut frame, Resume::Send(sent));
        seen.push(d.expect_yield(next));
    }
    assert_eq!(seen, vec![1, 2, 3]);

    // The last sent value becomes the return value.
    let last = d.heap.int(99);
    let out = d.resume(&mut frame, Resume::Send(last));
    let Outcome::Returned(Value::Obj(result)) = out else { panic!("unexpected {:?}", out) };
    assert_eq!(d.heap.as_int(result), Some(99));
    d.heap.decref(result);
    assert!(frame.is_finished());
    assert_eq!(frame.state, TERMINAL_STATE as i64);

    assert_eq!(d.heap.live(), baseline);
    assert_eq!(d.heap.refcount(list), 1);
    d.heap.decref(list);
    assert_eq!(d.heap.audit(), Ok(()));
}

#[test]
fn test_locals_survive_suspension() {
    let mut d = Driver::new(twice());
    assert_eq!(d.artifact.dispatch.as_ref().unwrap().len(), 2);
    let n = d.heap.int(21);
    let mut frame = d.start(&[n]);
    let first = d.resume(&mut frame, Resume::Start);
    assert_eq!(d.expect_yield(first), 21);
    let sent = d.heap.none();
    let second = d.resume(&mut frame, Resume::Send(sent));
    assert_eq!(d.expect_yield(second), 42);
    let sent = d.heap.none();
    let out = d.resume(&mut frame, Resume::Send(sent));
    let Outcome::Returned(Value::Obj(result)) = out else { panic!("unexpected {:?}", out) };
    assert!(d.heap.is_none(result));
    d.heap.decref(result);
    assert!(frame.is_finished());
    assert_eq!(d.heap.refcount(n), 1);
    d.heap.decref(n);
    assert_eq!(d.heap.audit(), Ok(()));
}

#[test]
fn test_throw_into_suspended_generator_releases_frame() {
    let mut d = Driver::new(twice());
    let n = d.heap.int(5);
    let baseline = d.heap.live();
    let mut frame = d.start(&[n]);
    let first = d.resume(&mut frame, Resume::Start);
    assert_eq!(d.expect_yield(first), 5);

    d.heap.raise_new("ValueError", "stop");
    let thrown = d.heap.take_exception().unwrap();
    let out = d.resume(&mut frame, Resume::Throw(thrown));
    assert_eq!(out, Outcome::Raised);
    assert!(frame.is_finished());

    let active = d.heap.take_exception().unwrap();
    assert_eq!(d.heap.exception_kind(active), Some("ValueError"));
    d.heap.decref(active);
    assert_eq!(d.heap.live(), baseline);
    d.heap.decref(n);
    assert_eq!(d.heap.audit(), Ok(()));
}

#[test]
fn test_while_loop_at_depth_zero_yields_counter() {
    let mut d = Driver::new(count_up());
    let table = d.artifact.dispatch.clone().unwrap();
    assert_eq!(table.states.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![1]);
    // The counter is kept in the frame across the yield.
    let layout = d.artifact.frame.clone().unwrap();
    assert!(layout.slots.iter().any(|s| s.kind == FrameSlotKind::Local(1)));

    let n = d.heap.int(3);
    let baseline = d.heap.live();
    let mut frame = d.start(&[n]);
    assert_eq!(frame.state, 0);

    let mut seen = Vec::new();
    let mut outcome = d.resume(&mut frame, Resume::Start);
    while let Outcome::Suspended(_) = outcome {
        seen.push(d.expect_yield(outcome));
        assert_eq!(frame.state, 1);
        let sent = d.heap.none();
        outcome = d.resume(&mut frame, Resume::Send(sent));
    }
    assert_eq!(seen, vec![0, 1, 2]);
    let Outcome::Returned(Value::Obj(result)) = outcome else { panic!("unexpected {:?}", outcome) };
    assert!(d.heap.is_none(result));
    d.heap.decref(result);
    assert!(frame.is_finished());

    assert_eq!(d.heap.live(), baseline);
    d.heap.decref(n);
    assert_eq!(d.heap.audit(), Ok(()));
}

#[test]
fn test_while_loop_generator_with_no_iterations() {
    let mut d = Driver::new(count_up());
    let n = d.heap.int(0);
    let mut frame = d.start(&[n]);
    let out = d.resume(&mut frame, Resume::Start);
    let Outcome::Returned(Value::Obj(result)) = out else { panic!("unexpected {:?}", out) };
    assert!(d.heap.is_none(result));
    d.heap.decref(result);
    assert!(frame.is_finished());
    d.heap.decref(n);
    assert_eq!(d.heap.audit(), Ok(()));
}

#[test]
fn test_dispatch_table_is_deterministic() {
    for code in [echo_items(), twice(), count_up()] {
        let first = build(&code);
        let second = build(&code);
        assert_eq!(first.dispatch, second.dispatch);
        assert_eq!(first.frame, second.frame);
        let table = first.dispatch.unwrap();
        let states: Vec<u32> = table.states.iter().map(|(s, _)| *s).collect();
        let expected: Vec<u32> = (1..=table.len() as u32).collect();
        assert_eq!(states, expected);
    }
}
