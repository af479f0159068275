//! Native integer-mode execution through Cranelift
#![cfg(feature = "native")]

use kiln_bytecode::{Assembler, CodeObject, Constant, Opcode};
use kiln_jit::backend::cranelift::abi::NativeFailure;
use kiln_jit::backend::cranelift::CraneliftBackend;
use kiln_jit::backend::interp::{Outcome, RefHeap, Value};
use kiln_jit::backend::{CodegenBackend, InterpBackend};
use kiln_jit::{JitConfig, JitEngine, Mode};

/// `total = 0; i = 0; while i < n: total += i * i; i += 1` / `return total`
fn sum_of_squares() -> CodeObject {
    let mut code = CodeObject::new("sum_of_squares");
    code.arg_count = 1;
    code.varnames = vec!["n".into(), "total".into(), "i".into()];
    code.constants = vec![Constant::Int(0), Constant::Int(1)];
    let mut asm = Assembler::new();
    let head = asm.new_label();
    let exit = asm.new_label();
    asm.emit(Opcode::LoadConst, 0).emit(Opcode::StoreFast, 1);
    asm.emit(Opcode::LoadConst, 0).emit(Opcode::StoreFast, 2);
    asm.bind(head).unwrap();
    asm.emit(Opcode::LoadFast, 2).emit(Opcode::LoadFast, 0).emit(Opcode::CompareOp, 0);
    asm.jump(Opcode::PopJumpIfFalse, exit).unwrap();
    asm.emit(Opcode::LoadFast, 1).emit(Opcode::LoadFast, 2).emit(Opcode::LoadFast, 2);
    asm.emit(Opcode::BinaryOp, 5).emit(Opcode::BinaryOp, 13).emit(Opcode::StoreFast, 1);
    asm.emit(Opcode::LoadFast, 2)
        .emit(Opcode::LoadConst, 1)
        .emit(Opcode::BinaryOp, 13)
        .emit(Opcode::StoreFast, 2);
    asm.jump(Opcode::JumpBackward, head).unwrap();
    asm.bind(exit).unwrap();
    asm.emit(Opcode::LoadFast, 1).op(Opcode::ReturnValue);
    asm.finish_into(code).unwrap()
}

fn native_engine() -> JitEngine<CraneliftBackend> {
    JitEngine::native(JitConfig {
        default_mode: Mode::Integer,
        allow_mode_downgrade: false,
        ..Default::default()
    })
        .unwrap()
}

#[test]
fn test_native_loop_matches_portable_executor() {
    let code = sum_of_squares();
    let engine = native_engine();
    let compiled = engine.compile(&code).unwrap();
    assert!(!compiled.code.code.is_empty());
    let native = engine.pipeline().backend().jit(&compiled.artifact).unwrap();

    let portable = InterpBackend::default();
    for n in [0, 1, 5, 100] {
        let expected = portable
            .run(&code, &compiled.artifact, &mut RefHeap::new(), &[Value::Int(n)])
            .unwrap();
        let Outcome::Returned(Value::Int(expected)) = expected else {
            panic!("unexpected {:?}", expected)
        };
        assert_eq!(native.call(&[n]), Ok(expected));
    }
    assert_eq!(native.call(&[4]), Ok(14));
}

#[test]
fn test_native_overflow_is_reported() {
    let code = sum_of_squares();
    let engine = native_engine();
    let compiled = engine.compile(&code).unwrap();
    let native = engine.pipeline().backend().jit(&compiled.artifact).unwrap();
    // The running total overflows long before i reaches n.
    let err = native.call(&[i64::MAX]).unwrap_err();
    assert_eq!(err, NativeFailure::Overflow);
    assert_eq!(err.exception_kind(), "OverflowError");
}

#[test]
fn test_native_engine_rejects_object_mode() {
    let mut code = CodeObject::new("text");
    code.constants = vec![Constant::Str("x".into())];
    let mut asm = Assembler::new();
    asm.emit(Opcode::ReturnConst, 0);
    let code = asm.finish_into(code).unwrap();
    let engine =
        JitEngine::native(JitConfig { default_mode: Mode::Integer, ..Default::default() }).unwrap();
    assert_eq!(engine.pipeline().backend().name(), "cranelift");
    // The downgrade succeeds in the lowering but the backend has no object mode.
    let err = engine.compile(&code).unwrap_err();
    assert!(err.to_string().contains("cannot compile object mode"), "{}", err);
}
