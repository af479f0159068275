//! Integer-mode admission check
//!
//! Integer mode compiles only arithmetic over locals and integer constants.
//! The check runs over the decoded instructions before any lowering, so a
//! rejected function costs nothing beyond the decode.

use kiln_bytecode::{CodeObject, Opcode};

use crate::analysis::{DecodedFunction, Instruction};
use crate::error::{ModeRejection, ModeUnsupportedOpcode};
use crate::ir::IntBinOp;

/// Whether integer mode accepts `opcode` at all
///
/// Operand restrictions are checked separately by [`validate_integer_mode`].
pub fn integer_opcode_allowed(opcode: Opcode) -> bool {
    use Opcode::*;
    match opcode {
        Nop | Resume | PopTop | Copy | Swap => true,
        LoadConst | LoadFast | StoreFast => true,
        LoadFastLoadFast | StoreFastLoadFast | StoreFastStoreFast => true,
        BinaryOp | CompareOp => true,
        UnaryNegative | UnaryInvert | UnaryNot | ToBool => true,
        JumpForward | JumpBackward | PopJumpIfFalse | PopJumpIfTrue => true,
        ReturnValue | ReturnConst => true,

        ExtendedArg => false,
        DeleteFast | LoadDeref | StoreDeref | MakeCell => false,
        LoadGlobal | StoreGlobal | LoadAttr | StoreAttr | ImportName | ImportFrom => false,
        IsOp | ContainsOp | BinarySubscr | StoreSubscr => false,
        BuildTuple | BuildList | BuildMap | Call | GetIter | ForIter | EndFor => false,
        PopJumpIfNone | PopJumpIfNotNone => false,
        RaiseVarargs | Reraise | PushExcInfo | PopExcept | CheckExcMatch => false,
        YieldValue | GetAwaitable | Await => false,
        SetupFinally | PopBlock | JumpIfFalseOrPop | JumpIfTrueOrPop => false,
        SetupAnnotations | ImportStar | LoadBuildClass => false,
        GetAIter | GetANext | EndAsyncFor | AsyncGenWrap | BeforeAsyncWith | Send => false,
    }
}

fn reject(instr: &Instruction, reason: ModeRejection) -> ModeUnsupportedOpcode {
    ModeUnsupportedOpcode { opcode: instr.opcode, offset: instr.offset, reason }
}

fn check_instruction(code: &CodeObject, instr: &Instruction) -> Result<(), ModeUnsupportedOpcode> {
    if !integer_opcode_allowed(instr.opcode) {
        return Err(reject(instr, ModeRejection::Opcode));
    }
    match instr.opcode {
        Opcode::LoadConst | Opcode::ReturnConst => {
            let is_int = code.constants.get(instr.arg as usize).and_then(|c| c.as_int()).is_some();
            if !is_int {
                return Err(reject(instr, ModeRejection::Constant));
            }
        }
        Opcode::BinaryOp => {
            if instr.nb_op().and_then(IntBinOp::from_nb).is_none() {
                return Err(reject(instr, ModeRejection::Operand));
            }
        }
        Opcode::CompareOp => {
            if instr.cmp_op().is_none() {
                return Err(reject(instr, ModeRejection::Operand));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Check that every instruction of `code` can be lowered in integer mode
pub fn validate_integer_mode(
    code: &CodeObject,
    decoded: &DecodedFunction,
) -> Result<(), ModeUnsupportedOpcode> {
    let first = decoded.instructions.first();
    if code.is_suspendable() {
        let (opcode, offset) = first.map(|i| (i.opcode, i.offset)).unwrap_or((Opcode::Nop, 0));
        return Err(ModeUnsupportedOpcode { opcode, offset, reason: ModeRejection::Suspendable });
    }
    if let Some(region) = decoded.regions.first() {
        let opcode = decoded
            .index_of(region.start)
            .map(|i| decoded.instructions[i].opcode)
            .unwrap_or(Opcode::Nop);
        return Err(ModeUnsupportedOpcode {
            opcode,
            offset: region.start,
            reason: ModeRejection::ExceptionRegions,
        });
    }
    for instr in &decoded.instructions {
        check_instruction(code, instr)?;
    }
    tracing::debug!(
        name = %code.name,
        instructions = decoded.instructions.len(),
        "integer mode accepted"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::decode_function;
    use kiln_bytecode::{Assembler, CodeFlags, Constant};

    fn decoded(code: &CodeObject) -> DecodedFunction {
        decode_function(code).unwrap()
    }

    #[test]
    fn test_allow_list_is_total_and_excludes_outside_subset() {
        let allowed: Vec<Opcode> = Opcode::ALL
            .iter()
            .copied()
            .filter(|&op| integer_opcode_allowed(op))
            .collect();
        assert_eq!(allowed.len(), 23);
        for &op in Opcode::ALL {
            if op.is_outside_compiled_subset() {
                assert!(!integer_opcode_allowed(op), "{} allowed", op);
            }
        }
    }

    #[test]
    fn test_every_rejected_opcode_reports_its_offset_including_jumps() {
        for &op in Opcode::ALL {
            if integer_opcode_allowed(op) || op == Opcode::ExtendedArg {
                continue;
            }
            let mut code = CodeObject::new("rejected");
            code.constants = vec![Constant::Int(0)];
            code.varnames = vec!["x".into()];
            code.names = vec!["attr".into()];
            let mut asm = Assembler::new();
            asm.op(Opcode::Nop);
            if op.is_jump() {
                // Rejected jumps all go forward, to the return.
                assert!(!op.is_backward_jump(), "{}", op);
                let exit = asm.new_label();
                asm.jump(op, exit).unwrap();
                asm.bind(exit).unwrap();
            } else {
                asm.emit(op, 0);
            }
            asm.emit(Opcode::ReturnConst, 0);
            let code = asm.finish_into(code).unwrap();
            let err = validate_integer_mode(&code, &decoded(&code)).unwrap_err();
            assert_eq!(err.opcode, op);
            assert_eq!(err.offset, 2);
            assert_eq!(err.reason, ModeRejection::Opcode);
        }
    }

    #[test]
    fn test_operand_and_constant_restrictions() {
        let mut code = CodeObject::new("div");
        code.arg_count = 2;
        code.varnames = vec!["a".into(), "b".into()];
        code.constants = vec![Constant::Float(1.5)];
        let mut asm = Assembler::new();
        // True division is not an integer operator.
        asm.emit(Opcode::LoadFast, 0)
            .emit(Opcode::LoadFast, 1)
            .emit(Opcode::BinaryOp, 11)
            .op(Opcode::ReturnValue);
        let div = asm.finish_into(code.clone()).unwrap();
        let err = validate_integer_mode(&div, &decoded(&div)).unwrap_err();
        assert_eq!(
            (err.opcode, err.offset, err.reason),
            (Opcode::BinaryOp, 4, ModeRejection::Operand)
        );

        let mut asm = Assembler::new();
        asm.emit(Opcode::ReturnConst, 0);
        let float = asm.finish_into(code).unwrap();
        let err = validate_integer_mode(&float, &decoded(&float)).unwrap_err();
        assert_eq!(err.reason, ModeRejection::Constant);
    }

    #[test]
    fn test_accepts_inplace_arithmetic_and_bool_constants() {
        let mut code = CodeObject::new("acc");
        code.arg_count = 1;
        code.varnames = vec!["n".into()];
        code.constants = vec![Constant::Bool(true)];
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadFast, 0)
            .emit(Opcode::LoadConst, 0)
            .emit(Opcode::BinaryOp, 13)
            .op(Opcode::ReturnValue);
        let code = asm.finish_into(code).unwrap();
        assert_eq!(validate_integer_mode(&code, &decoded(&code)), Ok(()));
    }

    #[test]
    fn test_rejects_generators() {
        let mut code = CodeObject::new("gen");
        code.flags = code.flags.with(CodeFlags::GENERATOR);
        code.constants = vec![Constant::Int(0)];
        let mut asm = Assembler::new();
        asm.emit(Opcode::ReturnConst, 0);
        let code = asm.finish_into(code).unwrap();
        let err = validate_integer_mode(&code, &decoded(&code)).unwrap_err();
        assert_eq!(err.reason, ModeRejection::Suspendable);
    }
}
