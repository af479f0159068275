//! Integer-mode opcode semantics
//!
//! Every stack value and local is a machine integer. Booleans are the
//! integers 0 and 1. Division by zero, an invalid shift and overflow unwind
//! like a failing host call.

use kiln_bytecode::Opcode;

use crate::analysis::Instruction;
use crate::ir::{IntBinOp, IntCmpOp, IrType, Mode, Op, ValueId};

use super::{BranchCond, Flow, FunctionLowering, LowerError, OpcodeLowering, Owned};

/// Lowering of `i64` arithmetic
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerLowering;

impl IntegerLowering {
    fn unary(
        cx: &mut FunctionLowering<'_>,
        chain: &[fn(ValueId, ValueId) -> Op],
    ) -> Result<(), LowerError> {
        let operand = cx.pop()?;
        let mut value = operand.value();
        for (i, make) in chain.iter().enumerate() {
            let ty = if i + 1 == chain.len() { IrType::I64 } else { IrType::Bool };
            value = cx.builder().unary(ty, |dest| make(dest, value));
        }
        cx.release(operand);
        let result = cx.adopt(value);
        cx.push(result);
        Ok(())
    }
}

fn to_bool(dest: ValueId, operand: ValueId) -> Op {
    Op::IntToBool { dest, operand }
}

fn bool_not(dest: ValueId, operand: ValueId) -> Op {
    Op::BoolNot { dest, operand }
}

fn to_int(dest: ValueId, operand: ValueId) -> Op {
    Op::BoolToInt { dest, operand }
}

impl OpcodeLowering for IntegerLowering {
    fn mode(&self) -> Mode {
        Mode::Integer
    }

    fn lower(
        &self,
        cx: &mut FunctionLowering<'_>,
        instr: &Instruction,
    ) -> Result<Flow, LowerError> {
        match instr.opcode {
            Opcode::LoadConst => {
                let value = self.constant(cx, instr.arg)?;
                cx.push(value);
            }
            Opcode::LoadFast => {
                let current = cx.load_local(instr.arg)?;
                let value = cx.dup(current);
                cx.push(value);
            }
            Opcode::StoreFast => {
                let value = cx.pop()?;
                cx.store_local(instr.arg, value)?;
            }
            Opcode::BinaryOp => {
                let op = instr
                    .nb_op()
                    .and_then(IntBinOp::from_nb)
                    .ok_or_else(|| cx.unsupported(instr))?;
                let rhs = cx.pop()?;
                let lhs = cx.pop()?;
                let unwind = cx.unwind_target(false)?;
                let result = cx.builder().int_binary(op, lhs.value(), rhs.value(), unwind);
                cx.release(rhs);
                cx.release(lhs);
                let result = cx.adopt(result);
                cx.push(result);
            }
            Opcode::CompareOp => {
                let op = instr
                    .cmp_op()
                    .map(IntCmpOp::from_cmp)
                    .ok_or_else(|| cx.unsupported(instr))?;
                let rhs = cx.pop()?;
                let lhs = cx.pop()?;
                let mut b = cx.builder();
                let flag = b.int_compare(op, lhs.value(), rhs.value());
                let result = b.unary(IrType::I64, |dest| to_int(dest, flag));
                cx.release(rhs);
                cx.release(lhs);
                let result = cx.adopt(result);
                cx.push(result);
            }
            Opcode::UnaryNegative => {
                let operand = cx.pop()?;
                let unwind = cx.unwind_target(false)?;
                let value = operand.value();
                let result = cx.builder().unary(IrType::I64, |dest| Op::IntNeg {
                    dest,
                    operand: value,
                    unwind,
                });
                cx.release(operand);
                let result = cx.adopt(result);
                cx.push(result);
            }
            Opcode::UnaryInvert => {
                let operand = cx.pop()?;
                let value = operand.value();
                let result = cx
                    .builder()
                    .unary(IrType::I64, |dest| Op::IntNot { dest, operand: value });
                cx.release(operand);
                let result = cx.adopt(result);
                cx.push(result);
            }
            Opcode::UnaryNot => Self::unary(cx, &[to_bool, bool_not, to_int])?,
            Opcode::ToBool => Self::unary(cx, &[to_bool, to_int])?,
            _ => return Err(cx.unsupported(instr).into()),
        }
        Ok(Flow::Continue)
    }

    fn branch_condition(
        &self,
        cx: &mut FunctionLowering<'_>,
        instr: &Instruction,
    ) -> Result<BranchCond, LowerError> {
        let jump_if = match instr.opcode {
            Opcode::PopJumpIfFalse => false,
            Opcode::PopJumpIfTrue => true,
            _ => return Err(cx.unsupported(instr).into()),
        };
        let value = cx.pop()?;
        let operand = value.value();
        let flag = cx.builder().unary(IrType::Bool, |dest| to_bool(dest, operand));
        cx.release(value);
        Ok(BranchCond { value: flag, jump_if })
    }

    fn constant(&self, cx: &mut FunctionLowering<'_>, index: u32) -> Result<Owned, LowerError> {
        let offset = cx.offset();
        let opcode = cx.instr.map(|i| i.opcode).unwrap_or(Opcode::LoadConst);
        let value = cx.code().constants.get(index as usize).and_then(|c| c.as_int()).ok_or(
            crate::error::UnsupportedOpcode { opcode, offset, mode: Mode::Integer },
        )?;
        let value = cx.builder().const_int(value);
        Ok(cx.adopt(value))
    }
}
