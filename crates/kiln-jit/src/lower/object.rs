//! Object-mode opcode semantics
//!
//! Stack values are host object references and every operation is a host
//! call. Each arm pops what the opcode consumes, calls with borrowed views,
//! releases the operands and pushes the new reference.

use kiln_bytecode::Opcode;

use crate::analysis::Instruction;
use crate::error::StructuralVerificationError;
use crate::host::{HostFn, UnaryOp};
use crate::ir::{IrType, Mode, Op};

use super::{BranchCond, Flow, FunctionLowering, LowerError, OpcodeLowering, Owned};

/// Lowering of arbitrary host objects
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectLowering;

impl ObjectLowering {
    /// Pop `count` values, returning them bottom first
    fn pop_n(cx: &mut FunctionLowering<'_>, count: u32) -> Result<Vec<Owned>, LowerError> {
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(cx.pop()?);
        }
        items.reverse();
        Ok(items)
    }

    fn release_all(cx: &mut FunctionLowering<'_>, values: Vec<Owned>) {
        for value in values.into_iter().rev() {
            cx.release(value);
        }
    }

    /// Pop operands, call `func` with them, push its new reference
    fn apply(cx: &mut FunctionLowering<'_>, func: HostFn, arity: u32) -> Result<(), LowerError> {
        let operands = Self::pop_n(cx, arity)?;
        let views: Vec<_> = operands.iter().map(Owned::borrow).collect();
        let result = cx.call_new(func, &views)?;
        Self::release_all(cx, operands);
        cx.push(result);
        Ok(())
    }

    /// Box a flag, inverting it first when asked
    fn push_flag(
        cx: &mut FunctionLowering<'_>,
        flag: crate::ir::ValueId,
        invert: bool,
    ) -> Result<(), LowerError> {
        let flag = if invert {
            cx.builder()
                .unary(IrType::Bool, |dest| Op::BoolNot { dest, operand: flag })
        } else {
            flag
        };
        let boxed = cx.box_bool(flag)?;
        cx.push(boxed);
        Ok(())
    }

    fn truth(cx: &mut FunctionLowering<'_>, invert: bool) -> Result<(), LowerError> {
        let value = cx.pop()?;
        let flag = cx.call_flag(HostFn::IsTrue, &[value.borrow()])?;
        cx.release(value);
        Self::push_flag(cx, flag, invert)
    }
}

impl OpcodeLowering for ObjectLowering {
    fn mode(&self) -> Mode {
        Mode::Object
    }

    fn lower(
        &self,
        cx: &mut FunctionLowering<'_>,
        instr: &Instruction,
    ) -> Result<Flow, LowerError> {
        let arg = instr.arg;
        match instr.opcode {
            // ===== Constants & Locals =====
            Opcode::LoadConst => {
                let value = self.constant(cx, arg)?;
                cx.push(value);
            }
            Opcode::LoadFast => {
                let current = cx.load_local(arg)?;
                cx.guard_bound(current, arg)?;
                let value = cx.dup(current);
                cx.push(value);
            }
            Opcode::StoreFast => {
                let value = cx.pop()?;
                let old = cx.load_local(arg)?;
                cx.store_local(arg, value)?;
                cx.builder().xdec_ref(old.value());
            }
            Opcode::DeleteFast => {
                let old = cx.load_local(arg)?;
                cx.guard_bound(old, arg)?;
                cx.clear_local(arg)?;
                cx.builder().dec_ref(old.value());
            }

            // ===== Cells =====
            Opcode::LoadDeref => {
                let cell = cx.load_local(arg)?;
                let value = cx.call_new(HostFn::CellGet, &[cell])?;
                cx.push(value);
            }
            Opcode::StoreDeref => {
                let value = cx.pop()?;
                let cell = cx.load_local(arg)?;
                cx.call_void(HostFn::CellSet, &[cell, value.borrow()])?;
                cx.release(value);
            }
            Opcode::MakeCell => {
                let old = cx.load_local(arg)?;
                let cell = cx.call_new(HostFn::MakeCell, &[old])?;
                cx.store_local(arg, cell)?;
                cx.builder().xdec_ref(old.value());
            }

            // ===== Globals, Attributes & Imports =====
            Opcode::LoadGlobal => {
                let value = cx.call_new(HostFn::LoadGlobal { name: arg }, &[])?;
                cx.push(value);
            }
            Opcode::StoreGlobal => {
                let value = cx.pop()?;
                cx.call_void(HostFn::StoreGlobal { name: arg }, &[value.borrow()])?;
                cx.release(value);
            }
            Opcode::LoadAttr => Self::apply(cx, HostFn::GetAttr { name: arg }, 1)?,
            Opcode::StoreAttr => {
                let obj = cx.pop()?;
                let value = cx.pop()?;
                cx.call_void(HostFn::SetAttr { name: arg }, &[obj.borrow(), value.borrow()])?;
                cx.release(value);
                cx.release(obj);
            }
            Opcode::ImportName => Self::apply(cx, HostFn::ImportName { name: arg }, 2)?,
            Opcode::ImportFrom => {
                let module = cx.peek(0)?;
                let value = cx.call_new(HostFn::ImportFrom { name: arg }, &[module])?;
                cx.push(value);
            }

            // ===== Operators =====
            Opcode::BinaryOp => {
                let op = instr.nb_op().ok_or_else(|| cx.unsupported(instr))?;
                Self::apply(cx, HostFn::Binary(op), 2)?;
            }
            Opcode::CompareOp => {
                let op = instr.cmp_op().ok_or_else(|| cx.unsupported(instr))?;
                Self::apply(cx, HostFn::Compare(op), 2)?;
            }
            Opcode::UnaryNegative => Self::apply(cx, HostFn::Unary(UnaryOp::Negative), 1)?,
            Opcode::UnaryInvert => Self::apply(cx, HostFn::Unary(UnaryOp::Invert), 1)?,
            Opcode::UnaryNot => Self::truth(cx, true)?,
            Opcode::ToBool => Self::truth(cx, false)?,
            Opcode::IsOp => {
                let rhs = cx.pop()?;
                let lhs = cx.pop()?;
                let flag = cx.call_flag(HostFn::Is, &[lhs.borrow(), rhs.borrow()])?;
                cx.release(rhs);
                cx.release(lhs);
                Self::push_flag(cx, flag, arg == 1)?;
            }
            Opcode::ContainsOp => {
                let container = cx.pop()?;
                let item = cx.pop()?;
                let flag = cx.call_flag(HostFn::Contains, &[item.borrow(), container.borrow()])?;
                cx.release(container);
                cx.release(item);
                Self::push_flag(cx, flag, arg == 1)?;
            }
            Opcode::BinarySubscr => Self::apply(cx, HostFn::GetItem, 2)?,
            Opcode::StoreSubscr => {
                let key = cx.pop()?;
                let container = cx.pop()?;
                let value = cx.pop()?;
                cx.call_void(HostFn::SetItem, &[container.borrow(), key.borrow(), value.borrow()])?;
                cx.release(key);
                cx.release(container);
                cx.release(value);
            }

            // ===== Containers, Calls & Iteration =====
            Opcode::BuildTuple | Opcode::BuildList => {
                let items = Self::pop_n(cx, arg)?;
                let func = if instr.opcode == Opcode::BuildTuple {
                    HostFn::BuildTuple { count: arg }
                } else {
                    HostFn::BuildList { count: arg }
                };
                if let Some(built) = cx.call_stealing(func, items)? {
                    cx.push(built);
                }
            }
            Opcode::BuildMap => Self::apply(cx, HostFn::BuildMap { count: arg }, arg * 2)?,
            Opcode::Call => Self::apply(cx, HostFn::Call { argc: arg }, arg + 1)?,
            Opcode::GetIter => Self::apply(cx, HostFn::GetIter, 1)?,

            // ===== Exceptions =====
            Opcode::RaiseVarargs => {
                return match arg {
                    0 => cx.call_raise(HostFn::ReraiseActive, Vec::new()),
                    1 => {
                        let exc = cx.pop()?;
                        cx.call_raise(HostFn::Raise, vec![exc])
                    }
                    2 => {
                        let cause = cx.pop()?;
                        let exc = cx.pop()?;
                        cx.call_raise(HostFn::RaiseFrom, vec![exc, cause])
                    }
                    _ => Err(StructuralVerificationError::MalformedIr(format!(
                        "RaiseVarargs at offset {} has operand {}",
                        instr.offset, arg
                    ))
                    .into()),
                };
            }
            Opcode::Reraise => {
                let exc = cx.pop()?;
                if arg != 0 {
                    let lasti = cx.pop()?;
                    cx.release(lasti);
                }
                return cx.call_raise(HostFn::Reraise, vec![exc]);
            }
            Opcode::PushExcInfo => {
                let exc = cx.pop()?;
                let previous = cx.call_new(HostFn::PushExcInfo, &[exc.borrow()])?;
                cx.push(previous);
                cx.push(exc);
            }
            Opcode::PopExcept => {
                let previous = cx.pop()?;
                if let Some(unexpected) = cx.call_stealing(HostFn::PopExcInfo, vec![previous])? {
                    cx.release(unexpected);
                }
            }
            Opcode::CheckExcMatch => {
                let ty = cx.pop()?;
                let exc = cx.peek(0)?;
                let flag = cx.call_flag(HostFn::ExceptionMatch, &[exc, ty.borrow()])?;
                cx.release(ty);
                Self::push_flag(cx, flag, false)?;
            }

            // ===== Suspension =====
            Opcode::GetAwaitable => Self::apply(cx, HostFn::GetAwaitable, 1)?,

            _ => return Err(cx.unsupported(instr).into()),
        }
        Ok(Flow::Continue)
    }

    fn branch_condition(
        &self,
        cx: &mut FunctionLowering<'_>,
        instr: &Instruction,
    ) -> Result<BranchCond, LowerError> {
        let (test, jump_if) = match instr.opcode {
            Opcode::PopJumpIfFalse => (HostFn::IsTrue, false),
            Opcode::PopJumpIfTrue => (HostFn::IsTrue, true),
            Opcode::PopJumpIfNone => (HostFn::IsNone, true),
            Opcode::PopJumpIfNotNone => (HostFn::IsNone, false),
            _ => return Err(cx.unsupported(instr).into()),
        };
        let value = cx.pop()?;
        let flag = cx.call_flag(test, &[value.borrow()])?;
        cx.release(value);
        Ok(BranchCond { value: flag, jump_if })
    }

    fn constant(&self, cx: &mut FunctionLowering<'_>, index: u32) -> Result<Owned, LowerError> {
        if index as usize >= cx.code().constants.len() {
            let message = format!("constant {} out of range", index);
            return Err(StructuralVerificationError::MalformedIr(message).into());
        }
        let value = cx.builder().const_obj(index);
        Ok(cx.adopt(value))
    }

    fn iterate(
        &self,
        cx: &mut FunctionLowering<'_>,
        _instr: &Instruction,
    ) -> Result<crate::ir::ValueId, LowerError> {
        let iterator = cx.peek(0)?;
        cx.call_raw(HostFn::IterNext, &[iterator])
    }
}
