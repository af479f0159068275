//! IR well-formedness checks
//!
//! Run on every function before it leaves the pipeline. A failure here is a
//! compiler defect, reported as [`StructuralVerificationError::MalformedIr`].

use rustc_hash::FxHashSet;

use super::builder::frame_field_type;
use super::instr::{BlockRef, FrameField, Function, Op, Terminator, ValueId};
use super::types::IrType;
use crate::error::StructuralVerificationError;

type VResult = Result<(), StructuralVerificationError>;

fn malformed(msg: String) -> StructuralVerificationError {
    StructuralVerificationError::MalformedIr(msg)
}

struct Verifier<'f> {
    func: &'f Function,
    defined: FxHashSet<ValueId>,
}

impl<'f> Verifier<'f> {
    fn ty(&self, value: ValueId) -> Result<IrType, StructuralVerificationError> {
        if !self.defined.contains(&value) {
            return Err(malformed(format!("{} used but never defined", value)));
        }
        self.func
            .value_type(value)
            .ok_or_else(|| malformed(format!("{} has no type", value)))
    }

    fn expect(&self, value: ValueId, ty: IrType, what: &str) -> VResult {
        let found = self.ty(value)?;
        if found == ty {
            Ok(())
        } else {
            Err(malformed(format!("{} of {} is {}, expected {}", value, what, found, ty)))
        }
    }

    fn block_exists(&self, block: BlockRef, from: BlockRef) -> VResult {
        if block.index() < self.func.blocks.len() {
            Ok(())
        } else {
            Err(malformed(format!("{} targets missing block {}", from, block)))
        }
    }

    fn check_slot_type(&self, slot: u32, value_ty: Option<IrType>) -> VResult {
        let info = self
            .func
            .slots
            .get(slot as usize)
            .ok_or_else(|| malformed(format!("slot s{} out of range", slot)))?;
        match value_ty {
            Some(ty) if ty != info.ty => Err(malformed(format!(
                "s{} holds {}, stored {}",
                slot, info.ty, ty
            ))),
            _ => Ok(()),
        }
    }

    fn check_frame_field(&self, field: FrameField) -> VResult {
        if let FrameField::Slot(i) = field {
            if i as usize >= self.func.frame_slots.len() {
                return Err(malformed(format!("frame field f{} out of range", i)));
            }
        }
        Ok(())
    }

    fn check_op(&self, op: &Op, block: BlockRef) -> VResult {
        if let Some(unwind) = op.unwind() {
            self.block_exists(unwind, block)?;
        }
        match op {
            Op::LoadSlot { dest, slot } => {
                self.check_slot_type(slot.0, self.func.value_type(*dest))
            }
            Op::StoreSlot { slot, value } => self.check_slot_type(slot.0, Some(self.ty(*value)?)),
            Op::LoadFrame { field, .. } => self.check_frame_field(*field),
            Op::StoreFrame { field, value } => {
                self.check_frame_field(*field)?;
                self.expect(*value, frame_field_type(self.func, *field), "frame store")
            }
            Op::IntBinary { op: bin, lhs, rhs, unwind, .. } => {
                self.expect(*lhs, IrType::I64, "integer operand")?;
                self.expect(*rhs, IrType::I64, "integer operand")?;
                if bin.can_fail() != unwind.is_some() {
                    return Err(malformed(format!("{} in {}: unwind target mismatch", op, block)));
                }
                Ok(())
            }
            Op::IntCompare { lhs, rhs, .. } => {
                self.expect(*lhs, IrType::I64, "comparison operand")?;
                self.expect(*rhs, IrType::I64, "comparison operand")
            }
            Op::IntNeg { operand, .. }
            | Op::IntNot { operand, .. }
            | Op::IntToBool { operand, .. } => {
                self.expect(*operand, IrType::I64, "integer operand")
            }
            Op::BoolNot { operand, .. } | Op::BoolToInt { operand, .. } => {
                self.expect(*operand, IrType::Bool, "boolean operand")
            }
            Op::IsNull { value, .. }
            | Op::GuardBound { value, .. }
            | Op::IncRef { value }
            | Op::DecRef { value }
            | Op::XDecRef { value } => self.expect(*value, IrType::Obj, "object operand"),
            Op::CallHost { dest, func, args, unwind } => {
                if args.len() != func.arity() {
                    return Err(malformed(format!(
                        "{} in {}: {} takes {} arguments, given {}",
                        op,
                        block,
                        func,
                        func.arity(),
                        args.len()
                    )));
                }
                for (i, arg) in args.iter().enumerate() {
                    self.expect(*arg, func.arg_type(i), "call argument")?;
                }
                if dest.is_some() != func.result_type().is_some() {
                    return Err(malformed(format!("{} in {}: result mismatch", op, block)));
                }
                if func.can_fail() != unwind.is_some() {
                    return Err(malformed(format!("{} in {}: unwind target mismatch", op, block)));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_terminator(&self, term: &Terminator, block: BlockRef) -> VResult {
        for target in term.successors() {
            self.block_exists(target, block)?;
        }
        match term {
            Terminator::None => Err(malformed(format!("{} has no terminator", block))),
            Terminator::Branch { cond, .. } => self.expect(*cond, IrType::Bool, "branch condition"),
            Terminator::Switch { value, .. } => self.expect(*value, IrType::I64, "switch value"),
            Terminator::Return(value) => {
                self.expect(*value, self.func.mode.stack_type(), "return value")
            }
            Terminator::Suspend(value) => {
                if !self.func.is_state_machine() {
                    return Err(malformed(format!("{} suspends outside a state machine", block)));
                }
                self.expect(*value, IrType::Obj, "suspended value")
            }
            _ => Ok(()),
        }
    }
}

/// Verify structural and type invariants of `func`
pub fn verify_function(func: &Function) -> VResult {
    if func.entry.index() >= func.blocks.len() {
        return Err(malformed(format!("entry {} missing", func.entry)));
    }

    // Step 1: every value is defined exactly once
    let mut defined = FxHashSet::default();
    for block in &func.blocks {
        let dests = block.phis.iter().map(|p| p.dest).chain(block.ops.iter().filter_map(Op::dest));
        for dest in dests {
            if !defined.insert(dest) {
                return Err(malformed(format!("{} defined twice", dest)));
            }
        }
    }
    let verifier = Verifier { func, defined };

    // Step 2: ops and terminators
    for (idx, block) in func.blocks.iter().enumerate() {
        if block.id.index() != idx {
            return Err(malformed(format!("block {} stored at index {}", block.id, idx)));
        }
        for op in &block.ops {
            verifier.check_op(op, block.id)?;
        }
        verifier.check_terminator(&block.terminator, block.id)?;
    }

    // Step 3: phis list each predecessor once, with matching types
    let preds = func.predecessors();
    for block in &func.blocks {
        let block_preds = &preds[block.id.index()];
        for phi in &block.phis {
            // Both arms of a branch may target the same block, so a
            // predecessor can be listed twice.
            if let Some(missing) = block_preds
                .iter()
                .find(|p| !phi.incoming.iter().any(|(b, _)| b == *p))
            {
                return Err(malformed(format!(
                    "{} in {} has no incoming value from {}",
                    phi.dest, block.id, missing
                )));
            }
            for (pred, value) in &phi.incoming {
                if !block_preds.contains(pred) {
                    return Err(malformed(format!(
                        "{} lists {}, which is not a predecessor",
                        phi.dest, pred
                    )));
                }
                verifier.expect(*value, phi.ty, "phi incoming")?;
            }
            if verifier.ty(phi.dest)? != phi.ty {
                return Err(malformed(format!("{} declared {}", phi.dest, phi.ty)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostFn;
    use crate::ir::instr::{BlockOrigin, IntBinOp, Phi};
    use crate::ir::Mode;

    fn linear_int() -> Function {
        let mut func = Function::new("f", Mode::Integer, 0);
        let entry = func.add_block(BlockOrigin::Prologue);
        let a = func.alloc_value(IrType::I64);
        func.block_mut(entry).ops.push(Op::ConstInt { dest: a, value: 1 });
        func.block_mut(entry).terminator = Terminator::Return(a);
        func
    }

    #[test]
    fn test_accepts_well_formed() {
        assert_eq!(verify_function(&linear_int()), Ok(()));
    }

    #[test]
    fn test_rejects_missing_terminator() {
        let mut func = linear_int();
        func.blocks[0].terminator = Terminator::None;
        assert!(matches!(
            verify_function(&func),
            Err(StructuralVerificationError::MalformedIr(m)) if m.contains("no terminator")
        ));
    }

    #[test]
    fn test_rejects_type_mismatch() {
        let mut func = linear_int();
        let b = func.alloc_value(IrType::Bool);
        let c = func.alloc_value(IrType::I64);
        func.blocks[0].ops.push(Op::ConstBool { dest: b, value: true });
        func.blocks[0].ops.push(Op::IntBinary {
            dest: c,
            op: IntBinOp::Add,
            lhs: ValueId(0),
            rhs: b,
            unwind: Some(BlockRef(0)),
        });
        assert!(verify_function(&func).is_err());
    }

    #[test]
    fn test_rejects_missing_unwind() {
        let mut func = Function::new("f", Mode::Object, 0);
        let entry = func.add_block(BlockOrigin::Prologue);
        let x = func.alloc_value(IrType::Obj);
        let it = func.alloc_value(IrType::Obj);
        func.block_mut(entry).ops = vec![
            Op::ConstObj { dest: x, index: 0 },
            Op::CallHost { dest: Some(it), func: HostFn::GetIter, args: vec![x], unwind: None },
        ];
        func.block_mut(entry).terminator = Terminator::Return(it);
        assert!(matches!(
            verify_function(&func),
            Err(StructuralVerificationError::MalformedIr(m)) if m.contains("unwind")
        ));
    }

    #[test]
    fn test_rejects_wrong_arity() {
        let mut func = Function::new("f", Mode::Object, 0);
        let entry = func.add_block(BlockOrigin::Prologue);
        let x = func.alloc_value(IrType::Obj);
        let r = func.alloc_value(IrType::Obj);
        func.block_mut(entry).ops = vec![
            Op::ConstObj { dest: x, index: 0 },
            Op::CallHost {
                dest: Some(r),
                func: HostFn::GetItem,
                args: vec![x],
                unwind: Some(entry),
            },
        ];
        func.block_mut(entry).terminator = Terminator::Return(r);
        assert!(verify_function(&func).is_err());
    }

    #[test]
    fn test_rejects_phi_with_missing_incoming() {
        let mut func = Function::new("f", Mode::Integer, 0);
        let entry = func.add_block(BlockOrigin::Prologue);
        let left = func.add_block(BlockOrigin::Bytecode(2));
        let join = func.add_block(BlockOrigin::Bytecode(4));
        let c = func.alloc_value(IrType::Bool);
        let one = func.alloc_value(IrType::I64);
        let phi = func.alloc_value(IrType::I64);
        func.block_mut(entry).ops = vec![
            Op::ConstBool { dest: c, value: true },
            Op::ConstInt { dest: one, value: 1 },
        ];
        func.block_mut(entry).terminator = Terminator::Branch {
            cond: c,
            then_block: left,
            else_block: join,
        };
        func.block_mut(left).terminator = Terminator::Jump(join);
        func.block_mut(join).phis.push(Phi {
            dest: phi,
            ty: IrType::I64,
            incoming: vec![(entry, one)],
        });
        func.block_mut(join).terminator = Terminator::Return(phi);
        assert!(verify_function(&func).is_err());

        func.block_mut(join).phis[0].incoming.push((left, one));
        assert_eq!(verify_function(&func), Ok(()));
    }

    #[test]
    fn test_rejects_double_definition() {
        let mut func = linear_int();
        func.blocks[0].ops.push(Op::ConstInt { dest: ValueId(0), value: 2 });
        assert!(matches!(
            verify_function(&func),
            Err(StructuralVerificationError::MalformedIr(m)) if m.contains("twice")
        ));
    }

    #[test]
    fn test_rejects_suspend_outside_state_machine() {
        let mut func = Function::new("f", Mode::Object, 0);
        let entry = func.add_block(BlockOrigin::Prologue);
        let x = func.alloc_value(IrType::Obj);
        func.block_mut(entry).ops.push(Op::ConstObj { dest: x, index: 0 });
        func.block_mut(entry).terminator = Terminator::Suspend(x);
        assert!(verify_function(&func).is_err());
    }
}
