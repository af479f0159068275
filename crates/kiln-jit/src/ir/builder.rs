//! IR construction helpers
//!
//! Utilities for emitting IR during lowering.

use super::instr::{
    BlockOrigin, BlockRef, FrameField, Function, IntBinOp, IntCmpOp, Op, SlotId, Terminator,
    ValueId,
};
use super::types::IrType;
use crate::host::HostFn;

/// Builder that simplifies IR construction
pub struct IrBuilder<'a> {
    func: &'a mut Function,
    current_block: BlockRef,
}

impl<'a> IrBuilder<'a> {
    /// Create a builder targeting an existing function
    pub fn new(func: &'a mut Function) -> Self {
        let entry = func.entry;
        IrBuilder { func, current_block: entry }
    }

    /// Switch to emitting into a different block
    pub fn switch_to_block(&mut self, block: BlockRef) {
        self.current_block = block;
    }

    /// Get the current block
    pub fn current_block(&self) -> BlockRef {
        self.current_block
    }

    /// Allocate a new value with the given type
    pub fn alloc_value(&mut self, ty: IrType) -> ValueId {
        self.func.alloc_value(ty)
    }

    /// Create a new basic block
    pub fn create_block(&mut self, origin: BlockOrigin) -> BlockRef {
        self.func.add_block(origin)
    }

    /// Emit an op into the current block
    pub fn emit(&mut self, op: Op) {
        self.func.block_mut(self.current_block).ops.push(op);
    }

    /// Set the terminator for the current block
    pub fn terminate(&mut self, term: Terminator) {
        self.func.block_mut(self.current_block).terminator = term;
    }

    /// Whether the current block already has a terminator
    pub fn is_terminated(&self) -> bool {
        self.func.block(self.current_block).terminator != Terminator::None
    }

    pub fn const_int(&mut self, value: i64) -> ValueId {
        let dest = self.alloc_value(IrType::I64);
        self.emit(Op::ConstInt { dest, value });
        dest
    }

    pub fn const_bool(&mut self, value: bool) -> ValueId {
        let dest = self.alloc_value(IrType::Bool);
        self.emit(Op::ConstBool { dest, value });
        dest
    }

    pub fn const_null(&mut self) -> ValueId {
        let dest = self.alloc_value(IrType::Obj);
        self.emit(Op::ConstNull { dest });
        dest
    }

    /// New reference to a constant-pool object
    pub fn const_obj(&mut self, index: u32) -> ValueId {
        let dest = self.alloc_value(IrType::Obj);
        self.emit(Op::ConstObj { dest, index });
        dest
    }

    pub fn load_arg(&mut self, index: u32, ty: IrType) -> ValueId {
        let dest = self.alloc_value(ty);
        self.emit(Op::LoadArg { dest, index });
        dest
    }

    pub fn load_slot(&mut self, slot: SlotId) -> ValueId {
        let ty = self.func.slots[slot.0 as usize].ty;
        let dest = self.alloc_value(ty);
        self.emit(Op::LoadSlot { dest, slot });
        dest
    }

    pub fn store_slot(&mut self, slot: SlotId, value: ValueId) {
        self.emit(Op::StoreSlot { slot, value });
    }

    pub fn load_frame(&mut self, field: FrameField) -> ValueId {
        let ty = frame_field_type(self.func, field);
        let dest = self.alloc_value(ty);
        self.emit(Op::LoadFrame { dest, field });
        dest
    }

    pub fn store_frame(&mut self, field: FrameField, value: ValueId) {
        self.emit(Op::StoreFrame { field, value });
    }

    /// Emit a checked integer operation
    ///
    /// The unwind target is dropped for operators that cannot fail.
    pub fn int_binary(
        &mut self,
        op: IntBinOp,
        lhs: ValueId,
        rhs: ValueId,
        unwind: BlockRef,
    ) -> ValueId {
        let dest = self.alloc_value(IrType::I64);
        let unwind = op.can_fail().then_some(unwind);
        self.emit(Op::IntBinary { dest, op, lhs, rhs, unwind });
        dest
    }

    pub fn int_compare(&mut self, op: IntCmpOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let dest = self.alloc_value(IrType::Bool);
        self.emit(Op::IntCompare { dest, op, lhs, rhs });
        dest
    }

    /// Emit a unary op producing a value of type `ty`
    pub fn unary(&mut self, ty: IrType, make: impl FnOnce(ValueId) -> Op) -> ValueId {
        let dest = self.alloc_value(ty);
        self.emit(make(dest));
        dest
    }

    pub fn is_null(&mut self, value: ValueId) -> ValueId {
        let dest = self.alloc_value(IrType::Bool);
        self.emit(Op::IsNull { dest, value });
        dest
    }

    /// Emit a foreign call, returning its result value if it has one
    pub fn call_host(
        &mut self,
        func: HostFn,
        args: Vec<ValueId>,
        unwind: Option<BlockRef>,
    ) -> Option<ValueId> {
        let dest = func.result_type().map(|ty| self.alloc_value(ty));
        let unwind = if func.can_fail() { unwind } else { None };
        self.emit(Op::CallHost { dest, func, args, unwind });
        dest
    }

    pub fn inc_ref(&mut self, value: ValueId) {
        self.emit(Op::IncRef { value });
    }

    pub fn dec_ref(&mut self, value: ValueId) {
        self.emit(Op::DecRef { value });
    }

    pub fn xdec_ref(&mut self, value: ValueId) {
        self.emit(Op::XDecRef { value });
    }

    pub fn fetch_exception(&mut self) -> ValueId {
        let dest = self.alloc_value(IrType::Obj);
        self.emit(Op::FetchException { dest });
        dest
    }

    /// Access the underlying function
    pub fn func(&self) -> &Function {
        self.func
    }

    /// Access the underlying function mutably
    pub fn func_mut(&mut self) -> &mut Function {
        self.func
    }
}

/// Static type of a frame field
pub fn frame_field_type(func: &Function, field: FrameField) -> IrType {
    match field {
        FrameField::State => IrType::I64,
        FrameField::SentValue | FrameField::Thrown => IrType::Obj,
        FrameField::Slot(i) => func.frame_slots.get(i as usize).copied().unwrap_or(IrType::Obj),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Mode;

    #[test]
    fn test_builder_emits_into_current_block() {
        let mut func = Function::new("f", Mode::Object, 0);
        let entry = func.add_block(BlockOrigin::Prologue);
        let other = func.add_block(BlockOrigin::Bytecode(0));
        let mut b = IrBuilder::new(&mut func);
        let c = b.const_obj(0);
        b.terminate(Terminator::Jump(other));
        assert!(b.is_terminated());
        b.switch_to_block(other);
        b.terminate(Terminator::Return(c));
        assert_eq!(func.block(entry).ops.len(), 1);
        assert_eq!(func.block(other).terminator, Terminator::Return(c));
        assert_eq!(func.value_type(c), Some(IrType::Obj));
    }

    #[test]
    fn test_call_host_drops_unwind_for_infallible_calls() {
        let mut func = Function::new("f", Mode::Object, 0);
        func.add_block(BlockOrigin::Prologue);
        let pad = func.add_block(BlockOrigin::Raise);
        let mut b = IrBuilder::new(&mut func);
        let x = b.const_null();
        let flag = b.call_host(HostFn::IsNone, vec![x], Some(pad));
        b.call_host(HostFn::GetIter, vec![x], Some(pad));
        let ops = &func.blocks[0].ops;
        assert!(matches!(ops[1], Op::CallHost { unwind: None, .. }));
        assert!(matches!(ops[2], Op::CallHost { unwind: Some(u), .. } if u == pad));
        assert_eq!(flag.and_then(|v| func.value_type(v)), Some(IrType::Bool));
    }

    #[test]
    fn test_int_binary_unwind_only_when_fallible() {
        let mut func = Function::new("f", Mode::Integer, 0);
        func.add_block(BlockOrigin::Prologue);
        let pad = func.add_block(BlockOrigin::Raise);
        let mut b = IrBuilder::new(&mut func);
        let x = b.const_int(1);
        b.int_binary(IntBinOp::Xor, x, x, pad);
        b.int_binary(IntBinOp::Add, x, x, pad);
        let ops = &func.blocks[0].ops;
        assert!(matches!(ops[1], Op::IntBinary { unwind: None, .. }));
        assert!(matches!(ops[2], Op::IntBinary { unwind: Some(_), .. }));
    }
}
