//! Integer-mode IR → Cranelift IR lowering
//!
//! Every IR value and slot becomes a Cranelift `Variable`, so phis reduce to
//! `def_var` copies on the incoming edge; the frontend rebuilds SSA. A
//! failing op splits its block: the failure path stores a failure code
//! through `out` and follows the unwind edge.

use cranelift_codegen::ir::{self, condcodes::IntCC, types, InstBuilder, MemFlags};
use cranelift_frontend::{FunctionBuilder, Variable};

use super::abi;
use crate::backend::traits::CodegenError;
use crate::ir::{BlockRef, Function, IntBinOp, IntCmpOp, IrType, Op, Terminator, ValueId};

fn cl_type(ty: IrType) -> Result<ir::Type, CodegenError> {
    match ty {
        IrType::I64 => Ok(types::I64),
        IrType::Bool => Ok(types::I8),
        IrType::Obj => Err(CodegenError::UnsupportedInstruction("object-typed value".into())),
    }
}

fn int_cc(op: IntCmpOp) -> IntCC {
    match op {
        IntCmpOp::Lt => IntCC::SignedLessThan,
        IntCmpOp::Le => IntCC::SignedLessThanOrEqual,
        IntCmpOp::Eq => IntCC::Equal,
        IntCmpOp::Ne => IntCC::NotEqual,
        IntCmpOp::Gt => IntCC::SignedGreaterThan,
        IntCmpOp::Ge => IntCC::SignedGreaterThanOrEqual,
    }
}

/// State maintained during lowering of a single function
pub struct LoweringContext<'a, 'b> {
    func: &'a Function,
    builder: FunctionBuilder<'b>,
    blocks: Vec<ir::Block>,
    values: Vec<Variable>,
    slots: Vec<Variable>,
    args_ptr: ir::Value,
    out_ptr: ir::Value,
}

impl<'a, 'b> LoweringContext<'a, 'b> {
    /// Lower `func` into the function under construction
    pub fn lower(func: &'a Function, mut builder: FunctionBuilder<'b>) -> Result<(), CodegenError> {
        let blocks: Vec<ir::Block> = func.blocks.iter().map(|_| builder.create_block()).collect();
        let mut values = Vec::with_capacity(func.next_value as usize);
        for i in 0..func.next_value {
            let ty = func.value_type(ValueId(i)).unwrap_or(IrType::I64);
            values.push(builder.declare_var(cl_type(ty)?));
        }
        let mut slots = Vec::with_capacity(func.slots.len());
        for slot in &func.slots {
            slots.push(builder.declare_var(cl_type(slot.ty)?));
        }

        // The Cranelift entry block takes the parameters and cannot be a
        // branch target, so it only initializes slots.
        let prologue = builder.create_block();
        builder.append_block_params_for_function_params(prologue);
        builder.switch_to_block(prologue);
        let args_ptr = builder.block_params(prologue)[0];
        let out_ptr = builder.block_params(prologue)[1];
        for (slot, info) in slots.iter().zip(&func.slots) {
            let zero = builder.ins().iconst(cl_type(info.ty)?, 0);
            builder.def_var(*slot, zero);
        }
        let first = blocks.get(func.entry.index()).copied().ok_or_else(|| {
            CodegenError::BackendError(format!("entry {} out of range", func.entry))
        })?;
        builder.ins().jump(first, &[]);

        let mut ctx = LoweringContext { func, builder, blocks, values, slots, args_ptr, out_ptr };
        for block in &func.blocks {
            ctx.builder.switch_to_block(ctx.blocks[block.id.index()]);
            for op in &block.ops {
                ctx.lower_op(block.id, op)?;
            }
            ctx.lower_terminator(block.id, &block.terminator)?;
        }

        ctx.builder.seal_all_blocks();
        ctx.builder.finalize();
        Ok(())
    }

    fn var(&self, value: ValueId) -> Result<Variable, CodegenError> {
        self.values
            .get(value.0 as usize)
            .copied()
            .ok_or_else(|| CodegenError::BackendError(format!("{} was never allocated", value)))
    }

    fn use_value(&mut self, value: ValueId) -> Result<ir::Value, CodegenError> {
        let var = self.var(value)?;
        Ok(self.builder.use_var(var))
    }

    fn def_value(&mut self, value: ValueId, val: ir::Value) -> Result<(), CodegenError> {
        let var = self.var(value)?;
        self.builder.def_var(var, val);
        Ok(())
    }

    fn slot(&self, index: u32) -> Result<Variable, CodegenError> {
        self.slots
            .get(index as usize)
            .copied()
            .ok_or_else(|| CodegenError::BackendError(format!("slot s{} out of range", index)))
    }

    fn has_phis_from(&self, from: BlockRef, to: BlockRef) -> bool {
        self.func.block(to).phis.iter().any(|phi| phi.incoming.iter().any(|(p, _)| *p == from))
    }

    /// Copy the incoming values of `to`'s phis for the edge from `from`
    fn phi_copies(&mut self, from: BlockRef, to: BlockRef) -> Result<(), CodegenError> {
        let func = self.func;
        let mut reads = Vec::new();
        for phi in &func.block(to).phis {
            if let Some((_, source)) = phi.incoming.iter().find(|(p, _)| *p == from) {
                let val = self.use_value(*source)?;
                reads.push((phi.dest, val));
            }
        }
        for (dest, val) in reads {
            self.def_value(dest, val)?;
        }
        Ok(())
    }

    fn jump_edge(&mut self, from: BlockRef, to: BlockRef) -> Result<(), CodegenError> {
        self.phi_copies(from, to)?;
        let target = self.blocks[to.index()];
        self.builder.ins().jump(target, &[]);
        Ok(())
    }

    /// Branch to `fail` when `failed` is set, recording `code` as the reason
    fn guard(
        &mut self,
        from: BlockRef,
        failed: ir::Value,
        code: ir::Value,
        unwind: Option<BlockRef>,
    ) -> Result<(), CodegenError> {
        let target = unwind.ok_or_else(|| {
            CodegenError::BackendError(format!("failing op in {} has no unwind edge", from))
        })?;
        let fail = self.builder.create_block();
        let ok = self.builder.create_block();
        self.builder.ins().brif(failed, fail, &[], ok, &[]);
        self.builder.switch_to_block(fail);
        self.builder.ins().store(MemFlags::trusted(), code, self.out_ptr, 0);
        self.jump_edge(from, target)?;
        self.builder.switch_to_block(ok);
        Ok(())
    }

    fn select_code(&mut self, cond: ir::Value, if_set: i64, otherwise: i64) -> ir::Value {
        let a = self.builder.ins().iconst(types::I64, if_set);
        let b = self.builder.ins().iconst(types::I64, otherwise);
        self.builder.ins().select(cond, a, b)
    }

    fn lower_int_binary(
        &mut self,
        from: BlockRef,
        op: IntBinOp,
        a: ir::Value,
        b: ir::Value,
        unwind: Option<BlockRef>,
    ) -> Result<ir::Value, CodegenError> {
        Ok(match op {
            IntBinOp::Add | IntBinOp::Sub | IntBinOp::Mul => {
                let (result, overflow) = match op {
                    IntBinOp::Add => self.builder.ins().sadd_overflow(a, b),
                    IntBinOp::Sub => self.builder.ins().ssub_overflow(a, b),
                    _ => self.builder.ins().smul_overflow(a, b),
                };
                let code = self.builder.ins().iconst(types::I64, abi::FAIL_OVERFLOW);
                self.guard(from, overflow, code, unwind)?;
                result
            }
            IntBinOp::FloorDiv | IntBinOp::Mod => {
                let b_zero = self.builder.ins().icmp_imm(IntCC::Equal, b, 0);
                let a_min = self.builder.ins().icmp_imm(IntCC::Equal, a, i64::MIN);
                let b_neg_one = self.builder.ins().icmp_imm(IntCC::Equal, b, -1);
                let overflow = self.builder.ins().band(a_min, b_neg_one);
                let failed = self.builder.ins().bor(b_zero, overflow);
                let code = self.select_code(b_zero, abi::FAIL_ZERO_DIVISION, abi::FAIL_OVERFLOW);
                self.guard(from, failed, code, unwind)?;

                // Round toward negative infinity when the signs differ.
                let q = self.builder.ins().sdiv(a, b);
                let r = self.builder.ins().srem(a, b);
                let inexact = self.builder.ins().icmp_imm(IntCC::NotEqual, r, 0);
                let signs = self.builder.ins().bxor(r, b);
                let differ = self.builder.ins().icmp_imm(IntCC::SignedLessThan, signs, 0);
                let adjust = self.builder.ins().band(inexact, differ);
                if op == IntBinOp::FloorDiv {
                    let lowered = self.builder.ins().iadd_imm(q, -1);
                    self.builder.ins().select(adjust, lowered, q)
                } else {
                    let wrapped = self.builder.ins().iadd(r, b);
                    self.builder.ins().select(adjust, wrapped, r)
                }
            }
            IntBinOp::Shl => {
                let negative = self.builder.ins().icmp_imm(IntCC::SignedLessThan, b, 0);
                let a_zero = self.builder.ins().icmp_imm(IntCC::Equal, a, 0);
                let a_nonzero = self.builder.ins().icmp_imm(IntCC::NotEqual, a, 0);
                let too_far = self.builder.ins().icmp_imm(IntCC::SignedGreaterThanOrEqual, b, 64);
                let shifted = self.builder.ins().ishl(a, b);
                let back = self.builder.ins().sshr(shifted, b);
                let lost = self.builder.ins().icmp(IntCC::NotEqual, back, a);
                let lossy = self.builder.ins().bor(too_far, lost);
                let overflow = self.builder.ins().band(a_nonzero, lossy);
                let failed = self.builder.ins().bor(negative, overflow);
                let code = self.select_code(negative, abi::FAIL_NEGATIVE_SHIFT, abi::FAIL_OVERFLOW);
                self.guard(from, failed, code, unwind)?;
                let zero = self.builder.ins().iconst(types::I64, 0);
                self.builder.ins().select(a_zero, zero, shifted)
            }
            IntBinOp::Shr => {
                let negative = self.builder.ins().icmp_imm(IntCC::SignedLessThan, b, 0);
                let code = self.builder.ins().iconst(types::I64, abi::FAIL_NEGATIVE_SHIFT);
                self.guard(from, negative, code, unwind)?;
                let max = self.builder.ins().iconst(types::I64, 63);
                let amount = self.builder.ins().smin(b, max);
                self.builder.ins().sshr(a, amount)
            }
            IntBinOp::And => self.builder.ins().band(a, b),
            IntBinOp::Or => self.builder.ins().bor(a, b),
            IntBinOp::Xor => self.builder.ins().bxor(a, b),
        })
    }

    fn lower_op(&mut self, block: BlockRef, op: &Op) -> Result<(), CodegenError> {
        let result = match op {
            Op::ConstInt { value, .. } => self.builder.ins().iconst(types::I64, *value),
            Op::ConstBool { value, .. } => self.builder.ins().iconst(types::I8, *value as i64),
            Op::LoadArg { index, .. } => {
                let offset = (*index as i32) * 8;
                self.builder.ins().load(types::I64, MemFlags::trusted(), self.args_ptr, offset)
            }
            Op::LoadSlot { slot, .. } => {
                let var = self.slot(slot.0)?;
                self.builder.use_var(var)
            }
            Op::StoreSlot { slot, value } => {
                let var = self.slot(slot.0)?;
                let val = self.use_value(*value)?;
                self.builder.def_var(var, val);
                return Ok(());
            }
            Op::IntBinary { op, lhs, rhs, unwind, .. } => {
                let (a, b) = (self.use_value(*lhs)?, self.use_value(*rhs)?);
                self.lower_int_binary(block, *op, a, b, *unwind)?
            }
            Op::IntCompare { op, lhs, rhs, .. } => {
                let (a, b) = (self.use_value(*lhs)?, self.use_value(*rhs)?);
                self.builder.ins().icmp(int_cc(*op), a, b)
            }
            Op::IntNeg { operand, unwind, .. } => {
                let a = self.use_value(*operand)?;
                let failed = self.builder.ins().icmp_imm(IntCC::Equal, a, i64::MIN);
                let code = self.builder.ins().iconst(types::I64, abi::FAIL_OVERFLOW);
                self.guard(block, failed, code, Some(*unwind))?;
                self.builder.ins().ineg(a)
            }
            Op::IntNot { operand, .. } => {
                let a = self.use_value(*operand)?;
                self.builder.ins().bnot(a)
            }
            Op::BoolNot { operand, .. } => {
                let a = self.use_value(*operand)?;
                self.builder.ins().bxor_imm(a, 1)
            }
            Op::BoolToInt { operand, .. } => {
                let a = self.use_value(*operand)?;
                self.builder.ins().uextend(types::I64, a)
            }
            Op::IntToBool { operand, .. } => {
                let a = self.use_value(*operand)?;
                self.builder.ins().icmp_imm(IntCC::NotEqual, a, 0)
            }
            other => return Err(CodegenError::UnsupportedInstruction(other.to_string())),
        };
        match op.dest() {
            Some(dest) => self.def_value(dest, result),
            None => Ok(()),
        }
    }

    fn lower_terminator(
        &mut self,
        block: BlockRef,
        terminator: &Terminator,
    ) -> Result<(), CodegenError> {
        match terminator {
            Terminator::Jump(target) => self.jump_edge(block, *target)?,
            Terminator::Branch { cond, then_block, else_block } => {
                let cond = self.use_value(*cond)?;
                let mut trampolines = Vec::new();
                let mut target = |ctx: &mut Self, to: BlockRef| {
                    if ctx.has_phis_from(block, to) {
                        let edge = ctx.builder.create_block();
                        trampolines.push((edge, to));
                        edge
                    } else {
                        ctx.blocks[to.index()]
                    }
                };
                let then_cl = target(self, *then_block);
                let else_cl = target(self, *else_block);
                self.builder.ins().brif(cond, then_cl, &[], else_cl, &[]);
                for (edge, to) in trampolines {
                    self.builder.switch_to_block(edge);
                    self.jump_edge(block, to)?;
                }
            }
            Terminator::Return(value) => {
                let val = self.use_value(*value)?;
                self.builder.ins().store(MemFlags::trusted(), val, self.out_ptr, 0);
                let status = self.builder.ins().iconst(types::I8, abi::STATUS_OK as i64);
                self.builder.ins().return_(&[status]);
            }
            Terminator::Raise => {
                let status = self.builder.ins().iconst(types::I8, abi::STATUS_RAISED as i64);
                self.builder.ins().return_(&[status]);
            }
            Terminator::Unreachable => {
                let status = self.builder.ins().iconst(types::I8, abi::STATUS_UNREACHABLE as i64);
                self.builder.ins().return_(&[status]);
            }
            Terminator::Switch { .. } | Terminator::Suspend(_) => {
                let message = format!("terminator of {}", block);
                return Err(CodegenError::UnsupportedInstruction(message));
            }
            Terminator::None => {
                return Err(CodegenError::BackendError(format!("{} has no terminator", block)));
            }
        }
        Ok(())
    }
}
