//! Optional optimization passes on lowered IR
//!
//! Each pass implements the `OptPass` trait and transforms a [`Function`] in
//! place. Passes keep the IR verifiable; the pipeline verifies again after
//! running them.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{Function, Op, Terminator, ValueId};

/// An optimization pass on the IR
pub trait OptPass: Send + Sync {
    /// Name of this pass (for diagnostics)
    fn name(&self) -> &str;
    /// Run the pass, returning whether anything changed
    fn run(&self, func: &mut Function) -> bool;
}

/// Optimizer that runs a sequence of passes
pub struct Optimizer {
    passes: Vec<Box<dyn OptPass>>,
}

impl Optimizer {
    /// Create an optimizer with the default pass pipeline
    pub fn new() -> Self {
        Optimizer {
            passes: vec![
                Box::new(ConstantFolding),
                Box::new(TrivialPhiElimination),
                Box::new(DeadValueElimination),
            ],
        }
    }

    /// Create an empty optimizer (no passes)
    pub fn empty() -> Self {
        Optimizer { passes: vec![] }
    }

    /// Add a pass to the pipeline
    pub fn add_pass(&mut self, pass: Box<dyn OptPass>) {
        self.passes.push(pass);
    }

    /// Names of the passes in order
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run all passes in order
    pub fn optimize(&self, func: &mut Function) {
        for pass in &self.passes {
            let changed = pass.run(func);
            tracing::trace!(pass = pass.name(), changed, "optimization pass");
        }
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Pass 1: Constant Folding =====

/// Evaluates integer operations whose operands are constants.
///
/// A checked operation folds only when it cannot fail, so the unwind edge is
/// dropped only when it is dead. Branches on constant conditions become
/// jumps, and blocks no longer reachable are removed.
pub struct ConstantFolding;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Known {
    Int(i64),
    Bool(bool),
}

impl ConstantFolding {
    fn fold_op(op: &Op, known: &FxHashMap<ValueId, Known>) -> Option<Op> {
        let int = |v: &ValueId| match known.get(v) {
            Some(Known::Int(i)) => Some(*i),
            _ => None,
        };
        let boolean = |v: &ValueId| match known.get(v) {
            Some(Known::Bool(b)) => Some(*b),
            _ => None,
        };
        match op {
            Op::IntBinary { dest, op, lhs, rhs, .. } => {
                let value = op.eval(int(lhs)?, int(rhs)?)?;
                Some(Op::ConstInt { dest: *dest, value })
            }
            Op::IntCompare { dest, op, lhs, rhs } => {
                Some(Op::ConstBool { dest: *dest, value: op.eval(int(lhs)?, int(rhs)?) })
            }
            Op::IntNeg { dest, operand, .. } => Some(Op::ConstInt {
                dest: *dest,
                value: int(operand)?.checked_neg()?,
            }),
            Op::IntNot { dest, operand } => {
                Some(Op::ConstInt { dest: *dest, value: !int(operand)? })
            }
            Op::BoolNot { dest, operand } => {
                Some(Op::ConstBool { dest: *dest, value: !boolean(operand)? })
            }
            Op::BoolToInt { dest, operand } => Some(Op::ConstInt {
                dest: *dest,
                value: boolean(operand)? as i64,
            }),
            Op::IntToBool { dest, operand } => {
                Some(Op::ConstBool { dest: *dest, value: int(operand)? != 0 })
            }
            _ => None,
        }
    }

    fn fold_branches(func: &mut Function, known: &FxHashMap<ValueId, Known>) -> bool {
        let mut dropped_edges = Vec::new();
        for block in func.blocks.iter_mut() {
            let Terminator::Branch { cond, then_block, else_block } = block.terminator else {
                continue;
            };
            let Some(Known::Bool(taken)) = known.get(&cond).copied() else { continue };
            let (keep, drop) = if taken {
                (then_block, else_block)
            } else {
                (else_block, then_block)
            };
            block.terminator = Terminator::Jump(keep);
            if keep != drop {
                dropped_edges.push((block.id, drop));
            }
        }
        for &(from, to) in &dropped_edges {
            let still_reached = func.block(from).all_successors().contains(&to);
            if !still_reached {
                for phi in func.block_mut(to).phis.iter_mut() {
                    phi.incoming.retain(|(pred, _)| *pred != from);
                }
            }
        }
        !dropped_edges.is_empty()
    }
}

impl OptPass for ConstantFolding {
    fn name(&self) -> &str {
        "constant-folding"
    }

    fn run(&self, func: &mut Function) -> bool {
        let mut known: FxHashMap<ValueId, Known> = FxHashMap::default();
        let mut changed = false;
        for block in func.blocks.iter_mut() {
            for op in block.ops.iter_mut() {
                if let Some(folded) = Self::fold_op(op, &known) {
                    *op = folded;
                    changed = true;
                }
                match op {
                    Op::ConstInt { dest, value } => {
                        known.insert(*dest, Known::Int(*value));
                    }
                    Op::ConstBool { dest, value } => {
                        known.insert(*dest, Known::Bool(*value));
                    }
                    _ => {}
                }
            }
        }
        if func.is_state_machine() {
            return changed;
        }
        if Self::fold_branches(func, &known) {
            changed = true;
        }
        if changed {
            func.remove_unreachable();
        }
        changed
    }
}

// ===== Pass 2: Trivial Phi Elimination =====

/// Replaces a phi whose incoming values are all the same value (or the phi
/// itself) with that value.
pub struct TrivialPhiElimination;

impl OptPass for TrivialPhiElimination {
    fn name(&self) -> &str {
        "trivial-phi-elimination"
    }

    fn run(&self, func: &mut Function) -> bool {
        let mut changed = false;
        loop {
            let mut subs: FxHashMap<ValueId, ValueId> = FxHashMap::default();
            for block in func.blocks.iter_mut() {
                block.phis.retain(|phi| {
                    let mut sources =
                        phi.incoming.iter().map(|(_, v)| *v).filter(|&v| v != phi.dest);
                    let Some(first) = sources.next() else { return true };
                    if sources.all(|v| v == first) {
                        subs.insert(phi.dest, first);
                        false
                    } else {
                        true
                    }
                });
            }
            if subs.is_empty() {
                return changed;
            }
            changed = true;
            let resolve = |mut v: ValueId| {
                while let Some(&next) = subs.get(&v) {
                    v = next;
                }
                v
            };
            func.map_all_uses(resolve);
        }
    }
}

// ===== Pass 3: Dead Value Elimination =====

/// Removes pure ops whose results are never used.
pub struct DeadValueElimination;

fn used_values(func: &Function) -> FxHashSet<ValueId> {
    let mut used = FxHashSet::default();
    for block in &func.blocks {
        for phi in &block.phis {
            used.extend(phi.incoming.iter().map(|(_, v)| *v));
        }
        for op in &block.ops {
            used.extend(op.uses());
        }
        used.extend(block.terminator.used_value());
    }
    used
}

impl OptPass for DeadValueElimination {
    fn name(&self) -> &str {
        "dead-value-elimination"
    }

    fn run(&self, func: &mut Function) -> bool {
        let mut changed = false;
        loop {
            let used = used_values(func);
            let mut removed = 0;
            for block in func.blocks.iter_mut() {
                let before = block.ops.len() + block.phis.len();
                block
                    .ops
                    .retain(|op| !op.is_pure() || op.dest().map_or(true, |d| used.contains(&d)));
                block.phis.retain(|phi| used.contains(&phi.dest));
                removed += before - block.ops.len() - block.phis.len();
            }
            if removed == 0 {
                return changed;
            }
            changed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BlockOrigin, IntBinOp, IntCmpOp, IrBuilder, IrType, Mode, Phi};

    #[test]
    fn test_folds_add_and_drops_dead_pad() {
        let mut func = build_add(20, 22);
        Optimizer::new().optimize(&mut func);
        let text = func.to_string();
        assert!(text.contains("const.int 42"), "{}", text);
        assert!(!text.contains("iadd"), "{}", text);
        assert_eq!(func.blocks.len(), 1);
        crate::ir::verify_function(&func).unwrap();
    }

    #[test]
    fn test_overflowing_add_keeps_unwind() {
        let mut func = build_add(i64::MAX, 1);
        ConstantFolding.run(&mut func);
        assert!(func.to_string().contains("iadd"));
        assert_eq!(func.blocks.len(), 2);
    }

    fn build_add(a: i64, b: i64) -> Function {
        let mut func = Function::new("fold", Mode::Integer, 0);
        func.entry = func.add_block(BlockOrigin::Prologue);
        let pad = func.add_block(BlockOrigin::LandingPad(4));
        func.block_mut(pad).terminator = Terminator::Raise;
        let mut builder = IrBuilder::new(&mut func);
        let x = builder.const_int(a);
        let y = builder.const_int(b);
        let sum = builder.int_binary(IntBinOp::Add, x, y, pad);
        builder.terminate(Terminator::Return(sum));
        func
    }

    #[test]
    fn test_constant_branch_becomes_jump() {
        let mut func = Function::new("branch", Mode::Integer, 0);
        func.entry = func.add_block(BlockOrigin::Prologue);
        let then_block = func.add_block(BlockOrigin::Bytecode(4));
        let else_block = func.add_block(BlockOrigin::Bytecode(8));
        let mut b = IrBuilder::new(&mut func);
        let one = b.const_int(1);
        let two = b.const_int(2);
        let cond = b.int_compare(IntCmpOp::Lt, one, two);
        b.terminate(Terminator::Branch { cond, then_block, else_block });
        b.switch_to_block(then_block);
        b.terminate(Terminator::Return(one));
        b.switch_to_block(else_block);
        b.terminate(Terminator::Return(two));

        assert!(ConstantFolding.run(&mut func));
        assert_eq!(func.blocks.len(), 2);
        assert_eq!(func.block(func.entry).terminator, Terminator::Jump(crate::ir::BlockRef(1)));
    }

    #[test]
    fn test_trivial_phi_replaced_by_its_source() {
        let mut func = Function::new("phi", Mode::Integer, 1);
        func.entry = func.add_block(BlockOrigin::Prologue);
        let header = func.add_block(BlockOrigin::Bytecode(2));
        let arg = {
            let mut b = IrBuilder::new(&mut func);
            let arg = b.load_arg(0, IrType::I64);
            b.terminate(Terminator::Jump(header));
            arg
        };
        let dest = func.alloc_value(IrType::I64);
        let entry = func.entry;
        func.block_mut(header).phis.push(Phi {
            dest,
            ty: IrType::I64,
            incoming: vec![(entry, arg), (header, dest)],
        });
        func.block_mut(header).terminator = Terminator::Return(dest);

        assert!(TrivialPhiElimination.run(&mut func));
        assert_eq!(func.phi_count(), 0);
        assert_eq!(func.block(header).terminator, Terminator::Return(arg));
    }

    #[test]
    fn test_dead_values_removed_but_effects_kept() {
        let mut func = Function::new("dead", Mode::Object, 1);
        func.entry = func.add_block(BlockOrigin::Prologue);
        let mut b = IrBuilder::new(&mut func);
        let arg = b.load_arg(0, IrType::Obj);
        let _unused = b.const_int(7);
        b.inc_ref(arg);
        b.terminate(Terminator::Return(arg));
        assert!(DeadValueElimination.run(&mut func));
        assert_eq!(func.op_count(), 2);
    }
}
