//! Pretty-printing for the IR
//!
//! Display implementations for debugging and dump output.

use std::fmt;

use super::instr::{Block, BlockRef, Function, Op, Phi, SlotKind, Terminator, ValueId};

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "function @{} [{}] (params: {}, slots: {}) {{",
            self.name,
            self.mode,
            self.param_count,
            self.slots.len()
        )?;
        for (i, slot) in self.slots.iter().enumerate() {
            let kind = match &slot.kind {
                SlotKind::Local(_) => "local",
                SlotKind::Cell(_) => "cell",
                SlotKind::Spill { .. } => "spill",
                SlotKind::Lasti { .. } => "lasti",
            };
            writeln!(f, "  s{}: {} {} {}", i, slot.ty, kind, slot.name)?;
        }
        if !self.frame_slots.is_empty() {
            write!(f, "  frame:")?;
            for (i, ty) in self.frame_slots.iter().enumerate() {
                write!(f, " f{}: {}", i, ty)?;
            }
            writeln!(f)?;
        }
        for block in &self.blocks {
            write!(f, "{}", block)?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  {}: ; {}", self.id, self.origin)?;
        for phi in &self.phis {
            writeln!(f, "    {}", phi)?;
        }
        for op in &self.ops {
            writeln!(f, "    {}", op)?;
        }
        writeln!(f, "    {}", self.terminator)
    }
}

impl fmt::Display for Phi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = phi.{}", self.dest, self.ty)?;
        for (i, (block, value)) in self.incoming.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " [{}: {}]", block, value)?;
        }
        Ok(())
    }
}

fn unwind_suffix(f: &mut fmt::Formatter<'_>, unwind: Option<BlockRef>) -> fmt::Result {
    match unwind {
        Some(block) => write!(f, " unwind {}", block),
        None => Ok(()),
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Constants
            Op::ConstInt { dest, value } => write!(f, "{} = const.int {}", dest, value),
            Op::ConstBool { dest, value } => write!(f, "{} = const.bool {}", dest, value),
            Op::ConstObj { dest, index } => write!(f, "{} = const.obj #{}", dest, index),
            Op::ConstNull { dest } => write!(f, "{} = const.null", dest),

            // Storage
            Op::LoadArg { dest, index } => write!(f, "{} = arg {}", dest, index),
            Op::LoadSlot { dest, slot } => write!(f, "{} = load {}", dest, slot),
            Op::StoreSlot { slot, value } => write!(f, "store {}, {}", slot, value),
            Op::LoadFrame { dest, field } => write!(f, "{} = frame.load {}", dest, field),
            Op::StoreFrame { field, value } => write!(f, "frame.store {}, {}", field, value),

            // Integer arithmetic
            Op::IntBinary { dest, op, lhs, rhs, unwind } => {
                write!(f, "{} = i{} {}, {}", dest, op.mnemonic(), lhs, rhs)?;
                unwind_suffix(f, *unwind)
            }
            Op::IntCompare { dest, op, lhs, rhs } => {
                write!(f, "{} = icmp.{} {}, {}", dest, op.mnemonic(), lhs, rhs)
            }
            Op::IntNeg { dest, operand, unwind } => {
                write!(f, "{} = ineg {}", dest, operand)?;
                unwind_suffix(f, Some(*unwind))
            }
            Op::IntNot { dest, operand } => write!(f, "{} = inot {}", dest, operand),
            Op::BoolNot { dest, operand } => write!(f, "{} = bnot {}", dest, operand),
            Op::BoolToInt { dest, operand } => write!(f, "{} = bool.to_int {}", dest, operand),
            Op::IntToBool { dest, operand } => write!(f, "{} = int.to_bool {}", dest, operand),
            Op::IsNull { dest, value } => write!(f, "{} = is_null {}", dest, value),

            // Host object model
            Op::CallHost { dest, func, args, unwind } => {
                if let Some(dest) = dest {
                    write!(f, "{} = ", dest)?;
                }
                write!(f, "call @{}(", func)?;
                format_args_list(f, args)?;
                write!(f, ")")?;
                unwind_suffix(f, *unwind)
            }
            Op::GuardBound { value, local, unwind } => {
                write!(f, "guard.bound {} local {}", value, local)?;
                unwind_suffix(f, Some(*unwind))
            }
            Op::IncRef { value } => write!(f, "incref {}", value),
            Op::DecRef { value } => write!(f, "decref {}", value),
            Op::XDecRef { value } => write!(f, "xdecref {}", value),
            Op::FetchException { dest } => write!(f, "{} = exc.fetch", dest),

            // Execution lock
            Op::GilRelease => write!(f, "gil.release"),
            Op::GilAcquire => write!(f, "gil.acquire"),
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Jump(target) => write!(f, "jmp {}", target),
            Terminator::Branch { cond, then_block, else_block } => {
                write!(f, "br {}, {}, {}", cond, then_block, else_block)
            }
            Terminator::Switch { value, cases, default } => {
                write!(f, "switch {} [", value)?;
                for (i, (key, block)) in cases.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, block)?;
                }
                write!(f, "], default {}", default)
            }
            Terminator::Return(value) => write!(f, "ret {}", value),
            Terminator::Suspend(value) => write!(f, "suspend {}", value),
            Terminator::Raise => write!(f, "raise"),
            Terminator::Unreachable => write!(f, "unreachable"),
            Terminator::None => write!(f, "<no terminator>"),
        }
    }
}

fn format_args_list(f: &mut fmt::Formatter<'_>, args: &[ValueId]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", arg)?;
    }
    Ok(())
}
