//! Static stack effects
//!
//! Each opcode's effect is given as pops/pushes rather than a net delta so
//! underflow can be detected. A handful of opcodes leave the stack at
//! different depths depending on which successor is taken; those are listed
//! in [`ASYMMETRIC_OPCODES`] and answered per edge by [`edge_effect`].

use kiln_bytecode::Opcode;

use super::cfg::EdgeKind;

/// Pops and pushes of one instruction along one path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEffect {
    pub pops: u32,
    pub pushes: u32,
}

impl StackEffect {
    pub const fn new(pops: u32, pushes: u32) -> Self {
        StackEffect { pops, pushes }
    }

    /// Net change in depth
    pub fn delta(&self) -> i64 {
        self.pushes as i64 - self.pops as i64
    }

    /// Depth after applying this effect, or `None` on underflow
    pub fn apply(&self, depth: u32) -> Option<u32> {
        depth.checked_sub(self.pops).map(|d| d + self.pushes)
    }
}

/// Opcodes whose successors see different depths
///
/// | opcode | jump edge | other edge |
/// |---|---|---|
/// | `ForIter` | keeps the exhausted iterator (0) | pushes the item (+1) |
/// | `JumpIfFalseOrPop` / `JumpIfTrueOrPop` | keeps TOS (0) | pops TOS (-1) |
/// | `Send` | replaces receiver and value with the result (-1) | keeps both (0) |
pub const ASYMMETRIC_OPCODES: &[Opcode] = &[
    Opcode::ForIter,
    Opcode::JumpIfFalseOrPop,
    Opcode::JumpIfTrueOrPop,
    Opcode::Send,
];

/// Effect along fall-through, or along every path for symmetric opcodes
///
/// For asymmetric opcodes this is the non-jump path.
pub fn stack_effect(opcode: Opcode, arg: u32) -> StackEffect {
    use Opcode::*;
    let e = StackEffect::new;
    match opcode {
        Nop | Resume | ExtendedArg => e(0, 0),
        PopTop => e(1, 0),
        Copy => e(arg, arg + 1),
        Swap => e(arg, arg),

        LoadConst | LoadFast | LoadDeref | LoadGlobal => e(0, 1),
        StoreFast | StoreDeref | StoreGlobal => e(1, 0),
        DeleteFast | MakeCell => e(0, 0),
        LoadFastLoadFast => e(0, 2),
        StoreFastLoadFast => e(1, 1),
        StoreFastStoreFast => e(2, 0),
        LoadAttr => e(1, 1),
        StoreAttr => e(2, 0),
        ImportName => e(2, 1),
        ImportFrom => e(1, 2),

        BinaryOp | CompareOp | IsOp | ContainsOp | BinarySubscr => e(2, 1),
        UnaryNegative | UnaryNot | UnaryInvert | ToBool => e(1, 1),
        StoreSubscr => e(3, 0),

        BuildTuple | BuildList => e(arg, 1),
        BuildMap => e(arg * 2, 1),
        Call => e(arg + 1, 1),
        GetIter => e(1, 1),
        ForIter => e(1, 2),
        EndFor => e(1, 0),

        JumpForward | JumpBackward => e(0, 0),
        PopJumpIfFalse | PopJumpIfTrue | PopJumpIfNone | PopJumpIfNotNone => e(1, 0),
        ReturnValue => e(1, 0),
        ReturnConst => e(0, 0),

        RaiseVarargs => e(arg, 0),
        Reraise => e(1 + (arg != 0) as u32, 0),
        PushExcInfo => e(1, 2),
        PopExcept => e(1, 0),
        CheckExcMatch => e(2, 2),
        YieldValue | GetAwaitable | Await => e(1, 1),

        SetupFinally | PopBlock | SetupAnnotations => e(0, 0),
        JumpIfFalseOrPop | JumpIfTrueOrPop => e(1, 0),
        ImportStar => e(1, 0),
        LoadBuildClass => e(0, 1),
        GetAIter | AsyncGenWrap => e(1, 1),
        GetANext | BeforeAsyncWith => e(1, 2),
        EndAsyncFor => e(2, 0),
        Send => e(2, 2),
    }
}

/// Effect of the block's last instruction along an outgoing edge of `kind`
pub fn edge_effect(opcode: Opcode, arg: u32, kind: EdgeKind) -> StackEffect {
    match (opcode, kind) {
        (Opcode::ForIter, EdgeKind::IterExhausted) => StackEffect::new(1, 1),
        (Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop, EdgeKind::ConditionalTrue) => {
            StackEffect::new(1, 1)
        }
        (Opcode::Send, EdgeKind::ConditionalTrue) => StackEffect::new(2, 1),
        _ => stack_effect(opcode, arg),
    }
}

/// Whether `opcode`'s successors can see different depths
pub fn is_asymmetric(opcode: Opcode) -> bool {
    ASYMMETRIC_OPCODES.contains(&opcode)
}
