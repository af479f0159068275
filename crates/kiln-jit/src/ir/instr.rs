//! IR operations, blocks and functions
//!
//! Values are in SSA form: every value is defined once, by an op or a phi.
//! Locals live in slots, which are mutable and never merged. Ops that can
//! fail name an unwind block; on failure control transfers there instead of
//! to the next op, and the op's result is not defined.

use rustc_hash::{FxHashMap, FxHashSet};

use kiln_bytecode::{CmpOp, NbOp};

use super::types::{IrType, Mode};
use crate::host::HostFn;

/// SSA value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// IR block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRef(pub u32);

impl BlockRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Mutable per-invocation storage cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Field of a state-machine frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameField {
    /// Resumption state id
    State,
    /// Value delivered by the resumer
    SentValue,
    /// Exception injected by the resumer
    Thrown,
    /// Spilled local or stack value
    Slot(u32),
}

impl std::fmt::Display for FrameField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameField::State => write!(f, "state"),
            FrameField::SentValue => write!(f, "sent"),
            FrameField::Thrown => write!(f, "thrown"),
            FrameField::Slot(i) => write!(f, "f{}", i),
        }
    }
}

/// Unboxed integer operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntBinOp {
    Add,
    Sub,
    Mul,
    FloorDiv,
    Mod,
    Shl,
    Shr,
    And,
    Or,
    Xor,
}

impl IntBinOp {
    /// The integer operator for a `BinaryOp` selector, if it has one
    pub fn from_nb(op: NbOp) -> Option<Self> {
        Some(match op.base() {
            NbOp::Add => IntBinOp::Add,
            NbOp::Subtract => IntBinOp::Sub,
            NbOp::Multiply => IntBinOp::Mul,
            NbOp::FloorDivide => IntBinOp::FloorDiv,
            NbOp::Remainder => IntBinOp::Mod,
            NbOp::Lshift => IntBinOp::Shl,
            NbOp::Rshift => IntBinOp::Shr,
            NbOp::And => IntBinOp::And,
            NbOp::Or => IntBinOp::Or,
            NbOp::Xor => IntBinOp::Xor,
            _ => return None,
        })
    }

    /// Whether some operands make the operation fail
    pub fn can_fail(self) -> bool {
        !matches!(self, IntBinOp::And | IntBinOp::Or | IntBinOp::Xor)
    }

    /// Evaluate with floor semantics; `None` on overflow, zero division or a
    /// negative shift count
    pub fn eval(self, a: i64, b: i64) -> Option<i64> {
        match self {
            IntBinOp::Add => a.checked_add(b),
            IntBinOp::Sub => a.checked_sub(b),
            IntBinOp::Mul => a.checked_mul(b),
            IntBinOp::FloorDiv => {
                let q = a.checked_div(b)?;
                if (a % b != 0) && ((a < 0) != (b < 0)) {
                    Some(q - 1)
                } else {
                    Some(q)
                }
            }
            IntBinOp::Mod => {
                let r = a.checked_rem(b)?;
                if r != 0 && ((r < 0) != (b < 0)) {
                    Some(r + b)
                } else {
                    Some(r)
                }
            }
            IntBinOp::Shl => {
                if b < 0 {
                    return None;
                }
                if a == 0 {
                    return Some(0);
                }
                if b >= 64 {
                    return None;
                }
                let shifted = a << b;
                (shifted >> b == a).then_some(shifted)
            }
            IntBinOp::Shr => {
                if b < 0 {
                    None
                } else {
                    Some(a >> b.min(63))
                }
            }
            IntBinOp::And => Some(a & b),
            IntBinOp::Or => Some(a | b),
            IntBinOp::Xor => Some(a ^ b),
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            IntBinOp::Add => "add",
            IntBinOp::Sub => "sub",
            IntBinOp::Mul => "mul",
            IntBinOp::FloorDiv => "floordiv",
            IntBinOp::Mod => "mod",
            IntBinOp::Shl => "shl",
            IntBinOp::Shr => "shr",
            IntBinOp::And => "and",
            IntBinOp::Or => "or",
            IntBinOp::Xor => "xor",
        }
    }
}

/// Unboxed integer comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntCmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

impl IntCmpOp {
    pub fn from_cmp(op: CmpOp) -> Self {
        match op {
            CmpOp::Lt => IntCmpOp::Lt,
            CmpOp::Le => IntCmpOp::Le,
            CmpOp::Eq => IntCmpOp::Eq,
            CmpOp::Ne => IntCmpOp::Ne,
            CmpOp::Gt => IntCmpOp::Gt,
            CmpOp::Ge => IntCmpOp::Ge,
        }
    }

    pub fn eval(self, a: i64, b: i64) -> bool {
        match self {
            IntCmpOp::Lt => a < b,
            IntCmpOp::Le => a <= b,
            IntCmpOp::Eq => a == b,
            IntCmpOp::Ne => a != b,
            IntCmpOp::Gt => a > b,
            IntCmpOp::Ge => a >= b,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            IntCmpOp::Lt => "lt",
            IntCmpOp::Le => "le",
            IntCmpOp::Eq => "eq",
            IntCmpOp::Ne => "ne",
            IntCmpOp::Gt => "gt",
            IntCmpOp::Ge => "ge",
        }
    }
}

/// An IR operation
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // ===== Constants =====
    ConstInt { dest: ValueId, value: i64 },
    ConstBool { dest: ValueId, value: bool },
    /// New reference to `constants[index]`
    ConstObj { dest: ValueId, index: u32 },
    ConstNull { dest: ValueId },

    // ===== Arguments & Storage =====
    /// Borrowed argument `index` of the call
    LoadArg { dest: ValueId, index: u32 },
    LoadSlot { dest: ValueId, slot: SlotId },
    StoreSlot { slot: SlotId, value: ValueId },
    LoadFrame { dest: ValueId, field: FrameField },
    StoreFrame { field: FrameField, value: ValueId },

    // ===== Integer Arithmetic =====
    IntBinary { dest: ValueId, op: IntBinOp, lhs: ValueId, rhs: ValueId, unwind: Option<BlockRef> },
    IntCompare { dest: ValueId, op: IntCmpOp, lhs: ValueId, rhs: ValueId },
    IntNeg { dest: ValueId, operand: ValueId, unwind: BlockRef },
    IntNot { dest: ValueId, operand: ValueId },
    BoolNot { dest: ValueId, operand: ValueId },
    BoolToInt { dest: ValueId, operand: ValueId },
    IntToBool { dest: ValueId, operand: ValueId },
    IsNull { dest: ValueId, value: ValueId },

    // ===== Host Object Model =====
    CallHost { dest: Option<ValueId>, func: HostFn, args: Vec<ValueId>, unwind: Option<BlockRef> },
    /// Raise `UnboundLocalError` for local `local` when `value` is null
    GuardBound { value: ValueId, local: u32, unwind: BlockRef },
    IncRef { value: ValueId },
    DecRef { value: ValueId },
    /// Release unless null
    XDecRef { value: ValueId },
    /// New reference to the active exception
    FetchException { dest: ValueId },

    // ===== Execution Lock =====
    GilRelease,
    GilAcquire,
}

impl Op {
    /// The value this op defines
    pub fn dest(&self) -> Option<ValueId> {
        match self {
            Op::ConstInt { dest, .. }
            | Op::ConstBool { dest, .. }
            | Op::ConstObj { dest, .. }
            | Op::ConstNull { dest }
            | Op::LoadArg { dest, .. }
            | Op::LoadSlot { dest, .. }
            | Op::LoadFrame { dest, .. }
            | Op::IntBinary { dest, .. }
            | Op::IntCompare { dest, .. }
            | Op::IntNeg { dest, .. }
            | Op::IntNot { dest, .. }
            | Op::BoolNot { dest, .. }
            | Op::BoolToInt { dest, .. }
            | Op::IntToBool { dest, .. }
            | Op::IsNull { dest, .. }
            | Op::FetchException { dest } => Some(*dest),
            Op::CallHost { dest, .. } => *dest,
            Op::StoreSlot { .. }
            | Op::StoreFrame { .. }
            | Op::GuardBound { .. }
            | Op::IncRef { .. }
            | Op::DecRef { .. }
            | Op::XDecRef { .. }
            | Op::GilRelease
            | Op::GilAcquire => None,
        }
    }

    /// Values read by this op, in operand order
    pub fn uses(&self) -> Vec<ValueId> {
        let mut out = Vec::new();
        self.visit_uses(|v| out.push(v));
        out
    }

    fn visit_uses(&self, mut f: impl FnMut(ValueId)) {
        match self {
            Op::ConstInt { .. }
            | Op::ConstBool { .. }
            | Op::ConstObj { .. }
            | Op::ConstNull { .. }
            | Op::LoadArg { .. }
            | Op::LoadSlot { .. }
            | Op::LoadFrame { .. }
            | Op::FetchException { .. }
            | Op::GilRelease
            | Op::GilAcquire => {}
            Op::StoreSlot { value, .. } | Op::StoreFrame { value, .. } => f(*value),
            Op::IntBinary { lhs, rhs, .. } | Op::IntCompare { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            Op::IntNeg { operand, .. }
            | Op::IntNot { operand, .. }
            | Op::BoolNot { operand, .. }
            | Op::BoolToInt { operand, .. }
            | Op::IntToBool { operand, .. } => f(*operand),
            Op::IsNull { value, .. }
            | Op::GuardBound { value, .. }
            | Op::IncRef { value }
            | Op::DecRef { value }
            | Op::XDecRef { value } => f(*value),
            Op::CallHost { args, .. } => args.iter().copied().for_each(f),
        }
    }

    /// Rewrite every used value through `f`
    pub fn map_uses(&mut self, mut f: impl FnMut(ValueId) -> ValueId) {
        match self {
            Op::ConstInt { .. }
            | Op::ConstBool { .. }
            | Op::ConstObj { .. }
            | Op::ConstNull { .. }
            | Op::LoadArg { .. }
            | Op::LoadSlot { .. }
            | Op::LoadFrame { .. }
            | Op::FetchException { .. }
            | Op::GilRelease
            | Op::GilAcquire => {}
            Op::StoreSlot { value, .. } | Op::StoreFrame { value, .. } => *value = f(*value),
            Op::IntBinary { lhs, rhs, .. } | Op::IntCompare { lhs, rhs, .. } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
            }
            Op::IntNeg { operand, .. }
            | Op::IntNot { operand, .. }
            | Op::BoolNot { operand, .. }
            | Op::BoolToInt { operand, .. }
            | Op::IntToBool { operand, .. } => *operand = f(*operand),
            Op::IsNull { value, .. }
            | Op::GuardBound { value, .. }
            | Op::IncRef { value }
            | Op::DecRef { value }
            | Op::XDecRef { value } => *value = f(*value),
            Op::CallHost { args, .. } => {
                for arg in args.iter_mut() {
                    *arg = f(*arg);
                }
            }
        }
    }

    /// Block control moves to when this op fails
    pub fn unwind(&self) -> Option<BlockRef> {
        match self {
            Op::IntBinary { unwind, .. } | Op::CallHost { unwind, .. } => *unwind,
            Op::IntNeg { unwind, .. } | Op::GuardBound { unwind, .. } => Some(*unwind),
            _ => None,
        }
    }

    pub fn unwind_mut(&mut self) -> Option<&mut BlockRef> {
        match self {
            Op::IntBinary { unwind, .. } | Op::CallHost { unwind, .. } => unwind.as_mut(),
            Op::IntNeg { unwind, .. } | Op::GuardBound { unwind, .. } => Some(unwind),
            _ => None,
        }
    }

    /// Whether the op can be removed when its result is unused
    pub fn is_pure(&self) -> bool {
        match self {
            Op::ConstInt { .. }
            | Op::ConstBool { .. }
            | Op::ConstNull { .. }
            | Op::LoadArg { .. }
            | Op::LoadSlot { .. }
            | Op::LoadFrame { .. }
            | Op::IntCompare { .. }
            | Op::IntNot { .. }
            | Op::BoolNot { .. }
            | Op::BoolToInt { .. }
            | Op::IntToBool { .. }
            | Op::IsNull { .. } => true,
            Op::IntBinary { op, .. } => !op.can_fail(),
            _ => false,
        }
    }
}

/// Merge of one stack position at a block with several predecessors
#[derive(Debug, Clone, PartialEq)]
pub struct Phi {
    pub dest: ValueId,
    pub ty: IrType,
    pub incoming: Vec<(BlockRef, ValueId)>,
}

/// How an IR block ends
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Jump(BlockRef),
    Branch { cond: ValueId, then_block: BlockRef, else_block: BlockRef },
    Switch { value: ValueId, cases: Vec<(i64, BlockRef)>, default: BlockRef },
    /// Return `value` to the caller, transferring its reference
    Return(ValueId),
    /// Pause a state machine, handing `value` to the resumer
    Suspend(ValueId),
    /// Return failure with the active exception set
    Raise,
    Unreachable,
    /// Not yet assigned
    None,
}

impl Terminator {
    /// Successor blocks in operand order
    pub fn successors(&self) -> Vec<BlockRef> {
        match self {
            Terminator::Jump(target) => vec![*target],
            Terminator::Branch { then_block, else_block, .. } => vec![*then_block, *else_block],
            Terminator::Switch { cases, default, .. } => {
                let mut out: Vec<_> = cases.iter().map(|(_, b)| *b).collect();
                out.push(*default);
                out
            }
            _ => Vec::new(),
        }
    }

    pub fn map_targets(&mut self, mut f: impl FnMut(BlockRef) -> BlockRef) {
        match self {
            Terminator::Jump(target) => *target = f(*target),
            Terminator::Branch { then_block, else_block, .. } => {
                *then_block = f(*then_block);
                *else_block = f(*else_block);
            }
            Terminator::Switch { cases, default, .. } => {
                for (_, block) in cases.iter_mut() {
                    *block = f(*block);
                }
                *default = f(*default);
            }
            _ => {}
        }
    }

    /// Value read by the terminator
    pub fn used_value(&self) -> Option<ValueId> {
        match self {
            Terminator::Branch { cond, .. } => Some(*cond),
            Terminator::Switch { value, .. } => Some(*value),
            Terminator::Return(v) | Terminator::Suspend(v) => Some(*v),
            _ => None,
        }
    }

    pub fn map_use(&mut self, f: impl FnOnce(ValueId) -> ValueId) {
        match self {
            Terminator::Branch { cond, .. } => *cond = f(*cond),
            Terminator::Switch { value, .. } => *value = f(*value),
            Terminator::Return(v) | Terminator::Suspend(v) => *v = f(*v),
            _ => {}
        }
    }
}

/// Where an IR block came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    /// Function entry: argument and slot setup
    Prologue,
    /// State-machine entry switching on the frame state
    Dispatch,
    /// The bytecode block starting at this offset
    Bytecode(u32),
    /// Unwinding from a failure at this offset
    LandingPad(u32),
    /// Resumption after suspension state `k`
    Resume(u32),
    /// Exception injected at suspension state `k`
    Throw(u32),
    /// Shared failure exit
    Raise,
}

impl std::fmt::Display for BlockOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockOrigin::Prologue => write!(f, "prologue"),
            BlockOrigin::Dispatch => write!(f, "dispatch"),
            BlockOrigin::Bytecode(offset) => write!(f, "@{}", offset),
            BlockOrigin::LandingPad(offset) => write!(f, "unwind @{}", offset),
            BlockOrigin::Resume(state) => write!(f, "resume {}", state),
            BlockOrigin::Throw(state) => write!(f, "throw {}", state),
            BlockOrigin::Raise => write!(f, "raise"),
        }
    }
}

/// An IR basic block
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: BlockRef,
    pub origin: BlockOrigin,
    pub phis: Vec<Phi>,
    pub ops: Vec<Op>,
    pub terminator: Terminator,
}

impl Block {
    /// Every block control can reach from here, unwind targets included
    pub fn all_successors(&self) -> Vec<BlockRef> {
        let mut out: Vec<BlockRef> = self.ops.iter().filter_map(Op::unwind).collect();
        out.extend(self.terminator.successors());
        out
    }
}

/// What a slot holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotKind {
    /// `varnames[i]`
    Local(u32),
    /// Cell or free variable at slot index `i`
    Cell(u32),
    /// Stack value `index` preserved for the handler at `handler`
    Spill { handler: u32, index: u32 },
    /// Failing offset pushed for the handler at `handler`
    Lasti { handler: u32 },
}

/// A per-invocation storage cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub name: String,
    pub ty: IrType,
    pub kind: SlotKind,
}

/// A complete IR function
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub mode: Mode,
    /// Length of the argument vector
    pub param_count: u32,
    pub slots: Vec<SlotInfo>,
    /// Types of `FrameField::Slot` fields; empty unless this is a state machine
    pub frame_slots: Vec<IrType>,
    pub blocks: Vec<Block>,
    pub entry: BlockRef,
    pub next_value: u32,
    pub value_types: FxHashMap<ValueId, IrType>,
}

impl Function {
    pub fn new(name: impl Into<String>, mode: Mode, param_count: u32) -> Self {
        Function {
            name: name.into(),
            mode,
            param_count,
            slots: Vec::new(),
            frame_slots: Vec::new(),
            blocks: Vec::new(),
            entry: BlockRef(0),
            next_value: 0,
            value_types: FxHashMap::default(),
        }
    }

    /// Whether the function is entered through a state-machine frame
    pub fn is_state_machine(&self) -> bool {
        !self.frame_slots.is_empty()
            || self.blocks.iter().any(|b| b.origin == BlockOrigin::Dispatch)
    }

    /// Allocate a fresh value of type `ty`
    pub fn alloc_value(&mut self, ty: IrType) -> ValueId {
        let value = ValueId(self.next_value);
        self.next_value += 1;
        self.value_types.insert(value, ty);
        value
    }

    pub fn value_type(&self, value: ValueId) -> Option<IrType> {
        self.value_types.get(&value).copied()
    }

    pub fn add_slot(&mut self, name: impl Into<String>, ty: IrType, kind: SlotKind) -> SlotId {
        self.slots.push(SlotInfo { name: name.into(), ty, kind });
        SlotId(self.slots.len() as u32 - 1)
    }

    pub fn add_block(&mut self, origin: BlockOrigin) -> BlockRef {
        let id = BlockRef(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            origin,
            phis: Vec::new(),
            ops: Vec::new(),
            terminator: Terminator::None,
        });
        id
    }

    pub fn block(&self, id: BlockRef) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockRef) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    /// Total ops across all blocks, phis excluded
    pub fn op_count(&self) -> usize {
        self.blocks.iter().map(|b| b.ops.len()).sum()
    }

    pub fn phi_count(&self) -> usize {
        self.blocks.iter().map(|b| b.phis.len()).sum()
    }

    /// Predecessors of every block, unwind edges included
    pub fn predecessors(&self) -> Vec<Vec<BlockRef>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for block in &self.blocks {
            for succ in block.all_successors() {
                if let Some(list) = preds.get_mut(succ.index()) {
                    if !list.contains(&block.id) {
                        list.push(block.id);
                    }
                }
            }
        }
        preds
    }

    /// Delete blocks for which `keep` is false and renumber the rest
    ///
    /// Returns the old-to-new mapping. References to deleted blocks must not
    /// remain in kept blocks.
    pub fn retain_blocks(&mut self, keep: impl Fn(&Block) -> bool) -> Vec<Option<BlockRef>> {
        let mut remap = vec![None; self.blocks.len()];
        let mut next = 0u32;
        for block in &self.blocks {
            if keep(block) {
                remap[block.id.index()] = Some(BlockRef(next));
                next += 1;
            }
        }
        let blocks = std::mem::take(&mut self.blocks);
        let map = |b: BlockRef| remap[b.index()].unwrap_or(b);
        for mut block in blocks {
            let Some(id) = remap[block.id.index()] else { continue };
            block.id = id;
            for phi in block.phis.iter_mut() {
                for (pred, _) in phi.incoming.iter_mut() {
                    *pred = map(*pred);
                }
            }
            for op in block.ops.iter_mut() {
                if let Some(unwind) = op.unwind_mut() {
                    *unwind = map(*unwind);
                }
            }
            block.terminator.map_targets(map);
            self.blocks.push(block);
        }
        self.entry = map(self.entry);
        remap
    }

    /// Delete blocks unreachable from the entry, returning the old-to-new map
    ///
    /// Phi incomings from deleted blocks are dropped first.
    pub fn remove_unreachable(&mut self) -> Vec<Option<BlockRef>> {
        let mut reachable = FxHashSet::default();
        let mut work = vec![self.entry];
        while let Some(block) = work.pop() {
            if reachable.insert(block) {
                work.extend(self.block(block).all_successors());
            }
        }
        for block in self.blocks.iter_mut() {
            for phi in block.phis.iter_mut() {
                phi.incoming.retain(|(pred, _)| reachable.contains(pred));
            }
        }
        self.retain_blocks(|b| reachable.contains(&b.id))
    }

    /// Replace every use of a value through `f`, in phis, ops and terminators
    pub fn map_all_uses(&mut self, f: impl Fn(ValueId) -> ValueId) {
        for block in self.blocks.iter_mut() {
            for phi in block.phis.iter_mut() {
                for (_, value) in phi.incoming.iter_mut() {
                    *value = f(*value);
                }
            }
            for op in block.ops.iter_mut() {
                op.map_uses(&f);
            }
            block.terminator.map_use(&f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_division_semantics() {
        assert_eq!(IntBinOp::FloorDiv.eval(7, 2), Some(3));
        assert_eq!(IntBinOp::FloorDiv.eval(-7, 2), Some(-4));
        assert_eq!(IntBinOp::FloorDiv.eval(7, -2), Some(-4));
        assert_eq!(IntBinOp::FloorDiv.eval(1, 0), None);
        assert_eq!(IntBinOp::FloorDiv.eval(i64::MIN, -1), None);
        assert_eq!(IntBinOp::Mod.eval(-7, 2), Some(1));
        assert_eq!(IntBinOp::Mod.eval(7, -2), Some(-1));
        assert_eq!(IntBinOp::Mod.eval(6, 3), Some(0));
        assert_eq!(IntBinOp::Mod.eval(1, 0), None);
    }

    #[test]
    fn test_shift_semantics() {
        assert_eq!(IntBinOp::Shl.eval(1, 62), Some(1 << 62));
        assert_eq!(IntBinOp::Shl.eval(1, 63), None);
        assert_eq!(IntBinOp::Shl.eval(0, 100), Some(0));
        assert_eq!(IntBinOp::Shl.eval(1, -1), None);
        assert_eq!(IntBinOp::Shr.eval(-8, 100), Some(-1));
        assert_eq!(IntBinOp::Shr.eval(8, 2), Some(2));
    }

    #[test]
    fn test_from_nb_covers_inplace() {
        assert_eq!(IntBinOp::from_nb(NbOp::InplaceAdd), Some(IntBinOp::Add));
        assert_eq!(IntBinOp::from_nb(NbOp::InplaceXor), Some(IntBinOp::Xor));
        assert_eq!(IntBinOp::from_nb(NbOp::TrueDivide), None);
        assert_eq!(IntBinOp::from_nb(NbOp::Power), None);
    }

    #[test]
    fn test_retain_blocks_remaps_targets() {
        let mut func = Function::new("f", Mode::Integer, 0);
        let a = func.add_block(BlockOrigin::Prologue);
        let dead = func.add_block(BlockOrigin::Bytecode(0));
        let c = func.add_block(BlockOrigin::Bytecode(4));
        let v = func.alloc_value(IrType::I64);
        func.block_mut(a).terminator = Terminator::Jump(c);
        func.block_mut(dead).terminator = Terminator::Unreachable;
        func.block_mut(c).ops.push(Op::ConstInt { dest: v, value: 1 });
        func.block_mut(c).terminator = Terminator::Return(v);
        let remap = func.retain_blocks(|b| b.id != dead);
        assert_eq!(remap, vec![Some(BlockRef(0)), None, Some(BlockRef(1))]);
        assert_eq!(func.blocks.len(), 2);
        assert_eq!(func.blocks[0].terminator, Terminator::Jump(BlockRef(1)));
        assert_eq!(func.blocks[1].id, BlockRef(1));
    }

    #[test]
    fn test_uses_and_map_uses() {
        let mut op = Op::CallHost {
            dest: Some(ValueId(9)),
            func: HostFn::GetItem,
            args: vec![ValueId(1), ValueId(2)],
            unwind: None,
        };
        assert_eq!(op.uses(), vec![ValueId(1), ValueId(2)]);
        op.map_uses(|v| if v == ValueId(2) { ValueId(7) } else { v });
        assert_eq!(op.uses(), vec![ValueId(1), ValueId(7)]);
        assert_eq!(op.dest(), Some(ValueId(9)));
    }
}
