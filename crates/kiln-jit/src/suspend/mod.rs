//! Suspension lowering: generators and coroutines as re-entrant state machines
//!
//! Suspension points (`YieldValue`, `Await`) end their block, so each one is a
//! block boundary with a single `Resume` successor. [`plan`] numbers them in
//! offset order, starting at 1 (state 0 is the first entry), and lays out the
//! frame. The emission itself lives in [`dispatch`].

pub mod dispatch;
pub mod frame;

use kiln_bytecode::{CodeObject, Opcode};

use crate::analysis::{BitSet, BlockId, ControlFlowGraph, DecodedFunction, Liveness};

pub use dispatch::DispatchTable;
pub use frame::{FrameLayout, FrameSlot, FrameSlotKind};

/// State stored once a frame has returned or raised
pub const TERMINAL_STATE: u32 = u32::MAX;

/// One place where a state machine can pause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspensionPoint {
    /// Byte offset of the suspending instruction
    pub offset: u32,
    /// Resumption state id
    pub state: u32,
    /// Block the suspension ends
    pub block: BlockId,
    /// `varnames` indices live across the pause, ascending
    pub live_locals: Vec<u32>,
    /// Operand-stack values kept across the pause (the yielded value excluded)
    pub stack_depth: u32,
}

/// Suspension points and frame layout of one function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspensionPlan {
    pub points: Vec<SuspensionPoint>,
    pub layout: FrameLayout,
}

impl SuspensionPlan {
    pub fn point_at(&self, offset: u32) -> Option<&SuspensionPoint> {
        self.points.iter().find(|p| p.offset == offset)
    }
}

/// Whether `code` must be lowered as a state machine
pub fn needs_state_machine(code: &CodeObject, decoded: &DecodedFunction) -> bool {
    code.is_suspendable() || decoded.instructions.iter().any(|i| i.opcode.is_suspension())
}

/// Number the suspension points of `cfg` and lay out the frame
///
/// The graph must have been built with suspension splitting and have its
/// depths propagated.
pub fn plan(code: &CodeObject, cfg: &ControlFlowGraph, liveness: &Liveness) -> SuspensionPlan {
    let mut points = Vec::new();
    let mut live_union = BitSet::new(liveness.locals());
    let mut max_spill = 0;

    for block in &cfg.blocks {
        if block.entry_depth.is_none() {
            continue;
        }
        let last = cfg.terminator(block.id);
        if !matches!(last.opcode, Opcode::YieldValue | Opcode::Await) {
            continue;
        }
        let before = cfg.depth_before.get(block.instrs.end - 1).copied().flatten().unwrap_or(1);
        let stack_depth = before.saturating_sub(1);
        let live = liveness.live_across(cfg, block.id);
        live_union.union_with(&live);
        max_spill = max_spill.max(stack_depth);
        points.push(SuspensionPoint {
            offset: last.offset,
            state: points.len() as u32 + 1,
            block: block.id,
            live_locals: live.iter().map(|i| i as u32).collect(),
            stack_depth,
        });
    }

    let layout = FrameLayout::build(code, &live_union, max_spill);
    tracing::debug!(
        name = %code.name,
        points = points.len(),
        frame_slots = layout.len(),
        "planned suspension points"
    );
    SuspensionPlan { points, layout }
}
