//! State-machine entry dispatch and suspension emission
//!
//! The function entry reads `state` and switches to the first block (state 0)
//! or to the resume block of the suspension that stored it. Any other state
//! means the frame already finished and fails through `FrameExhausted`.
//!
//! Suspending spills the operand stack below the yielded value into the
//! frame, stores the next state and leaves through `Suspend`. Resuming
//! reloads the spills and either raises the thrown-in exception at the
//! suspension offset or pushes the sent value and continues.

use crate::analysis::{BlockId, Instruction};
use crate::error::StructuralVerificationError;
use crate::host::HostFn;
use crate::ir::{BlockOrigin, BlockRef, FrameField, Terminator};
use crate::lower::{FunctionLowering, LocalStorage, LowerError};
use crate::ssa::StackValue;

use super::TERMINAL_STATE;

/// Resume targets of a lowered state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTable {
    /// The dispatch block
    pub entry: BlockRef,
    /// `(state, resume block)` for every suspension, ascending by state
    pub states: Vec<(u32, BlockRef)>,
}

impl DispatchTable {
    pub fn resume_block(&self, state: u32) -> Option<BlockRef> {
        self.states.iter().find(|(s, _)| *s == state).map(|(_, b)| *b)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl FunctionLowering<'_> {
    fn per_invocation_slots(&self) -> Vec<crate::ir::SlotId> {
        self.locals
            .iter()
            .filter_map(|s| match s {
                LocalStorage::Slot(slot) => Some(*slot),
                LocalStorage::Frame(_) => None,
            })
            .collect()
    }

    /// Fill the dispatch block, which is the current block
    pub(crate) fn emit_dispatch(&mut self, first: BlockRef) -> Result<(), LowerError> {
        let slots = self.per_invocation_slots();
        let mut b = self.builder();
        for slot in slots {
            let null = b.const_null();
            b.store_slot(slot, null);
        }
        let state = b.load_frame(FrameField::State);

        let mut cases = vec![(0, first)];
        let mut states: Vec<(u32, BlockRef)> =
            self.resume_blocks.iter().map(|(&s, &b)| (s, b)).collect();
        states.sort_unstable();
        cases.extend(states.into_iter().map(|(s, b)| (s as i64, b)));

        let exhausted = self.func.add_block(BlockOrigin::Raise);
        let raise = self.bare_raise_block();
        {
            let mut b = self.builder();
            b.switch_to_block(exhausted);
            b.call_host(HostFn::FrameExhausted, Vec::new(), Some(raise));
            b.terminate(Terminator::Unreachable);
        }
        self.builder().terminate(Terminator::Switch { value: state, cases, default: exhausted });
        Ok(())
    }

    /// Release every frame field and mark the frame finished
    pub(crate) fn emit_frame_exit(&mut self) {
        let count = self.func.frame_slots.len() as u32;
        let mut b = self.builder();
        let fields = (0..count)
            .map(FrameField::Slot)
            .chain([FrameField::SentValue, FrameField::Thrown]);
        for field in fields {
            let value = b.load_frame(field);
            b.xdec_ref(value);
            let null = b.const_null();
            b.store_frame(field, null);
        }
        let done = b.const_int(TERMINAL_STATE as i64);
        b.store_frame(FrameField::State, done);
    }

    /// Lower a suspension ending the current block and build its resume path
    pub(crate) fn lower_suspension(
        &mut self,
        instr: &Instruction,
        cont: BlockId,
    ) -> Result<(), LowerError> {
        let plan = self.suspension.ok_or_else(|| {
            StructuralVerificationError::MalformedIr("suspension outside a state machine".into())
        })?;
        let point = plan.point_at(instr.offset).cloned().ok_or_else(|| {
            let message = format!("no suspension point at {}", instr.offset);
            StructuralVerificationError::MalformedIr(message)
        })?;
        let layout = &plan.layout;

        let yielded = self.pop()?;
        let kept: Vec<_> = self.stack.take().into_iter().map(|v| self.merges.resolve(v)).collect();
        if kept.len() != point.stack_depth as usize {
            return Err(StructuralVerificationError::DepthMismatch {
                block: self.cfg.block(point.block).start,
                expected: point.stack_depth,
                found: kept.len() as u32,
            }
            .into());
        }

        // Suspend
        {
            let mut b = self.builder();
            for (i, &value) in kept.iter().enumerate() {
                b.store_frame(layout.spill_field(i as u32), value);
            }
        }
        self.release_slot_locals();
        let value = self.hand_off(yielded);
        let mut b = self.builder();
        let next = b.const_int(point.state as i64);
        b.store_frame(FrameField::State, next);
        b.terminate(Terminator::Suspend(value));

        // Resume
        let resume = self.resume_blocks.get(&point.state).copied().ok_or_else(|| {
            let message = format!("state {} has no resume block", point.state);
            StructuralVerificationError::MalformedIr(message)
        })?;
        let throw = self.func.add_block(BlockOrigin::Throw(point.state));
        let proceed = self.func.add_block(BlockOrigin::Resume(point.state));

        self.current = resume;
        let mut b = self.builder();
        let mut restored = Vec::with_capacity(kept.len());
        for i in 0..kept.len() as u32 {
            let field = layout.spill_field(i);
            restored.push(StackValue::Concrete(b.load_frame(field)));
            let null = b.const_null();
            b.store_frame(field, null);
        }
        let thrown = b.load_frame(FrameField::Thrown);
        let no_throw = b.is_null(thrown);
        b.terminate(Terminator::Branch { cond: no_throw, then_block: proceed, else_block: throw });

        // Thrown in: raise at the suspension offset
        self.current = throw;
        self.stack = crate::lower::AbstractStack::new(restored.clone());
        {
            let mut b = self.builder();
            let null = b.const_null();
            b.store_frame(FrameField::Thrown, null);
        }
        let exc = self.adopt(thrown);
        self.call_raise(HostFn::Raise, vec![exc])?;

        // Sent in: push and continue
        self.current = proceed;
        let mut b = self.builder();
        let sent = b.load_frame(FrameField::SentValue);
        let null = b.const_null();
        b.store_frame(FrameField::SentValue, null);
        restored.push(StackValue::Concrete(sent));
        self.deliver(cont, proceed, &restored)?;
        let target = self.ir_of(cont);
        self.builder().terminate(Terminator::Jump(target));
        self.stack = crate::lower::AbstractStack::default();
        Ok(())
    }
}
