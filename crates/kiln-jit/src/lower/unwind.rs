//! Exception-unwind integration
//!
//! Every fallible operation gets an unwind target. Inside a protected range
//! the target is a landing pad that releases the owned temporaries and the
//! stack above the region's depth, parks the values below it in the
//! handler's spill slots, optionally records the failing offset and jumps to
//! the handler. Outside any range the pad releases everything the function
//! owns and returns failure.
//!
//! Pads are shared between operations that would emit identical cleanup,
//! keyed by region and the exact values to release.

use crate::analysis::BlockId;
use crate::error::StructuralVerificationError;
use crate::host::HostFn;
use crate::ir::{BlockOrigin, BlockRef, Op, SlotId, Terminator, ValueId};
use crate::ssa::StackValue;

use super::{FunctionLowering, LowerError};

/// Storage a handler's entry stack is rebuilt from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSpill {
    /// One slot per preserved stack position, bottom first
    pub slots: Vec<SlotId>,
    /// Slot holding the boxed failing offset, if the region pushes it
    pub lasti: Option<SlotId>,
}

/// Identity of a landing pad
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PadKey {
    pub region: Option<usize>,
    pub stack: Vec<ValueId>,
    pub temps: Vec<ValueId>,
    /// The pad must reacquire the GIL first
    pub gil: bool,
}

impl FunctionLowering<'_> {
    fn refcounted(&self, values: impl IntoIterator<Item = ValueId>) -> Vec<ValueId> {
        values
            .into_iter()
            .filter(|&v| self.func.value_type(v).is_some_and(|t| t.is_refcounted()))
            .collect()
    }

    fn resolved_stack(&self) -> Vec<ValueId> {
        self.stack.as_slice().iter().map(|&v| self.merges.resolve(v)).collect()
    }

    /// Landing pad for a fallible operation at the current offset
    pub(crate) fn unwind_target(&mut self, gil: bool) -> Result<BlockRef, LowerError> {
        let offset = self.offset();
        let region = self.cfg.region_for(offset);
        let stack = self.resolved_stack();
        let temps = self.refcounted(self.temps.clone());
        let key = match region {
            Some(_) => PadKey { region, stack, temps, gil },
            None => PadKey { region, stack: self.refcounted(stack), temps, gil },
        };
        if let Some(&pad) = self.pads.get(&key) {
            return Ok(pad);
        }

        let pad = self.func.add_block(BlockOrigin::LandingPad(offset));
        let resume = self.current;
        self.current = pad;
        let built = self.fill_pad(&key, offset);
        self.current = resume;
        built?;
        self.pads.insert(key, pad);
        Ok(pad)
    }

    fn fill_pad(&mut self, key: &PadKey, offset: u32) -> Result<(), LowerError> {
        if key.gil {
            self.builder().emit(Op::GilAcquire);
        }
        {
            let mut b = self.builder();
            for &temp in key.temps.iter().rev() {
                b.dec_ref(temp);
            }
        }

        let Some(index) = key.region else {
            self.emit_exit_cleanup(&key.stack);
            self.builder().terminate(Terminator::Raise);
            return Ok(());
        };

        let region = self.cfg.regions[index];
        let depth = region.depth as usize;
        if depth > key.stack.len() {
            return Err(StructuralVerificationError::RegionDepthExceedsStack {
                offset,
                region_depth: region.depth,
                depth: key.stack.len() as u32,
            }
            .into());
        }
        let spill = self.handler_spills.get(&region.target).cloned().ok_or_else(|| {
            let message = format!("handler at {} has no spill slots", region.target);
            StructuralVerificationError::MalformedIr(message)
        })?;
        let handler = self.handler_block(region.target)?;

        let above = self.refcounted(key.stack[depth..].iter().copied());
        let mut b = self.builder();
        for &v in above.iter().rev() {
            b.dec_ref(v);
        }
        for (&slot, &v) in spill.slots.iter().zip(&key.stack[..depth]) {
            b.store_slot(slot, v);
        }
        if let Some(lasti) = spill.lasti {
            let raw = b.const_int(offset as i64);
            if let Some(boxed) = b.call_host(HostFn::BoxInt, vec![raw], None) {
                b.store_slot(lasti, boxed);
            }
        }
        let target = self.ir_of(handler);
        self.builder().terminate(Terminator::Jump(target));
        Ok(())
    }

    fn handler_block(&self, offset: u32) -> Result<BlockId, LowerError> {
        self.cfg.block_at(offset).ok_or_else(|| {
            let message = format!("no block at handler offset {}", offset);
            StructuralVerificationError::MalformedIr(message).into()
        })
    }

    /// Rebuild a handler's entry stack: spills, the failing offset, the exception
    pub(crate) fn handler_entry_stack(
        &mut self,
        id: BlockId,
    ) -> Result<Vec<StackValue>, LowerError> {
        let start = self.cfg.block(id).start;
        let spill = self.handler_spills.get(&start).cloned().ok_or_else(|| {
            StructuralVerificationError::MalformedIr(format!(
                "handler at {} has no spill slots",
                start
            ))
        })?;
        let mut b = self.builder();
        let mut stack: Vec<StackValue> =
            spill.slots.iter().map(|&slot| StackValue::Concrete(b.load_slot(slot))).collect();
        if let Some(lasti) = spill.lasti {
            stack.push(StackValue::Concrete(b.load_slot(lasti)));
        }
        stack.push(StackValue::Concrete(b.fetch_exception()));

        let expected = self.cfg.block(id).entry_depth.unwrap_or(0) as usize;
        if stack.len() != expected {
            return Err(StructuralVerificationError::DepthMismatch {
                block: start,
                expected: expected as u32,
                found: stack.len() as u32,
            }
            .into());
        }
        Ok(stack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_keys_distinguish_gil_state() {
        let a = PadKey { region: None, stack: vec![ValueId(1)], temps: vec![], gil: false };
        let b = PadKey { gil: true, ..a.clone() };
        assert_ne!(a, b);
        let c = PadKey { region: None, stack: vec![ValueId(1)], temps: vec![], gil: false };
        assert_eq!(a, c);
    }
}
