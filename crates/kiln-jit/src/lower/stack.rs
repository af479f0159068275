//! Reference handles and the abstract operand stack
//!
//! An [`Owned`] stands for a reference the emitted code is responsible for.
//! It cannot be copied or cloned, and the lowering API consumes it in exactly
//! three ways: releasing it, handing it to a call that steals it, or pushing it
//! back onto the abstract stack. A path that forgets one of these leaves an
//! unused `Owned`, which the compiler reports through `#[must_use]`.
//!
//! A [`Borrowed`] is a view that never releases anything. Views of an owned
//! temporary are tied to it by lifetime; views of stack entries and slot
//! contents are not tied to anything, as those stay owned by the stack or
//! the slot for the rest of the block.

use std::marker::PhantomData;

use crate::ir::ValueId;
use crate::ssa::StackValue;

/// A reference the emitted code must dispose of
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an owned reference must be released, stolen or pushed"]
pub struct Owned {
    value: ValueId,
}

impl Owned {
    pub(crate) fn new(value: ValueId) -> Self {
        Owned { value }
    }

    /// The IR value carrying the reference
    pub fn value(&self) -> ValueId {
        self.value
    }

    /// A borrowed view for passing to a non-stealing call
    pub fn borrow(&self) -> Borrowed<'_> {
        Borrowed { value: self.value, _owner: PhantomData }
    }

    /// Give up the handle once ownership has moved elsewhere
    pub(crate) fn into_value(self) -> ValueId {
        self.value
    }
}

/// A non-owning view of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Borrowed<'a> {
    value: ValueId,
    _owner: PhantomData<&'a Owned>,
}

impl Borrowed<'static> {
    /// View of a value owned by the stack or a slot
    pub(crate) fn unowned(value: ValueId) -> Self {
        Borrowed { value, _owner: PhantomData }
    }
}

impl Borrowed<'_> {
    pub fn value(self) -> ValueId {
        self.value
    }
}

/// The operand stack of the block being lowered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbstractStack {
    entries: Vec<StackValue>,
}

impl AbstractStack {
    pub fn new(entries: Vec<StackValue>) -> Self {
        AbstractStack { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, value: StackValue) {
        self.entries.push(value);
    }

    pub fn pop(&mut self) -> Option<StackValue> {
        self.entries.pop()
    }

    /// Entry `n` below the top, 0 being the top
    pub fn peek(&self, n: usize) -> Option<StackValue> {
        self.entries.len().checked_sub(n + 1).map(|i| self.entries[i])
    }

    /// Swap the top with the entry `n - 1` below it
    pub fn swap_top(&mut self, n: usize) -> bool {
        let len = self.entries.len();
        if n < 2 || n > len {
            return false;
        }
        self.entries.swap(len - 1, len - n);
        true
    }

    pub fn as_slice(&self) -> &[StackValue] {
        &self.entries
    }

    pub fn take(&mut self) -> Vec<StackValue> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(v: u32) -> StackValue {
        StackValue::Concrete(ValueId(v))
    }

    #[test]
    fn test_peek_and_swap() {
        let mut stack = AbstractStack::new(vec![c(0), c(1), c(2)]);
        assert_eq!(stack.peek(0), Some(c(2)));
        assert_eq!(stack.peek(2), Some(c(0)));
        assert_eq!(stack.peek(3), None);
        assert!(stack.swap_top(3));
        assert_eq!(stack.as_slice(), &[c(2), c(1), c(0)]);
        assert!(!stack.swap_top(4));
        assert!(!stack.swap_top(1));
    }

    #[test]
    fn test_owned_borrow_tracks_value() {
        let owned = Owned::new(ValueId(4));
        let view = owned.borrow();
        assert_eq!(view.value(), ValueId(4));
        assert_eq!(owned.into_value(), ValueId(4));
    }
}
