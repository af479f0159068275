//! Native entry ABI for integer-mode functions
//!
//! A compiled function has the C signature
//! `fn(args: *const i64, out: *mut i64) -> i8`. On success it writes the
//! result through `out` and returns [`STATUS_OK`]. On failure it writes one
//! of the `FAIL_*` codes through `out` and returns [`STATUS_RAISED`].

use cranelift_codegen::ir::{self, types, AbiParam};
use cranelift_codegen::isa::CallConv;

pub const STATUS_OK: i8 = 0;
pub const STATUS_RAISED: i8 = 1;
/// Control reached an `unreachable` terminator
pub const STATUS_UNREACHABLE: i8 = 2;

pub const FAIL_OVERFLOW: i64 = 1;
pub const FAIL_ZERO_DIVISION: i64 = 2;
pub const FAIL_NEGATIVE_SHIFT: i64 = 3;

/// Type of a finalized entry point
pub type EntryFn = unsafe extern "C" fn(args: *const i64, out: *mut i64) -> i8;

/// Build the entry signature for the given calling convention
pub fn entry_signature(call_conv: CallConv, pointer: ir::Type) -> ir::Signature {
    let mut sig = ir::Signature::new(call_conv);
    sig.params.push(AbiParam::new(pointer)); // args
    sig.params.push(AbiParam::new(pointer)); // out
    sig.returns.push(AbiParam::new(types::I8));
    sig
}

/// Why a native call failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NativeFailure {
    #[error("expected {expected} arguments, got {found}")]
    ArgCount { expected: usize, found: usize },
    #[error("integer overflow")]
    Overflow,
    #[error("integer division or modulo by zero")]
    ZeroDivision,
    #[error("negative shift count")]
    NegativeShift,
    #[error("reached unreachable code")]
    Unreachable,
}

impl NativeFailure {
    /// Decode the status and `out` value of a failed call
    pub fn from_status(status: i8, code: i64) -> Self {
        match (status, code) {
            (STATUS_RAISED, FAIL_ZERO_DIVISION) => NativeFailure::ZeroDivision,
            (STATUS_RAISED, FAIL_NEGATIVE_SHIFT) => NativeFailure::NegativeShift,
            (STATUS_RAISED, _) => NativeFailure::Overflow,
            _ => NativeFailure::Unreachable,
        }
    }

    /// Exception kind the failure corresponds to
    pub fn exception_kind(&self) -> &'static str {
        match self {
            NativeFailure::ArgCount { .. } => "TypeError",
            NativeFailure::Overflow => "OverflowError",
            NativeFailure::ZeroDivision => "ZeroDivisionError",
            NativeFailure::NegativeShift => "ValueError",
            NativeFailure::Unreachable => "SystemError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_signature_shape() {
        let sig = entry_signature(CallConv::SystemV, types::I64);
        assert_eq!(sig.params.len(), 2);
        assert_eq!(sig.returns, vec![AbiParam::new(types::I8)]);
    }

    #[test]
    fn test_failure_decoding() {
        assert_eq!(
            NativeFailure::from_status(STATUS_RAISED, FAIL_ZERO_DIVISION),
            NativeFailure::ZeroDivision
        );
        assert_eq!(
            NativeFailure::from_status(STATUS_RAISED, FAIL_OVERFLOW).exception_kind(),
            "OverflowError"
        );
        assert_eq!(NativeFailure::from_status(STATUS_UNREACHABLE, 0), NativeFailure::Unreachable);
    }
}
