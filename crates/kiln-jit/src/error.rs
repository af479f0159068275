//! Compiler error taxonomy
//!
//! Decoding failures live with the decoder ([`crate::analysis::decoder::DecodeError`]);
//! the conditions here are raised by analysis, validation and lowering.
//! [`crate::pipeline::CompileError`] aggregates all of them.

use kiln_bytecode::Opcode;

use crate::ir::Mode;

/// An analysis or lowering invariant was violated
///
/// These indicate malformed input that slipped past decoding or a compiler
/// defect. They are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralVerificationError {
    #[error("block at offset {block} entered with depth {found}, expected {expected}")]
    DepthMismatch { block: u32, expected: u32, found: u32 },

    #[error("{opcode} at offset {offset} pops {pops} from a stack of depth {depth}")]
    StackUnderflow { opcode: Opcode, offset: u32, pops: u32, depth: u32 },

    #[error("handler at offset {handler} declared with depths {first} and {second}")]
    HandlerDepthConflict { handler: u32, first: u32, second: u32 },

    #[error("offset {offset} has unwind depth {region_depth} but the stack holds only {depth}")]
    RegionDepthExceedsStack { offset: u32, region_depth: u32, depth: u32 },

    #[error("handler at offset {0} is also reached by normal control flow")]
    HandlerWithNormalPredecessor(u32),

    #[error("block at offset {0} falls off the end of the code")]
    FallsOffEnd(u32),

    #[error("merge placeholder {0} completed twice")]
    PlaceholderCompletedTwice(u32),

    #[error("merge placeholder {id} left unresolved with {received} of {expected} incoming values")]
    PlaceholderUnresolved { id: u32, received: usize, expected: usize },

    #[error("block at offset {block} reached with {found} incoming stacks, planned {expected}")]
    IncomingCountMismatch { block: u32, expected: usize, found: usize },

    #[error("malformed IR: {0}")]
    MalformedIr(String),
}

/// A recognized opcode that the requested mode cannot lower
///
/// Recoverable: the embedding layer runs the function on the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{opcode} at offset {offset} is not supported in {mode} mode")]
pub struct UnsupportedOpcode {
    pub opcode: Opcode,
    pub offset: u32,
    pub mode: Mode,
}

/// Why integer mode refused an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRejection {
    /// The opcode is not on the allow-list
    Opcode,
    /// The opcode is allowed, its operand is not (e.g. `BinaryOp` true division)
    Operand,
    /// The constant is not an integer or boolean
    Constant,
    /// The function has exception regions
    ExceptionRegions,
    /// The function is a generator or coroutine
    Suspendable,
}

impl std::fmt::Display for ModeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModeRejection::Opcode => write!(f, "opcode not allowed"),
            ModeRejection::Operand => write!(f, "operand not allowed"),
            ModeRejection::Constant => write!(f, "non-integer constant"),
            ModeRejection::ExceptionRegions => write!(f, "exception regions present"),
            ModeRejection::Suspendable => write!(f, "suspendable function"),
        }
    }
}

/// Integer mode refused the function
///
/// The engine recompiles in object mode when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("integer mode cannot compile {opcode} at offset {offset}: {reason}")]
pub struct ModeUnsupportedOpcode {
    pub opcode: Opcode,
    pub offset: u32,
    pub reason: ModeRejection,
}
