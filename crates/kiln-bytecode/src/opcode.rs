//! Wordcode opcodes
//!
//! Every instruction is one 16-bit code unit: an opcode byte followed by an
//! argument byte. Arguments wider than 8 bits are built from `ExtendedArg`
//! prefixes, each contributing the next higher byte.
//!
//! Relative jump arguments count code units from the instruction that follows
//! the jump. `JumpBackward` subtracts; every other jump adds.

use serde::{Deserialize, Serialize};

/// Wordcode opcode enumeration
///
/// Opcodes are organized into categories:
/// - 0x00-0x0F: Stack manipulation and prefixes
/// - 0x10-0x1F: Constants, locals, cells, globals and attributes
/// - 0x20-0x2F: Operators
/// - 0x30-0x3F: Containers, calls and iteration
/// - 0x40-0x4F: Control flow
/// - 0x50-0x5F: Exceptions and suspension
/// - 0x60-0x6F: Recognized opcodes outside the compiled subset
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Opcode {
    // ===== Stack Manipulation & Prefixes (0x00-0x0F) =====
    /// No operation
    Nop = 0x00,
    /// Pop and discard the top of stack
    PopTop = 0x01,
    /// Push a copy of the n-th stack item (arg: n >= 1, 1 is TOS)
    Copy = 0x02,
    /// Swap TOS with the n-th stack item (arg: n >= 2)
    Swap = 0x03,
    /// Function or resumption start marker (no stack effect)
    Resume = 0x04,
    /// Argument-extension prefix for the following instruction
    ExtendedArg = 0x05,

    // ===== Constants, Locals, Cells, Globals, Attributes (0x10-0x1F) =====
    /// Push constant `consts[arg]`
    LoadConst = 0x10,
    /// Push local `varnames[arg]`
    LoadFast = 0x11,
    /// Pop TOS into local `varnames[arg]`
    StoreFast = 0x12,
    /// Unbind local `varnames[arg]`
    DeleteFast = 0x13,
    /// Fused: push local `arg >> 4`, then push local `arg & 15`
    LoadFastLoadFast = 0x14,
    /// Fused: store TOS into local `arg >> 4`, then push local `arg & 15`
    StoreFastLoadFast = 0x15,
    /// Fused: store TOS into local `arg >> 4`, then store TOS into local `arg & 15`
    StoreFastStoreFast = 0x16,
    /// Push the content of cell slot `arg`
    LoadDeref = 0x17,
    /// Pop TOS into cell slot `arg`
    StoreDeref = 0x18,
    /// Replace the value in slot `arg` with a fresh cell holding it
    MakeCell = 0x19,
    /// Push global `names[arg]`
    LoadGlobal = 0x1A,
    /// Pop TOS into global `names[arg]`
    StoreGlobal = 0x1B,
    /// Replace TOS with `TOS.names[arg]`
    LoadAttr = 0x1C,
    /// `TOS.names[arg] = TOS1`, popping both
    StoreAttr = 0x1D,
    /// Pop `level` and `fromlist`, push the imported module `names[arg]`
    ImportName = 0x1E,
    /// Push `TOS.names[arg]`, keeping the module on the stack
    ImportFrom = 0x1F,

    // ===== Operators (0x20-0x2F) =====
    /// Binary operator on TOS1 and TOS (arg: [`NbOp`])
    BinaryOp = 0x20,
    /// Rich comparison of TOS1 and TOS (arg: [`CmpOp`])
    CompareOp = 0x21,
    /// Replace TOS with `-TOS`
    UnaryNegative = 0x22,
    /// Replace TOS with `not TOS`
    UnaryNot = 0x23,
    /// Replace TOS with `~TOS`
    UnaryInvert = 0x24,
    /// Replace TOS with its truth value
    ToBool = 0x25,
    /// Identity test `TOS1 is TOS` (arg 1 inverts)
    IsOp = 0x26,
    /// Containment test `TOS1 in TOS` (arg 1 inverts)
    ContainsOp = 0x27,
    /// Replace TOS1, TOS with `TOS1[TOS]`
    BinarySubscr = 0x28,
    /// `TOS1[TOS] = TOS2`, popping all three
    StoreSubscr = 0x29,

    // ===== Containers, Calls, Iteration (0x30-0x3F) =====
    /// Pop `arg` items and push them as a tuple
    BuildTuple = 0x30,
    /// Pop `arg` items and push them as a list
    BuildList = 0x31,
    /// Pop `arg` key/value pairs and push them as a map
    BuildMap = 0x32,
    /// Pop `arg` arguments and the callable beneath them, push the result
    Call = 0x33,
    /// Replace TOS with `iter(TOS)`
    GetIter = 0x34,
    /// Advance the iterator at TOS, pushing the item; on exhaustion jump
    /// forward by arg, leaving the iterator for `EndFor`
    ForIter = 0x35,
    /// Pop the exhausted iterator at the end of a `for` loop
    EndFor = 0x36,

    // ===== Control Flow (0x40-0x4F) =====
    /// Jump forward by arg code units
    JumpForward = 0x40,
    /// Jump backward by arg code units
    JumpBackward = 0x41,
    /// Pop TOS; jump forward by arg when it is false
    PopJumpIfFalse = 0x42,
    /// Pop TOS; jump forward by arg when it is true
    PopJumpIfTrue = 0x43,
    /// Pop TOS; jump forward by arg when it is None
    PopJumpIfNone = 0x44,
    /// Pop TOS; jump forward by arg when it is not None
    PopJumpIfNotNone = 0x45,
    /// Return TOS to the caller
    ReturnValue = 0x46,
    /// Return `consts[arg]` to the caller
    ReturnConst = 0x47,

    // ===== Exceptions & Suspension (0x50-0x5F) =====
    /// Raise (arg 0: re-raise active, 1: raise TOS, 2: raise TOS1 from TOS)
    RaiseVarargs = 0x50,
    /// Re-raise the exception at TOS (arg 1: also pop a saved offset)
    Reraise = 0x51,
    /// Pop the exception, push the previously handled exception and it again
    PushExcInfo = 0x52,
    /// Pop the saved previous exception and restore it
    PopExcept = 0x53,
    /// Test whether TOS1 matches the type at TOS, replacing TOS with the result
    CheckExcMatch = 0x54,
    /// Suspend, yielding TOS; on resumption TOS is the sent value
    YieldValue = 0x55,
    /// Replace TOS with its awaitable
    GetAwaitable = 0x56,
    /// Suspend until the awaitable at TOS completes, replacing it with its result
    Await = 0x57,

    // ===== Outside the compiled subset (0x60-0x6F) =====
    /// Legacy block-stack setup (jump forward by arg to the handler)
    SetupFinally = 0x60,
    /// Legacy block-stack pop
    PopBlock = 0x61,
    /// Legacy: jump forward keeping TOS when false, otherwise pop it
    JumpIfFalseOrPop = 0x62,
    /// Legacy: jump forward keeping TOS when true, otherwise pop it
    JumpIfTrueOrPop = 0x63,
    /// Create the module-level annotations dict
    SetupAnnotations = 0x64,
    /// `from TOS import *`
    ImportStar = 0x65,
    /// Push the class-building helper
    LoadBuildClass = 0x66,
    /// Replace TOS with its async iterator
    GetAIter = 0x67,
    /// Push the next awaitable of the async iterator at TOS
    GetANext = 0x68,
    /// Terminate an async for loop
    EndAsyncFor = 0x69,
    /// Wrap TOS for an async generator yield
    AsyncGenWrap = 0x6A,
    /// Enter an async context manager
    BeforeAsyncWith = 0x6B,
    /// Delegated send (jump forward by arg when the receiver returns)
    Send = 0x6C,
}

impl Opcode {
    /// Every opcode, in encoding order
    pub const ALL: &'static [Opcode] = &[
        Opcode::Nop,
        Opcode::PopTop,
        Opcode::Copy,
        Opcode::Swap,
        Opcode::Resume,
        Opcode::ExtendedArg,
        Opcode::LoadConst,
        Opcode::LoadFast,
        Opcode::StoreFast,
        Opcode::DeleteFast,
        Opcode::LoadFastLoadFast,
        Opcode::StoreFastLoadFast,
        Opcode::StoreFastStoreFast,
        Opcode::LoadDeref,
        Opcode::StoreDeref,
        Opcode::MakeCell,
        Opcode::LoadGlobal,
        Opcode::StoreGlobal,
        Opcode::LoadAttr,
        Opcode::StoreAttr,
        Opcode::ImportName,
        Opcode::ImportFrom,
        Opcode::BinaryOp,
        Opcode::CompareOp,
        Opcode::UnaryNegative,
        Opcode::UnaryNot,
        Opcode::UnaryInvert,
        Opcode::ToBool,
        Opcode::IsOp,
        Opcode::ContainsOp,
        Opcode::BinarySubscr,
        Opcode::StoreSubscr,
        Opcode::BuildTuple,
        Opcode::BuildList,
        Opcode::BuildMap,
        Opcode::Call,
        Opcode::GetIter,
        Opcode::ForIter,
        Opcode::EndFor,
        Opcode::JumpForward,
        Opcode::JumpBackward,
        Opcode::PopJumpIfFalse,
        Opcode::PopJumpIfTrue,
        Opcode::PopJumpIfNone,
        Opcode::PopJumpIfNotNone,
        Opcode::ReturnValue,
        Opcode::ReturnConst,
        Opcode::RaiseVarargs,
        Opcode::Reraise,
        Opcode::PushExcInfo,
        Opcode::PopExcept,
        Opcode::CheckExcMatch,
        Opcode::YieldValue,
        Opcode::GetAwaitable,
        Opcode::Await,
        Opcode::SetupFinally,
        Opcode::PopBlock,
        Opcode::JumpIfFalseOrPop,
        Opcode::JumpIfTrueOrPop,
        Opcode::SetupAnnotations,
        Opcode::ImportStar,
        Opcode::LoadBuildClass,
        Opcode::GetAIter,
        Opcode::GetANext,
        Opcode::EndAsyncFor,
        Opcode::AsyncGenWrap,
        Opcode::BeforeAsyncWith,
        Opcode::Send,
    ];

    /// Convert a byte to an opcode
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Opcode::Nop,
            0x01 => Opcode::PopTop,
            0x02 => Opcode::Copy,
            0x03 => Opcode::Swap,
            0x04 => Opcode::Resume,
            0x05 => Opcode::ExtendedArg,
            0x10 => Opcode::LoadConst,
            0x11 => Opcode::LoadFast,
            0x12 => Opcode::StoreFast,
            0x13 => Opcode::DeleteFast,
            0x14 => Opcode::LoadFastLoadFast,
            0x15 => Opcode::StoreFastLoadFast,
            0x16 => Opcode::StoreFastStoreFast,
            0x17 => Opcode::LoadDeref,
            0x18 => Opcode::StoreDeref,
            0x19 => Opcode::MakeCell,
            0x1A => Opcode::LoadGlobal,
            0x1B => Opcode::StoreGlobal,
            0x1C => Opcode::LoadAttr,
            0x1D => Opcode::StoreAttr,
            0x1E => Opcode::ImportName,
            0x1F => Opcode::ImportFrom,
            0x20 => Opcode::BinaryOp,
            0x21 => Opcode::CompareOp,
            0x22 => Opcode::UnaryNegative,
            0x23 => Opcode::UnaryNot,
            0x24 => Opcode::UnaryInvert,
            0x25 => Opcode::ToBool,
            0x26 => Opcode::IsOp,
            0x27 => Opcode::ContainsOp,
            0x28 => Opcode::BinarySubscr,
            0x29 => Opcode::StoreSubscr,
            0x30 => Opcode::BuildTuple,
            0x31 => Opcode::BuildList,
            0x32 => Opcode::BuildMap,
            0x33 => Opcode::Call,
            0x34 => Opcode::GetIter,
            0x35 => Opcode::ForIter,
            0x36 => Opcode::EndFor,
            0x40 => Opcode::JumpForward,
            0x41 => Opcode::JumpBackward,
            0x42 => Opcode::PopJumpIfFalse,
            0x43 => Opcode::PopJumpIfTrue,
            0x44 => Opcode::PopJumpIfNone,
            0x45 => Opcode::PopJumpIfNotNone,
            0x46 => Opcode::ReturnValue,
            0x47 => Opcode::ReturnConst,
            0x50 => Opcode::RaiseVarargs,
            0x51 => Opcode::Reraise,
            0x52 => Opcode::PushExcInfo,
            0x53 => Opcode::PopExcept,
            0x54 => Opcode::CheckExcMatch,
            0x55 => Opcode::YieldValue,
            0x56 => Opcode::GetAwaitable,
            0x57 => Opcode::Await,
            0x60 => Opcode::SetupFinally,
            0x61 => Opcode::PopBlock,
            0x62 => Opcode::JumpIfFalseOrPop,
            0x63 => Opcode::JumpIfTrueOrPop,
            0x64 => Opcode::SetupAnnotations,
            0x65 => Opcode::ImportStar,
            0x66 => Opcode::LoadBuildClass,
            0x67 => Opcode::GetAIter,
            0x68 => Opcode::GetANext,
            0x69 => Opcode::EndAsyncFor,
            0x6A => Opcode::AsyncGenWrap,
            0x6B => Opcode::BeforeAsyncWith,
            0x6C => Opcode::Send,
            _ => return None,
        })
    }

    /// Convert opcode to byte
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get the opcode name as it appears in disassembly
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::PopTop => "POP_TOP",
            Opcode::Copy => "COPY",
            Opcode::Swap => "SWAP",
            Opcode::Resume => "RESUME",
            Opcode::ExtendedArg => "EXTENDED_ARG",
            Opcode::LoadConst => "LOAD_CONST",
            Opcode::LoadFast => "LOAD_FAST",
            Opcode::StoreFast => "STORE_FAST",
            Opcode::DeleteFast => "DELETE_FAST",
            Opcode::LoadFastLoadFast => "LOAD_FAST_LOAD_FAST",
            Opcode::StoreFastLoadFast => "STORE_FAST_LOAD_FAST",
            Opcode::StoreFastStoreFast => "STORE_FAST_STORE_FAST",
            Opcode::LoadDeref => "LOAD_DEREF",
            Opcode::StoreDeref => "STORE_DEREF",
            Opcode::MakeCell => "MAKE_CELL",
            Opcode::LoadGlobal => "LOAD_GLOBAL",
            Opcode::StoreGlobal => "STORE_GLOBAL",
            Opcode::LoadAttr => "LOAD_ATTR",
            Opcode::StoreAttr => "STORE_ATTR",
            Opcode::ImportName => "IMPORT_NAME",
            Opcode::ImportFrom => "IMPORT_FROM",
            Opcode::BinaryOp => "BINARY_OP",
            Opcode::CompareOp => "COMPARE_OP",
            Opcode::UnaryNegative => "UNARY_NEGATIVE",
            Opcode::UnaryNot => "UNARY_NOT",
            Opcode::UnaryInvert => "UNARY_INVERT",
            Opcode::ToBool => "TO_BOOL",
            Opcode::IsOp => "IS_OP",
            Opcode::ContainsOp => "CONTAINS_OP",
            Opcode::BinarySubscr => "BINARY_SUBSCR",
            Opcode::StoreSubscr => "STORE_SUBSCR",
            Opcode::BuildTuple => "BUILD_TUPLE",
            Opcode::BuildList => "BUILD_LIST",
            Opcode::BuildMap => "BUILD_MAP",
            Opcode::Call => "CALL",
            Opcode::GetIter => "GET_ITER",
            Opcode::ForIter => "FOR_ITER",
            Opcode::EndFor => "END_FOR",
            Opcode::JumpForward => "JUMP_FORWARD",
            Opcode::JumpBackward => "JUMP_BACKWARD",
            Opcode::PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            Opcode::PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            Opcode::PopJumpIfNone => "POP_JUMP_IF_NONE",
            Opcode::PopJumpIfNotNone => "POP_JUMP_IF_NOT_NONE",
            Opcode::ReturnValue => "RETURN_VALUE",
            Opcode::ReturnConst => "RETURN_CONST",
            Opcode::RaiseVarargs => "RAISE_VARARGS",
            Opcode::Reraise => "RERAISE",
            Opcode::PushExcInfo => "PUSH_EXC_INFO",
            Opcode::PopExcept => "POP_EXCEPT",
            Opcode::CheckExcMatch => "CHECK_EXC_MATCH",
            Opcode::YieldValue => "YIELD_VALUE",
            Opcode::GetAwaitable => "GET_AWAITABLE",
            Opcode::Await => "AWAIT",
            Opcode::SetupFinally => "SETUP_FINALLY",
            Opcode::PopBlock => "POP_BLOCK",
            Opcode::JumpIfFalseOrPop => "JUMP_IF_FALSE_OR_POP",
            Opcode::JumpIfTrueOrPop => "JUMP_IF_TRUE_OR_POP",
            Opcode::SetupAnnotations => "SETUP_ANNOTATIONS",
            Opcode::ImportStar => "IMPORT_STAR",
            Opcode::LoadBuildClass => "LOAD_BUILD_CLASS",
            Opcode::GetAIter => "GET_AITER",
            Opcode::GetANext => "GET_ANEXT",
            Opcode::EndAsyncFor => "END_ASYNC_FOR",
            Opcode::AsyncGenWrap => "ASYNC_GEN_WRAP",
            Opcode::BeforeAsyncWith => "BEFORE_ASYNC_WITH",
            Opcode::Send => "SEND",
        }
    }

    /// Whether the argument byte is meaningful for this opcode
    pub fn has_arg(self) -> bool {
        !matches!(
            self,
            Opcode::Nop
                | Opcode::PopTop
                | Opcode::UnaryNegative
                | Opcode::UnaryNot
                | Opcode::UnaryInvert
                | Opcode::ToBool
                | Opcode::BinarySubscr
                | Opcode::StoreSubscr
                | Opcode::GetIter
                | Opcode::EndFor
                | Opcode::ReturnValue
                | Opcode::PushExcInfo
                | Opcode::PopExcept
                | Opcode::CheckExcMatch
                | Opcode::PopBlock
                | Opcode::SetupAnnotations
                | Opcode::ImportStar
                | Opcode::LoadBuildClass
                | Opcode::GetAIter
                | Opcode::GetANext
                | Opcode::EndAsyncFor
                | Opcode::AsyncGenWrap
                | Opcode::BeforeAsyncWith
        )
    }

    /// Whether the argument is a relative jump distance
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::JumpForward
                | Opcode::JumpBackward
                | Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfTrue
                | Opcode::PopJumpIfNone
                | Opcode::PopJumpIfNotNone
                | Opcode::ForIter
                | Opcode::SetupFinally
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfTrueOrPop
                | Opcode::Send
        )
    }

    /// Whether the jump distance is subtracted rather than added
    pub fn is_backward_jump(self) -> bool {
        matches!(self, Opcode::JumpBackward)
    }

    /// Whether this is a jump that never falls through
    pub fn is_unconditional_jump(self) -> bool {
        matches!(self, Opcode::JumpForward | Opcode::JumpBackward)
    }

    /// Whether this is a two-way branch
    pub fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfTrue
                | Opcode::PopJumpIfNone
                | Opcode::PopJumpIfNotNone
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfTrueOrPop
                | Opcode::Send
        )
    }

    /// Whether this returns from the function
    pub fn is_return(self) -> bool {
        matches!(self, Opcode::ReturnValue | Opcode::ReturnConst)
    }

    /// Whether this unconditionally raises
    pub fn is_raise(self) -> bool {
        matches!(self, Opcode::RaiseVarargs | Opcode::Reraise)
    }

    /// Whether this instruction has no successors
    pub fn is_terminator(self) -> bool {
        self.is_return() || self.is_raise()
    }

    /// Whether execution may pause here and later resume
    pub fn is_suspension(self) -> bool {
        matches!(self, Opcode::YieldValue | Opcode::Await)
    }

    /// Whether this opcode fuses two local-variable operations
    pub fn is_super_instruction(self) -> bool {
        matches!(
            self,
            Opcode::LoadFastLoadFast | Opcode::StoreFastLoadFast | Opcode::StoreFastStoreFast
        )
    }

    /// Whether this opcode is recognized but never lowered by the compiler
    ///
    /// Functions containing one of these run on the interpreter instead.
    pub fn is_outside_compiled_subset(self) -> bool {
        (self as u8) >= 0x60
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Binary operator selector carried by `BinaryOp`
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NbOp {
    /// `+`
    Add = 0,
    /// `&`
    And = 1,
    /// `//`
    FloorDivide = 2,
    /// `<<`
    Lshift = 3,
    /// `@`
    MatrixMultiply = 4,
    /// `*`
    Multiply = 5,
    /// `%`
    Remainder = 6,
    /// `|`
    Or = 7,
    /// `**`
    Power = 8,
    /// `>>`
    Rshift = 9,
    /// `-`
    Subtract = 10,
    /// `/`
    TrueDivide = 11,
    /// `^`
    Xor = 12,
    /// `+=`
    InplaceAdd = 13,
    /// `&=`
    InplaceAnd = 14,
    /// `//=`
    InplaceFloorDivide = 15,
    /// `<<=`
    InplaceLshift = 16,
    /// `@=`
    InplaceMatrixMultiply = 17,
    /// `*=`
    InplaceMultiply = 18,
    /// `%=`
    InplaceRemainder = 19,
    /// `|=`
    InplaceOr = 20,
    /// `**=`
    InplacePower = 21,
    /// `>>=`
    InplaceRshift = 22,
    /// `-=`
    InplaceSubtract = 23,
    /// `/=`
    InplaceTrueDivide = 24,
    /// `^=`
    InplaceXor = 25,
}

impl NbOp {
    /// Decode the `BinaryOp` argument
    pub fn from_arg(arg: u32) -> Option<Self> {
        Some(match arg {
            0 => NbOp::Add,
            1 => NbOp::And,
            2 => NbOp::FloorDivide,
            3 => NbOp::Lshift,
            4 => NbOp::MatrixMultiply,
            5 => NbOp::Multiply,
            6 => NbOp::Remainder,
            7 => NbOp::Or,
            8 => NbOp::Power,
            9 => NbOp::Rshift,
            10 => NbOp::Subtract,
            11 => NbOp::TrueDivide,
            12 => NbOp::Xor,
            13 => NbOp::InplaceAdd,
            14 => NbOp::InplaceAnd,
            15 => NbOp::InplaceFloorDivide,
            16 => NbOp::InplaceLshift,
            17 => NbOp::InplaceMatrixMultiply,
            18 => NbOp::InplaceMultiply,
            19 => NbOp::InplaceRemainder,
            20 => NbOp::InplaceOr,
            21 => NbOp::InplacePower,
            22 => NbOp::InplaceRshift,
            23 => NbOp::InplaceSubtract,
            24 => NbOp::InplaceTrueDivide,
            25 => NbOp::InplaceXor,
            _ => return None,
        })
    }

    /// The non-inplace operator this one behaves like
    pub fn base(self) -> NbOp {
        let raw = self as u8;
        if raw >= NbOp::InplaceAdd as u8 {
            // The two halves of the table share their ordering.
            NbOp::from_arg((raw - NbOp::InplaceAdd as u8) as u32).unwrap_or(self)
        } else {
            self
        }
    }

    /// Whether this is the augmented-assignment form
    pub fn is_inplace(self) -> bool {
        (self as u8) >= NbOp::InplaceAdd as u8
    }

    /// Operator symbol for disassembly
    pub fn symbol(self) -> &'static str {
        match self {
            NbOp::Add => "+",
            NbOp::And => "&",
            NbOp::FloorDivide => "//",
            NbOp::Lshift => "<<",
            NbOp::MatrixMultiply => "@",
            NbOp::Multiply => "*",
            NbOp::Remainder => "%",
            NbOp::Or => "|",
            NbOp::Power => "**",
            NbOp::Rshift => ">>",
            NbOp::Subtract => "-",
            NbOp::TrueDivide => "/",
            NbOp::Xor => "^",
            NbOp::InplaceAdd => "+=",
            NbOp::InplaceAnd => "&=",
            NbOp::InplaceFloorDivide => "//=",
            NbOp::InplaceLshift => "<<=",
            NbOp::InplaceMatrixMultiply => "@=",
            NbOp::InplaceMultiply => "*=",
            NbOp::InplaceRemainder => "%=",
            NbOp::InplaceOr => "|=",
            NbOp::InplacePower => "**=",
            NbOp::InplaceRshift => ">>=",
            NbOp::InplaceSubtract => "-=",
            NbOp::InplaceTrueDivide => "/=",
            NbOp::InplaceXor => "^=",
        }
    }
}

/// Comparison selector carried by `CompareOp`
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    /// `<`
    Lt = 0,
    /// `<=`
    Le = 1,
    /// `==`
    Eq = 2,
    /// `!=`
    Ne = 3,
    /// `>`
    Gt = 4,
    /// `>=`
    Ge = 5,
}

impl CmpOp {
    /// Decode the `CompareOp` argument
    pub fn from_arg(arg: u32) -> Option<Self> {
        Some(match arg {
            0 => CmpOp::Lt,
            1 => CmpOp::Le,
            2 => CmpOp::Eq,
            3 => CmpOp::Ne,
            4 => CmpOp::Gt,
            5 => CmpOp::Ge,
            _ => return None,
        })
    }

    /// Operator symbol for disassembly
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for &op in Opcode::ALL {
            assert_eq!(Opcode::from_u8(op.to_u8()), Some(op), "{}", op);
        }
    }

    #[test]
    fn test_all_is_complete() {
        let decodable = (0u8..=255).filter_map(Opcode::from_u8).count();
        assert_eq!(decodable, Opcode::ALL.len());
    }

    #[test]
    fn test_invalid_opcode() {
        assert_eq!(Opcode::from_u8(0x0F), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn test_classification() {
        assert!(Opcode::JumpBackward.is_jump());
        assert!(Opcode::JumpBackward.is_backward_jump());
        assert!(Opcode::PopJumpIfFalse.is_conditional_jump());
        assert!(!Opcode::ForIter.is_conditional_jump());
        assert!(Opcode::ReturnValue.is_terminator());
        assert!(Opcode::Reraise.is_terminator());
        assert!(Opcode::YieldValue.is_suspension());
        assert!(Opcode::LoadFastLoadFast.is_super_instruction());
        assert!(Opcode::SetupFinally.is_outside_compiled_subset());
        assert!(!Opcode::Await.is_outside_compiled_subset());
    }

    #[test]
    fn test_nb_op_base() {
        assert_eq!(NbOp::InplaceAdd.base(), NbOp::Add);
        assert_eq!(NbOp::InplaceXor.base(), NbOp::Xor);
        assert_eq!(NbOp::Subtract.base(), NbOp::Subtract);
        assert!(NbOp::InplaceFloorDivide.is_inplace());
        assert_eq!(NbOp::from_arg(26), None);
    }

    #[test]
    fn test_cmp_op_symbols() {
        assert_eq!(CmpOp::from_arg(0).map(CmpOp::symbol), Some("<"));
        assert_eq!(CmpOp::from_arg(6), None);
    }
}
