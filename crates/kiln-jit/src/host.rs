//! Host-runtime foreign calls and their reference-count contracts
//!
//! Object-mode code never manipulates host objects directly. Every object
//! operation is a [`HostFn`] called through `Op::CallHost`, and each entry
//! documents what it does with its arguments and what it returns:
//!
//! - arguments are borrowed unless the contract says they are stolen; a
//!   stolen reference belongs to the callee whether or not the call fails
//! - a `New` result is a fresh reference the caller must release
//! - a failing call sets the host's active exception and yields no result

use kiln_bytecode::{CmpOp, NbOp};

use crate::ir::IrType;

/// Unary operator selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Negative,
    Invert,
    Not,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Negative => "-",
            UnaryOp::Invert => "~",
            UnaryOp::Not => "not",
        }
    }
}

/// A foreign call into the host object model
///
/// Name operands index the code object's `names` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostFn {
    // ===== Attributes & Subscripts =====
    /// `(obj) -> obj.name`
    GetAttr { name: u32 },
    /// `(obj, value)`: `obj.name = value`
    SetAttr { name: u32 },
    /// `(container, key) -> container[key]`
    GetItem,
    /// `(container, key, value)`: `container[key] = value`
    SetItem,

    // ===== Calls & Imports =====
    /// `(callable, args...) -> result`
    Call { argc: u32 },
    /// `(level, fromlist) -> module`
    ImportName { name: u32 },
    /// `(module) -> module.name`
    ImportFrom { name: u32 },

    // ===== Globals =====
    LoadGlobal { name: u32 },
    /// `(value)`
    StoreGlobal { name: u32 },

    // ===== Containers =====
    /// `(items...) -> tuple`, stealing every item
    BuildTuple { count: u32 },
    /// `(items...) -> list`, stealing every item
    BuildList { count: u32 },
    /// `(k0, v0, k1, v1, ...) -> dict`
    BuildMap { count: u32 },

    // ===== Iteration =====
    GetIter,
    /// `(iter) -> item`, or null without an error when exhausted
    IterNext,

    // ===== Operators =====
    Binary(NbOp),
    Compare(CmpOp),
    Unary(UnaryOp),
    /// `(value) -> bool` truthiness
    IsTrue,
    /// `(a, b) -> bool` identity
    Is,
    /// `(value) -> bool` identity with the `None` singleton
    IsNone,
    /// `(item, container) -> bool`
    Contains,

    // ===== Boxing =====
    /// `(flag: bool) -> True | False`
    BoxBool,
    /// `(value: i64) -> int`
    BoxInt,

    // ===== Cells =====
    /// `(value or null) -> cell`
    MakeCell,
    /// `(cell) -> content`
    CellGet,
    /// `(cell, value)`
    CellSet,

    // ===== Exceptions =====
    /// `(exc, type) -> bool`
    ExceptionMatch,
    /// `(exc)`: always fails with `exc` active
    Raise,
    /// `(exc, cause)`: always fails
    RaiseFrom,
    /// `()`: re-raise the exception being handled; always fails
    ReraiseActive,
    /// `(exc)`: re-raise a caught exception; always fails
    Reraise,
    /// `(exc) -> previous`: make `exc` the handled exception
    PushExcInfo,
    /// `(previous)`: restore the handled exception, stealing `previous`
    PopExcInfo,

    // ===== Suspension =====
    /// `(value) -> awaitable`
    GetAwaitable,
    /// `()`: resuming a finished or corrupt frame; always fails
    FrameExhausted,
}

/// What a call does with its arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Steals {
    Nothing,
    All,
    Arg(usize),
}

/// What a call returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultRef {
    /// A new object reference
    New,
    /// A new object reference, or null as a normal outcome
    NewOrNull,
    /// An unboxed boolean, nothing to release
    Flag,
    /// No value
    Nothing,
}

/// Whether a call can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Never,
    May,
    Always,
}

/// The reference-count contract of one host function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefContract {
    pub steals: Steals,
    pub result: ResultRef,
    pub failure: Failure,
    /// Hands control to uncompiled code, which may block or re-enter
    pub enters_interpreter: bool,
}

impl RefContract {
    const fn new(result: ResultRef, failure: Failure) -> Self {
        RefContract { steals: Steals::Nothing, result, failure, enters_interpreter: false }
    }

    const fn stealing(self, steals: Steals) -> Self {
        RefContract { steals, ..self }
    }

    const fn entering(self) -> Self {
        RefContract { enters_interpreter: true, ..self }
    }

    /// Whether argument `index` is stolen
    pub fn steals_arg(&self, index: usize) -> bool {
        match self.steals {
            Steals::Nothing => false,
            Steals::All => true,
            Steals::Arg(i) => i == index,
        }
    }
}

impl HostFn {
    /// The reference-count contract
    pub fn contract(&self) -> RefContract {
        use Failure::*;
        use ResultRef::*;
        let c = RefContract::new;
        match self {
            HostFn::GetAttr { .. } | HostFn::GetItem => c(New, May),
            HostFn::SetAttr { .. } | HostFn::SetItem => c(Nothing, May),
            HostFn::Call { .. } => c(New, May).entering(),
            HostFn::ImportName { .. } => c(New, May).entering(),
            HostFn::ImportFrom { .. } => c(New, May),
            HostFn::LoadGlobal { .. } => c(New, May),
            HostFn::StoreGlobal { .. } => c(Nothing, May),
            HostFn::BuildTuple { .. } | HostFn::BuildList { .. } => {
                c(New, May).stealing(Steals::All)
            }
            HostFn::BuildMap { .. } => c(New, May),
            HostFn::GetIter => c(New, May),
            HostFn::IterNext => c(NewOrNull, May),
            HostFn::Binary(_) | HostFn::Compare(_) | HostFn::Unary(_) => c(New, May),
            HostFn::IsTrue | HostFn::Contains => c(Flag, May),
            HostFn::Is | HostFn::IsNone => c(Flag, Never),
            HostFn::BoxBool | HostFn::BoxInt => c(New, Never),
            HostFn::MakeCell => c(New, Never),
            HostFn::CellGet => c(New, May),
            HostFn::CellSet => c(Nothing, Never),
            HostFn::ExceptionMatch => c(Flag, May),
            HostFn::Raise | HostFn::RaiseFrom | HostFn::ReraiseActive | HostFn::Reraise => {
                c(Nothing, Always)
            }
            HostFn::PushExcInfo => c(New, Never),
            HostFn::PopExcInfo => c(Nothing, Never).stealing(Steals::Arg(0)),
            HostFn::GetAwaitable => c(New, May),
            HostFn::FrameExhausted => c(Nothing, Always),
        }
    }

    /// Number of arguments the call takes
    pub fn arity(&self) -> usize {
        match self {
            HostFn::LoadGlobal { .. } | HostFn::ReraiseActive | HostFn::FrameExhausted => 0,
            HostFn::GetAttr { .. }
            | HostFn::ImportFrom { .. }
            | HostFn::StoreGlobal { .. }
            | HostFn::GetIter
            | HostFn::IterNext
            | HostFn::Unary(_)
            | HostFn::IsTrue
            | HostFn::IsNone
            | HostFn::BoxBool
            | HostFn::BoxInt
            | HostFn::MakeCell
            | HostFn::CellGet
            | HostFn::Raise
            | HostFn::Reraise
            | HostFn::PushExcInfo
            | HostFn::PopExcInfo
            | HostFn::GetAwaitable => 1,
            HostFn::SetAttr { .. }
            | HostFn::GetItem
            | HostFn::ImportName { .. }
            | HostFn::Binary(_)
            | HostFn::Compare(_)
            | HostFn::Is
            | HostFn::Contains
            | HostFn::CellSet
            | HostFn::ExceptionMatch
            | HostFn::RaiseFrom => 2,
            HostFn::SetItem => 3,
            HostFn::Call { argc } => *argc as usize + 1,
            HostFn::BuildTuple { count } | HostFn::BuildList { count } => *count as usize,
            HostFn::BuildMap { count } => *count as usize * 2,
        }
    }

    /// Expected type of argument `index`
    pub fn arg_type(&self, _index: usize) -> IrType {
        match self {
            HostFn::BoxBool => IrType::Bool,
            HostFn::BoxInt => IrType::I64,
            _ => IrType::Obj,
        }
    }

    /// Type of the result, if the call produces one
    pub fn result_type(&self) -> Option<IrType> {
        match self.contract().result {
            ResultRef::New | ResultRef::NewOrNull => Some(IrType::Obj),
            ResultRef::Flag => Some(IrType::Bool),
            ResultRef::Nothing => None,
        }
    }

    /// Whether the call can transfer to an unwind block
    pub fn can_fail(&self) -> bool {
        self.contract().failure != Failure::Never
    }

    /// Whether the call never returns normally
    pub fn always_fails(&self) -> bool {
        self.contract().failure == Failure::Always
    }

    /// Whether generated code should release the execution lock around the call
    pub fn enters_interpreter(&self) -> bool {
        self.contract().enters_interpreter
    }
}

impl std::fmt::Display for HostFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostFn::GetAttr { name } => write!(f, "getattr #{}", name),
            HostFn::SetAttr { name } => write!(f, "setattr #{}", name),
            HostFn::GetItem => write!(f, "getitem"),
            HostFn::SetItem => write!(f, "setitem"),
            HostFn::Call { argc } => write!(f, "call/{}", argc),
            HostFn::ImportName { name } => write!(f, "import #{}", name),
            HostFn::ImportFrom { name } => write!(f, "import.from #{}", name),
            HostFn::LoadGlobal { name } => write!(f, "global.load #{}", name),
            HostFn::StoreGlobal { name } => write!(f, "global.store #{}", name),
            HostFn::BuildTuple { count } => write!(f, "build.tuple/{}", count),
            HostFn::BuildList { count } => write!(f, "build.list/{}", count),
            HostFn::BuildMap { count } => write!(f, "build.map/{}", count),
            HostFn::GetIter => write!(f, "iter"),
            HostFn::IterNext => write!(f, "iter.next"),
            HostFn::Binary(op) => write!(f, "binary {}", op.symbol()),
            HostFn::Compare(op) => write!(f, "compare {}", op.symbol()),
            HostFn::Unary(op) => write!(f, "unary {}", op.symbol()),
            HostFn::IsTrue => write!(f, "truth"),
            HostFn::Is => write!(f, "is"),
            HostFn::IsNone => write!(f, "is.none"),
            HostFn::Contains => write!(f, "contains"),
            HostFn::BoxBool => write!(f, "box.bool"),
            HostFn::BoxInt => write!(f, "box.int"),
            HostFn::MakeCell => write!(f, "cell.new"),
            HostFn::CellGet => write!(f, "cell.get"),
            HostFn::CellSet => write!(f, "cell.set"),
            HostFn::ExceptionMatch => write!(f, "exc.match"),
            HostFn::Raise => write!(f, "raise"),
            HostFn::RaiseFrom => write!(f, "raise.from"),
            HostFn::ReraiseActive => write!(f, "reraise.active"),
            HostFn::Reraise => write!(f, "reraise"),
            HostFn::PushExcInfo => write!(f, "exc.push"),
            HostFn::PopExcInfo => write!(f, "exc.pop"),
            HostFn::GetAwaitable => write!(f, "awaitable"),
            HostFn::FrameExhausted => write!(f, "frame.exhausted"),
        }
    }
}
