//! Kiln bytecode definitions
//!
//! This crate provides the wordcode instruction set, the code-object
//! container, the exception-table encoding and a label-based assembler
//! used to produce wordcode for the Kiln compiler.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod opcode;
pub mod code;
pub mod constants;
pub mod exception_table;
pub mod encoder;

pub use opcode::{CmpOp, NbOp, Opcode};
pub use code::{CodeError, CodeFlags, CodeObject};
pub use constants::Constant;
pub use exception_table::{ExceptionTableEntry, ExceptionTableError};
pub use encoder::{AssembleError, Assembled, Assembler, Label};
