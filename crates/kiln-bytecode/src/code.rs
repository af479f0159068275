//! Code objects
//!
//! A [`CodeObject`] is the unit of compilation: one function's wordcode plus
//! the tables its operands index into.

use crate::constants::Constant;
use crate::exception_table::{self, ExceptionTableEntry, ExceptionTableError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Code object loading errors
#[derive(Debug, Error)]
pub enum CodeError {
    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Code length is not a whole number of code units
    #[error("code length {0} is not a multiple of 2")]
    OddLength(usize),

    /// Argument count exceeds the declared locals
    #[error("arg_count {arg_count} exceeds {locals} local names")]
    TooManyArguments {
        /// Declared argument count
        arg_count: u32,
        /// Number of local names
        locals: usize,
    },

    /// Malformed exception table
    #[error("exception table: {0}")]
    ExceptionTable(#[from] ExceptionTableError),
}

/// Code object flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeFlags(pub u32);

impl CodeFlags {
    /// Locals are addressed by index
    pub const OPTIMIZED: u32 = 0x0001;
    /// A fresh locals namespace is created per call
    pub const NEWLOCALS: u32 = 0x0002;
    /// The function is a generator
    pub const GENERATOR: u32 = 0x0020;
    /// The function is a coroutine
    pub const COROUTINE: u32 = 0x0100;
    /// The function is an async generator
    pub const ASYNC_GENERATOR: u32 = 0x0200;

    /// Whether any bit of `mask` is set
    pub fn contains(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    /// Return a copy with `mask` set
    pub fn with(self, mask: u32) -> Self {
        CodeFlags(self.0 | mask)
    }
}

/// One function's wordcode and tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeObject {
    /// Function name
    pub name: String,
    /// Positional parameter count (the first `arg_count` varnames)
    #[serde(default)]
    pub arg_count: u32,
    /// Code flags
    #[serde(default)]
    pub flags: CodeFlags,
    /// Wordcode bytes
    pub code: Vec<u8>,
    /// Constant pool
    #[serde(default)]
    pub constants: Vec<Constant>,
    /// Global and attribute names
    #[serde(default)]
    pub names: Vec<String>,
    /// Local variable names (parameters first)
    #[serde(default)]
    pub varnames: Vec<String>,
    /// Locals captured by inner functions
    #[serde(default)]
    pub cellvars: Vec<String>,
    /// Variables captured from enclosing functions
    #[serde(default)]
    pub freevars: Vec<String>,
    /// Encoded exception table
    #[serde(default)]
    pub exception_table: Vec<u8>,
}

impl CodeObject {
    /// Create an empty code object with the given name
    pub fn new(name: impl Into<String>) -> Self {
        CodeObject {
            name: name.into(),
            arg_count: 0,
            flags: CodeFlags(CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS),
            code: Vec::new(),
            constants: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            exception_table: Vec::new(),
        }
    }

    /// Number of 16-bit code units
    pub fn code_units(&self) -> usize {
        self.code.len() / 2
    }

    /// Total addressable local slots: varnames, then cells, then free variables
    pub fn slot_count(&self) -> usize {
        self.varnames.len() + self.cellvars.len() + self.freevars.len()
    }

    /// Name of slot `index` across varnames, cellvars and freevars
    pub fn slot_name(&self, index: usize) -> Option<&str> {
        self.varnames
            .iter()
            .chain(self.cellvars.iter())
            .chain(self.freevars.iter())
            .nth(index)
            .map(String::as_str)
    }

    /// Whether calls produce a suspendable frame instead of running to completion
    pub fn is_suspendable(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR | CodeFlags::COROUTINE)
    }

    /// Decode the exception table
    pub fn exception_entries(&self) -> Result<Vec<ExceptionTableEntry>, ExceptionTableError> {
        exception_table::decode(&self.exception_table)
    }

    /// Check the container-level invariants
    pub fn validate(&self) -> Result<(), CodeError> {
        if self.code.len() % 2 != 0 {
            return Err(CodeError::OddLength(self.code.len()));
        }
        if self.arg_count as usize > self.varnames.len() {
            return Err(CodeError::TooManyArguments {
                arg_count: self.arg_count,
                locals: self.varnames.len(),
            });
        }
        self.exception_entries()?;
        Ok(())
    }

    /// Parse a code object from JSON and validate it
    pub fn from_json(text: &str) -> Result<Self, CodeError> {
        let code: CodeObject = serde_json::from_str(text)?;
        code.validate()?;
        Ok(code)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json(&self) -> Result<String, CodeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
