//! IR value types and compilation modes

use serde::{Deserialize, Serialize};

/// IR value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrType {
    /// Pointer to a host object (possibly null in slots)
    Obj,
    /// Unboxed machine integer
    I64,
    /// Branch condition
    Bool,
}

impl IrType {
    /// Whether values of this type carry a reference count
    pub fn is_refcounted(&self) -> bool {
        matches!(self, IrType::Obj)
    }
}

impl std::fmt::Display for IrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IrType::Obj => write!(f, "obj"),
            IrType::I64 => write!(f, "i64"),
            IrType::Bool => write!(f, "bool"),
        }
    }
}

/// Lowering strategy for a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Host-object semantics through foreign calls
    #[default]
    Object,
    /// Unboxed `i64` arithmetic only
    Integer,
}

impl Mode {
    /// Type of every operand-stack value in this mode
    pub fn stack_type(self) -> IrType {
        match self {
            Mode::Object => IrType::Obj,
            Mode::Integer => IrType::I64,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Object => write!(f, "object"),
            Mode::Integer => write!(f, "integer"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "object" => Ok(Mode::Object),
            "integer" | "int" => Ok(Mode::Integer),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}
