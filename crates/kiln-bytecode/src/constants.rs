//! Constant pool entries

use serde::{Deserialize, Serialize};

/// A constant addressed by `LoadConst` / `ReturnConst`
///
/// The compiler treats constants as opaque except in integer mode, which only
/// accepts `Int` and `Bool`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Constant {
    /// The `None` singleton
    None,
    /// Boolean literal
    Bool(bool),
    /// Integer literal (machine-width)
    Int(i64),
    /// Floating-point literal
    Float(f64),
    /// String literal
    Str(String),
    /// Tuple of constants
    Tuple(Vec<Constant>),
}

impl Constant {
    /// The value as an unboxed integer, if it has one
    ///
    /// Booleans map to 0 and 1.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Constant::Int(v) => Some(*v),
            Constant::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Short type name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Constant::None => "none",
            Constant::Bool(_) => "bool",
            Constant::Int(_) => "int",
            Constant::Float(_) => "float",
            Constant::Str(_) => "str",
            Constant::Tuple(_) => "tuple",
        }
    }
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::None => write!(f, "None"),
            Constant::Bool(true) => write!(f, "True"),
            Constant::Bool(false) => write!(f, "False"),
            Constant::Int(v) => write!(f, "{}", v),
            Constant::Float(v) => write!(f, "{:?}", v),
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
        }
    }
}
