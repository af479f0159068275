//! Library side of the `kiln` binary
//!
//! Commands return their report as a string so they can be driven from tests
//! without capturing stdout.

pub mod commands;
pub mod config;

use std::path::Path;

use anyhow::Context;
use kiln_bytecode::CodeObject;

pub use config::{CliConfig, Overrides, CONFIG_FILE};

/// Read and validate a code object stored as JSON
pub fn load_code(path: &Path) -> anyhow::Result<CodeObject> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let code = CodeObject::from_json(&text)
        .with_context(|| format!("failed to load code object from {}", path.display()))?;
    tracing::debug!(name = %code.name, units = code.code_units(), "code object loaded");
    Ok(code)
}
