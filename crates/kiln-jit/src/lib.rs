//! Stack-bytecode to SSA IR compiler
//!
//! This crate compiles Kiln wordcode functions into a typed SSA IR.
//! It includes:
//! - Bytecode analysis (decoding, CFG construction, depth propagation)
//! - Merge planning for the abstract operand stack
//! - Object-mode and integer-mode lowering with exception landing pads
//! - State-machine transformation for generators and coroutines
//! - Backend-agnostic optimization passes
//! - Backend trait with a portable executor and an optional Cranelift backend

pub mod analysis;
pub mod backend;
pub mod error;
pub mod host;
pub mod ir;
pub mod lower;
pub mod optimize;
pub mod pipeline;
pub mod ssa;
pub mod suspend;
pub mod validate;

mod config;
mod engine;

pub use config::JitConfig;
pub use engine::{CompiledFunction, JitEngine};
pub use error::{
    ModeRejection, ModeUnsupportedOpcode, StructuralVerificationError, UnsupportedOpcode,
};
pub use ir::{Function, Mode};
pub use pipeline::{
    compile, CompileError, CompileOptions, CompileStats, CompiledArtifact, JitPipeline,
};
