//! Code generation backends
//!
//! The pipeline hands a verified [`CompiledArtifact`](crate::pipeline::CompiledArtifact)
//! to a [`CodegenBackend`]. The portable [`interp`] backend executes IR
//! directly and is always available; the Cranelift backend lives behind the
//! `native` feature and compiles integer-mode functions to machine code.

pub mod interp;
pub mod stub;
pub mod traits;

#[cfg(feature = "native")]
pub mod cranelift;

pub use interp::InterpBackend;
pub use stub::StubBackend;
pub use traits::{
    host_relocations, CodegenBackend, CodegenError, CompiledCode, Relocation, TargetArch,
    TargetInfo,
};
