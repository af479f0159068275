//! Backend-agnostic code generation traits
//!
//! Defines the `CodegenBackend` trait that pluggable backends implement,
//! along with the types describing their output.

use crate::host::HostFn;
use crate::ir::Mode;
use crate::pipeline::CompiledArtifact;

/// Target architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    AArch64,
    /// Executes IR directly, no machine code
    Portable,
}

/// Target information
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub arch: TargetArch,
    pub pointer_size: usize,
}

impl TargetInfo {
    /// Target information of the machine running the compiler
    pub fn host() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            TargetInfo { arch: TargetArch::X86_64, pointer_size: 8 }
        }

        #[cfg(target_arch = "aarch64")]
        {
            TargetInfo { arch: TargetArch::AArch64, pointer_size: 8 }
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            TargetInfo { arch: TargetArch::Portable, pointer_size: std::mem::size_of::<usize>() }
        }
    }
}

/// Error during code generation
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("Backend error: {0}")]
    BackendError(String),
    #[error("Unsupported instruction: {0}")]
    UnsupportedInstruction(String),
    #[error("Backend '{backend}' cannot compile {mode} mode functions")]
    UnsupportedMode { backend: String, mode: Mode },
}

/// A call site that must be bound to a host-runtime entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Offset in the generated code where the relocation applies
    pub code_offset: usize,
    /// The host function called there
    pub target: HostFn,
}

/// Output of a backend
#[derive(Debug)]
pub struct CompiledCode {
    /// Machine code, or an encoded listing for portable backends
    pub code: Vec<u8>,
    /// Offset of the function entry point within code
    pub entry_offset: usize,
    /// Host calls to bind before the code can run
    pub relocations: Vec<Relocation>,
}

/// Collect one relocation per host call site, in block order
pub fn host_relocations(artifact: &CompiledArtifact) -> Vec<Relocation> {
    artifact
        .function
        .blocks
        .iter()
        .flat_map(|b| b.ops.iter())
        .filter_map(|op| match op {
            crate::ir::Op::CallHost { func, .. } => Some(*func),
            _ => None,
        })
        .enumerate()
        .map(|(i, target)| Relocation { code_offset: i, target })
        .collect()
}

/// The backend-agnostic code generation trait
///
/// The compilation pipeline is:
///   CompiledArtifact → compile_function() → CompiledCode
pub trait CodegenBackend: Send + Sync {
    /// Backend name (for diagnostics)
    fn name(&self) -> &str;

    /// Whether this backend can compile functions lowered in `mode`
    fn supports_mode(&self, _mode: Mode) -> bool {
        true
    }

    /// Compile a verified IR function
    fn compile_function(&self, artifact: &CompiledArtifact) -> Result<CompiledCode, CodegenError>;

    /// Return target architecture information
    fn target_info(&self) -> TargetInfo;
}
