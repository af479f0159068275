//! Cranelift code generation backend
//!
//! Compiles integer-mode functions to native code for the host. Object-mode
//! functions need a host runtime to call into and are left to the portable
//! backend.

pub mod abi;
pub mod lowering;

use std::sync::Arc;

use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use target_lexicon::Architecture;

use self::abi::{entry_signature, EntryFn, NativeFailure, STATUS_OK};
use self::lowering::LoweringContext;
use super::traits::*;
use crate::ir::Mode;
use crate::pipeline::CompiledArtifact;

/// Cranelift-based code generation backend
pub struct CraneliftBackend {
    /// The target ISA (instruction set architecture)
    isa: Arc<dyn TargetIsa>,
}

impl CraneliftBackend {
    /// Create a backend targeting the host machine
    pub fn host() -> Result<Self, CodegenError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| CodegenError::BackendError(format!("Failed to set opt_level: {}", e)))?;
        // JIT memory may land anywhere in the address space
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| CodegenError::BackendError(format!("Failed to set is_pic: {}", e)))?;

        let flags = settings::Flags::new(flag_builder);

        let isa = cranelift_native::builder()
            .map_err(|e| {
                CodegenError::BackendError(format!("Failed to create native ISA builder: {}", e))
            })?
            .finish(flags)
            .map_err(|e| CodegenError::BackendError(format!("Failed to finish ISA: {}", e)))?;

        Ok(CraneliftBackend { isa })
    }

    /// Create a backend with a specific ISA
    pub fn with_isa(isa: Arc<dyn TargetIsa>) -> Self {
        CraneliftBackend { isa }
    }

    fn check_mode(&self, artifact: &CompiledArtifact) -> Result<(), CodegenError> {
        if self.supports_mode(artifact.mode) {
            Ok(())
        } else {
            Err(CodegenError::UnsupportedMode {
                backend: self.name().to_string(),
                mode: artifact.mode,
            })
        }
    }

    fn build(&self, artifact: &CompiledArtifact, ctx: &mut Context) -> Result<(), CodegenError> {
        ctx.func.signature = entry_signature(self.isa.default_call_conv(), self.isa.pointer_type());
        let mut builder_ctx = FunctionBuilderContext::new();
        let builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        // lower() takes ownership of builder (finalize() consumes it)
        LoweringContext::lower(&artifact.function, builder)
    }

    /// Compile and load `artifact` into executable memory
    pub fn jit(&self, artifact: &CompiledArtifact) -> Result<NativeFunction, CodegenError> {
        self.check_mode(artifact)?;
        let builder =
            JITBuilder::with_isa(self.isa.clone(), cranelift_module::default_libcall_names());
        let mut module = JITModule::new(builder);
        let mut ctx = module.make_context();
        self.build(artifact, &mut ctx)?;

        let id = module
            .declare_function(&artifact.function.name, Linkage::Export, &ctx.func.signature)
            .map_err(|e| CodegenError::BackendError(format!("declare_function failed: {}", e)))?;
        module
            .define_function(id, &mut ctx)
            .map_err(|e| CodegenError::BackendError(format!("define_function failed: {:?}", e)))?;
        module.clear_context(&mut ctx);
        module
            .finalize_definitions()
            .map_err(|e| {
                CodegenError::BackendError(format!("finalize_definitions failed: {}", e))
            })?;

        let code = module.get_finalized_function(id);
        // SAFETY: the function was defined with `entry_signature`, which is
        // the Cranelift form of `EntryFn`.
        let entry = unsafe { std::mem::transmute::<*const u8, EntryFn>(code) };
        tracing::debug!(name = %artifact.function.name, "native function finalized");
        Ok(NativeFunction {
            _module: module,
            entry,
            param_count: artifact.function.param_count as usize,
        })
    }
}

impl CodegenBackend for CraneliftBackend {
    fn name(&self) -> &str {
        "cranelift"
    }

    fn supports_mode(&self, mode: Mode) -> bool {
        mode == Mode::Integer
    }

    fn compile_function(&self, artifact: &CompiledArtifact) -> Result<CompiledCode, CodegenError> {
        self.check_mode(artifact)?;
        let mut codegen_ctx = Context::new();
        self.build(artifact, &mut codegen_ctx)?;

        // Compile to machine code
        let mut ctrl_plane = ControlPlane::default();
        let code = codegen_ctx
            .compile(&*self.isa, &mut ctrl_plane)
            .map_err(|e| {
                CodegenError::BackendError(format!("Cranelift compilation failed: {:?}", e))
            })?;

        Ok(CompiledCode {
            code: code.code_buffer().to_vec(),
            entry_offset: 0,
            relocations: Vec::new(),
        })
    }

    fn target_info(&self) -> TargetInfo {
        let arch = match self.isa.triple().architecture {
            Architecture::X86_64 => TargetArch::X86_64,
            Architecture::Aarch64(_) => TargetArch::AArch64,
            _ => TargetArch::Portable,
        };
        TargetInfo { arch, pointer_size: self.isa.pointer_bytes() as usize }
    }
}

/// A finalized native function and the module owning its code
pub struct NativeFunction {
    _module: JITModule,
    entry: EntryFn,
    param_count: usize,
}

impl NativeFunction {
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Call the function with unboxed integer arguments
    pub fn call(&self, args: &[i64]) -> Result<i64, NativeFailure> {
        if args.len() != self.param_count {
            return Err(NativeFailure::ArgCount { expected: self.param_count, found: args.len() });
        }
        let mut out = 0i64;
        // SAFETY: `args` holds exactly `param_count` values, the only ones
        // the generated code reads, and `out` is a valid write target.
        let status = unsafe { (self.entry)(args.as_ptr(), &mut out) };
        if status == STATUS_OK {
            Ok(out)
        } else {
            Err(NativeFailure::from_status(status, out))
        }
    }
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction").field("param_count", &self.param_count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::Optimizer;
    use crate::pipeline::{compile, CompileOptions};
    use kiln_bytecode::{Assembler, CodeObject, Opcode};

    fn binary(arg: u32) -> CompiledArtifact {
        let mut code = CodeObject::new("binary");
        code.arg_count = 2;
        code.varnames = vec!["a".into(), "b".into()];
        let mut asm = Assembler::new();
        asm.emit(Opcode::LoadFast, 0)
            .emit(Opcode::LoadFast, 1)
            .emit(Opcode::BinaryOp, arg)
            .op(Opcode::ReturnValue);
        let code = asm.finish_into(code).unwrap();
        compile(&code, &CompileOptions::with_mode(Mode::Integer), &Optimizer::new()).unwrap()
    }

    #[test]
    fn test_cranelift_backend_creation() {
        let backend = CraneliftBackend::host().unwrap();
        assert_eq!(backend.name(), "cranelift");
        assert_eq!(backend.target_info().pointer_size, 8);
        assert!(!backend.supports_mode(Mode::Object));
    }

    #[test]
    fn test_cranelift_compile_emits_code() {
        let backend = CraneliftBackend::host().unwrap();
        let compiled = backend.compile_function(&binary(0)).unwrap();
        assert!(!compiled.code.is_empty());
        assert_eq!(compiled.entry_offset, 0);
    }

    #[test]
    fn test_native_floor_division() {
        let backend = CraneliftBackend::host().unwrap();
        let func = backend.jit(&binary(2)).unwrap();
        assert_eq!(func.call(&[7, 2]), Ok(3));
        assert_eq!(func.call(&[-7, 2]), Ok(-4));
        assert_eq!(func.call(&[1, 0]), Err(NativeFailure::ZeroDivision));
        assert_eq!(func.call(&[i64::MIN, -1]), Err(NativeFailure::Overflow));
        assert_eq!(func.call(&[1]), Err(NativeFailure::ArgCount { expected: 2, found: 1 }));
    }

    #[test]
    fn test_object_mode_rejected() {
        let mut code = CodeObject::new("obj");
        code.constants = vec![kiln_bytecode::Constant::None];
        let mut asm = Assembler::new();
        asm.emit(Opcode::ReturnConst, 0);
        let code = asm.finish_into(code).unwrap();
        let artifact = compile(&code, &CompileOptions::default(), &Optimizer::new()).unwrap();
        let err = CraneliftBackend::host().unwrap().compile_function(&artifact).unwrap_err();
        assert!(matches!(err, CodegenError::UnsupportedMode { mode: Mode::Object, .. }));
    }
}
